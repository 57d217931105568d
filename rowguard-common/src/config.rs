//! Declarative configuration for the rowguard engine
//!
//! A policy file is a TOML document describing the engine settings, global
//! relationship paths and per-table policies:
//!
//! ```toml
//! [engine]
//! dialect = "postgres"
//!
//! [[relationships]]
//! name = "product_employee"
//! steps = [
//!     { from = "products", to = "shops", from_column = "shop_id" },
//!     { from = "shops", to = "organizations" },
//!     { from = "organizations", to = "employees", from_column = "id", to_column = "organization_id" },
//! ]
//!
//! [[tables]]
//! name = "products"
//!
//! [[tables.policies]]
//! type = "allow"
//! operation = "read"
//! relationship = "product_employee"
//! end_condition = { user_id = "$auth.user_id", status = "active" }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{ConditionMap, JoinType, PolicyOperation};

/// Top-level policy file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RowGuardConfig {
    /// Engine settings
    pub engine: EngineConfig,
    /// Globally registered relationship paths
    pub relationships: Vec<RelationshipConfig>,
    /// Protected tables
    pub tables: Vec<TableConfig>,
}

impl RowGuardConfig {
    /// Parse a TOML policy document
    ///
    /// # Errors
    /// Returns an error if the document is not valid TOML for this schema.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load a TOML policy file from disk
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQL dialect used for quoting and placeholders (postgres, mysql, sqlite)
    pub dialect: String,
    /// Fail queries against protected tables when no context is established,
    /// instead of treating the policies as inactive
    pub require_context: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dialect: "postgres".to_string(),
            require_context: false,
        }
    }
}

/// Named relationship path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipConfig {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

/// One join hop of a relationship path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    pub from: String,
    pub to: String,
    /// Defaults to `{to}_id`
    #[serde(default)]
    pub from_column: Option<String>,
    /// Defaults to `id`
    #[serde(default)]
    pub to_column: Option<String>,
    /// Defaults to `to`
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub join_type: JoinType,
    #[serde(default)]
    pub additional_conditions: ConditionMap,
}

/// Policies and relationship paths of one table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    pub name: String,
    /// Paths visible only to this table's policies
    #[serde(default)]
    pub relationships: Vec<RelationshipConfig>,
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
}

/// Declarative rule kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKindConfig {
    Filter,
    Allow,
    Deny,
    Validate,
}

/// A single operation or a list of them
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OperationList {
    One(PolicyOperation),
    Many(Vec<PolicyOperation>),
}

impl OperationList {
    pub fn to_vec(&self) -> Vec<PolicyOperation> {
        match self {
            OperationList::One(op) => vec![*op],
            OperationList::Many(ops) => ops.clone(),
        }
    }
}

impl Default for OperationList {
    fn default() -> Self {
        OperationList::One(PolicyOperation::All)
    }
}

/// Declarative policy
///
/// String values of the form `$auth.user_id`, `$auth.tenant_id`,
/// `$auth.roles` and `$metadata.<key>` are resolved against the security
/// context at evaluation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: PolicyKindConfig,
    #[serde(default)]
    pub operation: OperationList,
    #[serde(default)]
    pub priority: i32,
    /// Filter: the column mapping to apply. Allow/deny: columns the row must
    /// match. Validate: columns the payload must match.
    #[serde(default)]
    pub condition: Option<ConditionMap>,
    /// Caller must hold at least one of these roles for the condition to hold
    #[serde(default)]
    pub roles: Vec<String>,
    /// Relationship path this policy checks
    #[serde(default)]
    pub relationship: Option<String>,
    /// Filter applied to the last table of the relationship path
    #[serde(default)]
    pub end_condition: Option<ConditionMap>,
}
