//! Error types for the rowguard access-control engine

use thiserror::Error;

/// Rowguard error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration Errors
    #[error("Relationship path '{0}' has no steps")]
    EmptyRelationshipPath(String),

    #[error("Table '{table}' references unknown relationship path '{path}'")]
    UnknownRelationshipPath { table: String, path: String },

    #[error("Relationship path '{path}' is broken at step {step}: expected '{expected}', found '{found}'")]
    BrokenRelationshipChain {
        path: String,
        step: usize,
        expected: String,
        found: String,
    },

    #[error("Relationship path '{0}' is already registered")]
    DuplicateRelationship(String),

    #[error("Table '{0}' is already registered")]
    DuplicateTable(String),

    #[error("Policy '{policy}' already exists on table '{table}'")]
    DuplicatePolicy { table: String, policy: String },

    #[error("Unsupported value for column '{column}': {reason}")]
    UnsupportedConditionValue { column: String, reason: String },

    #[error("Unsupported SQL dialect: {0}")]
    UnsupportedDialect(String),

    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Evaluation Errors
    #[error("Condition of policy '{policy}' failed: {source}")]
    Evaluation {
        policy: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("No security context established for protected table '{0}'")]
    MissingContext(String),

    // Access Outcomes
    #[error("Access to '{table}' denied by policy '{policy}'")]
    PolicyViolation { table: String, policy: String },

    #[error("Payload for '{table}' rejected by policy '{policy}'")]
    ValidationFailed { table: String, policy: String },

    // Query Boundary Errors
    #[error("Query error: {0}")]
    QueryError(String),

    #[error("SQL parse error: {0}")]
    SqlParse(String),

    // General Errors
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),
}

/// Result type alias for rowguard operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap a failing condition without discarding its cause
    pub fn evaluation(policy: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Evaluation {
            policy: policy.into(),
            source,
        }
    }

    /// Whether this error belongs to registration/startup rather than a
    /// single query
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::EmptyRelationshipPath(_)
                | Self::UnknownRelationshipPath { .. }
                | Self::BrokenRelationshipChain { .. }
                | Self::DuplicateRelationship(_)
                | Self::DuplicateTable(_)
                | Self::DuplicatePolicy { .. }
                | Self::UnsupportedConditionValue { .. }
                | Self::UnsupportedDialect(_)
                | Self::InvalidPolicy(_)
                | Self::ConfigError(_)
                | Self::TomlError(_)
        )
    }

    /// Stable error code for logs and API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::EmptyRelationshipPath(_) => "empty_relationship_path",
            Self::UnknownRelationshipPath { .. } => "unknown_relationship_path",
            Self::BrokenRelationshipChain { .. } => "broken_relationship_chain",
            Self::DuplicateRelationship(_) => "duplicate_relationship",
            Self::DuplicateTable(_) => "duplicate_table",
            Self::DuplicatePolicy { .. } => "duplicate_policy",
            Self::UnsupportedConditionValue { .. } => "unsupported_condition_value",
            Self::UnsupportedDialect(_) => "unsupported_dialect",
            Self::InvalidPolicy(_) => "invalid_policy",
            Self::ConfigError(_) => "config_error",
            Self::Evaluation { .. } => "evaluation_error",
            Self::MissingContext(_) => "missing_context",
            Self::PolicyViolation { .. } => "policy_violation",
            Self::ValidationFailed { .. } => "validation_failed",
            Self::QueryError(_) => "query_error",
            Self::SqlParse(_) => "sql_parse_error",
            Self::IoError(_) => "io_error",
            Self::JsonError(_) => "json_error",
            Self::TomlError(_) => "toml_error",
        }
    }
}
