//! Policy definitions and storage

use std::cmp::Reverse;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info};

use rowguard_common::{Error, Operation, PolicyOperation, Result};

use crate::condition::{BoolCondition, EndCondition, FilterCondition};
use crate::relationship::RelationshipRegistry;

/// Whether a relationship policy requires the path to exist or to be absent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyEffect {
    /// `EXISTS (...)`
    Allow,
    /// `NOT EXISTS (...)`
    Deny,
}

impl PolicyEffect {
    pub fn exists_keyword(self) -> &'static str {
        match self {
            PolicyEffect::Allow => "EXISTS",
            PolicyEffect::Deny => "NOT EXISTS",
        }
    }
}

/// Relationship check of a ReBAC policy
#[derive(Debug, Clone)]
pub struct RelationshipRule {
    /// Name of a registered relationship path
    pub path: String,
    /// Filter on the last table of the path
    pub end_condition: EndCondition,
    pub effect: PolicyEffect,
}

/// Rule kinds. Each variant carries only the condition it evaluates.
#[derive(Clone)]
pub enum PolicyKind {
    /// Column mapping ANDed onto every matching query
    Filter(FilterCondition),
    /// Row is accessible when any allow rule holds
    Allow(BoolCondition),
    /// Row is inaccessible when any deny rule holds; overrides allow
    Deny(BoolCondition),
    /// Create/update payload must satisfy every validate rule
    Validate(BoolCondition),
    /// Relationship-based check compiled to `EXISTS`/`NOT EXISTS`
    Relationship(RelationshipRule),
}

impl PolicyKind {
    pub fn label(&self) -> &'static str {
        match self {
            PolicyKind::Filter(_) => "filter",
            PolicyKind::Allow(_) => "allow",
            PolicyKind::Deny(_) => "deny",
            PolicyKind::Validate(_) => "validate",
            PolicyKind::Relationship(_) => "relationship",
        }
    }
}

impl fmt::Debug for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyKind::Relationship(rule) => f.debug_tuple("Relationship").field(rule).finish(),
            other => write!(f, "{}(..)", other.label()),
        }
    }
}

/// Policy definition as supplied by the application
#[derive(Debug, Clone)]
pub struct PolicyDefinition {
    /// Unique within the table; derived from table, kind and position if unset
    pub name: Option<String>,
    pub kind: PolicyKind,
    pub operations: Vec<PolicyOperation>,
    /// Higher runs first
    pub priority: i32,
}

impl PolicyDefinition {
    pub fn new(kind: PolicyKind) -> Self {
        Self {
            name: None,
            kind,
            operations: vec![PolicyOperation::All],
            priority: 0,
        }
    }

    pub fn filter(condition: FilterCondition) -> Self {
        Self::new(PolicyKind::Filter(condition))
    }

    pub fn allow(condition: BoolCondition) -> Self {
        Self::new(PolicyKind::Allow(condition))
    }

    pub fn deny(condition: BoolCondition) -> Self {
        Self::new(PolicyKind::Deny(condition))
    }

    pub fn validate(condition: BoolCondition) -> Self {
        Self::new(PolicyKind::Validate(condition))
    }

    /// Allow when the relationship path reaches a row matching `end_condition`
    pub fn relationship_allow(path: &str, end_condition: impl Into<EndCondition>) -> Self {
        Self::new(PolicyKind::Relationship(RelationshipRule {
            path: path.to_string(),
            end_condition: end_condition.into(),
            effect: PolicyEffect::Allow,
        }))
    }

    /// Deny when the relationship path reaches a row matching `end_condition`
    pub fn relationship_deny(path: &str, end_condition: impl Into<EndCondition>) -> Self {
        Self::new(PolicyKind::Relationship(RelationshipRule {
            path: path.to_string(),
            end_condition: end_condition.into(),
            effect: PolicyEffect::Deny,
        }))
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Apply to a single operation selector
    pub fn operation(mut self, operation: PolicyOperation) -> Self {
        self.operations = vec![operation];
        self
    }

    pub fn operations<I>(mut self, operations: I) -> Self
    where
        I: IntoIterator<Item = PolicyOperation>,
    {
        self.operations = operations.into_iter().collect();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Concrete set of operations; never contains `all`
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationSet(u8);

impl OperationSet {
    fn bit(operation: Operation) -> u8 {
        match operation {
            Operation::Create => 0b0001,
            Operation::Read => 0b0010,
            Operation::Update => 0b0100,
            Operation::Delete => 0b1000,
        }
    }

    /// Expand selectors; `all` on payload-only rules covers create/update.
    ///
    /// # Errors
    /// An empty selector list is a configuration error.
    pub fn from_selectors(selectors: &[PolicyOperation], payload_only: bool) -> Result<Self> {
        if selectors.is_empty() {
            return Err(Error::InvalidPolicy(
                "policy must apply to at least one operation".to_string(),
            ));
        }
        let mut set = OperationSet::default();
        for selector in selectors {
            for op in selector.expand(payload_only) {
                set.0 |= Self::bit(*op);
            }
        }
        Ok(set)
    }

    pub fn contains(self, operation: Operation) -> bool {
        self.0 & Self::bit(operation) != 0
    }

    pub fn iter(self) -> impl Iterator<Item = Operation> {
        Operation::ALL.into_iter().filter(move |op| self.contains(*op))
    }
}

impl fmt::Debug for OperationSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Registry form of a policy: named, operations expanded, ordered
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    pub name: String,
    pub table: String,
    pub kind: PolicyKind,
    pub operations: OperationSet,
    pub priority: i32,
    pub(crate) sequence: u64,
}

/// Policy store for per-table rules
pub struct PolicyRegistry {
    /// Rules by table, in registration order
    policies: RwLock<HashMap<String, Vec<Arc<CompiledPolicy>>>>,
    /// Ordered rules per (table, operation), rebuilt after every mutation
    resolved: DashMap<(String, Operation), Arc<[Arc<CompiledPolicy>]>>,
    relationships: Arc<RelationshipRegistry>,
}

impl PolicyRegistry {
    /// Create a policy registry validating against `relationships`
    pub fn new(relationships: Arc<RelationshipRegistry>) -> Self {
        Self {
            policies: RwLock::new(HashMap::new()),
            resolved: DashMap::new(),
            relationships,
        }
    }

    pub fn relationships(&self) -> &Arc<RelationshipRegistry> {
        &self.relationships
    }

    /// Register every rule of a table.
    ///
    /// Relationship rules must reference a path known to the table or to the
    /// global registry; they are handed to the relationship registry so the
    /// query transformer sees them.
    ///
    /// # Errors
    /// Fails on a second registration of the table, duplicate rule names,
    /// unknown relationship paths or invalid operation lists. Nothing is
    /// registered when any rule fails.
    pub fn register_table(&self, table: &str, rules: Vec<PolicyDefinition>) -> Result<()> {
        if self.policies.read().contains_key(table) {
            return Err(Error::DuplicateTable(table.to_string()));
        }

        let mut compiled = Vec::with_capacity(rules.len());
        let mut rebac = Vec::new();
        for (index, definition) in rules.iter().enumerate() {
            let name = definition
                .name
                .clone()
                .unwrap_or_else(|| format!("{table}_{}_{index}", definition.kind.label()));

            if compiled.iter().any(|p: &CompiledPolicy| p.name == name) {
                return Err(Error::DuplicatePolicy {
                    table: table.to_string(),
                    policy: name,
                });
            }

            let payload_only = matches!(definition.kind, PolicyKind::Validate(_));
            let operations = OperationSet::from_selectors(&definition.operations, payload_only)?;

            if matches!(definition.kind, PolicyKind::Relationship(_)) {
                rebac.push(self.relationships.compile_policy(table, &name, definition)?);
            }

            compiled.push(CompiledPolicy {
                name,
                table: table.to_string(),
                kind: definition.kind.clone(),
                operations,
                priority: definition.priority,
                sequence: self.relationships.next_sequence(),
            });
        }

        let count = compiled.len();
        {
            // Held across the attach: relationship rules only land for a
            // table committed here.
            let mut policies = self.policies.write();
            if policies.contains_key(table) {
                return Err(Error::DuplicateTable(table.to_string()));
            }
            self.relationships.attach_policies(table, rebac)?;
            policies.insert(
                table.to_string(),
                compiled.into_iter().map(Arc::new).collect(),
            );
        }
        self.resolved.retain(|(t, _), _| t != table);

        info!(table = %table, policies = count, "Registered table policies");
        Ok(())
    }

    /// Rules of `table` covering `operation`, highest priority first,
    /// registration order among equals. Empty for unregistered tables.
    pub fn get_rules(&self, table: &str, operation: Operation) -> Vec<Arc<CompiledPolicy>> {
        let key = (table.to_string(), operation);
        if let Some(cached) = self.resolved.get(&key) {
            return cached.to_vec();
        }

        let mut rules: Vec<Arc<CompiledPolicy>> = self
            .policies
            .read()
            .get(table)
            .map(|rules| {
                rules
                    .iter()
                    .filter(|p| p.operations.contains(operation))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rules.sort_by_key(|p| (Reverse(p.priority), p.sequence));

        debug!(table = %table, operation = %operation, rules = rules.len(), "Resolved rules");
        self.resolved.insert(key, rules.clone().into());
        rules
    }

    /// Whether any rule is registered for `table`
    pub fn is_protected(&self, table: &str) -> bool {
        self.policies.read().contains_key(table) || self.relationships.has_policies(table)
    }

    /// Registered table names
    pub fn tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self.policies.read().keys().cloned().collect();
        tables.sort();
        tables
    }

    /// Remove every table and global registration
    pub fn clear(&self) {
        self.policies.write().clear();
        self.resolved.clear();
        self.relationships.clear();
        debug!("Cleared policy registry");
    }
}

impl fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyRegistry")
            .field("tables", &self.tables())
            .finish_non_exhaustive()
    }
}

/// Build a column mapping from a JSON object, mostly for tests and static
/// filters
///
/// # Errors
/// Anything but an object is rejected; an empty map would filter nothing.
pub fn conditions(value: Value) -> Result<rowguard_common::ConditionMap> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(Error::UnsupportedConditionValue {
            column: "*".to_string(),
            reason: format!("conditions must be a JSON object, got {other}"),
        }),
    }
}
