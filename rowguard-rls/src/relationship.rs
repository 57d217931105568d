//! Relationship paths and the relationship registry
//!
//! A relationship path is a named chain of join hops from a protected table
//! to some other table, e.g. `products → shops → organizations → employees`.
//! Paths are registered globally or under a single table (table scope shadows
//! a global path of the same name) and compiled once, with every default
//! filled in, into a [`CompiledRelationshipPath`].

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info};

use rowguard_common::{ConditionMap, Error, JoinType, Operation, Result};

use crate::condition::EndCondition;
use crate::policy::{OperationSet, PolicyDefinition, PolicyEffect, PolicyKind};
use crate::query::FilterPredicate;

// ============================================================================
// Path definitions
// ============================================================================

/// One join hop
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipStep {
    pub from: String,
    pub to: String,
    /// Column on `from`; defaults to `{to}_id`
    pub from_column: Option<String>,
    /// Column on `to`; defaults to `id`
    pub to_column: Option<String>,
    /// Alias of `to` inside the subquery; defaults to `to`
    pub alias: Option<String>,
    pub join_type: JoinType,
    /// Extra `AND` predicates on this hop
    pub additional_conditions: ConditionMap,
}

impl RelationshipStep {
    pub fn new(from: &str, to: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            from_column: None,
            to_column: None,
            alias: None,
            join_type: JoinType::Inner,
            additional_conditions: ConditionMap::new(),
        }
    }

    pub fn from_column(mut self, column: &str) -> Self {
        self.from_column = Some(column.to_string());
        self
    }

    pub fn to_column(mut self, column: &str) -> Self {
        self.to_column = Some(column.to_string());
        self
    }

    pub fn alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }

    pub fn join_type(mut self, join_type: JoinType) -> Self {
        self.join_type = join_type;
        self
    }

    pub fn condition(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.additional_conditions
            .insert(column.to_string(), value.into());
        self
    }
}

/// Named chain of join hops
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipPath {
    pub name: String,
    pub steps: Vec<RelationshipStep>,
}

impl RelationshipPath {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: RelationshipStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Fill in every default and check the chain is connected.
    ///
    /// # Errors
    /// Fails on an empty path, a hop whose `from` does not continue the
    /// previous hop, or additional conditions of an unsupported shape.
    pub fn compile(&self) -> Result<CompiledRelationshipPath> {
        let Some(first) = self.steps.first() else {
            return Err(Error::EmptyRelationshipPath(self.name.clone()));
        };

        let mut steps: Vec<CompiledStep> = Vec::with_capacity(self.steps.len());
        for (index, step) in self.steps.iter().enumerate() {
            if let Some(prev) = steps.last() {
                if step.from != prev.to && step.from != prev.alias {
                    return Err(Error::BrokenRelationshipChain {
                        path: self.name.clone(),
                        step: index,
                        expected: prev.alias.clone(),
                        found: step.from.clone(),
                    });
                }
            }

            steps.push(CompiledStep {
                from: step.from.clone(),
                to: step.to.clone(),
                from_column: step
                    .from_column
                    .clone()
                    .unwrap_or_else(|| format!("{}_id", step.to)),
                to_column: step.to_column.clone().unwrap_or_else(|| "id".to_string()),
                alias: step.alias.clone().unwrap_or_else(|| step.to.clone()),
                join_type: step.join_type,
                additional_conditions: FilterPredicate::from_conditions(
                    &step.additional_conditions,
                )?,
            });
        }

        let target_table = steps
            .last()
            .map(|s| s.alias.clone())
            .unwrap_or_default();

        Ok(CompiledRelationshipPath {
            name: self.name.clone(),
            source_table: first.from.clone(),
            target_table,
            steps,
        })
    }
}

/// A hop with every default resolved
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledStep {
    pub from: String,
    pub to: String,
    pub from_column: String,
    pub to_column: String,
    pub alias: String,
    pub join_type: JoinType,
    pub additional_conditions: Vec<FilterPredicate>,
}

/// Canonical form of a relationship path
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRelationshipPath {
    pub name: String,
    pub steps: Vec<CompiledStep>,
    /// `from` of the first hop
    pub source_table: String,
    /// Alias of the last hop
    pub target_table: String,
}

// ============================================================================
// Compiled ReBAC policies
// ============================================================================

/// A relationship policy bound to its resolved path
#[derive(Debug, Clone)]
pub struct CompiledRebacPolicy {
    pub name: String,
    pub table: String,
    pub operations: OperationSet,
    pub priority: i32,
    pub(crate) sequence: u64,
    pub path: Arc<CompiledRelationshipPath>,
    pub end_condition: EndCondition,
    pub effect: PolicyEffect,
}

/// Relationship paths and ReBAC policies of one table
#[derive(Debug, Clone, Default)]
pub struct TableRelationships {
    pub relationships: Vec<RelationshipPath>,
    pub policies: Vec<PolicyDefinition>,
}

#[derive(Default)]
struct TableEntry {
    declared: bool,
    paths: HashMap<String, Arc<CompiledRelationshipPath>>,
    policies: Vec<Arc<CompiledRebacPolicy>>,
}

// ============================================================================
// Registry
// ============================================================================

/// Registry of relationship paths and the ReBAC policies using them
pub struct RelationshipRegistry {
    global: RwLock<HashMap<String, Arc<CompiledRelationshipPath>>>,
    tables: RwLock<HashMap<String, TableEntry>>,
    resolved: DashMap<(String, Operation), Arc<[Arc<CompiledRebacPolicy>]>>,
    sequence: AtomicU64,
}

impl RelationshipRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            global: RwLock::new(HashMap::new()),
            tables: RwLock::new(HashMap::new()),
            resolved: DashMap::new(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Register a path visible to every table
    ///
    /// # Errors
    /// Fails if the path does not compile or the name is taken.
    pub fn register_relationship(
        &self,
        path: RelationshipPath,
    ) -> Result<Arc<CompiledRelationshipPath>> {
        let compiled = Arc::new(path.compile()?);
        let mut global = self.global.write();
        if global.contains_key(&compiled.name) {
            return Err(Error::DuplicateRelationship(compiled.name.clone()));
        }
        global.insert(compiled.name.clone(), compiled.clone());
        drop(global);

        debug!(
            path = %compiled.name,
            steps = compiled.steps.len(),
            target = %compiled.target_table,
            "Registered relationship path"
        );
        Ok(compiled)
    }

    /// Register a table's own paths and ReBAC policies
    ///
    /// # Errors
    /// Fails on a second registration of the same table, a path that does
    /// not compile, a policy naming an unknown path, or a non-relationship
    /// policy.
    pub fn register_table(&self, table: &str, config: TableRelationships) -> Result<()> {
        let mut paths = HashMap::new();
        for path in &config.relationships {
            let compiled = Arc::new(path.compile()?);
            if paths.insert(compiled.name.clone(), compiled).is_some() {
                return Err(Error::DuplicateRelationship(path.name.clone()));
            }
        }

        let mut compiled = Vec::with_capacity(config.policies.len());
        for (index, definition) in config.policies.iter().enumerate() {
            let name = definition
                .name
                .clone()
                .unwrap_or_else(|| format!("{table}_rebac_{index}"));
            compiled.push(self.compile_with(table, &name, definition, &paths)?);
        }
        let policy_count = compiled.len();

        {
            let mut tables = self.tables.write();
            if tables.get(table).is_some_and(|entry| entry.declared) {
                return Err(Error::DuplicateTable(table.to_string()));
            }
            let entry = tables.entry(table.to_string()).or_default();
            check_policy_names(table, entry, &compiled)?;
            entry.declared = true;
            entry.paths = paths;
            entry.policies.extend(compiled.into_iter().map(Arc::new));
        }
        self.resolved.retain(|(t, _), _| t != table);

        info!(
            table = %table,
            relationships = config.relationships.len(),
            policies = policy_count,
            "Registered table relationships"
        );
        Ok(())
    }

    /// Look up a path: table scope first, then global
    pub fn get_relationship(
        &self,
        name: &str,
        table: Option<&str>,
    ) -> Option<Arc<CompiledRelationshipPath>> {
        if let Some(table) = table {
            if let Some(path) = self
                .tables
                .read()
                .get(table)
                .and_then(|entry| entry.paths.get(name))
            {
                return Some(path.clone());
            }
        }
        self.global.read().get(name).cloned()
    }

    /// ReBAC policies for `table` that cover `operation`, highest priority
    /// first, registration order among equals
    pub fn get_policies(&self, table: &str, operation: Operation) -> Vec<Arc<CompiledRebacPolicy>> {
        let key = (table.to_string(), operation);
        if let Some(cached) = self.resolved.get(&key) {
            return cached.to_vec();
        }

        let mut policies: Vec<Arc<CompiledRebacPolicy>> = self
            .tables
            .read()
            .get(table)
            .map(|entry| {
                entry
                    .policies
                    .iter()
                    .filter(|p| p.operations.contains(operation))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        policies.sort_by_key(|p| (Reverse(p.priority), p.sequence));

        self.resolved.insert(key, policies.clone().into());
        policies
    }

    /// Whether `table` carries any ReBAC policy
    pub fn has_policies(&self, table: &str) -> bool {
        self.tables
            .read()
            .get(table)
            .is_some_and(|entry| !entry.policies.is_empty())
    }

    /// Remove every path and policy
    pub fn clear(&self) {
        self.global.write().clear();
        self.tables.write().clear();
        self.resolved.clear();
        debug!("Cleared relationship registry");
    }

    pub(crate) fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Resolve a relationship policy definition against the paths visible
    /// to `table`
    pub(crate) fn compile_policy(
        &self,
        table: &str,
        name: &str,
        definition: &PolicyDefinition,
    ) -> Result<CompiledRebacPolicy> {
        self.compile_with(table, name, definition, &HashMap::new())
    }

    /// `pending` holds table paths that are not committed yet
    fn compile_with(
        &self,
        table: &str,
        name: &str,
        definition: &PolicyDefinition,
        pending: &HashMap<String, Arc<CompiledRelationshipPath>>,
    ) -> Result<CompiledRebacPolicy> {
        let PolicyKind::Relationship(rule) = &definition.kind else {
            return Err(Error::InvalidPolicy(format!(
                "policy '{name}' on '{table}' is not a relationship policy"
            )));
        };

        let path = pending
            .get(&rule.path)
            .cloned()
            .or_else(|| self.get_relationship(&rule.path, Some(table)))
            .ok_or_else(|| Error::UnknownRelationshipPath {
                table: table.to_string(),
                path: rule.path.clone(),
            })?;

        if let EndCondition::Static(map) = &rule.end_condition {
            FilterPredicate::from_conditions(map)?;
        }

        Ok(CompiledRebacPolicy {
            name: name.to_string(),
            table: table.to_string(),
            operations: OperationSet::from_selectors(&definition.operations, false)?,
            priority: definition.priority,
            sequence: self.next_sequence(),
            path,
            end_condition: rule.end_condition.clone(),
            effect: rule.effect,
        })
    }

    /// Add compiled policies to `table`, all or none
    pub(crate) fn attach_policies(
        &self,
        table: &str,
        policies: Vec<CompiledRebacPolicy>,
    ) -> Result<()> {
        if policies.is_empty() {
            return Ok(());
        }

        let mut tables = self.tables.write();
        let entry = tables.entry(table.to_string()).or_default();
        check_policy_names(table, entry, &policies)?;
        entry.policies.extend(policies.into_iter().map(Arc::new));
        drop(tables);

        self.resolved.retain(|(t, _), _| t != table);
        Ok(())
    }
}

fn check_policy_names(
    table: &str,
    entry: &TableEntry,
    policies: &[CompiledRebacPolicy],
) -> Result<()> {
    for (index, policy) in policies.iter().enumerate() {
        let taken = entry.policies.iter().any(|p| p.name == policy.name)
            || policies[..index].iter().any(|p| p.name == policy.name);
        if taken {
            return Err(Error::DuplicatePolicy {
                table: table.to_string(),
                policy: policy.name.clone(),
            });
        }
    }
    Ok(())
}

impl Default for RelationshipRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Predefined paths
// ============================================================================

/// Builders for common relationship shapes
pub mod paths {
    use super::{RelationshipPath, RelationshipStep};

    /// `resource → organizations → organization_members`
    pub fn organization_membership(
        resource_table: &str,
        organization_column: &str,
    ) -> RelationshipPath {
        RelationshipPath::new("organization_membership")
            .step(
                RelationshipStep::new(resource_table, "organizations")
                    .from_column(organization_column),
            )
            .step(
                RelationshipStep::new("organizations", "organization_members")
                    .from_column("id")
                    .to_column("organization_id"),
            )
    }

    /// `resource → shops → organizations → organization_members`
    pub fn shop_organization_membership(
        resource_table: &str,
        shop_column: &str,
    ) -> RelationshipPath {
        RelationshipPath::new("shop_organization_membership")
            .step(RelationshipStep::new(resource_table, "shops").from_column(shop_column))
            .step(RelationshipStep::new("shops", "organizations"))
            .step(
                RelationshipStep::new("organizations", "organization_members")
                    .from_column("id")
                    .to_column("organization_id"),
            )
    }

    /// `resource → teams → parent team → team_members`
    pub fn team_hierarchy(resource_table: &str, team_column: &str) -> RelationshipPath {
        RelationshipPath::new("team_hierarchy")
            .step(RelationshipStep::new(resource_table, "teams").from_column(team_column))
            .step(
                RelationshipStep::new("teams", "teams")
                    .from_column("parent_team_id")
                    .alias("parent_teams"),
            )
            .step(
                RelationshipStep::new("parent_teams", "team_members")
                    .from_column("id")
                    .to_column("team_id"),
            )
    }
}
