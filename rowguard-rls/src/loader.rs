//! Declarative policy loading
//!
//! Turns a [`RowGuardConfig`] into registered relationship paths and table
//! policies. Condition mappings in the config are templates: string values
//! starting with `$` name a context value (`$auth.user_id`,
//! `$auth.tenant_id`, `$auth.roles`, `$auth.is_system`, `$metadata.<key>`)
//! and are resolved against the live context on every evaluation. A leading
//! `$$` escapes a literal `$`.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use rowguard_common::config::{PolicyConfig, PolicyKindConfig, RelationshipConfig};
use rowguard_common::{ConditionMap, Error, Result, RowGuardConfig};

use crate::condition::{condition, BoolCondition, EndCondition};
use crate::context::{EvaluationContext, RlsContext};
use crate::policy::{PolicyDefinition, PolicyRegistry};
use crate::query::FilterPredicate;
use crate::relationship::{RelationshipPath, RelationshipStep, TableRelationships};

#[derive(Debug, Clone, PartialEq)]
enum TemplateValue {
    Literal(Value),
    Reference(String),
}

/// Condition mapping whose values may refer to the security context
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionTemplate {
    entries: Vec<(String, TemplateValue)>,
}

impl ConditionTemplate {
    /// Parse a mapping, checking references and literal value shapes
    ///
    /// # Errors
    /// Unknown references are a [`Error::ConfigError`]; literals that cannot
    /// become predicates are rejected as unsupported values.
    pub fn parse(map: &ConditionMap) -> Result<Self> {
        let mut entries = Vec::with_capacity(map.len());
        for (column, value) in map {
            let entry = match value.as_str() {
                Some(s) if s.starts_with("$$") => {
                    TemplateValue::Literal(Value::String(s[1..].to_string()))
                }
                Some(s) if s.starts_with('$') => {
                    let reference = &s[1..];
                    if !RlsContext::is_known_reference(reference) {
                        return Err(Error::ConfigError(format!(
                            "unknown context reference '{s}' for column '{column}'"
                        )));
                    }
                    TemplateValue::Reference(reference.to_string())
                }
                _ => {
                    FilterPredicate::from_entry(column, value)?;
                    TemplateValue::Literal(value.clone())
                }
            };
            entries.push((column.clone(), entry));
        }
        Ok(Self { entries })
    }

    /// The plain mapping, when no value depends on the context
    pub fn to_static(&self) -> Option<ConditionMap> {
        self.entries
            .iter()
            .map(|(column, value)| match value {
                TemplateValue::Literal(v) => Some((column.clone(), v.clone())),
                TemplateValue::Reference(_) => None,
            })
            .collect()
    }

    /// Substitute context values.
    ///
    /// # Errors
    /// A reference the context does not carry is an error rather than a
    /// `NULL` comparison.
    pub fn resolve(&self, context: &RlsContext) -> anyhow::Result<ConditionMap> {
        let mut map = ConditionMap::new();
        for (column, value) in &self.entries {
            let resolved = match value {
                TemplateValue::Literal(v) => v.clone(),
                TemplateValue::Reference(reference) => context.lookup(reference).ok_or_else(|| {
                    anyhow::anyhow!("context has no value for '${reference}' (column '{column}')")
                })?,
            };
            map.insert(column.clone(), resolved);
        }
        Ok(map)
    }

    /// Resolve and test `target` against every predicate
    fn matches(&self, context: &RlsContext, target: Option<&Value>) -> anyhow::Result<bool> {
        let resolved = self.resolve(context)?;
        let predicates = FilterPredicate::from_conditions(&resolved)?;
        let target = target.unwrap_or(&Value::Null);
        Ok(predicates.iter().all(|p| p.matches(target)))
    }
}

/// Register every relationship path and table of `config`.
///
/// Global paths are registered first so every table can reference them.
///
/// # Errors
/// The first configuration error aborts loading.
pub fn load_config(config: &RowGuardConfig, registry: &PolicyRegistry) -> Result<()> {
    let relationships = registry.relationships();

    for path in &config.relationships {
        relationships.register_relationship(relationship_path(path))?;
    }

    let mut policy_count = 0;
    for table in &config.tables {
        if !table.relationships.is_empty() {
            relationships.register_table(
                &table.name,
                TableRelationships {
                    relationships: table.relationships.iter().map(relationship_path).collect(),
                    policies: Vec::new(),
                },
            )?;
        }

        let definitions = table
            .policies
            .iter()
            .map(|policy| policy_definition(&table.name, policy))
            .collect::<Result<Vec<_>>>()?;
        policy_count += definitions.len();
        registry.register_table(&table.name, definitions)?;
        debug!(table = %table.name, "Loaded table policies");
    }

    info!(
        dialect = %config.engine.dialect,
        relationships = config.relationships.len(),
        tables = config.tables.len(),
        policies = policy_count,
        "Loaded policy configuration"
    );
    Ok(())
}

fn relationship_path(config: &RelationshipConfig) -> RelationshipPath {
    config
        .steps
        .iter()
        .fold(RelationshipPath::new(&config.name), |path, step| {
            path.step(RelationshipStep {
                from: step.from.clone(),
                to: step.to.clone(),
                from_column: step.from_column.clone(),
                to_column: step.to_column.clone(),
                alias: step.alias.clone(),
                join_type: step.join_type,
                additional_conditions: step.additional_conditions.clone(),
            })
        })
}

fn policy_definition(table: &str, config: &PolicyConfig) -> Result<PolicyDefinition> {
    let invalid = |reason: &str| {
        Error::InvalidPolicy(format!(
            "{} policy{} on '{table}': {reason}",
            kind_name(config.kind),
            config
                .name
                .as_deref()
                .map(|n| format!(" '{n}'"))
                .unwrap_or_default(),
        ))
    };

    let definition = if let Some(path) = &config.relationship {
        if !config.roles.is_empty() || config.condition.is_some() {
            return Err(invalid("relationship policies take only an end_condition"));
        }
        let end_condition = match &config.end_condition {
            None => EndCondition::default(),
            Some(map) => {
                let template = ConditionTemplate::parse(map)?;
                match template.to_static() {
                    Some(literal) => EndCondition::Static(literal),
                    None => EndCondition::Dynamic(condition(move |ctx: &EvaluationContext| {
                        template.resolve(&ctx.context)
                    })),
                }
            }
        };
        match config.kind {
            PolicyKindConfig::Filter | PolicyKindConfig::Allow => {
                PolicyDefinition::relationship_allow(path, end_condition)
            }
            PolicyKindConfig::Deny => PolicyDefinition::relationship_deny(path, end_condition),
            PolicyKindConfig::Validate => {
                return Err(invalid("payload validation cannot follow a relationship"))
            }
        }
    } else {
        if config.end_condition.is_some() {
            return Err(invalid("end_condition requires a relationship"));
        }
        let template = config
            .condition
            .as_ref()
            .map(ConditionTemplate::parse)
            .transpose()?;

        match config.kind {
            PolicyKindConfig::Filter => {
                if !config.roles.is_empty() {
                    return Err(invalid("filters apply to every caller and take no roles"));
                }
                let Some(template) = template else {
                    return Err(invalid("filter requires a condition"));
                };
                PolicyDefinition::filter(condition(move |ctx: &EvaluationContext| {
                    template.resolve(&ctx.context)
                }))
            }
            PolicyKindConfig::Allow => {
                PolicyDefinition::allow(row_condition(config.roles.clone(), template, false))
            }
            PolicyKindConfig::Deny => {
                PolicyDefinition::deny(row_condition(config.roles.clone(), template, false))
            }
            PolicyKindConfig::Validate => {
                PolicyDefinition::validate(row_condition(config.roles.clone(), template, true))
            }
        }
    };

    let definition = definition
        .operations(config.operation.to_vec())
        .priority(config.priority);
    Ok(match &config.name {
        Some(name) => definition.named(name),
        None => definition,
    })
}

/// Holds when the caller has one of `roles` (if any are listed) and the row,
/// or for validate rules the payload, matches `template` (if given)
fn row_condition(
    roles: Vec<String>,
    template: Option<ConditionTemplate>,
    payload: bool,
) -> BoolCondition {
    condition(move |ctx: &EvaluationContext| {
        if !roles.is_empty() && !ctx.context.has_any_role(roles.as_slice()) {
            return Ok(false);
        }
        match &template {
            None => Ok(true),
            Some(template) => {
                let target = if payload { ctx.data.as_ref() } else { ctx.row.as_ref() };
                template.matches(&ctx.context, target)
            }
        }
    })
}

fn kind_name(kind: PolicyKindConfig) -> &'static str {
    match kind {
        PolicyKindConfig::Filter => "filter",
        PolicyKindConfig::Allow => "allow",
        PolicyKindConfig::Deny => "deny",
        PolicyKindConfig::Validate => "validate",
    }
}

/// Build a fresh registry from `config`
///
/// # Errors
/// See [`load_config`].
pub fn build_registry(config: &RowGuardConfig) -> Result<Arc<PolicyRegistry>> {
    let registry = Arc::new(PolicyRegistry::new(Arc::new(
        crate::relationship::RelationshipRegistry::new(),
    )));
    load_config(config, &registry)?;
    Ok(registry)
}
