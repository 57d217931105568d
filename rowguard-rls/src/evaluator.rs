//! Policy evaluator
//!
//! Applies the registered filter, allow, deny and validate rules of a table
//! to a security context. Relationship rules are left to the
//! [`RelationshipQueryTransformer`](crate::transformer::RelationshipQueryTransformer),
//! which pushes them into SQL.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use rowguard_common::{Error, Operation, Result};

use crate::context::{EvaluationContext, RlsContext};
use crate::policy::{CompiledPolicy, PolicyKind, PolicyRegistry};
use crate::query::FilterPredicate;

/// Outcome of a row check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Allowed,
    /// A deny rule held, or the row failed a filter rule
    Denied { policy: String },
    /// Allow rules exist for the operation and none of them held
    NotAllowed,
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AccessDecision::Allowed)
    }
}

/// Policy evaluator for RLS enforcement
pub struct PolicyEvaluator {
    registry: Arc<PolicyRegistry>,
}

impl PolicyEvaluator {
    /// Create a new policy evaluator
    pub fn new(registry: Arc<PolicyRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    /// Predicates of every filter rule for the operation, in rule order.
    /// They are always applied together; system contexts get none.
    ///
    /// # Errors
    /// A failing condition is returned as [`Error::Evaluation`]; a mapping of
    /// an unsupported shape as a configuration error.
    pub async fn filters(
        &self,
        table: &str,
        operation: Operation,
        context: &Arc<RlsContext>,
    ) -> Result<Vec<FilterPredicate>> {
        if context.bypasses_rls() {
            return Ok(Vec::new());
        }

        let ctx = EvaluationContext::new(context.clone(), table, operation);
        let mut predicates = Vec::new();
        for rule in self.registry.get_rules(table, operation) {
            if let PolicyKind::Filter(condition) = &rule.kind {
                let map = condition
                    .evaluate(&ctx)
                    .await
                    .map_err(|e| Error::evaluation(rule.name.clone(), e))?;
                predicates.extend(FilterPredicate::from_conditions(&map)?);
            }
        }
        Ok(predicates)
    }

    /// Decide whether `row` is accessible.
    ///
    /// Filter rules must match the row. Any deny rule that holds overrides
    /// every allow rule. Without allow rules the row is accessible.
    ///
    /// # Errors
    /// Condition failures are propagated, never treated as allow.
    pub async fn check_row(
        &self,
        table: &str,
        operation: Operation,
        context: &Arc<RlsContext>,
        row: &Value,
    ) -> Result<AccessDecision> {
        if context.bypasses_rls() {
            return Ok(AccessDecision::Allowed);
        }

        let rules = self.registry.get_rules(table, operation);
        let ctx = EvaluationContext::new(context.clone(), table, operation).with_row(row.clone());

        for rule in &rules {
            if let PolicyKind::Filter(condition) = &rule.kind {
                let map = condition
                    .evaluate(&ctx)
                    .await
                    .map_err(|e| Error::evaluation(rule.name.clone(), e))?;
                let predicates = FilterPredicate::from_conditions(&map)?;
                if !predicates.iter().all(|p| p.matches(row)) {
                    return Ok(denied(rule, table, operation));
                }
            }
        }

        for rule in &rules {
            if let PolicyKind::Deny(condition) = &rule.kind {
                if evaluate_bool(rule, condition.as_ref(), &ctx).await? {
                    return Ok(denied(rule, table, operation));
                }
            }
        }

        let mut has_allow = false;
        for rule in &rules {
            if let PolicyKind::Allow(condition) = &rule.kind {
                has_allow = true;
                if evaluate_bool(rule, condition.as_ref(), &ctx).await? {
                    return Ok(AccessDecision::Allowed);
                }
            }
        }

        if has_allow {
            debug!(table = %table, operation = %operation, "No allow rule matched");
            Ok(AccessDecision::NotAllowed)
        } else {
            Ok(AccessDecision::Allowed)
        }
    }

    /// Check every validate rule against a create/update payload
    ///
    /// # Errors
    /// [`Error::ValidationFailed`] names the first rule that did not hold.
    pub async fn validate(
        &self,
        table: &str,
        operation: Operation,
        context: &Arc<RlsContext>,
        data: &Value,
    ) -> Result<()> {
        if context.bypasses_rls() || !operation.has_payload() {
            return Ok(());
        }

        let ctx =
            EvaluationContext::new(context.clone(), table, operation).with_data(data.clone());
        for rule in self.registry.get_rules(table, operation) {
            if let PolicyKind::Validate(condition) = &rule.kind {
                if !evaluate_bool(&rule, condition.as_ref(), &ctx).await? {
                    debug!(table = %table, policy = %rule.name, "Payload failed validation");
                    return Err(Error::ValidationFailed {
                        table: table.to_string(),
                        policy: rule.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// [`check_row`](Self::check_row) as a `Result`
    ///
    /// # Errors
    /// [`Error::PolicyViolation`] when the row is not accessible.
    pub async fn enforce(
        &self,
        table: &str,
        operation: Operation,
        context: &Arc<RlsContext>,
        row: &Value,
    ) -> Result<()> {
        match self.check_row(table, operation, context, row).await? {
            AccessDecision::Allowed => Ok(()),
            AccessDecision::Denied { policy } => Err(Error::PolicyViolation {
                table: table.to_string(),
                policy,
            }),
            AccessDecision::NotAllowed => Err(Error::PolicyViolation {
                table: table.to_string(),
                policy: "no matching allow rule".to_string(),
            }),
        }
    }
}

async fn evaluate_bool(
    rule: &CompiledPolicy,
    condition: &dyn crate::condition::Condition<bool>,
    ctx: &EvaluationContext,
) -> Result<bool> {
    condition
        .evaluate(ctx)
        .await
        .map_err(|e| Error::evaluation(rule.name.clone(), e))
}

fn denied(rule: &CompiledPolicy, table: &str, operation: Operation) -> AccessDecision {
    debug!(
        table = %table,
        operation = %operation,
        policy = %rule.name,
        kind = rule.kind.label(),
        "Row denied"
    );
    AccessDecision::Denied {
        policy: rule.name.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{always, async_condition, condition};
    use crate::policy::{conditions, PolicyDefinition};
    use crate::relationship::RelationshipRegistry;
    use rowguard_common::PolicyOperation;
    use serde_json::json;
    use std::error::Error as _;

    fn evaluator(rules: Vec<PolicyDefinition>) -> PolicyEvaluator {
        let registry = Arc::new(PolicyRegistry::new(Arc::new(RelationshipRegistry::new())));
        registry.register_table("documents", rules).unwrap();
        PolicyEvaluator::new(registry)
    }

    fn member() -> Arc<RlsContext> {
        Arc::new(RlsContext::authenticated("u1", ["member"]).with_tenant("t1"))
    }

    fn owner_rule() -> PolicyDefinition {
        PolicyDefinition::allow(condition(|ctx: &EvaluationContext| {
            let owner = ctx.row.as_ref().and_then(|r| r.get("owner_id"));
            Ok(owner.and_then(Value::as_str) == ctx.auth().user_id.as_deref())
        }))
        .named("owner")
    }

    #[tokio::test]
    async fn test_filters_are_combined() {
        let evaluator = evaluator(vec![
            PolicyDefinition::filter(condition(|ctx: &EvaluationContext| {
                Ok(conditions(json!({ "tenant_id": ctx.auth().tenant_id }))?)
            })),
            PolicyDefinition::filter(condition(|_: &EvaluationContext| {
                Ok(conditions(json!({ "deleted_at": null }))?)
            })),
            PolicyDefinition::allow(always(true)),
        ]);

        let predicates = evaluator
            .filters("documents", Operation::Read, &member())
            .await
            .unwrap();
        assert_eq!(predicates.len(), 2);
        assert_eq!(predicates[0].column(), "tenant_id");
        assert_eq!(predicates[1].column(), "deleted_at");

        let system = Arc::new(RlsContext::system());
        assert!(evaluator
            .filters("documents", Operation::Read, &system)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_default_allow_without_allow_rules() {
        let evaluator = evaluator(vec![PolicyDefinition::deny(always(false))]);
        let decision = evaluator
            .check_row("documents", Operation::Read, &member(), &json!({}))
            .await
            .unwrap();
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn test_allow_rule_must_hold() {
        let evaluator = evaluator(vec![owner_rule()]);

        let mine = json!({ "owner_id": "u1" });
        let theirs = json!({ "owner_id": "u2" });
        assert!(evaluator
            .check_row("documents", Operation::Read, &member(), &mine)
            .await
            .unwrap()
            .is_allowed());
        assert_eq!(
            evaluator
                .check_row("documents", Operation::Read, &member(), &theirs)
                .await
                .unwrap(),
            AccessDecision::NotAllowed
        );
    }

    #[tokio::test]
    async fn test_deny_wins_over_allow() {
        let evaluator = evaluator(vec![
            owner_rule().priority(100),
            PolicyDefinition::deny(condition(|ctx: &EvaluationContext| {
                Ok(ctx.row.as_ref().and_then(|r| r.get("locked")) == Some(&json!(true)))
            }))
            .named("locked"),
        ]);

        let decision = evaluator
            .check_row(
                "documents",
                Operation::Update,
                &member(),
                &json!({ "owner_id": "u1", "locked": true }),
            )
            .await
            .unwrap();
        assert_eq!(
            decision,
            AccessDecision::Denied {
                policy: "locked".to_string()
            }
        );

        let err = evaluator
            .enforce(
                "documents",
                Operation::Update,
                &member(),
                &json!({ "owner_id": "u1", "locked": true }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PolicyViolation { ref policy, .. } if policy == "locked"));
    }

    #[tokio::test]
    async fn test_filter_mismatch_denies_row() {
        let evaluator = evaluator(vec![PolicyDefinition::filter(condition(
            |ctx: &EvaluationContext| Ok(conditions(json!({ "tenant_id": ctx.auth().tenant_id }))?),
        ))
        .named("tenant")]);

        let decision = evaluator
            .check_row(
                "documents",
                Operation::Read,
                &member(),
                &json!({ "tenant_id": "t2" }),
            )
            .await
            .unwrap();
        assert_eq!(
            decision,
            AccessDecision::Denied {
                policy: "tenant".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_validate_payload() {
        let evaluator = evaluator(vec![PolicyDefinition::validate(condition(
            |ctx: &EvaluationContext| {
                let tenant = ctx.data.as_ref().and_then(|d| d.get("tenant_id"));
                Ok(tenant.and_then(Value::as_str) == ctx.auth().tenant_id.as_deref())
            },
        ))
        .named("same_tenant")
        .operation(PolicyOperation::All)]);

        evaluator
            .validate("documents", Operation::Create, &member(), &json!({ "tenant_id": "t1" }))
            .await
            .unwrap();

        let err = evaluator
            .validate("documents", Operation::Update, &member(), &json!({ "tenant_id": "t9" }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ValidationFailed { ref policy, .. } if policy == "same_tenant"));

        // reads carry no payload
        evaluator
            .validate("documents", Operation::Read, &member(), &json!({ "tenant_id": "t9" }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_condition_error_is_not_allow() {
        let evaluator = evaluator(vec![PolicyDefinition::allow(async_condition(
            |_: EvaluationContext| async {
                Err(anyhow::anyhow!("directory unavailable"))
            },
        ))
        .named("directory")]);

        let err = evaluator
            .check_row("documents", Operation::Read, &member(), &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Evaluation { ref policy, .. } if policy == "directory"));
        assert_eq!(
            err.source().map(ToString::to_string),
            Some("directory unavailable".to_string())
        );
    }

    #[tokio::test]
    async fn test_system_context_bypasses() {
        let evaluator = evaluator(vec![PolicyDefinition::deny(always(true))]);
        let system = Arc::new(RlsContext::system());
        assert!(evaluator
            .check_row("documents", Operation::Delete, &system, &json!({}))
            .await
            .unwrap()
            .is_allowed());
    }
}
