//! Policy conditions
//!
//! A condition is a pure function of the [`EvaluationContext`]. Plain
//! closures returning `anyhow::Result<T>` are conditions; asynchronous
//! predicates are wrapped with [`async_condition`] and awaited to completion
//! before their result is used.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use rowguard_common::ConditionMap;

use crate::context::EvaluationContext;

/// A condition producing `T`
#[async_trait]
pub trait Condition<T>: Send + Sync {
    async fn evaluate(&self, ctx: &EvaluationContext) -> anyhow::Result<T>;
}

#[async_trait]
impl<T, F> Condition<T> for F
where
    F: Fn(&EvaluationContext) -> anyhow::Result<T> + Send + Sync,
    T: Send + 'static,
{
    async fn evaluate(&self, ctx: &EvaluationContext) -> anyhow::Result<T> {
        self(ctx)
    }
}

/// Boolean condition of allow, deny and validate rules
pub type BoolCondition = Arc<dyn Condition<bool>>;

/// Column-mapping condition of filter rules
pub type FilterCondition = Arc<dyn Condition<ConditionMap>>;

/// Adapter for asynchronous predicates; see [`async_condition`]
pub struct AsyncCondition<F>(F);

#[async_trait]
impl<T, F, Fut> Condition<T> for AsyncCondition<F>
where
    F: Fn(EvaluationContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<T>> + Send,
    T: Send + 'static,
{
    async fn evaluate(&self, ctx: &EvaluationContext) -> anyhow::Result<T> {
        (self.0)(ctx.clone()).await
    }
}

/// Wrap an async predicate. The closure receives an owned copy of the
/// evaluation context so the returned future can outlive the borrow.
pub fn async_condition<T, F, Fut>(f: F) -> Arc<dyn Condition<T>>
where
    F: Fn(EvaluationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    Arc::new(AsyncCondition(f))
}

/// Wrap a synchronous predicate
pub fn condition<T, F>(f: F) -> Arc<dyn Condition<T>>
where
    F: Fn(&EvaluationContext) -> anyhow::Result<T> + Send + Sync + 'static,
    T: Send + 'static,
{
    Arc::new(f)
}

/// A condition that always yields `value`
pub fn always(value: bool) -> BoolCondition {
    condition(move |_: &EvaluationContext| Ok(value))
}

/// Filter applied to the last table of a relationship path
#[derive(Clone)]
pub enum EndCondition {
    /// Literal mapping
    Static(ConditionMap),
    /// Mapping computed from the context
    Dynamic(FilterCondition),
}

impl EndCondition {
    pub async fn resolve(&self, ctx: &EvaluationContext) -> anyhow::Result<ConditionMap> {
        match self {
            EndCondition::Static(map) => Ok(map.clone()),
            EndCondition::Dynamic(condition) => condition.evaluate(ctx).await,
        }
    }
}

impl Default for EndCondition {
    fn default() -> Self {
        EndCondition::Static(ConditionMap::new())
    }
}

impl fmt::Debug for EndCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndCondition::Static(map) => f.debug_tuple("Static").field(map).finish(),
            EndCondition::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

impl From<ConditionMap> for EndCondition {
    fn from(map: ConditionMap) -> Self {
        EndCondition::Static(map)
    }
}

/// JSON objects become literal mappings and `null` an empty one. Any other
/// value cannot name columns and fails when the condition is resolved.
impl From<Value> for EndCondition {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => EndCondition::Static(map),
            Value::Null => EndCondition::default(),
            other => EndCondition::Dynamic(condition(move |_: &EvaluationContext| {
                anyhow::bail!("end condition must be an object, got {other}")
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RlsContext;
    use rowguard_common::Operation;
    use serde_json::json;

    fn eval_ctx() -> EvaluationContext {
        EvaluationContext::new(
            Arc::new(RlsContext::authenticated("u1", ["member"])),
            "posts",
            Operation::Read,
        )
    }

    #[tokio::test]
    async fn test_closure_condition() {
        let cond: BoolCondition =
            condition(|ctx: &EvaluationContext| Ok(ctx.auth().roles.contains("member")));
        assert!(cond.evaluate(&eval_ctx()).await.unwrap());
    }

    #[tokio::test]
    async fn test_async_condition_is_awaited() {
        let cond: BoolCondition = async_condition(|ctx: EvaluationContext| async move {
            tokio::task::yield_now().await;
            Ok(ctx.auth().user_id.as_deref() == Some("u1"))
        });
        assert!(cond.evaluate(&eval_ctx()).await.unwrap());
    }

    #[tokio::test]
    async fn test_condition_error_propagates() {
        let cond: BoolCondition = condition(|_: &EvaluationContext| anyhow::bail!("backend down"));
        let err = cond.evaluate(&eval_ctx()).await.unwrap_err();
        assert_eq!(err.to_string(), "backend down");
    }

    #[tokio::test]
    async fn test_end_condition_resolution() {
        let map = json!({ "status": "active" }).as_object().unwrap().clone();
        let fixed = EndCondition::from(map.clone());
        assert_eq!(fixed.resolve(&eval_ctx()).await.unwrap(), map);

        let dynamic = EndCondition::Dynamic(condition(|ctx: &EvaluationContext| {
            let mut map = ConditionMap::new();
            map.insert("user_id".into(), json!(ctx.auth().user_id));
            Ok(map)
        }));
        let resolved = dynamic.resolve(&eval_ctx()).await.unwrap();
        assert_eq!(resolved.get("user_id"), Some(&json!("u1")));
    }

    #[tokio::test]
    async fn test_non_object_end_condition_fails() {
        let end = EndCondition::from(json!(["user_id"]));
        assert!(end.resolve(&eval_ctx()).await.is_err());
        assert!(EndCondition::from(Value::Null)
            .resolve(&eval_ctx())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_always() {
        assert!(always(true).evaluate(&eval_ctx()).await.unwrap());
        assert!(!always(false).evaluate(&eval_ctx()).await.unwrap());
    }
}
