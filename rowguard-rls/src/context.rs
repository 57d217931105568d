//! Request-scoped security context
//!
//! The ambient [`RlsContext`] lives in a tokio task-local, so it follows the
//! logical operation across `.await` points and is never visible to other
//! tasks multiplexed on the same runtime threads. Scopes nest: the innermost
//! context wins and the previous one is restored when a scope exits, whether
//! it returned normally, with an error, or by unwinding.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

use rowguard_common::Operation;

tokio::task_local! {
    static CURRENT_CONTEXT: Arc<RlsContext>;
}

/// Caller identity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthInfo {
    /// Authenticated user ID
    pub user_id: Option<String>,
    /// Tenant the caller acts in
    pub tenant_id: Option<String>,
    /// Flat role set
    pub roles: BTreeSet<String>,
    /// Trusted internal identity that skips relationship checks
    pub is_system: bool,
}

/// Security context of one logical operation (request, job, transaction step)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RlsContext {
    pub auth: AuthInfo,
    /// Free-form metadata (request ID, IP, feature flags, ...)
    pub metadata: HashMap<String, Value>,
}

impl RlsContext {
    /// Create an anonymous context
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Create an authenticated context
    pub fn authenticated<I, S>(user_id: &str, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            auth: AuthInfo {
                user_id: Some(user_id.to_string()),
                roles: roles.into_iter().map(Into::into).collect(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a system context (bypasses relationship checks).
    ///
    /// Only trusted internal code paths should ever construct one.
    pub fn system() -> Self {
        Self {
            auth: AuthInfo {
                is_system: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Set the tenant
    pub fn with_tenant(mut self, tenant_id: &str) -> Self {
        self.auth.tenant_id = Some(tenant_id.to_string());
        self
    }

    /// Add a role
    pub fn with_role(mut self, role: &str) -> Self {
        self.auth.roles.insert(role.to_string());
        self
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.auth.roles.contains(role)
    }

    pub fn has_any_role<S: AsRef<str>>(&self, roles: &[S]) -> bool {
        roles.iter().any(|r| self.has_role(r.as_ref()))
    }

    /// Check if the caller should bypass row policies
    pub fn bypasses_rls(&self) -> bool {
        self.auth.is_system
    }

    /// Resolve a context reference such as `auth.user_id` or
    /// `metadata.region`. Returns `None` when the value is not set.
    pub fn lookup(&self, reference: &str) -> Option<Value> {
        match reference {
            "auth.user_id" => self.auth.user_id.clone().map(Value::String),
            "auth.tenant_id" => self.auth.tenant_id.clone().map(Value::String),
            "auth.roles" => Some(Value::Array(
                self.auth.roles.iter().cloned().map(Value::String).collect(),
            )),
            "auth.is_system" => Some(Value::Bool(self.auth.is_system)),
            other => other
                .strip_prefix("metadata.")
                .and_then(|key| self.metadata.get(key))
                .cloned(),
        }
    }

    /// Whether `reference` names something [`lookup`](Self::lookup) understands
    pub fn is_known_reference(reference: &str) -> bool {
        matches!(
            reference,
            "auth.user_id" | "auth.tenant_id" | "auth.roles" | "auth.is_system"
        ) || reference
            .strip_prefix("metadata.")
            .is_some_and(|key| !key.is_empty())
    }
}

/// What a condition sees: the ambient context plus the table, operation and
/// the row or payload under evaluation.
#[derive(Debug, Clone)]
pub struct EvaluationContext {
    pub context: Arc<RlsContext>,
    pub table: String,
    pub operation: Operation,
    /// Existing row (allow/deny rules)
    pub row: Option<Value>,
    /// Create/update payload (validate rules)
    pub data: Option<Value>,
}

impl EvaluationContext {
    pub fn new(context: Arc<RlsContext>, table: &str, operation: Operation) -> Self {
        Self {
            context,
            table: table.to_string(),
            operation,
            row: None,
            data: None,
        }
    }

    pub fn with_row(mut self, row: Value) -> Self {
        self.row = Some(row);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn auth(&self) -> &AuthInfo {
        &self.context.auth
    }

    pub fn metadata(&self, key: &str) -> Option<&Value> {
        self.context.metadata.get(key)
    }
}

// ============================================================================
// Scoped execution
// ============================================================================

/// Run `fut` with `context` as the ambient security context.
pub async fn run<F>(context: impl Into<Arc<RlsContext>>, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_CONTEXT.scope(context.into(), fut).await
}

/// Synchronous variant of [`run`].
pub fn run_sync<R>(context: impl Into<Arc<RlsContext>>, f: impl FnOnce() -> R) -> R {
    CURRENT_CONTEXT.sync_scope(context.into(), f)
}

/// The ambient context, or `None` outside any scope.
///
/// `None` means policies are inactive for the caller. Code touching protected
/// tables must establish a context first.
pub fn current() -> Option<Arc<RlsContext>> {
    CURRENT_CONTEXT.try_with(Arc::clone).ok()
}

/// Spawn `fut` onto the runtime carrying the ambient context along.
///
/// Task-locals are not inherited by `tokio::spawn`, so background work that
/// queries protected tables must be spawned through here.
pub fn spawn_with_context<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match current() {
        Some(context) => tokio::spawn(CURRENT_CONTEXT.scope(context, fut)),
        None => tokio::spawn(fut),
    }
}
