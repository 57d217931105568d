//! Declarative Row-Level Access Control for SQL Queries
//!
//! This crate wires the rowguard components into a single engine:
//!
//! # Features
//!
//! - **Per-table policies** - filter, allow, deny and validate rules with
//!   priorities and operation selectors
//! - **Relationship-based access** - named join paths compiled into
//!   correlated `EXISTS`/`NOT EXISTS` subqueries
//! - **Ambient security context** - task-local, nestable, restored on exit
//! - **Dialect-aware SQL** - PostgreSQL, MySQL and SQLite quoting and
//!   placeholders
//! - **Declarative configuration** - TOML policy files with context
//!   references

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub use rowguard_common as common;
pub use rowguard_rls as rls;

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use rowguard_common::{Error, Operation, Result, RowGuardConfig, SqlValue};
use rowguard_rls::context::{self, RlsContext};
use rowguard_rls::{
    loader, AccessDecision, Dialect, FilterableQuery, PolicyDefinition, PolicyEvaluator,
    PolicyRegistry, QueryRewriter, RelationshipPath, RelationshipQueryTransformer,
    RelationshipRegistry, SelectQuery, SqlFragment,
};
use rowguard_rls::relationship::TableRelationships;

/// Access-control engine
pub struct RowGuard {
    config: RowGuardConfig,
    registry: Arc<PolicyRegistry>,
    evaluator: Arc<PolicyEvaluator>,
    transformer: Arc<RelationshipQueryTransformer>,
    rewriter: QueryRewriter,
}

impl RowGuard {
    /// Create an engine with empty registries
    pub fn new(dialect: Dialect) -> Self {
        let config = RowGuardConfig {
            engine: rowguard_common::config::EngineConfig {
                dialect: dialect.to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        Self::assemble(config, dialect)
    }

    /// Create an engine and load every policy of `config`
    ///
    /// # Errors
    /// Returns an error for an unknown dialect or any invalid policy.
    pub fn from_config(config: RowGuardConfig) -> Result<Self> {
        let dialect: Dialect = config.engine.dialect.parse()?;
        let engine = Self::assemble(config, dialect);
        loader::load_config(&engine.config, &engine.registry)?;

        info!(
            dialect = %dialect,
            tables = engine.registry.tables().len(),
            require_context = engine.config.engine.require_context,
            "Initialized rowguard engine"
        );
        Ok(engine)
    }

    fn assemble(config: RowGuardConfig, dialect: Dialect) -> Self {
        let relationships = Arc::new(RelationshipRegistry::new());
        let registry = Arc::new(PolicyRegistry::new(relationships.clone()));
        let evaluator = Arc::new(PolicyEvaluator::new(registry.clone()));
        let transformer = Arc::new(
            RelationshipQueryTransformer::new(relationships, dialect)
                .require_context(config.engine.require_context),
        );
        let rewriter = QueryRewriter::new(evaluator.clone(), transformer.clone());

        Self {
            config,
            registry,
            evaluator,
            transformer,
            rewriter,
        }
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &RowGuardConfig {
        &self.config
    }

    #[must_use]
    pub fn dialect(&self) -> Dialect {
        self.transformer.dialect()
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn relationships(&self) -> &Arc<RelationshipRegistry> {
        self.registry.relationships()
    }

    #[must_use]
    pub fn evaluator(&self) -> &Arc<PolicyEvaluator> {
        &self.evaluator
    }

    #[must_use]
    pub fn transformer(&self) -> &Arc<RelationshipQueryTransformer> {
        &self.transformer
    }

    /// Register a relationship path visible to every table
    ///
    /// # Errors
    /// Returns an error if the path is empty, broken, or already registered.
    pub fn register_relationship(&self, path: RelationshipPath) -> Result<()> {
        self.relationships().register_relationship(path).map(|_| ())
    }

    /// Register a table's own relationship paths, visible only to its policies
    ///
    /// # Errors
    /// Returns an error if a path does not compile or the table already
    /// declared its paths.
    pub fn register_table_relationships(
        &self,
        table: &str,
        paths: Vec<RelationshipPath>,
    ) -> Result<()> {
        self.relationships().register_table(
            table,
            TableRelationships {
                relationships: paths,
                policies: Vec::new(),
            },
        )
    }

    /// Register the policies of a table
    ///
    /// # Errors
    /// See [`PolicyRegistry::register_table`].
    pub fn register_table(&self, table: &str, rules: Vec<PolicyDefinition>) -> Result<()> {
        self.registry.register_table(table, rules)
    }

    /// Start a query on `table` in the engine's dialect
    #[must_use]
    pub fn select(&self, table: &str) -> SelectQuery {
        SelectQuery::new(self.dialect(), table)
    }

    /// Apply every filter and relationship policy of `table` to `query`
    ///
    /// # Errors
    /// See [`QueryRewriter::rewrite`].
    pub async fn rewrite<Q: FilterableQuery>(
        &self,
        query: Q,
        table: &str,
        operation: Operation,
    ) -> Result<Q> {
        self.rewriter.rewrite(query, table, operation).await
    }

    /// Rewrite raw SQL; the operation and table come from the statement
    ///
    /// # Errors
    /// See [`QueryRewriter::rewrite_sql`].
    pub async fn rewrite_sql(&self, sql: &str, params: Vec<SqlValue>) -> Result<SqlFragment> {
        self.rewriter.rewrite_sql(sql, params).await
    }

    /// Check a loaded row against the allow, deny and filter rules
    ///
    /// # Errors
    /// [`Error::PolicyViolation`] when the row is not accessible, or an
    /// evaluation error.
    pub async fn authorize_row(&self, table: &str, operation: Operation, row: &Value) -> Result<()> {
        let Some(context) = context::current() else {
            return self.without_context(table, operation);
        };
        self.evaluator.enforce(table, operation, &context, row).await
    }

    /// Decision for a loaded row, without turning a denial into an error
    ///
    /// # Errors
    /// Evaluation errors only.
    pub async fn check_row(
        &self,
        table: &str,
        operation: Operation,
        row: &Value,
    ) -> Result<AccessDecision> {
        let Some(context) = context::current() else {
            self.without_context(table, operation)?;
            return Ok(AccessDecision::Allowed);
        };
        self.evaluator.check_row(table, operation, &context, row).await
    }

    /// Check a create/update payload against the validate rules
    ///
    /// # Errors
    /// [`Error::ValidationFailed`] naming the first failing rule.
    pub async fn validate_payload(
        &self,
        table: &str,
        operation: Operation,
        data: &Value,
    ) -> Result<()> {
        let Some(context) = context::current() else {
            return self.without_context(table, operation);
        };
        self.evaluator.validate(table, operation, &context, data).await
    }

    /// Run `fut` with `context` as the ambient security context
    pub async fn run_as<F>(&self, context: RlsContext, fut: F) -> F::Output
    where
        F: std::future::Future,
    {
        context::run(context, fut).await
    }

    fn without_context(&self, table: &str, operation: Operation) -> Result<()> {
        if !self.registry.is_protected(table) {
            return Ok(());
        }
        if self.config.engine.require_context {
            return Err(Error::MissingContext(table.to_string()));
        }
        warn!(
            table = %table,
            operation = %operation,
            "No security context established; policies are inactive"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowguard_rls::always;
    use serde_json::json;

    #[test]
    fn test_unknown_dialect_rejected() {
        let mut config = RowGuardConfig::default();
        config.engine.dialect = "oracle".to_string();
        assert!(matches!(
            RowGuard::from_config(config),
            Err(Error::UnsupportedDialect(_))
        ));
    }

    #[test]
    fn test_select_uses_engine_dialect() {
        let engine = RowGuard::new(Dialect::MySql);
        let sql = engine.select("posts").where_eq("id", 1_i64).to_sql();
        assert_eq!(sql.sql, "SELECT * FROM `posts` WHERE `posts`.`id` = ?");
    }

    #[tokio::test]
    async fn test_require_context() {
        let mut config = RowGuardConfig::default();
        config.engine.require_context = true;
        let engine = RowGuard::from_config(config).unwrap();
        engine
            .register_table("posts", vec![PolicyDefinition::deny(always(true))])
            .unwrap();

        let err = engine
            .authorize_row("posts", Operation::Read, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingContext(_)));

        engine
            .authorize_row("tags", Operation::Read, &json!({}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_context_is_inactive_by_default() {
        let engine = RowGuard::new(Dialect::Postgres);
        engine
            .register_table("posts", vec![PolicyDefinition::deny(always(true))])
            .unwrap();

        engine
            .authorize_row("posts", Operation::Read, &json!({}))
            .await
            .unwrap();

        let denied = engine
            .run_as(RlsContext::authenticated("u1", ["member"]), async {
                engine.authorize_row("posts", Operation::Read, &json!({})).await
            })
            .await;
        assert!(matches!(denied, Err(Error::PolicyViolation { .. })));
    }
}
