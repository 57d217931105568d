//! Relationship query transformer
//!
//! Turns ReBAC policies into correlated `EXISTS`/`NOT EXISTS` subqueries and
//! ANDs them onto the caller's query. For a path
//! `products → shops → organizations → employees` and the end condition
//! `{ user_id: "123", status: "active" }` the generated fragment is:
//!
//! ```sql
//! EXISTS (SELECT 1 FROM "shops"
//!   JOIN "organizations" ON "shops"."organization_id" = "organizations"."id"
//!   JOIN "employees" ON "organizations"."id" = "employees"."organization_id"
//!   WHERE "shops"."id" = "products"."shop_id"
//!     AND "employees"."user_id" = $1 AND "employees"."status" = $2)
//! ```

use std::sync::Arc;

use tracing::{debug, warn};

use rowguard_common::{Error, Operation, Result};

use crate::context::{self, EvaluationContext, RlsContext};
use crate::dialect::{Dialect, SqlWriter};
use crate::query::{FilterPredicate, FilterableQuery, SqlFragment};
use crate::relationship::{CompiledRebacPolicy, CompiledStep, RelationshipRegistry};

/// Applies relationship policies to queries
pub struct RelationshipQueryTransformer {
    registry: Arc<RelationshipRegistry>,
    dialect: Dialect,
    require_context: bool,
}

impl RelationshipQueryTransformer {
    pub fn new(registry: Arc<RelationshipRegistry>, dialect: Dialect) -> Self {
        Self {
            registry,
            dialect,
            require_context: false,
        }
    }

    /// Build for a dialect given by name
    ///
    /// # Errors
    /// [`Error::UnsupportedDialect`] for names other than postgres, mysql
    /// and sqlite (and their aliases).
    pub fn from_dialect_name(registry: Arc<RelationshipRegistry>, dialect: &str) -> Result<Self> {
        Ok(Self::new(registry, dialect.parse()?))
    }

    /// Fail instead of passing queries through when no context is set
    pub fn require_context(mut self, require: bool) -> Self {
        self.require_context = require;
        self
    }

    pub fn requires_context(&self) -> bool {
        self.require_context
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn registry(&self) -> &Arc<RelationshipRegistry> {
        &self.registry
    }

    /// Apply the table's relationship policies for `operation` using the
    /// ambient context.
    ///
    /// The query comes back untouched when no context is established, the
    /// context is a system context, or no policy applies.
    ///
    /// # Errors
    /// Condition failures, unsupported end-condition values, or a query that
    /// rejects the fragment. Without a context, [`Error::MissingContext`]
    /// when the transformer requires one.
    pub async fn transform<Q: FilterableQuery>(
        &self,
        query: Q,
        table: &str,
        operation: Operation,
    ) -> Result<Q> {
        self.transform_with(query, table, operation, context::current())
            .await
    }

    /// [`transform`](Self::transform) with an explicit context
    ///
    /// # Errors
    /// Same as [`transform`](Self::transform).
    pub async fn transform_with<Q: FilterableQuery>(
        &self,
        mut query: Q,
        table: &str,
        operation: Operation,
        context: Option<Arc<RlsContext>>,
    ) -> Result<Q> {
        let Some(context) = context else {
            if self.registry.has_policies(table) {
                if self.require_context {
                    return Err(Error::MissingContext(table.to_string()));
                }
                warn!(
                    table = %table,
                    operation = %operation,
                    "No security context established; relationship policies are inactive"
                );
            }
            return Ok(query);
        };

        if context.bypasses_rls() {
            debug!(table = %table, "System context bypasses relationship policies");
            return Ok(query);
        }

        let policies = self.registry.get_policies(table, operation);
        if policies.is_empty() {
            return Ok(query);
        }

        let ctx = EvaluationContext::new(context, table, operation);
        let main_alias = query.main_alias();
        for policy in &policies {
            let fragment = self
                .generate_exists_sql_at(
                    policy,
                    &ctx,
                    table,
                    main_alias.as_deref(),
                    query.param_count(),
                )
                .await?;
            query.and_where(fragment)?;
        }

        debug!(
            table = %table,
            operation = %operation,
            policies = policies.len(),
            "Applied relationship policies"
        );
        Ok(query)
    }

    /// Render one policy as an `EXISTS`/`NOT EXISTS` fragment numbered from
    /// the first placeholder
    ///
    /// # Errors
    /// See [`generate_exists_sql_at`](Self::generate_exists_sql_at).
    pub async fn generate_exists_sql(
        &self,
        policy: &CompiledRebacPolicy,
        ctx: &EvaluationContext,
        main_table: &str,
        main_alias: Option<&str>,
    ) -> Result<SqlFragment> {
        self.generate_exists_sql_at(policy, ctx, main_table, main_alias, 0)
            .await
    }

    /// Render one policy, numbering placeholders after `param_offset`
    /// existing parameters.
    ///
    /// The subquery is anchored to `main_alias` when given, else to
    /// `main_table`.
    ///
    /// # Errors
    /// A failing dynamic end condition is an [`Error::Evaluation`]; an
    /// end-condition value that cannot be bound is a configuration error.
    pub async fn generate_exists_sql_at(
        &self,
        policy: &CompiledRebacPolicy,
        ctx: &EvaluationContext,
        main_table: &str,
        main_alias: Option<&str>,
        param_offset: usize,
    ) -> Result<SqlFragment> {
        let path = &policy.path;
        let Some(first) = path.steps.first() else {
            return Err(Error::EmptyRelationshipPath(path.name.clone()));
        };

        let end_condition = policy
            .end_condition
            .resolve(ctx)
            .await
            .map_err(|e| Error::evaluation(policy.name.clone(), e))?;
        let end_predicates = FilterPredicate::from_conditions(&end_condition)?;

        let mut w = SqlWriter::new(self.dialect, param_offset);
        w.push(policy.effect.exists_keyword()).push(" (SELECT 1 FROM ");
        write_source(&mut w, first);

        for hop in path.steps.windows(2) {
            let (prev, step) = (&hop[0], &hop[1]);
            w.push(" ").push(step.join_type.keyword()).push(" ");
            write_source(&mut w, step);
            w.push(" ON ")
                .push_column(Some(&prev.alias), &step.from_column)
                .push(" = ")
                .push_column(Some(&step.alias), &step.to_column);
            for predicate in &step.additional_conditions {
                w.push(" AND ");
                predicate.write(&mut w, Some(&step.alias));
            }
        }

        w.push(" WHERE ")
            .push_column(Some(&first.alias), &first.to_column)
            .push(" = ");
        match main_alias {
            Some(alias) => w.push_ident(alias),
            None => w.push_table(main_table),
        };
        w.push(".").push_ident(&first.from_column);

        for predicate in &first.additional_conditions {
            w.push(" AND ");
            predicate.write(&mut w, Some(&first.alias));
        }
        for predicate in &end_predicates {
            w.push(" AND ");
            predicate.write(&mut w, Some(&path.target_table));
        }
        w.push(")");

        let (sql, params) = w.finish();
        Ok(SqlFragment::new(sql, params))
    }
}

/// `table` or `table AS alias`
fn write_source(w: &mut SqlWriter, step: &CompiledStep) {
    w.push_table(&step.to);
    if step.alias != step.to {
        w.push(" AS ").push_ident(&step.alias);
    }
}
