//! Row Level and Relationship-Based Access Control Engine
//!
//! Provides declarative, per-table access control for SQL queries:
//! - Task-local security context (`run`, `run_sync`, `current`)
//! - Policy definition, storage and evaluation (filter, allow, deny, validate)
//! - Relationship paths compiled into `EXISTS`/`NOT EXISTS` subqueries
//! - Dialect-aware quoting and placeholders (PostgreSQL, MySQL, SQLite)
//! - Query rewriting for query objects and raw SQL statements

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod condition;
pub mod context;
pub mod dialect;
pub mod evaluator;
pub mod loader;
pub mod policy;
pub mod query;
pub mod relationship;
pub mod rewriter;
pub mod transformer;

pub use condition::{always, async_condition, condition, Condition, EndCondition};
pub use context::{AuthInfo, EvaluationContext, RlsContext};
pub use dialect::{Dialect, SqlDialect};
pub use evaluator::{AccessDecision, PolicyEvaluator};
pub use policy::{PolicyDefinition, PolicyEffect, PolicyKind, PolicyRegistry};
pub use query::{FilterPredicate, FilterableQuery, SelectQuery, SqlFragment};
pub use relationship::{paths, RelationshipPath, RelationshipRegistry, RelationshipStep};
pub use rewriter::{QueryRewriter, SqlStatement};
pub use transformer::RelationshipQueryTransformer;
