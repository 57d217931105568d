//! SQL query rewriter for RLS enforcement
//!
//! [`SqlStatement`] adapts raw SQL text to the [`FilterableQuery`] boundary by
//! parsing it with `sqlparser` and splicing fragments into the `WHERE` clause
//! of the AST. [`QueryRewriter`] applies filter rules and relationship
//! policies to any [`FilterableQuery`] in one pass.

use std::borrow::Cow;
use std::ops::ControlFlow;
use std::sync::Arc;

use sqlparser::ast::{
    visit_expressions, visit_expressions_mut, visit_relations, BinaryOperator, Expr, ObjectName,
    SetExpr, Statement, TableFactor, TableWithJoins, Value as AstValue,
};
use sqlparser::dialect as sql_dialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use tracing::{debug, warn};

use rowguard_common::{Error, Operation, Result, SqlValue};

use crate::context::{self, RlsContext};
use crate::dialect::Dialect;
use crate::evaluator::PolicyEvaluator;
use crate::query::{render_predicates, FilterableQuery, SqlFragment};
use crate::transformer::RelationshipQueryTransformer;

/// A single parsed SQL statement with its bound parameters
///
/// For `?` dialects every placeholder is held as `?n`, `n` being the
/// 1-based index of its parameter, so parameters stay bound to their
/// placeholder when the parser reorders clauses (MySQL `LIMIT ?, ?`).
/// [`to_fragment`](Self::to_fragment) renders them back to `?`.
#[derive(Debug, Clone)]
pub struct SqlStatement {
    dialect: Dialect,
    statement: Statement,
    params: Vec<SqlValue>,
}

impl SqlStatement {
    /// Parse one statement and bind its parameters
    ///
    /// # Errors
    /// [`Error::SqlParse`] when the text is not exactly one statement of the
    /// dialect; [`Error::QueryError`] when the parameter count does not match
    /// the placeholders.
    pub fn parse(dialect: Dialect, sql: &str, params: Vec<SqlValue>) -> Result<Self> {
        let parser = parser_dialect(dialect);
        let text = if numbered(dialect) {
            Cow::Borrowed(sql)
        } else {
            Cow::Owned(number_positional(parser.as_ref(), sql)?)
        };
        let mut statements = Parser::parse_sql(parser.as_ref(), &text)
            .map_err(|e| Error::SqlParse(e.to_string()))?;
        if statements.len() != 1 {
            return Err(Error::SqlParse(format!(
                "expected exactly one statement, found {}",
                statements.len()
            )));
        }
        let statement = statements.remove(0);

        let expected = placeholder_count(&statement, dialect);
        if expected != params.len() {
            return Err(Error::QueryError(format!(
                "statement has {expected} parameter(s) but {} were bound",
                params.len()
            )));
        }

        Ok(Self {
            dialect,
            statement,
            params,
        })
    }

    /// Operation the statement performs
    ///
    /// # Errors
    /// Statements other than SELECT, INSERT, UPDATE and DELETE are rejected.
    pub fn operation(&self) -> Result<Operation> {
        match &self.statement {
            Statement::Query(_) => Ok(Operation::Read),
            Statement::Insert { .. } => Ok(Operation::Create),
            Statement::Update { .. } => Ok(Operation::Update),
            Statement::Delete { .. } => Ok(Operation::Delete),
            other => Err(Error::QueryError(format!("unsupported statement: {other}"))),
        }
    }

    /// Unquoted name of the main table, e.g. `public.products`
    pub fn table(&self) -> Option<String> {
        match &self.statement {
            Statement::Insert { table_name, .. } => Some(object_name(table_name)),
            _ => self
                .main_relation()
                .and_then(|relation| match &relation.relation {
                    TableFactor::Table { name, .. } => Some(object_name(name)),
                    _ => None,
                }),
        }
    }

    pub fn params(&self) -> &[SqlValue] {
        &self.params
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Every table the statement reads or writes, in visit order: joins,
    /// CTE bodies and subqueries included
    pub fn relations(&self) -> Vec<String> {
        let mut found = Vec::new();
        let _ = visit_relations(&self.statement, |name| {
            found.push(object_name(name));
            ControlFlow::<()>::Continue(())
        });
        found
    }

    /// Render back to SQL text with the bound parameters
    pub fn to_fragment(&self) -> SqlFragment {
        if numbered(self.dialect) {
            return SqlFragment::new(self.statement.to_string(), self.params.clone());
        }

        let mut statement = self.statement.clone();
        let mut params = Vec::with_capacity(self.params.len());
        let _ = visit_expressions_mut(&mut statement, |e| {
            if let Expr::Value(AstValue::Placeholder(p)) = e {
                let bound = p
                    .strip_prefix('?')
                    .and_then(|n| n.parse::<usize>().ok())
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|index| self.params.get(index));
                params.extend(bound.cloned());
                *p = "?".to_string();
            }
            ControlFlow::<()>::Continue(())
        });
        SqlFragment::new(statement.to_string(), params)
    }

    fn main_relation(&self) -> Option<&TableWithJoins> {
        match &self.statement {
            Statement::Query(query) => match query.body.as_ref() {
                SetExpr::Select(select) => select.from.first(),
                _ => None,
            },
            Statement::Update { table, .. } => Some(table),
            Statement::Delete { from, .. } => from.first(),
            _ => None,
        }
    }

    fn selection_mut(&mut self) -> Result<&mut Option<Expr>> {
        match &mut self.statement {
            Statement::Query(query) => match query.body.as_mut() {
                SetExpr::Select(select) => Ok(&mut select.selection),
                _ => Err(Error::QueryError(
                    "only plain SELECT bodies can be filtered".to_string(),
                )),
            },
            Statement::Update { selection, .. } | Statement::Delete { selection, .. } => {
                Ok(selection)
            }
            Statement::Insert { .. } => Err(Error::QueryError(
                "INSERT has no WHERE clause; validate the payload instead".to_string(),
            )),
            _ => Err(Error::QueryError(
                "statement cannot be filtered".to_string(),
            )),
        }
    }

    fn parse_fragment(&self, fragment: &SqlFragment) -> Result<Expr> {
        let dialect = parser_dialect(self.dialect);
        let mut expr = Parser::new(dialect.as_ref())
            .try_with_sql(&fragment.sql)
            .and_then(|mut parser| parser.parse_expr())
            .map_err(|e| Error::SqlParse(e.to_string()))?;

        let found = placeholders(&expr).len();
        if found != fragment.params.len() {
            return Err(Error::QueryError(format!(
                "fragment has {found} placeholder(s) but {} parameter(s)",
                fragment.params.len()
            )));
        }

        if !numbered(self.dialect) {
            let mut next = self.params.len();
            let _ = visit_expressions_mut(&mut expr, |e| {
                if let Expr::Value(AstValue::Placeholder(p)) = e {
                    next += 1;
                    *p = format!("?{next}");
                }
                ControlFlow::<()>::Continue(())
            });
        }
        Ok(expr)
    }
}

impl FilterableQuery for SqlStatement {
    fn main_alias(&self) -> Option<String> {
        self.main_relation()
            .and_then(|relation| match &relation.relation {
                TableFactor::Table {
                    alias: Some(alias), ..
                } => Some(alias.name.value.clone()),
                _ => None,
            })
    }

    fn param_count(&self) -> usize {
        self.params.len()
    }

    fn and_where(&mut self, fragment: SqlFragment) -> Result<()> {
        let expr = self.parse_fragment(&fragment)?;

        let selection = self.selection_mut()?;
        *selection = Some(match selection.take() {
            None => expr,
            Some(existing) => Expr::BinaryOp {
                left: Box::new(if binds_looser_than_and(&existing) {
                    Expr::Nested(Box::new(existing))
                } else {
                    existing
                }),
                op: BinaryOperator::And,
                right: Box::new(Expr::Nested(Box::new(expr))),
            },
        });

        self.params.extend(fragment.params);
        Ok(())
    }
}

fn parser_dialect(dialect: Dialect) -> Box<dyn sql_dialect::Dialect> {
    match dialect {
        Dialect::Postgres => Box::new(sql_dialect::PostgreSqlDialect {}),
        Dialect::MySql => Box::new(sql_dialect::MySqlDialect {}),
        Dialect::Sqlite => Box::new(sql_dialect::SQLiteDialect {}),
    }
}

/// Rewrite each `?` of `sql` to `?n`, `n` counting placeholders in text
/// order. Only placeholder tokens are touched, never `?` inside literals or
/// comments.
fn number_positional(dialect: &dyn sql_dialect::Dialect, sql: &str) -> Result<String> {
    let tokens = Tokenizer::new(dialect, sql)
        .tokenize_with_location()
        .map_err(|e| Error::SqlParse(e.to_string()))?;

    let mut marks = Vec::new();
    for token in &tokens {
        if let Token::Placeholder(p) = &token.token {
            if p != "?" {
                return Err(Error::QueryError(format!(
                    "unsupported placeholder '{p}'; bind parameters with '?'"
                )));
            }
            marks.push((token.location.line, token.location.column));
        }
    }
    if marks.is_empty() {
        return Ok(sql.to_string());
    }

    let mut numbered = String::with_capacity(sql.len() + marks.len() * 2);
    let mut pending = marks.into_iter().peekable();
    let mut index = 0;
    let (mut line, mut column) = (1, 1);
    for ch in sql.chars() {
        numbered.push(ch);
        if pending.peek() == Some(&(line, column)) {
            pending.next();
            index += 1;
            numbered.push_str(&index.to_string());
        }
        if ch == '\n' {
            line += 1;
            column = 1;
        } else {
            column += 1;
        }
    }
    if pending.peek().is_some() {
        return Err(Error::QueryError(
            "could not locate every placeholder".to_string(),
        ));
    }
    Ok(numbered)
}

fn binds_looser_than_and(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::BinaryOp {
            op: BinaryOperator::Or | BinaryOperator::Xor,
            ..
        }
    )
}

/// Whether placeholders carry their own index (`$n`)
fn numbered(dialect: Dialect) -> bool {
    matches!(dialect, Dialect::Postgres)
}

fn placeholders<V: sqlparser::ast::Visit>(node: &V) -> Vec<String> {
    let mut found = Vec::new();
    let _ = visit_expressions(node, |expr| {
        if let Expr::Value(AstValue::Placeholder(p)) = expr {
            found.push(p.clone());
        }
        ControlFlow::<()>::Continue(())
    });
    found
}

/// Parameters a statement expects: the highest `$n` for numbered dialects,
/// the number of placeholders otherwise
fn placeholder_count(statement: &Statement, dialect: Dialect) -> usize {
    let found = placeholders(statement);
    if numbered(dialect) {
        found
            .iter()
            .filter_map(|p| p.strip_prefix('$').and_then(|n| n.parse::<usize>().ok()))
            .max()
            .unwrap_or(0)
    } else {
        found.len()
    }
}

fn object_name(name: &ObjectName) -> String {
    name.0
        .iter()
        .map(|ident| ident.value.as_str())
        .collect::<Vec<_>>()
        .join(".")
}

/// Query rewriter that applies filter rules and relationship policies
pub struct QueryRewriter {
    evaluator: Arc<PolicyEvaluator>,
    transformer: Arc<RelationshipQueryTransformer>,
}

impl QueryRewriter {
    /// Create a new query rewriter
    pub fn new(
        evaluator: Arc<PolicyEvaluator>,
        transformer: Arc<RelationshipQueryTransformer>,
    ) -> Self {
        Self {
            evaluator,
            transformer,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.transformer.dialect()
    }

    /// Rewrite `query` for `table` under the ambient context
    ///
    /// # Errors
    /// Evaluation and configuration errors from the rules, or a query that
    /// rejects the predicates.
    pub async fn rewrite<Q: FilterableQuery>(
        &self,
        query: Q,
        table: &str,
        operation: Operation,
    ) -> Result<Q> {
        self.rewrite_with(query, table, operation, context::current())
            .await
    }

    /// [`rewrite`](Self::rewrite) with an explicit context
    ///
    /// # Errors
    /// Same as [`rewrite`](Self::rewrite).
    pub async fn rewrite_with<Q: FilterableQuery>(
        &self,
        mut query: Q,
        table: &str,
        operation: Operation,
        context: Option<Arc<RlsContext>>,
    ) -> Result<Q> {
        let Some(context) = context else {
            if self.evaluator.registry().is_protected(table) {
                if self.transformer.requires_context() {
                    return Err(Error::MissingContext(table.to_string()));
                }
                warn!(
                    table = %table,
                    operation = %operation,
                    "No security context established; policies are inactive"
                );
            }
            return Ok(query);
        };

        let predicates = self.evaluator.filters(table, operation, &context).await?;
        let qualifier = query
            .main_alias()
            .unwrap_or_else(|| unqualified(table).to_string());
        if let Some(fragment) = render_predicates(
            &predicates,
            self.dialect(),
            Some(&qualifier),
            query.param_count(),
        ) {
            query.and_where(fragment)?;
        }

        let query = self
            .transformer
            .transform_with(query, table, operation, Some(context))
            .await?;

        debug!(
            table = %table,
            operation = %operation,
            filters = predicates.len(),
            "Rewrote query"
        );
        Ok(query)
    }

    /// Parse, rewrite and render raw SQL. The governed table is the
    /// statement's main table, matched first by its full name and then
    /// without its schema.
    ///
    /// # Errors
    /// Parse errors, statements without a main table, a protected table
    /// referenced anywhere but the main relation (joins, CTEs, subqueries),
    /// and every error of [`rewrite`](Self::rewrite).
    pub async fn rewrite_sql(&self, sql: &str, params: Vec<SqlValue>) -> Result<SqlFragment> {
        let statement = SqlStatement::parse(self.dialect(), sql, params)?;
        let operation = statement.operation()?;
        let full = statement
            .table()
            .ok_or_else(|| Error::QueryError("statement has no main table".to_string()))?;
        let table = self.governed_name(&full);

        let enforced = match context::current() {
            Some(context) => !context.bypasses_rls(),
            None => self.transformer.requires_context(),
        };
        if enforced {
            self.check_relations(&statement, table)?;
        }

        if operation == Operation::Create {
            // Nothing to filter; payload checks go through validate.
            return Ok(statement.to_fragment());
        }

        let statement = self.rewrite(statement, table, operation).await?;
        Ok(statement.to_fragment())
    }

    fn governed_name<'a>(&self, name: &'a str) -> &'a str {
        if self.evaluator.registry().is_protected(name) {
            name
        } else {
            unqualified(name)
        }
    }

    /// Only the main relation receives predicates; any other reference to a
    /// protected table is refused.
    fn check_relations(&self, statement: &SqlStatement, main: &str) -> Result<()> {
        let registry = self.evaluator.registry();
        let mut main_seen = false;
        for relation in statement.relations() {
            let name = self.governed_name(&relation);
            if !registry.is_protected(name) {
                continue;
            }
            if name == main && !main_seen {
                main_seen = true;
                continue;
            }
            return Err(Error::QueryError(format!(
                "protected table '{name}' is referenced outside the main relation"
            )));
        }
        Ok(())
    }
}

fn unqualified(table: &str) -> &str {
    table.rsplit('.').next().unwrap_or(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{always, condition, EndCondition};
    use crate::context::EvaluationContext;
    use crate::policy::{conditions, PolicyDefinition, PolicyRegistry};
    use crate::relationship::{RelationshipPath, RelationshipRegistry, RelationshipStep};
    use serde_json::json;

    fn rewriter(dialect: Dialect) -> QueryRewriter {
        let relationships = Arc::new(RelationshipRegistry::new());
        relationships
            .register_relationship(
                RelationshipPath::new("shop_staff")
                    .step(RelationshipStep::new("products", "shops").from_column("shop_id"))
                    .step(
                        RelationshipStep::new("shops", "staff")
                            .from_column("id")
                            .to_column("shop_id"),
                    ),
            )
            .unwrap();

        let registry = Arc::new(PolicyRegistry::new(relationships.clone()));
        registry
            .register_table(
                "products",
                vec![
                    PolicyDefinition::filter(condition(|ctx: &EvaluationContext| {
                        Ok(conditions(json!({ "tenant_id": ctx.auth().tenant_id }))?)
                    })),
                    PolicyDefinition::relationship_allow(
                        "shop_staff",
                        EndCondition::Dynamic(condition(|ctx: &EvaluationContext| {
                            Ok(conditions(json!({ "user_id": ctx.auth().user_id }))?)
                        })),
                    ),
                ],
            )
            .unwrap();
        registry
            .register_table("audit_log", vec![PolicyDefinition::allow(always(true))])
            .unwrap();

        QueryRewriter::new(
            Arc::new(PolicyEvaluator::new(registry)),
            Arc::new(RelationshipQueryTransformer::new(relationships, dialect)),
        )
    }

    fn staff() -> RlsContext {
        RlsContext::authenticated("u1", ["staff"]).with_tenant("t1")
    }

    #[test]
    fn test_parse_checks_parameter_count() {
        let statement = SqlStatement::parse(
            Dialect::Postgres,
            "SELECT * FROM products p WHERE p.price > $1 AND p.stock > $2",
            vec![SqlValue::Int(10), SqlValue::Int(0)],
        )
        .unwrap();
        assert_eq!(statement.param_count(), 2);
        assert_eq!(statement.main_alias().as_deref(), Some("p"));
        assert_eq!(statement.table().as_deref(), Some("products"));
        assert_eq!(statement.operation().unwrap(), Operation::Read);

        let err = SqlStatement::parse(Dialect::MySql, "SELECT * FROM t WHERE a = ?", vec![])
            .unwrap_err();
        assert!(matches!(err, Error::QueryError(_)));

        assert!(matches!(
            SqlStatement::parse(Dialect::Postgres, "SELEC nothing", vec![]),
            Err(Error::SqlParse(_))
        ));
        assert!(matches!(
            SqlStatement::parse(Dialect::Postgres, "SELECT 1; SELECT 2", vec![]),
            Err(Error::SqlParse(_))
        ));
    }

    #[test]
    fn test_and_where_without_where() {
        let mut statement =
            SqlStatement::parse(Dialect::Postgres, "SELECT * FROM products", vec![]).unwrap();
        statement
            .and_where(SqlFragment::new(
                "\"products\".\"tenant_id\" = $1",
                vec![SqlValue::from("t1")],
            ))
            .unwrap();

        let rendered = statement.to_fragment();
        assert_eq!(
            rendered.sql,
            "SELECT * FROM products WHERE \"products\".\"tenant_id\" = $1"
        );
        assert_eq!(rendered.params, vec![SqlValue::from("t1")]);
    }

    #[test]
    fn test_and_where_keeps_or_grouped() {
        let mut statement = SqlStatement::parse(
            Dialect::Postgres,
            "SELECT * FROM products WHERE a = $1 OR b = $2",
            vec![SqlValue::Int(1), SqlValue::Int(2)],
        )
        .unwrap();
        statement
            .and_where(SqlFragment::new("tenant_id = $3", vec![SqlValue::from("t1")]))
            .unwrap();

        assert_eq!(
            statement.to_fragment().sql,
            "SELECT * FROM products WHERE (a = $1 OR b = $2) AND (tenant_id = $3)"
        );
    }

    #[test]
    fn test_positional_parameters_follow_text_order() {
        let mut statement = SqlStatement::parse(
            Dialect::MySql,
            "SELECT * FROM products WHERE price > ? ORDER BY name LIMIT ?",
            vec![SqlValue::Int(10), SqlValue::Int(25)],
        )
        .unwrap();
        statement
            .and_where(SqlFragment::new("`tenant_id` = ?", vec![SqlValue::from("t1")]))
            .unwrap();

        let rendered = statement.to_fragment();
        assert_eq!(
            rendered.sql,
            "SELECT * FROM products WHERE price > ? AND (`tenant_id` = ?) ORDER BY name LIMIT ?"
        );
        assert_eq!(
            rendered.params,
            vec![SqlValue::Int(10), SqlValue::from("t1"), SqlValue::Int(25)]
        );
    }

    #[test]
    fn test_mysql_limit_offset_keeps_parameter_binding() {
        let mut statement = SqlStatement::parse(
            Dialect::MySql,
            "SELECT * FROM products LIMIT ?, ?",
            vec![SqlValue::Int(100), SqlValue::Int(5)],
        )
        .unwrap();
        statement
            .and_where(SqlFragment::new("`tenant_id` = ?", vec![SqlValue::from("t1")]))
            .unwrap();

        let rendered = statement.to_fragment();
        assert_eq!(
            rendered.sql,
            "SELECT * FROM products WHERE `tenant_id` = ? LIMIT ? OFFSET ?"
        );
        assert_eq!(
            rendered.params,
            vec![SqlValue::from("t1"), SqlValue::Int(5), SqlValue::Int(100)]
        );
    }

    #[test]
    fn test_question_mark_inside_literal_is_not_a_placeholder() {
        let mut statement = SqlStatement::parse(
            Dialect::Sqlite,
            "SELECT * FROM products WHERE note = 'why?'\nAND id = ?",
            vec![SqlValue::Int(7)],
        )
        .unwrap();
        statement
            .and_where(SqlFragment::new("\"tenant_id\" = ?", vec![SqlValue::from("t1")]))
            .unwrap();

        let rendered = statement.to_fragment();
        assert_eq!(
            rendered.sql,
            "SELECT * FROM products WHERE note = 'why?' AND id = ? AND (\"tenant_id\" = ?)"
        );
        assert_eq!(rendered.params, vec![SqlValue::Int(7), SqlValue::from("t1")]);
    }

    #[test]
    fn test_named_placeholders_rejected_for_positional_dialects() {
        assert!(matches!(
            SqlStatement::parse(
                Dialect::Sqlite,
                "SELECT * FROM products WHERE id = ?1",
                vec![SqlValue::Int(1)],
            ),
            Err(Error::QueryError(_))
        ));
    }

    #[test]
    fn test_relations_cover_joins_ctes_and_subqueries() {
        let statement = SqlStatement::parse(
            Dialect::Postgres,
            "WITH recent AS (SELECT * FROM orders) \
             SELECT * FROM categories c JOIN recent r ON r.cat_id = c.id \
             WHERE c.id IN (SELECT cat_id FROM products)",
            vec![],
        )
        .unwrap();
        let relations = statement.relations();
        for table in ["orders", "categories", "recent", "products"] {
            assert!(relations.iter().any(|r| r == table), "{table} in {relations:?}");
        }
    }

    #[test]
    fn test_insert_cannot_be_filtered() {
        let mut statement = SqlStatement::parse(
            Dialect::Sqlite,
            "INSERT INTO products (name) VALUES (?)",
            vec![SqlValue::from("lamp")],
        )
        .unwrap();
        assert_eq!(statement.operation().unwrap(), Operation::Create);
        assert!(statement
            .and_where(SqlFragment::new("1 = 0", vec![]))
            .is_err());
    }

    #[tokio::test]
    async fn test_rewrite_sql_applies_filters_then_relationships() {
        let rewriter = rewriter(Dialect::Postgres);
        let rewritten = context::run(staff(), async {
            rewriter
                .rewrite_sql(
                    "SELECT * FROM products AS p WHERE p.price > $1",
                    vec![SqlValue::Int(10)],
                )
                .await
        })
        .await
        .unwrap();

        assert_eq!(
            rewritten.sql,
            "SELECT * FROM products AS p WHERE p.price > $1 \
             AND (\"p\".\"tenant_id\" = $2) \
             AND (EXISTS (SELECT 1 FROM \"shops\" \
             JOIN \"staff\" ON \"shops\".\"id\" = \"staff\".\"shop_id\" \
             WHERE \"shops\".\"id\" = \"p\".\"shop_id\" AND \"staff\".\"user_id\" = $3))"
        );
        assert_eq!(
            rewritten.params,
            vec![SqlValue::Int(10), SqlValue::from("t1"), SqlValue::from("u1")]
        );
    }

    #[tokio::test]
    async fn test_rewrite_update_and_delete() {
        let rewriter = rewriter(Dialect::Sqlite);
        let (update, delete) = context::run(staff(), async {
            let update = rewriter
                .rewrite_sql(
                    "UPDATE products SET price = ? WHERE id = ?",
                    vec![SqlValue::Int(5), SqlValue::Int(1)],
                )
                .await;
            let delete = rewriter
                .rewrite_sql("DELETE FROM main.products", vec![])
                .await;
            (update, delete)
        })
        .await;

        let update = update.unwrap();
        assert!(update
            .sql
            .starts_with("UPDATE products SET price = ? WHERE id = ? AND (\"products\".\"tenant_id\" = ?)"));
        assert_eq!(
            update.params,
            vec![
                SqlValue::Int(5),
                SqlValue::Int(1),
                SqlValue::from("t1"),
                SqlValue::from("u1")
            ]
        );

        let delete = delete.unwrap();
        assert!(delete.sql.starts_with("DELETE FROM main.products WHERE \"products\".\"tenant_id\" = ?"));
        assert_eq!(delete.params, vec![SqlValue::from("t1"), SqlValue::from("u1")]);
    }

    #[tokio::test]
    async fn test_protected_table_outside_main_relation_rejected() {
        let rewriter = rewriter(Dialect::Postgres);
        let statements = [
            "SELECT p.* FROM categories c JOIN products p ON p.cat_id = c.id",
            "WITH x AS (SELECT * FROM products) SELECT * FROM x",
            "SELECT * FROM categories WHERE id IN (SELECT cat_id FROM products)",
            "SELECT * FROM products p JOIN audit_log a ON a.product_id = p.id",
            "UPDATE categories SET name = 'x' WHERE id IN (SELECT cat_id FROM public.products)",
        ];
        for sql in statements {
            let result =
                context::run(staff(), async { rewriter.rewrite_sql(sql, vec![]).await }).await;
            assert!(matches!(result, Err(Error::QueryError(_))), "{sql}: {result:?}");
        }

        let system = context::run(RlsContext::system(), async {
            rewriter.rewrite_sql(statements[0], vec![]).await
        })
        .await
        .unwrap();
        assert!(system.params.is_empty());
    }

    #[tokio::test]
    async fn test_unprotected_join_is_rewritten() {
        let rewriter = rewriter(Dialect::Postgres);
        let rewritten = context::run(staff(), async {
            rewriter
                .rewrite_sql(
                    "SELECT p.* FROM products p JOIN categories c ON c.id = p.cat_id",
                    vec![],
                )
                .await
        })
        .await
        .unwrap();

        assert!(rewritten
            .sql
            .contains("WHERE \"p\".\"tenant_id\" = $1 AND (EXISTS"));
        assert_eq!(
            rewritten.params,
            vec![SqlValue::from("t1"), SqlValue::from("u1")]
        );
    }

    #[tokio::test]
    async fn test_rewrite_without_context_is_identity() {
        let rewriter = rewriter(Dialect::Postgres);
        let sql = "SELECT * FROM products WHERE id = $1";
        let rewritten = rewriter
            .rewrite_sql(sql, vec![SqlValue::Int(1)])
            .await
            .unwrap();
        assert_eq!(rewritten.sql, sql);

        let system = context::run(RlsContext::system(), async {
            rewriter.rewrite_sql(sql, vec![SqlValue::Int(1)]).await
        })
        .await
        .unwrap();
        assert_eq!(system.sql, sql);
    }

    #[tokio::test]
    async fn test_unprotected_table_untouched() {
        let rewriter = rewriter(Dialect::Postgres);
        let sql = "SELECT * FROM categories";
        let rewritten = context::run(staff(), async { rewriter.rewrite_sql(sql, vec![]).await })
            .await
            .unwrap();
        assert_eq!(rewritten.sql, sql);
        assert!(rewritten.params.is_empty());
    }
}
