//! Query boundary
//!
//! The engine never owns the caller's query. It only needs to add predicates
//! to it through [`FilterableQuery`]. [`SelectQuery`] is a small reference
//! implementation; [`crate::rewriter::SqlStatement`] adapts raw SQL text.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use rowguard_common::{ConditionMap, Error, Result, SqlValue};

use crate::dialect::{Dialect, SqlWriter};

/// Parameterized SQL text. Parameters are ordered exactly as their
/// placeholders appear in `sql`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlFragment {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl SqlFragment {
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// A single column condition derived from a filter mapping
#[derive(Debug, Clone, PartialEq)]
pub enum FilterPredicate {
    /// `column = value`
    Eq { column: String, value: SqlValue },
    /// `column IS NULL`
    IsNull { column: String },
    /// `column IN (v1, v2, ...)`
    In { column: String, values: Vec<SqlValue> },
    /// Membership in an empty list; never true
    Never { column: String },
}

impl FilterPredicate {
    /// Translate one mapping entry.
    ///
    /// # Errors
    /// Objects, nested arrays and nulls inside arrays are rejected.
    pub fn from_entry(column: &str, value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(FilterPredicate::IsNull {
                column: column.to_string(),
            }),
            Value::Array(items) if items.is_empty() => Ok(FilterPredicate::Never {
                column: column.to_string(),
            }),
            Value::Array(items) => {
                let values = items
                    .iter()
                    .map(|item| SqlValue::from_json(column, item))
                    .collect::<Result<Vec<_>>>()?;
                Ok(FilterPredicate::In {
                    column: column.to_string(),
                    values,
                })
            }
            Value::Object(_) => Err(Error::UnsupportedConditionValue {
                column: column.to_string(),
                reason: "objects are not supported".to_string(),
            }),
            scalar => Ok(FilterPredicate::Eq {
                column: column.to_string(),
                value: SqlValue::from_json(column, scalar)?,
            }),
        }
    }

    /// Translate a whole mapping, preserving its order. Keys that are absent
    /// produce no predicate at all.
    pub fn from_conditions(conditions: &ConditionMap) -> Result<Vec<Self>> {
        conditions
            .iter()
            .map(|(column, value)| Self::from_entry(column, value))
            .collect()
    }

    pub fn column(&self) -> &str {
        match self {
            FilterPredicate::Eq { column, .. }
            | FilterPredicate::IsNull { column }
            | FilterPredicate::In { column, .. }
            | FilterPredicate::Never { column } => column,
        }
    }

    /// Write the predicate, qualifying the column with `qualifier`
    pub fn write(&self, w: &mut SqlWriter, qualifier: Option<&str>) {
        match self {
            FilterPredicate::Eq { column, value } => {
                w.push_column(qualifier, column)
                    .push(" = ")
                    .push_param(value.clone());
            }
            FilterPredicate::IsNull { column } => {
                w.push_column(qualifier, column).push(" IS NULL");
            }
            FilterPredicate::In { column, values } => {
                w.push_column(qualifier, column).push(" IN (");
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        w.push(", ");
                    }
                    w.push_param(value.clone());
                }
                w.push(")");
            }
            FilterPredicate::Never { .. } => {
                w.push("1 = 0");
            }
        }
    }

    /// Evaluate against an in-memory row
    pub fn matches(&self, row: &Value) -> bool {
        let field = row.get(self.column()).unwrap_or(&Value::Null);
        match self {
            FilterPredicate::Eq { value, .. } => value.matches_json(field),
            FilterPredicate::IsNull { .. } => field.is_null(),
            FilterPredicate::In { values, .. } => values.iter().any(|v| v.matches_json(field)),
            FilterPredicate::Never { .. } => false,
        }
    }
}

/// Render predicates as one `AND`-joined fragment
pub fn render_predicates(
    predicates: &[FilterPredicate],
    dialect: Dialect,
    qualifier: Option<&str>,
    param_offset: usize,
) -> Option<SqlFragment> {
    if predicates.is_empty() {
        return None;
    }

    let mut w = SqlWriter::new(dialect, param_offset);
    for (i, predicate) in predicates.iter().enumerate() {
        if i > 0 {
            w.push(" AND ");
        }
        predicate.write(&mut w, qualifier);
    }
    let (sql, params) = w.finish();
    Some(SqlFragment::new(sql, params))
}

/// A query that security predicates can be added to
pub trait FilterableQuery {
    /// Alias the main table is referenced by, if any
    fn main_alias(&self) -> Option<String> {
        None
    }

    /// Number of parameters already bound; new fragments number after these
    fn param_count(&self) -> usize;

    /// AND `fragment` onto the query's filter
    ///
    /// # Errors
    /// Implementations may reject fragments they cannot represent.
    fn and_where(&mut self, fragment: SqlFragment) -> Result<()>;
}

/// Minimal parameterized SELECT
#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    dialect: Dialect,
    table: String,
    alias: Option<String>,
    columns: Vec<String>,
    predicates: Vec<String>,
    params: Vec<SqlValue>,
    order_by: Vec<(String, bool)>,
    limit: Option<usize>,
}

impl SelectQuery {
    pub fn new(dialect: Dialect, table: &str) -> Self {
        Self {
            dialect,
            table: table.to_string(),
            alias: None,
            columns: Vec::new(),
            predicates: Vec::new(),
            params: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }

    pub fn alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Add `column = value`
    pub fn where_eq(mut self, column: &str, value: impl Into<SqlValue>) -> Self {
        let predicate = FilterPredicate::Eq {
            column: column.to_string(),
            value: value.into(),
        };
        let qualifier = self.qualifier().to_string();
        if let Some(fragment) =
            render_predicates(&[predicate], self.dialect, Some(&qualifier), self.params.len())
        {
            self.predicates.push(fragment.sql);
            self.params.extend(fragment.params);
        }
        self
    }

    pub fn order_by(mut self, column: &str, ascending: bool) -> Self {
        self.order_by.push((column.to_string(), ascending));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn predicates(&self) -> &[String] {
        &self.predicates
    }

    fn qualifier(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.table)
    }

    /// Render the full statement
    pub fn to_sql(&self) -> SqlFragment {
        let mut w = SqlWriter::new(self.dialect, 0);
        w.push("SELECT ");
        if self.columns.is_empty() {
            w.push("*");
        } else {
            let qualifier = self.qualifier().to_string();
            for (i, column) in self.columns.iter().enumerate() {
                if i > 0 {
                    w.push(", ");
                }
                w.push_column(Some(&qualifier), column);
            }
        }
        w.push(" FROM ").push_table(&self.table);
        if let Some(alias) = &self.alias {
            w.push(" AS ").push_ident(alias);
        }
        if !self.predicates.is_empty() {
            w.push(" WHERE ");
            w.push(&self.predicates.join(" AND "));
        }
        if !self.order_by.is_empty() {
            w.push(" ORDER BY ");
            for (i, (column, ascending)) in self.order_by.iter().enumerate() {
                if i > 0 {
                    w.push(", ");
                }
                w.push_ident(column)
                    .push(if *ascending { " ASC" } else { " DESC" });
            }
        }
        if let Some(limit) = self.limit {
            w.push(&format!(" LIMIT {limit}"));
        }

        let (sql, _) = w.finish();
        SqlFragment::new(sql, self.params.clone())
    }
}

impl FilterableQuery for SelectQuery {
    fn main_alias(&self) -> Option<String> {
        self.alias.clone()
    }

    fn param_count(&self) -> usize {
        self.params.len()
    }

    fn and_where(&mut self, fragment: SqlFragment) -> Result<()> {
        self.predicates.push(format!("({})", fragment.sql));
        self.params.extend(fragment.params);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> ConditionMap {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_predicates_from_conditions() {
        let predicates = FilterPredicate::from_conditions(&map(json!({
            "tenant_id": "t1",
            "deleted_at": null,
            "status": ["open", "pending"],
            "region": [],
        })))
        .unwrap();

        assert_eq!(predicates.len(), 4);
        assert!(matches!(&predicates[0], FilterPredicate::Eq { column, .. } if column == "tenant_id"));
        assert!(matches!(&predicates[1], FilterPredicate::IsNull { .. }));
        assert!(matches!(&predicates[2], FilterPredicate::In { values, .. } if values.len() == 2));
        assert!(matches!(&predicates[3], FilterPredicate::Never { .. }));
    }

    #[test]
    fn test_unsupported_shapes_rejected() {
        let err = FilterPredicate::from_conditions(&map(json!({ "meta": { "a": 1 } }))).unwrap_err();
        assert!(matches!(err, Error::UnsupportedConditionValue { ref column, .. } if column == "meta"));

        assert!(FilterPredicate::from_conditions(&map(json!({ "ids": [1, null] }))).is_err());
        assert!(FilterPredicate::from_conditions(&map(json!({ "ids": [[1]] }))).is_err());
    }

    #[test]
    fn test_render_predicates() {
        let predicates = FilterPredicate::from_conditions(&map(json!({
            "tenant_id": "t1",
            "deleted_at": null,
            "status": ["open", "pending"],
        })))
        .unwrap();

        let pg = render_predicates(&predicates, Dialect::Postgres, Some("t"), 0).unwrap();
        assert_eq!(
            pg.sql,
            "\"t\".\"tenant_id\" = $1 AND \"t\".\"deleted_at\" IS NULL AND \"t\".\"status\" IN ($2, $3)"
        );
        assert_eq!(
            pg.params,
            vec![SqlValue::from("t1"), SqlValue::from("open"), SqlValue::from("pending")]
        );

        let my = render_predicates(&predicates, Dialect::MySql, None, 0).unwrap();
        assert_eq!(
            my.sql,
            "`tenant_id` = ? AND `deleted_at` IS NULL AND `status` IN (?, ?)"
        );

        assert!(render_predicates(&[], Dialect::Postgres, None, 0).is_none());
    }

    #[test]
    fn test_empty_list_is_always_false() {
        let predicates = FilterPredicate::from_conditions(&map(json!({ "id": [] }))).unwrap();
        let fragment = render_predicates(&predicates, Dialect::Postgres, None, 0).unwrap();
        assert_eq!(fragment.sql, "1 = 0");
        assert!(fragment.params.is_empty());
        assert!(!predicates[0].matches(&json!({ "id": 1 })));
    }

    #[test]
    fn test_predicate_matches_row() {
        let row = json!({ "tenant_id": "t1", "status": "open", "deleted_at": null });
        let predicates = FilterPredicate::from_conditions(&map(json!({
            "tenant_id": "t1",
            "status": ["open", "pending"],
            "deleted_at": null,
        })))
        .unwrap();
        assert!(predicates.iter().all(|p| p.matches(&row)));

        let other = json!({ "tenant_id": "t2", "status": "open", "deleted_at": null });
        assert!(!predicates[0].matches(&other));
    }

    #[test]
    fn test_select_query_rendering() {
        let mut query = SelectQuery::new(Dialect::Postgres, "posts")
            .alias("p")
            .columns(["id", "title"])
            .where_eq("published", true)
            .order_by("created_at", false)
            .limit(10);
        assert_eq!(query.param_count(), 1);

        query
            .and_where(SqlFragment::new("\"p\".\"tenant_id\" = $2", vec![SqlValue::from("t1")]))
            .unwrap();

        let rendered = query.to_sql();
        assert_eq!(
            rendered.sql,
            "SELECT \"p\".\"id\", \"p\".\"title\" FROM \"posts\" AS \"p\" WHERE \"p\".\"published\" = $1 AND (\"p\".\"tenant_id\" = $2) ORDER BY \"created_at\" DESC LIMIT 10"
        );
        assert_eq!(
            rendered.params,
            vec![SqlValue::Bool(true), SqlValue::from("t1")]
        );
    }
}
