//! SQL dialects and the fragment writer
//!
//! Every identifier and every bound value in generated SQL goes through
//! [`SqlWriter`], which defers quoting and placeholder syntax to the
//! selected [`SqlDialect`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use rowguard_common::{Error, Result, SqlValue};

/// Quoting and placeholder rules of one SQL dialect
pub trait SqlDialect: Send + Sync {
    fn name(&self) -> &'static str;

    /// Quote a single identifier, escaping embedded quote characters
    fn quote_identifier(&self, ident: &str) -> String;

    /// Placeholder for the parameter at 1-based `index`
    fn placeholder(&self, index: usize) -> String;

    /// Quote a possibly schema-qualified name (`schema.table`)
    fn quote_qualified(&self, name: &str) -> String {
        name.split('.')
            .map(|part| self.quote_identifier(part))
            .collect::<Vec<_>>()
            .join(".")
    }
}

/// PostgreSQL: `"ident"`, `$1, $2, ...`
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${index}")
    }
}

/// MySQL: `` `ident` ``, `?`
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDialect;

impl SqlDialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }
}

/// SQLite: `"ident"`, `?`
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }
}

/// Supported dialects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Postgres,
    MySql,
    Sqlite,
}

impl Dialect {
    pub fn strategy(self) -> &'static dyn SqlDialect {
        match self {
            Dialect::Postgres => &PostgresDialect,
            Dialect::MySql => &MySqlDialect,
            Dialect::Sqlite => &SqliteDialect,
        }
    }
}

impl Default for Dialect {
    fn default() -> Self {
        Dialect::Postgres
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.strategy().name())
    }
}

impl FromStr for Dialect {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Dialect::Postgres),
            "mysql" | "mariadb" => Ok(Dialect::MySql),
            "sqlite" | "sqlite3" => Ok(Dialect::Sqlite),
            _ => Err(Error::UnsupportedDialect(s.to_string())),
        }
    }
}

/// Append-only SQL text with its ordered parameter list.
///
/// Parameters are numbered from `offset + 1` so a fragment can continue the
/// numbering of the statement it will be spliced into.
pub struct SqlWriter {
    dialect: &'static dyn SqlDialect,
    sql: String,
    params: Vec<SqlValue>,
    offset: usize,
}

impl SqlWriter {
    pub fn new(dialect: Dialect, offset: usize) -> Self {
        Self {
            dialect: dialect.strategy(),
            sql: String::new(),
            params: Vec::new(),
            offset,
        }
    }

    pub fn push(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    pub fn push_table(&mut self, name: &str) -> &mut Self {
        let quoted = self.dialect.quote_qualified(name);
        self.sql.push_str(&quoted);
        self
    }

    pub fn push_ident(&mut self, ident: &str) -> &mut Self {
        let quoted = self.dialect.quote_identifier(ident);
        self.sql.push_str(&quoted);
        self
    }

    /// `qualifier.column`, or just `column` when unqualified
    pub fn push_column(&mut self, qualifier: Option<&str>, column: &str) -> &mut Self {
        if let Some(qualifier) = qualifier {
            self.push_ident(qualifier);
            self.sql.push('.');
        }
        self.push_ident(column)
    }

    pub fn push_param(&mut self, value: SqlValue) -> &mut Self {
        self.params.push(value);
        let placeholder = self.dialect.placeholder(self.offset + self.params.len());
        self.sql.push_str(&placeholder);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    pub fn finish(self) -> (String, Vec<SqlValue>) {
        (self.sql, self.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quoting() {
        assert_eq!(PostgresDialect.quote_identifier("users"), "\"users\"");
        assert_eq!(PostgresDialect.quote_identifier("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(MySqlDialect.quote_identifier("users"), "`users`");
        assert_eq!(MySqlDialect.quote_identifier("a`b"), "`a``b`");
        assert_eq!(
            PostgresDialect.quote_qualified("public.users"),
            "\"public\".\"users\""
        );
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(PostgresDialect.placeholder(3), "$3");
        assert_eq!(MySqlDialect.placeholder(3), "?");
        assert_eq!(SqliteDialect.placeholder(1), "?");
    }

    #[test]
    fn test_dialect_from_str() {
        assert_eq!("postgres".parse::<Dialect>().unwrap(), Dialect::Postgres);
        assert_eq!("MySQL".parse::<Dialect>().unwrap(), Dialect::MySql);
        assert_eq!("sqlite".parse::<Dialect>().unwrap(), Dialect::Sqlite);

        let err = "oracle".parse::<Dialect>().unwrap_err();
        assert!(err.is_configuration());
        assert!(matches!(err, Error::UnsupportedDialect(name) if name == "oracle"));
    }

    #[test]
    fn test_writer_numbers_from_offset() {
        let mut w = SqlWriter::new(Dialect::Postgres, 2);
        w.push_column(Some("t"), "a")
            .push(" = ")
            .push_param(SqlValue::from("x"))
            .push(" AND ")
            .push_column(None, "b")
            .push(" = ")
            .push_param(SqlValue::Int(1));

        let (sql, params) = w.finish();
        assert_eq!(sql, "\"t\".\"a\" = $3 AND \"b\" = $4");
        assert_eq!(params, vec![SqlValue::from("x"), SqlValue::Int(1)]);
    }
}
