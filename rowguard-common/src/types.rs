//! Common types shared by the policy engine and its callers

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Column → value mapping produced by filter rules and end conditions.
///
/// Backed by an insertion-ordered JSON map so that predicates (and their
/// parameters) are emitted in the order the caller wrote them.
pub type ConditionMap = serde_json::Map<String, Value>;

// ============================================================================
// Operations
// ============================================================================

/// A concrete data operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Create,
        Operation::Read,
        Operation::Update,
        Operation::Delete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    /// Operations that carry a write payload
    pub fn has_payload(self) -> bool {
        matches!(self, Operation::Create | Operation::Update)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "create" | "insert" => Ok(Operation::Create),
            "read" | "select" => Ok(Operation::Read),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(Error::ConfigError(format!("unknown operation '{other}'"))),
        }
    }
}

/// Operation selector as written in a policy definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyOperation {
    All,
    Create,
    Read,
    Update,
    Delete,
}

impl PolicyOperation {
    /// Concrete operations this selector stands for. `All` on a validate rule
    /// only covers the operations that carry a payload.
    pub fn expand(self, payload_only: bool) -> &'static [Operation] {
        match self {
            PolicyOperation::All if payload_only => &[Operation::Create, Operation::Update],
            PolicyOperation::All => &Operation::ALL,
            PolicyOperation::Create => &[Operation::Create],
            PolicyOperation::Read => &[Operation::Read],
            PolicyOperation::Update => &[Operation::Update],
            PolicyOperation::Delete => &[Operation::Delete],
        }
    }
}

impl Default for PolicyOperation {
    fn default() -> Self {
        PolicyOperation::All
    }
}

impl From<Operation> for PolicyOperation {
    fn from(op: Operation) -> Self {
        match op {
            Operation::Create => PolicyOperation::Create,
            Operation::Read => PolicyOperation::Read,
            Operation::Update => PolicyOperation::Update,
            Operation::Delete => PolicyOperation::Delete,
        }
    }
}

impl FromStr for PolicyOperation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("all") || s == "*" {
            return Ok(PolicyOperation::All);
        }
        s.parse::<Operation>().map(PolicyOperation::from)
    }
}

/// Join kind of a relationship hop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    Inner,
    Left,
    Right,
}

impl JoinType {
    pub fn keyword(self) -> &'static str {
        match self {
            JoinType::Inner => "JOIN",
            JoinType::Left => "LEFT JOIN",
            JoinType::Right => "RIGHT JOIN",
        }
    }
}

impl Default for JoinType {
    fn default() -> Self {
        JoinType::Inner
    }
}

// ============================================================================
// Bound Parameters
// ============================================================================

/// A scalar value bound to a placeholder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl SqlValue {
    /// Convert a JSON scalar. Null, arrays and objects have no single
    /// placeholder representation and are rejected.
    pub fn from_json(column: &str, value: &Value) -> Result<Self> {
        match value {
            Value::Bool(b) => Ok(SqlValue::Bool(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(SqlValue::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(SqlValue::Float(f))
                } else {
                    Err(Error::UnsupportedConditionValue {
                        column: column.to_string(),
                        reason: format!("number {n} does not fit a 64-bit parameter"),
                    })
                }
            }
            Value::String(s) => Ok(SqlValue::Text(s.clone())),
            Value::Null => Err(Error::UnsupportedConditionValue {
                column: column.to_string(),
                reason: "null cannot be bound as a parameter".to_string(),
            }),
            Value::Array(_) => Err(Error::UnsupportedConditionValue {
                column: column.to_string(),
                reason: "nested arrays are not supported".to_string(),
            }),
            Value::Object(_) => Err(Error::UnsupportedConditionValue {
                column: column.to_string(),
                reason: "objects are not supported".to_string(),
            }),
        }
    }

    /// Loose equality against a row value, used when evaluating in memory
    pub fn matches_json(&self, value: &Value) -> bool {
        match (self, value) {
            (SqlValue::Bool(a), Value::Bool(b)) => a == b,
            (SqlValue::Int(a), Value::Number(n)) => n.as_i64() == Some(*a),
            (SqlValue::Float(a), Value::Number(n)) => n.as_f64() == Some(*a),
            (SqlValue::Text(a), Value::String(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Bool(b) => write!(f, "{b}"),
            SqlValue::Int(i) => write!(f, "{i}"),
            SqlValue::Float(v) => write!(f, "{v}"),
            SqlValue::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        SqlValue::Text(s.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(s: String) -> Self {
        SqlValue::Text(s)
    }
}

impl From<i64> for SqlValue {
    fn from(i: i64) -> Self {
        SqlValue::Int(i)
    }
}

impl From<bool> for SqlValue {
    fn from(b: bool) -> Self {
        SqlValue::Bool(b)
    }
}
