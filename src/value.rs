/// Value model shared by script engines and the capability layer.
///
/// Everything that crosses the capability boundary (SQL parameters and
/// rows, header values, JSON call arguments) is expressed as a `Value`,
/// so neither side depends on the other's native representation.
/// Text and blob payloads are owned: a `Value` never borrows from the
/// engine or from a database row.
use base64::Engine;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::ToSql;
use serde_json::json;

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// JSON key used to tag a base64-encoded blob.
pub const BLOB_TAG: &str = "$blob";

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Int(i64),
    Double(f64),
    Text(String),
    Blob(Vec<u8>),
    Bool(bool),
}

impl Value {
    /// Name of the variant, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Int(_) => "int",
            Value::Double(_) => "double",
            Value::Text(_) => "text",
            Value::Blob(_) => "blob",
            Value::Bool(_) => "bool",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Copies a borrowed SQLite column into an owned value.
    pub fn from_sql_ref(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Value::Nil,
            ValueRef::Integer(i) => Value::Int(i),
            ValueRef::Real(f) => Value::Double(f),
            ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
        }
    }

    /// Converts to JSON. Blobs become `{"$blob": "<base64>"}`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Nil => serde_json::Value::Null,
            Value::Int(i) => json!(i),
            Value::Double(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => json!(s),
            Value::Blob(b) => json!({ BLOB_TAG: B64.encode(b) }),
            Value::Bool(b) => json!(b),
        }
    }

    /// Converts a scalar JSON value. Arrays and objects (other than the
    /// blob tag) have no `Value` counterpart and yield `None`.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => Some(Value::Nil),
            serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Value::Int(i))
                } else {
                    n.as_f64().map(Value::Double)
                }
            }
            serde_json::Value::String(s) => Some(Value::Text(s.clone())),
            serde_json::Value::Object(map) if map.len() == 1 => {
                let encoded = map.get(BLOB_TAG)?.as_str()?;
                B64.decode(encoded).ok().map(Value::Blob)
            }
            _ => None,
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Nil => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Int(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            Value::Double(f) => ToSqlOutput::Borrowed(ValueRef::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
            Value::Bool(b) => ToSqlOutput::Borrowed(ValueRef::Integer(i64::from(*b))),
        })
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Double(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Blob(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_names() {
        assert_eq!(Value::Nil.type_name(), "nil");
        assert_eq!(Value::Int(1).type_name(), "int");
        assert_eq!(Value::Double(1.5).type_name(), "double");
        assert_eq!(Value::from("x").type_name(), "text");
        assert_eq!(Value::Blob(vec![1]).type_name(), "blob");
        assert_eq!(Value::Bool(true).type_name(), "bool");
    }

    #[test]
    fn test_blob_json_tag() {
        let json = Value::Blob(vec![0, 1, 2, 255]).to_json();
        assert!(json[BLOB_TAG].is_string());
        assert_eq!(Value::from_json(&json), Some(Value::Blob(vec![0, 1, 2, 255])));
    }

    #[test]
    fn test_from_json_numbers() {
        assert_eq!(Value::from_json(&json!(42)), Some(Value::Int(42)));
        assert_eq!(Value::from_json(&json!(2.5)), Some(Value::Double(2.5)));
    }

    #[test]
    fn test_from_json_rejects_containers() {
        assert_eq!(Value::from_json(&json!([1, 2])), None);
        assert_eq!(Value::from_json(&json!({"a": 1})), None);
    }

    #[test]
    fn test_nan_becomes_null() {
        assert_eq!(Value::Double(f64::NAN).to_json(), serde_json::Value::Null);
    }

    #[test]
    fn test_from_sql_ref_copies_text() {
        let owned = {
            let bytes = b"hello".to_vec();
            Value::from_sql_ref(ValueRef::Text(&bytes))
        };
        assert_eq!(owned, Value::Text("hello".to_string()));
    }

    #[test]
    fn test_bool_binds_as_integer() {
        let out = Value::Bool(true).to_sql().unwrap();
        match out {
            ToSqlOutput::Borrowed(ValueRef::Integer(1)) => {}
            other => panic!("unexpected binding: {other:?}"),
        }
    }
}
