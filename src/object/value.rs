use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::error::{SyncError, SyncResult};
use crate::protocol::PropertyValue;

/// Declared type of a registered property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Bool,
    Integer,
    Float,
    Text,
    /// Anything else; travels as JSON text
    Structured,
}

impl ValueKind {
    /// Whether `value` is already a valid instance of this kind
    pub fn accepts(&self, value: &PropertyValue) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (ValueKind::Bool, v) => v.is_boolean(),
            (ValueKind::Integer, v) => v.is_i64() || v.is_u64(),
            (ValueKind::Float, v) => v.is_number(),
            (ValueKind::Text, v) => v.is_string(),
            (ValueKind::Structured, _) => true,
        }
    }
}

/// Prepare a local value of `kind` for the wire.
///
/// `Structured` values always travel as their JSON text, whatever their
/// shape, so [`decode_value`] parses them back exactly. Other kinds send
/// scalars as-is and objects or arrays as JSON text.
pub fn encode_value(kind: ValueKind, value: &PropertyValue) -> PropertyValue {
    match (kind, value) {
        (_, Value::Null) => Value::Null,
        (ValueKind::Structured, _) | (_, Value::Object(_)) | (_, Value::Array(_)) => {
            Value::String(value.to_string())
        }
        (_, other) => other.clone(),
    }
}

/// Convert a wire payload to the property's declared kind.
pub fn decode_value(property: &str, kind: ValueKind, raw: &PropertyValue) -> SyncResult<PropertyValue> {
    let fail = |reason: String| SyncError::Conversion {
        property: property.to_string(),
        expected: kind,
        reason,
    };

    if raw.is_null() {
        return Ok(Value::Null);
    }

    match kind {
        ValueKind::Bool => match raw {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::Number(n) => Ok(Value::Bool(n.as_f64().map(|f| f != 0.0).unwrap_or(false))),
            Value::String(s) => s
                .trim()
                .parse::<bool>()
                .map(Value::Bool)
                .map_err(|e| fail(e.to_string())),
            other => Err(fail(format!("unexpected {}", type_label(other)))),
        },
        ValueKind::Integer => match raw {
            Value::Bool(b) => Ok(Value::from(i64::from(*b))),
            Value::Number(n) => integer_from_number(n).ok_or_else(|| fail(format!("{n} is not an integer"))),
            Value::String(s) => {
                let trimmed = s.trim();
                if let Ok(i) = trimmed.parse::<i64>() {
                    return Ok(Value::from(i));
                }
                trimmed
                    .parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .and_then(|n| integer_from_number(&n))
                    .ok_or_else(|| fail(format!("'{s}' is not an integer")))
            }
            other => Err(fail(format!("unexpected {}", type_label(other)))),
        },
        ValueKind::Float => {
            let parsed = match raw {
                Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            parsed
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| fail(format!("cannot read {} as a float", type_label(raw))))
        }
        ValueKind::Text => match raw {
            Value::String(s) => Ok(Value::String(s.clone())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            other => Ok(Value::String(other.to_string())),
        },
        ValueKind::Structured => match raw {
            Value::String(text) => serde_json::from_str(text).map_err(|e| fail(e.to_string())),
            other => Ok(other.clone()),
        },
    }
}

fn integer_from_number(n: &Number) -> Option<Value> {
    if let Some(i) = n.as_i64() {
        return Some(Value::from(i));
    }
    if let Some(u) = n.as_u64() {
        return Some(Value::from(u));
    }
    let f = n.as_f64()?;
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Some(Value::from(f as i64))
    } else {
        None
    }
}

fn type_label(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn structured_values_travel_as_json_text() {
        let local = json!({"x": 1, "y": 2});
        let wire = encode_value(ValueKind::Structured, &local);
        assert!(wire.is_string());
        assert_eq!(decode_value("Offset", ValueKind::Structured, &wire).unwrap(), local);
    }

    #[test]
    fn structured_round_trip_keeps_every_shape() {
        for local in [json!("plain"), json!("42"), json!(42), json!(true), json!([1, "two"]), json!({"a": {"b": null}})] {
            let wire = encode_value(ValueKind::Structured, &local);
            assert!(wire.is_string(), "{local} should travel as JSON text");
            assert_eq!(decode_value("Meta", ValueKind::Structured, &wire).unwrap(), local);
        }
        assert_eq!(encode_value(ValueKind::Structured, &Value::Null), Value::Null);
    }

    #[test]
    fn scalars_pass_through() {
        assert_eq!(encode_value(ValueKind::Integer, &json!(3)), json!(3));
        assert_eq!(encode_value(ValueKind::Text, &json!("a")), json!("a"));
        assert_eq!(decode_value("Name", ValueKind::Text, &json!("a")).unwrap(), json!("a"));
    }

    #[test]
    fn primitives_convert_like_change_type() {
        assert_eq!(decode_value("n", ValueKind::Integer, &json!("42")).unwrap(), json!(42));
        assert_eq!(decode_value("n", ValueKind::Integer, &json!(7.0)).unwrap(), json!(7));
        assert_eq!(decode_value("f", ValueKind::Float, &json!("0.25")).unwrap(), json!(0.25));
        assert_eq!(decode_value("b", ValueKind::Bool, &json!("true")).unwrap(), json!(true));
        assert_eq!(decode_value("t", ValueKind::Text, &json!(12)).unwrap(), json!("12"));
    }

    #[test]
    fn conversion_failures_are_reported() {
        let err = decode_value("n", ValueKind::Integer, &json!("forty")).unwrap_err();
        assert!(matches!(err, SyncError::Conversion { expected: ValueKind::Integer, .. }));
        assert!(decode_value("n", ValueKind::Integer, &json!(1.5)).is_err());
        assert!(decode_value("s", ValueKind::Structured, &json!("{broken")).is_err());
    }

    #[test]
    fn null_is_valid_for_every_kind() {
        for kind in [ValueKind::Bool, ValueKind::Integer, ValueKind::Float, ValueKind::Text, ValueKind::Structured] {
            assert!(kind.accepts(&Value::Null));
            assert_eq!(decode_value("p", kind, &Value::Null).unwrap(), Value::Null);
        }
    }
}
