//! # Attribute Codec
//!
//! Converts [`AttributeValue`] trees to and from JSON-safe values.
//!
//! Values JSON cannot carry natively are written as strings and tagged with a
//! conversion marker. The markers travel next to the data in a tree of the
//! same shape, so decoding is the exact inverse of encoding:
//!
//! | value                  | JSON                           | marker    |
//! |------------------------|--------------------------------|-----------|
//! | timestamp              | `"2015-06-01T10:00:00.000001"` | `"date"`  |
//! | NaN / ±infinity        | `"nan"`, `"inf"`, `"-inf"`     | `"float"` |
//! | map                    | object                         | object of non-null child markers, or `null` |
//! | list                   | array                          | array of child markers, or `null` |
//! | anything else          | itself                         | `null`    |

use crate::schema::{DATE_CONVERSION, FieldInfo};
use crate::types::{AttributeMap, AttributeValue, ProvarcError, Record};
use chrono::NaiveDateTime;
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

/// Conversion marker for non-finite floats.
pub const FLOAT_CONVERSION: &str = "float";

/// Timestamp layout: UTC, microseconds, no offset suffix.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

const TIMESTAMP_PARSE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

// =============================================================================
// ENCODING
// =============================================================================

/// Encode a value, returning the JSON-safe value and its conversion marker.
#[must_use]
pub fn serialize_value(value: &AttributeValue) -> (Value, Value) {
    match value {
        AttributeValue::Null => (Value::Null, Value::Null),
        AttributeValue::Bool(b) => (Value::Bool(*b), Value::Null),
        AttributeValue::Integer(i) => (Value::from(*i), Value::Null),
        AttributeValue::Text(s) => (Value::String(s.clone()), Value::Null),
        AttributeValue::Float(f) => match Number::from_f64(*f) {
            Some(n) => (Value::Number(n), Value::Null),
            None => (
                Value::String(float_sentinel(*f).to_string()),
                Value::String(FLOAT_CONVERSION.to_string()),
            ),
        },
        AttributeValue::Timestamp(ts) => (
            Value::String(ts.format(TIMESTAMP_FORMAT).to_string()),
            Value::String(DATE_CONVERSION.to_string()),
        ),
        AttributeValue::List(items) => {
            let (values, markers): (Vec<Value>, Vec<Value>) =
                items.iter().map(serialize_value).unzip();
            let marker = if markers.iter().all(Value::is_null) {
                Value::Null
            } else {
                Value::Array(markers)
            };
            (Value::Array(values), marker)
        }
        AttributeValue::Map(map) => serialize_map(map),
    }
}

/// Encode an attribute map. The value is always a JSON object.
#[must_use]
pub fn serialize_map(map: &BTreeMap<String, AttributeValue>) -> (Value, Value) {
    let mut values = Map::new();
    let mut markers = Map::new();
    for (key, item) in map {
        let (value, marker) = serialize_value(item);
        values.insert(key.clone(), value);
        if !marker.is_null() {
            markers.insert(key.clone(), marker);
        }
    }
    let marker = if markers.is_empty() {
        Value::Null
    } else {
        Value::Object(markers)
    };
    (Value::Object(values), marker)
}

fn float_sentinel(f: f64) -> &'static str {
    if f.is_nan() {
        "nan"
    } else if f.is_sign_negative() {
        "-inf"
    } else {
        "inf"
    }
}

// =============================================================================
// DECODING
// =============================================================================

/// Decode a value encoded by [`serialize_value`].
pub fn deserialize_value(value: &Value, marker: &Value) -> Result<AttributeValue, ProvarcError> {
    match marker {
        Value::Null => Ok(deserialize_plain(value)),
        Value::String(tag) => convert_scalar(value, tag),
        Value::Array(markers) => {
            let Value::Array(items) = value else {
                return Err(shape_mismatch("array", value));
            };
            items
                .iter()
                .enumerate()
                .map(|(i, item)| deserialize_value(item, markers.get(i).unwrap_or(&Value::Null)))
                .collect::<Result<Vec<_>, _>>()
                .map(AttributeValue::List)
        }
        Value::Object(_) => deserialize_map(value, marker).map(AttributeValue::Map),
        other => Err(ProvarcError::UnknownConversionMarker(other.to_string())),
    }
}

/// Decode an attribute map encoded by [`serialize_map`].
pub fn deserialize_map(value: &Value, marker: &Value) -> Result<AttributeMap, ProvarcError> {
    let Value::Object(items) = value else {
        return Err(shape_mismatch("object", value));
    };
    let markers = match marker {
        Value::Object(m) => Some(m),
        Value::Null => None,
        other => return Err(ProvarcError::UnknownConversionMarker(other.to_string())),
    };
    let mut out = AttributeMap::new();
    for (key, item) in items {
        let item_marker = markers.and_then(|m| m.get(key)).unwrap_or(&Value::Null);
        out.insert(key.clone(), deserialize_value(item, item_marker)?);
    }
    Ok(out)
}

/// Decode a JSON value that carries no conversion marker.
#[must_use]
pub fn deserialize_plain(value: &Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null,
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => AttributeValue::Integer(i),
            None => AttributeValue::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => AttributeValue::Text(s.clone()),
        Value::Array(items) => AttributeValue::List(items.iter().map(deserialize_plain).collect()),
        Value::Object(map) => AttributeValue::Map(
            map.iter()
                .map(|(k, v)| (k.clone(), deserialize_plain(v)))
                .collect(),
        ),
    }
}

fn convert_scalar(value: &Value, tag: &str) -> Result<AttributeValue, ProvarcError> {
    match tag {
        DATE_CONVERSION => match value {
            Value::Null => Ok(AttributeValue::Null),
            Value::String(s) => parse_timestamp(s),
            other => Err(shape_mismatch("timestamp string", other)),
        },
        FLOAT_CONVERSION => match value.as_str() {
            Some("nan") => Ok(AttributeValue::Float(f64::NAN)),
            Some("inf") => Ok(AttributeValue::Float(f64::INFINITY)),
            Some("-inf") => Ok(AttributeValue::Float(f64::NEG_INFINITY)),
            _ => Err(shape_mismatch("float sentinel", value)),
        },
        other => Err(ProvarcError::UnknownConversionMarker(other.to_string())),
    }
}

fn parse_timestamp(s: &str) -> Result<AttributeValue, ProvarcError> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_PARSE_FORMAT)
        .map(|naive| AttributeValue::timestamp(naive.and_utc()))
        .map_err(|e| ProvarcError::Serialization(format!("bad timestamp '{}': {}", s, e)))
}

fn shape_mismatch(expected: &str, found: &Value) -> ProvarcError {
    ProvarcError::Serialization(format!("expected {}, found {}", expected, found))
}

// =============================================================================
// RECORDS
// =============================================================================

/// Encode the exported fields of a record.
///
/// Only fields named in `fields` are written; absent fields become `null`.
/// Record fields carry no marker tree: their conversions come from the
/// field info.
#[must_use]
pub fn serialize_record(record: &Record, fields: &BTreeMap<String, FieldInfo>) -> Value {
    let mut out = Map::new();
    for name in fields.keys() {
        let value = record
            .get(name)
            .map(|v| serialize_value(v).0)
            .unwrap_or(Value::Null);
        out.insert(name.clone(), value);
    }
    Value::Object(out)
}

/// Decode a record of `entity_type` using its archive field info.
pub fn deserialize_record(
    entity_type: &str,
    value: &Value,
    fields: &BTreeMap<String, FieldInfo>,
) -> Result<Record, ProvarcError> {
    let Value::Object(items) = value else {
        return Err(shape_mismatch("record object", value));
    };
    let mut record = Record::new();
    for (name, item) in items {
        let info = fields.get(name).ok_or_else(|| ProvarcError::UnknownField {
            entity_type: entity_type.to_string(),
            field: name.clone(),
        })?;
        let decoded = match &info.convert_type {
            Some(tag) => convert_scalar(item, tag)?,
            None => deserialize_plain(item),
        };
        record.set(name.clone(), decoded);
    }
    Ok(record)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};
    use serde_json::json;

    fn sample_time() -> AttributeValue {
        let tz = FixedOffset::west_opt(5 * 3600).unwrap();
        AttributeValue::timestamp(
            tz.with_ymd_and_hms(2014, 3, 2, 7, 30, 15).single().unwrap()
                + chrono::Duration::microseconds(42),
        )
    }

    #[test]
    fn timestamp_is_written_as_utc_string() {
        let (value, marker) = serialize_value(&sample_time());
        assert_eq!(value, json!("2014-03-02T12:30:15.000042"));
        assert_eq!(marker, json!("date"));
    }

    #[test]
    fn plain_scalars_have_null_marker() {
        for v in [
            AttributeValue::Null,
            AttributeValue::Bool(true),
            AttributeValue::Integer(-3),
            AttributeValue::Float(2.5),
            AttributeValue::text("x"),
        ] {
            let (_, marker) = serialize_value(&v);
            assert!(marker.is_null(), "{v:?}");
        }
    }

    #[test]
    fn nested_structures_round_trip() {
        let mut inner = AttributeMap::new();
        inner.insert("when".into(), sample_time());
        inner.insert("count".into(), AttributeValue::Integer(4));

        let mut map = AttributeMap::new();
        map.insert("inner".into(), AttributeValue::Map(inner));
        map.insert(
            "series".into(),
            AttributeValue::List(vec![
                AttributeValue::Float(1.0),
                sample_time(),
                AttributeValue::Null,
            ]),
        );
        map.insert("plain".into(), AttributeValue::List(vec![1_i64.into()]));

        let (value, marker) = serialize_map(&map);
        assert_eq!(
            marker,
            json!({"inner": {"when": "date"}, "series": [null, "date", null]})
        );
        assert_eq!(deserialize_map(&value, &marker).unwrap(), map);
    }

    #[test]
    fn non_finite_floats_round_trip() {
        for f in [f64::INFINITY, f64::NEG_INFINITY] {
            let (value, marker) = serialize_value(&AttributeValue::Float(f));
            assert_eq!(marker, json!("float"));
            assert_eq!(
                deserialize_value(&value, &marker).unwrap(),
                AttributeValue::Float(f)
            );
        }

        let (value, marker) = serialize_value(&AttributeValue::Float(f64::NAN));
        assert_eq!(value, json!("nan"));
        match deserialize_value(&value, &marker).unwrap() {
            AttributeValue::Float(f) => assert!(f.is_nan()),
            other => panic!("expected float, got {other:?}"),
        }
    }

    #[test]
    fn float_stays_float() {
        let (value, marker) = serialize_value(&AttributeValue::Float(3.0));
        let text = serde_json::to_string(&value).unwrap();
        let reparsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            deserialize_value(&reparsed, &marker).unwrap(),
            AttributeValue::Float(3.0)
        );
    }

    #[test]
    fn unknown_marker_is_rejected() {
        let err = deserialize_value(&json!("x"), &json!("complex")).unwrap_err();
        assert!(matches!(err, ProvarcError::UnknownConversionMarker(m) if m == "complex"));
    }

    #[test]
    fn bad_timestamp_is_a_serialization_error() {
        let err = deserialize_value(&json!("yesterday"), &json!("date")).unwrap_err();
        assert!(matches!(err, ProvarcError::Serialization(_)));
    }

    #[test]
    fn records_use_field_info_conversions() {
        let mut fields = BTreeMap::new();
        fields.insert("uuid".to_string(), FieldInfo::default());
        fields.insert(
            "ctime".to_string(),
            FieldInfo {
                convert_type: Some("date".into()),
                ..FieldInfo::default()
            },
        );

        let record = Record::new()
            .with("uuid", "abc")
            .with("ctime", sample_time())
            .with("secret", "dropped");
        let value = serialize_record(&record, &fields);
        assert_eq!(
            value,
            json!({"ctime": "2014-03-02T12:30:15.000042", "uuid": "abc"})
        );

        let back = deserialize_record("node", &value, &fields).unwrap();
        assert_eq!(back.get("ctime"), Some(&sample_time()));
        assert_eq!(back.text("uuid"), Some("abc"));

        let err = deserialize_record("node", &json!({"color": "red"}), &fields).unwrap_err();
        assert!(matches!(err, ProvarcError::UnknownField { .. }));
    }
}
