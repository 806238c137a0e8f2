use crate::schema::FieldType;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::{Number, Value as JsonValue};

/// Largest integer a f64 holds exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Bind an arbitrary JSON value, e.g. a macro value, as an SQL parameter.
pub fn json_to_sql(value: &JsonValue) -> SqlValue {
    match value {
        JsonValue::Null => SqlValue::Null,
        JsonValue::Bool(b) => SqlValue::Integer(i64::from(*b)),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        JsonValue::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Convert an already validated JSON value into its stored column form.
pub fn to_column_value(field_type: FieldType, value: &JsonValue) -> SqlValue {
    if value.is_null() {
        return SqlValue::Null;
    }
    match field_type {
        FieldType::Number => value.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        FieldType::Bool => SqlValue::Integer(i64::from(value.as_bool().unwrap_or(false))),
        FieldType::Json => SqlValue::Text(value.to_string()),
        _ => match value {
            JsonValue::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Text(other.to_string()),
        },
    }
}

/// Convert a stored column value into JSON according to the field type.
pub fn sql_to_json(field_type: FieldType, value: SqlValue) -> JsonValue {
    match (field_type, value) {
        (_, SqlValue::Null) => JsonValue::Null,
        (FieldType::Bool, SqlValue::Integer(i)) => JsonValue::Bool(i != 0),
        (FieldType::Bool, SqlValue::Real(f)) => JsonValue::Bool(f != 0.0),
        (FieldType::Json, SqlValue::Text(text)) => {
            serde_json::from_str(&text).unwrap_or(JsonValue::String(text))
        }
        (_, SqlValue::Integer(i)) => JsonValue::Number(i.into()),
        (_, SqlValue::Real(f)) => number_json(f),
        (_, SqlValue::Text(text)) => JsonValue::String(text),
        (_, SqlValue::Blob(bytes)) => JsonValue::String(String::from_utf8_lossy(&bytes).into_owned()),
    }
}

fn number_json(f: f64) -> JsonValue {
    if f.fract() == 0.0 && f.abs() <= MAX_SAFE_INTEGER {
        return JsonValue::Number((f as i64).into());
    }
    Number::from_f64(f).map(JsonValue::Number).unwrap_or(JsonValue::Null)
}

/// Render a timestamp in the stored format.
pub fn format_date(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S%.3fZ").to_string()
}

/// Parse RFC 3339 or `YYYY-MM-DD[ HH:MM:SS[.sss]][Z]` into a UTC timestamp.
pub fn parse_date(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc));
    }
    let naive = input.strip_suffix('Z').unwrap_or(input);
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(naive, format) {
            return Some(dt.and_utc());
        }
    }
    NaiveDate::parse_from_str(naive, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Losslessly convert a stored value to another field type's storage form.
/// `None` means the value cannot be represented in the new type.
pub fn cast_value(value: ValueRef<'_>, to: FieldType) -> Option<SqlValue> {
    let text = match value {
        ValueRef::Null => return Some(SqlValue::Null),
        ValueRef::Blob(_) => return None,
        ValueRef::Text(bytes) => Some(std::str::from_utf8(bytes).ok()?.to_string()),
        _ => None,
    };

    match to {
        FieldType::Number => match (value, text) {
            (ValueRef::Integer(i), _) => Some(SqlValue::Real(i as f64)),
            (ValueRef::Real(f), _) => Some(SqlValue::Real(f)),
            (_, Some(t)) if t.trim().is_empty() => Some(SqlValue::Null),
            (_, Some(t)) => t.trim().parse::<f64>().ok().filter(|f| f.is_finite()).map(SqlValue::Real),
            _ => None,
        },
        FieldType::Bool => match (value, text.as_deref().map(str::trim)) {
            (ValueRef::Integer(i @ (0 | 1)), _) => Some(SqlValue::Integer(i)),
            (ValueRef::Real(f), _) if f == 0.0 || f == 1.0 => Some(SqlValue::Integer(f as i64)),
            (_, Some("")) => Some(SqlValue::Null),
            (_, Some("true" | "1")) => Some(SqlValue::Integer(1)),
            (_, Some("false" | "0")) => Some(SqlValue::Integer(0)),
            _ => None,
        },
        FieldType::Date => match text.as_deref().map(str::trim) {
            Some("") => Some(SqlValue::Null),
            Some(t) => parse_date(t).map(|dt| SqlValue::Text(format_date(dt))),
            None => None,
        },
        FieldType::Json => match (value, text) {
            (_, Some(t)) => {
                if serde_json::from_str::<JsonValue>(&t).is_ok() {
                    Some(SqlValue::Text(t))
                } else {
                    Some(SqlValue::Text(JsonValue::String(t).to_string()))
                }
            }
            (ValueRef::Integer(i), None) => Some(SqlValue::Text(i.to_string())),
            (ValueRef::Real(f), None) => Some(SqlValue::Text(number_json(f).to_string())),
            _ => None,
        },
        FieldType::Text | FieldType::Select | FieldType::File | FieldType::Relation => {
            match (value, text) {
                (_, Some(t)) => Some(SqlValue::Text(t)),
                (ValueRef::Integer(i), None) => Some(SqlValue::Text(i.to_string())),
                (ValueRef::Real(f), None) => Some(SqlValue::Text(number_json(f).to_string())),
                _ => None,
            }
        }
    }
}
