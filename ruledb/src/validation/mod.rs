use crate::caller::CallerContext;
use crate::error::{Result, ValidationErrors};
use crate::record::{format_date, parse_date};
use crate::schema::{Collection, Field, FieldType};
use crate::util::ID_LENGTH;
use regex::Regex;
use serde_json::{Map, Value};

/// Whether a payload creates a record or patches an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Create,
    Update,
}

/// System fields a payload may set on an auth record.
const AUTH_WRITABLE: &[&str] = &["username", "email", "email_visibility", "verified"];

/// Auth system fields only an admin may set.
const AUTH_ADMIN_ONLY: &[&str] = &["verified"];

/// Reject payload keys the caller may not write. Runs alongside
/// `validate_and_prepare`, before any rule is evaluated.
pub fn check_privileged_fields(
    collection: &Collection,
    payload: &Map<String, Value>,
    caller: &CallerContext,
) -> Result<()> {
    if !collection.is_auth() || caller.is_admin() {
        return Ok(());
    }
    let mut errors = ValidationErrors::new();
    for key in AUTH_ADMIN_ONLY {
        if payload.contains_key(*key) {
            errors.add(*key, "can only be changed by an admin");
        }
    }
    errors.into_result()
}

/// Validate a payload against a collection and return the normalized values
/// to store. On create, missing optional fields are filled with null.
///
/// Checks run in a fixed order (unknown fields, then per-field type and
/// option checks, then required fields) and every failing field is reported.
pub fn validate_and_prepare(
    collection: &Collection,
    payload: &Map<String, Value>,
    mode: Mode,
) -> Result<Map<String, Value>> {
    let mut errors = ValidationErrors::new();
    let mut prepared = Map::new();

    for (key, value) in payload {
        if key == "id" {
            if mode == Mode::Update {
                errors.add("id", "cannot be changed");
            } else if !is_valid_record_id(value) {
                errors.add("id", format!("must be {ID_LENGTH} lowercase letters or digits"));
            }
            continue;
        }
        if collection.is_auth() && AUTH_WRITABLE.contains(&key.as_str()) {
            match validate_auth_field(key, value) {
                Ok(v) => {
                    prepared.insert(key.clone(), v);
                }
                Err(message) => errors.add(key.clone(), message),
            }
            continue;
        }
        let Some(field) = collection.field(key) else {
            if collection.is_system_field(key) {
                errors.add(key.clone(), "is read-only");
            } else {
                errors.add(key.clone(), "unknown field");
            }
            continue;
        };
        match validate_field_value(field, value) {
            Ok(v) => {
                prepared.insert(key.clone(), v);
            }
            Err(message) => errors.add(key.clone(), message),
        }
    }

    for field in &collection.fields {
        let present = prepared.get(&field.name);
        let blank = present.map_or(true, is_blank);
        let checked = match mode {
            Mode::Create => true,
            Mode::Update => payload.contains_key(&field.name),
        };
        if field.required && checked && blank && errors.get(&field.name).is_none() {
            errors.add(field.name.clone(), "is required");
        }
        if mode == Mode::Create && present.is_none() {
            prepared.insert(field.name.clone(), Value::Null);
        }
    }

    errors.into_result()?;
    Ok(prepared)
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn is_valid_record_id(value: &Value) -> bool {
    value.as_str().is_some_and(|id| {
        id.len() == ID_LENGTH
            && id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    })
}

fn validate_auth_field(key: &str, value: &Value) -> std::result::Result<Value, String> {
    match key {
        "email_visibility" | "verified" => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::Null => Ok(Value::Bool(false)),
            other => Err(format!("expected boolean, got {}", type_name(other))),
        },
        "email" => match value {
            Value::Null => Ok(Value::Null),
            Value::String(s) if s.is_empty() => Ok(Value::Null),
            Value::String(s) => {
                let valid = s
                    .split_once('@')
                    .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
                if valid {
                    Ok(Value::String(s.to_ascii_lowercase()))
                } else {
                    Err("must be a valid email address".into())
                }
            }
            other => Err(format!("expected string, got {}", type_name(other))),
        },
        _ => match value {
            Value::Null => Ok(Value::Null),
            Value::String(s) if s.len() >= 3 && s.len() <= 150 => Ok(value.clone()),
            Value::String(_) => Err("must be between 3 and 150 characters".into()),
            other => Err(format!("expected string, got {}", type_name(other))),
        },
    }
}

fn validate_field_value(field: &Field, value: &Value) -> std::result::Result<Value, String> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    let options = &field.options;

    match field.field_type {
        FieldType::Text => {
            let s = expect_string(value)?;
            if s.is_empty() {
                return Ok(Value::String(String::new()));
            }
            let len = s.chars().count() as f64;
            if options.min.is_some_and(|min| len < min) {
                return Err(format!("must be at least {} characters", options.min.unwrap_or(0.0)));
            }
            if options.max.is_some_and(|max| len > max) {
                return Err(format!("must be at most {} characters", options.max.unwrap_or(0.0)));
            }
            if let Some(pattern) = &options.pattern {
                let re = Regex::new(pattern).map_err(|_| "invalid pattern".to_string())?;
                if !re.is_match(s) {
                    return Err(format!("does not match pattern {pattern}"));
                }
            }
            Ok(value.clone())
        }
        FieldType::Number => {
            let n = value
                .as_f64()
                .ok_or_else(|| format!("expected number, got {}", type_name(value)))?;
            if options.min.is_some_and(|min| n < min) {
                return Err(format!("must be at least {}", options.min.unwrap_or(0.0)));
            }
            if options.max.is_some_and(|max| n > max) {
                return Err(format!("must be at most {}", options.max.unwrap_or(0.0)));
            }
            Ok(value.clone())
        }
        FieldType::Bool => match value {
            Value::Bool(_) => Ok(value.clone()),
            other => Err(format!("expected boolean, got {}", type_name(other))),
        },
        FieldType::Date => {
            let s = expect_string(value)?;
            if s.is_empty() {
                return Ok(Value::Null);
            }
            parse_date(s)
                .map(|dt| Value::String(format_date(dt)))
                .ok_or_else(|| format!("invalid date '{s}'"))
        }
        FieldType::Json => Ok(value.clone()),
        FieldType::File => {
            let s = expect_string(value)?;
            if s.contains('/') || s.contains('\\') || s == "." || s == ".." {
                return Err("invalid file name".into());
            }
            Ok(value.clone())
        }
        FieldType::Relation => {
            let s = expect_string(value)?;
            if s.is_empty() {
                return Ok(Value::Null);
            }
            Ok(value.clone())
        }
        FieldType::Select => {
            let s = expect_string(value)?;
            if s.is_empty() {
                return Ok(Value::Null);
            }
            if !options.values.iter().any(|v| v == s) {
                return Err(format!(
                    "value '{s}' is not one of: {}",
                    options.values.join(", ")
                ));
            }
            Ok(value.clone())
        }
    }
}

fn expect_string(value: &Value) -> std::result::Result<&str, String> {
    value
        .as_str()
        .ok_or_else(|| format!("expected string, got {}", type_name(value)))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuleDbError;
    use crate::schema::parse_collection_str;
    use serde_json::json;

    fn posts() -> Collection {
        parse_collection_str(
            r#"
name: posts
fields:
  - { name: title, type: text, required: true, options: { min: 2, max: 10 } }
  - { name: slug, type: text, options: { pattern: "^[a-z-]+$" } }
  - { name: score, type: number, options: { min: 0, max: 5 } }
  - { name: published, type: bool }
  - { name: status, type: select, options: { values: [draft, live] } }
  - { name: due, type: date }
  - { name: meta, type: json }
  - { name: author, type: relation, options: { collection_id: users } }
"#,
        )
        .unwrap()
    }

    fn payload(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn errors(result: Result<Map<String, Value>>) -> ValidationErrors {
        match result {
            Err(RuleDbError::Validation(e)) => e,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_create_fills_missing_fields() {
        let prepared = validate_and_prepare(
            &posts(),
            &payload(json!({"title": "Hello", "due": "2024-05-06", "meta": {"k": 1}})),
            Mode::Create,
        )
        .unwrap();
        assert_eq!(prepared["due"], json!("2024-05-06 00:00:00.000Z"));
        assert_eq!(prepared["score"], Value::Null);
        assert_eq!(prepared["meta"], json!({"k": 1}));
    }

    #[test]
    fn test_every_failing_field_is_reported() {
        let e = errors(validate_and_prepare(
            &posts(),
            &payload(json!({
                "title": "x",
                "slug": "Not Valid",
                "score": 9,
                "published": "yes",
                "status": "gone",
                "due": "someday",
                "extra": 1,
                "created": "2024-01-01"
            })),
            Mode::Create,
        ));
        assert_eq!(e.get("title"), Some("must be at least 2 characters"));
        assert!(e.get("slug").unwrap().contains("pattern"));
        assert_eq!(e.get("score"), Some("must be at most 5"));
        assert_eq!(e.get("published"), Some("expected boolean, got string"));
        assert!(e.get("status").unwrap().contains("draft, live"));
        assert!(e.get("due").is_some());
        assert_eq!(e.get("extra"), Some("unknown field"));
        assert_eq!(e.get("created"), Some("is read-only"));
    }

    #[test]
    fn test_required_on_create_only_when_absent() {
        let e = errors(validate_and_prepare(&posts(), &payload(json!({})), Mode::Create));
        assert_eq!(e.get("title"), Some("is required"));

        let patch = validate_and_prepare(&posts(), &payload(json!({"score": 1})), Mode::Update).unwrap();
        assert!(!patch.contains_key("title"));

        let e = errors(validate_and_prepare(&posts(), &payload(json!({"title": ""})), Mode::Update));
        assert_eq!(e.get("title"), Some("is required"));
    }

    #[test]
    fn test_custom_id() {
        let ok = validate_and_prepare(
            &posts(),
            &payload(json!({"id": "abcdefghij12345", "title": "Hi"})),
            Mode::Create,
        );
        assert!(ok.is_ok());
        let e = errors(validate_and_prepare(
            &posts(),
            &payload(json!({"id": "BAD", "title": "Hi"})),
            Mode::Create,
        ));
        assert!(e.get("id").is_some());
        let e = errors(validate_and_prepare(&posts(), &payload(json!({"id": "abcdefghij12345"})), Mode::Update));
        assert_eq!(e.get("id"), Some("cannot be changed"));
    }

    #[test]
    fn test_auth_fields() {
        let mut users = parse_collection_str("name: users\ntype: auth\n").unwrap();
        users.id = "c_users".into();
        let prepared = validate_and_prepare(
            &users,
            &payload(json!({"email": "Bob@Example.com", "username": "bob", "email_visibility": true})),
            Mode::Create,
        )
        .unwrap();
        assert_eq!(prepared["email"], json!("bob@example.com"));

        let e = errors(validate_and_prepare(&users, &payload(json!({"email": "nope"})), Mode::Create));
        assert!(e.get("email").is_some());
    }

    #[test]
    fn test_verified_is_admin_only() {
        let users = parse_collection_str("name: users\ntype: auth\n").unwrap();
        let forged = payload(json!({"username": "mallory", "verified": true}));

        match check_privileged_fields(&users, &forged, &CallerContext::Guest) {
            Err(RuleDbError::Validation(e)) => {
                assert_eq!(e.get("verified"), Some("can only be changed by an admin"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        assert!(check_privileged_fields(&users, &forged, &CallerContext::Admin).is_ok());
        assert!(check_privileged_fields(
            &users,
            &payload(json!({"username": "mallory", "email_visibility": true})),
            &CallerContext::Guest
        )
        .is_ok());
        // Only auth collections carry the flag.
        assert!(check_privileged_fields(&posts(), &forged, &CallerContext::Guest).is_ok());
    }
}
