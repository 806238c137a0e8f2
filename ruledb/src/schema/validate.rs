use super::types::{Collection, CollectionType, FieldType, Schema};
use crate::error::{Result, ValidationErrors};
use crate::rules;
use crate::util::new_id;
use crate::view;
use regex::Regex;
use std::collections::HashSet;

/// Names the record JSON reserves besides the system columns.
const RESERVED_FIELD_NAMES: &[&str] = &["collectionId", "collectionName", "expand"];

const MAX_IDENTIFIER_LEN: usize = 100;

/// Whether `name` may be used as a collection, field or index name.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    name.len() <= MAX_IDENTIFIER_LEN && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Fill in missing ids and resolve relation targets given by name.
///
/// Collections and fields without an id inherit the id of the stored
/// collection/field with the same name, so re-applying a hand-written
/// definition is a no-op instead of a drop-and-recreate.
pub fn normalize_collection(mut def: Collection, schema: &Schema) -> Collection {
    let stored = if def.id.is_empty() {
        schema.by_name(&def.name).cloned()
    } else {
        schema.by_id(&def.id).cloned()
    };
    if def.id.is_empty() {
        def.id = stored.as_ref().map(|c| c.id.clone()).unwrap_or_else(new_id);
    }

    for field in &mut def.fields {
        if field.id.is_empty() {
            field.id = stored
                .as_ref()
                .and_then(|c| c.field(&field.name))
                .map(|f| f.id.clone())
                .unwrap_or_else(new_id);
        }
    }

    let own_id = def.id.clone();
    let own_name = def.name.clone();
    for field in &mut def.fields {
        if field.field_type != FieldType::Relation {
            continue;
        }
        if let Some(target) = field.options.collection_id.clone() {
            if target == own_id || target.eq_ignore_ascii_case(&own_name) {
                field.options.collection_id = Some(own_id.clone());
            } else if let Some(found) = schema.find(&target) {
                field.options.collection_id = Some(found.id.clone());
            }
        }
    }

    def
}

/// Validate a normalized collection definition against the schema it will be
/// part of (`schema` already contains `def`).
pub fn validate_collection(def: &Collection, schema: &Schema) -> Result<()> {
    let mut errors = ValidationErrors::new();

    if !is_valid_identifier(&def.name) {
        errors.add(
            "name",
            "must start with a letter and contain only letters, digits and underscores",
        );
    } else if schema
        .collections()
        .iter()
        .any(|c| c.id != def.id && c.name.eq_ignore_ascii_case(&def.name))
    {
        errors.add("name", format!("collection '{}' already exists", def.name));
    }

    validate_kind(def, schema, &mut errors);
    validate_fields(def, schema, &mut errors);
    validate_indexes(def, &mut errors);

    if errors.is_empty() {
        for (op, rule) in def.rules.iter() {
            if let Some(rule) = rule {
                if let Err(e) = rules::check_rule(schema, def, rule) {
                    errors.add(format!("rules.{}", op.as_str()), e.to_string());
                }
            }
        }
    }

    errors.into_result()
}

fn validate_kind(def: &Collection, schema: &Schema, errors: &mut ValidationErrors) {
    match def.kind {
        CollectionType::View => {
            match def.view_query.as_deref().map(str::trim) {
                None | Some("") => errors.add("view_query", "view collections require a query"),
                Some(query) => {
                    if let Err(e) = view::analyze_view_query(&def.name, query, schema) {
                        errors.add("view_query", e.to_string());
                    }
                }
            }
            for op in ["create", "update", "delete"] {
                let set = match op {
                    "create" => def.rules.create.is_some(),
                    "update" => def.rules.update.is_some(),
                    _ => def.rules.delete.is_some(),
                };
                if set {
                    errors.add(format!("rules.{op}"), "view collections are read-only");
                }
            }
            if !def.indexes.is_empty() {
                errors.add("indexes", "view collections cannot have indexes");
            }
        }
        CollectionType::Base | CollectionType::Auth => {
            if def.view_query.is_some() {
                errors.add("view_query", "only view collections may define a query");
            }
        }
    }
}

fn validate_fields(def: &Collection, schema: &Schema, errors: &mut ValidationErrors) {
    let mut names = HashSet::new();
    let mut ids = HashSet::new();

    for field in &def.fields {
        let key = format!("fields.{}", field.name);

        if !is_valid_identifier(&field.name) {
            errors.add(key, "invalid field name");
            continue;
        }
        if def.is_system_field(&field.name) || RESERVED_FIELD_NAMES.contains(&field.name.as_str()) {
            errors.add(key, "name is reserved");
            continue;
        }
        if !names.insert(field.name.to_ascii_lowercase()) {
            errors.add(key, "duplicate field name");
            continue;
        }
        if !ids.insert(field.id.clone()) {
            errors.add(key, "duplicate field id");
            continue;
        }
        if def.is_view() && field.unique {
            errors.add(key, "view fields cannot be unique");
            continue;
        }

        match field.field_type {
            FieldType::Relation => match field.options.collection_id.as_deref() {
                None => errors.add(key, "relation fields require a target collection"),
                Some(target) => {
                    if target != def.id && schema.by_id(target).is_none() {
                        errors.add(key, format!("target collection '{target}' does not exist"));
                    }
                }
            },
            FieldType::Select => {
                if field.options.values.is_empty() {
                    errors.add(key, "select fields require at least one value");
                }
            }
            FieldType::Text => {
                if let Some(pattern) = &field.options.pattern {
                    if Regex::new(pattern).is_err() {
                        errors.add(key, "invalid pattern");
                    }
                }
            }
            _ => {}
        }

        if let (Some(min), Some(max)) = (field.options.min, field.options.max) {
            if min > max {
                errors.add(format!("fields.{}", field.name), "min must not exceed max");
            }
        }
    }
}

fn validate_indexes(def: &Collection, errors: &mut ValidationErrors) {
    let mut names = HashSet::new();
    for index in &def.indexes {
        let key = format!("indexes.{}", index.name);
        if !is_valid_identifier(&index.name) {
            errors.add(key, "invalid index name");
        } else if !names.insert(index.name.to_ascii_lowercase()) {
            errors.add(key, "duplicate index name");
        } else if index.columns.is_empty() {
            errors.add(key, "index requires at least one column");
        } else if let Some(missing) = index.columns.iter().find(|c| def.column_type(c).is_none()) {
            errors.add(key, format!("unknown column '{missing}'"));
        }
    }
}
