use super::query::{fetch_record, record_matches, select_records};
use crate::caller::{AuthRecord, CallerContext};
use crate::error::{Result, RuleDbError, ValidationErrors};
use crate::files::record_prefix;
use crate::realtime::{Action, ChangeEvent};
use crate::record::Record;
use crate::rules::{compile_rule, Predicate, RequestInfo, SqlFragment};
use crate::schema::{Collection, FieldType, Operation, Schema};
use crate::util::{new_id, now_timestamp, quote_ident};
use crate::validation::{check_privileged_fields, validate_and_prepare, Mode};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::{Map, Value as JsonValue};
use std::collections::{BTreeMap, HashSet};

/// Files to remove once the transaction has committed.
#[derive(Debug, Default)]
pub(crate) struct FileCleanup {
    pub prefixes: Vec<String>,
    pub keys: Vec<String>,
}

fn read_only(collection: &Collection) -> Result<()> {
    if collection.is_view() {
        return Err(RuleDbError::RuleDenied(format!(
            "view collection '{}' is read-only",
            collection.name
        )));
    }
    Ok(())
}

fn not_found(collection: &Collection, id: &str) -> RuleDbError {
    RuleDbError::NotFound {
        collection: collection.name.clone(),
        id: id.to_string(),
    }
}

/// Evaluate `predicate` against a record that is not (or not yet) stored,
/// by exposing its values as a one-row CTE under the collection alias.
pub(crate) fn snapshot_matches(
    conn: &Connection,
    collection: &Collection,
    record: &Record,
    predicate: &Predicate,
) -> Result<bool> {
    match predicate.condition.sql.as_str() {
        "1" if predicate.joins.is_empty() => return Ok(true),
        "0" => return Ok(false),
        _ => {}
    }
    let columns = collection.columns();
    let names: Vec<String> = columns.iter().map(|c| quote_ident(&c.name)).collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    let joins = predicate.joins_sql();
    let sql = format!(
        "WITH \"_subject\"({}) AS (VALUES ({placeholders})) SELECT 1 FROM \"_subject\" AS {} {joins} WHERE {} LIMIT 1",
        names.join(", "),
        quote_ident(&collection.name),
        predicate.condition.sql
    );
    log::debug!("{sql}");
    let params = record
        .column_values(collection)
        .into_iter()
        .chain(predicate.condition.params.iter().cloned());
    let found = conn
        .query_row(&sql, params_from_iter(params), |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

/// Relation targets must exist and unique values must be free.
fn check_references_and_uniqueness(
    conn: &Connection,
    schema: &Schema,
    collection: &Collection,
    id: &str,
    values: &Map<String, JsonValue>,
) -> Result<()> {
    let mut errors = ValidationErrors::new();

    for field in &collection.fields {
        let Some(value) = values.get(&field.name).and_then(JsonValue::as_str) else {
            continue;
        };
        if field.field_type == FieldType::Relation {
            let Some(target) = schema.relation_target(field) else {
                errors.add(field.name.clone(), "relation target does not exist");
                continue;
            };
            let exists = conn
                .query_row(
                    &format!("SELECT 1 FROM {} WHERE \"id\" = ?1", quote_ident(&target.name)),
                    params![value],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if !exists {
                errors.add(field.name.clone(), format!("related record '{value}' not found"));
            }
        }
    }

    let mut unique: Vec<&str> = collection
        .fields
        .iter()
        .filter(|f| f.unique)
        .map(|f| f.name.as_str())
        .collect();
    if collection.is_auth() {
        unique.extend(["username", "email"]);
    }
    for name in unique {
        let Some(value) = values.get(name).filter(|v| !v.is_null()) else {
            continue;
        };
        let value = crate::record::json_to_sql(value);
        let taken = conn
            .query_row(
                &format!(
                    "SELECT 1 FROM {} WHERE {} = ?1 AND \"id\" != ?2 LIMIT 1",
                    quote_ident(&collection.name),
                    quote_ident(name)
                ),
                params![value, id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if taken {
            errors.add(name, "value must be unique");
        }
    }

    errors.into_result()
}

fn payload_object(payload: &JsonValue) -> Result<&Map<String, JsonValue>> {
    payload.as_object().ok_or_else(|| {
        RuleDbError::Validation(ValidationErrors::single("payload", "must be a JSON object"))
    })
}

pub(crate) fn create(
    conn: &Connection,
    schema: &Schema,
    collection: &Collection,
    caller: &CallerContext,
    payload: &JsonValue,
    events: &mut Vec<ChangeEvent>,
) -> Result<Record> {
    read_only(collection)?;
    let payload = payload_object(payload)?;
    check_privileged_fields(collection, payload, caller)?;
    let mut data = validate_and_prepare(collection, payload, Mode::Create)?;
    let id = payload
        .get("id")
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .unwrap_or_else(new_id);
    check_references_and_uniqueness(conn, schema, collection, &id, &data)?;

    let now = now_timestamp();
    data.insert("created".into(), JsonValue::String(now.clone()));
    data.insert("updated".into(), JsonValue::String(now));
    if collection.is_auth() {
        for flag in ["email_visibility", "verified"] {
            data.entry(flag).or_insert(JsonValue::Bool(false));
        }
    }
    let record = Record {
        collection_id: collection.id.clone(),
        collection_name: collection.name.clone(),
        id,
        data,
        expand: BTreeMap::new(),
    };

    let rule = compile_rule(
        schema,
        collection,
        &collection.name,
        Operation::Create,
        RequestInfo {
            caller,
            data: Some(payload),
        },
    )?;
    if !snapshot_matches(conn, collection, &record, &rule)? {
        return Err(RuleDbError::RuleDenied(format!(
            "create on '{}' is not allowed",
            collection.name
        )));
    }

    let columns = collection.columns();
    let names: Vec<String> = columns.iter().map(|c| quote_ident(&c.name)).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(&collection.name),
        names.join(", "),
        vec!["?"; columns.len()].join(", ")
    );
    conn.execute(&sql, params_from_iter(record.column_values(collection)))
        .map_err(RuleDbError::from_write)?;

    let stored = fetch_record(conn, collection, Predicate::allow_all(), &record.id)?
        .ok_or_else(|| not_found(collection, &record.id))?;
    events.push(ChangeEvent::new(Action::Create, stored.clone()));
    log::debug!("created {}/{}", collection.name, stored.id);
    Ok(stored)
}

/// Load a record for a write: it must be visible to the caller, then the
/// write rule must hold for the stored row.
fn load_for_write(
    conn: &Connection,
    schema: &Schema,
    collection: &Collection,
    caller: &CallerContext,
    id: &str,
    op: Operation,
    data: Option<&Map<String, JsonValue>>,
) -> Result<Record> {
    let view = compile_rule(
        schema,
        collection,
        &collection.name,
        Operation::View,
        RequestInfo { caller, data: None },
    )?;
    let existing = fetch_record(conn, collection, view, id)?.ok_or_else(|| not_found(collection, id))?;

    let rule = compile_rule(schema, collection, &collection.name, op, RequestInfo { caller, data })?;
    if !record_matches(conn, collection, rule, id)? {
        return Err(RuleDbError::RuleDenied(format!(
            "{} on '{}/{id}' is not allowed",
            op.as_str(),
            collection.name
        )));
    }
    Ok(existing)
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn update(
    conn: &Connection,
    schema: &Schema,
    collection: &Collection,
    caller: &CallerContext,
    id: &str,
    payload: &JsonValue,
    events: &mut Vec<ChangeEvent>,
    cleanup: &mut FileCleanup,
) -> Result<Record> {
    read_only(collection)?;
    let payload = payload_object(payload)?;
    check_privileged_fields(collection, payload, caller)?;
    let changes = validate_and_prepare(collection, payload, Mode::Update)?;
    check_references_and_uniqueness(conn, schema, collection, id, &changes)?;
    let existing = load_for_write(
        conn,
        schema,
        collection,
        caller,
        id,
        Operation::Update,
        Some(payload),
    )?;

    for field in collection.fields.iter().filter(|f| f.field_type == FieldType::File) {
        let old = existing.get_str(&field.name);
        let new = changes.get(&field.name).map(|v| v.as_str());
        if let (Some(old), Some(new)) = (old, new) {
            if new != Some(old) {
                cleanup
                    .keys
                    .push(crate::files::file_key(&collection.id, id, old));
            }
        }
    }

    let mut record = existing;
    for (key, value) in changes {
        record.data.insert(key, value);
    }
    record
        .data
        .insert("updated".into(), JsonValue::String(now_timestamp()));

    let columns: Vec<_> = collection
        .columns()
        .into_iter()
        .filter(|c| c.name != "id" && c.name != "created")
        .collect();
    let assignments: Vec<String> = columns
        .iter()
        .map(|c| format!("{} = ?", quote_ident(&c.name)))
        .collect();
    let mut values: Vec<SqlValue> = columns
        .iter()
        .map(|c| match record.data.get(&c.name) {
            Some(value) => crate::record::to_column_value(c.field_type, value),
            None => SqlValue::Null,
        })
        .collect();
    values.push(SqlValue::Text(id.to_string()));
    let sql = format!(
        "UPDATE {} SET {} WHERE \"id\" = ?",
        quote_ident(&collection.name),
        assignments.join(", ")
    );
    conn.execute(&sql, params_from_iter(values))
        .map_err(RuleDbError::from_write)?;

    let stored = fetch_record(conn, collection, Predicate::allow_all(), id)?
        .ok_or_else(|| not_found(collection, id))?;
    events.push(ChangeEvent::new(Action::Update, stored.clone()));
    Ok(stored)
}

pub(crate) fn delete(
    conn: &Connection,
    schema: &Schema,
    collection: &Collection,
    caller: &CallerContext,
    id: &str,
    events: &mut Vec<ChangeEvent>,
    cleanup: &mut FileCleanup,
) -> Result<()> {
    read_only(collection)?;
    let existing = load_for_write(conn, schema, collection, caller, id, Operation::Delete, None)?;
    let mut visited = HashSet::new();
    delete_cascade(conn, schema, collection, existing, events, cleanup, &mut visited)
}

/// Delete a record after resolving everything that points at it: cascading
/// relations are deleted, optional ones cleared, required ones block.
fn delete_cascade(
    conn: &Connection,
    schema: &Schema,
    collection: &Collection,
    record: Record,
    events: &mut Vec<ChangeEvent>,
    cleanup: &mut FileCleanup,
    visited: &mut HashSet<(String, String)>,
) -> Result<()> {
    if !visited.insert((collection.id.clone(), record.id.clone())) {
        return Ok(());
    }

    for (owner, field) in schema.referencing_fields(&collection.id) {
        if owner.is_view() {
            continue;
        }
        let alias = owner.name.as_str();
        let refs = Predicate {
            condition: SqlFragment {
                sql: format!("{}.{} = ?", quote_ident(alias), quote_ident(&field.name)),
                params: vec![SqlValue::Text(record.id.clone())],
            },
            joins: Vec::new(),
        };
        let referencing = select_records(conn, &owner, alias, &refs, &SqlFragment::default())?;
        let referencing: Vec<Record> = referencing
            .into_iter()
            .filter(|r| !visited.contains(&(owner.id.clone(), r.id.clone())))
            .collect();
        if referencing.is_empty() {
            continue;
        }

        if field.options.cascade_delete {
            for child in referencing {
                delete_cascade(conn, schema, &owner, child, events, cleanup, visited)?;
            }
        } else if field.required {
            return Err(RuleDbError::Validation(ValidationErrors::single(
                format!("{}.{}", owner.name, field.name),
                format!(
                    "{} record(s) still reference {}/{}",
                    referencing.len(),
                    collection.name,
                    record.id
                ),
            )));
        } else {
            let now = now_timestamp();
            for child in referencing {
                conn.execute(
                    &format!(
                        "UPDATE {} SET {} = NULL, \"updated\" = ?1 WHERE \"id\" = ?2",
                        quote_ident(&owner.name),
                        quote_ident(&field.name)
                    ),
                    params![now, child.id],
                )?;
                if let Some(updated) = fetch_record(conn, &owner, Predicate::allow_all(), &child.id)? {
                    events.push(ChangeEvent::new(Action::Update, updated));
                }
            }
        }
    }

    conn.execute(
        &format!("DELETE FROM {} WHERE \"id\" = ?1", quote_ident(&collection.name)),
        params![record.id],
    )?;
    cleanup
        .prefixes
        .push(record_prefix(&collection.id, &record.id));
    log::debug!("deleted {}/{}", collection.name, record.id);
    events.push(ChangeEvent::new(Action::Delete, record));
    Ok(())
}

/// Load an auth record as a caller identity.
pub(crate) fn load_auth_record(
    conn: &Connection,
    schema: &Schema,
    collection: &str,
    id: &str,
) -> Result<Option<AuthRecord>> {
    let collection = schema.get(collection)?;
    if !collection.is_auth() {
        return Err(RuleDbError::Schema(format!(
            "'{}' is not an auth collection",
            collection.name
        )));
    }
    let record = fetch_record(conn, collection, Predicate::allow_all(), id)?;
    Ok(record.map(|r| AuthRecord {
        collection_id: r.collection_id,
        collection_name: r.collection_name,
        id: r.id,
        data: r.data,
    }))
}
