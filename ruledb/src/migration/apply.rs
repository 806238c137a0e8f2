use super::ddl;
use super::{describe_changes, diff_collection, AppliedMigration, ApplyOptions, SchemaChange};
use crate::error::{Result, RuleDbError, ValidationErrors};
use crate::rules;
use crate::schema::{
    normalize_collection, parse_schema_str, validate_collection, Collection, Field, FieldType,
    Schema, SchemaFile,
};
use crate::system_db::{
    append_ledger, collection_checksum, delete_collection_row, find_by_checksum, find_by_name,
    load_schema, upsert_collection, LedgerEntry,
};
use crate::util::{new_id, sha256_hex};
use rusqlite::Connection;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// What happened to one collection of an applied definition.
#[derive(Debug, Clone)]
pub(crate) struct CollectionOutcome {
    pub collection: Collection,
    pub changes: Vec<SchemaChange>,
    pub checksum: String,
    pub skipped: bool,
}

/// A migration step file.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStep {
    /// File stem, recorded as the ledger name.
    pub name: String,
    pub checksum: String,
    #[serde(skip)]
    pub path: PathBuf,
    #[serde(skip)]
    pub file: SchemaFile,
}

/// Result of running one migration step.
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub name: String,
    pub skipped: bool,
    pub changes: Vec<SchemaChange>,
    pub ledger: Option<LedgerEntry>,
}

/// Read the `*.yaml`/`*.yml` step files of `dir`, ordered by file name.
pub fn load_steps(dir: &Path) -> Result<Vec<MigrationStep>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        if path.is_file() && is_yaml {
            paths.push(path);
        }
    }
    paths.sort();

    let mut steps = Vec::new();
    for path in paths {
        let content = std::fs::read_to_string(&path)?;
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| RuleDbError::Schema(format!("invalid step file name {}", path.display())))?
            .to_string();
        let file = parse_schema_str(&content)
            .map_err(|e| RuleDbError::Schema(format!("{}: {e}", path.display())))?;
        steps.push(MigrationStep {
            name,
            checksum: sha256_hex(&[&content]),
            path,
            file,
        });
    }
    Ok(steps)
}

/// View collections may leave columns of their query undeclared; those are
/// exposed as text fields.
fn infer_view_fields(conn: &Connection, mut def: Collection) -> Result<Collection> {
    let Some(query) = def.view_query.clone() else {
        return Ok(def);
    };
    let columns = ddl::query_columns(conn, &query).map_err(|e| {
        RuleDbError::Validation(ValidationErrors::single("view_query", e.to_string()))
    })?;
    for column in columns {
        if def.is_system_field(&column) || def.field(&column).is_some() {
            continue;
        }
        def.fields.push(Field::new(&column, FieldType::Text));
    }
    Ok(def)
}

/// Rules of other collections must keep compiling against the new schema,
/// e.g. after a field they reference was renamed away.
fn check_dependent_rules(schema: &Schema, changed: &Collection) -> Result<()> {
    for collection in schema.collections() {
        if collection.id == changed.id {
            continue;
        }
        for (op, rule) in collection.rules.iter() {
            let Some(rule) = rule else { continue };
            if let Err(e) = rules::check_rule(schema, collection, rule) {
                return Err(RuleDbError::SchemaConflict(format!(
                    "{} rule of '{}' would break: {e}",
                    op.as_str(),
                    collection.name
                )));
            }
        }
    }
    Ok(())
}

/// Apply one collection definition inside the migration transaction.
///
/// `working` is the schema the definition is resolved against: the stored
/// schema, plus the other collections of the same document when a whole file
/// is applied.
pub(crate) fn apply_collection(
    conn: &Connection,
    def: Collection,
    working: &Schema,
    options: ApplyOptions,
) -> Result<CollectionOutcome> {
    let stored = load_schema(conn)?;
    let def = if def.is_view() {
        infer_view_fields(conn, def)?
    } else {
        def
    };
    let def = normalize_collection(def, working);
    let old = stored.by_id(&def.id).cloned();

    if let Some(old) = &old {
        if old.kind != def.kind {
            return Err(RuleDbError::SchemaConflict(format!(
                "cannot change the type of '{}' from {} to {}",
                old.name,
                old.kind.as_str(),
                def.kind.as_str()
            )));
        }
    }

    let target = working.with_collection(def.clone());
    validate_collection(&def, &target)?;
    check_dependent_rules(&target, &def)?;

    let previous = collection_checksum(conn, &def.id)?.unwrap_or_default();
    let canonical = serde_json::to_string(&def)?;
    let checksum = sha256_hex(&[&previous, &canonical]);

    let changes = diff_collection(old.as_deref(), &def);
    if changes.is_empty() || find_by_checksum(conn, &checksum)?.is_some() {
        log::debug!("collection '{}' is up to date", def.name);
        return Ok(CollectionOutcome {
            collection: def,
            changes: Vec::new(),
            checksum,
            skipped: true,
        });
    }

    ddl::drop_views(conn, &stored)?;
    if !def.is_view() {
        match &old {
            None => ddl::create_table(conn, &def, &def.name)?,
            Some(old) if changes.iter().any(SchemaChange::requires_rebuild) => {
                ddl::rebuild_table(conn, old, &def, options)?
            }
            Some(old) => {
                if old.name != def.name {
                    ddl::rename_table(conn, &old.name, &def.name)?;
                }
                for change in &changes {
                    if let SchemaChange::FieldAdded { field, .. } = change {
                        ddl::add_column(conn, &def, field)?;
                    }
                }
            }
        }
        ddl::reindex(conn, &def)?;
    }
    upsert_collection(conn, &def, &checksum)?;
    ddl::create_views(conn, &load_schema(conn)?)?;

    log::info!("applied '{}': {}", def.name, describe_changes(&changes));
    Ok(CollectionOutcome {
        collection: def,
        changes,
        checksum,
        skipped: false,
    })
}

/// Apply a single definition and record it in the ledger.
pub(crate) fn apply_definition(
    conn: &Connection,
    def: Collection,
    options: ApplyOptions,
) -> Result<AppliedMigration> {
    let stored = load_schema(conn)?;
    let outcome = apply_collection(conn, def, &stored, options)?;
    ledger_outcome(conn, outcome)
}

/// Apply every collection of a document, then its deletions.
///
/// All collections of the document are registered in the working schema
/// up front so relations between them resolve regardless of order.
pub(crate) fn apply_file(
    conn: &Connection,
    file: SchemaFile,
    options: ApplyOptions,
) -> Result<Vec<CollectionOutcome>> {
    let mut working = load_schema(conn)?;
    let mut defs = Vec::new();
    for def in file.collections {
        let def = normalize_collection(def, &working);
        working = working.with_collection(def.clone());
        defs.push(def);
    }
    // Relation targets named after collections later in the document.
    let defs: Vec<Collection> = defs
        .into_iter()
        .map(|def| normalize_collection(def, &working))
        .collect();
    for def in &defs {
        working = working.with_collection(def.clone());
    }

    let mut outcomes = Vec::new();
    for def in defs {
        let outcome = apply_collection(conn, def, &working, options)?;
        working = working.with_collection(outcome.collection.clone());
        outcomes.push(outcome);
    }
    for name in file.delete {
        let removed = delete_collection(conn, &name)?;
        outcomes.push(CollectionOutcome {
            changes: vec![SchemaChange::CollectionRemoved {
                name: removed.name.clone(),
            }],
            checksum: String::new(),
            skipped: false,
            collection: removed,
        });
    }
    Ok(outcomes)
}

fn ledger_outcome(conn: &Connection, outcome: CollectionOutcome) -> Result<AppliedMigration> {
    let removed = outcome
        .changes
        .iter()
        .any(|c| matches!(c, SchemaChange::CollectionRemoved { .. }));
    let ledger = if outcome.skipped {
        None
    } else if removed {
        let checksum = sha256_hex(&["drop", &outcome.collection.id, &new_id()]);
        let name = format!("drop_{}_{}", outcome.collection.name, &checksum[..12]);
        Some(append_ledger(conn, &name, &checksum, &describe_changes(&outcome.changes))?)
    } else {
        let name = format!("apply_{}_{}", outcome.collection.name, &outcome.checksum[..12]);
        Some(append_ledger(
            conn,
            &name,
            &outcome.checksum,
            &describe_changes(&outcome.changes),
        )?)
    };
    Ok(AppliedMigration {
        collection: outcome.collection.name,
        changes: outcome.changes,
        skipped: outcome.skipped,
        ledger,
    })
}

/// Apply a whole schema document outside of a step file, with one ledger
/// entry per changed collection.
pub(crate) fn apply_document(
    conn: &Connection,
    file: SchemaFile,
    options: ApplyOptions,
) -> Result<Vec<AppliedMigration>> {
    apply_file(conn, file, options)?
        .into_iter()
        .map(|outcome| ledger_outcome(conn, outcome))
        .collect()
}

/// Run one step file unless the ledger already has it.
pub(crate) fn apply_step(
    conn: &Connection,
    step: &MigrationStep,
    options: ApplyOptions,
) -> Result<StepOutcome> {
    if let Some(entry) = find_by_name(conn, &step.name)? {
        if entry.checksum != step.checksum {
            return Err(RuleDbError::SchemaConflict(format!(
                "migration '{}' was modified after it was applied",
                step.name
            )));
        }
        return Ok(StepOutcome {
            name: step.name.clone(),
            skipped: true,
            changes: Vec::new(),
            ledger: None,
        });
    }

    let outcomes = apply_file(conn, step.file.clone(), options)?;
    let changes: Vec<SchemaChange> = outcomes.into_iter().flat_map(|o| o.changes).collect();
    let entry = append_ledger(conn, &step.name, &step.checksum, &describe_changes(&changes))?;
    log::info!("migration '{}' applied (seq {})", step.name, entry.seq);
    Ok(StepOutcome {
        name: step.name.clone(),
        skipped: false,
        changes,
        ledger: Some(entry),
    })
}

/// Drop a collection with all of its records. Refused while another
/// collection still points at it.
pub(crate) fn delete_collection(conn: &Connection, name: &str) -> Result<Collection> {
    let stored = load_schema(conn)?;
    let collection = stored.get(name)?.clone();

    let blockers: Vec<String> = stored
        .referencing_fields(&collection.id)
        .into_iter()
        .filter(|(owner, _)| owner.id != collection.id)
        .map(|(owner, field)| format!("{}.{}", owner.name, field.name))
        .collect();
    if !blockers.is_empty() {
        return Err(RuleDbError::SchemaConflict(format!(
            "'{}' is still referenced by {}",
            collection.name,
            blockers.join(", ")
        )));
    }

    let views = crate::view::dependent_views(&stored, &collection.name);
    if !views.is_empty() {
        return Err(RuleDbError::SchemaConflict(format!(
            "'{}' is still used by view {}",
            collection.name,
            views.join(", ")
        )));
    }

    let remaining = stored.without_collection(&collection.id);
    check_dependent_rules(&remaining, &collection)?;

    ddl::drop_views(conn, &stored)?;
    ddl::drop_table(conn, &collection)?;
    delete_collection_row(conn, &collection.id)?;
    ddl::create_views(conn, &remaining)?;

    log::info!("dropped collection '{}'", collection.name);
    Ok((*collection).clone())
}

/// Delete a collection and record it in the ledger.
pub(crate) fn drop_collection(conn: &Connection, name: &str) -> Result<LedgerEntry> {
    let removed = delete_collection(conn, name)?;
    let change = SchemaChange::CollectionRemoved {
        name: removed.name.clone(),
    };
    let checksum = sha256_hex(&["drop", &removed.id, &new_id()]);
    append_ledger(
        conn,
        &format!("drop_{}_{}", removed.name, &checksum[..12]),
        &checksum,
        &change.describe(),
    )
}
