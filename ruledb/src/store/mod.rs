mod expand;
mod query;
mod records;

pub use query::{ListQuery, ListResult};
pub(crate) use records::{load_auth_record, snapshot_matches};

use crate::caller::CallerContext;
use crate::config::Config;
use crate::error::{Result, RuleDbError};
use crate::files::{FileStorage, LocalFileStorage};
use crate::migration::{self, AppliedMigration, ApplyOptions, StepOutcome};
use crate::realtime::Hub;
use crate::record::Record;
use crate::rules::{compile_rule, RequestInfo};
use crate::schema::{parse_schema_str, Collection, Operation, Schema, SchemaFile};
use crate::system_db::{load_schema, LedgerEntry, SystemDb};
use records::FileCleanup;
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The main entry point for ruledb.
/// Opens a data directory, owns the database gate and hands out collection
/// handles for access-controlled record operations.
pub struct Store {
    root: PathBuf,
    config: Config,
    db: Arc<SystemDb>,
    files: Arc<dyn FileStorage>,
}

impl Store {
    /// Open a store at the given data directory, creating it if needed.
    /// Reads `ruledb.yaml` from the directory when present.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        let config = Config::load_from_dir(&root)?;
        Self::open_with_config(root, config)
    }

    pub fn open_with_config(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        let db = SystemDb::open(&root.join(&config.db_file), &config)?;
        let files = Arc::new(LocalFileStorage::new(root.join("storage")));
        Ok(Store {
            root,
            config,
            db: Arc::new(db),
            files,
        })
    }

    /// Replace the file storage used for cleaning up file fields.
    pub fn with_file_storage(mut self, files: Arc<dyn FileStorage>) -> Self {
        self.files = files;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn files(&self) -> &Arc<dyn FileStorage> {
        &self.files
    }

    /// The current schema snapshot.
    pub fn schema(&self) -> Result<Arc<Schema>> {
        self.db.schema()
    }

    pub fn collections(&self) -> Result<Vec<Collection>> {
        Ok(self
            .schema()?
            .collections()
            .iter()
            .map(|c| (**c).clone())
            .collect())
    }

    pub fn ledger(&self) -> Result<Vec<LedgerEntry>> {
        self.db.ledger()
    }

    // ── Schema ────────────────────────────────────────────────────────

    /// Create or change one collection.
    pub fn apply_schema(&self, def: Collection, options: ApplyOptions) -> Result<AppliedMigration> {
        self.db
            .migrate(|tx| migration::apply_definition(tx, def, options))
    }

    /// Apply a schema document (collections to upsert, names to delete) in one
    /// transaction.
    pub fn apply_file(&self, file: SchemaFile, options: ApplyOptions) -> Result<Vec<AppliedMigration>> {
        self.db
            .migrate(|tx| migration::apply_document(tx, file, options))
    }

    pub fn apply_yaml(&self, yaml: &str, options: ApplyOptions) -> Result<Vec<AppliedMigration>> {
        self.apply_file(parse_schema_str(yaml)?, options)
    }

    /// Rename a field, keeping its values.
    pub fn rename_field(&self, collection: &str, from: &str, to: &str) -> Result<AppliedMigration> {
        self.db.migrate(|tx| {
            let stored = load_schema(tx)?;
            let mut def = (**stored.get(collection)?).clone();
            let field = def
                .fields
                .iter_mut()
                .find(|f| f.name == from)
                .ok_or_else(|| {
                    RuleDbError::Schema(format!("field '{from}' not found in '{collection}'"))
                })?;
            field.name = to.to_string();
            migration::apply_definition(tx, def, ApplyOptions::default())
        })
    }

    /// Drop a collection with all of its records.
    pub fn delete_collection(&self, name: &str) -> Result<LedgerEntry> {
        self.db.migrate(|tx| migration::drop_collection(tx, name))
    }

    /// Run the step files of `dir` in file name order, each in its own
    /// transaction. Stops at the first failing step.
    pub fn run_migrations(&self, dir: &Path) -> Result<Vec<StepOutcome>> {
        let steps = migration::load_steps(dir)?;
        let mut outcomes = Vec::with_capacity(steps.len());
        for step in &steps {
            let outcome = self
                .db
                .migrate(|tx| migration::apply_step(tx, step, ApplyOptions::default()))?;
            outcomes.push(outcome);
        }
        let applied = outcomes.iter().filter(|o| !o.skipped).count();
        log::info!(
            "{applied} of {} migration steps applied from {}",
            outcomes.len(),
            dir.display()
        );
        Ok(outcomes)
    }

    // ── Records ───────────────────────────────────────────────────────

    /// Get a handle for a collection by name or id.
    pub fn collection(&self, name: &str) -> Result<CollectionHandle<'_>> {
        let schema = self.schema()?;
        let collection = schema.get(name)?;
        Ok(CollectionHandle {
            store: self,
            id: collection.id.clone(),
            name: collection.name.clone(),
        })
    }

    /// Build the caller for an auth record. The record must exist.
    pub fn auth_caller(&self, collection: &str, id: &str) -> Result<CallerContext> {
        let schema = self.schema()?;
        let record = self
            .db
            .read(|conn| load_auth_record(conn, &schema, collection, id))?;
        record
            .map(CallerContext::Record)
            .ok_or_else(|| RuleDbError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })
    }

    /// Start a realtime hub fed by this store's commits. Must be called from
    /// within a tokio runtime. A later call replaces the previous hub's feed.
    pub fn realtime(&self) -> Result<Hub> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| RuleDbError::Other(format!("realtime hub needs a tokio runtime: {e}")))?;
        Hub::start(self.db.clone(), self.config.realtime.clone(), runtime)
    }

    fn cleanup_files(&self, cleanup: FileCleanup) {
        for key in cleanup.keys {
            if let Err(e) = self.files.delete(&key) {
                log::warn!("failed to delete file {key}: {e}");
            }
        }
        for prefix in cleanup.prefixes {
            if let Err(e) = self.files.delete_prefix(&prefix) {
                log::warn!("failed to delete files under {prefix}: {e}");
            }
        }
    }
}

/// A handle to one collection. Every operation resolves the collection
/// against the schema current at that moment, so rule and field changes
/// apply to handles opened earlier.
pub struct CollectionHandle<'a> {
    store: &'a Store,
    id: String,
    name: String,
}

impl<'a> CollectionHandle<'a> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The current definition of this collection.
    pub fn definition(&self) -> Result<Collection> {
        let schema = self.store.schema()?;
        Ok((*self.resolve(&schema)?).clone())
    }

    fn resolve(&self, schema: &Schema) -> Result<Arc<Collection>> {
        schema
            .by_id(&self.id)
            .cloned()
            .ok_or_else(|| RuleDbError::CollectionNotFound(self.name.clone()))
    }

    /// List the records the caller may see, filtered, sorted and paged.
    pub fn list(&self, caller: &CallerContext, query: &ListQuery) -> Result<ListResult> {
        let store = self.store;
        store.db.read(|conn| {
            let schema = store.db.schema_in(conn)?;
            let collection = self.resolve(&schema)?;
            query::list(conn, &store.config, &schema, &collection, caller, query)
        })
    }

    /// Fetch one record. Records hidden by the view rule are not found.
    pub fn view(&self, caller: &CallerContext, id: &str, expand: Option<&str>) -> Result<Record> {
        let db = &self.store.db;
        db.read(|conn| {
            let schema = db.schema_in(conn)?;
            let collection = self.resolve(&schema)?;
            query::view(conn, &schema, &collection, caller, id, expand)
        })
    }

    pub fn create(&self, caller: &CallerContext, payload: &JsonValue) -> Result<Record> {
        let db = &self.store.db;
        let (record, collection) = db.write(|tx, events| {
            let schema = db.schema_in(tx)?;
            let collection = self.resolve(&schema)?;
            let record = records::create(tx, &schema, &collection, caller, payload, events)?;
            Ok((record, collection))
        })?;
        Ok(record.visible_to(&collection, caller))
    }

    /// Patch a record with the fields present in `payload`.
    pub fn update(&self, caller: &CallerContext, id: &str, payload: &JsonValue) -> Result<Record> {
        let db = &self.store.db;
        let mut cleanup = FileCleanup::default();
        let (record, collection) = db.write(|tx, events| {
            let schema = db.schema_in(tx)?;
            let collection = self.resolve(&schema)?;
            let record = records::update(
                tx,
                &schema,
                &collection,
                caller,
                id,
                payload,
                events,
                &mut cleanup,
            )?;
            Ok((record, collection))
        })?;
        self.store.cleanup_files(cleanup);
        Ok(record.visible_to(&collection, caller))
    }

    /// Delete a record, resolving relations that point at it.
    pub fn delete(&self, caller: &CallerContext, id: &str) -> Result<()> {
        let db = &self.store.db;
        let mut cleanup = FileCleanup::default();
        db.write(|tx, events| {
            let schema = db.schema_in(tx)?;
            let collection = self.resolve(&schema)?;
            records::delete(tx, &schema, &collection, caller, id, events, &mut cleanup)
        })?;
        self.store.cleanup_files(cleanup);
        Ok(())
    }

    /// Whether `op` on record `id` would be allowed for the caller. For
    /// `create` the rule is checked without payload data.
    pub fn can_access(&self, caller: &CallerContext, op: Operation, id: &str) -> Result<bool> {
        let db = &self.store.db;
        db.read(|conn| {
            let schema = db.schema_in(conn)?;
            let collection = self.resolve(&schema)?;
            let rule = compile_rule(
                &schema,
                &collection,
                &collection.name,
                op,
                RequestInfo { caller, data: None },
            )?;
            query::record_matches(conn, &collection, rule, id)
        })
    }
}
