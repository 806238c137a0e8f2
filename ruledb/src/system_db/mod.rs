mod ledger;
mod schema_store;

pub use ledger::LedgerEntry;
pub(crate) use ledger::{append as append_ledger, entries as ledger_entries, find_by_checksum, find_by_name};
pub(crate) use schema_store::{collection_checksum, delete_collection_row, load_schema, upsert_collection};

use crate::config::Config;
use crate::error::{poisoned, Result, RuleDbError};
use crate::realtime::ChangeEvent;
use crate::record::cast_value;
use crate::schema::{FieldType, Schema};
use rusqlite::functions::FunctionFlags;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// The storage gate: one writer connection behind a mutex and a pool of
/// read-only connections over the same WAL database.
pub struct SystemDb {
    path: PathBuf,
    writer: Mutex<Connection>,
    readers: Mutex<Vec<Connection>>,
    max_idle_readers: usize,
    busy_timeout: Duration,
    migration_lock_timeout: Duration,
    schema: RwLock<Arc<Schema>>,
    events: Mutex<Option<Sender<ChangeEvent>>>,
}

pub(crate) fn initialize_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS _collections (
            id TEXT PRIMARY KEY NOT NULL,
            name TEXT NOT NULL UNIQUE COLLATE NOCASE,
            type TEXT NOT NULL,
            definition_json TEXT NOT NULL,
            checksum TEXT NOT NULL,
            created TEXT NOT NULL,
            updated TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS _migrations (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            checksum TEXT NOT NULL,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

/// Register `ruledb_cast(value, type)` and `ruledb_castable(value, type)`,
/// used by table rebuilds to convert retyped columns.
pub(crate) fn register_functions(conn: &Connection) -> Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;
    conn.create_scalar_function("ruledb_cast", 2, flags, |ctx| {
        let to = target_type(&ctx.get::<String>(1)?)?;
        Ok(cast_value(ctx.get_raw(0), to).unwrap_or(SqlValue::Null))
    })?;
    conn.create_scalar_function("ruledb_castable", 2, flags, |ctx| {
        let to = target_type(&ctx.get::<String>(1)?)?;
        Ok(cast_value(ctx.get_raw(0), to).is_some())
    })?;
    Ok(())
}

fn target_type(name: &str) -> rusqlite::Result<FieldType> {
    FieldType::parse(name).ok_or_else(|| {
        rusqlite::Error::UserFunctionError(format!("unknown field type '{name}'").into())
    })
}

impl SystemDb {
    /// Open or create the database at `path`, switch it to WAL mode and make
    /// sure the metadata tables exist.
    pub fn open(path: &Path, config: &Config) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(config.busy_timeout())?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            log::warn!("database {} is in {mode} journal mode", path.display());
        }
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        register_functions(&conn)?;
        initialize_tables(&conn)?;
        let schema = load_schema(&conn)?;
        log::info!(
            "opened {} ({} collections, ledger seq {})",
            path.display(),
            schema.collections().len(),
            schema.version
        );

        Ok(SystemDb {
            path: path.to_path_buf(),
            writer: Mutex::new(conn),
            readers: Mutex::new(Vec::new()),
            max_idle_readers: config.read_connections.max(1),
            busy_timeout: config.busy_timeout(),
            migration_lock_timeout: config.migration_lock_timeout(),
            schema: RwLock::new(Arc::new(schema)),
            events: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Route committed change events into `sender`. Replaces any previous
    /// receiver.
    pub(crate) fn set_change_sender(&self, sender: Sender<ChangeEvent>) -> Result<()> {
        *self.events.lock().map_err(poisoned)? = Some(sender);
        Ok(())
    }

    fn checkout_reader(&self) -> Result<Connection> {
        if let Some(conn) = self.readers.lock().map_err(poisoned)?.pop() {
            return Ok(conn);
        }
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }

    fn checkin_reader(&self, conn: Connection) {
        if let Ok(mut pool) = self.readers.lock() {
            if pool.len() < self.max_idle_readers {
                pool.push(conn);
            }
        }
    }

    /// Run `f` on a pooled read-only connection inside one read transaction,
    /// so every statement sees the same snapshot.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.checkout_reader()?;
        let result = match conn.unchecked_transaction() {
            Ok(tx) => f(&tx),
            Err(e) => Err(e.into()),
        };
        self.checkin_reader(conn);
        result
    }

    /// Run `f` in one `BEGIN IMMEDIATE` transaction behind the writer gate.
    ///
    /// Events pushed by `f` are published after a successful commit, while
    /// the gate is still held, so the feed order equals commit order. A
    /// failed `f` rolls back and publishes nothing.
    pub fn write<T>(&self, f: impl FnOnce(&Transaction<'_>, &mut Vec<ChangeEvent>) -> Result<T>) -> Result<T> {
        let mut conn = self.writer.lock().map_err(poisoned)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut events = Vec::new();
        match f(&tx, &mut events) {
            Ok(value) => {
                tx.commit().map_err(RuleDbError::from_write)?;
                self.publish(events)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    log::error!("rollback failed after {e}: {rollback}");
                }
                Err(e)
            }
        }
    }

    /// Run a schema migration under the migration lock.
    ///
    /// Waits at most the configured lock timeout for another process holding
    /// the database write lock, then fails with `MigrationLockContention`.
    /// The cached schema is refreshed before the gate is released.
    pub fn migrate<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.writer.lock().map_err(poisoned)?;
        conn.busy_timeout(self.migration_lock_timeout)?;
        let outcome = Self::run_migration(&mut conn, self.busy_timeout, f);
        conn.busy_timeout(self.busy_timeout)?;
        let value = outcome?;

        let schema = load_schema(&conn)?;
        *self.schema.write().map_err(poisoned)? = Arc::new(schema);
        Ok(value)
    }

    /// One migration transaction. The lock wait uses the connection's
    /// current busy timeout; statements inside run with `busy_timeout`.
    fn run_migration<T>(
        conn: &mut Connection,
        busy_timeout: Duration,
        f: impl FnOnce(&Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| {
                let err = RuleDbError::from(e);
                if err.is_busy() {
                    RuleDbError::MigrationLockContention
                } else {
                    err
                }
            })?;
        tx.busy_timeout(busy_timeout)?;

        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    log::error!("rollback failed after {e}: {rollback}");
                }
                Err(e)
            }
        }
    }

    fn publish(&self, events: Vec<ChangeEvent>) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut guard = self.events.lock().map_err(poisoned)?;
        if let Some(sender) = guard.as_ref() {
            for event in events {
                if sender.send(event).is_err() {
                    log::debug!("change feed receiver dropped; disabling feed");
                    *guard = None;
                    break;
                }
            }
        }
        Ok(())
    }

    /// The current schema snapshot. Reloaded whenever the ledger sequence
    /// moved, including migrations run by other processes.
    pub fn schema(&self) -> Result<Arc<Schema>> {
        self.read(|conn| self.schema_in(conn))
    }

    /// The schema as seen by `conn`'s current transaction. Inside a write
    /// transaction this is the schema the write commits against.
    pub(crate) fn schema_in(&self, conn: &Connection) -> Result<Arc<Schema>> {
        let cached = self.schema.read().map_err(poisoned)?.clone();
        let seq = crate::system_db::ledger::current_seq(conn)?;
        if seq == cached.version {
            return Ok(cached);
        }

        let schema = Arc::new(load_schema(conn)?);
        log::debug!("schema reloaded at ledger seq {}", schema.version);
        let mut guard = self.schema.write().map_err(poisoned)?;
        if schema.version > guard.version {
            *guard = schema.clone();
        }
        Ok(schema)
    }

    pub fn ledger(&self) -> Result<Vec<LedgerEntry>> {
        self.read(ledger_entries)
    }
}
