use crate::error::Result;
use crate::util::now_timestamp;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

/// One applied migration step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub seq: i64,
    pub name: String,
    pub checksum: String,
    pub description: String,
    pub applied_at: String,
}

const COLUMNS: &str = "seq, name, checksum, description, applied_at";

fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerEntry> {
    Ok(LedgerEntry {
        seq: row.get(0)?,
        name: row.get(1)?,
        checksum: row.get(2)?,
        description: row.get(3)?,
        applied_at: row.get(4)?,
    })
}

/// Sequence of the last applied step, 0 for an empty ledger.
pub fn current_seq(conn: &Connection) -> Result<i64> {
    let seq = conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM _migrations", [], |row| {
        row.get(0)
    })?;
    Ok(seq)
}

pub fn entries(conn: &Connection) -> Result<Vec<LedgerEntry>> {
    let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM _migrations ORDER BY seq"))?;
    let rows = stmt.query_map([], from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn find_by_checksum(conn: &Connection, checksum: &str) -> Result<Option<LedgerEntry>> {
    let entry = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM _migrations WHERE checksum = ?1 ORDER BY seq LIMIT 1"),
            params![checksum],
            from_row,
        )
        .optional()?;
    Ok(entry)
}

pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<LedgerEntry>> {
    let entry = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM _migrations WHERE name = ?1"),
            params![name],
            from_row,
        )
        .optional()?;
    Ok(entry)
}

/// Append a step. Must run inside the migration transaction.
pub fn append(conn: &Connection, name: &str, checksum: &str, description: &str) -> Result<LedgerEntry> {
    let applied_at = now_timestamp();
    conn.execute(
        "INSERT INTO _migrations (name, checksum, description, applied_at) VALUES (?1, ?2, ?3, ?4)",
        params![name, checksum, description, applied_at],
    )?;
    Ok(LedgerEntry {
        seq: conn.last_insert_rowid(),
        name: name.to_string(),
        checksum: checksum.to_string(),
        description: description.to_string(),
        applied_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system_db::initialize_tables;

    #[test]
    fn test_append_and_lookup() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_tables(&conn).unwrap();
        assert_eq!(current_seq(&conn).unwrap(), 0);

        let first = append(&conn, "001_init", "aaa", "create posts").unwrap();
        let second = append(&conn, "002_more", "bbb", "add field").unwrap();
        assert!(second.seq > first.seq);
        assert_eq!(current_seq(&conn).unwrap(), second.seq);

        assert_eq!(find_by_checksum(&conn, "bbb").unwrap().unwrap().name, "002_more");
        assert_eq!(find_by_name(&conn, "001_init").unwrap().unwrap().checksum, "aaa");
        assert!(find_by_name(&conn, "nope").unwrap().is_none());
        assert_eq!(entries(&conn).unwrap().len(), 2);
    }

    #[test]
    fn test_names_are_unique() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_tables(&conn).unwrap();
        append(&conn, "001_init", "aaa", "").unwrap();
        assert!(append(&conn, "001_init", "ccc", "").is_err());
    }
}
