use super::ledger;
use crate::error::Result;
use crate::schema::{Collection, Schema};
use crate::util::now_timestamp;
use rusqlite::{params, Connection, OptionalExtension};

/// Read every stored collection definition, tagged with the current ledger
/// sequence.
pub fn load_schema(conn: &Connection) -> Result<Schema> {
    let version = ledger::current_seq(conn)?;
    let mut stmt = conn.prepare("SELECT definition_json FROM _collections ORDER BY rowid")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut collections = Vec::new();
    for row in rows {
        let collection: Collection = serde_json::from_str(&row?)?;
        collections.push(collection);
    }
    Ok(Schema::new(version, collections))
}

/// Checksum of the stored definition, if the collection exists.
pub fn collection_checksum(conn: &Connection, id: &str) -> Result<Option<String>> {
    let checksum = conn
        .query_row(
            "SELECT checksum FROM _collections WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(checksum)
}

pub fn upsert_collection(conn: &Connection, collection: &Collection, checksum: &str) -> Result<()> {
    let json = serde_json::to_string(collection)?;
    let now = now_timestamp();
    conn.execute(
        "INSERT INTO _collections (id, name, type, definition_json, checksum, created, updated)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            type = excluded.type,
            definition_json = excluded.definition_json,
            checksum = excluded.checksum,
            updated = excluded.updated",
        params![collection.id, collection.name, collection.kind.as_str(), json, checksum, now],
    )?;
    Ok(())
}

pub fn delete_collection_row(conn: &Connection, id: &str) -> Result<()> {
    conn.execute("DELETE FROM _collections WHERE id = ?1", params![id])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CollectionType, Field, FieldType};
    use crate::system_db::initialize_tables;

    #[test]
    fn test_upsert_and_load() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_tables(&conn).unwrap();

        let mut posts = Collection::new("posts", CollectionType::Base);
        posts.id = "p1".into();
        posts.fields.push(Field::new("title", FieldType::Text));
        upsert_collection(&conn, &posts, "c1").unwrap();

        posts.name = "articles".into();
        upsert_collection(&conn, &posts, "c2").unwrap();

        let schema = load_schema(&conn).unwrap();
        assert_eq!(schema.collections().len(), 1);
        assert_eq!(schema.find("p1").unwrap().name, "articles");
        assert_eq!(collection_checksum(&conn, "p1").unwrap().as_deref(), Some("c2"));

        delete_collection_row(&conn, "p1").unwrap();
        assert!(load_schema(&conn).unwrap().collections().is_empty());
    }
}
