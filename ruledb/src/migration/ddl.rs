use super::ApplyOptions;
use crate::error::{Result, RuleDbError};
use crate::schema::{Collection, Schema};
use crate::util::quote_ident;
use rusqlite::{params, Connection};

fn column_defs(collection: &Collection) -> Vec<String> {
    let mut defs = vec![
        "\"id\" TEXT PRIMARY KEY NOT NULL".to_string(),
        "\"created\" TEXT NOT NULL DEFAULT ''".to_string(),
        "\"updated\" TEXT NOT NULL DEFAULT ''".to_string(),
    ];
    if collection.is_auth() {
        defs.push("\"username\" TEXT".into());
        defs.push("\"email\" TEXT".into());
        defs.push("\"email_visibility\" INTEGER NOT NULL DEFAULT 0".into());
        defs.push("\"verified\" INTEGER NOT NULL DEFAULT 0".into());
    }
    for field in &collection.fields {
        defs.push(format!(
            "{} {}",
            quote_ident(&field.name),
            field.field_type.sql_type()
        ));
    }
    defs
}

pub fn create_table(conn: &Connection, collection: &Collection, table: &str) -> Result<()> {
    let sql = format!(
        "CREATE TABLE {} ({})",
        quote_ident(table),
        column_defs(collection).join(", ")
    );
    log::debug!("{sql}");
    conn.execute_batch(&sql)?;
    Ok(())
}

pub fn add_column(conn: &Connection, collection: &Collection, field_name: &str) -> Result<()> {
    let Some(field) = collection.field(field_name) else {
        return Ok(());
    };
    let sql = format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        quote_ident(&collection.name),
        quote_ident(&field.name),
        field.field_type.sql_type()
    );
    log::debug!("{sql}");
    conn.execute_batch(&sql)?;
    Ok(())
}

pub fn rename_table(conn: &Connection, from: &str, to: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "ALTER TABLE {} RENAME TO {}",
        quote_ident(from),
        quote_ident(to)
    ))?;
    Ok(())
}

pub fn drop_table(conn: &Connection, collection: &Collection) -> Result<()> {
    let kind = if collection.is_view() { "VIEW" } else { "TABLE" };
    conn.execute_batch(&format!(
        "DROP {kind} IF EXISTS {}",
        quote_ident(&collection.name)
    ))?;
    Ok(())
}

/// Indexes a collection should carry, as `(name, create statement)`.
pub fn desired_indexes(collection: &Collection) -> Vec<(String, String)> {
    let table = quote_ident(&collection.name);
    let mut out = Vec::new();

    if collection.is_auth() {
        for column in ["username", "email"] {
            let name = format!("idx_{}_sys_{column}", collection.id);
            let sql = format!(
                "CREATE UNIQUE INDEX {} ON {table} ({})",
                quote_ident(&name),
                quote_ident(column)
            );
            out.push((name, sql));
        }
    }
    for field in collection.fields.iter().filter(|f| f.unique) {
        let name = format!("idx_{}_{}_unique", collection.id, field.id);
        let sql = format!(
            "CREATE UNIQUE INDEX {} ON {table} ({})",
            quote_ident(&name),
            quote_ident(&field.name)
        );
        out.push((name, sql));
    }
    for index in &collection.indexes {
        let name = format!("idx_{}_{}", collection.id, index.name);
        let columns: Vec<String> = index.columns.iter().map(|c| quote_ident(c)).collect();
        let sql = format!(
            "CREATE {}INDEX {} ON {table} ({})",
            if index.unique { "UNIQUE " } else { "" },
            quote_ident(&name),
            columns.join(", ")
        );
        out.push((name, sql));
    }
    out
}

/// Drop every index owned by the collection and create the desired set.
pub fn reindex(conn: &Connection, collection: &Collection) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = ?1 AND name LIKE ?2",
    )?;
    let pattern = format!("idx_{}_%", collection.id);
    let existing: Vec<String> = stmt
        .query_map(params![collection.name, pattern], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    for name in existing {
        conn.execute_batch(&format!("DROP INDEX IF EXISTS {}", quote_ident(&name)))?;
    }

    for (name, sql) in desired_indexes(collection) {
        log::debug!("{sql}");
        conn.execute_batch(&sql).map_err(|e| {
            RuleDbError::SchemaConflict(format!(
                "cannot create index {name} on '{}': {e}",
                collection.name
            ))
        })?;
    }
    Ok(())
}

/// Rebuild the table of `old` into the shape of `new`: create a new table,
/// copy rows with per-column conversion, drop the old one and rename.
/// Columns are matched by field id, so renames keep their data.
pub fn rebuild_table(
    conn: &Connection,
    old: &Collection,
    new: &Collection,
    options: ApplyOptions,
) -> Result<()> {
    let source = quote_ident(&old.name);

    for field in &new.fields {
        let Some(prev) = old.field_by_id(&field.id) else {
            continue;
        };
        if prev.field_type == field.field_type {
            continue;
        }
        let lossy: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {source} WHERE NOT ruledb_castable({}, ?1)",
                quote_ident(&prev.name)
            ),
            params![field.field_type.as_str()],
            |row| row.get(0),
        )?;
        if lossy > 0 {
            if !options.allow_truncation {
                return Err(RuleDbError::SchemaConflict(format!(
                    "{lossy} value(s) of '{}.{}' cannot be converted to {}",
                    old.name,
                    prev.name,
                    field.field_type.as_str()
                )));
            }
            log::warn!(
                "{lossy} value(s) of '{}.{}' will be cleared by the conversion to {}",
                old.name,
                prev.name,
                field.field_type.as_str()
            );
        }
    }

    let temp = format!("_new_{}", new.name);
    conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(&temp)))?;
    create_table(conn, new, &temp)?;

    let mut columns = Vec::new();
    let mut exprs = Vec::new();
    for name in new.system_fields() {
        columns.push(quote_ident(name));
        exprs.push(quote_ident(name));
    }
    for field in &new.fields {
        columns.push(quote_ident(&field.name));
        exprs.push(match old.field_by_id(&field.id) {
            Some(prev) if prev.field_type == field.field_type => quote_ident(&prev.name),
            Some(prev) => format!(
                "ruledb_cast({}, '{}')",
                quote_ident(&prev.name),
                field.field_type.as_str()
            ),
            None => "NULL".to_string(),
        });
    }
    let copy = format!(
        "INSERT INTO {} ({}) SELECT {} FROM {source}",
        quote_ident(&temp),
        columns.join(", "),
        exprs.join(", ")
    );
    log::debug!("{copy}");
    conn.execute_batch(&copy)?;
    conn.execute_batch(&format!("DROP TABLE {source}"))?;
    rename_table(conn, &temp, &new.name)?;
    Ok(())
}

/// Output column names of a SELECT, without running it.
pub fn query_columns(conn: &Connection, query: &str) -> Result<Vec<String>> {
    let stmt = conn
        .prepare(query)
        .map_err(|e| RuleDbError::SchemaConflict(format!("invalid view query: {e}")))?;
    Ok(stmt.column_names().into_iter().map(String::from).collect())
}

/// Create the SQL view backing a view collection. The backing query is
/// wrapped so the view always exposes the system columns and every declared
/// field, with NULL for columns the query does not return.
pub fn create_view(conn: &Connection, collection: &Collection) -> Result<()> {
    let Some(query) = collection.view_query.as_deref() else {
        return Ok(());
    };
    let available = query_columns(conn, query)?;
    let select: Vec<String> = collection
        .columns()
        .into_iter()
        .map(|column| {
            let name = quote_ident(&column.name);
            if available.iter().any(|c| c == &column.name) {
                format!("_q.{name} AS {name}")
            } else {
                format!("NULL AS {name}")
            }
        })
        .collect();
    let sql = format!(
        "CREATE VIEW {} AS SELECT {} FROM ({}) AS _q",
        quote_ident(&collection.name),
        select.join(", "),
        query.trim().trim_end_matches(';')
    );
    log::debug!("{sql}");
    conn.execute_batch(&sql)
        .map_err(|e| RuleDbError::SchemaConflict(format!("cannot create view '{}': {e}", collection.name)))?;
    Ok(())
}

pub fn drop_views(conn: &Connection, schema: &Schema) -> Result<()> {
    for collection in schema.collections().iter().filter(|c| c.is_view()) {
        conn.execute_batch(&format!(
            "DROP VIEW IF EXISTS {}",
            quote_ident(&collection.name)
        ))?;
    }
    Ok(())
}

pub fn create_views(conn: &Connection, schema: &Schema) -> Result<()> {
    for collection in schema.collections().iter().filter(|c| c.is_view()) {
        create_view(conn, collection)?;
    }
    Ok(())
}
