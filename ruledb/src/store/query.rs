use super::expand::{expand_records, parse_expand};
use crate::caller::CallerContext;
use crate::config::Config;
use crate::error::{Result, RuleDbError, ValidationErrors};
use crate::record::Record;
use crate::rules::{compile_filter, compile_rule, Predicate, RequestInfo, SqlFragment};
use crate::schema::{Collection, Operation, Schema};
use crate::util::quote_ident;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::{json, Value as JsonValue};

/// Parameters of a list request.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub filter: Option<String>,
    /// Comma separated keys, `-` prefix for descending.
    pub sort: Option<String>,
    /// 1-based; 0 is treated as 1.
    pub page: usize,
    pub per_page: Option<usize>,
    /// Comma separated relation paths, e.g. `author,comments.user`.
    pub expand: Option<String>,
}

impl ListQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: &str) -> Self {
        self.filter = Some(filter.to_string());
        self
    }

    pub fn sort(mut self, sort: &str) -> Self {
        self.sort = Some(sort.to_string());
        self
    }

    pub fn page(mut self, page: usize, per_page: usize) -> Self {
        self.page = page;
        self.per_page = Some(per_page);
        self
    }

    pub fn expand(mut self, expand: &str) -> Self {
        self.expand = Some(expand.to_string());
        self
    }
}

/// One page of a list request.
#[derive(Debug, Clone, PartialEq)]
pub struct ListResult {
    pub page: usize,
    pub per_page: usize,
    pub total_items: usize,
    pub total_pages: usize,
    pub items: Vec<Record>,
}

impl ListResult {
    pub fn to_json(&self) -> JsonValue {
        json!({
            "page": self.page,
            "perPage": self.per_page,
            "totalItems": self.total_items,
            "totalPages": self.total_pages,
            "items": self.items.iter().map(Record::to_json).collect::<Vec<_>>(),
        })
    }
}

/// Projected columns of a collection, qualified with `alias`.
pub(crate) fn projection(collection: &Collection, alias: &str) -> String {
    let alias = quote_ident(alias);
    collection
        .columns()
        .iter()
        .map(|c| format!("{alias}.{}", quote_ident(&c.name)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `FROM "table" AS "alias" <joins> WHERE <condition>` for a predicate.
pub(crate) fn from_where(collection: &Collection, alias: &str, predicate: &Predicate) -> String {
    let joins = predicate.joins_sql();
    format!(
        "FROM {} AS {}{}{} WHERE {}",
        quote_ident(&collection.name),
        quote_ident(alias),
        if joins.is_empty() { "" } else { " " },
        joins,
        predicate.condition.sql
    )
}

/// Load the records matching `predicate`, in statement order.
pub(crate) fn select_records(
    conn: &Connection,
    collection: &Collection,
    alias: &str,
    predicate: &Predicate,
    tail: &SqlFragment,
) -> Result<Vec<Record>> {
    let sql = format!(
        "SELECT {} {} {}",
        projection(collection, alias),
        from_where(collection, alias, predicate),
        tail.sql
    );
    log::debug!("{sql}");
    let params = predicate.condition.params.iter().chain(tail.params.iter());
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(params), |row| Record::from_row(collection, row))?;
    let mut records = Vec::new();
    for row in rows {
        records.push(row?);
    }
    Ok(records)
}

fn id_equals(alias: &str, id: &str) -> Predicate {
    Predicate {
        condition: SqlFragment {
            sql: format!("{}.\"id\" = ?", quote_ident(alias)),
            params: vec![SqlValue::Text(id.to_string())],
        },
        joins: Vec::new(),
    }
}

/// Load one record by id, if it matches `predicate`.
pub(crate) fn fetch_record(
    conn: &Connection,
    collection: &Collection,
    predicate: Predicate,
    id: &str,
) -> Result<Option<Record>> {
    let alias = collection.name.as_str();
    let predicate = id_equals(alias, id).and(predicate);
    let mut records = select_records(conn, collection, alias, &predicate, &SqlFragment::new("LIMIT 1"))?;
    Ok(records.pop())
}

/// Whether the stored record `id` satisfies `predicate`.
pub(crate) fn record_matches(
    conn: &Connection,
    collection: &Collection,
    predicate: Predicate,
    id: &str,
) -> Result<bool> {
    let alias = collection.name.as_str();
    let predicate = id_equals(alias, id).and(predicate);
    let sql = format!("SELECT 1 {} LIMIT 1", from_where(collection, alias, &predicate));
    let found = conn
        .query_row(&sql, params_from_iter(predicate.condition.params.iter()), |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

/// Build the ORDER BY clause for a sort expression. Only admins may sort an
/// auth collection by email.
pub(crate) fn order_by(
    collection: &Collection,
    alias: &str,
    sort: Option<&str>,
    caller: &CallerContext,
) -> Result<String> {
    let alias = quote_ident(alias);
    let mut keys = Vec::new();
    let mut has_id = false;

    for raw in sort.unwrap_or("").split(',') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let (name, direction) = match raw.strip_prefix('-') {
            Some(name) => (name, "DESC"),
            None => (raw.strip_prefix('+').unwrap_or(raw), "ASC"),
        };
        let hidden = name == "email" && collection.is_auth() && !caller.is_admin();
        let sortable = !hidden
            && collection
                .column_type(name)
                .is_some_and(|t| t.is_sortable());
        if !sortable {
            return Err(RuleDbError::Validation(ValidationErrors::single(
                "sort",
                format!("cannot sort by '{name}'"),
            )));
        }
        has_id |= name == "id";
        keys.push(format!("{alias}.{} {direction}", quote_ident(name)));
    }

    if keys.is_empty() && !collection.is_view() {
        keys.push(format!("{alias}.\"created\" ASC"));
    }
    if !has_id {
        keys.push(format!("{alias}.\"id\" ASC"));
    }
    Ok(format!("ORDER BY {}", keys.join(", ")))
}

/// Resolve page and per-page against the configured limits.
pub(crate) fn paging(config: &Config, query: &ListQuery) -> (usize, usize) {
    let page = query.page.max(1);
    let per_page = match query.per_page {
        None | Some(0) => config.default_per_page,
        Some(n) => n,
    };
    (page, per_page.clamp(1, config.max_per_page.max(1)))
}

pub(crate) fn list(
    conn: &Connection,
    config: &Config,
    schema: &Schema,
    collection: &Collection,
    caller: &CallerContext,
    query: &ListQuery,
) -> Result<ListResult> {
    let alias = collection.name.as_str();
    let filter = match query.filter.as_deref() {
        Some(filter) => compile_filter(schema, collection, alias, filter, caller)?,
        None => Predicate::allow_all(),
    };
    let rule = compile_rule(
        schema,
        collection,
        alias,
        Operation::List,
        RequestInfo { caller, data: None },
    )?;
    let predicate = filter.and(rule);
    let order = order_by(collection, alias, query.sort.as_deref(), caller)?;
    let expand = parse_expand(schema, collection, query.expand.as_deref())?;
    let (page, per_page) = paging(config, query);

    let count_sql = format!("SELECT COUNT(*) {}", from_where(collection, alias, &predicate));
    log::debug!("{count_sql}");
    let total: i64 = conn.query_row(
        &count_sql,
        params_from_iter(predicate.condition.params.iter()),
        |row| row.get(0),
    )?;
    let total_items = usize::try_from(total).unwrap_or(0);

    let offset = (page - 1).saturating_mul(per_page);
    let mut items = if offset >= total_items {
        Vec::new()
    } else {
        let tail = SqlFragment {
            sql: format!("{order} LIMIT ? OFFSET ?"),
            params: vec![
                SqlValue::Integer(per_page as i64),
                SqlValue::Integer(offset as i64),
            ],
        };
        select_records(conn, collection, alias, &predicate, &tail)?
    };
    expand_records(conn, schema, &mut items, &expand, caller)?;

    Ok(ListResult {
        page,
        per_page,
        total_items,
        total_pages: total_items.div_ceil(per_page),
        items: items
            .into_iter()
            .map(|r| r.visible_to(collection, caller))
            .collect(),
    })
}

pub(crate) fn view(
    conn: &Connection,
    schema: &Schema,
    collection: &Collection,
    caller: &CallerContext,
    id: &str,
    expand: Option<&str>,
) -> Result<Record> {
    let expand = parse_expand(schema, collection, expand)?;
    let rule = compile_rule(
        schema,
        collection,
        &collection.name,
        Operation::View,
        RequestInfo { caller, data: None },
    )?;
    let record = fetch_record(conn, collection, rule, id)?.ok_or_else(|| RuleDbError::NotFound {
        collection: collection.name.clone(),
        id: id.to_string(),
    })?;
    let mut records = vec![record];
    expand_records(conn, schema, &mut records, &expand, caller)?;
    let record = records.pop().ok_or_else(|| RuleDbError::Other("record vanished".into()))?;
    Ok(record.visible_to(collection, caller))
}
