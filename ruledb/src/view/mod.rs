use crate::error::{Result, RuleDbError};
use crate::schema::Schema;
use sqlparser::ast::{Expr, Query, Select, SelectItem, SetExpr, Statement, TableFactor, TableWithJoins};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use std::collections::HashSet;

/// Parsed information about the backing query of a view collection
#[derive(Debug, Clone)]
pub struct ParsedView {
    pub name: String,
    /// Collections referenced by the query (from FROM and JOIN clauses)
    pub referenced_collections: HashSet<String>,
    /// Column names of the result, `*` for wildcards
    pub columns: Vec<ViewColumn>,
}

/// A column in a view result
#[derive(Debug, Clone)]
pub struct ViewColumn {
    pub name: String,
    pub source_collection: Option<String>,
    pub source_field: Option<String>,
}

impl ParsedView {
    fn exposes_id(&self) -> bool {
        self.columns.iter().any(|c| c.name == "*" || c.name == "id")
    }
}

/// Check that `query` is a single read-only SELECT over existing collections
/// that yields an `id` column.
pub fn analyze_view_query(name: &str, query: &str, schema: &Schema) -> Result<ParsedView> {
    let statements = Parser::parse_sql(&SQLiteDialect {}, query.trim())
        .map_err(|e| RuleDbError::SqlParse(format!("view '{name}': {e}")))?;

    let stmt = match statements.as_slice() {
        [stmt] => stmt,
        [] => {
            return Err(RuleDbError::SqlParse(format!(
                "view '{name}': no SQL statement found"
            )))
        }
        _ => {
            return Err(RuleDbError::SqlParse(format!(
                "view '{name}': only a single SELECT is allowed"
            )))
        }
    };
    let Statement::Query(parsed) = stmt else {
        return Err(RuleDbError::SqlParse(format!(
            "view '{name}': only SELECT statements are allowed"
        )));
    };

    let mut referenced = HashSet::new();
    let mut columns = Vec::new();
    let mut ctes = HashSet::new();
    extract_from_query(parsed, &mut referenced, &mut columns, &mut ctes, true);
    for cte in &ctes {
        referenced.remove(cte);
    }

    for table in &referenced {
        if table.starts_with('_') {
            return Err(RuleDbError::SqlParse(format!(
                "view '{name}': system table '{table}' cannot be queried"
            )));
        }
        if table.eq_ignore_ascii_case(name) {
            return Err(RuleDbError::SqlParse(format!(
                "view '{name}': a view cannot select from itself"
            )));
        }
        if schema.by_name(table).is_none() {
            return Err(RuleDbError::SqlParse(format!(
                "view '{name}': unknown collection '{table}'"
            )));
        }
    }

    let view = ParsedView {
        name: name.to_string(),
        referenced_collections: referenced,
        columns,
    };
    if !view.exposes_id() {
        return Err(RuleDbError::SqlParse(format!(
            "view '{name}': the query must select an id column"
        )));
    }
    Ok(view)
}

/// Names of the view collections whose query reads from `collection`.
pub fn dependent_views(schema: &Schema, collection: &str) -> Vec<String> {
    schema
        .collections()
        .iter()
        .filter(|c| c.is_view() && !c.name.eq_ignore_ascii_case(collection))
        .filter(|c| {
            c.view_query
                .as_deref()
                .and_then(|q| analyze_view_query(&c.name, q, schema).ok())
                .map(|parsed| {
                    parsed
                        .referenced_collections
                        .iter()
                        .any(|t| t.eq_ignore_ascii_case(collection))
                })
                .unwrap_or(false)
        })
        .map(|c| c.name.clone())
        .collect()
}

/// Extract metadata from a parsed SQL query. Only the outermost SELECT
/// contributes result columns.
fn extract_from_query(
    query: &Query,
    collections: &mut HashSet<String>,
    columns: &mut Vec<ViewColumn>,
    ctes: &mut HashSet<String>,
    outer: bool,
) {
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            ctes.insert(cte.alias.name.value.clone());
            extract_from_query(&cte.query, collections, &mut Vec::new(), ctes, false);
        }
    }
    extract_from_set_expr(&query.body, collections, columns, ctes, outer);
}

fn extract_from_set_expr(
    body: &SetExpr,
    collections: &mut HashSet<String>,
    columns: &mut Vec<ViewColumn>,
    ctes: &mut HashSet<String>,
    outer: bool,
) {
    match body {
        SetExpr::Select(select) => extract_from_select(select, collections, columns, ctes, outer),
        SetExpr::Query(query) => extract_from_query(query, collections, columns, ctes, outer),
        SetExpr::SetOperation { left, right, .. } => {
            extract_from_set_expr(left, collections, columns, ctes, outer);
            extract_from_set_expr(right, collections, &mut Vec::new(), ctes, false);
        }
        _ => {}
    }
}

/// Extract metadata from a SELECT clause
fn extract_from_select(
    select: &Select,
    collections: &mut HashSet<String>,
    columns: &mut Vec<ViewColumn>,
    ctes: &mut HashSet<String>,
    outer: bool,
) {
    for table in &select.from {
        extract_from_table_with_joins(table, collections, ctes);
    }
    if !outer {
        return;
    }

    for item in &select.projection {
        match item {
            SelectItem::UnnamedExpr(expr) => {
                let (col_name, source_col, source_field) = extract_column_info(expr);
                columns.push(ViewColumn {
                    name: col_name,
                    source_collection: source_col,
                    source_field,
                });
            }
            SelectItem::ExprWithAlias { expr, alias } => {
                let (_, source_col, source_field) = extract_column_info(expr);
                columns.push(ViewColumn {
                    name: alias.value.clone(),
                    source_collection: source_col,
                    source_field,
                });
            }
            _ => {
                columns.push(ViewColumn {
                    name: "*".to_string(),
                    source_collection: None,
                    source_field: None,
                });
            }
        }
    }
}

/// Extract table/collection names from FROM and JOIN clauses
fn extract_from_table_with_joins(
    table_with_joins: &TableWithJoins,
    collections: &mut HashSet<String>,
    ctes: &mut HashSet<String>,
) {
    extract_table_name(&table_with_joins.relation, collections, ctes);

    for join in &table_with_joins.joins {
        extract_table_name(&join.relation, collections, ctes);
    }
}

fn extract_table_name(factor: &TableFactor, collections: &mut HashSet<String>, ctes: &mut HashSet<String>) {
    match factor {
        TableFactor::Table { name, .. } => {
            let table_name = name.0.last().map(|i| i.value.clone()).unwrap_or_default();
            if !table_name.is_empty() {
                collections.insert(table_name);
            }
        }
        TableFactor::Derived { subquery, .. } => {
            extract_from_query(subquery, collections, &mut Vec::new(), ctes, false);
        }
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => extract_from_table_with_joins(table_with_joins, collections, ctes),
        _ => {}
    }
}

/// Extract column information from an expression
fn extract_column_info(expr: &Expr) -> (String, Option<String>, Option<String>) {
    match expr {
        Expr::Identifier(ident) => (ident.value.clone(), None, Some(ident.value.clone())),
        Expr::CompoundIdentifier(parts) => {
            if parts.len() == 2 {
                (
                    parts[1].value.clone(),
                    Some(parts[0].value.clone()),
                    Some(parts[1].value.clone()),
                )
            } else {
                let name = parts.last().map(|p| p.value.clone()).unwrap_or_default();
                (name, None, None)
            }
        }
        _ => (format!("{expr}"), None, None),
    }
}
