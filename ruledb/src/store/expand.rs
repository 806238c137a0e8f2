use super::query::select_records;
use crate::caller::CallerContext;
use crate::error::{Result, RuleDbError, ValidationErrors};
use crate::record::Record;
use crate::rules::{compile_rule, Predicate, RequestInfo, SqlFragment};
use crate::schema::{Collection, FieldType, Operation, Schema, MAX_RELATION_DEPTH};
use crate::util::quote_ident;
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Relation paths to expand, as a tree keyed by relation field name.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ExpandTree {
    /// Target collection of the relation leading here.
    target: Option<Arc<Collection>>,
    children: BTreeMap<String, ExpandTree>,
}

impl ExpandTree {
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

fn expand_error(message: String) -> RuleDbError {
    RuleDbError::Validation(ValidationErrors::single("expand", message))
}

/// Parse `author,comments.user` into a tree, checking every hop is a relation.
pub(crate) fn parse_expand(
    schema: &Schema,
    collection: &Collection,
    expand: Option<&str>,
) -> Result<ExpandTree> {
    let mut root = ExpandTree::default();
    for path in expand.unwrap_or("").split(',') {
        let path = path.trim();
        if path.is_empty() {
            continue;
        }
        let hops: Vec<&str> = path.split('.').collect();
        if hops.len() > MAX_RELATION_DEPTH {
            return Err(expand_error(format!(
                "'{path}' exceeds the maximum of {MAX_RELATION_DEPTH} levels"
            )));
        }

        let mut node = &mut root;
        let mut current = collection;
        for hop in hops {
            let field = current
                .field(hop)
                .filter(|f| f.field_type == FieldType::Relation)
                .ok_or_else(|| {
                    expand_error(format!(
                        "'{hop}' is not a relation field of '{}'",
                        current.name
                    ))
                })?;
            let target = schema
                .relation_target(field)
                .ok_or_else(|| expand_error(format!("relation target of '{hop}' does not exist")))?;
            node = node.children.entry(hop.to_string()).or_default();
            node.target = Some(target.clone());
            current = target.as_ref();
        }
    }
    Ok(root)
}

/// Attach related records to `records`, level by level. Each level is one
/// batched query on the target collection gated by its view rule; records the
/// caller may not see are left out.
pub(crate) fn expand_records(
    conn: &Connection,
    schema: &Schema,
    records: &mut [Record],
    tree: &ExpandTree,
    caller: &CallerContext,
) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    for (field, node) in &tree.children {
        let Some(target) = node.target.as_deref() else {
            continue;
        };

        let mut ids: Vec<String> = records
            .iter()
            .filter_map(|r| r.get_str(field))
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
        ids.sort();
        ids.dedup();
        if ids.is_empty() {
            continue;
        }

        let alias = target.name.as_str();
        let placeholders = vec!["?"; ids.len()].join(", ");
        let in_ids = Predicate {
            condition: SqlFragment {
                sql: format!("{}.\"id\" IN ({placeholders})", quote_ident(alias)),
                params: ids.iter().cloned().map(SqlValue::Text).collect(),
            },
            joins: Vec::new(),
        };
        let rule = compile_rule(
            schema,
            target,
            alias,
            Operation::View,
            RequestInfo { caller, data: None },
        )?;
        let mut related = select_records(conn, target, alias, &in_ids.and(rule), &SqlFragment::default())?;
        expand_records(conn, schema, &mut related, node, caller)?;

        let by_id: HashMap<String, Record> = related
            .into_iter()
            .map(|r| (r.id.clone(), r.visible_to(target, caller)))
            .collect();
        for record in records.iter_mut() {
            let found = record.get_str(field).and_then(|id| by_id.get(id)).cloned();
            if let Some(found) = found {
                record.expand.insert(field.clone(), found);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CollectionType, Field};

    fn schema() -> Schema {
        let mut users = Collection::new("users", CollectionType::Auth);
        users.id = "u".into();
        users.fields.push(Field::new("team", FieldType::Relation).relation_to("t", false));
        let mut teams = Collection::new("teams", CollectionType::Base);
        teams.id = "t".into();
        let mut posts = Collection::new("posts", CollectionType::Base);
        posts.id = "p".into();
        posts.fields.push(Field::new("title", FieldType::Text));
        posts.fields.push(Field::new("author", FieldType::Relation).relation_to("u", false));
        Schema::new(1, vec![users, teams, posts])
    }

    #[test]
    fn test_parse_expand_tree() {
        let schema = schema();
        let posts = schema.by_name("posts").unwrap();
        let tree = parse_expand(&schema, posts, Some("author, author.team")).unwrap();
        let author = &tree.children["author"];
        assert_eq!(author.target.as_ref().unwrap().name, "users");
        assert_eq!(author.children["team"].target.as_ref().unwrap().name, "teams");
        assert!(parse_expand(&schema, posts, None).unwrap().is_empty());
    }

    #[test]
    fn test_parse_expand_errors() {
        let schema = schema();
        let posts = schema.by_name("posts").unwrap();
        for paths in ["title", "missing", "author.nope"] {
            assert!(matches!(
                parse_expand(&schema, posts, Some(paths)),
                Err(RuleDbError::Validation(_))
            ));
        }
    }
}
