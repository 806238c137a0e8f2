mod apply;
mod ddl;

pub(crate) use apply::{apply_definition, apply_document, apply_step, drop_collection};
pub use apply::{load_steps, MigrationStep, StepOutcome};

use crate::schema::{Collection, FieldType};
use crate::system_db::LedgerEntry;
use serde::Serialize;
use std::collections::HashMap;

/// Options for applying a collection definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Turn values that cannot be converted by a retype into NULL instead of
    /// failing the migration.
    pub allow_truncation: bool,
}

/// Result of one schema application.
#[derive(Debug, Clone, Serialize)]
pub struct AppliedMigration {
    pub collection: String,
    pub changes: Vec<SchemaChange>,
    /// True when the definition was already applied (no ledger entry).
    pub skipped: bool,
    pub ledger: Option<LedgerEntry>,
}

/// A single change between a stored and a requested collection definition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchemaChange {
    CollectionAdded {
        name: String,
    },
    CollectionRenamed {
        from: String,
        to: String,
    },
    CollectionRemoved {
        name: String,
    },
    FieldAdded {
        collection: String,
        field: String,
    },
    FieldRemoved {
        collection: String,
        field: String,
    },
    FieldRenamed {
        collection: String,
        from: String,
        to: String,
    },
    FieldRetyped {
        collection: String,
        field: String,
        from: FieldType,
        to: FieldType,
    },
    /// Required flag, unique flag or options changed.
    FieldChanged {
        collection: String,
        field: String,
    },
    IndexAdded {
        collection: String,
        index: String,
    },
    IndexRemoved {
        collection: String,
        index: String,
    },
    RulesChanged {
        collection: String,
    },
    ViewQueryChanged {
        collection: String,
    },
    /// Metadata-only difference such as field order.
    DefinitionChanged {
        collection: String,
    },
}

impl SchemaChange {
    /// Whether applying this change requires rebuilding the table.
    pub fn requires_rebuild(&self) -> bool {
        matches!(
            self,
            SchemaChange::FieldRemoved { .. }
                | SchemaChange::FieldRenamed { .. }
                | SchemaChange::FieldRetyped { .. }
        )
    }

    /// Whether existing data can be lost by this change.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            SchemaChange::CollectionRemoved { .. }
                | SchemaChange::FieldRemoved { .. }
                | SchemaChange::FieldRetyped { .. }
        )
    }

    pub fn describe(&self) -> String {
        match self {
            SchemaChange::CollectionAdded { name } => format!("collection '{name}' added"),
            SchemaChange::CollectionRenamed { from, to } => {
                format!("collection '{from}' renamed to '{to}'")
            }
            SchemaChange::CollectionRemoved { name } => format!("collection '{name}' removed"),
            SchemaChange::FieldAdded { collection, field } => {
                format!("field '{collection}.{field}' added")
            }
            SchemaChange::FieldRemoved { collection, field } => {
                format!("field '{collection}.{field}' removed")
            }
            SchemaChange::FieldRenamed { collection, from, to } => {
                format!("field '{collection}.{from}' renamed to '{to}'")
            }
            SchemaChange::FieldRetyped {
                collection,
                field,
                from,
                to,
            } => format!(
                "field '{collection}.{field}' changed from {} to {}",
                from.as_str(),
                to.as_str()
            ),
            SchemaChange::FieldChanged { collection, field } => {
                format!("field '{collection}.{field}' options changed")
            }
            SchemaChange::IndexAdded { collection, index } => {
                format!("index '{index}' added to '{collection}'")
            }
            SchemaChange::IndexRemoved { collection, index } => {
                format!("index '{index}' removed from '{collection}'")
            }
            SchemaChange::RulesChanged { collection } => format!("rules of '{collection}' changed"),
            SchemaChange::ViewQueryChanged { collection } => {
                format!("view query of '{collection}' changed")
            }
            SchemaChange::DefinitionChanged { collection } => {
                format!("definition of '{collection}' updated")
            }
        }
    }
}

/// Describe a list of changes on one line.
pub fn describe_changes(changes: &[SchemaChange]) -> String {
    changes
        .iter()
        .map(SchemaChange::describe)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Compare a stored definition (if any) with a normalized requested one.
/// Fields and collections are matched by id, so renames are detected.
pub fn diff_collection(old: Option<&Collection>, new: &Collection) -> Vec<SchemaChange> {
    let Some(old) = old else {
        return vec![SchemaChange::CollectionAdded {
            name: new.name.clone(),
        }];
    };

    let mut changes = Vec::new();
    let name = new.name.clone();

    if old.name != new.name {
        changes.push(SchemaChange::CollectionRenamed {
            from: old.name.clone(),
            to: new.name.clone(),
        });
    }

    for field in &new.fields {
        match old.field_by_id(&field.id) {
            None => changes.push(SchemaChange::FieldAdded {
                collection: name.clone(),
                field: field.name.clone(),
            }),
            Some(prev) => {
                if prev.name != field.name {
                    changes.push(SchemaChange::FieldRenamed {
                        collection: name.clone(),
                        from: prev.name.clone(),
                        to: field.name.clone(),
                    });
                }
                if prev.field_type != field.field_type {
                    changes.push(SchemaChange::FieldRetyped {
                        collection: name.clone(),
                        field: field.name.clone(),
                        from: prev.field_type,
                        to: field.field_type,
                    });
                }
                if prev.required != field.required
                    || prev.unique != field.unique
                    || prev.options != field.options
                {
                    changes.push(SchemaChange::FieldChanged {
                        collection: name.clone(),
                        field: field.name.clone(),
                    });
                }
            }
        }
    }
    for field in &old.fields {
        if new.field_by_id(&field.id).is_none() {
            changes.push(SchemaChange::FieldRemoved {
                collection: name.clone(),
                field: field.name.clone(),
            });
        }
    }

    let old_indexes: HashMap<&str, _> = old.indexes.iter().map(|i| (i.name.as_str(), i)).collect();
    let new_indexes: HashMap<&str, _> = new.indexes.iter().map(|i| (i.name.as_str(), i)).collect();
    for index in &old.indexes {
        if new_indexes.get(index.name.as_str()) != Some(&index) {
            changes.push(SchemaChange::IndexRemoved {
                collection: name.clone(),
                index: index.name.clone(),
            });
        }
    }
    for index in &new.indexes {
        if old_indexes.get(index.name.as_str()) != Some(&index) {
            changes.push(SchemaChange::IndexAdded {
                collection: name.clone(),
                index: index.name.clone(),
            });
        }
    }

    if old.rules != new.rules {
        changes.push(SchemaChange::RulesChanged {
            collection: name.clone(),
        });
    }
    if old.view_query != new.view_query {
        changes.push(SchemaChange::ViewQueryChanged {
            collection: name.clone(),
        });
    }
    if changes.is_empty() && old != new {
        changes.push(SchemaChange::DefinitionChanged { collection: name });
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CollectionType, Field, IndexDefinition};
    use pretty_assertions::assert_eq;

    fn posts() -> Collection {
        let mut posts = Collection::new("posts", CollectionType::Base);
        posts.id = "p".into();
        let mut title = Field::new("title", FieldType::Text);
        title.id = "f1".into();
        let mut score = Field::new("score", FieldType::Text);
        score.id = "f2".into();
        posts.fields = vec![title, score];
        posts
    }

    #[test]
    fn test_no_changes() {
        let posts = posts();
        assert!(diff_collection(Some(&posts), &posts).is_empty());
    }

    #[test]
    fn test_new_collection() {
        let posts = posts();
        assert_eq!(
            diff_collection(None, &posts),
            vec![SchemaChange::CollectionAdded { name: "posts".into() }]
        );
    }

    #[test]
    fn test_rename_and_retype_detected_by_id() {
        let old = posts();
        let mut new = posts();
        new.fields[0].name = "headline".into();
        new.fields[1].field_type = FieldType::Number;
        let changes = diff_collection(Some(&old), &new);
        assert_eq!(
            changes,
            vec![
                SchemaChange::FieldRenamed {
                    collection: "posts".into(),
                    from: "title".into(),
                    to: "headline".into(),
                },
                SchemaChange::FieldRetyped {
                    collection: "posts".into(),
                    field: "score".into(),
                    from: FieldType::Text,
                    to: FieldType::Number,
                },
            ]
        );
        assert!(changes.iter().all(SchemaChange::requires_rebuild));
        assert!(changes[1].is_destructive());
    }

    #[test]
    fn test_fields_indexes_and_rules() {
        let old = posts();
        let mut new = posts();
        new.fields.remove(1);
        let mut body = Field::new("body", FieldType::Text);
        body.id = "f3".into();
        new.fields.push(body);
        new.indexes.push(IndexDefinition {
            name: "by_title".into(),
            columns: vec!["title".into()],
            unique: false,
        });
        new.rules.list = Some(String::new());

        let described: Vec<String> = diff_collection(Some(&old), &new)
            .iter()
            .map(SchemaChange::describe)
            .collect();
        assert_eq!(
            described,
            vec![
                "field 'posts.body' added",
                "field 'posts.score' removed",
                "index 'by_title' added to 'posts'",
                "rules of 'posts' changed",
            ]
        );
    }

    #[test]
    fn test_reorder_is_metadata_only() {
        let old = posts();
        let mut new = posts();
        new.fields.swap(0, 1);
        let changes = diff_collection(Some(&old), &new);
        assert_eq!(
            changes,
            vec![SchemaChange::DefinitionChanged { collection: "posts".into() }]
        );
        assert!(!changes[0].requires_rebuild());
    }
}
