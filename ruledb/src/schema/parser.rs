use crate::error::{Result, RuleDbError};
use super::types::Collection;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A schema document: collections to upsert and collection names to delete.
/// Also the format of migration step files.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SchemaFile {
    #[serde(default)]
    pub collections: Vec<Collection>,
    #[serde(default)]
    pub delete: Vec<String>,
}

/// Parse a schema YAML file into a SchemaFile
pub fn parse_schema(path: &Path) -> Result<SchemaFile> {
    let content = std::fs::read_to_string(path)?;
    parse_schema_str(&content)
}

/// Parse schema YAML. Accepts either a document with a `collections` list or
/// a single collection definition.
pub fn parse_schema_str(content: &str) -> Result<SchemaFile> {
    let value: serde_yaml::Value = serde_yaml::from_str(content)?;
    let mapping = value
        .as_mapping()
        .ok_or_else(|| RuleDbError::Schema("schema document must be a YAML mapping".into()))?;

    let is_document = mapping.contains_key(serde_yaml::Value::String("collections".into()))
        || mapping.contains_key(serde_yaml::Value::String("delete".into()));
    if is_document {
        let file: SchemaFile = serde_yaml::from_value(value)?;
        Ok(file)
    } else {
        let collection: Collection = serde_yaml::from_value(value)?;
        Ok(SchemaFile {
            collections: vec![collection],
            delete: Vec::new(),
        })
    }
}

/// Parse a single collection definition.
pub fn parse_collection_str(content: &str) -> Result<Collection> {
    let collection: Collection = serde_yaml::from_str(content)?;
    Ok(collection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CollectionType, FieldType};

    #[test]
    fn test_parse_document() {
        let file = parse_schema_str(
            r#"
collections:
  - name: users
    type: auth
    fields:
      - { name: name, type: text, required: true }
  - name: posts
    fields:
      - { name: title, type: text, required: true, options: { max: 120 } }
      - { name: author, type: relation, options: { collection_id: users, cascade_delete: true } }
      - { name: status, type: select, options: { values: [draft, published] } }
    rules:
      list: ""
      view: "status = 'published'"
delete: [legacy]
"#,
        )
        .unwrap();
        assert_eq!(file.collections.len(), 2);
        assert_eq!(file.delete, vec!["legacy".to_string()]);
        assert_eq!(file.collections[0].kind, CollectionType::Auth);

        let posts = &file.collections[1];
        assert_eq!(posts.kind, CollectionType::Base);
        assert_eq!(posts.fields[1].field_type, FieldType::Relation);
        assert!(posts.fields[1].options.cascade_delete);
        assert_eq!(posts.fields[0].options.max, Some(120.0));
        assert_eq!(posts.rules.list.as_deref(), Some(""));
        assert_eq!(posts.rules.create, None);
    }

    #[test]
    fn test_parse_single_collection() {
        let file = parse_schema_str(
            "name: tags\nfields:\n  - { name: label, type: text, unique: true }\n",
        )
        .unwrap();
        assert_eq!(file.collections.len(), 1);
        assert!(file.collections[0].fields[0].unique);
    }

    #[test]
    fn test_unknown_field_type_rejected() {
        let result = parse_collection_str("name: x\nfields:\n  - { name: a, type: blob }\n");
        assert!(result.is_err());
    }
}
