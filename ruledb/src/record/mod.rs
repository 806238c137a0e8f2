mod value;

pub use value::{cast_value, format_date, json_to_sql, parse_date, sql_to_json, to_column_value};

use crate::caller::CallerContext;
use crate::schema::Collection;
use rusqlite::types::Value as SqlValue;
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;

/// A stored record of one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub collection_id: String,
    pub collection_name: String,
    pub id: String,
    /// System and declared field values (everything except `id`).
    pub data: Map<String, JsonValue>,
    /// Expanded relations, keyed by relation field name.
    pub expand: BTreeMap<String, Record>,
}

impl Record {
    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        if field == "id" {
            return None;
        }
        self.data.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(JsonValue::as_str)
    }

    pub fn created(&self) -> Option<&str> {
        self.get_str("created")
    }

    pub fn updated(&self) -> Option<&str> {
        self.get_str("updated")
    }

    /// Build a record from a row whose columns follow `collection.columns()`.
    pub(crate) fn from_row(collection: &Collection, row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
        let mut id = String::new();
        let mut data = Map::new();
        for (idx, column) in collection.columns().into_iter().enumerate() {
            let value: SqlValue = row.get(idx)?;
            if column.name == "id" {
                if let SqlValue::Text(text) = value {
                    id = text;
                }
                continue;
            }
            data.insert(column.name, sql_to_json(column.field_type, value));
        }
        Ok(Record {
            collection_id: collection.id.clone(),
            collection_name: collection.name.clone(),
            id,
            data,
            expand: BTreeMap::new(),
        })
    }

    /// Column values in `collection.columns()` order.
    pub(crate) fn column_values(&self, collection: &Collection) -> Vec<SqlValue> {
        collection
            .columns()
            .into_iter()
            .map(|column| {
                if column.name == "id" {
                    return SqlValue::Text(self.id.clone());
                }
                match self.data.get(&column.name) {
                    Some(value) => to_column_value(column.field_type, value),
                    None => SqlValue::Null,
                }
            })
            .collect()
    }

    /// Remove the email of an auth record unless the caller may see it.
    pub fn visible_to(mut self, collection: &Collection, caller: &CallerContext) -> Record {
        if collection.is_auth() {
            let public = self
                .data
                .get("email_visibility")
                .and_then(JsonValue::as_bool)
                .unwrap_or(false);
            if !public && !caller.is_admin() && !caller.is_record(&self.collection_id, &self.id) {
                self.data.remove("email");
            }
        }
        self
    }

    pub fn to_json(&self) -> JsonValue {
        let mut out = Map::new();
        out.insert("id".into(), JsonValue::String(self.id.clone()));
        out.insert("collectionId".into(), JsonValue::String(self.collection_id.clone()));
        out.insert(
            "collectionName".into(),
            JsonValue::String(self.collection_name.clone()),
        );
        for (key, value) in &self.data {
            out.insert(key.clone(), value.clone());
        }
        if !self.expand.is_empty() {
            let expand: Map<String, JsonValue> = self
                .expand
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect();
            out.insert("expand".into(), JsonValue::Object(expand));
        }
        JsonValue::Object(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caller::AuthRecord;
    use crate::schema::{CollectionType, Field, FieldType};
    use serde_json::json;

    fn users() -> Collection {
        let mut users = Collection::new("users", CollectionType::Auth);
        users.id = "c_users".into();
        users.fields.push(Field::new("name", FieldType::Text));
        users
    }

    fn alice(visible: bool) -> Record {
        let mut data = Map::new();
        data.insert("email".into(), json!("a@example.com"));
        data.insert("email_visibility".into(), json!(visible));
        data.insert("name".into(), json!("Alice"));
        Record {
            collection_id: "c_users".into(),
            collection_name: "users".into(),
            id: "alice".into(),
            data,
            expand: BTreeMap::new(),
        }
    }

    #[test]
    fn test_email_hidden_from_others() {
        let users = users();
        let hidden = alice(false).visible_to(&users, &CallerContext::Guest);
        assert!(hidden.get("email").is_none());

        let shown = alice(true).visible_to(&users, &CallerContext::Guest);
        assert_eq!(shown.get_str("email"), Some("a@example.com"));

        let own = CallerContext::Record(AuthRecord {
            collection_id: "c_users".into(),
            collection_name: "users".into(),
            id: "alice".into(),
            data: Map::new(),
        });
        assert!(alice(false).visible_to(&users, &own).get("email").is_some());
        assert!(alice(false).visible_to(&users, &CallerContext::Admin).get("email").is_some());
    }

    #[test]
    fn test_to_json_includes_expand() {
        let mut post = alice(true);
        post.collection_name = "posts".into();
        post.expand.insert("author".into(), alice(true));
        let json = post.to_json();
        assert_eq!(json["collectionName"], json!("posts"));
        assert_eq!(json["expand"]["author"]["name"], json!("Alice"));
    }

    #[test]
    fn test_column_values_follow_columns() {
        let users = users();
        let values = alice(true).column_values(&users);
        assert_eq!(values.len(), users.columns().len());
        assert_eq!(values[0], SqlValue::Text("alice".into()));
        assert_eq!(values[4], SqlValue::Text("a@example.com".into()));
        assert_eq!(values[5], SqlValue::Integer(1));
        assert_eq!(values[1], SqlValue::Null);
    }
}
