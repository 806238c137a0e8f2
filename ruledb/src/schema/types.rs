use crate::error::{Result, RuleDbError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Maximum number of relation hops a rule, filter or expand path may take.
pub const MAX_RELATION_DEPTH: usize = 6;

/// Columns every collection carries.
pub const BASE_SYSTEM_FIELDS: &[&str] = &["id", "created", "updated"];

/// Additional columns carried by `auth` collections.
pub const AUTH_SYSTEM_FIELDS: &[&str] = &["username", "email", "email_visibility", "verified"];

/// Definition of a single collection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Collection {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: CollectionType,
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(default)]
    pub rules: Rules,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<IndexDefinition>,
    /// Backing SELECT of a `view` collection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_query: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionType {
    #[default]
    Base,
    Auth,
    View,
}

impl CollectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionType::Base => "base",
            CollectionType::Auth => "auth",
            CollectionType::View => "view",
        }
    }
}

/// The five access rule slots. `None` restricts the operation to admins,
/// `Some("")` allows everyone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rules {
    #[serde(default)]
    pub list: Option<String>,
    #[serde(default)]
    pub view: Option<String>,
    #[serde(default)]
    pub create: Option<String>,
    #[serde(default)]
    pub update: Option<String>,
    #[serde(default)]
    pub delete: Option<String>,
}

impl Rules {
    pub fn get(&self, op: Operation) -> Option<&str> {
        match op {
            Operation::List => self.list.as_deref(),
            Operation::View => self.view.as_deref(),
            Operation::Create => self.create.as_deref(),
            Operation::Update => self.update.as_deref(),
            Operation::Delete => self.delete.as_deref(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Operation, Option<&str>)> {
        Operation::ALL.into_iter().map(move |op| (op, self.get(op)))
    }
}

/// Record operations gated by rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    List,
    View,
    Create,
    Update,
    Delete,
}

impl Operation {
    pub const ALL: [Operation; 5] = [
        Operation::List,
        Operation::View,
        Operation::Create,
        Operation::Update,
        Operation::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::List => "list",
            Operation::View => "view",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Operation::Create | Operation::Update | Operation::Delete)
    }
}

/// Definition of a single field in a collection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Field {
    /// Stable identifier; survives renames.
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub options: FieldOptions,
}

impl Field {
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Field {
            id: String::new(),
            name: name.to_string(),
            field_type,
            required: false,
            unique: false,
            options: FieldOptions::default(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn relation_to(mut self, collection: &str, cascade_delete: bool) -> Self {
        self.options.collection_id = Some(collection.to_string());
        self.options.cascade_delete = cascade_delete;
        self
    }
}

/// Field type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Number,
    Bool,
    Date,
    Json,
    File,
    Relation,
    Select,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Number => "number",
            FieldType::Bool => "bool",
            FieldType::Date => "date",
            FieldType::Json => "json",
            FieldType::File => "file",
            FieldType::Relation => "relation",
            FieldType::Select => "select",
        }
    }

    pub fn parse(name: &str) -> Option<FieldType> {
        Some(match name {
            "text" => FieldType::Text,
            "number" => FieldType::Number,
            "bool" => FieldType::Bool,
            "date" => FieldType::Date,
            "json" => FieldType::Json,
            "file" => FieldType::File,
            "relation" => FieldType::Relation,
            "select" => FieldType::Select,
            _ => return None,
        })
    }

    /// Declared SQLite column type.
    pub fn sql_type(&self) -> &'static str {
        match self {
            FieldType::Number => "REAL",
            FieldType::Bool => "INTEGER",
            _ => "TEXT",
        }
    }

    pub fn is_sortable(&self) -> bool {
        !matches!(self, FieldType::Json)
    }
}

/// Type-specific field options. Only the options relevant to a field's type
/// are consulted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FieldOptions {
    /// Minimum length (text) or value (number).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Maximum length (text) or value (number).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Allowed values of a select field.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
    /// Target collection of a relation field (id, or name before normalization).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cascade_delete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexDefinition {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

/// A physical column: system or declared.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub field_type: FieldType,
}

impl Collection {
    pub fn new(name: &str, kind: CollectionType) -> Self {
        Collection {
            id: String::new(),
            name: name.to_string(),
            kind,
            fields: Vec::new(),
            rules: Rules::default(),
            indexes: Vec::new(),
            view_query: None,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_by_id(&self, id: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.id == id)
    }

    pub fn is_view(&self) -> bool {
        self.kind == CollectionType::View
    }

    pub fn is_auth(&self) -> bool {
        self.kind == CollectionType::Auth
    }

    /// Names of the system columns of this collection type.
    pub fn system_fields(&self) -> Vec<&'static str> {
        let mut names = BASE_SYSTEM_FIELDS.to_vec();
        if self.is_auth() {
            names.extend_from_slice(AUTH_SYSTEM_FIELDS);
        }
        names
    }

    pub fn is_system_field(&self, name: &str) -> bool {
        self.system_fields().contains(&name)
    }

    /// The type of a system or declared column, if it exists.
    pub fn column_type(&self, name: &str) -> Option<FieldType> {
        if let Some(field) = self.field(name) {
            return Some(field.field_type);
        }
        if !self.is_system_field(name) {
            return None;
        }
        Some(match name {
            "created" | "updated" => FieldType::Date,
            "email_visibility" | "verified" => FieldType::Bool,
            _ => FieldType::Text,
        })
    }

    /// All projected columns in table order: system fields first.
    pub fn columns(&self) -> Vec<Column> {
        let mut columns: Vec<Column> = self
            .system_fields()
            .into_iter()
            .filter_map(|name| {
                self.column_type(name).map(|field_type| Column {
                    name: name.to_string(),
                    field_type,
                })
            })
            .collect();
        columns.extend(self.fields.iter().map(|f| Column {
            name: f.name.clone(),
            field_type: f.field_type,
        }));
        columns
    }
}

/// An immutable snapshot of all collection definitions.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    /// Ledger sequence the snapshot was read at.
    pub version: i64,
    collections: Vec<Arc<Collection>>,
}

impl Schema {
    pub fn new(version: i64, collections: Vec<Collection>) -> Self {
        Schema {
            version,
            collections: collections.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn collections(&self) -> &[Arc<Collection>] {
        &self.collections
    }

    pub fn by_id(&self, id: &str) -> Option<&Arc<Collection>> {
        self.collections.iter().find(|c| c.id == id)
    }

    /// Case-insensitive name lookup.
    pub fn by_name(&self, name: &str) -> Option<&Arc<Collection>> {
        self.collections
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Look a collection up by id first, then by name.
    pub fn find(&self, name_or_id: &str) -> Option<&Arc<Collection>> {
        self.by_id(name_or_id).or_else(|| self.by_name(name_or_id))
    }

    pub fn get(&self, name_or_id: &str) -> Result<&Arc<Collection>> {
        self.find(name_or_id)
            .ok_or_else(|| RuleDbError::CollectionNotFound(name_or_id.to_string()))
    }

    /// Resolve the target collection of a relation field.
    pub fn relation_target(&self, field: &Field) -> Option<&Arc<Collection>> {
        if field.field_type != FieldType::Relation {
            return None;
        }
        field
            .options
            .collection_id
            .as_deref()
            .and_then(|target| self.find(target))
    }

    /// Relation fields (in any collection) pointing at the given collection.
    pub fn referencing_fields(&self, target_id: &str) -> Vec<(Arc<Collection>, Field)> {
        let mut refs = Vec::new();
        for collection in &self.collections {
            for field in &collection.fields {
                if field.field_type == FieldType::Relation
                    && field.options.collection_id.as_deref() == Some(target_id)
                {
                    refs.push((collection.clone(), field.clone()));
                }
            }
        }
        refs
    }

    /// A copy of this schema with `collection` inserted or replacing the entry
    /// with the same id.
    pub fn with_collection(&self, collection: Collection) -> Schema {
        let mut collections = self.collections.clone();
        match collections.iter().position(|c| c.id == collection.id) {
            Some(pos) => collections[pos] = Arc::new(collection),
            None => collections.push(Arc::new(collection)),
        }
        Schema {
            version: self.version,
            collections,
        }
    }

    pub fn without_collection(&self, id: &str) -> Schema {
        Schema {
            version: self.version,
            collections: self
                .collections
                .iter()
                .filter(|c| c.id != id)
                .cloned()
                .collect(),
        }
    }
}
