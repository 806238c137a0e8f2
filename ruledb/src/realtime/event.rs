use crate::record::Record;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

/// A committed record change. For deletes `record` is the pre-delete
/// snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub action: Action,
    pub record: Record,
}

impl ChangeEvent {
    pub fn new(action: Action, record: Record) -> Self {
        ChangeEvent { action, record }
    }

    pub fn collection_id(&self) -> &str {
        &self.record.collection_id
    }
}
