use serde_json::{Map, Value};

/// An authenticated record of an `auth` collection acting as the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthRecord {
    pub collection_id: String,
    pub collection_name: String,
    pub id: String,
    /// Field values of the auth record as loaded from storage.
    pub data: Map<String, Value>,
}

/// The identity a request runs as. Built per request and never shared.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CallerContext {
    #[default]
    Guest,
    Record(AuthRecord),
    /// Privileged caller; bypasses every rule.
    Admin,
}

impl CallerContext {
    pub fn is_admin(&self) -> bool {
        matches!(self, CallerContext::Admin)
    }

    pub fn auth_record(&self) -> Option<&AuthRecord> {
        match self {
            CallerContext::Record(record) => Some(record),
            _ => None,
        }
    }

    /// Whether this caller is the given record.
    pub fn is_record(&self, collection_id: &str, id: &str) -> bool {
        self.auth_record()
            .is_some_and(|r| r.collection_id == collection_id && r.id == id)
    }

    /// Identity key used to share rule results between callers that would
    /// compile to the same predicate.
    pub fn cache_key(&self) -> String {
        match self {
            CallerContext::Guest => "guest".to_string(),
            CallerContext::Admin => "admin".to_string(),
            CallerContext::Record(r) => format!("{}/{}", r.collection_id, r.id),
        }
    }
}
