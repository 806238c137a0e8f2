use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Field-scoped validation failures, keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(pub BTreeMap<String, String>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.add(field, message);
        errors
    }

    /// Record an error for a field. The first message for a field wins.
    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.entry(field.into()).or_insert_with(|| message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(RuleDbError::Validation(self))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}: {v}")).collect();
        write!(f, "{}", parts.join("; "))
    }
}

#[derive(Error, Debug)]
pub enum RuleDbError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Validation failed: {0}")]
    Validation(ValidationErrors),

    #[error("Rule error: {0}")]
    Rule(String),

    #[error("Record not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Access denied: {0}")]
    RuleDenied(String),

    #[error("Schema conflict: {0}")]
    SchemaConflict(String),

    #[error("Migration lock is held by another process")]
    MigrationLockContention,

    #[error("Subscriber {0} could not keep up and was disconnected")]
    SubscriberOverflow(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("SQL parse error: {0}")]
    SqlParse(String),

    #[error("{0}")]
    Other(String),
}

impl RuleDbError {
    /// Map a storage failure raised inside a write. Unique constraint violations
    /// become field validation errors; everything else stays a storage error.
    pub fn from_write(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, Some(message)) = &err {
            if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE {
                // "UNIQUE constraint failed: posts.slug"
                let field = message
                    .rsplit(':')
                    .next()
                    .and_then(|cols| cols.split(',').next())
                    .and_then(|col| col.trim().rsplit('.').next())
                    .unwrap_or("id")
                    .to_string();
                return RuleDbError::Validation(ValidationErrors::single(
                    field,
                    "value must be unique",
                ));
            }
        }
        RuleDbError::Sqlite(err)
    }

    /// Whether this error is an SQLite busy/locked condition.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            RuleDbError::Sqlite(rusqlite::Error::SqliteFailure(failure, _))
                if failure.code == rusqlite::ErrorCode::DatabaseBusy
                    || failure.code == rusqlite::ErrorCode::DatabaseLocked
        )
    }
}

pub(crate) fn poisoned<T>(_: std::sync::PoisonError<T>) -> RuleDbError {
    RuleDbError::Other("internal lock poisoned".into())
}

pub type Result<T> = std::result::Result<T, RuleDbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_display() {
        let mut errors = ValidationErrors::new();
        errors.add("title", "is required");
        errors.add("title", "second message is ignored");
        errors.add("count", "must be a number");
        assert_eq!(errors.to_string(), "count: must be a number; title: is required");
        assert!(errors.into_result().is_err());
    }

    #[test]
    fn test_empty_validation_errors_is_ok() {
        assert!(ValidationErrors::new().into_result().is_ok());
    }
}
