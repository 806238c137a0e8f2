pub mod caller;
pub mod config;
pub mod error;
pub mod files;
pub mod migration;
pub mod realtime;
pub mod record;
pub mod rules;
pub mod schema;
pub mod store;
pub mod system_db;
pub mod util;
pub mod validation;
pub mod view;

pub use caller::{AuthRecord, CallerContext};
pub use config::{Config, RealtimeConfig};
pub use error::{Result, RuleDbError, ValidationErrors};
pub use files::{FileStorage, LocalFileStorage};
pub use migration::{AppliedMigration, ApplyOptions, SchemaChange, StepOutcome};
pub use realtime::{Action, ChangeEvent, Hub, Message, Subscriber};
pub use record::Record;
pub use schema::{Collection, CollectionType, Field, FieldType, Operation, Schema, SchemaFile};
pub use store::{CollectionHandle, ListQuery, ListResult, Store};
pub use system_db::LedgerEntry;
