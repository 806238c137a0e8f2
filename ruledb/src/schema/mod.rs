mod parser;
mod types;
mod validate;

pub use parser::{parse_collection_str, parse_schema, parse_schema_str, SchemaFile};
pub use types::*;
pub use validate::{is_valid_identifier, normalize_collection, validate_collection};
