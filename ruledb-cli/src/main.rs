use clap::{Parser, Subcommand, ValueEnum};
use ruledb::{ApplyOptions, CallerContext, ListQuery, Store};
use serde::Serialize;
use std::path::PathBuf;
use std::process;

/// ruledb CLI: manage collections and records of a ruledb data directory
#[derive(Parser)]
#[command(name = "ruledb", version, about)]
struct Cli {
    /// Path to the data directory (default: current directory)
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    /// Caller identity for record commands: admin, guest or <collection>/<id>
    #[arg(long = "as", default_value = "admin")]
    caller: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run pending migration step files
    Migrate {
        /// Directory holding the step files (default: <data-dir>/migrations)
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Apply a schema file (one collection or a `collections` document)
    Apply {
        file: PathBuf,
        /// Turn values that cannot be converted by a retype into NULL
        #[arg(long)]
        allow_truncation: bool,
    },

    /// List collection definitions
    Collections,

    /// Drop a collection and all of its records
    DropCollection { name: String },

    /// Show the migration ledger
    Ledger,

    /// List records of a collection
    List {
        collection: String,
        /// Filter expression, e.g. "status = 'published'"
        #[arg(long)]
        filter: Option<String>,
        /// Sort keys, e.g. "-created,title"
        #[arg(long)]
        sort: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long)]
        per_page: Option<usize>,
        /// Relations to expand, e.g. "author,comments.user"
        #[arg(long)]
        expand: Option<String>,
    },

    /// Get a single record by ID
    Get {
        collection: String,
        id: String,
        #[arg(long)]
        expand: Option<String>,
    },

    /// Create a record
    Create {
        collection: String,
        /// Field values (e.g. --field title="Hello")
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
    },

    /// Update a record
    Update {
        collection: String,
        id: String,
        /// Field values to change (e.g. --field status=published)
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
    },

    /// Delete a record
    Delete { collection: String, id: String },
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("Invalid key=value pair: no '=' found in '{s}'"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn resolve_caller(store: &Store, identity: &str) -> Result<CallerContext, Box<dyn std::error::Error>> {
    match identity {
        "admin" => Ok(CallerContext::Admin),
        "guest" => Ok(CallerContext::Guest),
        other => {
            let (collection, id) = other
                .split_once('/')
                .ok_or_else(|| format!("invalid caller '{other}', expected <collection>/<id>"))?;
            Ok(store.auth_caller(collection, id)?)
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let store = Store::open(&cli.data_dir)?;
    let format = &cli.format;

    match cli.command {
        Command::Migrate { dir } => {
            let dir = dir.unwrap_or_else(|| cli.data_dir.join("migrations"));
            let outcomes = store.run_migrations(&dir)?;
            print_output(&outcomes, format)?;
        }

        Command::Apply {
            file,
            allow_truncation,
        } => {
            let yaml = std::fs::read_to_string(&file)
                .map_err(|e| format!("Failed to read schema file '{}': {e}", file.display()))?;
            let applied = store.apply_yaml(&yaml, ApplyOptions { allow_truncation })?;
            print_output(&applied, format)?;
        }

        Command::Collections => {
            print_output(&store.collections()?, format)?;
        }

        Command::DropCollection { name } => {
            let entry = store.delete_collection(&name)?;
            print_output(&entry, format)?;
        }

        Command::Ledger => {
            print_output(&store.ledger()?, format)?;
        }

        Command::List {
            collection,
            filter,
            sort,
            page,
            per_page,
            expand,
        } => {
            let caller = resolve_caller(&store, &cli.caller)?;
            let query = ListQuery {
                filter,
                sort,
                page,
                per_page,
                expand,
            };
            let result = store.collection(&collection)?.list(&caller, &query)?;
            print_output(&result.to_json(), format)?;
        }

        Command::Get {
            collection,
            id,
            expand,
        } => {
            let caller = resolve_caller(&store, &cli.caller)?;
            let record = store
                .collection(&collection)?
                .view(&caller, &id, expand.as_deref())?;
            print_output(&record.to_json(), format)?;
        }

        Command::Create { collection, fields } => {
            let caller = resolve_caller(&store, &cli.caller)?;
            let record = store
                .collection(&collection)?
                .create(&caller, &fields_to_value(&fields))?;
            print_output(&record.to_json(), format)?;
        }

        Command::Update {
            collection,
            id,
            fields,
        } => {
            let caller = resolve_caller(&store, &cli.caller)?;
            let record = store
                .collection(&collection)?
                .update(&caller, &id, &fields_to_value(&fields))?;
            print_output(&record.to_json(), format)?;
        }

        Command::Delete { collection, id } => {
            let caller = resolve_caller(&store, &cli.caller)?;
            store.collection(&collection)?.delete(&caller, &id)?;
            print_output(&serde_json::json!({ "ok": true, "deleted": id }), format)?;
        }
    }

    Ok(())
}

fn print_output<T: Serialize + ?Sized>(
    value: &T,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

fn fields_to_value(fields: &[(String, String)]) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (key, val) in fields {
        // Numbers, booleans, arrays and objects parse as JSON; anything else is text.
        let json_val = serde_json::from_str(val).unwrap_or(serde_json::Value::String(val.clone()));
        map.insert(key.clone(), json_val);
    }
    serde_json::Value::Object(map)
}
