//! # bucketkv - inspect and edit a bucket store from the shell
//!
//! Values are read and written as JSON through the default record encoding,
//! so anything an application stores with `JsonSerializer` shows up here
//! as-is.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::filter::EnvFilter;

use bucketkv::{ConnectionState, KvError, KvStore, RecordWrapper, StoreConfig};

/// Inspect and edit a bucketkv store.
///
/// The store is located through a JSON configuration file (`--config`) or
/// directly with `--db-path`. Without either the store is disabled and only
/// `status` works.
#[derive(Parser, Debug)]
#[command(name = "bucketkv", version, about = "Inspect and edit a bucketkv store")]
struct Args {
    /// Path to the JSON store configuration.
    #[arg(long, env = "BUCKETKV_CONFIG")]
    config: Option<PathBuf>,

    /// Database location. Overrides `db-path` from the configuration file.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Key separator. Overrides `bucket-separator` from the configuration file.
    #[arg(long)]
    separator: Option<String>,

    /// Log level - 'trace', 'debug', 'info', 'warn', or 'error'.
    /// Logs go to stderr.
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the value stored at a key.
    Get { key: String },

    /// Store a JSON value at a key.
    Put {
        key: String,
        /// JSON text, e.g. '{"mtu": 1500}' or '"plain string"'
        value: String,
    },

    /// Delete a key, or every key under a prefix.
    Delete {
        key: String,
        /// Treat KEY as a prefix.
        #[arg(long)]
        prefix: bool,
    },

    /// List keys under a prefix.
    Keys {
        #[arg(default_value = "")]
        prefix: String,
    },

    /// List keys and values under a prefix.
    Values {
        #[arg(default_value = "")]
        prefix: String,
    },

    /// Show the store state and revision.
    Status,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    initialize_tracing(&args.log_level)?;

    let config = build_store_config(&args)?;
    let store = KvStore::new(config)?;
    debug!(state = %store.state(), "Store ready");

    let result = run(&store, &args.command);
    store.close()?;
    result
}

fn run(store: &KvStore, command: &Command) -> anyhow::Result<()> {
    if !matches!(command, Command::Status) && store.state() != ConnectionState::Open {
        bail!("no store configured: pass --config or --db-path");
    }

    let records: RecordWrapper<serde_json::Value> = store.records();
    match command {
        Command::Get { key } => match records.get(key)? {
            Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            None => bail!("key not found: {}", key),
        },
        Command::Put { key, value } => {
            let value = parse_value(value)?;
            records.put(key, &value)?;
        }
        Command::Delete { key, prefix: true } => {
            let removed = records.delete_prefix(key)?;
            println!("deleted {} keys", removed);
        }
        Command::Delete { key, prefix: false } => {
            if !records.delete(key)? {
                bail!("key not found: {}", key);
            }
        }
        Command::Keys { prefix } => {
            for key in records.list_keys(prefix)? {
                println!("{}", key?);
            }
        }
        Command::Values { prefix } => {
            for entry in records.list_values(prefix)? {
                match entry {
                    Ok((key, value)) => println!("{} = {}", key, value),
                    // Keep listing past values written with another encoding.
                    Err(KvError::Decode { key, source }) => {
                        eprintln!("{}: undecodable value ({})", key, source)
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Command::Status => println!("{}", status_line(store)?),
    }

    Ok(())
}

/// Initialize the tracing/logging system with the specified log level.
fn initialize_tracing(log_level: &str) -> anyhow::Result<()> {
    let env_filter = match log_level {
        "trace" | "debug" | "info" | "warn" | "error" => EnvFilter::new(log_level),
        _ => {
            eprintln!("Invalid log level: {}. Using 'warn'", log_level);
            EnvFilter::new("warn")
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();

    Ok(())
}

/// Resolves the store configuration from the command line.
///
/// `--db-path` wins over the configuration file. A configuration file that
/// does not exist leaves the store disabled.
fn build_store_config(args: &Args) -> anyhow::Result<Option<StoreConfig>> {
    let mut config = match (&args.db_path, &args.config) {
        (Some(db_path), file) => {
            let base = match file {
                Some(path) => load_optional(path)?,
                None => None,
            };
            Some(match base {
                Some(mut config) => {
                    config.db_path = db_path.clone();
                    config
                }
                None => StoreConfig::new(db_path.clone()),
            })
        }
        (None, Some(path)) => load_optional(path)?,
        (None, None) => None,
    };

    if let (Some(config), Some(separator)) = (config.as_mut(), &args.separator) {
        config.bucket_separator = separator.clone();
    }

    Ok(config)
}

fn load_optional(path: &Path) -> anyhow::Result<Option<StoreConfig>> {
    match StoreConfig::load(path) {
        Ok(config) => Ok(Some(config)),
        Err(KvError::ConfigMissing(_)) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to load {}", path.display())),
    }
}

/// Parses command-line JSON text.
fn parse_value(text: &str) -> anyhow::Result<serde_json::Value> {
    serde_json::from_str(text).with_context(|| {
        format!("value is not valid JSON (quote plain strings): {}", text)
    })
}

fn status_line(store: &KvStore) -> anyhow::Result<String> {
    let line = match (store.state(), store.config()) {
        (ConnectionState::Open, Some(config)) => format!(
            "state: {}\npath: {}\nseparator: {:?}\nrevision: {}",
            store.state(),
            config.db_path.display(),
            config.bucket_separator,
            store.raw().revision()?
        ),
        (state, _) => format!("state: {}", state),
    };
    Ok(line)
}
