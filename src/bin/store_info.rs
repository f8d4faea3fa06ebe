//! ratiosim store inspector
//!
//! Prints the layout and fill state of a chunked sample store.

use std::path::PathBuf;

use log::info;
use serde_json::json;

use ratiosim::storage::{open_store, RowStatus, StoreConfig};

/// Inspector configuration
struct Config {
    /// Store directory
    store: PathBuf,
    /// Lock file override
    lock_path: Option<PathBuf>,
    /// Emit JSON instead of text
    json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: PathBuf::from("./sims.store"),
            lock_path: None,
            json: false,
        }
    }
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--store" | "-s" => {
                if i + 1 < args.len() {
                    config.store = PathBuf::from(&args[i + 1]);
                    i += 2;
                } else {
                    eprintln!("error: --store requires a value");
                    std::process::exit(1);
                }
            }
            "--lock" | "-l" => {
                if i + 1 < args.len() {
                    config.lock_path = Some(PathBuf::from(&args[i + 1]));
                    i += 2;
                } else {
                    eprintln!("error: --lock requires a value");
                    std::process::exit(1);
                }
            }
            "--json" => {
                config.json = true;
                i += 1;
            }
            "--help" | "-h" => {
                println!("store-info - ratiosim store inspector");
                println!();
                println!("USAGE:");
                println!("    store-info [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -s, --store <DIR>         Store directory [default: ./sims.store]");
                println!("    -l, --lock <PATH>         Lock file [default: <store>.lock]");
                println!("        --json                Print a JSON summary");
                println!("    -h, --help                Print help information");
                std::process::exit(0);
            }
            arg => {
                eprintln!("error: unknown argument: {arg}");
                std::process::exit(1);
            }
        }
    }

    config
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let config = parse_args();

    info!("Opening store at {}", config.store.display());
    let store = open_store(
        &config.store,
        Some(StoreConfig {
            sync_on_write: false,
            lock_path: config.lock_path,
        }),
    )?;
    if !store.is_initialized() {
        eprintln!("error: {} is not an initialized store", config.store.display());
        std::process::exit(2);
    }

    let attrs = store.attrs()?;
    let status = store.status()?;
    let filled = status.iter().filter(|s| **s == RowStatus::Filled).count();

    if config.json {
        let summary = json!({
            "path": config.store,
            "lock_path": store.lock_path(),
            "len": status.len(),
            "filled": filled,
            "sims_required": status.len() - filled,
            "chunk_size": attrs.chunk_size,
            "format_version": attrs.format_version,
            "created_at": attrs.created_at,
            "variables": attrs.variables,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("ratiosim store v{}", env!("CARGO_PKG_VERSION"));
    println!("path:          {}", config.store.display());
    println!("lock:          {}", store.lock_path().display());
    println!("created:       {}", attrs.created_at.to_rfc3339());
    println!("rows:          {} ({filled} filled, {} required)", status.len(), status.len() - filled);
    println!("chunk size:    {}", attrs.chunk_size);
    println!("variables:");
    for (name, spec) in &attrs.variables {
        println!("    {name:<16} {:<4} {:?}", spec.dtype.to_string(), spec.shape);
    }
    Ok(())
}
