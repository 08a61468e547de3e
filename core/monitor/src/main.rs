//! bomwatch entrypoint.
//!
//! `run` starts the monitor and blocks until SIGINT/SIGTERM; the other
//! subcommands read the version and session store and print JSON.

use bomwatch::config::{load_config, MonitorConfig};
use bomwatch::directory::{HttpMachineDirectory, MachineDirectory, StaticMachineDirectory};
use bomwatch::notify::TracingNotifier;
use bomwatch::source::CommandDocumentSource;
use bomwatch::store::Db;
use bomwatch::{logging, Monitor, MonitorError, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info};

const SIGNAL_CHECK_INTERVAL_MS: u64 = 200;
const DEFAULT_SESSION_LIMIT: usize = 50;

#[derive(Parser)]
#[command(name = "bomwatch")]
#[command(about = "CAD activity monitor with BOM version control")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.bomwatch/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the modeling application until interrupted
    Run,

    /// List the stored versions of an assembly key
    Versions {
        #[arg(value_name = "KEY")]
        key: String,
    },

    /// Item-level diff between two versions of an assembly key
    Diff {
        #[arg(value_name = "KEY")]
        key: String,

        #[arg(value_name = "FROM")]
        from: u32,

        #[arg(value_name = "TO")]
        to: u32,
    },

    /// Most recent work sessions
    Sessions {
        #[arg(long, default_value_t = DEFAULT_SESSION_LIMIT)]
        limit: usize,
    },

    /// Assembly keys with at least one version
    Keys,
}

fn main() {
    let cli = Cli::parse();

    let config = match load_config(cli.config.clone()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("bomwatch: {}", err);
            std::process::exit(2);
        }
    };
    let _logging_guard = logging::init(config.logging.directory.as_deref());

    let result = match cli.command {
        Commands::Run => run(config),
        Commands::Versions { key } => {
            open_store(&config).and_then(|db| print_json(&db.versions(&key)?))
        }
        Commands::Diff { key, from, to } => {
            open_store(&config).and_then(|db| print_json(&db.compare(&key, from, to)?))
        }
        Commands::Sessions { limit } => {
            open_store(&config).and_then(|db| print_json(&db.list_sessions(limit)?))
        }
        Commands::Keys => open_store(&config).and_then(|db| print_json(&db.assembly_keys()?)),
    };

    if let Err(err) = result {
        error!(error = %err, "bomwatch failed");
        std::process::exit(1);
    }
}

fn run(config: MonitorConfig) -> Result<()> {
    let bridge = config.source.bridge_command.clone().ok_or_else(|| {
        MonitorError::Configuration("source.bridge_command is not set".to_string())
    })?;
    let source = Arc::new(
        CommandDocumentSource::new(
            bridge,
            config.source.bridge_args.clone(),
            Duration::from_secs(config.source.timeout_secs),
        )
        .with_extraction_timeout(config.extraction_timeout()),
    );
    let directory: Arc<dyn MachineDirectory> = match config.directory.base_url.as_deref() {
        Some(base_url) => Arc::new(HttpMachineDirectory::new(
            base_url,
            Duration::from_secs(config.directory.timeout_secs),
        )?),
        None => {
            info!("No machine directory configured; machine lookups return not found");
            Arc::new(StaticMachineDirectory::default())
        }
    };
    let store = Arc::new(open_store(&config)?);

    let terminate = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&terminate)).map_err(|err| {
            MonitorError::Configuration(format!("failed to register signal handler: {}", err))
        })?;
    }

    let monitor = Monitor::new(config, source, directory, Arc::new(TracingNotifier), store)?;
    monitor.start();

    while !terminate.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(SIGNAL_CHECK_INTERVAL_MS));
    }

    info!("Shutdown requested");
    let report = monitor.shutdown();
    info!(
        drained = report.drained,
        ended_sessions = report.ended_sessions,
        "bomwatch stopped"
    );
    Ok(())
}

fn open_store(config: &MonitorConfig) -> Result<Db> {
    Db::new(config.db_path()?)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|err| MonitorError::Storage(format!("failed to encode output: {}", err)))?;
    println!("{}", text);
    Ok(())
}
