//! nimbus - Console for OpenStack
//!
//! Authenticate against Keystone, then list and manage compute, block
//! storage, network, image and identity resources. `--mock` serves the
//! same operations from an in-memory backend.

mod commands;
mod config;
mod console;
mod openstack;
mod render;

/// Version injected at compile time via NIMBUS_VERSION env var (set by CI/CD),
/// or "dev" for local builds.
pub const VERSION: &str = match option_env!("NIMBUS_VERSION") {
    Some(v) => v,
    None => "dev",
};

use clap::{Parser, ValueEnum};
use commands::{Command, Globals};
use config::Config;
use openstack::error::{format_api_error, ApiError};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Console for OpenStack
#[derive(Parser, Debug)]
#[command(name = "nimbus", version = VERSION, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Use the in-memory mock backend instead of a real cloud (also NIMBUS_MOCK).
    /// Mock data is seeded fresh on every run, so changes do not carry over
    /// to the next command.
    #[arg(long, global = true)]
    mock: bool,

    /// Print JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    /// After a mutation, wait for the scheduled refresh and print it
    #[arg(long, global = true)]
    wait: bool,

    /// Log level for debugging
    #[arg(long, global = true, value_enum, default_value = "off")]
    log_level: LogLevel,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn directive(self) -> Option<&'static str> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some("error"),
            LogLevel::Warn => Some("warn"),
            LogLevel::Info => Some("info"),
            LogLevel::Debug => Some("debug"),
            LogLevel::Trace => Some("trace"),
        }
    }
}

/// File logging. RUST_LOG, when set, replaces the `--log-level` filter.
fn setup_logging(level: LogLevel) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let directive = level.directive()?;

    let log_path = get_log_path();

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Logging disabled: cannot open {}: {}", log_path.display(), e);
            return None;
        }
    };

    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("nimbus {} started with log level: {:?}", VERSION, level);
    tracing::info!("Log file: {:?}", log_path);

    Some(guard)
}

fn get_log_path() -> PathBuf {
    Config::dir()
        .map(|dir| dir.join("nimbus.log"))
        .unwrap_or_else(|| PathBuf::from("nimbus.log"))
}

fn report(err: &anyhow::Error) -> String {
    match err.downcast_ref::<ApiError>() {
        Some(api) => format_api_error(api),
        None => format!("{:#}", err),
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let _log_guard = setup_logging(args.log_level);

    let globals = Globals {
        mock: args.mock,
        json: args.json,
        wait: args.wait,
    };

    if let Err(err) = commands::run(args.command, globals, Config::load()).await {
        tracing::error!("{:#}", err);
        eprintln!("Error: {}", report(&err));
        std::process::exit(1);
    }
}
