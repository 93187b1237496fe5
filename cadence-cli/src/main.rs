//! Cadence CLI: resumable training runs from the terminal.
//!
//! Trains the bundled reference model, inspects run directories, and manages
//! configuration files.

mod commands;
mod toy;

use clap::Parser;
use commands::{INTERRUPTED_EXIT_CODE, Outcome};
use std::path::{Path, PathBuf};
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Cadence: resumable, checkpointed training loops
#[derive(Parser, Debug)]
#[command(name = "cadence", version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only report errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Train the reference model
    Train(commands::TrainArgs),
    /// Show the persisted position and checkpoints of a run
    Status {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Run name
        #[arg(short, long)]
        name: Option<String>,

        /// Root directory holding run directories
        #[arg(long)]
        checkpoints_dir: Option<PathBuf>,
    },
    /// Manage configuration files
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
pub enum ConfigAction {
    /// Write a config file with every default spelled out
    Init {
        #[arg(default_value = "cadence.toml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Show {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "cadence", "cadence")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("./logs"));
    let _ = std::fs::create_dir_all(&log_dir);
    let (json_layer, log_guard) = json_file_layer(&log_dir);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    match commands::handle_command(cli.command).await? {
        Outcome::Completed => Ok(()),
        Outcome::Interrupted => {
            // Returning would shut the runtime down, which waits for the
            // training thread. Flush the log writer and leave instead.
            drop(log_guard);
            std::process::exit(INTERRUPTED_EXIT_CODE);
        }
    }
}

/// JSON lines written through a background thread to a daily rolling
/// `cadence.log`. Lines still queued are written when the guard drops.
fn json_file_layer<S>(log_dir: &Path) -> (impl Layer<S> + Send + Sync, WorkerGuard)
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let file_appender = tracing_appender::rolling::daily(log_dir, "cadence.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));
    (layer, guard)
}
