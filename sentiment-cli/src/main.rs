//! sentiment-ops: serve, train and manage the review sentiment model.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Review sentiment model lifecycle service
#[derive(Parser, Debug)]
#[command(name = "sentiment-ops", version, about, long_about = None)]
pub(crate) struct Cli {
    /// Configuration file path (defaults to ./sentiment-ops.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors to stderr
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum Commands {
    /// Run the HTTP gateway with the scheduled retrain loop
    Serve {
        /// Bind address (overrides server.host)
        #[arg(long)]
        host: Option<String>,
        /// Port (overrides server.port)
        #[arg(short, long)]
        port: Option<u16>,
        /// Do not bootstrap when no production model exists
        #[arg(long)]
        no_bootstrap: bool,
    },
    /// Train every configured model family and print their scores
    Train {
        /// CSV file or directory of CSVs (defaults to training.initial_data_path)
        #[arg(short, long)]
        data: Option<PathBuf>,
        /// Comma separated families to train: lr, nb, rf, xgb
        #[arg(short, long, value_delimiter = ',')]
        families: Vec<String>,
        /// Promote the best candidate through the promotion engine
        #[arg(long)]
        promote: bool,
    },
    /// Run one full retrain cycle inline (load, train, promote)
    Retrain {
        /// Train from the bootstrap dataset and snapshot it first
        #[arg(long)]
        bootstrap: bool,
    },
    /// Summarize a dataset and log the summary to the tracking backend
    Eda {
        /// CSV file (defaults to training.initial_data_path)
        #[arg(short, long)]
        data: Option<PathBuf>,
    },
    /// Ask the promotion engine to promote a finished run
    Promote {
        /// Run that produced the candidate version
        run_id: String,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum ConfigAction {
    /// Write the default configuration as TOML
    Init {
        /// Target file
        #[arg(default_value = sentiment_core::config::DEFAULT_CONFIG_FILE)]
        path: PathBuf,
    },
    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)));

    let log_dir = directories::ProjectDirs::from("dev", "sentiment-ops", "sentiment-ops")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "sentiment-ops.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    commands::handle_command(cli.command, cli.config.as_deref()).await
}
