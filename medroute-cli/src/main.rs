//! MedRoute CLI: terminal interface for the medroute answer pipeline.
//!
//! Provides single-question and interactive REPL modes.

mod commands;
mod repl;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// MedRoute: safety-gated answers to medical questions
#[derive(Parser, Debug)]
#[command(name = "medroute", version, about, long_about = None)]
struct Cli {
    /// Question to answer (starts interactive mode if omitted)
    question: Option<String>,

    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Knowledge file (JSON array of documents) to index on startup
    #[arg(short, long)]
    knowledge: Option<PathBuf>,

    /// User id the questions are asked as
    #[arg(short, long, default_value = "local")]
    user: String,

    /// Print outcomes as JSON
    #[arg(long)]
    json: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    /// Subcommand
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Answer a single question
    Ask {
        /// Question to answer
        question: String,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show which capabilities a question routes to
    Classify {
        /// Question to classify
        question: String,
    },
    /// Run the safety filter over a piece of answer text
    Check {
        /// Text to check
        text: String,
    },
}

#[derive(clap::Subcommand, Debug)]
pub enum ConfigAction {
    /// Create a default configuration file in the workspace
    Init,
    /// Show the current effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "medroute", "medroute")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "medroute.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let mut config = match &cli.config {
        Some(path) => medroute_core::config::load_config_file(path)
            .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?,
        None => medroute_core::config::load_config(Some(&workspace), None)
            .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?,
    };
    if let Some(knowledge) = &cli.knowledge {
        config.knowledge.path = Some(knowledge.clone());
    }

    let question = match cli.command {
        Some(Commands::Ask { question }) => Some(question),
        Some(command) => return commands::handle_command(command, config, &workspace).await,
        None => cli.question,
    };

    let pipeline = commands::build_pipeline(&config)?;
    match question {
        Some(question) => repl::run_single_question(&pipeline, &question, &cli.user, cli.json).await,
        None => repl::run_interactive(&pipeline, &cli.user, cli.json).await,
    }
}
