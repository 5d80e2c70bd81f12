//! MEKA CLI: ask grounded questions over a private document corpus.
//!
//! Provides single-question, streaming, background and interactive modes.

mod commands;
mod repl;

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// MEKA: Multi-agent Expert Knowledge Assistant
#[derive(Parser, Debug)]
#[command(name = "meka", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (corpus, indexes and threads resolve against it)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// LLM model to use
    #[arg(short, long, global = true)]
    model: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every question-answering command.
#[derive(clap::Args, Debug, Clone)]
pub(crate) struct QueryArgs {
    /// Include web search results
    #[arg(long)]
    web: bool,

    /// Conversation thread
    #[arg(short, long)]
    thread: Option<String>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Answer one question and print the result
    Ask {
        question: String,
        #[command(flatten)]
        query: QueryArgs,
        /// Print the final state as JSON
        #[arg(long)]
        json: bool,
    },
    /// Answer one question, printing each stage as it completes
    Stream {
        question: String,
        #[command(flatten)]
        query: QueryArgs,
    },
    /// Multi-turn conversation on one thread
    Chat {
        #[command(flatten)]
        query: QueryArgs,
    },
    /// Run a question in the background and poll its status
    Submit {
        question: String,
        #[command(flatten)]
        query: QueryArgs,
        /// Status polling interval in milliseconds
        #[arg(long, default_value = "500")]
        poll_ms: u64,
    },
    /// Rebuild the vector and keyword indexes from the corpus
    Resync,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a default `.meka/config.toml` in the workspace
    Init,
    /// Print the effective configuration
    Show,
}

/// Canonicalize the workspace directory. A missing path is an error, never a
/// silent fallback to the current directory.
fn resolve_workspace(path: &Path) -> anyhow::Result<PathBuf> {
    let workspace = path
        .canonicalize()
        .with_context(|| format!("Workspace '{}' is not accessible", path.display()))?;
    if !workspace.is_dir() {
        anyhow::bail!("Workspace '{}' is not a directory", workspace.display());
    }
    Ok(workspace)
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

    let log_dir = directories::ProjectDirs::from("dev", "meka", "meka")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "meka.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("meka_core=debug,meka=debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = resolve_workspace(&cli.workspace)?;
    tracing::debug!(workspace = %workspace.display(), "Resolved workspace");

    commands::handle_command(cli.command, cli.model, &workspace).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_existing_workspace() {
        let dir = TempDir::new().unwrap();
        let resolved = resolve_workspace(dir.path()).unwrap();
        assert_eq!(resolved, dir.path().canonicalize().unwrap());
    }

    #[test]
    fn test_missing_workspace_is_an_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("no-such-dir");
        let err = resolve_workspace(&missing).unwrap_err();
        assert!(err.to_string().contains("no-such-dir"));
    }

    #[test]
    fn test_file_workspace_is_an_error() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("corpus.txt");
        std::fs::write(&file, "Paris").unwrap();
        assert!(resolve_workspace(&file).is_err());
    }
}
