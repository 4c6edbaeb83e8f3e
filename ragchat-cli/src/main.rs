//! Ragchat CLI: terminal front-end for the retrieval-augmented chat pipeline.
//!
//! Streams answers from an Ollama-compatible server, keeps transcripts as
//! JSON files and optionally grounds answers in a fixture document set.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Ragchat: chat with a local model, grounded in your documents
#[derive(Parser, Debug)]
#[command(name = "ragchat", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Send a message and stream the answer
    Chat(ChatArgs),
    /// Create an empty conversation
    Init {
        /// Conversation id
        conversation: String,

        /// Directory holding conversation files
        #[arg(long)]
        store_dir: Option<PathBuf>,
    },
    /// Show or initialize configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args, Debug)]
struct ChatArgs {
    /// Conversation id
    conversation: String,

    /// Message text
    #[arg(required = true, num_args = 1..)]
    message: Vec<String>,

    /// Do not save this turn to the conversation
    #[arg(long)]
    no_persist: bool,

    /// Number of documents to retrieve (0 disables retrieval)
    #[arg(long, allow_negative_numbers = true)]
    top_k: Option<i64>,

    /// Minimum relevance score for retrieved documents
    #[arg(long)]
    threshold: Option<f32>,

    /// JSON file of documents: [{"content": "...", "relevanceScore": 0.8}]
    #[arg(long)]
    documents: Option<PathBuf>,

    /// Directory holding conversation files
    #[arg(long)]
    store_dir: Option<PathBuf>,

    /// Model server endpoint
    #[arg(long)]
    endpoint: Option<String>,

    /// Model name
    #[arg(short, long)]
    model: Option<String>,
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write a default `.ragchat/config.toml` in the workspace
    Init,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

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

    let log_dir = directories::ProjectDirs::from("dev", "ragchat", "ragchat")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "ragchat.log");
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

    commands::handle_command(cli.command, &workspace, cli.quiet).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chat_flags() {
        let cli = Cli::try_parse_from([
            "ragchat",
            "chat",
            "c1",
            "What",
            "is",
            "new?",
            "--no-persist",
            "--top-k",
            "2",
            "--threshold",
            "0.5",
        ])
        .unwrap();
        let Commands::Chat(args) = cli.command else {
            panic!("expected chat command");
        };
        assert_eq!(args.conversation, "c1");
        assert_eq!(args.message, vec!["What", "is", "new?"]);
        assert!(args.no_persist);
        assert_eq!(args.top_k, Some(2));
        assert_eq!(args.threshold, Some(0.5));
    }

    #[test]
    fn test_chat_requires_message() {
        assert!(Cli::try_parse_from(["ragchat", "chat", "c1"]).is_err());
    }

    #[test]
    fn test_parse_config_show() {
        let cli = Cli::try_parse_from(["ragchat", "-v", "config", "show"]).unwrap();
        assert_eq!(cli.verbose, 1);
        assert!(matches!(
            cli.command,
            Commands::Config {
                action: ConfigAction::Show
            }
        ));
    }
}
