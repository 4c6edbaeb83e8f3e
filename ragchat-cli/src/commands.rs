//! CLI subcommand handlers.

use crate::{ChatArgs, Commands, ConfigAction};
use ragchat_core::config::{load_config, workspace_config_path};
use ragchat_core::{
    BackendConfig, ChatOrchestrator, DocumentQueryConfig, DocumentSource, GenerationEvent,
    GenerationRequest, InMemoryDocumentIndex, JsonFileChatStore, OllamaBackend, PipelineConfig,
    PipelineError, StoreError,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, workspace: &Path, quiet: bool) -> anyhow::Result<()> {
    match command {
        Commands::Chat(args) => handle_chat(args, workspace, quiet).await,
        Commands::Init {
            conversation,
            store_dir,
        } => handle_init(&conversation, store_dir).await,
        Commands::Config { action } => handle_config(action, workspace),
    }
}

fn load(workspace: &Path) -> anyhow::Result<PipelineConfig> {
    let config = load_config(Some(workspace), None)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    config.validate()?;
    Ok(config)
}

/// Conversation files live under the platform data dir unless overridden.
fn store_root(store_dir: Option<PathBuf>) -> PathBuf {
    store_dir.unwrap_or_else(|| {
        directories::ProjectDirs::from("dev", "ragchat", "ragchat")
            .map(|d| d.data_dir().join("conversations"))
            .unwrap_or_else(|| PathBuf::from(".ragchat/conversations"))
    })
}

/// Read a fixture document set: a JSON array of `{content, relevanceScore}`.
pub(crate) fn read_documents(path: &Path) -> anyhow::Result<Vec<DocumentSource>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Cannot read {}: {}", path.display(), e))?;
    let documents: Vec<DocumentSource> = serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("Invalid document file {}: {}", path.display(), e))?;
    Ok(documents)
}

async fn handle_chat(args: ChatArgs, workspace: &Path, quiet: bool) -> anyhow::Result<()> {
    let mut config = load(workspace)?;
    if let Some(endpoint) = args.endpoint {
        config.backend.endpoint = endpoint;
    }
    if let Some(model) = args.model {
        config.backend.model = model;
    }

    let store = Arc::new(JsonFileChatStore::new(store_root(args.store_dir)));
    let index = Arc::new(InMemoryDocumentIndex::new());
    if let Some(path) = &args.documents {
        let documents = read_documents(path)?;
        debug!(count = documents.len(), "Loaded fixture documents");
        index.add_documents(&args.conversation, documents);
    }
    let backend = OllamaBackend::new(&config.backend.endpoint, &config.backend.model)?
        .with_id(&config.backend.id);

    let backend_config = BackendConfig {
        id: config.backend.id.clone(),
        endpoint: config.backend.endpoint.clone(),
    };
    let mut query = DocumentQueryConfig::default();
    if let Some(top_k) = args.top_k {
        query.top_k = top_k;
    }
    if let Some(threshold) = args.threshold {
        query.similarity_threshold = threshold;
    }

    let orchestrator = ChatOrchestrator::builder(store, index)
        .config(config)
        .backend(Arc::new(backend))
        .build()?;

    let cancel = CancellationToken::new();
    let request = GenerationRequest::new(
        args.conversation.clone(),
        args.message.join(" "),
        backend_config,
    )
    .with_document_query(query)
    .with_persist_history(!args.no_persist)
    .with_cancellation(cancel.clone());

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let (tx, rx) = mpsc::unbounded_channel();
    // A closed stdout ends the generation too.
    let stop = cancel.clone();
    let printer = tokio::spawn(async move {
        let printed = print_events(rx, std::io::stdout()).await;
        if printed.is_err() {
            stop.cancel();
        }
        printed
    });

    let result = orchestrator.run_with_events(request, Some(tx)).await;
    if let Ok(Err(e)) = printer.await {
        debug!(error = %e, "Stopped printing the streamed answer");
    }

    match result {
        Ok(outcome) => {
            if !quiet {
                for warning in &outcome.warnings {
                    eprintln!("warning: {warning}");
                }
                if outcome.finish_reason != ragchat_core::FinishReason::Completed {
                    eprintln!("[{}]", outcome.finish_reason);
                }
            }
            Ok(())
        }
        Err(PipelineError::History(StoreError::NotFound { conversation_id })) => {
            anyhow::bail!(
                "Conversation '{}' does not exist. Create it with `ragchat init {}`.",
                conversation_id,
                conversation_id
            )
        }
        Err(e) => Err(e.into()),
    }
}

/// Print streamed events until the channel closes or `out` stops accepting
/// writes. Returns the first write error.
async fn print_events<W: Write>(
    mut rx: mpsc::UnboundedReceiver<GenerationEvent>,
    mut out: W,
) -> std::io::Result<()> {
    while let Some(event) = rx.recv().await {
        match event {
            GenerationEvent::Partial(chunk) => {
                write!(out, "{chunk}")?;
                out.flush()?;
            }
            GenerationEvent::Complete(_) => writeln!(out)?,
            GenerationEvent::Error(_) => {}
        }
    }
    Ok(())
}

async fn handle_init(conversation: &str, store_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let store = JsonFileChatStore::new(store_root(store_dir));
    if store.create_conversation(conversation).await? {
        println!(
            "Created conversation '{}' at: {}",
            conversation,
            store.conversation_path(conversation).display()
        );
    } else {
        println!("Conversation '{}' already exists", conversation);
    }
    Ok(())
}

fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load(workspace)?;
            println!("{}", config.to_toml()?);
            Ok(())
        }
        ConfigAction::Init => {
            let config_path = workspace_config_path(workspace);
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&config_path, PipelineConfig::default().to_toml()?)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
    }
}
