use std::sync::Arc;
use tracing::{error, info};

use jarvis::{
    api::{ApiServer, AppState},
    bus::EventBus,
    client::{ApiClient, ChatPoller},
    config::Config,
    ontology::OntologyReader,
    store::{FileMessageStore, MemoryMessageStore, MessageStore},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    if let Err(e) = dotenvy::dotenv() {
        // Not fatal, the environment may already be set
        info!("No .env file found or failed to load: {}", e);
    }

    // Initialize logging with default filter if RUST_LOG is not set
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::from_env()?;

    match std::env::args().nth(1).as_deref() {
        None | Some("serve") => serve(config).await,
        Some("tail") => tail(config).await,
        Some(other) => anyhow::bail!("Unknown command {:?} (expected `serve` or `tail`)", other),
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    info!("Jarvis server starting...");

    let store: Arc<dyn MessageStore> = if config.ephemeral {
        info!("Using in-memory message store");
        Arc::new(MemoryMessageStore::new())
    } else {
        info!("Initializing message store at {}", config.messages_file.display());
        Arc::new(FileMessageStore::open(&config.messages_file).await?)
    };

    info!("Reading ontology from {}", config.ontology_file.display());
    let ontology = Arc::new(OntologyReader::new(&config.ontology_file));

    let server = ApiServer::new(AppState {
        store,
        ontology,
        bus: Arc::new(EventBus::new()),
        exclude_sender: config.exclude_sender.clone(),
    });
    let app = server.router();

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        res = axum::serve(listener, app) => {
            if let Err(e) = res {
                error!("Server stopped with error: {}", e);
            }
        }
    }

    Ok(())
}

/// Follow the chat from a terminal: print recent history, then new messages
/// from everyone but `tail_exclude` (the guest, unless configured).
async fn tail(config: Config) -> anyhow::Result<()> {
    let client = ApiClient::new(&config.server_url)?;
    let (poller, history) = ChatPoller::connect(client, config.tail_exclude.clone()).await?;

    for msg in &history {
        println!("[{}] {}", msg.sender, msg.message);
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => Ok(()),
        res = poller.run(|msg| println!("[{}] {}", msg.sender, msg.message)) => res,
    }
}
