use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

mod api;
mod bus;
mod chat;
mod config;
mod conversation;
mod entity;
mod error;
mod interface;
mod session;
mod store;

use crate::config::Config;
use crate::entity::ParticipantId;
use crate::store::{ChatStore, MemoryStore, RemoteStore, SqliteStore};

/// SQLite path that selects a private in-memory database.
const IN_MEMORY_DB: &str = ":memory:";

#[derive(Parser)]
#[command(name = "neighborly", version, about = "Direct messages between neighbors")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Host the conversation store over HTTP
    Serve {
        /// SQLite database file (":memory:" for a throwaway database)
        #[arg(long)]
        db: Option<PathBuf>,
        /// Keep everything in process memory instead of SQLite
        #[arg(long, conflicts_with = "db")]
        memory: bool,
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Chat with another participant from the terminal
    Chat {
        #[arg(long)]
        me: String,
        #[arg(long)]
        peer: String,
        /// Base URL of a running `neighborly serve`
        #[arg(long)]
        server: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    if let Err(e) = dotenvy::dotenv() {
        // It's not fatal if .env doesn't exist, but good to know
        info!("No .env file found or failed to load: {}", e);
    }

    // Initialize logging with default filter if RUST_LOG is not set.
    // Logs go to stderr so they don't interleave with the chat transcript.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;

    match cli.command {
        Command::Serve {
            db,
            memory,
            bind,
            port,
        } => {
            if let Some(db) = db {
                config.db_path = db;
            }
            if let Some(bind) = bind {
                config.bind = bind;
            }
            if let Some(port) = port {
                config.port = port;
            }
            serve(config, memory).await
        }
        Command::Chat { me, peer, server } => {
            if let Some(server) = server {
                config.server_url = server;
            }
            chat(config, &me, &peer).await
        }
    }
}

async fn serve(config: Config, memory: bool) -> anyhow::Result<()> {
    info!("Neighborly chat store starting...");

    // Initialize the EventBus
    let bus = Arc::new(bus::EventBus::new());

    // Initialize the Store
    let store: Arc<dyn ChatStore> = if memory {
        info!("Using in-process memory store");
        Arc::new(MemoryStore::new(bus.clone()))
    } else if config.db_path.as_os_str() == IN_MEMORY_DB {
        info!("Using in-memory SQLite store");
        let store = SqliteStore::in_memory(bus.clone()).await?;
        store.init().await?;
        Arc::new(store)
    } else {
        info!("Initializing store at {}", config.db_path.display());
        let store = SqliteStore::new(&config.db_path, bus.clone()).await?;
        store.init().await?;
        Arc::new(store)
    };

    let app = api::server::ApiServer::new(store).router();

    let addr = config.listen_addr();
    info!("Starting chat API on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        res = axum::serve(listener, app) => {
            if let Err(e) = res {
                info!("Server stopped with error: {}", e);
            }
        }
    }

    Ok(())
}

async fn chat(config: Config, me: &str, peer: &str) -> anyhow::Result<()> {
    let me = ParticipantId::parse(me)?;
    let peer = ParticipantId::parse(peer)?;

    info!("Connecting to chat store at {}", config.server_url);
    let store = Arc::new(RemoteStore::new(&config.server_url)?);
    let session = Arc::new(session::ChatSession::new(store));

    interface::terminal::TerminalInterface::new(session, me, peer)
        .run()
        .await
}
