use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use symmetry_server::{broker, config, db, dispatch, http, identity, ip_limit, listener, peers, provider_sessions, registry};

#[derive(Parser, Debug)]
#[command(
    name = "symmetry-server",
    version,
    about = "Rendezvous and dispatch hub for the symmetry inference network"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to the server config file (default: ~/.config/symmetry/server.yaml).
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the hub (the default when no subcommand is given)
    Start,
    /// Remove a peer record by its hex key
    DeletePeer { key: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("symmetry_server=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(config::default_path);
    let config = config::load(&config_path)?;

    match cli.command.unwrap_or(Command::Start) {
        Command::Start => run_start(config).await,
        Command::DeletePeer { key } => run_delete_peer(config, &key).await,
    }
}

async fn run_start(config: config::Config) -> Result<()> {
    let identity = Arc::new(identity::Identity::from_hex(
        &config.public_key,
        &config.private_key,
    )?);
    tracing::info!("Hub identity {}", identity.public_key_hex());
    let db = db::Db::open(&config.path).await?;
    tracing::info!("Store open at {}", config.path.display());

    let peer_store = peers::PeerStore::new(db.clone());
    let broker_store = broker::BrokerStore::new(db.clone());
    let session_store = provider_sessions::ProviderSessionStore::new(db.clone());
    let ip_limit = ip_limit::IpLimitStore::new(db);

    // Clean-slate restart: nothing is connected to a hub that just started,
    // and no provider session can still be open.
    peer_store.reset_all_connections().await?;
    let orphans = session_store.end_orphans().await?;
    if orphans > 0 {
        tracing::info!("Closed {orphans} orphan provider sessions");
    }

    let registry = registry::Registry::new();
    let dispatcher = dispatch::Dispatcher::new(
        registry.clone(),
        peer_store.clone(),
        broker_store.clone(),
        session_store.clone(),
        identity.clone(),
    );

    let endpoint = listener::start(&identity, dispatcher).await?;

    http::start(
        config.api_port,
        http::HttpState {
            registry,
            peers: peer_store,
            sessions: session_store,
            ip_limit,
            allowed_origins: Arc::new(config.allowed_origins.clone()),
        },
    )
    .await?;

    // Expired broker tokens are rejected lazily on verify; the sweep keeps
    // the table from accumulating abandoned rows.
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            match broker_store.purge_expired().await {
                Ok(0) => {}
                Ok(n) => tracing::debug!("Purged {n} expired broker sessions"),
                Err(e) => tracing::warn!("Broker session sweep failed: {e}"),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    endpoint.close().await;
    Ok(())
}

async fn run_delete_peer(config: config::Config, key: &str) -> Result<()> {
    let db = db::Db::open(&config.path).await?;
    let store = peers::PeerStore::new(db);
    // Not-found still exits 0; only store errors are failures.
    match store.delete(key).await.context("delete-peer failed")? {
        true => tracing::info!("Deleted peer {key}"),
        false => tracing::info!("No peer with key {key}"),
    }
    Ok(())
}
