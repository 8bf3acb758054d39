//! Validator Node Binary
//!
//! Runs one validator: peer RPC server, node actor and, depending on the
//! configuration, a new ledger from a genesis file or a join request to an
//! existing validator.

use anyhow::Context;
use consensus::join::join_existing_ledger;
use consensus::server::{self, ServerState};
use consensus::{spawn_node, Config, HttpPeerClient, Metrics, PeerClient, RoundEngine, Startup};
use ledger_core::{Ed25519Provider, GenesisConfig, SignatureProvider};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false);
    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Starting validator node");

    // Load configuration
    let config = if let Ok(config_path) = std::env::var("VALIDATOR_CONFIG") {
        info!("Loading config from: {}", config_path);
        Config::from_file(&config_path)?
    } else {
        info!("Loading config from environment variables");
        Config::from_env()?
    };
    config.validate()?;

    let provider: Arc<dyn SignatureProvider> = Arc::new(Ed25519Provider);
    let identity = config.identity(provider.clone()).context("loading validator key")?;
    info!(
        public_key = %identity.public_key(),
        connection = %config.connection_string,
        scheme = provider.name(),
        "Validator identity loaded"
    );

    let metrics = Metrics::new().context("registering metrics")?;
    let client: Arc<dyn PeerClient> = Arc::new(HttpPeerClient::new(config.network.fetch_timeout())?);
    let engine = RoundEngine::new(
        identity.clone(),
        config.connection_string.clone(),
        metrics.clone(),
        config.history_retention_blocks,
    );
    let published = engine.published();
    let (handle, actor_task) = spawn_node(engine, client.clone(), config.network.clone(), config.mailbox_capacity);

    let state = ServerState {
        handle: handle.clone(),
        published,
        public_key: identity.public_key().clone(),
        metrics,
    };
    let listen_addr = config.listen_addr.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server::serve(&listen_addr, state).await {
            error!("Peer RPC server error: {}", e);
        }
    });

    match config.startup()? {
        Startup::Genesis(path) => {
            info!("Creating ledger from: {:?}", path);
            let genesis = GenesisConfig::from_file(&path)?.into_snapshot(provider.as_ref())?;
            handle.create_ledger(genesis).await?;
        }
        Startup::Join(target) => {
            info!(target = %target, "Requesting to join existing ledger");
            match join_existing_ledger(client.as_ref(), &identity, &target, &config.connection_string).await {
                Ok(true) => info!("Waiting for the admitting block to finalize"),
                Ok(false) => warn!("Join refused; waiting for a pushed snapshot"),
                Err(e) => warn!(error = %e, "Join request failed; waiting for a pushed snapshot"),
            }
        }
        Startup::Await => info!("Waiting for a pushed snapshot"),
    }

    info!("Validator node running");
    info!("- Peer RPC: {}", config.listen_addr);
    info!("- Reachable at: {}", config.connection_string);

    // Wait for shutdown signal
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received shutdown signal");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    // Graceful shutdown
    info!("Shutting down validator node...");
    handle.shutdown().await.ok();
    actor_task.await.ok();
    server_handle.abort();

    info!("Validator node stopped");
    Ok(())
}
