//! vicinityd — profile server neighborhood synchronization daemon.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use vicinity_core::config::VicinityConfig;
use vicinity_core::crypto::IdentityKeys;
use vicinity_core::proto::{NodeContact, ServiceKind, ServiceProfile};
use vicinity_services::{
    NeighborhoodReconciler, NeighborhoodStore, ProcessorSignal, Readiness, ReconcilerSettings,
};
use vicinityd::LbnSession;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path =
        VicinityConfig::write_default_if_missing().context("failed to bootstrap config")?;
    let config = VicinityConfig::load().context("failed to load config")?;
    tracing::info!(path = %config_path.display(), "configuration loaded");

    let keys = IdentityKeys::load_or_generate(&config.identity.keypair_path)
        .context("failed to load identity keys")?;
    tracing::info!(network_id = %hex::encode(keys.network_id()), "identity ready");

    let store = NeighborhoodStore::new();
    let processor = ProcessorSignal::new();
    let readiness = Readiness::new();
    let reconciler = Arc::new(NeighborhoodReconciler::new(
        store.clone(),
        processor.clone(),
        ReconcilerSettings {
            max_neighborhood_size: config.neighborhood.max_size,
            identifier_length: config.neighborhood.identifier_length,
        },
    ));

    let profile = ServiceProfile {
        kind: ServiceKind::Profile,
        node_id: keys.network_id().to_vec(),
        contact: NodeContact::from_addr(
            config.network.server_interface,
            config.network.primary_port,
        ),
    };

    let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
    let session = LbnSession::new(
        config.lbn.endpoint.clone(),
        profile,
        reconciler,
        readiness.clone(),
        shutdown_rx,
    );
    let session_task = tokio::spawn(session.run());

    tokio::signal::ctrl_c()
        .await
        .context("failed to install ctrl-c handler")?;
    tracing::info!("shutdown requested");
    let _ = shutdown_tx.send(());

    session_task.await.context("session task panicked")??;
    tracing::info!("vicinityd stopped");
    Ok(())
}
