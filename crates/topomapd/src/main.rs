//! topomapd — passive topology observer daemon.

use anyhow::{Context, Result};
use tokio::task::JoinSet;

use topomap_core::config::TopomapConfig;
use topomap_services::{ChangeSignals, Synchronizer, TopologyStore};

mod aggregator;
mod listener;
mod reaper;

use aggregator::Aggregator;
use listener::{Interface, ProtocolListener};
use reaper::Reaper;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    match TopomapConfig::write_default_if_missing() {
        Ok(path) => tracing::debug!(path = %path.display(), "config file"),
        Err(e) => tracing::warn!(error = %e, "failed to write default config"),
    }
    let mut config = TopomapConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        TopomapConfig::default()
    });
    config.apply_interface_args(std::env::args().skip(1).collect());

    let group = config.network.group()?;
    let interfaces = if config.network.interfaces.is_empty() {
        vec![Interface::any()]
    } else {
        config
            .network
            .interfaces
            .iter()
            .map(|name| Interface::by_name(name))
            .collect::<Result<Vec<_>>>()?
    };
    tracing::info!(
        group = %group,
        port = config.network.port,
        interfaces = ?interfaces.iter().map(|i| i.name.as_str()).collect::<Vec<_>>(),
        "topomapd starting"
    );

    // Shared state
    let store = TopologyStore::new();
    let signals = ChangeSignals::new();
    let sync = Synchronizer::new(store.clone(), signals.clone());

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    // A listener whose socket dies ends alone; the others keep running.
    let mut listeners = JoinSet::new();
    for interface in interfaces {
        let name = interface.name.clone();
        let listener = ProtocolListener::bind(
            interface,
            group,
            config.network.port,
            config.network.recv_buffer,
            sync.clone(),
            shutdown_tx.subscribe(),
        )?;
        listeners.spawn(async move {
            if let Err(e) = listener.run().await {
                tracing::error!(interface = %name, error = %e, "protocol listener failed");
            }
        });
    }

    let reaper_task = tokio::spawn(
        Reaper::new(
            store.clone(),
            signals.clone(),
            config.timing.neighbour_timeout(),
            config.timing.reap_interval(),
            shutdown_tx.subscribe(),
        )
        .run(),
    );

    let aggregator_task = tokio::spawn(
        Aggregator::new(
            store.clone(),
            signals.clone(),
            config.timing.aggregate_interval(),
            shutdown_tx.subscribe(),
        )
        .run(),
    );

    if config.api.enabled {
        let state = topomap_api::ApiState {
            store: store.clone(),
            signals: signals.clone(),
            neighbour_timeout_secs: config.timing.neighbour_timeout_secs,
        };
        let port = config.api.port;
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = topomap_api::serve(state, port, shutdown)
                .await
                .context("status server failed")
            {
                tracing::error!(error = %e, "API server exited");
            }
        });
    }

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();
    let all_listeners_done = async {
        while listeners.join_next().await.is_some() {}
    };

    tokio::select! {
        _ = shutdown_rx.recv()   => tracing::info!("shutting down"),
        _ = all_listeners_done   => tracing::error!("every protocol listener exited"),
        r = reaper_task          => tracing::error!("liveness reaper exited: {:?}", r),
        r = aggregator_task      => tracing::error!("snapshot aggregator exited: {:?}", r),
    }

    Ok(())
}
