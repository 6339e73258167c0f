//! peerlinkd — runs publish/subscribe controllers over the in-process medium.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::broadcast;

use peerlink_core::config::PeerlinkConfig;
use peerlink_services::{LogSink, LoopbackMedium};
use peerlinkd::session::PeerSessionController;

#[derive(Debug, Clone, Copy)]
struct Roles {
    publish: bool,
    subscribe: bool,
}

fn parse_roles(arg: Option<&str>) -> Result<Roles> {
    let (publish, subscribe) = match arg.unwrap_or("both") {
        "publish" => (true, false),
        "subscribe" => (false, true),
        "both" => (true, true),
        other => bail!("unknown role {other:?}, expected publish, subscribe or both"),
    };
    Ok(Roles { publish, subscribe })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = PeerlinkConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = PeerlinkConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        PeerlinkConfig::default()
    });

    let roles = parse_roles(std::env::args().nth(1).as_deref())?;
    let service = config.discovery.service_name.clone();
    tracing::info!(?roles, service = %service, "peerlinkd starting");

    let medium = LoopbackMedium::new();
    let new_controller = || {
        Arc::new(PeerSessionController::new(
            Arc::new(medium.clone()),
            Arc::new(medium.clone()),
            Arc::new(LogSink),
            config.clone(),
        ))
    };

    let mut controllers = Vec::new();
    if roles.publish {
        let publisher = new_controller();
        if !publisher.attach().await || !publisher.publish(&service).await {
            bail!("failed to start publishing {service:?}");
        }
        controllers.push(publisher);
    }
    if roles.subscribe {
        let subscriber = new_controller();
        if !subscriber.attach().await || !subscriber.subscribe(&service).await {
            bail!("failed to start subscribing to {service:?}");
        }
        controllers.push(subscriber);
    }
    if !(roles.publish && roles.subscribe) {
        tracing::info!("single role on the in-process medium, no peers will be found");
    }

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let status_printer = {
        let controllers = controllers.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = interval.tick() => {}
                }
                for controller in &controllers {
                    if let Some(registry) = controller.registry().await {
                        let peers = registry.peers().await;
                        tracing::info!(count = peers.len(), "registry snapshot");
                        for peer in peers {
                            if let Some(s) = registry.snapshot(&peer).await {
                                tracing::info!(
                                    peer = %s.peer,
                                    state = ?s.state,
                                    port = s.listen_port,
                                    channels = s.data_channels,
                                    "  peer"
                                );
                            }
                        }
                    } else {
                        let linked = controller.linked_peers().await;
                        tracing::info!(state = %controller.state(), links = linked.len(), "subscriber snapshot");
                    }
                }
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();
    let _ = shutdown_rx.recv().await;
    tracing::info!("shutting down");

    for controller in &controllers {
        controller.close().await;
    }
    if let Err(e) = status_printer.await {
        tracing::error!(error = %e, "status printer exited abnormally");
    }

    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
}
