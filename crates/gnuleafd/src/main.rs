//! gnuleafd — a Gnutella 0.6 leaf servent.

mod node;
mod pool;
mod router;
mod session;
mod transport;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};

use gnuleaf_core::config::GnuLeafConfig;
use gnuleaf_services::{identity, settings::PeerSource, PeerDirectory, SharedLibrary};

use node::Node;
use pool::{PeerPool, PoolEvent};
use router::{GivHandoff, Router};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing — RUST_LOG controls verbosity
    // e.g. RUST_LOG=debug cargo run -p gnuleafd
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = GnuLeafConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "could not write default config");
    }
    let config = GnuLeafConfig::load().context("failed to load configuration")?;

    let servent_id =
        identity::load_or_create(&config.peers.settings_path.with_file_name("servent.guid"));
    tracing::info!(%servent_id, listen_port = config.network.listen_port, "gnuleafd starting");

    // Seed the shared library from config ("name" or "name:size" entries).
    let library = SharedLibrary::new();
    for entry in &config.sharing.files {
        let (name, size) = match entry.rsplit_once(':') {
            Some((name, size)) if size.bytes().all(|b| b.is_ascii_digit()) => {
                (name, size.parse().unwrap_or(0))
            }
            _ => (entry.as_str(), 0u64),
        };
        library.add_file(name, size);
    }
    tracing::info!(files = library.count(), kb = library.total_kilobytes(), "library seeded");

    let directory = PeerDirectory::with_persistence(config.peers.settings_path.clone());
    for entry in &config.peers.bootstrap {
        let Some((ip, port)) = entry.split_once(':') else {
            tracing::warn!(entry, "ignoring malformed bootstrap address");
            continue;
        };
        match (ip.parse::<Ipv4Addr>(), port.parse::<u16>()) {
            (Ok(ip), Ok(port)) => directory.add(ip, port, PeerSource::Manual),
            _ => tracing::warn!(entry, "ignoring malformed bootstrap address"),
        }
    }
    tracing::info!(known_peers = directory.len(), "peer directory ready");

    let node = Arc::new(Node::new(config, servent_id, library, directory));
    let sessions = session::new_session_table();
    let (shutdown_tx, _) = broadcast::channel::<()>(8);

    // PUSH handoffs land here; the file server is an external collaborator,
    // so the default consumer just logs and drops the socket.
    let (giv_tx, mut giv_rx) = mpsc::unbounded_channel::<GivHandoff>();
    tokio::spawn(async move {
        while let Some(handoff) = giv_rx.recv().await {
            tracing::info!(
                remote = %handoff.remote,
                file = %handoff.file.filename,
                "GIV socket ready, no file server attached"
            );
        }
    });
    let router = Arc::new(Router::new(giv_tx));

    let (pool_tx, pool_rx) = mpsc::unbounded_channel::<PoolEvent>();
    let listener = session::listener::Listener::new(
        node.clone(),
        router.clone(),
        sessions.clone(),
        pool_tx.clone(),
        shutdown_tx.clone(),
    );
    let pool = PeerPool::new(
        node.clone(),
        router.clone(),
        sessions.clone(),
        pool_tx,
        pool_rx,
        shutdown_tx.clone(),
    );

    let listener_task = tokio::spawn(listener.run());
    let pool_task = tokio::spawn(pool.run());
    let persist_task = tokio::spawn(persist_loop(node.clone(), shutdown_tx.subscribe()));

    let exit = tokio::select! {
        r = listener_task => {
            // The listener only returns early on a local fatal error
            // (listen port in use). That must exit non-zero.
            match r {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(anyhow::anyhow!("listener task panicked: {e}")),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
            Ok(())
        }
    };

    // Graceful teardown. Each session task answers the shutdown signal by
    // sending BYE 200 and draining briefly; give them a moment, then flush
    // the directory.
    let _ = shutdown_tx.send(());
    tokio::time::sleep(Duration::from_millis(300)).await;
    pool_task.abort();
    persist_task.abort();
    node.directory.save();
    tracing::info!(query_hits_seen = router.hits_received(), "gnuleafd stopped");

    exit
}

/// Periodic peer-directory persistence and pruning.
async fn persist_loop(node: Arc<Node>, mut shutdown: broadcast::Receiver<()>) {
    let save_period = Duration::from_secs(node.config.timers.directory_save_secs.max(1));
    let prune_age = Duration::from_secs(node.config.timers.directory_prune_days * 24 * 3600);
    let mut interval = tokio::time::interval_at(
        tokio::time::Instant::now() + save_period,
        save_period,
    );
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                node.directory.save();
                return;
            }
            _ = interval.tick() => {
                node.directory.prune(prune_age);
                node.directory.save();
            }
        }
    }
}
