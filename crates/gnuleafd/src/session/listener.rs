//! TCP accept loop for inbound peers.
//!
//! Each accepted socket gets its own task: handshake (with the inbound
//! capacity check) and then the shared session loop. A full house answers
//! with 503 plus an X-Try referral list instead of a session.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

use crate::node::Node;
use crate::pool::PoolEvent;
use crate::router::Router;
use crate::session::{self, handshake, SessionTable};

/// Inbound sessions are capped at twice the outbound target.
fn at_capacity(node: &Node, sessions: &SessionTable) -> bool {
    sessions.len() >= node.config.peers.target_connections * 2
}

pub struct Listener {
    node: Arc<Node>,
    router: Arc<Router>,
    sessions: SessionTable,
    pool_events: mpsc::UnboundedSender<PoolEvent>,
    shutdown: broadcast::Sender<()>,
}

impl Listener {
    pub fn new(
        node: Arc<Node>,
        router: Arc<Router>,
        sessions: SessionTable,
        pool_events: mpsc::UnboundedSender<PoolEvent>,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            node,
            router,
            sessions,
            pool_events,
            shutdown,
        }
    }

    /// Bind and serve. A bind failure is a local fatal error and
    /// propagates out to `main`.
    pub async fn run(self) -> Result<()> {
        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.node.listen_port()));
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind listen port {bind_addr}"))?;
        tracing::info!(%bind_addr, "listening for peers");

        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("listener shutting down");
                    return Ok(());
                }

                accepted = listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    tracing::debug!(%remote, "inbound connection");

                    let node = self.node.clone();
                    let router = self.router.clone();
                    let sessions = self.sessions.clone();
                    let pool_events = self.pool_events.clone();
                    let session_shutdown = self.shutdown.subscribe();
                    let accepting = !at_capacity(&node, &sessions);

                    tokio::spawn(async move {
                        match handshake::inbound(&node, stream, remote, accepting).await {
                            Ok(negotiated) => {
                                session::run_established(
                                    node,
                                    router,
                                    sessions,
                                    pool_events,
                                    negotiated,
                                    session_shutdown,
                                )
                                .await;
                            }
                            Err(e) => {
                                tracing::debug!(%remote, error = %e, "inbound handshake failed");
                            }
                        }
                    });
                }
            }
        }
    }
}
