//! Outbound connect — dial one directory candidate, handshake, and run
//! the session. Failures are reported back to the pool for retry
//! bookkeeping.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::node::Node;
use crate::pool::{DialAddr, PoolEvent};
use crate::router::Router;
use crate::session::{self, handshake, SessionTable};

pub async fn connect_and_run(
    node: Arc<Node>,
    router: Arc<Router>,
    sessions: SessionTable,
    pool_events: mpsc::UnboundedSender<PoolEvent>,
    addr: DialAddr,
    shutdown: broadcast::Receiver<()>,
) {
    let (ip, port) = addr;
    let negotiated = match handshake::outbound(&node, ip, port).await {
        Ok(n) => n,
        Err(e) => {
            match &e {
                handshake::SessionError::Rejected { code, reason } => {
                    tracing::info!(%ip, port, code, reason = %reason, "peer rejected us");
                }
                handshake::SessionError::Timeout(what) => {
                    tracing::info!(%ip, port, what, "outbound attempt timed out");
                }
                other => {
                    tracing::info!(%ip, port, error = %other, "outbound attempt failed");
                }
            }
            let _ = pool_events.send(PoolEvent::ConnectFailed { addr });
            return;
        }
    };

    session::run_established(node, router, sessions, pool_events, negotiated, shutdown).await;
}
