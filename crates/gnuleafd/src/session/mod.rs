//! Session management — one task pair per peer socket.
//!
//! A session is handshaken by `handshake`, then handed to
//! [`run_established`], which owns the read loop, spawns the writer task,
//! publishes our QRP table, and keeps the keepalive/discovery pings going
//! until the socket dies or shutdown is signalled.

pub mod handshake;
pub mod initiator;
pub mod listener;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, Notify};

use gnuleaf_core::descriptor::{self, Bye, Descriptor, Payload};

use crate::node::Node;
use crate::pool::PoolEvent;
use crate::router::{Disposition, Router};
use crate::transport::{FrameReader, FrameWriter, TransportError, MAX_OUTBOUND_QUEUE};

use self::handshake::Negotiated;

/// Milliseconds given to the writer to flush a BYE before force-close.
const BYE_DRAIN: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Inbound,
    Outbound,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Inbound => f.write_str("inbound"),
            Role::Outbound => f.write_str("outbound"),
        }
    }
}

/// Handshake phase of one session. Sessions in the table are always
/// `Established`; earlier phases exist only inside the handshake drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    ConnectSent,
    OkReceived,
    OkSent,
    Established,
    Closing,
}

/// Shared handle to a live session, registered in the session table.
pub struct SessionHandle {
    pub remote: SocketAddr,
    pub role: Role,
    pub established_at: Instant,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    queued_bytes: Arc<AtomicUsize>,
    pub bytes_in: Arc<AtomicU64>,
    pub bytes_out: Arc<AtomicU64>,
    close: Arc<Notify>,
}

impl SessionHandle {
    /// Queue an encoded frame for this session.
    ///
    /// Returns false when the outbound queue is past its bound — the
    /// session is congested and must be closed.
    pub fn send_frame(&self, frame: Vec<u8>) -> bool {
        let queued = self.queued_bytes.fetch_add(frame.len(), Ordering::Relaxed);
        if queued + frame.len() > MAX_OUTBOUND_QUEUE {
            self.queued_bytes.fetch_sub(frame.len(), Ordering::Relaxed);
            return false;
        }
        self.outbound.send(frame).is_ok()
    }

    pub fn send_descriptor(&self, d: &Descriptor) -> bool {
        self.send_frame(descriptor::encode(d))
    }

    /// Ask the session task to close. The reader loop exits at its next
    /// suspension point.
    pub fn request_close(&self) {
        self.close.notify_one();
    }
}

/// All established sessions, keyed by remote address.
pub type SessionTable = Arc<DashMap<SocketAddr, Arc<SessionHandle>>>;

pub fn new_session_table() -> SessionTable {
    Arc::new(DashMap::new())
}

/// Drive one established session until it closes.
///
/// Registers the session in the table, performs the post-handshake sends
/// (QRP RESET, all PATCH chunks, an initial TTL=7 PING), then loops over
/// inbound frames and the ping timers.
pub async fn run_established(
    node: Arc<Node>,
    router: Arc<Router>,
    sessions: SessionTable,
    pool_events: mpsc::UnboundedSender<PoolEvent>,
    negotiated: Negotiated,
    mut shutdown: broadcast::Receiver<()>,
) {
    let Negotiated {
        stream,
        remote,
        role,
        dial_addr,
        peer_headers,
        inbound_deflate,
        outbound_deflate,
        leftover,
    } = negotiated;

    let (read_half, write_half) = stream.into_split();

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let queued_bytes = Arc::new(AtomicUsize::new(0));
    let bytes_out = Arc::new(AtomicU64::new(0));

    let mut writer = FrameWriter::new();
    if outbound_deflate {
        writer.enable_outbound_deflate();
    }
    let writer_task = tokio::spawn(write_loop(
        write_half,
        outbound_rx,
        writer,
        queued_bytes.clone(),
        bytes_out.clone(),
    ));

    let handle = Arc::new(SessionHandle {
        remote,
        role,
        established_at: Instant::now(),
        outbound: outbound_tx,
        queued_bytes,
        bytes_in: Arc::new(AtomicU64::new(0)),
        bytes_out,
        close: Arc::new(Notify::new()),
    });
    sessions.insert(remote, handle.clone());
    let _ = pool_events.send(PoolEvent::Established {
        dial: dial_addr,
        remote,
    });

    tracing::info!(
        %remote,
        %role,
        user_agent = peer_headers
            .get(gnuleaf_core::handshake::H_USER_AGENT)
            .unwrap_or("?"),
        compress_in = inbound_deflate,
        compress_out = outbound_deflate,
        "session established"
    );

    let mut reader = FrameReader::new();
    if inbound_deflate {
        reader.enable_inbound_deflate();
    }

    let close_reason = drive_session(
        &node,
        &router,
        &handle,
        read_half,
        &mut reader,
        leftover,
        &mut shutdown,
    )
    .await;

    sessions.remove(&remote);
    let _ = pool_events.send(PoolEvent::Closed {
        dial: dial_addr,
        remote,
    });
    // Let a queued BYE reach the wire before the writer dies.
    tokio::time::sleep(BYE_DRAIN).await;
    writer_task.abort();

    tracing::info!(
        remote = %handle.remote,
        role = %handle.role,
        reason = close_reason,
        uptime_secs = handle.established_at.elapsed().as_secs(),
        bytes_in = handle.bytes_in.load(Ordering::Relaxed),
        bytes_out = handle.bytes_out.load(Ordering::Relaxed),
        "session closed"
    );
}

async fn drive_session(
    node: &Arc<Node>,
    router: &Arc<Router>,
    handle: &Arc<SessionHandle>,
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    reader: &mut FrameReader,
    leftover: bytes::BytesMut,
    shutdown: &mut broadcast::Receiver<()>,
) -> &'static str {
    // Publish our route table, then announce ourselves.
    let table = node.qrp_table();
    let reset = Descriptor::originate(1, Payload::RouteTableUpdate(table.reset_message()));
    if !handle.send_descriptor(&reset) {
        return "congested";
    }
    match table.patch_messages(None) {
        Ok(patches) => {
            for patch in patches {
                if !handle.send_descriptor(&Descriptor::originate(
                    1,
                    Payload::RouteTableUpdate(patch),
                )) {
                    return "congested";
                }
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to build QRP patches");
            return "qrp_patch_failed";
        }
    }
    handle.send_descriptor(&Descriptor::originate(7, Payload::Ping));

    let timers = &node.config.timers;
    let keepalive_period = Duration::from_secs(timers.keepalive_ping_secs.max(1));
    let discovery_period = Duration::from_secs(timers.discovery_ping_secs.max(1));
    let mut keepalive =
        tokio::time::interval_at(tokio::time::Instant::now() + keepalive_period, keepalive_period);
    let mut discovery =
        tokio::time::interval_at(tokio::time::Instant::now() + discovery_period, discovery_period);

    // Bytes that arrived behind the handshake terminator.
    if !leftover.is_empty() {
        if let Err(e) = reader.push(&leftover) {
            tracing::warn!(remote = %handle.remote, error = %e, "bad bytes after handshake");
            return "transport_error";
        }
        match drain_frames(node, router, handle, reader) {
            Drained::Continue => {}
            Drained::Close(reason) => return reason,
        }
    }

    let mut chunk = [0u8; 8192];
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                let bye = Descriptor::originate(1, Payload::Bye(Bye {
                    code: 200,
                    message: "Shutting down".into(),
                }));
                handle.send_descriptor(&bye);
                tokio::time::sleep(BYE_DRAIN).await;
                return "shutdown";
            }

            _ = handle.close.notified() => {
                return "close_requested";
            }

            _ = keepalive.tick() => {
                if !handle.send_descriptor(&Descriptor::originate(1, Payload::Ping)) {
                    return "congested";
                }
            }

            _ = discovery.tick() => {
                if !handle.send_descriptor(&Descriptor::originate(7, Payload::Ping)) {
                    return "congested";
                }
            }

            result = read_half.read(&mut chunk) => {
                let n = match result {
                    Ok(0) => return "eof",
                    Ok(n) => n,
                    Err(e) => {
                        tracing::debug!(remote = %handle.remote, error = %e, "read failed");
                        return "io_error";
                    }
                };
                handle.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
                if let Err(e) = reader.push(&chunk[..n]) {
                    return close_for_transport_error(handle, &e);
                }
                match drain_frames(node, router, handle, reader) {
                    Drained::Continue => {}
                    Drained::Close(reason) => return reason,
                }
            }
        }
    }
}

enum Drained {
    Continue,
    Close(&'static str),
}

fn drain_frames(
    node: &Arc<Node>,
    router: &Arc<Router>,
    handle: &Arc<SessionHandle>,
    reader: &mut FrameReader,
) -> Drained {
    loop {
        let descriptor = match reader.next_descriptor() {
            Ok(Some(d)) => d,
            Ok(None) => return Drained::Continue,
            Err(e) => return Drained::Close(close_for_transport_error(handle, &e)),
        };
        match router.handle(node, handle, descriptor) {
            Disposition::Continue => {}
            Disposition::Close { bye } => {
                if let Some((code, message)) = bye {
                    let frame = Descriptor::originate(1, Payload::Bye(Bye { code, message }));
                    handle.send_descriptor(&frame);
                }
                handle.request_close();
                return Drained::Close("router_close");
            }
        }
    }
}

/// Per-message parse errors that leave the stream intact are recoverable;
/// everything surfaced by the frame reader here is not. Log, try to say
/// BYE, and close.
fn close_for_transport_error(handle: &SessionHandle, e: &TransportError) -> &'static str {
    tracing::warn!(remote = %handle.remote, error = %e, "transport error, closing");
    let bye = Descriptor::originate(
        1,
        Payload::Bye(Bye {
            code: 500,
            message: "protocol error".into(),
        }),
    );
    handle.send_descriptor(&bye);
    handle.request_close();
    "transport_error"
}

async fn write_loop(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    mut writer: FrameWriter,
    queued_bytes: Arc<AtomicUsize>,
    bytes_out: Arc<AtomicU64>,
) {
    while let Some(frame) = outbound.recv().await {
        queued_bytes.fetch_sub(frame.len(), Ordering::Relaxed);
        let wire = match writer.prepare(&frame) {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!(error = %e, "deflate failed, dropping session writer");
                return;
            }
        };
        if let Err(e) = write_half.write_all(&wire).await {
            tracing::debug!(error = %e, "write failed");
            return;
        }
        bytes_out.fetch_add(wire.len() as u64, Ordering::Relaxed);
    }
}

/// Convenience used by the pool to decide who we are already talking to.
pub fn is_connected(sessions: &SessionTable, ip: Ipv4Addr, port: u16) -> bool {
    sessions.contains_key(&SocketAddr::from((ip, port)))
}

/// A detached handle whose outbound frames land in the returned receiver.
/// Lets router tests observe exactly what would hit the wire.
#[cfg(test)]
pub(crate) fn test_handle(
    remote: SocketAddr,
) -> (Arc<SessionHandle>, mpsc::UnboundedReceiver<Vec<u8>>) {
    let (outbound, rx) = mpsc::unbounded_channel();
    let handle = Arc::new(SessionHandle {
        remote,
        role: Role::Inbound,
        established_at: Instant::now(),
        outbound,
        queued_bytes: Arc::new(AtomicUsize::new(0)),
        bytes_in: Arc::new(AtomicU64::new(0)),
        bytes_out: Arc::new(AtomicU64::new(0)),
        close: Arc::new(Notify::new()),
    });
    (handle, rx)
}
