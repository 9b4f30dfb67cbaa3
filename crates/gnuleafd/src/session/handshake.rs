//! Handshake drivers — the two-phase 0.6 negotiation on a fresh socket.
//!
//! Inbound: read CONNECT, answer 200 OK (or 503 with X-Try), read the
//! peer's final OK. Outbound: send CONNECT, read the response, send the
//! final OK. Compression is decided from the peer's headers and becomes
//! active exactly at the final terminator boundary; any bytes already read
//! past it are handed to the session as leftover.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use gnuleaf_core::handshake::{
    self, HandshakeMessage, Headers, ParsedHandshake, DEFLATE, H_ACCEPT_ENCODING, H_BYE_PACKET,
    H_CONTENT_ENCODING, H_LISTEN_IP, H_REMOTE_IP, H_USER_AGENT, H_X_QUERY_ROUTING, H_X_TRY,
    H_X_TRY_ULTRAPEERS, H_X_ULTRAPEER,
};
use gnuleaf_services::PeerSource;

use super::{Phase, Role};
use crate::node::Node;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake error: {0}")]
    Handshake(#[from] handshake::HandshakeError),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("peer rejected handshake: {code} {reason}")]
    Rejected { code: u16, reason: String },

    #[error("peer speaks unsupported version {0}")]
    UnsupportedVersion(String),

    #[error("protocol violation during {phase:?}: {detail}")]
    ProtocolViolation { phase: Phase, detail: &'static str },
}

/// The result of a completed handshake, ready for `run_established`.
pub struct Negotiated {
    pub stream: TcpStream,
    pub remote: SocketAddr,
    pub role: Role,
    /// The (ip, port) the pool dialed, for outbound retry bookkeeping.
    pub dial_addr: Option<(Ipv4Addr, u16)>,
    pub peer_headers: Headers,
    pub inbound_deflate: bool,
    pub outbound_deflate: bool,
    /// Raw socket bytes read past the handshake terminator. Compressed
    /// when inbound deflate was negotiated.
    pub leftover: BytesMut,
}

// ── Inbound ───────────────────────────────────────────────────────────────────

/// Drive the responder side. `accepting` false rejects with 503 and a
/// referral list.
pub async fn inbound(
    node: &Node,
    mut stream: TcpStream,
    remote: SocketAddr,
    accepting: bool,
) -> Result<Negotiated, SessionError> {
    let deadline = Duration::from_secs(node.config.peers.handshake_timeout_secs);
    let mut buf = BytesMut::with_capacity(1024);
    let mut phase = Phase::Init;

    let connect = timeout(deadline, read_block(&mut stream, &mut buf, phase))
        .await
        .map_err(|_| SessionError::Timeout("handshake"))??;

    let (version, peer_headers) = match connect {
        HandshakeMessage::Connect { version, headers } => (version, headers),
        HandshakeMessage::Response { .. } => {
            return Err(SessionError::ProtocolViolation {
                phase,
                detail: "inbound peer opened with a response line",
            });
        }
    };

    let supported = matches!(handshake::parse_version(&version), Some((major, minor)) if (major, minor) >= (0, 6));
    if !supported || !accepting {
        send_rejection(node, &mut stream, if supported { "Service Unavailable" } else { "Version Not Supported" }).await?;
        tracing::debug!(%remote, version, accepting, phase = ?Phase::Closing, "rejected inbound handshake");
        return Err(if supported {
            SessionError::Rejected {
                code: 503,
                reason: "Service Unavailable".into(),
            }
        } else {
            SessionError::UnsupportedVersion(version)
        });
    }

    ingest_peer_headers(node, &peer_headers);
    let peer_accepts_deflate = peer_headers.contains_token(H_ACCEPT_ENCODING, DEFLATE);

    let mut ours = our_headers(node, remote);
    if peer_accepts_deflate {
        ours.push(H_CONTENT_ENCODING, DEFLATE);
    }
    let ok = HandshakeMessage::Response {
        version: "0.6".into(),
        code: 200,
        reason: "OK".into(),
        headers: ours,
    };
    stream.write_all(&handshake::encode(&ok)?).await?;
    phase = Phase::OkSent;

    let final_ok = timeout(deadline, read_block(&mut stream, &mut buf, phase))
        .await
        .map_err(|_| SessionError::Timeout("handshake"))??;

    let final_headers = match final_ok {
        HandshakeMessage::Response {
            code: 200, headers, ..
        } => headers,
        HandshakeMessage::Response { code, reason, .. } => {
            return Err(SessionError::Rejected { code, reason });
        }
        HandshakeMessage::Connect { .. } => {
            return Err(SessionError::ProtocolViolation {
                phase,
                detail: "second CONNECT instead of final OK",
            });
        }
    };
    ingest_peer_headers(node, &final_headers);
    tracing::trace!(%remote, phase = ?Phase::Established, "inbound handshake complete");

    // Compression becomes active at this terminator, atomically for both
    // directions.
    let inbound_deflate = final_headers.contains_token(H_CONTENT_ENCODING, DEFLATE)
        || peer_headers.contains_token(H_CONTENT_ENCODING, DEFLATE);
    let outbound_deflate = peer_accepts_deflate;

    Ok(Negotiated {
        stream,
        remote,
        role: Role::Inbound,
        dial_addr: None,
        peer_headers: merge_headers(peer_headers, final_headers),
        inbound_deflate,
        outbound_deflate,
        leftover: buf,
    })
}

// ── Outbound ──────────────────────────────────────────────────────────────────

/// Dial and drive the initiator side.
pub async fn outbound(
    node: &Node,
    ip: Ipv4Addr,
    port: u16,
) -> Result<Negotiated, SessionError> {
    let connect_deadline = Duration::from_secs(node.config.peers.connect_timeout_secs);
    let handshake_deadline = Duration::from_secs(node.config.peers.handshake_timeout_secs);
    let remote = SocketAddr::from((ip, port));

    let mut stream = timeout(connect_deadline, TcpStream::connect(remote))
        .await
        .map_err(|_| SessionError::Timeout("connect"))??;

    let connect = HandshakeMessage::Connect {
        version: "0.6".into(),
        headers: our_headers(node, remote),
    };
    stream.write_all(&handshake::encode(&connect)?).await?;
    let mut phase = Phase::ConnectSent;

    let mut buf = BytesMut::with_capacity(1024);
    let response = timeout(handshake_deadline, read_block(&mut stream, &mut buf, phase))
        .await
        .map_err(|_| SessionError::Timeout("handshake"))??;

    let peer_headers = match response {
        HandshakeMessage::Response {
            code: 200,
            headers,
            version,
            ..
        } => {
            if !matches!(handshake::parse_version(&version), Some(v) if v >= (0, 6)) {
                return Err(SessionError::UnsupportedVersion(version));
            }
            headers
        }
        HandshakeMessage::Response {
            code,
            reason,
            headers,
            ..
        } => {
            // Rejections still carry referrals worth keeping.
            ingest_peer_headers(node, &headers);
            tracing::debug!(%remote, code, reason, "outbound handshake rejected");
            return Err(SessionError::Rejected { code, reason });
        }
        HandshakeMessage::Connect { .. } => {
            return Err(SessionError::ProtocolViolation {
                phase,
                detail: "CONNECT line in response position",
            });
        }
    };
    phase = Phase::OkReceived;
    ingest_peer_headers(node, &peer_headers);

    let peer_accepts_deflate = peer_headers.contains_token(H_ACCEPT_ENCODING, DEFLATE);
    let mut vendor = Headers::new();
    vendor.push(H_USER_AGENT, node.user_agent());
    if peer_accepts_deflate {
        vendor.push(H_CONTENT_ENCODING, DEFLATE);
    }
    let final_ok = HandshakeMessage::Response {
        version: "0.6".into(),
        code: 200,
        reason: "OK".into(),
        headers: vendor,
    };
    stream.write_all(&handshake::encode(&final_ok)?).await?;
    tracing::trace!(%remote, ?phase, "final OK sent");

    let inbound_deflate = peer_headers.contains_token(H_CONTENT_ENCODING, DEFLATE);
    let outbound_deflate = peer_accepts_deflate;

    Ok(Negotiated {
        stream,
        remote,
        role: Role::Outbound,
        dial_addr: Some((ip, port)),
        peer_headers,
        inbound_deflate,
        outbound_deflate,
        leftover: buf,
    })
}

// ── Shared pieces ─────────────────────────────────────────────────────────────

/// The headers a leaf always sends.
fn our_headers(node: &Node, remote: SocketAddr) -> Headers {
    let mut headers = Headers::new();
    headers.push(H_USER_AGENT, node.user_agent());
    headers.push(H_X_ULTRAPEER, "False");
    headers.push(
        H_LISTEN_IP,
        format!("{}:{}", node.public_ip(), node.listen_port()),
    );
    headers.push(H_REMOTE_IP, remote.ip().to_string());
    headers.push(H_ACCEPT_ENCODING, DEFLATE);
    headers.push(H_X_QUERY_ROUTING, "0.2");
    headers.push(H_BYE_PACKET, "0.1");
    headers
}

/// Learn our public address and any referred peers from a header block.
fn ingest_peer_headers(node: &Node, headers: &Headers) {
    if let Some(value) = headers.get(H_REMOTE_IP) {
        if let Ok(ip) = value.trim().parse::<Ipv4Addr>() {
            node.learn_public_ip(ip);
        }
    }
    for name in [H_X_TRY, H_X_TRY_ULTRAPEERS] {
        if let Some(value) = headers.get(name) {
            for (ip, port) in handshake::parse_host_list(value) {
                node.directory.add(ip, port, PeerSource::Cache);
            }
        }
    }
}

async fn send_rejection(
    node: &Node,
    stream: &mut TcpStream,
    reason: &str,
) -> Result<(), SessionError> {
    let mut headers = Headers::new();
    headers.push(H_USER_AGENT, node.user_agent());
    let referrals = node.directory.best_n(10);
    if !referrals.is_empty() {
        let hosts: Vec<(Ipv4Addr, u16)> =
            referrals.iter().map(|e| (e.ip, e.port)).collect();
        headers.push(H_X_TRY, handshake::format_host_list(&hosts));
    }
    let rejection = HandshakeMessage::Response {
        version: "0.6".into(),
        code: 503,
        reason: reason.into(),
        headers,
    };
    stream.write_all(&handshake::encode(&rejection)?).await?;
    Ok(())
}

/// Read socket bytes until one complete handshake block is buffered.
/// Residual bytes past the terminator stay in `buf`.
async fn read_block(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    phase: Phase,
) -> Result<HandshakeMessage, SessionError> {
    let mut chunk = [0u8; 1024];
    loop {
        // Binary traffic before ESTABLISHED is a protocol violation.
        if !buf.is_empty() && !handshake::looks_like_handshake(buf) {
            return Err(SessionError::ProtocolViolation {
                phase,
                detail: "binary descriptor before handshake completion",
            });
        }
        match handshake::parse(buf)? {
            ParsedHandshake::Message(message, used) => {
                buf.advance(used);
                return Ok(message);
            }
            ParsedHandshake::NeedMore => {}
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed during handshake",
            )));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn merge_headers(first: Headers, second: Headers) -> Headers {
    let mut merged = first;
    for (name, value) in second.iter() {
        merged.push(name, value);
    }
    merged
}
