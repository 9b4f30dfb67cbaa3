//! Gnutella 0.6 handshake text — CRLF-terminated ASCII, three forms.
//!
//! `GNUTELLA CONNECT/0.6`, `GNUTELLA/0.6 200 OK`, and
//! `GNUTELLA/0.6 <code> <reason>`, each followed by `Name: Value` header
//! lines and a blank line. Header names are case-insensitive; values are
//! comma-separated lists where meaningful.

use std::net::Ipv4Addr;

/// Longest handshake block we will buffer before declaring the peer broken.
pub const MAX_HANDSHAKE_LEN: usize = 4096;

pub const TERMINATOR: &[u8] = b"\r\n\r\n";

// Header names we understand. Matching is always case-insensitive.
pub const H_USER_AGENT: &str = "User-Agent";
pub const H_X_ULTRAPEER: &str = "X-Ultrapeer";
pub const H_ACCEPT_ENCODING: &str = "Accept-Encoding";
pub const H_CONTENT_ENCODING: &str = "Content-Encoding";
pub const H_LISTEN_IP: &str = "Listen-IP";
pub const H_REMOTE_IP: &str = "Remote-IP";
pub const H_X_TRY: &str = "X-Try";
pub const H_X_TRY_ULTRAPEERS: &str = "X-Try-Ultrapeers";
pub const H_X_QUERY_ROUTING: &str = "X-Query-Routing";
pub const H_BYE_PACKET: &str = "Bye-Packet";

pub const DEFLATE: &str = "deflate";

// ── Header collection ─────────────────────────────────────────────────────────

/// An ordered collection of handshake headers.
///
/// Order is preserved so an encoded block reads the way it was built;
/// lookup is case-insensitive per the protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Does the named header's comma-separated value list contain `token`?
    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        self.get(name)
            .map(|v| {
                v.split(',')
                    .any(|item| item.trim().eq_ignore_ascii_case(token))
            })
            .unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// One complete handshake block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeMessage {
    /// `GNUTELLA CONNECT/<version>` — sent by the connecting side.
    Connect { version: String, headers: Headers },
    /// `GNUTELLA/<version> <code> <reason>` — both the 200 OK and any
    /// rejection use this form.
    Response {
        version: String,
        code: u16,
        reason: String,
        headers: Headers,
    },
}

impl HandshakeMessage {
    pub fn headers(&self) -> &Headers {
        match self {
            HandshakeMessage::Connect { headers, .. } => headers,
            HandshakeMessage::Response { headers, .. } => headers,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, HandshakeMessage::Response { code: 200, .. })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake block exceeds {MAX_HANDSHAKE_LEN} bytes without terminator")]
    TooLong,

    #[error("malformed handshake start line: {0:?}")]
    BadStartLine(String),

    #[error("handshake text is not printable ASCII")]
    NotAscii,

    #[error("header value contains CR or LF: {0:?}")]
    IllegalHeaderValue(String),
}

// ── Parsing ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedHandshake {
    Message(HandshakeMessage, usize),
    NeedMore,
}

/// Try to parse one handshake block from the front of `buf`.
///
/// Returns `NeedMore` until the CRLF-CRLF terminator arrives, and errors if
/// the buffer outgrows [`MAX_HANDSHAKE_LEN`] first.
pub fn parse(buf: &[u8]) -> Result<ParsedHandshake, HandshakeError> {
    let end = match find_terminator(buf) {
        Some(pos) => pos,
        None => {
            if buf.len() >= MAX_HANDSHAKE_LEN {
                return Err(HandshakeError::TooLong);
            }
            return Ok(ParsedHandshake::NeedMore);
        }
    };

    let block = &buf[..end];
    if !block.iter().all(|&b| b == b'\r' || b == b'\n' || (0x20..0x7F).contains(&b)) {
        return Err(HandshakeError::NotAscii);
    }
    let text = std::str::from_utf8(block).map_err(|_| HandshakeError::NotAscii)?;

    let mut lines = text.split("\r\n");
    let start = lines.next().unwrap_or_default();
    let message = parse_start_line(start)?;

    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        // First colon splits name from value; both sides are trimmed.
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        headers.push(name.trim(), value.trim());
    }

    let consumed = end + TERMINATOR.len();
    Ok(ParsedHandshake::Message(
        match message {
            StartLine::Connect(version) => HandshakeMessage::Connect { version, headers },
            StartLine::Response {
                version,
                code,
                reason,
            } => HandshakeMessage::Response {
                version,
                code,
                reason,
                headers,
            },
        },
        consumed,
    ))
}

/// Does this buffer start like handshake text rather than a binary frame?
///
/// True while the buffer is a prefix of `GNUTELLA` or starts with it.
pub fn looks_like_handshake(buf: &[u8]) -> bool {
    const PREFIX: &[u8] = b"GNUTELLA";
    let n = buf.len().min(PREFIX.len());
    buf[..n] == PREFIX[..n]
}

enum StartLine {
    Connect(String),
    Response {
        version: String,
        code: u16,
        reason: String,
    },
}

fn parse_start_line(line: &str) -> Result<StartLine, HandshakeError> {
    if let Some(version) = line.strip_prefix("GNUTELLA CONNECT/") {
        if parse_version(version).is_some() {
            return Ok(StartLine::Connect(version.to_string()));
        }
    } else if let Some(rest) = line.strip_prefix("GNUTELLA/") {
        // "<version> <code> <reason...>"
        let mut parts = rest.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        let code = parts.next().unwrap_or_default();
        let reason = parts.next().unwrap_or_default();
        if parse_version(version).is_some() && code.len() == 3 {
            if let Ok(code) = code.parse::<u16>() {
                return Ok(StartLine::Response {
                    version: version.to_string(),
                    code,
                    reason: reason.to_string(),
                });
            }
        }
    }
    Err(HandshakeError::BadStartLine(line.to_string()))
}

/// "0.6" → (0, 6). None for anything that is not `<digits>.<digits>`.
pub fn parse_version(s: &str) -> Option<(u32, u32)> {
    let (major, minor) = s.split_once('.')?;
    if major.is_empty() || minor.is_empty() {
        return None;
    }
    if !major.bytes().all(|b| b.is_ascii_digit()) || !minor.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((major.parse().ok()?, minor.parse().ok()?))
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(TERMINATOR.len())
        .position(|w| w == TERMINATOR)
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Encode a handshake block to wire bytes.
///
/// Rejects header values carrying CR/LF or non-printable bytes — a value
/// smuggled in from the network must never be able to forge extra lines.
pub fn encode(message: &HandshakeMessage) -> Result<Vec<u8>, HandshakeError> {
    let mut out = String::new();
    match message {
        HandshakeMessage::Connect { version, headers } => {
            out.push_str(&format!("GNUTELLA CONNECT/{version}\r\n"));
            encode_headers(&mut out, headers)?;
        }
        HandshakeMessage::Response {
            version,
            code,
            reason,
            headers,
        } => {
            out.push_str(&format!("GNUTELLA/{version} {code} {reason}\r\n"));
            encode_headers(&mut out, headers)?;
        }
    }
    out.push_str("\r\n");
    Ok(out.into_bytes())
}

fn encode_headers(out: &mut String, headers: &Headers) -> Result<(), HandshakeError> {
    for (name, value) in headers.iter() {
        let printable = |s: &str| s.bytes().all(|b| (0x20..0x7F).contains(&b));
        if !printable(name) || !printable(value) {
            return Err(HandshakeError::IllegalHeaderValue(format!("{name}: {value}")));
        }
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    Ok(())
}

// ── X-Try host lists ──────────────────────────────────────────────────────────

/// Parse an `X-Try`/`X-Try-Ultrapeers` value into socket addresses.
///
/// Elements are comma-separated. Some servents append space-delimited
/// attributes after the address ("1.2.3.4:6346 leaves=12"); only the part
/// before the first space is parsed.
pub fn parse_host_list(value: &str) -> Vec<(Ipv4Addr, u16)> {
    value
        .split(',')
        .filter_map(|item| {
            let item = item.trim();
            let addr_part = item.split(' ').next()?;
            let (ip, port) = addr_part.split_once(':')?;
            Some((ip.parse().ok()?, port.parse().ok()?))
        })
        .collect()
}

/// Render a host list for an `X-Try` header we emit.
pub fn format_host_list(hosts: &[(Ipv4Addr, u16)]) -> String {
    hosts
        .iter()
        .map(|(ip, port)| format!("{ip}:{port}"))
        .collect::<Vec<_>>()
        .join(",")
}

// ── Tests ─────────────────────────────────────────────────────────────────────
