//! Gnutella binary wire format — framed descriptors.
//!
//! Every binary message is a 23-byte header followed by `payload_length`
//! bytes of payload. All multi-byte integers are little-endian except the
//! 4-byte IP fields, which are big-endian network order. The header and the
//! fixed-size payloads are #[repr(C, packed)] zerocopy types so framing is
//! deterministic and allocation-free on the decode hot path.

use std::net::Ipv4Addr;

use static_assertions::assert_eq_size;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::guid::Guid;

// ── Header ────────────────────────────────────────────────────────────────────

/// The 23-byte descriptor header that precedes every payload.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct DescriptorHeader {
    /// Opaque 16-byte GUID identifying this descriptor on the network.
    pub descriptor_id: [u8; 16],

    /// Payload type tag. See the PAYLOAD_* constants.
    pub payload_descriptor: u8,

    /// Remaining hops this descriptor may travel.
    pub ttl: u8,

    /// Hops travelled so far.
    pub hops: u8,

    /// Payload length in bytes, not including this header.
    pub payload_length: U32,
}

assert_eq_size!(DescriptorHeader, [u8; 23]);

pub const HEADER_LEN: usize = 23;

/// Decode ceiling for claimed payload lengths. Anything larger is treated
/// as a framing error and kills the connection.
pub const MAX_PAYLOAD: usize = 65536;

pub const PAYLOAD_PING: u8 = 0x00;
pub const PAYLOAD_PONG: u8 = 0x01;
pub const PAYLOAD_BYE: u8 = 0x02;
pub const PAYLOAD_ROUTE_TABLE_UPDATE: u8 = 0x30;
pub const PAYLOAD_PUSH: u8 = 0x40;
pub const PAYLOAD_QUERY: u8 = 0x80;
pub const PAYLOAD_QUERY_HITS: u8 = 0x81;

/// TTL/hops accounting applied before any forward or reply synthesis.
///
/// A header with ttl == 0 is left unchanged and the descriptor must be
/// dropped. Otherwise ttl is decremented, hops incremented, and the
/// descriptor may proceed.
pub fn adjust_ttl(ttl: &mut u8, hops: &mut u8) -> bool {
    if *ttl == 0 {
        return false;
    }
    *ttl -= 1;
    *hops = hops.saturating_add(1);
    true
}

// ── Fixed-size payloads ───────────────────────────────────────────────────────

/// PONG wire layout (14 bytes).
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
struct PongWire {
    port: U16,
    ip: [u8; 4],
    files_shared: U32,
    kilobytes_shared: U32,
}

assert_eq_size!(PongWire, [u8; 14]);

/// PUSH wire layout (26 bytes).
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
struct PushWire {
    servent_id: [u8; 16],
    file_index: U32,
    ip: [u8; 4],
    port: U16,
}

assert_eq_size!(PushWire, [u8; 26]);

// ── Logical message types ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pong {
    pub port: u16,
    pub ip: Ipv4Addr,
    pub files_shared: u32,
    pub kilobytes_shared: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub min_speed: u16,
    pub criteria: String,
    /// Raw extension bytes after the criteria NUL (GGEP block or HUGE
    /// urn lines). Carried opaque; never interpreted.
    pub extensions: Vec<u8>,
}

/// One result record inside a QUERY_HITS payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HitRecord {
    pub file_index: u32,
    pub file_size: u32,
    pub file_name: String,
    /// Bytes between the name terminator and the record terminator —
    /// typically HUGE urns or GGEP. Opaque.
    pub metadata: Vec<u8>,
}

/// The optional extended block between the result set and the servent id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryHitDescriptor {
    /// Four ASCII bytes of vendor code.
    pub vendor_code: [u8; 4],
    /// Open data area (first two bytes carry the trailer flag masks).
    pub open_data: Vec<u8>,
    /// Vendor-private area, optionally GGEP. Opaque.
    pub private_data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryHits {
    pub port: u16,
    pub ip: Ipv4Addr,
    pub speed: u32,
    pub hits: Vec<HitRecord>,
    pub descriptor: Option<QueryHitDescriptor>,
    pub servent_id: Guid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Push {
    pub servent_id: Guid,
    pub file_index: u32,
    pub ip: Ipv4Addr,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bye {
    pub code: u16,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTableUpdate {
    Reset {
        table_length: u32,
        infinity: u8,
    },
    Patch {
        /// 1-based sequence number of this chunk.
        seq_no: u8,
        seq_count: u8,
        /// 0 = uncompressed, 1 = deflate.
        compressor: u8,
        entry_bits: u8,
        data: Vec<u8>,
    },
}

pub const RTU_VARIANT_RESET: u8 = 0x00;
pub const RTU_VARIANT_PATCH: u8 = 0x01;

/// The payload sum type the router dispatches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Ping,
    Pong(Pong),
    Bye(Bye),
    RouteTableUpdate(RouteTableUpdate),
    Push(Push),
    Query(Query),
    QueryHits(QueryHits),
    /// A payload descriptor byte we do not know. The raw bytes are kept so
    /// the router can drop it without killing the connection.
    Unknown { payload_descriptor: u8, raw: Vec<u8> },
}

impl Payload {
    pub fn payload_descriptor(&self) -> u8 {
        match self {
            Payload::Ping => PAYLOAD_PING,
            Payload::Pong(_) => PAYLOAD_PONG,
            Payload::Bye(_) => PAYLOAD_BYE,
            Payload::RouteTableUpdate(_) => PAYLOAD_ROUTE_TABLE_UPDATE,
            Payload::Push(_) => PAYLOAD_PUSH,
            Payload::Query(_) => PAYLOAD_QUERY,
            Payload::QueryHits(_) => PAYLOAD_QUERY_HITS,
            Payload::Unknown {
                payload_descriptor, ..
            } => *payload_descriptor,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Payload::Ping => "ping",
            Payload::Pong(_) => "pong",
            Payload::Bye(_) => "bye",
            Payload::RouteTableUpdate(_) => "route_table_update",
            Payload::Push(_) => "push",
            Payload::Query(_) => "query",
            Payload::QueryHits(_) => "query_hits",
            Payload::Unknown { .. } => "unknown",
        }
    }
}

/// A complete framed descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub descriptor_id: Guid,
    pub ttl: u8,
    pub hops: u8,
    pub payload: Payload,
}

impl Descriptor {
    /// A freshly-originated descriptor: new GUID, hops 0.
    pub fn originate(ttl: u8, payload: Payload) -> Self {
        Self {
            descriptor_id: Guid::random(),
            ttl,
            hops: 0,
            payload,
        }
    }

    /// A reply descriptor: reuses the request GUID so the requester can
    /// correlate.
    pub fn reply(to: Guid, ttl: u8, payload: Payload) -> Self {
        Self {
            descriptor_id: to,
            ttl,
            hops: 0,
            payload,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("claimed payload length {0} exceeds ceiling {MAX_PAYLOAD}")]
    PayloadTooLarge(u32),

    #[error("{kind} payload truncated: have {have}, need {need}")]
    Truncated {
        kind: &'static str,
        have: usize,
        need: usize,
    },

    #[error("{0} payload missing NUL terminator")]
    MissingNul(&'static str),

    #[error("route table update has unknown variant 0x{0:02x}")]
    UnknownRouteTableVariant(u8),
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Outcome of a parse attempt against a read buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    /// A full descriptor plus the number of buffer bytes it consumed.
    Descriptor(Descriptor, usize),
    /// The buffer does not yet hold a complete frame.
    NeedMore,
}

/// Try to decode one framed descriptor from the front of `buf`.
///
/// Trailing bytes beyond the frame are left untouched; the caller advances
/// its buffer by the consumed count.
pub fn parse(buf: &[u8]) -> Result<Parsed, DecodeError> {
    if buf.len() < HEADER_LEN {
        return Ok(Parsed::NeedMore);
    }
    let header = DescriptorHeader::read_from_prefix(buf)
        .expect("header prefix length already checked");

    let payload_length = header.payload_length.get();
    if payload_length as usize > MAX_PAYLOAD {
        return Err(DecodeError::PayloadTooLarge(payload_length));
    }

    let total = HEADER_LEN + payload_length as usize;
    if buf.len() < total {
        return Ok(Parsed::NeedMore);
    }

    let payload_bytes = &buf[HEADER_LEN..total];
    let payload = decode_payload(header.payload_descriptor, payload_bytes)?;

    Ok(Parsed::Descriptor(
        Descriptor {
            descriptor_id: Guid::from_bytes(header.descriptor_id),
            ttl: header.ttl,
            hops: header.hops,
            payload,
        },
        total,
    ))
}

fn decode_payload(payload_descriptor: u8, bytes: &[u8]) -> Result<Payload, DecodeError> {
    match payload_descriptor {
        PAYLOAD_PING => Ok(Payload::Ping),
        PAYLOAD_PONG => decode_pong(bytes),
        PAYLOAD_BYE => decode_bye(bytes),
        PAYLOAD_ROUTE_TABLE_UPDATE => decode_route_table_update(bytes),
        PAYLOAD_PUSH => decode_push(bytes),
        PAYLOAD_QUERY => decode_query(bytes),
        PAYLOAD_QUERY_HITS => decode_query_hits(bytes),
        other => Ok(Payload::Unknown {
            payload_descriptor: other,
            raw: bytes.to_vec(),
        }),
    }
}

fn decode_pong(bytes: &[u8]) -> Result<Payload, DecodeError> {
    let wire = PongWire::read_from_prefix(bytes).ok_or(DecodeError::Truncated {
        kind: "pong",
        have: bytes.len(),
        need: std::mem::size_of::<PongWire>(),
    })?;
    Ok(Payload::Pong(Pong {
        port: wire.port.get(),
        ip: Ipv4Addr::from(wire.ip),
        files_shared: wire.files_shared.get(),
        kilobytes_shared: wire.kilobytes_shared.get(),
    }))
}

fn decode_push(bytes: &[u8]) -> Result<Payload, DecodeError> {
    let wire = PushWire::read_from_prefix(bytes).ok_or(DecodeError::Truncated {
        kind: "push",
        have: bytes.len(),
        need: std::mem::size_of::<PushWire>(),
    })?;
    Ok(Payload::Push(Push {
        servent_id: Guid::from_bytes(wire.servent_id),
        file_index: wire.file_index.get(),
        ip: Ipv4Addr::from(wire.ip),
        port: wire.port.get(),
    }))
}

fn decode_bye(bytes: &[u8]) -> Result<Payload, DecodeError> {
    if bytes.len() < 2 {
        return Err(DecodeError::Truncated {
            kind: "bye",
            have: bytes.len(),
            need: 2,
        });
    }
    let code = u16::from_le_bytes([bytes[0], bytes[1]]);
    // Message runs to the NUL; anything after (optional CRLF headers) is
    // tolerated and ignored.
    let rest = &bytes[2..];
    let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    let message = String::from_utf8_lossy(&rest[..end]).into_owned();
    Ok(Payload::Bye(Bye { code, message }))
}

fn decode_query(bytes: &[u8]) -> Result<Payload, DecodeError> {
    if bytes.len() < 2 {
        return Err(DecodeError::Truncated {
            kind: "query",
            have: bytes.len(),
            need: 2,
        });
    }
    let min_speed = u16::from_le_bytes([bytes[0], bytes[1]]);
    let rest = &bytes[2..];
    let nul = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(DecodeError::MissingNul("query"))?;
    let criteria = String::from_utf8_lossy(&rest[..nul]).into_owned();
    let extensions = rest[nul + 1..].to_vec();
    Ok(Payload::Query(Query {
        min_speed,
        criteria,
        extensions,
    }))
}

fn decode_query_hits(bytes: &[u8]) -> Result<Payload, DecodeError> {
    const FIXED: usize = 11; // count + port + ip + speed
    const SERVENT_ID: usize = 16;
    if bytes.len() < FIXED + SERVENT_ID {
        return Err(DecodeError::Truncated {
            kind: "query_hits",
            have: bytes.len(),
            need: FIXED + SERVENT_ID,
        });
    }

    let count = bytes[0] as usize;
    let port = u16::from_le_bytes([bytes[1], bytes[2]]);
    let ip = Ipv4Addr::new(bytes[3], bytes[4], bytes[5], bytes[6]);
    let speed = u32::from_le_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]);

    // Result records live in [FIXED, len - 16); the trailing 16 bytes are
    // always the servent id.
    let body = &bytes[FIXED..bytes.len() - SERVENT_ID];
    let mut cursor = 0usize;
    let mut hits = Vec::with_capacity(count);
    for _ in 0..count {
        let (hit, used) = decode_hit_record(&body[cursor..], body.len() - cursor)?;
        hits.push(hit);
        cursor += used;
    }

    let descriptor = decode_query_hit_descriptor(&body[cursor..])?;

    let mut servent_id = [0u8; 16];
    servent_id.copy_from_slice(&bytes[bytes.len() - SERVENT_ID..]);

    Ok(Payload::QueryHits(QueryHits {
        port,
        ip,
        speed,
        hits,
        descriptor,
        servent_id: Guid::from_bytes(servent_id),
    }))
}

fn decode_hit_record(body: &[u8], remaining: usize) -> Result<(HitRecord, usize), DecodeError> {
    if remaining < 8 {
        return Err(DecodeError::Truncated {
            kind: "query_hits",
            have: remaining,
            need: 8,
        });
    }
    let file_index = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    let file_size = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
    let rest = &body[8..];
    let name_end = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(DecodeError::MissingNul("query_hits result name"))?;
    let file_name = String::from_utf8_lossy(&rest[..name_end]).into_owned();
    let after_name = &rest[name_end + 1..];
    let meta_end = after_name
        .iter()
        .position(|&b| b == 0)
        .ok_or(DecodeError::MissingNul("query_hits result terminator"))?;
    let metadata = after_name[..meta_end].to_vec();
    let used = 8 + name_end + 1 + meta_end + 1;
    Ok((
        HitRecord {
            file_index,
            file_size,
            file_name,
            metadata,
        },
        used,
    ))
}

fn decode_query_hit_descriptor(
    bytes: &[u8],
) -> Result<Option<QueryHitDescriptor>, DecodeError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    if bytes.len() < 5 {
        return Err(DecodeError::Truncated {
            kind: "query_hit_descriptor",
            have: bytes.len(),
            need: 5,
        });
    }
    let mut vendor_code = [0u8; 4];
    vendor_code.copy_from_slice(&bytes[..4]);
    let open_len = bytes[4] as usize;
    if bytes.len() < 5 + open_len {
        return Err(DecodeError::Truncated {
            kind: "query_hit_descriptor",
            have: bytes.len(),
            need: 5 + open_len,
        });
    }
    let open_data = bytes[5..5 + open_len].to_vec();
    let private_data = bytes[5 + open_len..].to_vec();
    Ok(Some(QueryHitDescriptor {
        vendor_code,
        open_data,
        private_data,
    }))
}

fn decode_route_table_update(bytes: &[u8]) -> Result<Payload, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Truncated {
            kind: "route_table_update",
            have: 0,
            need: 1,
        });
    }
    match bytes[0] {
        RTU_VARIANT_RESET => {
            if bytes.len() < 6 {
                return Err(DecodeError::Truncated {
                    kind: "route_table_update reset",
                    have: bytes.len(),
                    need: 6,
                });
            }
            let table_length = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
            Ok(Payload::RouteTableUpdate(RouteTableUpdate::Reset {
                table_length,
                infinity: bytes[5],
            }))
        }
        RTU_VARIANT_PATCH => {
            if bytes.len() < 5 {
                return Err(DecodeError::Truncated {
                    kind: "route_table_update patch",
                    have: bytes.len(),
                    need: 5,
                });
            }
            Ok(Payload::RouteTableUpdate(RouteTableUpdate::Patch {
                seq_no: bytes[1],
                seq_count: bytes[2],
                compressor: bytes[3],
                entry_bits: bytes[4],
                data: bytes[5..].to_vec(),
            }))
        }
        other => Err(DecodeError::UnknownRouteTableVariant(other)),
    }
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Encode a descriptor to its exact wire bytes.
pub fn encode(descriptor: &Descriptor) -> Vec<u8> {
    let payload = encode_payload(&descriptor.payload);
    let header = DescriptorHeader {
        descriptor_id: *descriptor.descriptor_id.as_bytes(),
        payload_descriptor: descriptor.payload.payload_descriptor(),
        ttl: descriptor.ttl,
        hops: descriptor.hops,
        payload_length: U32::new(payload.len() as u32),
    };
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&payload);
    out
}

fn encode_payload(payload: &Payload) -> Vec<u8> {
    match payload {
        Payload::Ping => Vec::new(),
        Payload::Pong(p) => PongWire {
            port: U16::new(p.port),
            ip: p.ip.octets(),
            files_shared: U32::new(p.files_shared),
            kilobytes_shared: U32::new(p.kilobytes_shared),
        }
        .as_bytes()
        .to_vec(),
        Payload::Push(p) => PushWire {
            servent_id: *p.servent_id.as_bytes(),
            file_index: U32::new(p.file_index),
            ip: p.ip.octets(),
            port: U16::new(p.port),
        }
        .as_bytes()
        .to_vec(),
        Payload::Bye(b) => {
            let mut out = Vec::with_capacity(3 + b.message.len());
            out.extend_from_slice(&b.code.to_le_bytes());
            out.extend_from_slice(b.message.as_bytes());
            out.push(0);
            out
        }
        Payload::Query(q) => {
            let mut out = Vec::with_capacity(3 + q.criteria.len() + q.extensions.len());
            out.extend_from_slice(&q.min_speed.to_le_bytes());
            out.extend_from_slice(q.criteria.as_bytes());
            out.push(0);
            out.extend_from_slice(&q.extensions);
            out
        }
        Payload::QueryHits(qh) => encode_query_hits(qh),
        Payload::RouteTableUpdate(rtu) => match rtu {
            RouteTableUpdate::Reset {
                table_length,
                infinity,
            } => {
                let mut out = Vec::with_capacity(6);
                out.push(RTU_VARIANT_RESET);
                out.extend_from_slice(&table_length.to_le_bytes());
                out.push(*infinity);
                out
            }
            RouteTableUpdate::Patch {
                seq_no,
                seq_count,
                compressor,
                entry_bits,
                data,
            } => {
                let mut out = Vec::with_capacity(5 + data.len());
                out.push(RTU_VARIANT_PATCH);
                out.push(*seq_no);
                out.push(*seq_count);
                out.push(*compressor);
                out.push(*entry_bits);
                out.extend_from_slice(data);
                out
            }
        },
        Payload::Unknown { raw, .. } => raw.clone(),
    }
}

fn encode_query_hits(qh: &QueryHits) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(qh.hits.len() as u8);
    out.extend_from_slice(&qh.port.to_le_bytes());
    out.extend_from_slice(&qh.ip.octets());
    out.extend_from_slice(&qh.speed.to_le_bytes());
    for hit in &qh.hits {
        out.extend_from_slice(&hit.file_index.to_le_bytes());
        out.extend_from_slice(&hit.file_size.to_le_bytes());
        out.extend_from_slice(hit.file_name.as_bytes());
        out.push(0);
        out.extend_from_slice(&hit.metadata);
        out.push(0);
    }
    if let Some(qhd) = &qh.descriptor {
        out.extend_from_slice(&qhd.vendor_code);
        out.push(qhd.open_data.len() as u8);
        out.extend_from_slice(&qhd.open_data);
        out.extend_from_slice(&qhd.private_data);
    }
    out.extend_from_slice(qh.servent_id.as_bytes());
    out
}

// ── Tests ─────────────────────────────────────────────────────────────────────
