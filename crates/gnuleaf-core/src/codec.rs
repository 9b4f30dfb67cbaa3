//! Unified frame parser — one entry point over both wire forms.
//!
//! Bytes that open with the `GNUTELLA` magic (or a prefix of it) are
//! handshake text; anything else is a framed binary descriptor. Sessions
//! that already know their phase call the specific parsers directly; this
//! dispatcher serves callers that sit in front of an undifferentiated
//! byte stream.

use crate::descriptor::{self, DecodeError, Descriptor};
use crate::handshake::{self, HandshakeError, HandshakeMessage, ParsedHandshake};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Handshake(HandshakeMessage),
    Descriptor(Descriptor),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedFrame {
    /// One complete frame plus the bytes it consumed.
    Frame(Frame, usize),
    NeedMore,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Descriptor(#[from] DecodeError),
}

/// Parse one frame off the front of `buf`, deciding the wire form from
/// the leading bytes. Trailing bytes are left for the caller.
pub fn parse(buf: &[u8]) -> Result<ParsedFrame, CodecError> {
    if handshake::looks_like_handshake(buf) {
        match handshake::parse(buf)? {
            ParsedHandshake::Message(message, used) => {
                Ok(ParsedFrame::Frame(Frame::Handshake(message), used))
            }
            ParsedHandshake::NeedMore => Ok(ParsedFrame::NeedMore),
        }
    } else {
        match descriptor::parse(buf)? {
            descriptor::Parsed::Descriptor(d, used) => {
                Ok(ParsedFrame::Frame(Frame::Descriptor(d), used))
            }
            descriptor::Parsed::NeedMore => Ok(ParsedFrame::NeedMore),
        }
    }
}
