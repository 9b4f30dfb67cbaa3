//! 16-byte GUIDs — descriptor ids and the servent id.

use rand::RngCore;

/// An opaque 16-byte Gnutella GUID.
///
/// Used both as the descriptor id in every framed message and as the
/// servent id that identifies this node in QUERY_HITS and PUSH payloads.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    /// Generate a fresh GUID from the thread-local CSPRNG.
    ///
    /// Byte 8 is forced to 0xFF and byte 15 to 0x00, the convention that
    /// marks a modern (0.6-era) servent.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes[8] = 0xFF;
        bytes[15] = 0x00;
        Guid(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Guid(bytes)
    }

    /// Uppercase hex, as written on a GIV line.
    pub fn to_hex_upper(&self) -> String {
        hex::encode_upper(self.0)
    }
}

impl std::fmt::Debug for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Guid({})", hex::encode(self.0))
    }
}

impl std::fmt::Display for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl std::str::FromStr for Guid {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Guid(arr))
    }
}
