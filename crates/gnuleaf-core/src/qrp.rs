//! Query Routing Protocol — keyword hashing, the route table, and the
//! RESET/PATCH message pair that publishes it to peers.
//!
//! The table is a dense array of slot values in [0..INFINITY]. Absent slots
//! hold INFINITY; a keyword present in the local library sets its slot to 1.
//! Patches carry per-slot deltas against the previously-sent table, packed
//! as 4-bit signed nibbles and deflate-compressed.

use std::io::Write;

use crate::descriptor::RouteTableUpdate;

/// Multiplicative constant of the canonical QRP hash.
pub const HASH_A: u32 = 0x4F1B_BCDC;

/// Slot count of the table we publish. Power of two; advertised in RESET.
pub const TABLE_SIZE: usize = 65536;

/// log2(TABLE_SIZE) — the hash width used when populating the table.
pub const TABLE_BITS: u8 = 16;

/// The "not present" slot value, also the infinity byte sent in RESET.
pub const INFINITY: u8 = 7;

/// Bits per patch entry. 4-bit signed deltas.
pub const ENTRY_BITS: u8 = 4;

/// Patch data is split into chunks of at most this many bytes.
pub const PATCH_CHUNK: usize = 1018;

/// Compressor byte for deflate-compressed patch data.
pub const COMPRESSOR_DEFLATE: u8 = 1;

// ── Hash ──────────────────────────────────────────────────────────────────────

/// The canonical QRP hash.
///
/// XOR-folds the lowercased UTF-8 bytes into a 32-bit word (little-endian
/// byte lanes), multiplies by A, and keeps the top `bits` bits of the low
/// 32 bits of the product.
pub fn hash(text: &str, bits: u8) -> u32 {
    let lower = text.to_lowercase();
    let mut x: u32 = 0;
    for (i, byte) in lower.bytes().enumerate() {
        x ^= u32::from(byte) << ((i % 4) * 8);
    }
    let product = u64::from(x) * u64::from(HASH_A);
    ((product >> (32 - u32::from(bits))) & ((1u64 << bits) - 1)) as u32
}

// ── Keyword extraction ────────────────────────────────────────────────────────

/// Tokenize a filename into QRP keywords.
///
/// Lowercases, splits on runs of non-alphanumerics, keeps tokens of length
/// >= 3, and adds the extensionless base as a single keyword plus the
/// extension itself when long enough.
pub fn file_keywords(filename: &str) -> Vec<String> {
    let lower = filename.to_lowercase();
    let (base, extension) = match lower.rsplit_once('.') {
        Some((b, e)) => (b, Some(e)),
        None => (lower.as_str(), None),
    };

    let mut keywords = tokenize(&lower);
    if base.len() >= 3 && !keywords.iter().any(|k| k == base) {
        keywords.push(base.to_string());
    }
    if let Some(ext) = extension {
        if ext.len() >= 3 && !keywords.iter().any(|k| k == ext) {
            keywords.push(ext.to_string());
        }
    }
    keywords
}

/// Tokenize free text (a query or a name) into keywords: lowercase,
/// alphanumeric runs, length >= 3.
pub fn tokenize(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    let mut out = Vec::new();
    for token in lower.split(|c: char| !c.is_alphanumeric()) {
        if token.len() >= 3 && !out.iter().any(|t| t == token) {
            out.push(token.to_string());
        }
    }
    out
}

// ── Table ─────────────────────────────────────────────────────────────────────

/// The route table we publish. Rebuilt from scratch whenever the shared
/// library changes; a rebuild requires sending a fresh RESET+PATCH pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrpTable {
    slots: Vec<u8>,
}

impl Default for QrpTable {
    fn default() -> Self {
        Self::new()
    }
}

impl QrpTable {
    pub fn new() -> Self {
        Self {
            slots: vec![INFINITY; TABLE_SIZE],
        }
    }

    /// Mark one keyword present.
    pub fn add_keyword(&mut self, keyword: &str) {
        let slot = hash(keyword, TABLE_BITS) as usize;
        self.slots[slot] = 1;
    }

    /// Mark all of a file's keywords present.
    pub fn add_file_keywords(&mut self, keywords: &[String]) {
        for kw in keywords {
            self.add_keyword(kw);
        }
    }

    /// Would this query pass the table? Every token must land on a
    /// present slot.
    pub fn matches_query(&self, criteria: &str) -> bool {
        let tokens = tokenize(criteria);
        if tokens.is_empty() {
            return false;
        }
        tokens
            .iter()
            .all(|t| self.slots[hash(t, TABLE_BITS) as usize] < INFINITY)
    }

    pub fn populated_slots(&self) -> usize {
        self.slots.iter().filter(|&&s| s < INFINITY).count()
    }

    /// The RESET message advertising this table's geometry.
    pub fn reset_message(&self) -> RouteTableUpdate {
        RouteTableUpdate::Reset {
            table_length: TABLE_SIZE as u32,
            infinity: INFINITY,
        }
    }

    /// Build the PATCH message sequence carrying the delta from
    /// `previous_sent` (or from an all-INFINITY table when this is the
    /// first patch after a RESET).
    pub fn patch_messages(
        &self,
        previous_sent: Option<&QrpTable>,
    ) -> Result<Vec<RouteTableUpdate>, PatchError> {
        let mut nibbles = Vec::with_capacity(TABLE_SIZE);
        for i in 0..TABLE_SIZE {
            let prev = previous_sent.map(|t| t.slots[i]).unwrap_or(INFINITY);
            let delta = i16::from(self.slots[i]) - i16::from(prev);
            nibbles.push(delta.clamp(-8, 7) as i8);
        }

        let packed = pack_nibbles(&nibbles);
        let compressed = deflate(&packed)?;

        let chunks: Vec<&[u8]> = compressed.chunks(PATCH_CHUNK).collect();
        if chunks.len() > usize::from(u8::MAX) {
            return Err(PatchError::TooManyChunks(chunks.len()));
        }
        let seq_count = chunks.len() as u8;
        Ok(chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| RouteTableUpdate::Patch {
                seq_no: (i + 1) as u8,
                seq_count,
                compressor: COMPRESSOR_DEFLATE,
                entry_bits: ENTRY_BITS,
                data: chunk.to_vec(),
            })
            .collect())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("failed to compress patch data: {0}")]
    Compress(#[from] std::io::Error),

    #[error("patch would need {0} chunks, more than fit in a u8 sequence")]
    TooManyChunks(usize),
}

/// Two 4-bit signed values per byte, first value in the high nibble.
fn pack_nibbles(values: &[i8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len().div_ceil(2));
    for pair in values.chunks(2) {
        let hi = (pair[0] as u8) & 0x0F;
        let lo = if pair.len() > 1 { (pair[1] as u8) & 0x0F } else { 0 };
        out.push((hi << 4) | lo);
    }
    out
}

fn deflate(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder =
        flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Inflate helper for patch data (compressor byte 1).
pub fn inflate(data: &[u8]) -> std::io::Result<Vec<u8>> {
    use std::io::Read;
    let mut decoder = flate2::read::ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
