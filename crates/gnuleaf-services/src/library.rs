//! Shared-file library — the inventory searches are answered from.
//!
//! Files get monotonically increasing indices starting at 1. Each record
//! carries the derived keyword set used both for query matching here and
//! for QRP table population. The SHA-1 is computed over the filename (the
//! file-scanning collaborator supplies real content hashes when present)
//! and rendered as a `urn:sha1:` BASE32 string.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use sha1::{Digest, Sha1};

use gnuleaf_core::qrp::{self, QrpTable};

/// One shared file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedFile {
    /// Monotonic index, starting at 1. Referenced by QUERY_HITS and PUSH.
    pub index: u32,
    pub filename: String,
    pub size: u64,
    pub sha1: [u8; 20],
    pub keywords: Vec<String>,
}

impl SharedFile {
    /// `urn:sha1:<BASE32>` for HUGE extension lines.
    pub fn urn(&self) -> String {
        format!("urn:sha1:{}", data_encoding::BASE32.encode(&self.sha1))
    }
}

/// The library itself. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct SharedLibrary {
    files: Arc<DashMap<u32, SharedFile>>,
    next_index: Arc<AtomicU32>,
}

impl SharedLibrary {
    pub fn new() -> Self {
        Self {
            files: Arc::new(DashMap::new()),
            next_index: Arc::new(AtomicU32::new(1)),
        }
    }

    /// Add a file and return its index.
    pub fn add_file(&self, filename: &str, size: u64) -> u32 {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        let sha1: [u8; 20] = Sha1::digest(filename.as_bytes()).into();
        let record = SharedFile {
            index,
            filename: filename.to_string(),
            size,
            sha1,
            keywords: qrp::file_keywords(filename),
        };
        tracing::debug!(index, filename, size, "file shared");
        self.files.insert(index, record);
        index
    }

    pub fn get_file(&self, index: u32) -> Option<SharedFile> {
        self.files.get(&index).map(|r| r.clone())
    }

    pub fn count(&self) -> u32 {
        self.files.len() as u32
    }

    /// Total shared volume in kilobytes, as advertised in PONGs.
    pub fn total_kilobytes(&self) -> u32 {
        let bytes: u64 = self.files.iter().map(|r| r.size).sum();
        (bytes / 1024).min(u64::from(u32::MAX)) as u32
    }

    /// Cheap pre-check: does any query token substring-match any keyword
    /// of any file?
    pub fn matches_query(&self, text: &str) -> bool {
        let tokens = qrp::tokenize(text);
        if tokens.is_empty() {
            return false;
        }
        self.files.iter().any(|r| {
            tokens
                .iter()
                .any(|t| r.keywords.iter().any(|k| k.contains(t.as_str())))
        })
    }

    /// Files where every query token substring-matches some keyword.
    pub fn matching_files(&self, text: &str) -> Vec<SharedFile> {
        let tokens = qrp::tokenize(text);
        if tokens.is_empty() {
            return Vec::new();
        }
        let mut out: Vec<SharedFile> = self
            .files
            .iter()
            .filter(|r| {
                tokens
                    .iter()
                    .all(|t| r.keywords.iter().any(|k| k.contains(t.as_str())))
            })
            .map(|r| r.clone())
            .collect();
        out.sort_by_key(|f| f.index);
        out
    }

    /// Build a QRP table reflecting the exact current file set.
    ///
    /// The caller owns the snapshot; later additions need a fresh build
    /// (and a fresh RESET+PATCH toward each peer).
    pub fn build_qrp_table(&self) -> QrpTable {
        let mut table = QrpTable::new();
        for record in self.files.iter() {
            table.add_file_keywords(&record.keywords);
        }
        table
    }
}
