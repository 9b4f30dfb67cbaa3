//! GWebCache collaborator contract.
//!
//! The HTTP fetcher itself lives outside this crate; the engine only
//! consumes its results. Fetched peers enter the directory with
//! source=cache, and newly learned cache URLs are remembered for the next
//! bootstrap round.

use std::future::Future;
use std::net::Ipv4Addr;

use crate::directory::PeerDirectory;
use crate::settings::PeerSource;

/// What one cache query returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebCacheFetch {
    pub peers: Vec<(Ipv4Addr, u16)>,
    pub caches: Vec<String>,
}

/// The collaborator interface. Implemented outside the engine.
pub trait WebCache: Send + Sync {
    /// Query a cache URL for peers and further cache URLs.
    fn fetch_peers_and_caches(
        &self,
        url: &str,
    ) -> impl Future<Output = anyhow::Result<WebCacheFetch>> + Send;

    /// Submit our own listen address to a cache.
    fn submit_host(
        &self,
        url: &str,
        ip: Ipv4Addr,
        port: u16,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Feed one fetch result into the directory.
pub fn ingest(directory: &PeerDirectory, source_url: &str, fetch: &WebCacheFetch) {
    for (ip, port) in &fetch.peers {
        directory.add(*ip, *port, PeerSource::Cache);
    }
    for url in &fetch.caches {
        directory.add_cache_url(url);
    }
    directory.mark_cache_pulled(source_url);
    tracing::info!(
        url = source_url,
        peers = fetch.peers.len(),
        caches = fetch.caches.len(),
        "ingested web cache response"
    );
}
