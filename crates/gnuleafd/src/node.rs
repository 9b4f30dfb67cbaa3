//! Shared daemon context — identity, configuration-derived constants, and
//! the state every task touches.

use std::net::Ipv4Addr;
use std::sync::Mutex;

use gnuleaf_core::config::GnuLeafConfig;
use gnuleaf_core::guid::Guid;
use gnuleaf_core::qrp::QrpTable;
use gnuleaf_services::{PeerDirectory, SharedLibrary};

/// Everything the listener, sessions, router and pool share.
pub struct Node {
    pub config: GnuLeafConfig,
    pub servent_id: Guid,
    pub library: SharedLibrary,
    pub directory: PeerDirectory,
    /// Our public address as last learned from Remote-IP headers (or set
    /// from config). Advertised in PONGs and QUERY_HITS.
    public_ip: Mutex<Ipv4Addr>,
    /// The QRP table published to peers. Built once after the library is
    /// seeded; a library change would require a new snapshot and a fresh
    /// RESET+PATCH toward every session.
    qrp_snapshot: QrpTable,
}

impl Node {
    pub fn new(
        config: GnuLeafConfig,
        servent_id: Guid,
        library: SharedLibrary,
        directory: PeerDirectory,
    ) -> Self {
        let public_ip = config
            .network
            .public_ip
            .parse()
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        let qrp_snapshot = library.build_qrp_table();
        Self {
            config,
            servent_id,
            library,
            directory,
            public_ip: Mutex::new(public_ip),
            qrp_snapshot,
        }
    }

    pub fn listen_port(&self) -> u16 {
        self.config.network.listen_port
    }

    pub fn public_ip(&self) -> Ipv4Addr {
        *self.public_ip.lock().expect("public_ip lock")
    }

    /// Record the address a peer told us we connect from. Config-pinned
    /// addresses win over learned ones.
    pub fn learn_public_ip(&self, ip: Ipv4Addr) {
        if !self.config.network.public_ip.is_empty() {
            return;
        }
        let mut current = self.public_ip.lock().expect("public_ip lock");
        if *current != ip {
            tracing::info!(%ip, "learned public address");
            *current = ip;
        }
    }

    /// Would this query pass the table we publish?
    pub fn qrp_matches(&self, criteria: &str) -> bool {
        self.qrp_snapshot.matches_query(criteria)
    }

    /// The QRP table sessions publish after their handshake.
    pub fn qrp_table(&self) -> &QrpTable {
        &self.qrp_snapshot
    }

    pub fn user_agent(&self) -> &str {
        &self.config.sharing.user_agent
    }
}
