//! Router — per-type dispatch for every descriptor a session delivers.
//!
//! A leaf routes nothing onward: replies (PONG, QUERY_HITS) travel back on
//! the session they arrived on, PUSH triggers the GIV dial-back, and
//! everything else is consumed or dropped. Duplicate suppression and TTL
//! accounting run before any per-type behavior.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use gnuleaf_core::descriptor::{
    adjust_ttl, Descriptor, HitRecord, Payload, Pong, Push, Query, QueryHitDescriptor, QueryHits,
};
use gnuleaf_services::{DedupCache, PeerSource, SharedFile};

use crate::node::Node;
use crate::session::SessionHandle;

/// Vendor code we stamp into the query hit descriptor block.
const VENDOR_CODE: [u8; 4] = *b"GNLF";

/// Connect timeout for the PUSH dial-back.
const PUSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// What the session loop should do after one descriptor.
#[derive(Debug, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    Close { bye: Option<(u16, String)> },
}

/// A connected PUSH socket, GIV line already written, ready for the
/// external file server.
pub struct GivHandoff {
    pub stream: TcpStream,
    pub file: SharedFile,
    pub remote: SocketAddr,
}

pub struct Router {
    dedup: Mutex<DedupCache>,
    giv_tx: mpsc::UnboundedSender<GivHandoff>,
    hits_received: AtomicU64,
}

impl Router {
    pub fn new(giv_tx: mpsc::UnboundedSender<GivHandoff>) -> Self {
        Self {
            dedup: Mutex::new(DedupCache::new()),
            giv_tx,
            hits_received: AtomicU64::new(0),
        }
    }

    pub fn hits_received(&self) -> u64 {
        self.hits_received.load(Ordering::Relaxed)
    }

    /// Dispatch one inbound descriptor from an established session.
    pub fn handle(
        &self,
        node: &Arc<Node>,
        session: &SessionHandle,
        mut descriptor: Descriptor,
    ) -> Disposition {
        tracing::trace!(
            remote = %session.remote,
            kind = descriptor.payload.kind_name(),
            ttl = descriptor.ttl,
            hops = descriptor.hops,
            "descriptor received"
        );

        // BYE is honored regardless of TTL or duplication.
        if let Payload::Bye(bye) = &descriptor.payload {
            tracing::info!(
                remote = %session.remote,
                code = bye.code,
                message = %bye.message,
                "peer said bye"
            );
            return Disposition::Close { bye: None };
        }

        // Duplicate suppression for the routable types.
        if matches!(
            descriptor.payload,
            Payload::Pong(_) | Payload::Query(_) | Payload::QueryHits(_) | Payload::Push(_)
        ) {
            let fresh = self
                .dedup
                .lock()
                .expect("dedup lock")
                .check_and_insert(*descriptor.descriptor_id.as_bytes());
            if !fresh {
                tracing::debug!(
                    id = %descriptor.descriptor_id,
                    kind = descriptor.payload.kind_name(),
                    "duplicate descriptor dropped"
                );
                return Disposition::Continue;
            }
        }

        // TTL accounting. Replies are synthesized from the pre-adjust hop
        // count; a descriptor that arrives already dead is dropped.
        let original_hops = descriptor.hops;
        match &descriptor.payload {
            Payload::RouteTableUpdate(_) | Payload::Unknown { .. } => {}
            _ => {
                if !adjust_ttl(&mut descriptor.ttl, &mut descriptor.hops) {
                    tracing::debug!(
                        id = %descriptor.descriptor_id,
                        kind = descriptor.payload.kind_name(),
                        "dead descriptor (ttl 0) dropped"
                    );
                    return Disposition::Continue;
                }
            }
        }

        match descriptor.payload {
            Payload::Ping => self.on_ping(node, session, descriptor.descriptor_id, original_hops),
            Payload::Pong(pong) => {
                node.directory.add(pong.ip, pong.port, PeerSource::Pong);
                Disposition::Continue
            }
            Payload::Query(query) => {
                self.on_query(node, session, descriptor.descriptor_id, original_hops, query)
            }
            Payload::QueryHits(hits) => {
                let total = self.hits_received.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::info!(
                    remote = %session.remote,
                    results = hits.hits.len(),
                    from = %hits.ip,
                    total_hit_messages = total,
                    "query hits received"
                );
                Disposition::Continue
            }
            Payload::Push(push) => self.on_push(node, push),
            Payload::RouteTableUpdate(_) => {
                // Leaves do not route on peer tables; accept and discard.
                tracing::debug!(remote = %session.remote, "ignoring inbound route table update");
                Disposition::Continue
            }
            Payload::Unknown { payload_descriptor, ref raw } => {
                tracing::debug!(
                    remote = %session.remote,
                    payload_descriptor = format!("0x{payload_descriptor:02x}"),
                    len = raw.len(),
                    "unknown descriptor dropped"
                );
                Disposition::Continue
            }
            Payload::Bye(_) => unreachable!("bye handled above"),
        }
    }

    fn on_ping(
        &self,
        node: &Arc<Node>,
        session: &SessionHandle,
        id: gnuleaf_core::guid::Guid,
        original_hops: u8,
    ) -> Disposition {
        let pong = Descriptor::reply(
            id,
            original_hops.saturating_add(1).max(1),
            Payload::Pong(Pong {
                port: node.listen_port(),
                ip: node.public_ip(),
                files_shared: node.library.count(),
                kilobytes_shared: node.library.total_kilobytes(),
            }),
        );
        if !session.send_descriptor(&pong) {
            return Disposition::Close {
                bye: Some((500, "congested".into())),
            };
        }
        Disposition::Continue
    }

    fn on_query(
        &self,
        node: &Arc<Node>,
        session: &SessionHandle,
        id: gnuleaf_core::guid::Guid,
        original_hops: u8,
        query: Query,
    ) -> Disposition {
        // Our own QRP table prunes most non-matching queries before the
        // library is consulted.
        if !node.qrp_matches(&query.criteria) {
            tracing::trace!(criteria = %query.criteria, "query pruned by QRP");
            return Disposition::Continue;
        }
        let files = node.library.matching_files(&query.criteria);
        if files.is_empty() {
            return Disposition::Continue;
        }

        tracing::debug!(
            remote = %session.remote,
            criteria = %query.criteria,
            results = files.len(),
            "answering query"
        );

        let hits: Vec<HitRecord> = files
            .iter()
            .map(|f| HitRecord {
                file_index: f.index,
                file_size: f.size.min(u64::from(u32::MAX)) as u32,
                file_name: f.filename.clone(),
                metadata: f.urn().into_bytes(),
            })
            .collect();

        let reply = Descriptor::reply(
            id,
            original_hops.saturating_add(1).min(7).max(1),
            Payload::QueryHits(QueryHits {
                port: node.listen_port(),
                ip: node.public_ip(),
                speed: 1000,
                hits,
                descriptor: Some(QueryHitDescriptor {
                    vendor_code: VENDOR_CODE,
                    open_data: vec![0x00, 0x00],
                    private_data: Vec::new(),
                }),
                servent_id: node.servent_id,
            }),
        );
        if !session.send_descriptor(&reply) {
            return Disposition::Close {
                bye: Some((500, "congested".into())),
            };
        }
        Disposition::Continue
    }

    fn on_push(&self, node: &Arc<Node>, push: Push) -> Disposition {
        if push.servent_id != node.servent_id {
            tracing::debug!(
                target = %push.servent_id,
                "push for a different servent dropped"
            );
            return Disposition::Continue;
        }
        let Some(file) = node.library.get_file(push.file_index) else {
            tracing::warn!(file_index = push.file_index, "push for unknown file index");
            return Disposition::Continue;
        };

        let giv_tx = self.giv_tx.clone();
        let servent_id = node.servent_id;
        let remote = SocketAddr::from((push.ip, push.port));
        tokio::spawn(async move {
            match dial_giv(remote, servent_id, &file).await {
                Ok(stream) => {
                    tracing::info!(%remote, file = %file.filename, "GIV line sent");
                    let _ = giv_tx.send(GivHandoff {
                        stream,
                        file,
                        remote,
                    });
                }
                Err(e) => {
                    tracing::warn!(%remote, error = %e, "push dial-back failed");
                }
            }
        });
        Disposition::Continue
    }
}

/// Connect back to a firewalled requester and write the GIV line.
async fn dial_giv(
    remote: SocketAddr,
    servent_id: gnuleaf_core::guid::Guid,
    file: &SharedFile,
) -> std::io::Result<TcpStream> {
    let mut stream = tokio::time::timeout(PUSH_CONNECT_TIMEOUT, TcpStream::connect(remote))
        .await
        .map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::TimedOut, "push connect timed out")
        })??;
    let line = giv_line(file.index, &servent_id, &file.filename);
    stream.write_all(line.as_bytes()).await?;
    Ok(stream)
}

/// `GIV <fileIndex>:<UPPERCASE-HEX serventId>/<filename>\n\n`, byte-exact.
pub fn giv_line(file_index: u32, servent_id: &gnuleaf_core::guid::Guid, filename: &str) -> String {
    format!("GIV {file_index}:{}/{filename}\n\n", servent_id.to_hex_upper())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gnuleaf_core::config::GnuLeafConfig;
    use gnuleaf_core::descriptor::{self, Bye, RouteTableUpdate};
    use gnuleaf_core::guid::Guid;
    use gnuleaf_services::{PeerDirectory, SharedLibrary};
    use std::net::Ipv4Addr;

    use crate::session::{test_handle, SessionHandle};

    fn test_node(files: &[(&str, u64)]) -> Arc<Node> {
        let library = SharedLibrary::new();
        for (name, size) in files {
            library.add_file(name, *size);
        }
        Arc::new(Node::new(
            GnuLeafConfig::default(),
            Guid::random(),
            library,
            PeerDirectory::new(),
        ))
    }

    fn test_router() -> Router {
        let (giv_tx, _giv_rx) = mpsc::unbounded_channel();
        Router::new(giv_tx)
    }

    fn session() -> (Arc<SessionHandle>, mpsc::UnboundedReceiver<Vec<u8>>) {
        test_handle(SocketAddr::from((Ipv4Addr::new(10, 0, 0, 2), 6346)))
    }

    fn decode(frame: Vec<u8>) -> Descriptor {
        match descriptor::parse(&frame).unwrap() {
            descriptor::Parsed::Descriptor(d, used) => {
                assert_eq!(used, frame.len());
                d
            }
            descriptor::Parsed::NeedMore => panic!("incomplete frame queued"),
        }
    }

    #[test]
    fn ping_answered_with_pong_reusing_id() {
        let node = test_node(&[]);
        let router = test_router();
        let (handle, mut rx) = session();

        let ping = Descriptor::originate(7, Payload::Ping);
        let id = ping.descriptor_id;
        assert_eq!(router.handle(&node, &handle, ping), Disposition::Continue);

        let reply = decode(rx.try_recv().unwrap());
        assert_eq!(reply.descriptor_id, id);
        assert_eq!(reply.ttl, 1, "max(1, hops+1) for hops=0");
        match reply.payload {
            Payload::Pong(p) => {
                assert_eq!(p.port, 6346);
                assert_eq!(p.files_shared, 0);
                assert_eq!(p.kilobytes_shared, 0);
            }
            other => panic!("expected pong, got {other:?}"),
        }
    }

    #[test]
    fn dead_ping_is_dropped() {
        let node = test_node(&[]);
        let router = test_router();
        let (handle, mut rx) = session();

        let mut ping = Descriptor::originate(0, Payload::Ping);
        ping.ttl = 0;
        router.handle(&node, &handle, ping);
        assert!(rx.try_recv().is_err(), "ttl=0 ping must not be answered");
    }

    #[test]
    fn matching_query_gets_hits_with_our_servent_id() {
        let node = test_node(&[("bird.mp3", 4096)]);
        let router = test_router();
        let (handle, mut rx) = session();

        let query = Descriptor::originate(
            7,
            Payload::Query(Query {
                min_speed: 0,
                criteria: "bird".into(),
                extensions: Vec::new(),
            }),
        );
        let id = query.descriptor_id;
        router.handle(&node, &handle, query);

        let reply = decode(rx.try_recv().unwrap());
        assert_eq!(reply.descriptor_id, id, "hits reuse the query id");
        match reply.payload {
            Payload::QueryHits(hits) => {
                assert_eq!(hits.hits.len(), 1);
                assert_eq!(hits.hits[0].file_name, "bird.mp3");
                assert_eq!(hits.hits[0].file_index, 1);
                assert_eq!(hits.servent_id, node.servent_id);
            }
            other => panic!("expected hits, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_query_is_answered_once() {
        let node = test_node(&[("bird.mp3", 4096)]);
        let router = test_router();
        let (handle, mut rx) = session();

        let query = Descriptor::originate(
            7,
            Payload::Query(Query {
                min_speed: 0,
                criteria: "bird".into(),
                extensions: Vec::new(),
            }),
        );
        router.handle(&node, &handle, query.clone());
        router.handle(&node, &handle, query);

        assert!(rx.try_recv().is_ok(), "first copy answered");
        assert!(rx.try_recv().is_err(), "duplicate suppressed");
    }

    #[test]
    fn qrp_prunes_non_hash_matches_before_the_library() {
        // "bird" is only a substring of the keyword "bluebird", so the
        // exact-hash table rejects it even though the library would match.
        let node = test_node(&[("bluebird.mp3", 1)]);
        let router = test_router();
        let (handle, mut rx) = session();

        let query = Descriptor::originate(
            7,
            Payload::Query(Query {
                min_speed: 0,
                criteria: "bird".into(),
                extensions: Vec::new(),
            }),
        );
        router.handle(&node, &handle, query);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn pong_feeds_the_directory() {
        let node = test_node(&[]);
        let router = test_router();
        let (handle, _rx) = session();

        let pong = Descriptor::originate(
            7,
            Payload::Pong(Pong {
                port: 6347,
                ip: Ipv4Addr::new(9, 8, 7, 6),
                files_shared: 3,
                kilobytes_shared: 30,
            }),
        );
        router.handle(&node, &handle, pong);

        let entry = node.directory.get(Ipv4Addr::new(9, 8, 7, 6), 6347).unwrap();
        assert_eq!(entry.source, PeerSource::Pong);
    }

    #[test]
    fn bye_requests_close_without_reply() {
        let node = test_node(&[]);
        let router = test_router();
        let (handle, mut rx) = session();

        let bye = Descriptor::originate(
            1,
            Payload::Bye(Bye {
                code: 200,
                message: "bye".into(),
            }),
        );
        assert_eq!(
            router.handle(&node, &handle, bye),
            Disposition::Close { bye: None }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn inbound_route_tables_and_unknown_types_are_discarded() {
        let node = test_node(&[]);
        let router = test_router();
        let (handle, mut rx) = session();

        let rtu = Descriptor::originate(
            1,
            Payload::RouteTableUpdate(RouteTableUpdate::Reset {
                table_length: 8192,
                infinity: 7,
            }),
        );
        assert_eq!(router.handle(&node, &handle, rtu), Disposition::Continue);

        let unknown = Descriptor::originate(
            1,
            Payload::Unknown {
                payload_descriptor: 0x31,
                raw: vec![1, 2, 3],
            },
        );
        assert_eq!(router.handle(&node, &handle, unknown), Disposition::Continue);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn push_for_another_servent_is_dropped() {
        let node = test_node(&[("bird.mp3", 1)]);
        let router = test_router();
        let (handle, mut rx) = session();

        let push = Descriptor::originate(
            7,
            Payload::Push(Push {
                servent_id: Guid::random(), // not ours
                file_index: 1,
                ip: Ipv4Addr::new(1, 2, 3, 4),
                port: 9000,
            }),
        );
        assert_eq!(router.handle(&node, &handle, push), Disposition::Continue);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn giv_line_is_byte_exact() {
        let servent_id = Guid::from_bytes([
            0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF, 0xFF, 0x00, 0x11, 0x22, 0x33, 0x44,
            0x55, 0x00,
        ]);
        assert_eq!(
            giv_line(1, &servent_id, "bird.mp3"),
            "GIV 1:0123456789ABCDEFFF00112233445500/bird.mp3\n\n"
        );
    }
}
