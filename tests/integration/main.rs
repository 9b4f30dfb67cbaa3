//! GnuLeaf integration test harness.
//!
//! Tests spawn the built gnuleafd binary on loopback ports and speak raw
//! Gnutella 0.6 to it over TCP:
//!
//!   cargo build -p gnuleafd
//!   cargo test --test integration
//!
//! Tests are skipped (with a notice) when the binary has not been built.
//! Each test uses its own port and scratch directory, so they can run in
//! parallel.

// Daemon processes are killed via .kill(); .wait() is unnecessary.
#![allow(clippy::zombie_processes)]

use anyhow::{bail, Context, Result};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::{Duration, Instant};

use gnuleaf_core::descriptor::{
    self, encode, Descriptor, Parsed, Payload, Push, Query, RouteTableUpdate,
};
use gnuleaf_core::guid::Guid;

// ── Binary paths ──────────────────────────────────────────────────────────────

fn gnuleafd_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("target/debug/gnuleafd")
}

fn binary_available() -> bool {
    gnuleafd_path().exists()
}

/// Common guard: skip test if the daemon binary is unavailable.
fn skip_unless_ready() -> bool {
    if !binary_available() {
        eprintln!("SKIP: binary not built — run: cargo build -p gnuleafd");
        return false;
    }
    true
}

// ── Process helpers ───────────────────────────────────────────────────────────

/// Spawn a gnuleafd on the given port with its own scratch directory.
/// `extra_env` is a list of (key, value) pairs appended to the environment.
fn spawn_daemon(port: u16, extra_env: &[(&str, String)]) -> Child {
    let scratch = std::env::temp_dir().join(format!("gnuleaf-it-{port}-{}", std::process::id()));
    std::fs::create_dir_all(&scratch).expect("create scratch dir");

    let mut cmd = Command::new(gnuleafd_path());
    cmd.env("RUST_LOG", "info");
    cmd.env(
        "GNULEAF_CONFIG",
        scratch.join("config.toml").to_str().unwrap(),
    );
    cmd.env("GNULEAF_NETWORK__LISTEN_PORT", port.to_string());
    cmd.env(
        "GNULEAF_PEERS__SETTINGS_PATH",
        scratch.join("peers.json").to_str().unwrap(),
    );
    for (k, v) in extra_env {
        cmd.env(k, v);
    }
    cmd.spawn().expect("failed to spawn gnuleafd")
}

/// Wait until the daemon accepts TCP on its listen port.
fn wait_for_listen(port: u16, max_attempts: u32) -> Result<()> {
    for attempt in 1..=max_attempts {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return Ok(());
        }
        if attempt < max_attempts {
            std::thread::sleep(Duration::from_millis(250));
        }
    }
    bail!("daemon not listening on {port} after {max_attempts} attempts")
}

/// Accept one connection, bounded by a deadline.
fn accept_with_deadline(listener: &TcpListener, deadline: Duration) -> Result<TcpStream> {
    listener.set_nonblocking(true)?;
    let end = Instant::now() + deadline;
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                return Ok(stream);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() > end {
                    bail!("no inbound connection before deadline");
                }
                std::thread::sleep(Duration::from_millis(200));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

// ── Wire helpers ──────────────────────────────────────────────────────────────

/// Read one CRLF-CRLF terminated handshake block as text.
fn read_block(stream: &mut TcpStream) -> Result<String> {
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let mut buf = Vec::new();
    let mut chunk = [0u8; 512];
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let block = String::from_utf8(buf[..pos + 4].to_vec())?;
            buf.drain(..pos + 4);
            // Residue past the terminator belongs to the binary stream.
            // None of the text assertions need it, but it must not be lost
            // by callers that go binary next — so keep the helpers split.
            assert!(buf.is_empty(), "unexpected residue after handshake block");
            return Ok(block);
        }
        if Instant::now() > deadline {
            bail!("no handshake terminator within deadline; got {buf:?}");
        }
        match stream.read(&mut chunk) {
            Ok(0) => bail!("peer closed while reading handshake block"),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {}
            Err(e) => return Err(e.into()),
        }
    }
}

/// Full plaintext handshake: CONNECT (no compression offered), read the OK,
/// send the final OK. Returns the daemon's response block.
fn handshake_plain(stream: &mut TcpStream) -> Result<String> {
    stream.write_all(
        b"GNUTELLA CONNECT/0.6\r\n\
          User-Agent: IntegrationPeer/1.0\r\n\
          X-Ultrapeer: False\r\n\r\n",
    )?;
    let response = read_block(stream)?;
    if !response.starts_with("GNUTELLA/0.6 200 OK\r\n") {
        bail!("expected 200 OK, got: {response}");
    }
    stream.write_all(b"GNUTELLA/0.6 200 OK\r\nUser-Agent: IntegrationPeer/1.0\r\n\r\n")?;
    Ok(response)
}

/// Accumulates the binary stream and yields descriptors.
struct DescriptorStream {
    buf: Vec<u8>,
}

impl DescriptorStream {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Read frames until `pred` matches one, skipping everything else.
    fn wait_for(
        &mut self,
        stream: &mut TcpStream,
        deadline: Duration,
        mut pred: impl FnMut(&Descriptor) -> bool,
    ) -> Result<Descriptor> {
        stream.set_read_timeout(Some(Duration::from_millis(250)))?;
        let end = Instant::now() + deadline;
        let mut chunk = [0u8; 4096];
        loop {
            while let Parsed::Descriptor(d, used) =
                descriptor::parse(&self.buf).context("bad frame from daemon")?
            {
                self.buf.drain(..used);
                if pred(&d) {
                    return Ok(d);
                }
            }
            if Instant::now() > end {
                bail!("descriptor matching predicate not seen before deadline");
            }
            match stream.read(&mut chunk) {
                Ok(0) => bail!("daemon closed the session"),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Collect every descriptor seen within the window.
    fn collect_for(
        &mut self,
        stream: &mut TcpStream,
        window: Duration,
    ) -> Result<Vec<Descriptor>> {
        stream.set_read_timeout(Some(Duration::from_millis(250)))?;
        let end = Instant::now() + window;
        let mut chunk = [0u8; 4096];
        let mut out = Vec::new();
        while Instant::now() < end {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {}
                Err(e) => return Err(e.into()),
            }
            while let Parsed::Descriptor(d, used) = descriptor::parse(&self.buf)? {
                self.buf.drain(..used);
                out.push(d);
            }
        }
        Ok(out)
    }
}

// ══════════════════════════════════════════════════════════════════════════════
//  Handshake
// ══════════════════════════════════════════════════════════════════════════════

/// Inbound happy path: CONNECT → 200 OK with leaf headers → final OK.
#[test]
fn test_inbound_handshake_plaintext() {
    if !skip_unless_ready() {
        return;
    }
    let port = 36410;
    let mut daemon = spawn_daemon(port, &[]);

    let result = (|| -> Result<()> {
        wait_for_listen(port, 40)?;
        let mut stream = TcpStream::connect(("127.0.0.1", port))?;
        let response = handshake_plain(&mut stream)?;

        assert!(response.contains("User-Agent: GnuLeaf/"), "{response}");
        assert!(response.contains("X-Ultrapeer: False"), "{response}");
        assert!(response.contains("Accept-Encoding: deflate"), "{response}");
        assert!(response.contains("X-Query-Routing: 0.2"), "{response}");
        assert!(response.contains("Bye-Packet: 0.1"), "{response}");
        assert!(response.contains("Listen-IP:"), "{response}");
        // We offered no Accept-Encoding, so the daemon must not compress.
        assert!(!response.contains("Content-Encoding"), "{response}");
        Ok(())
    })();

    daemon.kill().ok();
    result.unwrap();
}

/// Compression negotiation: offering Accept-Encoding: deflate gets
/// Content-Encoding: deflate back, and the post-handshake stream inflates
/// to descriptors.
#[test]
fn test_inbound_handshake_deflate() {
    if !skip_unless_ready() {
        return;
    }
    let port = 36411;
    let mut daemon = spawn_daemon(port, &[]);

    let result = (|| -> Result<()> {
        wait_for_listen(port, 40)?;
        let mut stream = TcpStream::connect(("127.0.0.1", port))?;
        stream.write_all(
            b"GNUTELLA CONNECT/0.6\r\n\
              User-Agent: IntegrationPeer/1.0\r\n\
              Accept-Encoding: deflate\r\n\r\n",
        )?;
        let response = read_block(&mut stream)?;
        assert!(response.starts_with("GNUTELLA/0.6 200 OK\r\n"), "{response}");
        assert!(response.contains("Content-Encoding: deflate"), "{response}");
        stream.write_all(b"GNUTELLA/0.6 200 OK\r\n\r\n")?;

        // Everything after our final OK is a deflate stream carrying
        // descriptors; the first must be the QRP RESET.
        stream.set_read_timeout(Some(Duration::from_millis(250)))?;
        let mut inflater = flate2::Decompress::new(true);
        let mut plain: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 4096];
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Parsed::Descriptor(d, _) = descriptor::parse(&plain)? {
                match d.payload {
                    Payload::RouteTableUpdate(RouteTableUpdate::Reset {
                        table_length,
                        infinity,
                    }) => {
                        assert_eq!(table_length, 65536);
                        assert_eq!(infinity, 7);
                        return Ok(());
                    }
                    other => bail!("expected RESET first, got {other:?}"),
                }
            }
            if Instant::now() > deadline {
                bail!("no descriptor decoded from compressed stream");
            }
            let n = match stream.read(&mut chunk) {
                Ok(0) => bail!("daemon closed the session"),
                Ok(n) => n,
                Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => continue,
                Err(e) => return Err(e.into()),
            };
            let mut out = Vec::with_capacity(chunk.len() * 4);
            let mut pos = 0;
            loop {
                out.reserve(8192);
                let before = inflater.total_in();
                inflater.decompress_vec(
                    &chunk[pos..n],
                    &mut out,
                    flate2::FlushDecompress::None,
                )?;
                pos += (inflater.total_in() - before) as usize;
                if pos >= n && out.len() < out.capacity() {
                    break;
                }
            }
            plain.extend_from_slice(&out);
        }
    })();

    daemon.kill().ok();
    result.unwrap();
}

/// After ESTABLISHED the daemon must send RESET, all PATCH chunks in
/// order, then an initial TTL=7 PING.
#[test]
fn test_qrp_tables_published_after_handshake() {
    if !skip_unless_ready() {
        return;
    }
    let port = 36412;
    let env = [(
        "GNULEAF_SHARING__FILES",
        "bird.mp3:4096,frog song.ogg:100".to_string(),
    )];
    let mut daemon = spawn_daemon(port, &env);

    let result = (|| -> Result<()> {
        wait_for_listen(port, 40)?;
        let mut stream = TcpStream::connect(("127.0.0.1", port))?;
        handshake_plain(&mut stream)?;

        let mut frames = DescriptorStream::new();
        let collected = frames.collect_for(&mut stream, Duration::from_secs(2))?;
        assert!(!collected.is_empty(), "no descriptors after handshake");

        // First frame is the RESET.
        match &collected[0].payload {
            Payload::RouteTableUpdate(RouteTableUpdate::Reset {
                table_length,
                infinity,
            }) => {
                assert_eq!(*table_length, 65536);
                assert_eq!(*infinity, 7);
            }
            other => panic!("expected RESET first, got {other:?}"),
        }

        // Patches follow in order, 4-bit entries, deflate compressor.
        let mut expected_seq = 1u8;
        let mut seq_count_seen = 0u8;
        for d in &collected[1..] {
            match &d.payload {
                Payload::RouteTableUpdate(RouteTableUpdate::Patch {
                    seq_no,
                    seq_count,
                    compressor,
                    entry_bits,
                    ..
                }) => {
                    assert_eq!(*seq_no, expected_seq, "patch out of order");
                    assert_eq!(*compressor, 1);
                    assert_eq!(*entry_bits, 4);
                    seq_count_seen = *seq_count;
                    expected_seq += 1;
                }
                Payload::Ping => break,
                other => panic!("unexpected frame between patches: {other:?}"),
            }
        }
        assert!(seq_count_seen >= 1);
        assert_eq!(expected_seq, seq_count_seen + 1, "missing patch chunks");

        // And the initial discovery ping.
        assert!(
            collected
                .iter()
                .any(|d| matches!(d.payload, Payload::Ping) && d.ttl == 7 && d.hops == 0),
            "no initial TTL=7 ping"
        );
        Ok(())
    })();

    daemon.kill().ok();
    result.unwrap();
}

// ══════════════════════════════════════════════════════════════════════════════
//  PING / QUERY / dedup
// ══════════════════════════════════════════════════════════════════════════════

/// PING with TTL 7, hops 0 gets a PONG reusing the id with TTL 1 and the
/// daemon's listen port.
#[test]
fn test_ping_pong() {
    if !skip_unless_ready() {
        return;
    }
    let port = 36413;
    let env = [("GNULEAF_SHARING__FILES", "bird.mp3:4096".to_string())];
    let mut daemon = spawn_daemon(port, &env);

    let result = (|| -> Result<()> {
        wait_for_listen(port, 40)?;
        let mut stream = TcpStream::connect(("127.0.0.1", port))?;
        handshake_plain(&mut stream)?;

        let ping = Descriptor::originate(7, Payload::Ping);
        let ping_id = ping.descriptor_id;
        stream.write_all(&encode(&ping))?;

        let mut frames = DescriptorStream::new();
        let pong = frames.wait_for(&mut stream, Duration::from_secs(5), |d| {
            matches!(d.payload, Payload::Pong(_)) && d.descriptor_id == ping_id
        })?;

        assert_eq!(pong.ttl, 1, "pong ttl should be max(1, hops+1) = 1");
        match pong.payload {
            Payload::Pong(p) => {
                assert_eq!(p.port, port);
                assert_eq!(p.files_shared, 1);
                assert_eq!(p.kilobytes_shared, 4);
            }
            other => panic!("expected pong, got {other:?}"),
        }
        Ok(())
    })();

    daemon.kill().ok();
    result.unwrap();
}

/// A matching QUERY produces QUERY_HITS reusing the query id, carrying the
/// shared file and the trailing servent id.
#[test]
fn test_query_returns_hits() {
    if !skip_unless_ready() {
        return;
    }
    let port = 36414;
    let env = [("GNULEAF_SHARING__FILES", "bird.mp3:4096".to_string())];
    let mut daemon = spawn_daemon(port, &env);

    let result = (|| -> Result<()> {
        wait_for_listen(port, 40)?;
        let mut stream = TcpStream::connect(("127.0.0.1", port))?;
        handshake_plain(&mut stream)?;

        let query = Descriptor::originate(
            7,
            Payload::Query(Query {
                min_speed: 0,
                criteria: "bird".into(),
                extensions: Vec::new(),
            }),
        );
        let query_id = query.descriptor_id;
        stream.write_all(&encode(&query))?;

        let mut frames = DescriptorStream::new();
        let reply = frames.wait_for(&mut stream, Duration::from_secs(5), |d| {
            matches!(d.payload, Payload::QueryHits(_))
        })?;

        assert_eq!(reply.descriptor_id, query_id, "hits must reuse the query id");
        match reply.payload {
            Payload::QueryHits(hits) => {
                assert_eq!(hits.hits.len(), 1);
                assert_eq!(hits.hits[0].file_name, "bird.mp3");
                assert_eq!(hits.hits[0].file_index, 1);
                assert_eq!(hits.hits[0].file_size, 4096);
                assert_eq!(hits.port, port);
                assert_ne!(hits.servent_id, Guid::from_bytes([0u8; 16]));
                // HUGE urn travels in the per-result metadata
                let metadata = String::from_utf8_lossy(&hits.hits[0].metadata).into_owned();
                assert!(metadata.starts_with("urn:sha1:"), "{metadata}");
            }
            other => panic!("expected hits, got {other:?}"),
        }
        Ok(())
    })();

    daemon.kill().ok();
    result.unwrap();
}

/// The same QUERY id twice inside the dedup window is answered once.
#[test]
fn test_duplicate_query_answered_once() {
    if !skip_unless_ready() {
        return;
    }
    let port = 36415;
    let env = [("GNULEAF_SHARING__FILES", "bird.mp3:4096".to_string())];
    let mut daemon = spawn_daemon(port, &env);

    let result = (|| -> Result<()> {
        wait_for_listen(port, 40)?;
        let mut stream = TcpStream::connect(("127.0.0.1", port))?;
        handshake_plain(&mut stream)?;

        let query = Descriptor::originate(
            7,
            Payload::Query(Query {
                min_speed: 0,
                criteria: "bird".into(),
                extensions: Vec::new(),
            }),
        );
        let query_id = query.descriptor_id;
        stream.write_all(&encode(&query))?;
        stream.write_all(&encode(&query))?;

        let mut frames = DescriptorStream::new();
        let collected = frames.collect_for(&mut stream, Duration::from_secs(3))?;
        let hits: Vec<_> = collected
            .iter()
            .filter(|d| d.descriptor_id == query_id && matches!(d.payload, Payload::QueryHits(_)))
            .collect();
        assert_eq!(hits.len(), 1, "expected exactly one hits message");
        Ok(())
    })();

    daemon.kill().ok();
    result.unwrap();
}

/// A query matching nothing is silently ignored.
#[test]
fn test_non_matching_query_is_silent() {
    if !skip_unless_ready() {
        return;
    }
    let port = 36416;
    let env = [("GNULEAF_SHARING__FILES", "bird.mp3:4096".to_string())];
    let mut daemon = spawn_daemon(port, &env);

    let result = (|| -> Result<()> {
        wait_for_listen(port, 40)?;
        let mut stream = TcpStream::connect(("127.0.0.1", port))?;
        handshake_plain(&mut stream)?;

        let query = Descriptor::originate(
            7,
            Payload::Query(Query {
                min_speed: 0,
                criteria: "notpresent".into(),
                extensions: Vec::new(),
            }),
        );
        stream.write_all(&encode(&query))?;

        let mut frames = DescriptorStream::new();
        let collected = frames.collect_for(&mut stream, Duration::from_secs(2))?;
        assert!(
            !collected
                .iter()
                .any(|d| matches!(d.payload, Payload::QueryHits(_))),
            "unexpected hits for a non-matching query"
        );
        Ok(())
    })();

    daemon.kill().ok();
    result.unwrap();
}

// ══════════════════════════════════════════════════════════════════════════════
//  BYE / PUSH / outbound
// ══════════════════════════════════════════════════════════════════════════════

/// BYE closes the session promptly.
#[test]
fn test_bye_closes_session() {
    if !skip_unless_ready() {
        return;
    }
    let port = 36417;
    let mut daemon = spawn_daemon(port, &[]);

    let result = (|| -> Result<()> {
        wait_for_listen(port, 40)?;
        let mut stream = TcpStream::connect(("127.0.0.1", port))?;
        handshake_plain(&mut stream)?;

        let bye = Descriptor::originate(
            1,
            Payload::Bye(gnuleaf_core::descriptor::Bye {
                code: 200,
                message: "Closing".into(),
            }),
        );
        stream.write_all(&encode(&bye))?;

        // The daemon should close; read until EOF with a bounded wait.
        stream.set_read_timeout(Some(Duration::from_millis(250)))?;
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut chunk = [0u8; 1024];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => return Ok(()),
                Ok(_) => {}
                Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {}
                Err(_) => return Ok(()), // reset also counts as closed
            }
            if Instant::now() > deadline {
                bail!("session still open after BYE");
            }
        }
    })();

    daemon.kill().ok();
    result.unwrap();
}

/// PUSH for our servent id dials back and writes the exact GIV line.
#[test]
fn test_push_dials_back_with_giv() {
    if !skip_unless_ready() {
        return;
    }
    let port = 36418;
    let giv_port = 36419;
    let env = [("GNULEAF_SHARING__FILES", "bird.mp3:4096".to_string())];
    let mut daemon = spawn_daemon(port, &env);

    let result = (|| -> Result<()> {
        wait_for_listen(port, 40)?;
        let mut stream = TcpStream::connect(("127.0.0.1", port))?;
        handshake_plain(&mut stream)?;

        // Learn the daemon's servent id from a query hit.
        let query = Descriptor::originate(
            7,
            Payload::Query(Query {
                min_speed: 0,
                criteria: "bird".into(),
                extensions: Vec::new(),
            }),
        );
        stream.write_all(&encode(&query))?;
        let mut frames = DescriptorStream::new();
        let reply = frames.wait_for(&mut stream, Duration::from_secs(5), |d| {
            matches!(d.payload, Payload::QueryHits(_))
        })?;
        let servent_id = match reply.payload {
            Payload::QueryHits(h) => h.servent_id,
            _ => unreachable!(),
        };

        // Stand where a firewalled downloader would and ask for the push.
        let giv_listener = TcpListener::bind(("127.0.0.1", giv_port))?;

        let push = Descriptor::originate(
            7,
            Payload::Push(Push {
                servent_id,
                file_index: 1,
                ip: "127.0.0.1".parse().unwrap(),
                port: giv_port,
            }),
        );
        stream.write_all(&encode(&push))?;

        let mut giv_stream = accept_with_deadline(&giv_listener, Duration::from_secs(10))?;
        giv_stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        while !line.ends_with(b"\n\n") {
            match giv_stream.read(&mut byte)? {
                0 => bail!("giv socket closed early: {line:?}"),
                _ => line.push(byte[0]),
            }
        }
        let line = String::from_utf8(line)?;
        assert!(line.starts_with("GIV 1:"), "{line}");
        assert!(line.ends_with("/bird.mp3\n\n"), "{line}");
        let hex_part = &line["GIV 1:".len()..line.len() - "/bird.mp3\n\n".len()];
        assert_eq!(hex_part.len(), 32, "{line}");
        assert!(hex_part.chars().all(|c| c.is_ascii_hexdigit()), "{line}");
        assert_eq!(hex_part, hex_part.to_uppercase(), "{line}");
        assert_eq!(hex_part, servent_id.to_hex_upper());
        Ok(())
    })();

    daemon.kill().ok();
    result.unwrap();
}

/// Outbound rejection: the daemon dials a bootstrap address, receives 503
/// with X-Try, and then dials the referred address instead.
#[test]
fn test_rejection_x_try_redirects_dialing() {
    if !skip_unless_ready() {
        return;
    }
    let port = 36420;
    let reject_port = 36421;
    let referred_port = 36422;

    let reject_listener = TcpListener::bind(("127.0.0.1", reject_port)).unwrap();
    let referred_listener = TcpListener::bind(("127.0.0.1", referred_port)).unwrap();

    let env = [(
        "GNULEAF_PEERS__BOOTSTRAP",
        format!("127.0.0.1:{reject_port}"),
    )];
    let mut daemon = spawn_daemon(port, &env);

    let result = (|| -> Result<()> {
        // First the daemon dials the bootstrap peer.
        let mut stream = accept_with_deadline(&reject_listener, Duration::from_secs(30))?;
        let connect = read_block(&mut stream)?;
        assert!(connect.starts_with("GNUTELLA CONNECT/0.6\r\n"), "{connect}");
        assert!(connect.contains("X-Ultrapeer: False"), "{connect}");
        assert!(connect.contains("Accept-Encoding: deflate"), "{connect}");

        let rejection = format!(
            "GNUTELLA/0.6 503 Service Unavailable\r\n\
             X-Try: 127.0.0.1:{referred_port} leaves=3\r\n\r\n"
        );
        stream.write_all(rejection.as_bytes())?;
        drop(stream);

        // The referred address goes into the directory with a better
        // score than the failed bootstrap, so the daemon dials it next.
        let mut redirected = accept_with_deadline(&referred_listener, Duration::from_secs(30))?;
        let connect = read_block(&mut redirected)?;
        assert!(connect.starts_with("GNUTELLA CONNECT/0.6\r\n"), "{connect}");
        Ok(())
    })();

    daemon.kill().ok();
    result.unwrap();
}
