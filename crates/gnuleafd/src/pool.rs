//! Peer pool — keeps the daemon at its target number of established
//! sessions.
//!
//! A periodic tick (and a short fuse after any disconnect) compares the
//! session table against the target, pulls the best-scored directory
//! candidates, and dials them one at a time — at most one new outbound
//! connect per second. Failures back off exponentially with jitter; an
//! address that keeps failing is benched for an hour and charged a
//! directory failure.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::node::Node;
use crate::router::Router;
use crate::session::{self, SessionTable};

/// Period of the steady-state maintenance tick.
const TICK: Duration = Duration::from_secs(30);

/// How soon after a disconnect the pool re-checks.
const DISCONNECT_FUSE: Duration = Duration::from_secs(2);

/// Minimum spacing between outbound connect attempts.
const CONNECT_SPACING: Duration = Duration::from_secs(1);

/// How long a repeatedly-failing address sits out.
const BENCH: Duration = Duration::from_secs(3600);

/// Extra attempts beyond the strict deficit, to ride out slow handshakes.
const HEADROOM: usize = 1;

pub type DialAddr = (Ipv4Addr, u16);

#[derive(Debug)]
pub enum PoolEvent {
    Established {
        dial: Option<DialAddr>,
        remote: std::net::SocketAddr,
    },
    ConnectFailed {
        addr: DialAddr,
    },
    Closed {
        dial: Option<DialAddr>,
        remote: std::net::SocketAddr,
    },
}

#[derive(Debug, Default)]
struct RetryState {
    attempts: u32,
    next_retry: Option<Instant>,
    benched_until: Option<Instant>,
}

/// base * 2^(attempts-1). Attempt numbering starts at 1.
fn backoff_delay(base: Duration, attempts: u32) -> Duration {
    base * 2u32.saturating_pow(attempts.saturating_sub(1))
}

/// ±30% jitter so a flock of retries does not land together.
fn jittered(delay: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.7..=1.3);
    delay.mul_f64(factor)
}

pub struct PeerPool {
    node: Arc<Node>,
    router: Arc<Router>,
    sessions: SessionTable,
    events_tx: mpsc::UnboundedSender<PoolEvent>,
    events_rx: mpsc::UnboundedReceiver<PoolEvent>,
    shutdown: broadcast::Sender<()>,
    retry: HashMap<DialAddr, RetryState>,
    attempting: HashSet<DialAddr>,
    last_connect: Option<Instant>,
    pending_check: Option<Instant>,
}

impl PeerPool {
    pub fn new(
        node: Arc<Node>,
        router: Arc<Router>,
        sessions: SessionTable,
        events_tx: mpsc::UnboundedSender<PoolEvent>,
        events_rx: mpsc::UnboundedReceiver<PoolEvent>,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            node,
            router,
            sessions,
            events_tx,
            events_rx,
            shutdown,
            retry: HashMap::new(),
            attempting: HashSet::new(),
            last_connect: None,
            pending_check: None,
        }
    }

    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let pending = self.pending_check;
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("peer pool shutting down");
                    return;
                }

                _ = tick.tick() => {
                    self.maintain();
                }

                Some(event) = self.events_rx.recv() => {
                    self.on_event(event);
                }

                _ = sleep_until_opt(pending) => {
                    self.pending_check = None;
                    self.maintain();
                }
            }
        }
    }

    fn on_event(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::Established { dial, remote } => {
                tracing::debug!(%remote, "pool saw session established");
                if let Some(addr) = dial {
                    self.attempting.remove(&addr);
                    self.retry.remove(&addr);
                }
            }
            PoolEvent::ConnectFailed { addr } => {
                self.attempting.remove(&addr);
                self.note_failure(addr);
                self.schedule_check(DISCONNECT_FUSE);
            }
            PoolEvent::Closed { dial, remote } => {
                tracing::debug!(%remote, "pool saw session closed");
                if let Some(addr) = dial {
                    self.attempting.remove(&addr);
                }
                self.schedule_check(DISCONNECT_FUSE);
            }
        }
    }

    fn note_failure(&mut self, addr: DialAddr) {
        let max_attempts = self.node.config.peers.max_attempts;
        let base = Duration::from_secs(self.node.config.peers.retry_base_secs);
        let state = self.retry.entry(addr).or_default();
        state.attempts += 1;

        if state.attempts >= max_attempts {
            // Enough. Charge the directory and bench the address.
            state.benched_until = Some(Instant::now() + BENCH);
            state.next_retry = None;
            state.attempts = 0;
            self.node.directory.record_failure(addr.0, addr.1);
            tracing::info!(ip = %addr.0, port = addr.1, "address benched after repeated failures");
        } else {
            let delay = jittered(backoff_delay(base, state.attempts));
            state.next_retry = Some(Instant::now() + delay);
            tracing::debug!(
                ip = %addr.0,
                port = addr.1,
                attempts = state.attempts,
                retry_in_ms = delay.as_millis() as u64,
                "connect retry scheduled"
            );
        }
    }

    fn schedule_check(&mut self, after: Duration) {
        let when = Instant::now() + after;
        self.pending_check = Some(match self.pending_check {
            Some(existing) if existing < when => existing,
            _ => when,
        });
    }

    fn maintain(&mut self) {
        let target = self.node.config.peers.target_connections;
        let established = self.sessions.len();
        tracing::debug!(
            established,
            target,
            attempting = self.attempting.len(),
            known = self.node.directory.len(),
            "pool tick"
        );
        if established >= target {
            return;
        }

        // Connect rate limit: at most one new outbound per second.
        if let Some(last) = self.last_connect {
            let since = last.elapsed();
            if since < CONNECT_SPACING {
                self.schedule_check(CONNECT_SPACING - since);
                return;
            }
        }

        let needed = target - established + HEADROOM;
        if self.attempting.len() >= needed {
            return;
        }

        let now = Instant::now();
        let candidate = self
            .node
            .directory
            .best_n(target * 8)
            .into_iter()
            .map(|e| (e.ip, e.port))
            .find(|addr| self.eligible(*addr, now));

        let Some(addr) = candidate else {
            tracing::debug!("no eligible connect candidates");
            return;
        };

        self.attempting.insert(addr);
        self.last_connect = Some(now);
        tracing::info!(ip = %addr.0, port = addr.1, "dialing peer");
        tokio::spawn(crate::session::initiator::connect_and_run(
            self.node.clone(),
            self.router.clone(),
            self.sessions.clone(),
            self.events_tx.clone(),
            addr,
            self.shutdown.subscribe(),
        ));

        // More deficit left? Come back after the spacing interval.
        if self.attempting.len() < needed {
            self.schedule_check(CONNECT_SPACING);
        }
    }

    fn eligible(&self, addr: DialAddr, now: Instant) -> bool {
        if self.attempting.contains(&addr) {
            return false;
        }
        if session::is_connected(&self.sessions, addr.0, addr.1) {
            return false;
        }
        match self.retry.get(&addr) {
            None => true,
            Some(state) => {
                if let Some(benched) = state.benched_until {
                    if now < benched {
                        return false;
                    }
                }
                match state.next_retry {
                    Some(at) => now >= at,
                    None => true,
                }
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_secs(5);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(5));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(10));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(20));
    }

    #[test]
    fn jitter_stays_within_30_percent() {
        let base = Duration::from_secs(10);
        for _ in 0..256 {
            let j = jittered(base);
            assert!(j >= Duration::from_millis(6_999), "too small: {j:?}");
            assert!(j <= Duration::from_millis(13_001), "too large: {j:?}");
        }
    }
}
