use std::sync::atomic::{AtomicU64, Ordering};

/// Per-node counters, shared by the accept loop, handlers and the engine.
#[derive(Debug, Default)]
pub struct NodeStats {
    connections_accepted: AtomicU64,
    handshakes_rejected: AtomicU64,
    decode_failures: AtomicU64,
    messages_discarded: AtomicU64,
    rounds_forwarded: AtomicU64,
    rounds_completed: AtomicU64,
    rounds_aborted: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub handshakes_rejected: u64,
    pub decode_failures: u64,
    pub messages_discarded: u64,
    pub rounds_forwarded: u64,
    pub rounds_completed: u64,
    pub rounds_aborted: u64,
}

impl NodeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn handshake_rejected(&self) {
        self.handshakes_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn decode_failed(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn message_discarded(&self) {
        self.messages_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn round_forwarded(&self) {
        self.rounds_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn round_completed(&self) {
        self.rounds_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn round_aborted(&self) {
        self.rounds_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            handshakes_rejected: self.handshakes_rejected.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            messages_discarded: self.messages_discarded.load(Ordering::Relaxed),
            rounds_forwarded: self.rounds_forwarded.load(Ordering::Relaxed),
            rounds_completed: self.rounds_completed.load(Ordering::Relaxed),
            rounds_aborted: self.rounds_aborted.load(Ordering::Relaxed),
        }
    }
}
