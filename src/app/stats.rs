//! Supervisor statistics

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::common::RelayStats;

/// Process-wide connection counters
#[derive(Debug, Default)]
pub struct SupervisorStats {
    accepted: AtomicU64,
    active: AtomicU64,
    handshake_failures: AtomicU64,
    no_route: AtomicU64,
    dial_failures: AtomicU64,
    rejected: AtomicU64,
    relayed: AtomicU64,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

/// Point-in-time copy of [`SupervisorStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub active: u64,
    pub handshake_failures: u64,
    pub no_route: u64,
    pub dial_failures: u64,
    pub rejected: u64,
    pub relayed: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

/// Keeps a connection counted as active until dropped
pub struct ActiveConnection {
    stats: Arc<SupervisorStats>,
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
    }
}

impl SupervisorStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connection_accepted(self: &Arc<Self>) -> ActiveConnection {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
        ActiveConnection {
            stats: Arc::clone(self),
        }
    }

    pub fn handshake_failed(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn route_missing(&self) {
        self.no_route.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dial_failed(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn relay_finished(&self, relay: RelayStats) {
        self.relayed.fetch_add(1, Ordering::Relaxed);
        self.bytes_up.fetch_add(relay.uploaded, Ordering::Relaxed);
        self.bytes_down.fetch_add(relay.downloaded, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
            no_route: self.no_route.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
        }
    }

    pub fn log(&self) {
        let s = self.snapshot();
        info!(
            "Connections: accepted={} active={} relayed={} handshake_failed={} no_route={} dial_failed={} rejected={} (↑{} ↓{})",
            s.accepted,
            s.active,
            s.relayed,
            s.handshake_failures,
            s.no_route,
            s.dial_failures,
            s.rejected,
            format_bytes(s.bytes_up),
            format_bytes(s.bytes_down)
        );
    }
}

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}
