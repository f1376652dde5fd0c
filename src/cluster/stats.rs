//! Cluster counters
//!
//! Plain atomics shared by every link task; readers take a [`StatsSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ClusterStats {
    /// Inbound cluster publications delivered to local subscribers,
    /// counted once per unique recipient
    pub messages_sent: AtomicU64,
    /// Local publications forwarded to peer links
    pub messages_forwarded: AtomicU64,
    pub links_accepted: AtomicU64,
    pub links_dialed: AtomicU64,
    /// Links closed because a newer link registered under the same identity
    pub links_displaced: AtomicU64,
    pub dial_failures: AtomicU64,
    pub handshake_failures: AtomicU64,
}

/// Point-in-time copy of [`ClusterStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub messages_sent: u64,
    pub messages_forwarded: u64,
    pub links_accepted: u64,
    pub links_dialed: u64,
    pub links_displaced: u64,
    pub dial_failures: u64,
    pub handshake_failures: u64,
}

impl ClusterStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_forwarded: self.messages_forwarded.load(Ordering::Relaxed),
            links_accepted: self.links_accepted.load(Ordering::Relaxed),
            links_dialed: self.links_dialed.load(Ordering::Relaxed),
            links_displaced: self.links_displaced.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = ClusterStats::new();
        ClusterStats::incr(&stats.messages_sent);
        ClusterStats::incr(&stats.messages_sent);
        ClusterStats::incr(&stats.links_dialed);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.messages_sent, 2);
        assert_eq!(snapshot.links_dialed, 1);
        assert_eq!(snapshot.links_accepted, 0);
        assert_eq!(stats.messages_sent(), 2);
    }
}
