//! Best-effort driver statistics.
//!
//! Counters for the asynchronous paths that have no synchronous caller to
//! report to: dropped RX frames, stale TX confirmations, pool exhaustion.
//! Updated relaxed, read as a snapshot, dumped as text. Not part of the
//! functional contract.

use core::sync::atomic::{AtomicU64, Ordering};

/// Atomic counter block owned by the driver.
#[derive(Default)]
pub struct HifStats {
    /// Complete frames delivered to client RX queues.
    pub rx_frames: AtomicU64,
    /// Individual chunks pulled off the RX ring.
    pub rx_chunks: AtomicU64,
    /// Frames accepted for transmission.
    pub tx_frames: AtomicU64,
    /// TX confirmations delivered to clients.
    pub tx_confs: AtomicU64,
    /// RX frames dropped: first chunk too short to carry a wire header.
    pub rx_drop_bad_header: AtomicU64,
    /// RX frames dropped: target client not registered.
    pub rx_drop_no_client: AtomicU64,
    /// RX frames dropped: queue number outside the client's range.
    pub rx_drop_bad_queue: AtomicU64,
    /// RX chunks dropped: the client's RX FIFO was full.
    pub rx_drop_queue_full: AtomicU64,
    /// Dispatch passes that found the RX buffer pool empty.
    pub rx_pool_empty: AtomicU64,
    /// TX confirmations dropped: owning client unregistered, FIFO full, or
    /// reset away by TX recovery.
    pub tx_conf_drops: AtomicU64,
    /// TX completions with no matching metadata slot.
    pub tx_conf_spurious: AtomicU64,
}

impl HifStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Takes a consistent-enough copy of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            rx_frames: self.rx_frames.load(Ordering::Relaxed),
            rx_chunks: self.rx_chunks.load(Ordering::Relaxed),
            tx_frames: self.tx_frames.load(Ordering::Relaxed),
            tx_confs: self.tx_confs.load(Ordering::Relaxed),
            rx_drop_bad_header: self.rx_drop_bad_header.load(Ordering::Relaxed),
            rx_drop_no_client: self.rx_drop_no_client.load(Ordering::Relaxed),
            rx_drop_bad_queue: self.rx_drop_bad_queue.load(Ordering::Relaxed),
            rx_drop_queue_full: self.rx_drop_queue_full.load(Ordering::Relaxed),
            rx_pool_empty: self.rx_pool_empty.load(Ordering::Relaxed),
            tx_conf_drops: self.tx_conf_drops.load(Ordering::Relaxed),
            tx_conf_spurious: self.tx_conf_spurious.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the driver counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Complete frames delivered to client RX queues.
    pub rx_frames: u64,
    /// Individual chunks pulled off the RX ring.
    pub rx_chunks: u64,
    /// Frames accepted for transmission.
    pub tx_frames: u64,
    /// TX confirmations delivered to clients.
    pub tx_confs: u64,
    /// RX frames dropped: runt first chunk, no wire header.
    pub rx_drop_bad_header: u64,
    /// RX frames dropped: target client not registered.
    pub rx_drop_no_client: u64,
    /// RX frames dropped: queue number out of range.
    pub rx_drop_bad_queue: u64,
    /// RX chunks dropped: client FIFO full.
    pub rx_drop_queue_full: u64,
    /// Dispatch passes that found the pool empty.
    pub rx_pool_empty: u64,
    /// TX confirmations dropped.
    pub tx_conf_drops: u64,
    /// TX completions with no matching metadata slot.
    pub tx_conf_spurious: u64,
}

impl core::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "rx_frames: {}", self.rx_frames)?;
        writeln!(f, "rx_chunks: {}", self.rx_chunks)?;
        writeln!(f, "tx_frames: {}", self.tx_frames)?;
        writeln!(f, "tx_confs: {}", self.tx_confs)?;
        writeln!(f, "rx_drop_bad_header: {}", self.rx_drop_bad_header)?;
        writeln!(f, "rx_drop_no_client: {}", self.rx_drop_no_client)?;
        writeln!(f, "rx_drop_bad_queue: {}", self.rx_drop_bad_queue)?;
        writeln!(f, "rx_drop_queue_full: {}", self.rx_drop_queue_full)?;
        writeln!(f, "rx_pool_empty: {}", self.rx_pool_empty)?;
        writeln!(f, "tx_conf_drops: {}", self.tx_conf_drops)?;
        write!(f, "tx_conf_spurious: {}", self.tx_conf_spurious)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_dump() {
        let stats = HifStats::default();
        HifStats::bump(&stats.rx_frames);
        HifStats::add(&stats.rx_chunks, 3);
        HifStats::bump(&stats.tx_conf_drops);

        let snap = stats.snapshot();
        assert_eq!(snap.rx_frames, 1);
        assert_eq!(snap.rx_chunks, 3);
        assert_eq!(snap.tx_conf_drops, 1);

        let dump = std::format!("{snap}");
        assert!(dump.contains("rx_chunks: 3"));
        assert!(dump.contains("tx_conf_drops: 1"));
    }
}
