//! Translation statistics.
//!
//! Plain counters bumped from the single-threaded loop; atomic so they stay
//! readable from signal-ish contexts without ceremony.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for monotonically increasing event counts.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Process-wide translation statistics.
#[derive(Debug, Default)]
pub struct Metrics {
    /// L4 batches dispatched from the tap
    pub tap_batches: Counter,
    /// IPv4/IPv6 fragments dropped at the demux
    pub ip_fragments_dropped: Counter,
    /// TCP connections reset toward the tap
    pub tcp_resets: Counter,
    /// Flow allocations refused on a full table
    pub flow_table_full: Counter,
    /// UDP datagrams moved in either direction
    pub udp_datagrams: Counter,
    /// ICMP echo requests relayed
    pub icmp_requests: Counter,
    /// ICMP echo replies relayed
    pub icmp_replies: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// One-line summary for the periodic debug log.
    pub fn summary(&self) -> String {
        format!(
            "batches {} frag_drop {} tcp_rst {} flow_full {} udp {} icmp {}/{}",
            self.tap_batches.get(),
            self.ip_fragments_dropped.get(),
            self.tcp_resets.get(),
            self.flow_table_full.get(),
            self.udp_datagrams.get(),
            self.icmp_requests.get(),
            self.icmp_replies.get(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let c = Counter::default();
        c.inc();
        c.add(4);
        assert_eq!(c.get(), 5);
    }

    #[test]
    fn test_summary_contains_counts() {
        let m = Metrics::new();
        m.tcp_resets.add(3);
        assert!(m.summary().contains("tcp_rst 3"));
    }
}
