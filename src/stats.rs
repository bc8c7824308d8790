//! Global runtime counters, exported on `/varz`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters are updated with relaxed ordering; they feed monitoring, not
/// control flow.
#[derive(Debug, Default)]
pub struct Stats {
    pub flows: AtomicU64,
    pub flows_dropped: AtomicU64,
    pub netflow_v9_packets: AtomicU64,
    pub ipfix_packets: AtomicU64,
    pub sflow_packets: AtomicU64,
    pub decode_errors: AtomicU64,
    pub queries: AtomicU64,
    pub archive_writes: AtomicU64,
    pub archive_errors: AtomicU64,
    pub evictions: AtomicU64,
}

/// Point-in-time copy of the counters, serialized on the HTTP surface.
#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub flows: u64,
    pub flows_dropped: u64,
    pub netflow_v9_packets: u64,
    pub ipfix_packets: u64,
    pub sflow_packets: u64,
    pub decode_errors: u64,
    pub queries: u64,
    pub archive_writes: u64,
    pub archive_errors: u64,
    pub evictions: u64,
}

impl Stats {
    pub fn new() -> Self {
        Stats::default()
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            flows: self.flows.load(Ordering::Relaxed),
            flows_dropped: self.flows_dropped.load(Ordering::Relaxed),
            netflow_v9_packets: self.netflow_v9_packets.load(Ordering::Relaxed),
            ipfix_packets: self.ipfix_packets.load(Ordering::Relaxed),
            sflow_packets: self.sflow_packets.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
            archive_writes: self.archive_writes.load(Ordering::Relaxed),
            archive_errors: self.archive_errors.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
