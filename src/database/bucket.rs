//! Time buckets and their secondary indices.
//!
//! A bucket holds every flow one agent exported during one aggregation
//! interval: the `any` set plus one index per field, each index mapping a
//! field value to the ordered set of flows carrying it. The index sets
//! share the `Arc`s of the `any` set, ordered by a per-bucket sequence id
//! assigned at insert, which doubles as the flow's identity during
//! intersection.

use std::collections::HashMap;
use std::hash::Hash;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use smallvec::SmallVec;

use crate::avltree::Tree;
use crate::database::breakdown::{breakdown, BreakdownMap, ConcurrentResSum};
use crate::database::query::{Operand, Query};
use crate::database::Field;
use crate::flow::{Flow, Prefix};

/// Ordered set of flows, keyed by their insert sequence id.
pub type FlowTree = Tree<u64, Arc<Flow>>;

/// Secondary index: field value to the set of flows carrying it.
pub struct FieldIndex<K: Eq + Hash>(HashMap<K, FlowTree>);

impl<K: Eq + Hash> Default for FieldIndex<K> {
    fn default() -> Self {
        FieldIndex(HashMap::new())
    }
}

impl<K: Eq + Hash> FieldIndex<K> {
    fn insert(&mut self, key: K, seq: u64, flow: &Arc<Flow>) {
        self.0
            .entry(key)
            .or_default()
            .insert(seq, Arc::clone(flow));
    }

    /// All flows with this field value, or `None` if the value never
    /// occurred in the bucket.
    pub fn get(&self, key: &K) -> Option<&FlowTree> {
        self.0.get(key)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.0.len()
    }
}

#[derive(Default)]
pub(crate) struct BucketInner {
    next_seq: u64,
    pub(crate) any: FlowTree,
    src_addr: FieldIndex<IpAddr>,
    dst_addr: FieldIndex<IpAddr>,
    protocol: FieldIndex<u8>,
    int_in: FieldIndex<u32>,
    int_out: FieldIndex<u32>,
    next_hop: FieldIndex<IpAddr>,
    src_as: FieldIndex<u32>,
    dst_as: FieldIndex<u32>,
    next_hop_as: FieldIndex<u32>,
    src_pfx: FieldIndex<Prefix>,
    dst_pfx: FieldIndex<Prefix>,
    src_port: FieldIndex<u16>,
    dst_port: FieldIndex<u16>,
}

/// All flows of one (timeslot, agent) pair.
#[derive(Default)]
pub struct TimeBucket {
    pub(crate) inner: RwLock<BucketInner>,
    archived: AtomicBool,
}

impl TimeBucket {
    pub fn new() -> Self {
        TimeBucket::default()
    }

    /// Record the bucket as spilled to disk. Returns whether it was already.
    pub fn mark_archived(&self) -> bool {
        self.archived.swap(true, Ordering::SeqCst)
    }

    pub fn is_archived(&self) -> bool {
        self.archived.load(Ordering::SeqCst)
    }

    /// Add a flow to the `any` set and every index its fields apply to.
    /// Called only by the aggregation writer.
    pub fn insert(&self, flow: Flow) {
        let mut inner = self.inner.write().unwrap();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let flow = Arc::new(flow);
        inner.any.insert(seq, Arc::clone(&flow));
        inner.src_addr.insert(flow.src_addr, seq, &flow);
        inner.dst_addr.insert(flow.dst_addr, seq, &flow);
        inner.protocol.insert(flow.protocol, seq, &flow);
        inner.int_in.insert(flow.int_in, seq, &flow);
        inner.int_out.insert(flow.int_out, seq, &flow);
        inner.next_hop.insert(flow.next_hop, seq, &flow);
        inner.src_as.insert(flow.src_as, seq, &flow);
        inner.dst_as.insert(flow.dst_as, seq, &flow);
        inner.next_hop_as.insert(flow.next_hop_as, seq, &flow);
        if let Some(pfx) = flow.src_pfx {
            inner.src_pfx.insert(pfx, seq, &flow);
        }
        if let Some(pfx) = flow.dst_pfx {
            inner.dst_pfx.insert(pfx, seq, &flow);
        }
        inner.src_port.insert(flow.src_port, seq, &flow);
        inner.dst_port.insert(flow.dst_port, seq, &flow);
    }

    /// Number of flows resident in the bucket.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().any.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the flows for the archive writer.
    pub fn flows(&self) -> Vec<Arc<Flow>> {
        self.inner.read().unwrap().any.dump()
    }

    /// Evaluate the query against this bucket and break the surviving flows
    /// down, feeding `res_sum` alongside the returned per-timeslot map.
    pub fn filter_and_breakdown(&self, q: &Query, res_sum: &ConcurrentResSum) -> BreakdownMap {
        let inner = self.inner.read().unwrap();

        // One candidate tree per equality criterion the indices can answer.
        // Timestamp and agent were consumed picking this bucket.
        let mut candidates: SmallVec<[&FlowTree; 4]> = SmallVec::new();
        for c in &q.cond {
            let tree = match (c.field, &c.operand) {
                (Field::Timestamp, _) | (Field::Agent, _) => continue,
                (Field::Protocol, Operand::Proto(p)) => inner.protocol.get(p),
                (Field::SrcAddr, Operand::Addr(a)) => inner.src_addr.get(a),
                (Field::DstAddr, Operand::Addr(a)) => inner.dst_addr.get(a),
                (Field::IntIn, Operand::Iface(i)) => inner.int_in.get(i),
                (Field::IntOut, Operand::Iface(i)) => inner.int_out.get(i),
                (Field::NextHop, Operand::Addr(a)) => inner.next_hop.get(a),
                (Field::SrcAs, Operand::Asn(asn)) => inner.src_as.get(asn),
                (Field::DstAs, Operand::Asn(asn)) => inner.dst_as.get(asn),
                (Field::NextHopAs, Operand::Asn(asn)) => inner.next_hop_as.get(asn),
                (Field::SrcPort, Operand::Port(p)) => inner.src_port.get(p),
                (Field::DstPort, Operand::Port(p)) => inner.dst_port.get(p),
                (Field::SrcPfx, Operand::Pfx(p)) => inner.src_pfx.get(p),
                (Field::DstPfx, Operand::Pfx(p)) => inner.dst_pfx.get(p),
                _ => continue,
            };
            match tree {
                Some(tree) => candidates.push(tree),
                // The value never occurred here, so the intersection is
                // already known to be empty.
                None => return BreakdownMap::new(),
            }
        }

        let mut res_time = BreakdownMap::new();
        let mut visit = |_: &u64, fl: &Arc<Flow>| {
            breakdown(fl, &q.breakdown, res_sum, &mut res_time);
        };

        match candidates.len() {
            // No index criteria: every flow in the bucket qualifies.
            0 => inner.any.each(&mut visit),
            1 => candidates[0].each(&mut visit),
            _ => Tree::intersection(&candidates).each(&mut visit),
        }
        res_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::query::{translate_query, ConditionExt, QueryExt};

    fn flow(src: &str, dst: &str, proto: u8, int_in: u32, size: u64) -> Flow {
        let mut fl = Flow::empty();
        fl.src_addr = src.parse().unwrap();
        fl.dst_addr = dst.parse().unwrap();
        fl.protocol = proto;
        fl.int_in = int_in;
        fl.size = size;
        fl.timestamp = 3600;
        fl
    }

    fn cond(field: &str, operand: &str) -> ConditionExt {
        ConditionExt {
            field: field.to_string(),
            operator: 0,
            operand: operand.to_string(),
        }
    }

    fn query(conds: Vec<ConditionExt>, breakdown: &[&str]) -> Query {
        translate_query(&QueryExt {
            cond: conds,
            breakdown: breakdown.iter().map(|s| s.to_string()).collect(),
            top_n: 0,
        })
        .unwrap()
    }

    #[test]
    fn test_insert_populates_every_index() {
        let bucket = TimeBucket::new();
        bucket.insert(flow("10.0.0.1", "30.0.0.1", 6, 1, 1000));
        bucket.insert(flow("10.0.0.2", "30.0.0.1", 6, 2, 1000));

        let inner = bucket.inner.read().unwrap();
        assert_eq!(inner.any.len(), 2);
        assert_eq!(inner.src_addr.len(), 2);
        assert_eq!(inner.dst_addr.len(), 1);
        assert_eq!(inner.protocol.len(), 1);
        // Flows without prefixes must not occupy the prefix indices.
        assert_eq!(inner.src_pfx.len(), 0);

        let by_dst = inner
            .dst_addr
            .get(&"30.0.0.1".parse().unwrap())
            .expect("dst index entry");
        assert_eq!(by_dst.len(), 2);
    }

    #[test]
    fn test_filter_intersects_indices() {
        let bucket = TimeBucket::new();
        bucket.insert(flow("10.0.0.1", "30.0.0.1", 6, 1, 1000));
        bucket.insert(flow("10.0.0.2", "30.0.0.2", 6, 2, 2000));

        let q = query(
            vec![cond("Protocol", "6"), cond("IntIn", "1")],
            &["SrcAddr"],
        );
        let sums = ConcurrentResSum::default();
        let res = bucket.filter_and_breakdown(&q, &sums);

        assert_eq!(res.len(), 1);
        let (key, size) = res.iter().next().unwrap();
        assert_eq!(key.to_string(), "SrcAddr:10.0.0.1");
        assert_eq!(*size, 1000);
    }

    #[test]
    fn test_filter_miss_is_empty_not_any() {
        let bucket = TimeBucket::new();
        bucket.insert(flow("10.0.0.1", "30.0.0.1", 6, 1, 1000));

        let q = query(vec![cond("Protocol", "17")], &["SrcAddr"]);
        let sums = ConcurrentResSum::default();
        assert!(bucket.filter_and_breakdown(&q, &sums).is_empty());
        assert!(sums.values.lock().unwrap().is_empty());
    }

    #[test]
    fn test_filter_without_criteria_falls_back_to_any() {
        let bucket = TimeBucket::new();
        bucket.insert(flow("10.0.0.1", "30.0.0.1", 6, 1, 1000));
        bucket.insert(flow("10.0.0.2", "30.0.0.2", 17, 2, 2000));

        let q = query(vec![], &["Protocol"]);
        let sums = ConcurrentResSum::default();
        let res = bucket.filter_and_breakdown(&q, &sums);
        assert_eq!(res.len(), 2);
        assert_eq!(res.values().sum::<u64>(), 3000);
    }

    #[test]
    fn test_duplicate_insert_is_two_flows() {
        // Two identical samples are two observations, not one.
        let bucket = TimeBucket::new();
        bucket.insert(flow("10.0.0.1", "30.0.0.1", 6, 1, 1000));
        bucket.insert(flow("10.0.0.1", "30.0.0.1", 6, 1, 1000));
        assert_eq!(bucket.len(), 2);

        let q = query(vec![], &["SrcAddr"]);
        let sums = ConcurrentResSum::default();
        let res = bucket.filter_and_breakdown(&q, &sums);
        assert_eq!(res.values().sum::<u64>(), 2000);
    }
}
