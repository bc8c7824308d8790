//! Breakdown keys and per-flow aggregation.
//!
//! A breakdown groups flows by a chosen subset of fields and sums byte
//! volumes per group. The key is a fixed-arity tuple with one slot per
//! field; only the slots whose flag is set get filled, everything else
//! stays the empty marker.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use compact_str::{format_compact, CompactString, ToCompactString};

use crate::error::QueryError;
use crate::flow::Flow;

/// The queryable/groupable fields, in rendering order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum Field {
    Timestamp = 0,
    Agent = 1,
    Family = 2,
    SrcAddr = 3,
    DstAddr = 4,
    Protocol = 5,
    IntIn = 6,
    IntOut = 7,
    NextHop = 8,
    SrcAs = 9,
    DstAs = 10,
    NextHopAs = 11,
    SrcPfx = 12,
    DstPfx = 13,
    SrcPort = 14,
    DstPort = 15,
}

pub const FIELD_COUNT: usize = 16;

impl Field {
    pub const ALL: [Field; FIELD_COUNT] = [
        Field::Timestamp,
        Field::Agent,
        Field::Family,
        Field::SrcAddr,
        Field::DstAddr,
        Field::Protocol,
        Field::IntIn,
        Field::IntOut,
        Field::NextHop,
        Field::SrcAs,
        Field::DstAs,
        Field::NextHopAs,
        Field::SrcPfx,
        Field::DstPfx,
        Field::SrcPort,
        Field::DstPort,
    ];

    /// The label used in query documents, breakdown parameters and rendered
    /// keys.
    pub fn label(&self) -> &'static str {
        match self {
            Field::Timestamp => "Timestamp",
            Field::Agent => "Agent",
            Field::Family => "Family",
            Field::SrcAddr => "SrcAddr",
            Field::DstAddr => "DstAddr",
            Field::Protocol => "Protocol",
            Field::IntIn => "IntIn",
            Field::IntOut => "IntOut",
            Field::NextHop => "NextHop",
            Field::SrcAs => "SrcAsn",
            Field::DstAs => "DstAsn",
            Field::NextHopAs => "NextHopAsn",
            Field::SrcPfx => "SrcPfx",
            Field::DstPfx => "DstPfx",
            Field::SrcPort => "SrcPort",
            Field::DstPort => "DstPort",
        }
    }

    pub fn from_label(name: &str) -> Option<Field> {
        Field::ALL.iter().copied().find(|f| f.label() == name)
    }
}

/// Sorted list of labels accepted by [`BreakdownFlags::set`].
pub fn breakdown_labels() -> Vec<&'static str> {
    Field::ALL
        .iter()
        .filter(|f| !matches!(f, Field::Timestamp | Field::Agent))
        .map(|f| f.label())
        .collect()
}

/// Which fields a query breaks its sums down by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BreakdownFlags {
    pub family: bool,
    pub src_addr: bool,
    pub dst_addr: bool,
    pub protocol: bool,
    pub int_in: bool,
    pub int_out: bool,
    pub next_hop: bool,
    pub src_as: bool,
    pub dst_as: bool,
    pub next_hop_as: bool,
    pub src_pfx: bool,
    pub dst_pfx: bool,
    pub src_port: bool,
    pub dst_port: bool,
}

impl BreakdownFlags {
    /// Enable the flags named in `keys`.
    pub fn set(&mut self, keys: &[impl AsRef<str>]) -> Result<(), QueryError> {
        for key in keys {
            let key = key.as_ref();
            match Field::from_label(key) {
                Some(Field::Family) => self.family = true,
                Some(Field::SrcAddr) => self.src_addr = true,
                Some(Field::DstAddr) => self.dst_addr = true,
                Some(Field::Protocol) => self.protocol = true,
                Some(Field::IntIn) => self.int_in = true,
                Some(Field::IntOut) => self.int_out = true,
                Some(Field::NextHop) => self.next_hop = true,
                Some(Field::SrcAs) => self.src_as = true,
                Some(Field::DstAs) => self.dst_as = true,
                Some(Field::NextHopAs) => self.next_hop_as = true,
                Some(Field::SrcPfx) => self.src_pfx = true,
                Some(Field::DstPfx) => self.dst_pfx = true,
                Some(Field::SrcPort) => self.src_port = true,
                Some(Field::DstPort) => self.dst_port = true,
                _ => return Err(QueryError::InvalidBreakdownKey(key.to_string())),
            }
        }
        Ok(())
    }

    pub fn count(&self) -> usize {
        [
            self.family,
            self.src_addr,
            self.dst_addr,
            self.protocol,
            self.int_in,
            self.int_out,
            self.next_hop,
            self.src_as,
            self.dst_as,
            self.next_hop_as,
            self.src_pfx,
            self.dst_pfx,
            self.src_port,
            self.dst_port,
        ]
        .iter()
        .filter(|b| **b)
        .count()
    }
}

/// Group key of a breakdown: one slot per field, empty string marking an
/// unused slot. Equality and hashing cover the whole tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BreakdownKey([CompactString; FIELD_COUNT]);

impl Default for BreakdownKey {
    fn default() -> Self {
        BreakdownKey(std::array::from_fn(|_| CompactString::default()))
    }
}

impl BreakdownKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, field: Field, value: impl Into<CompactString>) {
        self.0[field as usize] = value.into();
    }

    /// Slot value looked up by label, for the HTTP export path.
    pub fn get(&self, label: &str) -> &str {
        match Field::from_label(label) {
            Some(f) => &self.0[f as usize],
            None => "",
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|v| v.is_empty())
    }

    /// Visit `(label, value)` for every filled slot, in field order.
    pub fn each<F: FnMut(&'static str, &str)>(&self, mut f: F) {
        for field in Field::ALL {
            let v = &self.0[field as usize];
            if !v.is_empty() {
                f(field.label(), v);
            }
        }
    }
}

impl fmt::Display for BreakdownKey {
    /// `Label1:Value1,Label2:Value2,...` over filled slots, in field order.
    /// Stable across runs and across the order `set` was called in.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for field in Field::ALL {
            let v = &self.0[field as usize];
            if v.is_empty() {
                continue;
            }
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{}:{}", field.label(), v)?;
            first = false;
        }
        Ok(())
    }
}

/// Byte volume per breakdown key.
pub type BreakdownMap = HashMap<BreakdownKey, u64>;

/// The query-wide sum accumulator shared by all timeslot workers.
#[derive(Default)]
pub struct ConcurrentResSum {
    pub values: Mutex<BreakdownMap>,
}

/// Build the flow's breakdown key and add its byte count to both the
/// timeslot-local buckets and the shared query-wide sums.
pub fn breakdown(
    fl: &Flow,
    bd: &BreakdownFlags,
    sums: &ConcurrentResSum,
    buckets: &mut BreakdownMap,
) {
    let key = breakdown_key(fl, bd);

    *buckets.entry(key.clone()).or_insert(0) += fl.size;

    let mut values = sums.values.lock().unwrap();
    *values.entry(key).or_insert(0) += fl.size;
}

/// Render the slots selected by `bd` from `fl`.
pub fn breakdown_key(fl: &Flow, bd: &BreakdownFlags) -> BreakdownKey {
    let mut key = BreakdownKey::new();

    if bd.family {
        key.set(Field::Family, format_compact!("{}", fl.family));
    }
    if bd.src_addr {
        key.set(Field::SrcAddr, fl.src_addr.to_compact_string());
    }
    if bd.dst_addr {
        key.set(Field::DstAddr, fl.dst_addr.to_compact_string());
    }
    if bd.protocol {
        key.set(Field::Protocol, format_compact!("{}", fl.protocol));
    }
    if bd.int_in {
        key.set(Field::IntIn, format_compact!("{}", fl.int_in));
    }
    if bd.int_out {
        key.set(Field::IntOut, format_compact!("{}", fl.int_out));
    }
    if bd.next_hop {
        key.set(Field::NextHop, fl.next_hop.to_compact_string());
    }
    if bd.src_as {
        key.set(Field::SrcAs, format_compact!("{}", fl.src_as));
    }
    if bd.dst_as {
        key.set(Field::DstAs, format_compact!("{}", fl.dst_as));
    }
    if bd.next_hop_as {
        key.set(Field::NextHopAs, format_compact!("{}", fl.next_hop_as));
    }
    if bd.src_pfx {
        match fl.src_pfx {
            Some(pfx) => key.set(Field::SrcPfx, pfx.to_compact_string()),
            None => key.set(Field::SrcPfx, "0.0.0.0/0"),
        }
    }
    if bd.dst_pfx {
        match fl.dst_pfx {
            Some(pfx) => key.set(Field::DstPfx, pfx.to_compact_string()),
            None => key.set(Field::DstPfx, "0.0.0.0/0"),
        }
    }
    if bd.src_port {
        key.set(Field::SrcPort, format_compact!("{}", fl.src_port));
    }
    if bd.dst_port {
        key.set(Field::DstPort, format_compact!("{}", fl.dst_port));
    }

    key
}
