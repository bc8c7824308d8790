//! Query model and translation.
//!
//! Queries arrive as a JSON document of string conditions and leave
//! translation as typed conditions ready for direct comparison against
//! flow fields. Translation is also where unsupported shapes are rejected:
//! unknown fields, unknown breakdown labels, and non-equality operators on
//! anything but the timestamp.

use std::net::IpAddr;

use serde::Deserialize;

use crate::database::breakdown::{BreakdownFlags, Field};
use crate::error::QueryError;
use crate::flow::{Flow, Prefix};

/// Comparison operators, numbered as the frontend sends them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equal = 0,
    Unequal = 1,
    Smaller = 2,
    Greater = 3,
}

impl Operator {
    pub fn from_wire(op: i64) -> Option<Operator> {
        match op {
            0 => Some(Operator::Equal),
            1 => Some(Operator::Unequal),
            2 => Some(Operator::Smaller),
            3 => Some(Operator::Greater),
            _ => None,
        }
    }
}

/// A condition operand, typed according to its field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Time(i64),
    Port(u16),
    Proto(u8),
    Iface(u32),
    Asn(u32),
    Addr(IpAddr),
    Pfx(Prefix),
    /// Agent referenced by its configured name instead of its address.
    Name(String),
}

/// A single translated query condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub field: Field,
    pub operator: Operator,
    pub operand: Operand,
}

/// The internal representation of a query.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub cond: Vec<Condition>,
    pub breakdown: BreakdownFlags,
    pub top_n: usize,
}

/// External condition as received from the frontend.
#[derive(Debug, Clone, Deserialize)]
pub struct ConditionExt {
    #[serde(rename = "Field")]
    pub field: String,
    #[serde(rename = "Operator")]
    pub operator: i64,
    #[serde(rename = "Operand")]
    pub operand: String,
}

/// External query as received from the frontend.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct QueryExt {
    #[serde(rename = "Cond", default)]
    pub cond: Vec<ConditionExt>,
    #[serde(rename = "Breakdown", default)]
    pub breakdown: Vec<String>,
    #[serde(rename = "TopN", default)]
    pub top_n: usize,
}

impl Condition {
    fn translate(ext: &ConditionExt) -> Result<Condition, QueryError> {
        // "Router" is the historic name for the agent criterion.
        let field = match ext.field.as_str() {
            "Router" => Field::Agent,
            name => Field::from_label(name)
                .ok_or_else(|| QueryError::UnknownField(ext.field.clone()))?,
        };

        let operator = Operator::from_wire(ext.operator).ok_or_else(|| {
            QueryError::InvalidOperand {
                field: ext.field.clone(),
                operand: ext.operator.to_string(),
            }
        })?;

        let invalid = || QueryError::InvalidOperand {
            field: ext.field.clone(),
            operand: ext.operand.clone(),
        };

        let operand = match field {
            Field::Timestamp => Operand::Time(ext.operand.parse().map_err(|_| invalid())?),
            Field::Protocol => Operand::Proto(ext.operand.parse().map_err(|_| invalid())?),
            Field::SrcPort | Field::DstPort => {
                Operand::Port(ext.operand.parse().map_err(|_| invalid())?)
            }
            Field::IntIn | Field::IntOut => {
                // Interface indices travel as 16 bit values on the query
                // surface, as they did historically.
                let idx: u16 = ext.operand.parse().map_err(|_| invalid())?;
                Operand::Iface(u32::from(idx))
            }
            Field::SrcAddr | Field::DstAddr | Field::NextHop => {
                Operand::Addr(ext.operand.parse().map_err(|_| invalid())?)
            }
            Field::Agent => match ext.operand.parse::<IpAddr>() {
                Ok(addr) => Operand::Addr(addr),
                Err(_) => Operand::Name(ext.operand.clone()),
            },
            Field::SrcAs | Field::DstAs | Field::NextHopAs => {
                Operand::Asn(ext.operand.parse().map_err(|_| invalid())?)
            }
            Field::SrcPfx | Field::DstPfx => {
                Operand::Pfx(ext.operand.parse().map_err(|_| invalid())?)
            }
            Field::Family => return Err(QueryError::UnknownField(ext.field.clone())),
        };

        // The indices answer equality only. Ranges are meaningful for the
        // timestamp alone; reject everything else up front instead of
        // silently ignoring the operator at evaluation time.
        if operator != Operator::Equal && field != Field::Timestamp {
            return Err(QueryError::UnsupportedOperator {
                field: ext.field.clone(),
            });
        }

        Ok(Condition {
            field,
            operator,
            operand,
        })
    }
}

/// Translate a query from its external to its internal representation.
pub fn translate_query(ext: &QueryExt) -> Result<Query, QueryError> {
    let mut q = Query {
        cond: Vec::with_capacity(ext.cond.len()),
        breakdown: BreakdownFlags::default(),
        top_n: ext.top_n,
    };

    q.breakdown.set(&ext.breakdown)?;

    for c in &ext.cond {
        q.cond.push(Condition::translate(c)?);
    }

    Ok(q)
}

impl Query {
    /// The timestamp range selected by the conditions, `[start, end]` over
    /// aligned timeslots. Without bounds the range is `[0, now]`.
    pub fn time_range(&self, now: i64, aggregation: i64) -> (i64, i64) {
        let aggregation = aggregation.max(1);
        let mut start = 0i64;
        let mut end = now;
        for c in &self.cond {
            if c.field != Field::Timestamp {
                continue;
            }
            if let Operand::Time(ts) = c.operand {
                match c.operator {
                    Operator::Greater => start = ts,
                    Operator::Smaller => end = ts,
                    Operator::Equal => {
                        start = ts;
                        end = ts;
                    }
                    Operator::Unequal => {}
                }
            }
        }
        start -= start % aggregation;
        (start, end)
    }

    /// The agent equality criterion, resolved to the bucket partition key.
    /// An address operand goes through the configured IP-to-name table;
    /// addresses of unknown agents keep their string form (and match no
    /// resident bucket).
    pub fn agent(
        &self,
        names_by_ip: &std::collections::HashMap<IpAddr, String>,
    ) -> Result<String, QueryError> {
        for c in &self.cond {
            if c.field != Field::Agent || c.operator != Operator::Equal {
                continue;
            }
            return Ok(match &c.operand {
                Operand::Addr(ip) => names_by_ip
                    .get(ip)
                    .cloned()
                    .unwrap_or_else(|| ip.to_string()),
                Operand::Name(name) => name.clone(),
                _ => continue,
            });
        }
        Err(QueryError::AgentCriteriaNotFound)
    }
}

/// Check a single flow against every condition, for archived flows that
/// have no index to consult.
pub fn validate_flow(fl: &Flow, q: &Query) -> bool {
    for c in &q.cond {
        let ok = match (c.field, &c.operand) {
            (Field::Timestamp, Operand::Time(ts)) => match c.operator {
                Operator::Equal => fl.timestamp == *ts,
                Operator::Greater => fl.timestamp > *ts,
                Operator::Smaller => fl.timestamp < *ts,
                Operator::Unequal => fl.timestamp != *ts,
            },
            // Consumed by bucket/file selection.
            (Field::Agent, _) => true,
            (Field::Protocol, Operand::Proto(p)) => fl.protocol == *p,
            (Field::SrcAddr, Operand::Addr(a)) => fl.src_addr == *a,
            (Field::DstAddr, Operand::Addr(a)) => fl.dst_addr == *a,
            (Field::NextHop, Operand::Addr(a)) => fl.next_hop == *a,
            (Field::IntIn, Operand::Iface(i)) => fl.int_in == *i,
            (Field::IntOut, Operand::Iface(i)) => fl.int_out == *i,
            (Field::SrcAs, Operand::Asn(asn)) => fl.src_as == *asn,
            (Field::DstAs, Operand::Asn(asn)) => fl.dst_as == *asn,
            (Field::NextHopAs, Operand::Asn(asn)) => fl.next_hop_as == *asn,
            (Field::SrcPort, Operand::Port(p)) => fl.src_port == *p,
            (Field::DstPort, Operand::Port(p)) => fl.dst_port == *p,
            (Field::SrcPfx, Operand::Pfx(p)) => fl.src_pfx == Some(*p),
            (Field::DstPfx, Operand::Pfx(p)) => fl.dst_pfx == Some(*p),
            _ => true,
        };
        if !ok {
            return false;
        }
    }
    true
}
