//! Protobuf wire messages for the on-disk archive.
//!
//! One gzip-compressed [`FlowArchive`] per (timeslot, agent) bucket.
//! Addresses travel as their 4- or 16-byte network form, prefixes as an
//! address plus mask length. Field numbers are part of the archive format
//! and must not be reassigned.

use prost::Message;

use crate::flow::{ip_from_bytes, ip_to_bytes, Flow, Prefix};

#[derive(Clone, PartialEq, Message)]
pub struct PrefixProto {
    #[prost(bytes = "vec", tag = "1")]
    pub addr: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub mask: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct FlowProto {
    #[prost(bytes = "vec", tag = "1")]
    pub agent: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub family: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub src_addr: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub dst_addr: Vec<u8>,
    #[prost(bytes = "vec", tag = "5")]
    pub next_hop: Vec<u8>,
    #[prost(uint32, tag = "6")]
    pub src_port: u32,
    #[prost(uint32, tag = "7")]
    pub dst_port: u32,
    #[prost(uint32, tag = "8")]
    pub protocol: u32,
    #[prost(uint32, tag = "9")]
    pub int_in: u32,
    #[prost(uint32, tag = "10")]
    pub int_out: u32,
    #[prost(uint32, tag = "11")]
    pub src_as: u32,
    #[prost(uint32, tag = "12")]
    pub dst_as: u32,
    #[prost(uint32, tag = "13")]
    pub next_hop_as: u32,
    #[prost(message, optional, tag = "14")]
    pub src_pfx: Option<PrefixProto>,
    #[prost(message, optional, tag = "15")]
    pub dst_pfx: Option<PrefixProto>,
    #[prost(uint64, tag = "16")]
    pub packets: u64,
    #[prost(uint64, tag = "17")]
    pub size: u64,
    #[prost(uint64, tag = "18")]
    pub samplerate: u64,
    #[prost(int64, tag = "19")]
    pub timestamp: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct FlowArchive {
    #[prost(message, repeated, tag = "1")]
    pub flows: Vec<FlowProto>,
}

impl From<&Flow> for FlowProto {
    fn from(fl: &Flow) -> Self {
        FlowProto {
            agent: ip_to_bytes(fl.agent),
            family: u32::from(fl.family),
            src_addr: ip_to_bytes(fl.src_addr),
            dst_addr: ip_to_bytes(fl.dst_addr),
            next_hop: ip_to_bytes(fl.next_hop),
            src_port: u32::from(fl.src_port),
            dst_port: u32::from(fl.dst_port),
            protocol: u32::from(fl.protocol),
            int_in: fl.int_in,
            int_out: fl.int_out,
            src_as: fl.src_as,
            dst_as: fl.dst_as,
            next_hop_as: fl.next_hop_as,
            src_pfx: fl.src_pfx.map(|p| PrefixProto {
                addr: ip_to_bytes(p.addr()),
                mask: u32::from(p.len()),
            }),
            dst_pfx: fl.dst_pfx.map(|p| PrefixProto {
                addr: ip_to_bytes(p.addr()),
                mask: u32::from(p.len()),
            }),
            packets: fl.packets,
            size: fl.size,
            samplerate: fl.samplerate,
            timestamp: fl.timestamp,
        }
    }
}

impl FlowProto {
    /// Rebuild the in-memory record. `None` if an address field is neither
    /// 4 nor 16 bytes, which means the archive was written by something else.
    pub fn to_flow(&self) -> Option<Flow> {
        let prefix = |p: &Option<PrefixProto>| -> Option<Prefix> {
            p.as_ref()
                .and_then(|p| ip_from_bytes(&p.addr).map(|a| Prefix::new(a, p.mask as u8)))
        };
        Some(Flow {
            agent: ip_from_bytes(&self.agent)?,
            family: self.family as u8,
            src_addr: ip_from_bytes(&self.src_addr)?,
            dst_addr: ip_from_bytes(&self.dst_addr)?,
            next_hop: ip_from_bytes(&self.next_hop)?,
            src_port: self.src_port as u16,
            dst_port: self.dst_port as u16,
            protocol: self.protocol as u8,
            int_in: self.int_in,
            int_out: self.int_out,
            src_as: self.src_as,
            dst_as: self.dst_as,
            next_hop_as: self.next_hop_as,
            src_pfx: prefix(&self.src_pfx),
            dst_pfx: prefix(&self.dst_pfx),
            packets: self.packets,
            size: self.size,
            samplerate: self.samplerate,
            timestamp: self.timestamp,
        })
    }
}

/// Marshal a flow list for the archive writer.
pub fn encode_flows(flows: &[std::sync::Arc<Flow>]) -> Vec<u8> {
    let archive = FlowArchive {
        flows: flows.iter().map(|f| FlowProto::from(f.as_ref())).collect(),
    };
    archive.encode_to_vec()
}

/// Unmarshal an archive, dropping records with malformed addresses.
pub fn decode_flows(buf: &[u8]) -> Result<Vec<Flow>, prost::DecodeError> {
    let archive = FlowArchive::decode(buf)?;
    Ok(archive.flows.iter().filter_map(FlowProto::to_flow).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use std::sync::Arc;

    fn sample_flow() -> Flow {
        let mut fl = Flow::empty();
        fl.agent = "1.2.3.4".parse().unwrap();
        fl.src_addr = "10.0.0.1".parse().unwrap();
        fl.dst_addr = "30.0.0.1".parse().unwrap();
        fl.next_hop = "30.0.0.100".parse().unwrap();
        fl.src_port = 12345;
        fl.dst_port = 443;
        fl.protocol = 6;
        fl.int_in = 1;
        fl.int_out = 3;
        fl.src_as = 100;
        fl.dst_as = 300;
        fl.next_hop_as = 300;
        fl.src_pfx = Some("10.0.0.0/8".parse().unwrap());
        fl.packets = 2;
        fl.size = 1000;
        fl.samplerate = 4;
        fl.timestamp = 3600;
        fl
    }

    #[test]
    fn test_flow_round_trip() {
        let fl = sample_flow();
        let encoded = encode_flows(&[Arc::new(fl.clone())]);
        let decoded = decode_flows(&encoded).unwrap();
        assert_eq!(decoded, vec![fl]);
    }

    #[test]
    fn test_ipv6_round_trip() {
        let mut fl = sample_flow();
        fl.family = 6;
        fl.src_addr = "2001:db8::1".parse::<IpAddr>().unwrap();
        fl.dst_addr = "2001:db8::2".parse::<IpAddr>().unwrap();
        fl.src_pfx = Some("2001:db8::/32".parse().unwrap());
        let decoded = decode_flows(&encode_flows(&[Arc::new(fl.clone())])).unwrap();
        assert_eq!(decoded, vec![fl]);
    }

    #[test]
    fn test_missing_prefix_stays_missing() {
        let mut fl = sample_flow();
        fl.src_pfx = None;
        fl.dst_pfx = None;
        let decoded = decode_flows(&encode_flows(&[Arc::new(fl.clone())])).unwrap();
        assert_eq!(decoded[0].src_pfx, None);
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(decode_flows(&[0xff, 0xff, 0xff, 0x01]).is_err());
    }
}
