//! Normalized flow record.
//!
//! Every wire decoder (NetFlow v9, IPFIX, sFlow v5) reduces its packets to
//! this record before handing them to the database. The record is immutable
//! once a bucket owns it.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::error::ParseError;

/// A routing prefix in CIDR form.
///
/// Stored with the network address already masked so that equal prefixes
/// compare and hash equal regardless of the host bits the exporter sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Prefix {
    addr: IpAddr,
    len: u8,
}

impl Prefix {
    pub fn new(addr: IpAddr, len: u8) -> Self {
        Prefix {
            addr: mask_addr(addr, len),
            len,
        }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn len(&self) -> u8 {
        self.len
    }
}

fn mask_addr(addr: IpAddr, len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let mask = if len == 0 {
                0
            } else {
                u32::MAX << (32 - u32::from(len).min(32))
            };
            IpAddr::V4(Ipv4Addr::from(bits & mask))
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let mask = if len == 0 {
                0
            } else {
                u128::MAX << (128 - u32::from(len).min(128))
            };
            IpAddr::V6(Ipv6Addr::from(bits & mask))
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

impl FromStr for Prefix {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| ParseError::InvalidPrefix(s.to_string()))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| ParseError::InvalidPrefix(s.to_string()))?;
        let len: u8 = len
            .parse()
            .map_err(|_| ParseError::InvalidPrefix(s.to_string()))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if len > max {
            return Err(ParseError::InvalidPrefix(s.to_string()));
        }
        Ok(Prefix::new(addr, len))
    }
}

/// One sampled flow, normalized across the three wire protocols.
///
/// `size` is in bytes. Decoders deliver it pre-multiplication; the ingest
/// pipeline multiplies by `samplerate` before the flow reaches a bucket.
/// `timestamp` is Unix seconds, aligned to the aggregation raster on ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flow {
    /// Source address of the exporting router.
    pub agent: IpAddr,
    /// Address family of the sampled traffic (4 or 6).
    pub family: u8,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub next_hop: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    /// SNMP index of the ingress interface.
    pub int_in: u32,
    /// SNMP index of the egress interface.
    pub int_out: u32,
    pub src_as: u32,
    pub dst_as: u32,
    pub next_hop_as: u32,
    pub src_pfx: Option<Prefix>,
    pub dst_pfx: Option<Prefix>,
    pub packets: u64,
    pub size: u64,
    pub samplerate: u64,
    pub timestamp: i64,
}

impl Flow {
    /// An all-zero IPv4 flow, for decoders to fill in field by field.
    pub fn empty() -> Self {
        let zero = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        Flow {
            agent: zero,
            family: 4,
            src_addr: zero,
            dst_addr: zero,
            next_hop: zero,
            src_port: 0,
            dst_port: 0,
            protocol: 0,
            int_in: 0,
            int_out: 0,
            src_as: 0,
            dst_as: 0,
            next_hop_as: 0,
            src_pfx: None,
            dst_pfx: None,
            packets: 0,
            size: 0,
            samplerate: 1,
            timestamp: 0,
        }
    }
}

/// Decode a 4- or 16-byte slice into an address.
pub fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// Encode an address as its 4- or 16-byte network form.
pub fn ip_to_bytes(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}
