//! Dissection of sampled raw packet headers.
//!
//! sFlow ships the first bytes of the sampled frame verbatim; this walks
//! Ethernet (with VLAN tags), IPv4/IPv6 and TCP/UDP far enough to fill the
//! address and port fields of a flow record.

use std::net::IpAddr;

use etherparse::{
    Ethernet2HeaderSlice, Ipv4HeaderSlice, Ipv6HeaderSlice, TcpHeaderSlice, UdpHeaderSlice,
};

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88a8;

const IP_PROTO_TCP: u8 = 6;
const IP_PROTO_UDP: u8 = 17;

/// The five-tuple-ish extract of a sampled header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSample {
    pub family: u8,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub protocol: u8,
    pub src_port: u16,
    pub dst_port: u16,
}

/// Dissect a sampled Ethernet frame. `None` when the header is cut off
/// before the IP layer or carries something that is not IP.
pub fn dissect_ethernet(data: &[u8]) -> Option<RawSample> {
    let eth = Ethernet2HeaderSlice::from_slice(data).ok()?;
    let mut ethertype = eth.ether_type().0;
    let mut rest = &data[eth.slice().len()..];

    // Peel off up to two VLAN tags (802.1Q / 802.1ad).
    for _ in 0..2 {
        if ethertype != ETHERTYPE_VLAN && ethertype != ETHERTYPE_QINQ {
            break;
        }
        if rest.len() < 4 {
            return None;
        }
        ethertype = u16::from_be_bytes([rest[2], rest[3]]);
        rest = &rest[4..];
    }

    match ethertype {
        ETHERTYPE_IPV4 => dissect_ipv4(rest),
        ETHERTYPE_IPV6 => dissect_ipv6(rest),
        _ => None,
    }
}

fn dissect_ipv4(data: &[u8]) -> Option<RawSample> {
    let ip = Ipv4HeaderSlice::from_slice(data).ok()?;
    let protocol = ip.protocol().0;
    let (src_port, dst_port) = ports(protocol, &data[ip.slice().len()..]);
    Some(RawSample {
        family: 4,
        src_addr: IpAddr::V4(ip.source_addr()),
        dst_addr: IpAddr::V4(ip.destination_addr()),
        protocol,
        src_port,
        dst_port,
    })
}

fn dissect_ipv6(data: &[u8]) -> Option<RawSample> {
    let ip = Ipv6HeaderSlice::from_slice(data).ok()?;
    let protocol = ip.next_header().0;
    let (src_port, dst_port) = ports(protocol, &data[ip.slice().len()..]);
    Some(RawSample {
        family: 6,
        src_addr: IpAddr::V6(ip.source_addr()),
        dst_addr: IpAddr::V6(ip.destination_addr()),
        protocol,
        src_port,
        dst_port,
    })
}

/// Transport ports, zero when the sampled header ends before them.
fn ports(protocol: u8, data: &[u8]) -> (u16, u16) {
    match protocol {
        IP_PROTO_TCP => TcpHeaderSlice::from_slice(data)
            .map(|tcp| (tcp.source_port(), tcp.destination_port()))
            .unwrap_or((0, 0)),
        IP_PROTO_UDP => UdpHeaderSlice::from_slice(data)
            .map(|udp| (udp.source_port(), udp.destination_port()))
            .unwrap_or((0, 0)),
        _ => (0, 0),
    }
}
