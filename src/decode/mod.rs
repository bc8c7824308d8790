//! Wire decoders and the UDP listener harness.
//!
//! Each supported export protocol (NetFlow v9, IPFIX, sFlow v5) implements
//! [`Decoder`]; one listener task per enabled protocol reads datagrams and
//! pushes the normalized flows onto the database input. Decode errors drop
//! the offending packet and never take the listener down.

pub mod ipfix;
pub mod netflow_v9;
pub mod packet;
pub mod sflow;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::database::unix_now;
use crate::error::DecodeError;
use crate::flow::{ip_from_bytes, Flow, Prefix};
use crate::stats::Stats;

/// A flow-export wire decoder.
pub trait Decoder: Send {
    fn name(&self) -> &'static str;

    /// Decode one datagram into normalized flows. `now` is the receive time
    /// in Unix seconds, for protocols that do not carry an export time.
    fn decode(
        &mut self,
        data: &[u8],
        from: SocketAddr,
        now: i64,
    ) -> Result<Vec<Flow>, DecodeError>;
}

/// Listen on `listen` and feed decoded flows into `input` until the
/// database side hangs up.
pub async fn serve_udp<D: Decoder>(
    listen: String,
    mut decoder: D,
    input: mpsc::Sender<Flow>,
    stats: Arc<Stats>,
    packets: fn(&Stats) -> &AtomicU64,
) -> std::io::Result<()> {
    let socket = UdpSocket::bind(&listen).await?;
    info!(%listen, decoder = decoder.name(), "listening");

    let mut buf = vec![0u8; 65535];
    loop {
        let (len, from) = socket.recv_from(&mut buf).await?;
        Stats::inc(packets(&stats));

        match decoder.decode(&buf[..len], from, unix_now()) {
            Ok(flows) => {
                for fl in flows {
                    if input.send(fl).await.is_err() {
                        return Ok(());
                    }
                }
            }
            Err(err) => {
                Stats::inc(&stats.decode_errors);
                debug!(%from, decoder = decoder.name(), %err, "dropping packet");
            }
        }
    }
}

/// Big-endian reader over a datagram, tracking position for error context.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    protocol: &'static str,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8], protocol: &'static str) -> Self {
        Reader {
            buf,
            pos: 0,
            protocol,
        }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::PacketTooShort {
                protocol: self.protocol,
                needed: self.pos + n,
                have: self.buf.len(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        self.take(n).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Widen a 1-8 byte big-endian field to u64.
pub(crate) fn be_uint(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| acc << 8 | u64::from(*b))
}

// Information element ids shared by NetFlow v9 and IPFIX.
pub(crate) mod ie {
    pub const IN_BYTES: u16 = 1;
    pub const IN_PKTS: u16 = 2;
    pub const PROTOCOL: u16 = 4;
    pub const L4_SRC_PORT: u16 = 7;
    pub const IPV4_SRC_ADDR: u16 = 8;
    pub const SRC_MASK: u16 = 9;
    pub const INPUT_SNMP: u16 = 10;
    pub const L4_DST_PORT: u16 = 11;
    pub const IPV4_DST_ADDR: u16 = 12;
    pub const DST_MASK: u16 = 13;
    pub const OUTPUT_SNMP: u16 = 14;
    pub const IPV4_NEXT_HOP: u16 = 15;
    pub const SRC_AS: u16 = 16;
    pub const DST_AS: u16 = 17;
    pub const IPV6_SRC_ADDR: u16 = 27;
    pub const IPV6_DST_ADDR: u16 = 28;
    pub const IPV6_SRC_MASK: u16 = 29;
    pub const IPV6_DST_MASK: u16 = 30;
    pub const SAMPLING_INTERVAL: u16 = 34;
    pub const IPV6_NEXT_HOP: u16 = 62;
}

/// One field of a template record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TemplateField {
    pub id: u16,
    pub len: u16,
}

/// Templates keyed by (exporter, observation domain, template id).
///
/// Both template-based protocols keep one of these per decoder; data
/// records arriving before their template are dropped until it shows up.
#[derive(Debug, Default)]
pub(crate) struct TemplateCache {
    templates: HashMap<(IpAddr, u32, u16), Vec<TemplateField>>,
}

impl TemplateCache {
    pub fn insert(&mut self, exporter: IpAddr, domain: u32, id: u16, fields: Vec<TemplateField>) {
        self.templates.insert((exporter, domain, id), fields);
    }

    pub fn get(&self, exporter: IpAddr, domain: u32, id: u16) -> Option<&[TemplateField]> {
        self.templates
            .get(&(exporter, domain, id))
            .map(|f| f.as_slice())
    }

    pub fn record_len(fields: &[TemplateField]) -> usize {
        fields.iter().map(|f| usize::from(f.len)).sum()
    }
}

/// Decode one fixed-layout data record into a flow.
pub(crate) fn record_to_flow(
    fields: &[TemplateField],
    mut record: &[u8],
    agent: IpAddr,
    timestamp: i64,
) -> Option<Flow> {
    let mut fl = Flow::empty();
    fl.agent = agent;
    fl.timestamp = timestamp;
    fl.packets = 1;
    fl.samplerate = 0;

    let mut src_mask = 0u8;
    let mut dst_mask = 0u8;

    for field in fields {
        let len = usize::from(field.len);
        if record.len() < len {
            return None;
        }
        let (value, rest) = record.split_at(len);
        record = rest;

        match field.id {
            ie::IN_BYTES => fl.size = be_uint(value),
            ie::IN_PKTS => fl.packets = be_uint(value),
            ie::PROTOCOL => fl.protocol = be_uint(value) as u8,
            ie::L4_SRC_PORT => fl.src_port = be_uint(value) as u16,
            ie::L4_DST_PORT => fl.dst_port = be_uint(value) as u16,
            ie::INPUT_SNMP => fl.int_in = be_uint(value) as u32,
            ie::OUTPUT_SNMP => fl.int_out = be_uint(value) as u32,
            ie::SRC_AS => fl.src_as = be_uint(value) as u32,
            ie::DST_AS => fl.dst_as = be_uint(value) as u32,
            ie::SRC_MASK | ie::IPV6_SRC_MASK => src_mask = be_uint(value) as u8,
            ie::DST_MASK | ie::IPV6_DST_MASK => dst_mask = be_uint(value) as u8,
            ie::SAMPLING_INTERVAL => fl.samplerate = be_uint(value),
            ie::IPV4_SRC_ADDR | ie::IPV6_SRC_ADDR => {
                fl.src_addr = ip_from_bytes(value)?;
                fl.family = if fl.src_addr.is_ipv4() { 4 } else { 6 };
            }
            ie::IPV4_DST_ADDR | ie::IPV6_DST_ADDR => {
                fl.dst_addr = ip_from_bytes(value)?;
            }
            ie::IPV4_NEXT_HOP | ie::IPV6_NEXT_HOP => {
                fl.next_hop = ip_from_bytes(value)?;
            }
            _ => {}
        }
    }

    if src_mask > 0 {
        fl.src_pfx = Some(Prefix::new(fl.src_addr, src_mask));
    }
    if dst_mask > 0 {
        fl.dst_pfx = Some(Prefix::new(fl.dst_addr, dst_mask));
    }
    Some(fl)
}
