//! sFlow v5 decoder.
//!
//! Walks the datagram header, flow samples (plain and expanded) and their
//! records. A raw-packet-header record supplies addresses, ports and
//! protocol; extended router data supplies the next hop. Counter samples
//! and unknown record types are skipped by their length fields.

use std::net::SocketAddr;

use tracing::debug;

use super::{packet, Decoder, Reader};
use crate::error::DecodeError;
use crate::flow::{ip_from_bytes, Flow};

const SFLOW_VERSION: u32 = 5;

const ADDR_TYPE_IPV4: u32 = 1;
const ADDR_TYPE_IPV6: u32 = 2;

// Standard-enterprise sample formats.
const SAMPLE_FLOW: u32 = 1;
const SAMPLE_EXPANDED_FLOW: u32 = 3;

// Standard-enterprise flow record formats.
const RECORD_RAW_PACKET_HEADER: u32 = 1;
const RECORD_EXTENDED_ROUTER: u32 = 1002;

// Raw header protocols.
const HEADER_PROTO_ETHERNET: u32 = 1;

const PROTOCOL: &str = "sflow";

/// Stateless decoder for sFlow v5 datagrams.
#[derive(Debug, Default)]
pub struct SflowDecoder;

impl SflowDecoder {
    pub fn new() -> Self {
        SflowDecoder
    }
}

impl Decoder for SflowDecoder {
    fn name(&self) -> &'static str {
        PROTOCOL
    }

    fn decode(
        &mut self,
        data: &[u8],
        _from: SocketAddr,
        now: i64,
    ) -> Result<Vec<Flow>, DecodeError> {
        let mut r = Reader::new(data, PROTOCOL);

        let version = r.u32()?;
        if version != SFLOW_VERSION {
            return Err(DecodeError::UnsupportedVersion {
                protocol: PROTOCOL,
                version: version as u16,
            });
        }

        let agent = read_address(&mut r)?;
        let _sub_agent_id = r.u32()?;
        let _sequence = r.u32()?;
        let _uptime = r.u32()?;
        let num_samples = r.u32()?;

        let mut flows = Vec::new();
        for _ in 0..num_samples {
            let sample_type = r.u32()?;
            let sample_len = r.u32()? as usize;
            let sample = r.take(sample_len)?;

            let enterprise = sample_type >> 12;
            let format = sample_type & 0xfff;
            if enterprise != 0 {
                continue;
            }

            match format {
                SAMPLE_FLOW | SAMPLE_EXPANDED_FLOW => {
                    match decode_flow_sample(sample, format == SAMPLE_EXPANDED_FLOW) {
                        Ok(Some(mut fl)) => {
                            fl.agent = agent;
                            fl.timestamp = now;
                            flows.push(fl);
                        }
                        // A flow sample without a usable raw header.
                        Ok(None) => {}
                        Err(err) => debug!(%err, "skipping flow sample"),
                    }
                }
                // Counter samples et al.
                _ => {}
            }
        }

        Ok(flows)
    }
}

fn read_address(r: &mut Reader<'_>) -> Result<std::net::IpAddr, DecodeError> {
    let addr_type = r.u32()?;
    let bytes = match addr_type {
        ADDR_TYPE_IPV4 => r.take(4)?,
        ADDR_TYPE_IPV6 => r.take(16)?,
        _ => {
            return Err(DecodeError::InvalidField {
                protocol: PROTOCOL,
                field: "address type",
                reason: addr_type.to_string(),
            })
        }
    };
    ip_from_bytes(bytes).ok_or(DecodeError::InvalidField {
        protocol: PROTOCOL,
        field: "address",
        reason: "length".to_string(),
    })
}

fn decode_flow_sample(sample: &[u8], expanded: bool) -> Result<Option<Flow>, DecodeError> {
    let mut r = Reader::new(sample, PROTOCOL);

    let _sequence = r.u32()?;
    if expanded {
        let _source_id_type = r.u32()?;
        let _source_id_index = r.u32()?;
    } else {
        let _source_id = r.u32()?;
    }
    let sampling_rate = r.u32()?;
    let _sample_pool = r.u32()?;
    let _drops = r.u32()?;
    let (input_if, output_if) = if expanded {
        let _input_format = r.u32()?;
        let input = r.u32()?;
        let _output_format = r.u32()?;
        let output = r.u32()?;
        (input, output)
    } else {
        (r.u32()?, r.u32()?)
    };
    let num_records = r.u32()?;

    let mut fl = Flow::empty();
    fl.int_in = input_if;
    fl.int_out = output_if;
    fl.samplerate = u64::from(sampling_rate.max(1));
    fl.packets = 1;

    let mut sampled_header = false;
    for _ in 0..num_records {
        let record_type = r.u32()?;
        let record_len = r.u32()? as usize;
        let record = r.take(record_len)?;

        match record_type {
            RECORD_RAW_PACKET_HEADER => {
                if let Some(size) = decode_raw_header(record, &mut fl)? {
                    fl.size = size;
                    sampled_header = true;
                }
            }
            RECORD_EXTENDED_ROUTER => {
                let mut rr = Reader::new(record, PROTOCOL);
                fl.next_hop = read_address(&mut rr)?;
                let _src_mask = rr.u32()?;
                let _dst_mask = rr.u32()?;
            }
            _ => {}
        }
    }

    Ok(sampled_header.then_some(fl))
}

/// Parse a raw-packet-header record into `fl`, returning the sampled frame
/// length. `None` when the header protocol is not Ethernet or the header
/// does not reach the IP layer.
fn decode_raw_header(record: &[u8], fl: &mut Flow) -> Result<Option<u64>, DecodeError> {
    let mut r = Reader::new(record, PROTOCOL);

    let header_protocol = r.u32()?;
    let frame_length = r.u32()?;
    let _stripped = r.u32()?;
    let header_len = r.u32()? as usize;
    let header = r.take(header_len.min(r.remaining()))?;

    if header_protocol != HEADER_PROTO_ETHERNET {
        return Ok(None);
    }

    match packet::dissect_ethernet(header) {
        Some(sample) => {
            fl.family = sample.family;
            fl.src_addr = sample.src_addr;
            fl.dst_addr = sample.dst_addr;
            fl.protocol = sample.protocol;
            fl.src_port = sample.src_port;
            fl.dst_port = sample.dst_port;
            Ok(Some(u64::from(frame_length)))
        }
        None => Ok(None),
    }
}
