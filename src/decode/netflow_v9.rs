//! NetFlow v9 decoder.
//!
//! Template flowsets populate a per-(exporter, source id) template cache;
//! data flowsets decode against it. Data arriving before its template is
//! reported as a decode error and dropped, which on a healthy exporter
//! resolves itself within one template refresh interval.

use std::net::SocketAddr;

use tracing::debug;

use super::{record_to_flow, Decoder, Reader, TemplateCache, TemplateField};
use crate::error::DecodeError;
use crate::flow::Flow;

const VERSION: u16 = 9;

const FLOWSET_TEMPLATE: u16 = 0;
const FLOWSET_OPTIONS_TEMPLATE: u16 = 1;

const PROTOCOL: &str = "netflow_v9";

#[derive(Debug, Default)]
pub struct NetflowV9Decoder {
    templates: TemplateCache,
}

impl NetflowV9Decoder {
    pub fn new() -> Self {
        NetflowV9Decoder::default()
    }
}

impl Decoder for NetflowV9Decoder {
    fn name(&self) -> &'static str {
        PROTOCOL
    }

    fn decode(
        &mut self,
        data: &[u8],
        from: SocketAddr,
        _now: i64,
    ) -> Result<Vec<Flow>, DecodeError> {
        let mut r = Reader::new(data, PROTOCOL);

        let version = r.u16()?;
        if version != VERSION {
            return Err(DecodeError::UnsupportedVersion {
                protocol: PROTOCOL,
                version,
            });
        }
        let _count = r.u16()?;
        let _sys_uptime = r.u32()?;
        let unix_secs = r.u32()?;
        let _sequence = r.u32()?;
        let source_id = r.u32()?;

        let exporter = from.ip();
        let timestamp = i64::from(unix_secs);
        let mut flows = Vec::new();
        let mut missing_template = None;

        while r.remaining() >= 4 {
            let set_id = r.u16()?;
            let set_len = r.u16()? as usize;
            if set_len < 4 {
                return Err(DecodeError::InvalidField {
                    protocol: PROTOCOL,
                    field: "flowset length",
                    reason: set_len.to_string(),
                });
            }
            let set = r.take(set_len - 4)?;

            match set_id {
                FLOWSET_TEMPLATE => self.decode_templates(set, exporter, source_id)?,
                FLOWSET_OPTIONS_TEMPLATE => {}
                id if id > 255 => {
                    match self.templates.get(exporter, source_id, id) {
                        Some(fields) => decode_data_set(set, fields, exporter, timestamp, &mut flows),
                        None => {
                            missing_template.get_or_insert(DecodeError::UnknownTemplate {
                                protocol: PROTOCOL,
                                template_id: id,
                                source_id,
                            });
                        }
                    }
                }
                _ => {}
            }
        }

        // A packet that produced nothing because its templates are unknown
        // is a decode error; mixed packets still deliver what decoded.
        match missing_template {
            Some(err) if flows.is_empty() => Err(err),
            Some(err) => {
                debug!(%exporter, %err, "skipped flowset in mixed packet");
                Ok(flows)
            }
            None => Ok(flows),
        }
    }
}

impl NetflowV9Decoder {
    fn decode_templates(
        &mut self,
        set: &[u8],
        exporter: std::net::IpAddr,
        source_id: u32,
    ) -> Result<(), DecodeError> {
        let mut r = Reader::new(set, PROTOCOL);
        while r.remaining() >= 4 {
            let template_id = r.u16()?;
            let field_count = r.u16()?;
            let mut fields = Vec::with_capacity(usize::from(field_count));
            for _ in 0..field_count {
                fields.push(TemplateField {
                    id: r.u16()?,
                    len: r.u16()?,
                });
            }
            self.templates.insert(exporter, source_id, template_id, fields);
        }
        Ok(())
    }
}

fn decode_data_set(
    set: &[u8],
    fields: &[TemplateField],
    exporter: std::net::IpAddr,
    timestamp: i64,
    flows: &mut Vec<Flow>,
) {
    let record_len = TemplateCache::record_len(fields);
    if record_len == 0 {
        return;
    }
    // Anything shorter than a record at the tail is padding.
    let mut rest = set;
    while rest.len() >= record_len {
        let (record, tail) = rest.split_at(record_len);
        rest = tail;
        if let Some(fl) = record_to_flow(fields, record, exporter, timestamp) {
            flows.push(fl);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::ie;
    use std::net::IpAddr;

    fn push_u16(buf: &mut Vec<u8>, v: u16) {
        buf.extend_from_slice(&v.to_be_bytes());
    }

    fn push_u32(buf: &mut Vec<u8>, v: u32) {
        buf.extend_from_slice(&v.to_be_bytes());
    }

    fn header(count: u16, unix_secs: u32, source_id: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        push_u16(&mut buf, 9);
        push_u16(&mut buf, count);
        push_u32(&mut buf, 100_000); // sys uptime
        push_u32(&mut buf, unix_secs);
        push_u32(&mut buf, 1); // sequence
        push_u32(&mut buf, source_id);
        buf
    }

    fn template_flowset(template_id: u16) -> Vec<u8> {
        let fields: &[(u16, u16)] = &[
            (ie::IPV4_SRC_ADDR, 4),
            (ie::IPV4_DST_ADDR, 4),
            (ie::IN_BYTES, 4),
            (ie::IN_PKTS, 4),
            (ie::PROTOCOL, 1),
            (ie::L4_SRC_PORT, 2),
            (ie::L4_DST_PORT, 2),
            (ie::INPUT_SNMP, 2),
            (ie::OUTPUT_SNMP, 2),
        ];
        let mut body = Vec::new();
        push_u16(&mut body, template_id);
        push_u16(&mut body, fields.len() as u16);
        for (id, len) in fields {
            push_u16(&mut body, *id);
            push_u16(&mut body, *len);
        }

        let mut set = Vec::new();
        push_u16(&mut set, 0); // template flowset
        push_u16(&mut set, (body.len() + 4) as u16);
        set.extend_from_slice(&body);
        set
    }

    fn data_flowset(template_id: u16) -> Vec<u8> {
        let mut record = Vec::new();
        record.extend_from_slice(&[10, 0, 0, 1]);
        record.extend_from_slice(&[30, 0, 0, 1]);
        push_u32(&mut record, 1000);
        push_u32(&mut record, 2);
        record.push(6);
        push_u16(&mut record, 12345);
        push_u16(&mut record, 443);
        push_u16(&mut record, 1);
        push_u16(&mut record, 3);

        let mut set = Vec::new();
        push_u16(&mut set, template_id);
        push_u16(&mut set, (record.len() + 4) as u16);
        set.extend_from_slice(&record);
        set
    }

    fn from() -> SocketAddr {
        "1.2.3.4:2055".parse().unwrap()
    }

    #[test]
    fn test_template_then_data() {
        let mut decoder = NetflowV9Decoder::new();

        let mut packet = header(1, 3600, 7);
        packet.extend_from_slice(&template_flowset(256));
        assert!(decoder.decode(&packet, from(), 0).unwrap().is_empty());

        let mut packet = header(1, 3600, 7);
        packet.extend_from_slice(&data_flowset(256));
        let flows = decoder.decode(&packet, from(), 0).unwrap();

        assert_eq!(flows.len(), 1);
        let fl = &flows[0];
        assert_eq!(fl.agent, "1.2.3.4".parse::<IpAddr>().unwrap());
        assert_eq!(fl.src_addr, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(fl.size, 1000);
        assert_eq!(fl.packets, 2);
        assert_eq!(fl.int_in, 1);
        assert_eq!(fl.int_out, 3);
        assert_eq!(fl.timestamp, 3600);
    }

    #[test]
    fn test_template_and_data_in_one_packet() {
        let mut decoder = NetflowV9Decoder::new();
        let mut packet = header(2, 3600, 7);
        packet.extend_from_slice(&template_flowset(256));
        packet.extend_from_slice(&data_flowset(256));
        assert_eq!(decoder.decode(&packet, from(), 0).unwrap().len(), 1);
    }

    #[test]
    fn test_data_without_template_is_an_error() {
        let mut decoder = NetflowV9Decoder::new();
        let mut packet = header(1, 3600, 7);
        packet.extend_from_slice(&data_flowset(256));
        let err = decoder.decode(&packet, from(), 0).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::UnknownTemplate {
                template_id: 256,
                source_id: 7,
                ..
            }
        ));
    }

    #[test]
    fn test_templates_are_per_source_id() {
        let mut decoder = NetflowV9Decoder::new();

        let mut packet = header(1, 3600, 7);
        packet.extend_from_slice(&template_flowset(256));
        decoder.decode(&packet, from(), 0).unwrap();

        // Same template id, different observation domain: no template.
        let mut packet = header(1, 3600, 8);
        packet.extend_from_slice(&data_flowset(256));
        assert!(matches!(
            decoder.decode(&packet, from(), 0).unwrap_err(),
            DecodeError::UnknownTemplate { source_id: 8, .. }
        ));
    }

    #[test]
    fn test_mixed_packet_keeps_decodable_flowsets() {
        let mut decoder = NetflowV9Decoder::new();

        let mut packet = header(1, 3600, 7);
        packet.extend_from_slice(&template_flowset(256));
        decoder.decode(&packet, from(), 0).unwrap();

        // One decodable data flowset, one without a template: the former
        // survives.
        let mut packet = header(2, 3600, 7);
        packet.extend_from_slice(&data_flowset(256));
        packet.extend_from_slice(&data_flowset(257));
        assert_eq!(decoder.decode(&packet, from(), 0).unwrap().len(), 1);
    }

    #[test]
    fn test_wrong_version() {
        let mut packet = header(0, 0, 0);
        packet[1] = 5;
        let err = NetflowV9Decoder::new()
            .decode(&packet, from(), 0)
            .unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedVersion { version: 5, .. }));
    }
}
