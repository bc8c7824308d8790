//! IPFIX (NetFlow v10) decoder.
//!
//! Same template machinery as NetFlow v9 with the RFC 7011 message framing:
//! a 16-byte header, then sets. Data arriving before its template is
//! reported as a decode error and dropped. Enterprise-specific information
//! elements are skipped over by their declared length.

use std::net::SocketAddr;

use tracing::debug;

use super::{record_to_flow, Decoder, Reader, TemplateCache, TemplateField};
use crate::error::DecodeError;
use crate::flow::Flow;

const VERSION: u16 = 10;

const SET_TEMPLATE: u16 = 2;
const SET_OPTIONS_TEMPLATE: u16 = 3;

const PROTOCOL: &str = "ipfix";

#[derive(Debug, Default)]
pub struct IpfixDecoder {
    templates: TemplateCache,
}

impl IpfixDecoder {
    pub fn new() -> Self {
        IpfixDecoder::default()
    }
}

impl Decoder for IpfixDecoder {
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
        let _length = r.u16()?;
        let export_time = r.u32()?;
        let _sequence = r.u32()?;
        let domain_id = r.u32()?;

        let exporter = from.ip();
        let timestamp = i64::from(export_time);
        let mut flows = Vec::new();
        let mut missing_template = None;

        while r.remaining() >= 4 {
            let set_id = r.u16()?;
            let set_len = r.u16()? as usize;
            if set_len < 4 {
                return Err(DecodeError::InvalidField {
                    protocol: PROTOCOL,
                    field: "set length",
                    reason: set_len.to_string(),
                });
            }
            let set = r.take(set_len - 4)?;

            match set_id {
                SET_TEMPLATE => self.decode_templates(set, exporter, domain_id)?,
                SET_OPTIONS_TEMPLATE => {}
                id if id > 255 => match self.templates.get(exporter, domain_id, id) {
                    Some(fields) => {
                        let record_len = TemplateCache::record_len(fields);
                        if record_len == 0 {
                            continue;
                        }
                        let mut rest = set;
                        while rest.len() >= record_len {
                            let (record, tail) = rest.split_at(record_len);
                            rest = tail;
                            if let Some(fl) = record_to_flow(fields, record, exporter, timestamp) {
                                flows.push(fl);
                            }
                        }
                    }
                    None => {
                        missing_template.get_or_insert(DecodeError::UnknownTemplate {
                            protocol: PROTOCOL,
                            template_id: id,
                            source_id: domain_id,
                        });
                    }
                },
                _ => {}
            }
        }

        // A message that produced nothing because its templates are unknown
        // is a decode error; mixed messages still deliver what decoded.
        match missing_template {
            Some(err) if flows.is_empty() => Err(err),
            Some(err) => {
                debug!(%exporter, %err, "skipped set in mixed message");
                Ok(flows)
            }
            None => Ok(flows),
        }
    }
}

impl IpfixDecoder {
    fn decode_templates(
        &mut self,
        set: &[u8],
        exporter: std::net::IpAddr,
        domain_id: u32,
    ) -> Result<(), DecodeError> {
        let mut r = Reader::new(set, PROTOCOL);
        while r.remaining() >= 4 {
            let template_id = r.u16()?;
            let field_count = r.u16()?;
            let mut fields = Vec::with_capacity(usize::from(field_count));
            for _ in 0..field_count {
                let raw_id = r.u16()?;
                let len = r.u16()?;
                if raw_id & 0x8000 != 0 {
                    // Enterprise-specific element: consume the PEN, keep the
                    // field for record sizing but match nothing.
                    let _pen = r.u32()?;
                    fields.push(TemplateField { id: u16::MAX, len });
                } else {
                    fields.push(TemplateField { id: raw_id, len });
                }
            }
            self.templates.insert(exporter, domain_id, template_id, fields);
        }
        Ok(())
    }
}
