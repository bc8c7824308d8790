//! Error types.
//!
//! One enum per failure domain:
//!
//! - [`ConfigError`] - configuration loading, fatal at startup
//! - [`QueryError`] - query translation and execution, surfaced as 4xx
//! - [`DecodeError`] - wire decoding, logged and the packet dropped
//! - [`ArchiveError`] - disk archive reads/writes, logged and non-fatal
//! - [`ParseError`] - operand/value parsing shared by the above

use thiserror::Error;

/// Errors from loading and validating the YAML configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unable to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("unable to parse yaml: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Two agents share an `ip_address`.
    #[error("duplicate agent: {0}")]
    DuplicateAgent(String),
}

/// Errors from translating or executing a query.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("unknown field: {0}")]
    UnknownField(String),

    #[error("invalid breakdown key: {0}")]
    InvalidBreakdownKey(String),

    #[error("invalid operand for {field}: {operand}")]
    InvalidOperand { field: String, operand: String },

    /// Non-equality operators are only evaluated against the timestamp.
    #[error("operator not supported for field {field}")]
    UnsupportedOperator { field: String },

    #[error("Agent criteria not found")]
    AgentCriteriaNotFound,

    #[error("unable to parse query: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from decoding a flow-export datagram.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("{protocol}: packet too short (need {needed} bytes, have {have})")]
    PacketTooShort {
        protocol: &'static str,
        needed: usize,
        have: usize,
    },

    #[error("{protocol}: unsupported version {version}")]
    UnsupportedVersion {
        protocol: &'static str,
        version: u16,
    },

    #[error("{protocol}: invalid {field}: {reason}")]
    InvalidField {
        protocol: &'static str,
        field: &'static str,
        reason: String,
    },

    /// Data records arrived before the template describing them.
    #[error("{protocol}: no template {template_id} for source {source_id}")]
    UnknownTemplate {
        protocol: &'static str,
        template_id: u16,
        source_id: u32,
    },
}

/// Errors from the on-disk bucket archive.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unable to unmarshal protobuf: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Errors from parsing textual operands and rendered values.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("invalid prefix: {0}")]
    InvalidPrefix(String),
}
