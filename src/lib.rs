//! # tflow2
//!
//! Network-flow telemetry collector and query engine.
//!
//! Routers export sampled flow records over NetFlow v9, IPFIX or sFlow v5;
//! tflow2 normalizes them into a common record, keeps a rolling window of
//! recent flows in memory indexed for interactive multi-dimensional
//! queries, and spills closed time buckets to compressed on-disk archives
//! so older ranges stay queryable. Results come back as top-N breakdown
//! tables (CSV) and as Prometheus gauges.
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                              tflow2                                 |
//! +---------------------------------------------------------------------+
//! |  decode/     - NetFlow v9, IPFIX, sFlow v5 UDP decoders             |
//! |  database/   - time buckets, field indices, query engine, archive   |
//! |  avltree     - ordered map behind the indices and top-N ranking     |
//! |  frontend/   - HTTP: /query (CSV), /metrics (Prometheus), JSON      |
//! |  config      - YAML configuration                                   |
//! |  flow        - the normalized flow record                           |
//! |  proto       - protobuf archive format                              |
//! |  annotate    - BGP augmentation seam                                |
//! |  intfmapper  - interface-name mapping seam                          |
//! +---------------------------------------------------------------------+
//! ```
//!
//! Flow of data: decoders push normalized records onto the database input
//! channel; a single aggregation writer merges them into per-(timeslot,
//! agent) buckets and maintains the per-field indices; a maintenance
//! ticker archives closed buckets and evicts them after the cache
//! retention. Queries fan out one worker per timeslot, intersect the
//! candidate index trees, and aggregate breakdowns into a shared sum used
//! for the top-N cut.

pub mod annotate;
pub mod avltree;
pub mod config;
pub mod database;
pub mod decode;
pub mod error;
pub mod flow;
pub mod frontend;
pub mod iana;
pub mod intfmapper;
pub mod proto;
pub mod stats;

pub use config::Config;
pub use database::{
    translate_query, BreakdownFlags, BreakdownKey, BreakdownMap, DatabaseSettings, Field,
    FlowDatabase, Query, QueryExt, QueryResult,
};
pub use error::{ArchiveError, ConfigError, DecodeError, QueryError};
pub use flow::{Flow, Prefix};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
