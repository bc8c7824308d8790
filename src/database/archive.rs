//! On-disk bucket archive.
//!
//! One file per (timeslot, agent), gzip-compressed protobuf, laid out as
//! `{storage}/{YYYY-MM-DD}/nf-{ts}-{agent}.tflow2.pb.gzip`. Writes go to a
//! temp file first and are renamed into place. The loader is a read-through
//! for evicted timeslots; it never repopulates the in-memory map.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::DateTime;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;

use crate::avltree::Tree;
use crate::database::breakdown::{breakdown, BreakdownMap, ConcurrentResSum};
use crate::database::query::{validate_flow, Query};
use crate::error::ArchiveError;
use crate::flow::Flow;
use crate::proto;

/// Archive file for one (timeslot, agent) bucket.
pub fn archive_path(storage: &Path, ts: i64, agent: &str) -> PathBuf {
    let day = DateTime::from_timestamp(ts, 0)
        .map(|t| t.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "1970-01-01".to_string());
    storage
        .join(day)
        .join(format!("nf-{ts}-{agent}.tflow2.pb.gzip"))
}

/// Serialize, compress and atomically persist a bucket's flows.
pub fn write_bucket(
    storage: &Path,
    ts: i64,
    agent: &str,
    flows: &[Arc<Flow>],
    level: u32,
) -> Result<(), ArchiveError> {
    let path = archive_path(storage, ts, agent);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let buf = proto::encode_flows(flows);

    let tmp = path.with_extension("gzip.tmp");
    let file = File::create(&tmp)?;
    let mut encoder = GzEncoder::new(file, Compression::new(level));
    encoder.write_all(&buf)?;
    encoder.finish()?;
    fs::rename(&tmp, &path)?;

    debug!(ts, agent, flows = flows.len(), "archived bucket");
    Ok(())
}

/// Read a bucket archive back into flow records.
pub fn load_bucket(storage: &Path, ts: i64, agent: &str) -> Result<Vec<Flow>, ArchiveError> {
    let path = archive_path(storage, ts, agent);
    let file = File::open(&path)?;
    let mut decoder = GzDecoder::new(file);
    let mut buf = Vec::new();
    decoder.read_to_end(&mut buf)?;
    Ok(proto::decode_flows(&buf)?)
}

/// Load one archived timeslot, keep the flows matching the query, and run
/// the breakdown over them. `None` when the file is missing or unreadable;
/// the caller treats the timeslot as absent.
pub fn load_and_breakdown(
    storage: &Path,
    ts: i64,
    agent: &str,
    q: &Query,
    res_sum: &ConcurrentResSum,
) -> Option<BreakdownMap> {
    let flows = match load_bucket(storage, ts, agent) {
        Ok(flows) => flows,
        Err(err) => {
            debug!(ts, agent, %err, "no archive for timeslot");
            return None;
        }
    };

    let mut tree: Tree<u64, Arc<Flow>> = Tree::new();
    for (seq, fl) in flows.into_iter().enumerate() {
        if validate_flow(&fl, q) {
            tree.insert(seq as u64, Arc::new(fl));
        }
    }

    let mut res_time = BreakdownMap::new();
    tree.each(|_, fl| breakdown(fl, &q.breakdown, res_sum, &mut res_time));
    Some(res_time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::query::{translate_query, ConditionExt, QueryExt};

    fn sample_flows() -> Vec<Arc<Flow>> {
        let mut a = Flow::empty();
        a.src_addr = "10.0.0.1".parse().unwrap();
        a.dst_addr = "30.0.0.1".parse().unwrap();
        a.protocol = 6;
        a.size = 4000;
        a.timestamp = 3600;

        let mut b = a.clone();
        b.src_addr = "10.0.0.2".parse().unwrap();
        b.protocol = 17;

        vec![Arc::new(a), Arc::new(b)]
    }

    #[test]
    fn test_archive_path_layout() {
        let path = archive_path(Path::new("data"), 1500000000, "test01.pop01");
        assert_eq!(
            path,
            PathBuf::from("data/2017-07-14/nf-1500000000-test01.pop01.tflow2.pb.gzip")
        );
    }

    #[test]
    fn test_write_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let flows = sample_flows();
        write_bucket(dir.path(), 3600, "test01.pop01", &flows, 6).unwrap();

        let loaded = load_bucket(dir.path(), 3600, "test01.pop01").unwrap();
        let expected: Vec<Flow> = flows.iter().map(|f| f.as_ref().clone()).collect();
        assert_eq!(loaded, expected);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_bucket(dir.path(), 3600, "nobody").is_err());
    }

    #[test]
    fn test_load_and_breakdown_filters() {
        let dir = tempfile::tempdir().unwrap();
        write_bucket(dir.path(), 3600, "test01.pop01", &sample_flows(), 6).unwrap();

        let q = translate_query(&QueryExt {
            cond: vec![ConditionExt {
                field: "Protocol".to_string(),
                operator: 0,
                operand: "6".to_string(),
            }],
            breakdown: vec!["SrcAddr".to_string()],
            top_n: 0,
        })
        .unwrap();

        let sums = ConcurrentResSum::default();
        let res = load_and_breakdown(dir.path(), 3600, "test01.pop01", &q, &sums).unwrap();
        assert_eq!(res.len(), 1);
        assert_eq!(res.values().sum::<u64>(), 4000);
    }

    #[test]
    fn test_corrupt_archive_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = archive_path(dir.path(), 3600, "bad");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"not gzip at all").unwrap();
        assert!(load_bucket(dir.path(), 3600, "bad").is_err());
    }
}
