//! End-to-end tests for ingest, query, top-N, and the disk archive.
//!
//! The flow set mirrors a small TCP session exchange between two /24s as
//! seen from one router: two small flows one way, two large flows back.

use std::sync::Arc;

use tflow2::annotate::NullAugmenter;
use tflow2::database::{
    translate_query, AgentSpec, ConditionExt, DatabaseSettings, Field, FlowDatabase, Query,
    QueryExt,
};
use tflow2::flow::Flow;
use tflow2::iana::Protocols;
use tflow2::intfmapper::StaticMapper;
use tflow2::BreakdownKey;

const MINUTE: i64 = 60;
const TS1: i64 = 3600;

fn test_db(storage: std::path::PathBuf, cache_time: i64) -> Arc<FlowDatabase> {
    let mut mapper = StaticMapper::new();
    mapper.add("test01.pop01", 1, "xe-0/0/1");
    mapper.add("test01.pop01", 2, "xe-0/0/2");
    mapper.add("test01.pop01", 3, "xe-0/0/3");

    let settings = DatabaseSettings {
        aggregation_period: MINUTE,
        cache_time,
        sample_rate: 1,
        compression_level: 6,
        storage,
        anonymize: false,
        bgp_augmentation: false,
        agents: vec![AgentSpec {
            name: "test01.pop01".to_string(),
            ip_address: "1.2.3.4".parse().unwrap(),
            sample_rate: 0,
        }],
    };
    FlowDatabase::new(
        settings,
        Arc::new(mapper),
        Arc::new(NullAugmenter),
        Protocols::new(),
    )
}

/// The four flows of the session: A1/A2 forward (1000 bytes, in 1 out 3),
/// A3/A4 reverse (10000 bytes, in 3 out 1), all sampled 1:4.
fn session_flows() -> Vec<Flow> {
    let mut flows = Vec::new();
    for (src, dst, src_port, dst_port, size, int_in, int_out, src_as, dst_as) in [
        ("10.0.0.1", "30.0.0.1", 12345, 443, 1000u64, 1, 3, 100, 300),
        ("10.0.0.1", "30.0.0.2", 12345, 443, 1000, 1, 3, 100, 300),
        ("30.0.0.1", "10.0.0.1", 443, 12345, 10000, 3, 1, 300, 100),
        ("30.0.0.2", "10.0.0.1", 443, 12345, 10000, 3, 1, 300, 100),
    ] {
        let mut fl = Flow::empty();
        fl.agent = "1.2.3.4".parse().unwrap();
        fl.family = 4;
        fl.src_addr = src.parse().unwrap();
        fl.dst_addr = dst.parse().unwrap();
        fl.protocol = 6;
        fl.src_port = src_port;
        fl.dst_port = dst_port;
        fl.packets = 2;
        fl.size = size;
        fl.int_in = int_in;
        fl.int_out = int_out;
        fl.next_hop = if int_out == 3 {
            "30.0.0.100".parse().unwrap()
        } else {
            "10.0.0.100".parse().unwrap()
        };
        fl.src_as = src_as;
        fl.dst_as = dst_as;
        fl.next_hop_as = dst_as;
        fl.samplerate = 4;
        fl.timestamp = TS1;
        flows.push(fl);
    }
    flows
}

fn cond(field: &str, operator: i64, operand: &str) -> ConditionExt {
    ConditionExt {
        field: field.to_string(),
        operator,
        operand: operand.to_string(),
    }
}

fn session_query(int_out: u32, top_n: usize) -> Query {
    translate_query(&QueryExt {
        cond: vec![
            cond("Agent", 0, "test01.pop01"),
            cond("Timestamp", 3, &(TS1 - 3 * MINUTE).to_string()),
            cond("Timestamp", 2, &(TS1 + MINUTE).to_string()),
            cond("IntOut", 0, &int_out.to_string()),
        ],
        breakdown: vec!["SrcAddr".to_string(), "DstAddr".to_string()],
        top_n,
    })
    .unwrap()
}

fn key(src: &str, dst: &str) -> BreakdownKey {
    let mut k = BreakdownKey::new();
    k.set(Field::SrcAddr, src);
    k.set(Field::DstAddr, dst);
    k
}

#[test]
fn test_filter_by_egress_interface() {
    let dir = tempfile::tempdir().unwrap();
    let db = test_db(dir.path().to_path_buf(), 3600);
    for fl in session_flows() {
        db.ingest(fl);
    }

    let result = db.run_query(&session_query(1, 100)).unwrap();

    assert_eq!(result.timestamps, vec![TS1]);
    assert_eq!(result.aggregation, MINUTE);

    let data = &result.data[&TS1];
    assert_eq!(data.len(), 2);
    assert_eq!(data[&key("30.0.0.1", "10.0.0.1")], 40000);
    assert_eq!(data[&key("30.0.0.2", "10.0.0.1")], 40000);

    assert_eq!(result.top_keys.len(), 2);
    assert!(result.top_keys.contains(&key("30.0.0.1", "10.0.0.1")));
    assert!(result.top_keys.contains(&key("30.0.0.2", "10.0.0.1")));
}

#[test]
fn test_filter_opposite_direction() {
    let dir = tempfile::tempdir().unwrap();
    let db = test_db(dir.path().to_path_buf(), 3600);
    for fl in session_flows() {
        db.ingest(fl);
    }

    let result = db.run_query(&session_query(3, 100)).unwrap();

    let data = &result.data[&TS1];
    assert_eq!(data.len(), 2);
    assert_eq!(data[&key("10.0.0.1", "30.0.0.1")], 4000);
    assert_eq!(data[&key("10.0.0.1", "30.0.0.2")], 4000);
}

#[test]
fn test_top_n_cut() {
    let dir = tempfile::tempdir().unwrap();
    let db = test_db(dir.path().to_path_buf(), 3600);

    let mut flows = session_flows();
    flows[0].size = 1001; // tip the first key over its sibling
    for fl in flows {
        db.ingest(fl);
    }

    let result = db.run_query(&session_query(3, 1)).unwrap();

    assert_eq!(result.top_keys, vec![key("10.0.0.1", "30.0.0.1")]);
    assert_eq!(result.data[&TS1][&key("10.0.0.1", "30.0.0.1")], 4004);
    // The runner-up stays in the data, just not in the top set.
    assert_eq!(result.data[&TS1][&key("10.0.0.1", "30.0.0.2")], 4000);
}

#[test]
fn test_query_after_eviction_hits_archive() {
    let dir = tempfile::tempdir().unwrap();
    let db = test_db(dir.path().to_path_buf(), 1800);
    for fl in session_flows() {
        db.ingest(fl);
    }

    let query = session_query(1, 100);
    let before = db.run_query(&query).unwrap();
    assert_eq!(before.timestamps, vec![TS1]);

    // Close and archive the bucket, then age it out of memory.
    db.maintain(TS1 + 3 * MINUTE);
    assert!(db.is_resident(TS1, "test01.pop01"));
    db.maintain(TS1 + 1800 + MINUTE);
    assert!(!db.is_resident(TS1, "test01.pop01"));

    let after = db.run_query(&query).unwrap();
    assert_eq!(after.timestamps, before.timestamps);
    assert_eq!(after.data, before.data);
    assert_eq!(after.top_keys.len(), before.top_keys.len());
}

#[test]
fn test_breakdown_key_stability() {
    let mut forward = BreakdownKey::new();
    forward.set(Field::SrcAddr, "10.0.0.1");
    forward.set(Field::DstAddr, "30.0.0.1");
    forward.set(Field::Protocol, "6");
    forward.set(Field::SrcPort, "12345");

    let mut reverse = BreakdownKey::new();
    reverse.set(Field::SrcPort, "12345");
    reverse.set(Field::Protocol, "6");
    reverse.set(Field::DstAddr, "30.0.0.1");
    reverse.set(Field::SrcAddr, "10.0.0.1");

    assert_eq!(forward.to_string(), reverse.to_string());
    assert_eq!(
        forward.to_string(),
        "SrcAddr:10.0.0.1,DstAddr:30.0.0.1,Protocol:6,SrcPort:12345"
    );
}

#[test]
fn test_intersection_and_any_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let db = test_db(dir.path().to_path_buf(), 3600);

    let mut f1 = Flow::empty();
    f1.agent = "1.2.3.4".parse().unwrap();
    f1.src_addr = "10.0.0.1".parse().unwrap();
    f1.dst_addr = "30.0.0.1".parse().unwrap();
    f1.protocol = 6;
    f1.int_in = 1;
    f1.size = 100;
    f1.samplerate = 1;
    f1.timestamp = TS1;

    let mut f2 = f1.clone();
    f2.src_addr = "10.0.0.2".parse().unwrap();
    f2.int_in = 2;

    db.ingest(f1);
    db.ingest(f2);

    let base = vec![
        cond("Agent", 0, "test01.pop01"),
        cond("Timestamp", 3, &(TS1 - MINUTE).to_string()),
        cond("Timestamp", 2, &(TS1 + MINUTE).to_string()),
    ];

    // protocol=6 AND intIn=1 selects exactly f1
    let mut conds = base.clone();
    conds.push(cond("Protocol", 0, "6"));
    conds.push(cond("IntIn", 0, "1"));
    let q = translate_query(&QueryExt {
        cond: conds,
        breakdown: vec!["SrcAddr".to_string()],
        top_n: 0,
    })
    .unwrap();
    let result = db.run_query(&q).unwrap();
    let data = &result.data[&TS1];
    assert_eq!(data.len(), 1);
    let mut k1 = BreakdownKey::new();
    k1.set(Field::SrcAddr, "10.0.0.1");
    assert_eq!(data[&k1], 100);

    // protocol=17 matches nothing
    let mut conds = base.clone();
    conds.push(cond("Protocol", 0, "17"));
    let q = translate_query(&QueryExt {
        cond: conds,
        breakdown: vec!["SrcAddr".to_string()],
        top_n: 0,
    })
    .unwrap();
    let result = db.run_query(&q).unwrap();
    assert!(result.data.is_empty());
    assert!(result.timestamps.is_empty());

    // no equality criteria: every flow in range comes back
    let q = translate_query(&QueryExt {
        cond: base,
        breakdown: vec!["SrcAddr".to_string()],
        top_n: 0,
    })
    .unwrap();
    let result = db.run_query(&q).unwrap();
    assert_eq!(result.data[&TS1].len(), 2);
}

#[test]
fn test_missing_agent_criterion() {
    let dir = tempfile::tempdir().unwrap();
    let db = test_db(dir.path().to_path_buf(), 3600);

    let q = translate_query(&QueryExt {
        cond: vec![cond("Timestamp", 0, &TS1.to_string())],
        breakdown: vec!["SrcAddr".to_string()],
        top_n: 0,
    })
    .unwrap();

    let err = db.run_query(&q).unwrap_err();
    assert_eq!(err.to_string(), "Agent criteria not found");
}

#[test]
fn test_ingest_through_input_channel() {
    let dir = tempfile::tempdir().unwrap();
    let db = test_db(dir.path().to_path_buf(), 3600);

    let (tx, workers) = db.start();
    for fl in session_flows() {
        tx.blocking_send(fl).unwrap();
    }
    drop(tx);
    workers.join(); // blocks until the writer has merged everything

    let result = db.run_query(&session_query(1, 100)).unwrap();
    assert_eq!(result.timestamps, vec![TS1]);
    assert_eq!(result.data[&TS1].len(), 2);
}

#[test]
fn test_csv_round_trip_preserves_counts() {
    let dir = tempfile::tempdir().unwrap();
    let db = test_db(dir.path().to_path_buf(), 3600);
    for fl in session_flows() {
        db.ingest(fl);
    }

    let result = db.run_query(&session_query(1, 100)).unwrap();
    let mut out = Vec::new();
    result.write_csv(&mut out).unwrap();

    let mut reader = csv::Reader::from_reader(out.as_slice());
    let headers = reader.headers().unwrap().clone();
    assert_eq!(&headers[0], "Time");
    assert_eq!(&headers[headers.len() - 1], "Rest");

    let records: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
    assert_eq!(records.len(), 1);

    // 40000 bytes / 60 s * 8 bit * rate 1 = 5328 bps per top key.
    for idx in 1..headers.len() - 1 {
        assert_eq!(&records[0][idx], "5328");
    }
    assert_eq!(&records[0][headers.len() - 1], "0");
}
