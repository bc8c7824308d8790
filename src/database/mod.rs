//! The flow database.
//!
//! Flows live in per-(timeslot, agent) buckets behind an RW-locked map. A
//! single aggregation writer drains the input channel and is the only
//! mutator of bucket contents; a maintenance ticker archives closed buckets
//! to disk and evicts them once the cache retention expires. Queries fan
//! out one worker per timeslot over resident buckets, falling back to the
//! disk archive for evicted ones.

pub mod archive;
pub mod breakdown;
pub mod bucket;
pub mod query;
pub mod result;

pub use breakdown::{
    breakdown_labels, BreakdownFlags, BreakdownKey, BreakdownMap, ConcurrentResSum, Field,
};
pub use bucket::TimeBucket;
pub use query::{translate_query, Condition, ConditionExt, Operand, Operator, Query, QueryExt};
pub use result::QueryResult;

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::annotate::Augmenter;
use crate::avltree::Tree;
use crate::error::QueryError;
use crate::flow::Flow;
use crate::iana::Protocols;
use crate::intfmapper::IntfMapper;
use crate::stats::Stats;

/// Flows buffered between the decoders and the aggregation writer before
/// senders start blocking.
const INPUT_BUFFER: usize = 1024;

/// Upper bound on concurrent timeslot workers per query.
const MAX_QUERY_WORKERS: usize = 32;

/// One agent the database accepts flows from.
#[derive(Debug, Clone)]
pub struct AgentSpec {
    pub name: String,
    pub ip_address: IpAddr,
    /// Sample-rate override; 0 keeps the rate the exporter reported.
    pub sample_rate: u64,
}

/// Construction parameters for [`FlowDatabase`].
#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    /// Bucket width and timestamp raster, in seconds.
    pub aggregation_period: i64,
    /// How long closed buckets stay resident, in seconds.
    pub cache_time: i64,
    /// Default sample-rate multiplier applied when rendering rates.
    pub sample_rate: u64,
    /// Gzip level for archive files.
    pub compression_level: u32,
    /// Archive root directory.
    pub storage: PathBuf,
    /// Zero out source addresses before a flow enters a bucket.
    pub anonymize: bool,
    /// Run every flow through the routing augmenter.
    pub bgp_augmentation: bool,
    pub agents: Vec<AgentSpec>,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            aggregation_period: 60,
            cache_time: 1800,
            sample_rate: 1,
            compression_level: 6,
            storage: PathBuf::from("data"),
            anonymize: false,
            bgp_augmentation: false,
            agents: Vec::new(),
        }
    }
}

type BucketMap = BTreeMap<i64, HashMap<String, Arc<TimeBucket>>>;

/// The in-memory flow store and query engine.
pub struct FlowDatabase {
    aggregation: i64,
    cache_time: i64,
    sample_rate: u64,
    compression_level: u32,
    storage: PathBuf,
    anonymize: bool,
    bgp_augmentation: bool,

    flows: RwLock<BucketMap>,
    names_by_ip: HashMap<IpAddr, String>,
    rates_by_name: HashMap<String, u64>,
    agents: Vec<AgentSpec>,

    intf_mapper: Arc<dyn IntfMapper>,
    augmenter: Arc<dyn Augmenter>,
    protocols: Protocols,
    stats: Arc<Stats>,
}

impl FlowDatabase {
    pub fn new(
        settings: DatabaseSettings,
        intf_mapper: Arc<dyn IntfMapper>,
        augmenter: Arc<dyn Augmenter>,
        protocols: Protocols,
    ) -> Arc<Self> {
        let mut names_by_ip = HashMap::new();
        let mut rates_by_name = HashMap::new();
        for agent in &settings.agents {
            names_by_ip.insert(agent.ip_address, agent.name.clone());
            rates_by_name.insert(agent.name.clone(), agent.sample_rate);
        }

        Arc::new(FlowDatabase {
            aggregation: settings.aggregation_period,
            cache_time: settings.cache_time,
            sample_rate: settings.sample_rate,
            compression_level: settings.compression_level,
            storage: settings.storage,
            anonymize: settings.anonymize,
            bgp_augmentation: settings.bgp_augmentation,
            flows: RwLock::new(BTreeMap::new()),
            names_by_ip,
            rates_by_name,
            agents: settings.agents,
            intf_mapper,
            augmenter,
            protocols,
            stats: Arc::new(Stats::new()),
        })
    }

    pub fn aggregation_period(&self) -> i64 {
        self.aggregation
    }

    /// Timestamp of the bucket currently accepting writes.
    pub fn current_timeslot(&self) -> i64 {
        let now = unix_now();
        now - now % self.aggregation
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Shared handle on the counters, for the listener tasks.
    pub fn stats_arc(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    pub fn protocols(&self) -> &Protocols {
        &self.protocols
    }

    pub fn agents(&self) -> &[AgentSpec] {
        &self.agents
    }

    pub fn intf_mapper(&self) -> &dyn IntfMapper {
        self.intf_mapper.as_ref()
    }

    /// Spawn the aggregation writer and the maintenance ticker. Returns the
    /// flow input and the worker handle. The writer exits once every input
    /// sender is dropped; [`DatabaseWorkers::join`] waits for that drain.
    pub fn start(self: &Arc<Self>) -> (mpsc::Sender<Flow>, DatabaseWorkers) {
        let (tx, mut rx) = mpsc::channel(INPUT_BUFFER);

        let db = Arc::clone(self);
        let aggregator = thread::Builder::new()
            .name("aggregator".to_string())
            .spawn(move || {
                while let Some(fl) = rx.blocking_recv() {
                    db.ingest(fl);
                }
                debug!("aggregation writer stopped");
            })
            .expect("failed to spawn aggregation writer");

        let db = Arc::clone(self);
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let maintenance = thread::Builder::new()
            .name("maintenance".to_string())
            .spawn(move || {
                let period = Duration::from_secs(db.aggregation.max(1) as u64);
                loop {
                    match stop_rx.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => db.maintain(unix_now()),
                        _ => break,
                    }
                }
            })
            .expect("failed to spawn maintenance ticker");

        info!(
            aggregation = self.aggregation,
            cache_time = self.cache_time,
            "flow database started"
        );

        (
            tx,
            DatabaseWorkers {
                aggregator: Some(aggregator),
                maintenance: Some(maintenance),
                stop: Some(stop_tx),
            },
        )
    }

    /// Merge one flow into its bucket. Called from the aggregation writer;
    /// the only other callers are tests that want synchronous ingest.
    pub fn ingest(&self, mut fl: Flow) {
        let Some(agent) = self.names_by_ip.get(&fl.agent).cloned() else {
            Stats::inc(&self.stats.flows_dropped);
            debug!(agent = %fl.agent, "dropping flow from unknown agent");
            return;
        };

        if self.anonymize {
            fl.src_addr = match fl.src_addr {
                IpAddr::V4(_) => IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
                IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
            };
        }

        if let Some(&rate) = self.rates_by_name.get(&agent) {
            if rate > 0 {
                fl.samplerate = rate;
            }
        }
        if fl.samplerate == 0 {
            fl.samplerate = 1;
        }
        fl.size = fl.size.saturating_mul(fl.samplerate);

        if self.bgp_augmentation {
            self.augmenter.augment(&mut fl);
        }

        fl.timestamp -= fl.timestamp % self.aggregation;
        let ts = fl.timestamp;

        let bucket = self.bucket_for(ts, &agent);
        bucket.insert(fl);
        Stats::inc(&self.stats.flows);
    }

    fn bucket_for(&self, ts: i64, agent: &str) -> Arc<TimeBucket> {
        {
            let map = self.flows.read().unwrap();
            if let Some(bucket) = map.get(&ts).and_then(|agents| agents.get(agent)) {
                return Arc::clone(bucket);
            }
        }
        let mut map = self.flows.write().unwrap();
        Arc::clone(
            map.entry(ts)
                .or_default()
                .entry(agent.to_string())
                .or_insert_with(|| Arc::new(TimeBucket::new())),
        )
    }

    /// Archive newly closed buckets and evict expired ones. The ticker
    /// calls this with wall-clock time; tests drive it directly.
    pub fn maintain(&self, now: i64) {
        self.archive_closed(now);
        self.evict(now);
    }

    fn archive_closed(&self, now: i64) {
        // A bucket covers [ts, ts + aggregation); it is promoted once that
        // interval lies entirely before now - aggregation.
        let cutoff = now - 2 * self.aggregation;
        let jobs: Vec<(i64, String, Arc<TimeBucket>)> = {
            let map = self.flows.read().unwrap();
            map.range(..=cutoff)
                .flat_map(|(ts, agents)| {
                    agents
                        .iter()
                        .filter(|(_, b)| !b.is_archived())
                        .map(move |(agent, b)| (*ts, agent.clone(), Arc::clone(b)))
                })
                .collect()
        };

        for (ts, agent, bucket) in jobs {
            if bucket.mark_archived() {
                continue;
            }
            let flows = bucket.flows();
            match archive::write_bucket(&self.storage, ts, &agent, &flows, self.compression_level)
            {
                Ok(()) => Stats::inc(&self.stats.archive_writes),
                Err(err) => {
                    warn!(ts, agent = %agent, %err, "unable to archive bucket");
                    Stats::inc(&self.stats.archive_errors);
                }
            }
        }
    }

    fn evict(&self, now: i64) {
        let cutoff = now - self.cache_time;
        let mut map = self.flows.write().unwrap();
        let expired: Vec<i64> = map.range(..cutoff).map(|(ts, _)| *ts).collect();
        for ts in expired {
            map.remove(&ts);
            Stats::inc(&self.stats.evictions);
            debug!(ts, "evicted timeslot");
        }
    }

    /// Execute a translated query.
    pub fn run_query(&self, q: &Query) -> Result<QueryResult, QueryError> {
        Stats::inc(&self.stats.queries);

        let agent = q.agent(&self.names_by_ip)?;
        let (start, end) = q.time_range(unix_now(), self.aggregation);

        // One logical worker per timeslot in [start, end], executed on a
        // bounded pool pulling slot indices from a shared counter.
        let aggregation = self.aggregation.max(1);
        let slots = if end >= start {
            ((end - start) / aggregation + 1) as usize
        } else {
            0
        };

        let res_sum = ConcurrentResSum::default();
        let res_time: Mutex<HashMap<i64, BreakdownMap>> = Mutex::new(HashMap::new());
        let next = AtomicUsize::new(0);

        let parallelism = thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        let workers = slots.min(parallelism).min(MAX_QUERY_WORKERS).max(1);

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let idx = next.fetch_add(1, Ordering::Relaxed);
                    if idx >= slots {
                        break;
                    }
                    let ts = start + idx as i64 * aggregation;
                    if let Some(result) = self.result_for_timeslot(ts, &agent, q, &res_sum) {
                        if !result.is_empty() {
                            res_time.lock().unwrap().insert(ts, result);
                        }
                    }
                });
            }
        });

        let data = res_time.into_inner().unwrap();

        let mut top_keys = Vec::new();
        if q.top_n > 0 {
            let sums = res_sum.values.lock().unwrap();
            let mut ranking: Tree<u64, BreakdownKey> = Tree::new();
            for (key, bytes) in sums.iter() {
                ranking.insert(*bytes, key.clone());
            }
            top_keys = ranking.top_n(q.top_n);
        }

        let mut ts_tree: Tree<i64, i64> = Tree::new();
        for ts in data.keys() {
            ts_tree.insert(*ts, *ts);
        }

        Ok(QueryResult {
            top_keys,
            timestamps: ts_tree.dump(),
            data,
            aggregation: self.aggregation,
            sample_rate: self.sample_rate,
        })
    }

    fn result_for_timeslot(
        &self,
        ts: i64,
        agent: &str,
        q: &Query,
        res_sum: &ConcurrentResSum,
    ) -> Option<BreakdownMap> {
        let bucket = {
            let map = self.flows.read().unwrap();
            map.get(&ts).and_then(|agents| agents.get(agent)).cloned()
        };
        match bucket {
            Some(bucket) => Some(bucket.filter_and_breakdown(q, res_sum)),
            None => archive::load_and_breakdown(&self.storage, ts, agent, q, res_sum),
        }
    }

    /// Whether a bucket for (ts, agent) is resident in memory.
    pub fn is_resident(&self, ts: i64, agent: &str) -> bool {
        self.flows
            .read()
            .unwrap()
            .get(&ts)
            .is_some_and(|agents| agents.contains_key(agent))
    }
}

/// Join handle for the database's background threads.
pub struct DatabaseWorkers {
    aggregator: Option<thread::JoinHandle<()>>,
    maintenance: Option<thread::JoinHandle<()>>,
    stop: Option<std::sync::mpsc::Sender<()>>,
}

impl DatabaseWorkers {
    /// Block until the aggregation writer has drained the input and
    /// exited. Every input sender must be dropped first or this never
    /// returns.
    pub fn join(mut self) {
        if let Some(handle) = self.aggregator.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DatabaseWorkers {
    fn drop(&mut self) {
        self.stop.take();
        if let Some(handle) = self.maintenance.take() {
            let _ = handle.join();
        }
        // The writer blocks until its senders are gone; join it only when
        // it is already done, otherwise let it die with the process.
        if let Some(handle) = self.aggregator.take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotate::NullAugmenter;
    use crate::intfmapper::NullMapper;

    fn test_db(storage: PathBuf) -> Arc<FlowDatabase> {
        let settings = DatabaseSettings {
            storage,
            agents: vec![AgentSpec {
                name: "test01.pop01".to_string(),
                ip_address: "1.2.3.4".parse().unwrap(),
                sample_rate: 0,
            }],
            ..Default::default()
        };
        FlowDatabase::new(
            settings,
            Arc::new(NullMapper),
            Arc::new(NullAugmenter),
            Protocols::new(),
        )
    }

    fn flow(ts: i64) -> Flow {
        let mut fl = Flow::empty();
        fl.agent = "1.2.3.4".parse().unwrap();
        fl.src_addr = "10.0.0.1".parse().unwrap();
        fl.dst_addr = "30.0.0.1".parse().unwrap();
        fl.protocol = 6;
        fl.size = 1000;
        fl.samplerate = 4;
        fl.timestamp = ts;
        fl
    }

    #[test]
    fn test_ingest_aligns_and_multiplies() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db(dir.path().to_path_buf());

        db.ingest(flow(3617));

        assert!(db.is_resident(3600, "test01.pop01"));
        assert!(!db.is_resident(3617, "test01.pop01"));

        let map = db.flows.read().unwrap();
        let bucket = &map[&3600]["test01.pop01"];
        let flows = bucket.flows();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].size, 4000);
        assert_eq!(flows[0].timestamp, 3600);
    }

    #[test]
    fn test_ingest_drops_unknown_agent() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db(dir.path().to_path_buf());

        let mut fl = flow(3600);
        fl.agent = "9.9.9.9".parse().unwrap();
        db.ingest(fl);

        assert!(!db.is_resident(3600, "test01.pop01"));
        assert_eq!(db.stats().snapshot().flows_dropped, 1);
    }

    #[test]
    fn test_maintain_archives_then_evicts() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db(dir.path().to_path_buf());

        db.ingest(flow(3600));

        // Old enough to archive, too young to evict.
        db.maintain(3600 + 3 * 60);
        assert!(db.is_resident(3600, "test01.pop01"));
        assert!(archive::load_bucket(dir.path(), 3600, "test01.pop01").is_ok());
        assert_eq!(db.stats().snapshot().archive_writes, 1);

        // A second pass does not rewrite the archive.
        db.maintain(3600 + 4 * 60);
        assert_eq!(db.stats().snapshot().archive_writes, 1);

        // Past the cache retention the bucket leaves memory.
        db.maintain(3600 + 1800 + 60);
        assert!(!db.is_resident(3600, "test01.pop01"));
        assert_eq!(db.stats().snapshot().evictions, 1);
    }

    #[test]
    fn test_raster_invariant() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db(dir.path().to_path_buf());
        for ts in [3601, 3659, 3660, 7199] {
            db.ingest(flow(ts));
        }
        let map = db.flows.read().unwrap();
        for ts in map.keys() {
            assert_eq!(ts % 60, 0);
        }
    }

    #[test]
    fn test_input_channel_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db(dir.path().to_path_buf());

        let (tx, workers) = db.start();
        tx.blocking_send(flow(3600)).unwrap();
        tx.blocking_send(flow(3660)).unwrap();
        drop(tx);
        workers.join();

        assert!(db.is_resident(3600, "test01.pop01"));
        assert!(db.is_resident(3660, "test01.pop01"));
        assert_eq!(db.stats().snapshot().flows, 2);
    }
}
