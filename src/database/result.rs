//! Query results and their CSV rendering.

use std::collections::{HashMap, HashSet};
use std::io;

use chrono::DateTime;

use crate::database::breakdown::{BreakdownKey, BreakdownMap};

/// The outcome of a query: the top keys over the whole range, plus the
/// per-timeslot breakdown maps for every timeslot that produced data.
#[derive(Debug, Default)]
pub struct QueryResult {
    /// Keys with the largest byte volumes, largest first. Empty when the
    /// query asked for no top-N cut.
    pub top_keys: Vec<BreakdownKey>,
    /// Timeslots that produced data, ascending.
    pub timestamps: Vec<i64>,
    pub data: HashMap<i64, BreakdownMap>,
    pub aggregation: i64,
    pub sample_rate: u64,
}

impl QueryResult {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Scale a summed byte count to bits per second over the aggregation
    /// interval.
    fn rate(&self, bytes: u64) -> u64 {
        bytes / self.aggregation.max(1) as u64 * 8 * self.sample_rate
    }

    /// One header row `Time,<key>,...,Rest`, one row per timeslot with
    /// bits-per-second cells; non-top keys are folded into `Rest`.
    pub fn write_csv<W: io::Write>(&self, out: W) -> csv::Result<()> {
        let mut w = csv::Writer::from_writer(out);

        let mut header = Vec::with_capacity(self.top_keys.len() + 2);
        header.push("Time".to_string());
        for key in &self.top_keys {
            header.push(key.to_string());
        }
        header.push("Rest".to_string());
        w.write_record(&header)?;

        let top: HashSet<&BreakdownKey> = self.top_keys.iter().collect();
        let empty = BreakdownMap::new();

        for &ts in &self.timestamps {
            let buckets = self.data.get(&ts).unwrap_or(&empty);
            let mut line = Vec::with_capacity(header.len());

            let time = DateTime::from_timestamp(ts, 0)
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_else(|| ts.to_string());
            line.push(time);

            for key in &self.top_keys {
                match buckets.get(key) {
                    Some(v) => line.push(self.rate(*v).to_string()),
                    None => line.push("0".to_string()),
                }
            }

            let rest: u64 = buckets
                .iter()
                .filter(|(k, _)| !top.contains(k))
                .map(|(_, v)| *v)
                .sum();
            line.push(rest.to_string());

            w.write_record(&line)?;
        }

        w.flush()?;
        Ok(())
    }
}
