//! Wall-clock timing report for the run, per `SPEC_FULL.md` §2 (supplemented
//! feature: a `--timing-report` summary of hook/runner durations, in the
//! spirit of the original tool's per-linter timing report).

use crate::Result;
use serde::Serialize;
use std::sync::Arc;
use std::{collections::BTreeMap, path::PathBuf, sync::Mutex as StdMutex, time::Instant};

#[derive(Debug)]
pub struct TimingRecorder {
    start_instant: Instant,
    intervals_by_label: StdMutex<BTreeMap<String, Vec<(u128, u128)>>>,
    output_path: Option<PathBuf>,
}

#[derive(Debug, Serialize, Clone)]
struct TimingReportTotal {
    wall_time_ms: u128,
}

#[derive(Debug, Serialize, Clone)]
struct TimingReportJson {
    total: TimingReportTotal,
    labels: BTreeMap<String, TimingReportEntry>,
}

#[derive(Debug, Serialize, Clone)]
struct TimingReportEntry {
    wall_time_ms: u128,
}

impl TimingRecorder {
    pub fn new(output_path: Option<PathBuf>) -> Self {
        Self { start_instant: Instant::now(), intervals_by_label: StdMutex::new(BTreeMap::new()), output_path }
    }

    pub fn now_ms(&self) -> u128 {
        self.start_instant.elapsed().as_millis()
    }

    pub fn add_interval(&self, label: &str, start_ms: u128, end_ms: u128) {
        if end_ms < start_ms {
            return;
        }
        let mut map = self.intervals_by_label.lock().unwrap();
        map.entry(label.to_string()).or_default().push((start_ms, end_ms));
    }

    fn merge_and_sum(intervals: &mut [(u128, u128)]) -> u128 {
        if intervals.is_empty() {
            return 0;
        }
        intervals.sort_by_key(|(s, e)| (*s, *e));
        let mut total: u128 = 0;
        let mut cur = intervals[0];
        for &(s, e) in intervals.iter().skip(1) {
            if s <= cur.1 {
                if e > cur.1 {
                    cur.1 = e;
                }
            } else {
                total += cur.1 - cur.0;
                cur = (s, e);
            }
        }
        total += cur.1 - cur.0;
        total
    }

    fn build_report(&self) -> TimingReportJson {
        let elapsed_ms = self.start_instant.elapsed().as_millis();
        let mut labels: BTreeMap<String, TimingReportEntry> = BTreeMap::new();
        let mut map = self.intervals_by_label.lock().unwrap();
        for (name, intervals) in map.iter_mut() {
            let wall_ms = Self::merge_and_sum(intervals.as_mut_slice());
            labels.insert(name.clone(), TimingReportEntry { wall_time_ms: wall_ms });
        }
        TimingReportJson { total: TimingReportTotal { wall_time_ms: elapsed_ms }, labels }
    }

    pub fn write_json(&self) -> Result<()> {
        let Some(output_path) = &self.output_path else {
            return Ok(());
        };
        let json = self.build_report();
        let data = serde_json::to_vec_pretty(&json)?;
        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(output_path, &data)?;
        Ok(())
    }

    pub fn to_json_string(&self) -> Result<String> {
        let json = self.build_report();
        let s = serde_json::to_string_pretty(&json)?;
        Ok(s)
    }
}

/// Records one hook or runner invocation's wall-clock span when dropped
/// (or explicitly finished).
#[derive(Debug)]
pub struct TimingGuard {
    recorder: Arc<TimingRecorder>,
    label: String,
    start_ms: u128,
}

impl TimingGuard {
    pub fn new(recorder: Arc<TimingRecorder>, label: impl Into<String>) -> Self {
        let start_ms = recorder.now_ms();
        Self { recorder, label: label.into(), start_ms }
    }

    pub fn finish(self) {
        let end_ms = self.recorder.now_ms();
        self.recorder.add_interval(&self.label, self.start_ms, end_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_intervals_merge_without_double_counting() {
        let recorder = TimingRecorder::new(None);
        recorder.add_interval("runner_a", 0, 100);
        recorder.add_interval("runner_a", 50, 150);
        let report = recorder.build_report();
        assert_eq!(report.labels["runner_a"].wall_time_ms, 150);
    }
}
