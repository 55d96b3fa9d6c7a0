//! Training speed monitoring.
//!
//! Every finished task contributes a sample of processed records. Samples are kept in a window
//! bounded both by count & by age, from which the current throughput is estimated.


use std::collections::{BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

pub const METRIC_TRAINING_SPEED: &str = "elastic_training_speed";

/// The number of sub-windows whose rates are compared to judge stability.
const STABILITY_CHUNKS: usize = 3;

/// The tuning of the speed monitor.
#[derive(Clone, Debug, PartialEq)]
pub struct SpeedConfig {
    /// The max number of samples held.
    pub window_size: usize,
    /// The max age of a sample relative to the newest one.
    pub window: Duration,
    /// The number of samples needed before the speed may be judged stable.
    pub min_samples: usize,
    /// The max coefficient of variation of the sub-window rates of a stable speed.
    pub stable_threshold: f64,
}

/// A completed task.
#[derive(Clone, Copy, Debug)]
pub struct SpeedSample {
    pub at: Instant,
    pub records: u64,
}

/// A point in time summary of the training speed.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SpeedReport {
    /// Records per second over the current window.
    pub speed: f64,
    pub stable: bool,
    pub running_workers: usize,
    pub completed_tasks: u64,
    pub processed_records: u64,
}

#[derive(Default)]
struct SpeedState {
    samples: VecDeque<SpeedSample>,
    running_workers: BTreeSet<String>,
    completed_tasks: u64,
    processed_records: u64,
}

/// A monitor of the training throughput of the job.
pub struct SpeedMonitor {
    config: SpeedConfig,
    state: Mutex<SpeedState>,
}

impl SpeedMonitor {
    /// Create a new instance.
    pub fn new(config: SpeedConfig) -> Self {
        metrics::describe_gauge!(METRIC_TRAINING_SPEED, "records processed per second");
        Self {
            config,
            state: Mutex::new(SpeedState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SpeedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a finished task of the given number of records.
    pub fn collect(&self, at: Instant, records: u64) {
        let speed = {
            let mut state = self.lock();
            state.completed_tasks += 1;
            state.processed_records += records;
            // Reports are timestamped before the lock is taken, so they may arrive out of order.
            let idx = state.samples.partition_point(|sample| sample.at <= at);
            state.samples.insert(idx, SpeedSample { at, records });
            self.evict(&mut state.samples);
            speed_of(state.samples.iter())
        };
        metrics::gauge!(METRIC_TRAINING_SPEED, speed);
    }

    fn evict(&self, samples: &mut VecDeque<SpeedSample>) {
        while samples.len() > self.config.window_size.max(2) {
            samples.pop_front();
        }
        let newest = match samples.back() {
            Some(sample) => sample.at,
            None => return,
        };
        while samples.len() > 2 && samples.front().map(|sample| newest.duration_since(sample.at) > self.config.window).unwrap_or(false) {
            samples.pop_front();
        }
    }

    /// Records per second over the current window, 0 until two samples are held.
    pub fn current_speed(&self) -> f64 {
        speed_of(self.lock().samples.iter())
    }

    /// Whether the throughput has settled.
    ///
    /// The window is cut into sub-windows, and the speed is stable once enough samples are held
    /// and the coefficient of variation of the sub-window rates is below the threshold.
    pub fn is_stable(&self) -> bool {
        let state = self.lock();
        if state.samples.len() < self.config.min_samples.max(STABILITY_CHUNKS * 2) {
            return false;
        }
        let samples: Vec<SpeedSample> = state.samples.iter().copied().collect();
        let chunk_len = samples.len() / STABILITY_CHUNKS;
        let rates: Vec<f64> = samples
            .chunks(chunk_len)
            .filter(|chunk| chunk.len() >= 2)
            .map(|chunk| speed_of(chunk.iter()))
            .filter(|rate| *rate > 0.0)
            .collect();
        if rates.len() < 2 {
            return false;
        }
        let mean = rates.iter().sum::<f64>() / rates.len() as f64;
        let variance = rates.iter().map(|rate| (rate - mean).powi(2)).sum::<f64>() / rates.len() as f64;
        variance.sqrt() / mean < self.config.stable_threshold
    }

    /// Track a newly running worker, returning `false` if it was already tracked.
    ///
    /// Any change of the running workers resets the sample window.
    pub fn add_running_worker(&self, worker: &str) -> bool {
        let mut state = self.lock();
        let added = state.running_workers.insert(worker.to_string());
        if added {
            state.samples.clear();
        }
        added
    }

    /// Stop tracking a worker, returning `false` if it was not tracked.
    pub fn remove_running_worker(&self, worker: &str) -> bool {
        let mut state = self.lock();
        let removed = state.running_workers.remove(worker);
        if removed {
            state.samples.clear();
        }
        removed
    }

    pub fn running_workers(&self) -> usize {
        self.lock().running_workers.len()
    }

    pub fn report(&self) -> SpeedReport {
        let stable = self.is_stable();
        let state = self.lock();
        SpeedReport {
            speed: speed_of(state.samples.iter()),
            stable,
            running_workers: state.running_workers.len(),
            completed_tasks: state.completed_tasks,
            processed_records: state.processed_records,
        }
    }
}

/// Records per second between the first & last of the given time ordered samples.
///
/// The records of the first sample were processed before the measured interval began.
fn speed_of<'a>(samples: impl Iterator<Item = &'a SpeedSample>) -> f64 {
    let mut first = None;
    let mut last = None;
    let mut records = 0;
    for sample in samples {
        match first {
            None => first = Some(sample.at),
            Some(_) => records += sample.records,
        }
        last = Some(sample.at);
    }
    let elapsed = match (first, last) {
        (Some(first), Some(last)) => last.duration_since(first).as_secs_f64(),
        _ => return 0.0,
    };
    if elapsed <= 0.0 {
        return 0.0;
    }
    records as f64 / elapsed
}
