//! Process-local counters for jobs and catalog refreshes. The server renders
//! them in Prometheus text format; nothing here does I/O.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use keel_common::JobStatus;

/// Upper bounds (seconds) for job durations.
pub const JOB_DURATION_BUCKETS: &[f64] = &[1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0, 7200.0];

/// Upper bounds (seconds) for catalog refreshes.
pub const REFRESH_DURATION_BUCKETS: &[f64] = &[0.01, 0.05, 0.25, 1.0, 5.0, 15.0, 30.0];

/// Fixed-bucket histogram over durations.
#[derive(Debug)]
pub struct Histogram {
    bounds: &'static [f64],
    buckets: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistogramSnapshot {
    /// `(upper bound, cumulative count)` per bucket, without `+Inf`.
    pub buckets: Vec<(f64, u64)>,
    pub sum_secs: f64,
    pub count: u64,
}

impl Histogram {
    pub fn new(bounds: &'static [f64]) -> Self {
        Self {
            bounds,
            buckets: bounds.iter().map(|_| AtomicU64::new(0)).collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if let Some(i) = self.bounds.iter().position(|b| secs <= *b) {
            self.buckets[i].fetch_add(1, Ordering::Relaxed);
        }
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let mut cumulative = 0;
        let buckets = self
            .bounds
            .iter()
            .zip(&self.buckets)
            .map(|(bound, n)| {
                cumulative += n.load(Ordering::Relaxed);
                (*bound, cumulative)
            })
            .collect();
        HistogramSnapshot {
            buckets,
            sum_secs: self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            count: self.count.load(Ordering::Relaxed),
        }
    }
}

const TERMINAL: [JobStatus; 3] = [JobStatus::Done, JobStatus::Failed, JobStatus::Cancelled];

fn terminal_slot(status: JobStatus) -> Option<usize> {
    TERMINAL.iter().position(|s| *s == status)
}

/// Terminal transitions and attempt durations, per final status.
#[derive(Debug)]
pub struct JobMetrics {
    status_total: [AtomicU64; 3],
    durations: [Histogram; 3],
}

impl Default for JobMetrics {
    fn default() -> Self {
        Self {
            status_total: Default::default(),
            durations: [
                Histogram::new(JOB_DURATION_BUCKETS),
                Histogram::new(JOB_DURATION_BUCKETS),
                Histogram::new(JOB_DURATION_BUCKETS),
            ],
        }
    }
}

impl JobMetrics {
    pub fn terminal_statuses() -> &'static [JobStatus] {
        &TERMINAL
    }

    /// Count a committed move into a terminal state. Non-terminal statuses are ignored.
    pub fn record_status(&self, status: JobStatus) {
        if let Some(i) = terminal_slot(status) {
            self.status_total[i].fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record how long an executed attempt took, labelled by where the job ended up.
    pub fn observe_attempt(&self, status: JobStatus, elapsed: Duration) {
        if let Some(i) = terminal_slot(status) {
            self.durations[i].observe(elapsed);
        }
    }

    pub fn status_total(&self, status: JobStatus) -> u64 {
        terminal_slot(status)
            .map(|i| self.status_total[i].load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn duration(&self, status: JobStatus) -> Option<HistogramSnapshot> {
        terminal_slot(status).map(|i| self.durations[i].snapshot())
    }
}

/// Outcome of catalog reads against the source.
#[derive(Debug)]
pub struct CatalogMetrics {
    pub refresh_success: AtomicU64,
    pub refresh_failed: AtomicU64,
    /// Models held after the most recent successful refresh (gauge).
    pub models_cached: AtomicU64,
    pub refresh_duration: Histogram,
}

impl Default for CatalogMetrics {
    fn default() -> Self {
        Self {
            refresh_success: AtomicU64::new(0),
            refresh_failed: AtomicU64::new(0),
            models_cached: AtomicU64::new(0),
            refresh_duration: Histogram::new(REFRESH_DURATION_BUCKETS),
        }
    }
}

impl CatalogMetrics {
    pub fn observe_refresh(&self, elapsed: Duration, models: Option<usize>) {
        self.refresh_duration.observe(elapsed);
        match models {
            Some(count) => {
                self.refresh_success.fetch_add(1, Ordering::Relaxed);
                self.models_cached.store(count as u64, Ordering::Relaxed);
            }
            None => {
                self.refresh_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
