//! Capture metrics and the Prometheus recorder behind `/metrics`.
//!
//! [`Metrics`] holds pre-registered handles so hot paths never look metrics up
//! by name. Handles bind to whatever recorder is installed when
//! [`Metrics::new`] runs; without one they are no-ops.

use crate::{CaptureError, PoolStats};
use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use tracing::info;

/// Pages captured successfully (counter).
pub const PAGES_CAPTURED_TOTAL: &str = "capture_pages_captured_total";
/// Pages recorded as failed artifacts (counter).
pub const PAGES_FAILED_TOTAL: &str = "capture_pages_failed_total";
/// Navigation retries after a transient failure (counter).
pub const NAVIGATION_RETRIES_TOTAL: &str = "capture_navigation_retries_total";
/// Per-page capture duration seconds (histogram).
pub const PAGE_DURATION_SECONDS: &str = "capture_page_duration_seconds";
/// Jobs finished (counter, labels: outcome).
pub const JOBS_TOTAL: &str = "capture_jobs_total";
/// Job wall-clock duration seconds (histogram).
pub const JOB_DURATION_SECONDS: &str = "capture_job_duration_seconds";
/// Jobs currently running (gauge).
pub const JOBS_RUNNING: &str = "capture_jobs_running";
/// Browser processes launched (counter).
pub const POOL_LAUNCHES_TOTAL: &str = "capture_pool_launches_total";
/// Idle instances evicted to make room (counter).
pub const POOL_EVICTIONS_TOTAL: &str = "capture_pool_evictions_total";
/// Instances closed by the idle sweep (counter).
pub const POOL_SWEPT_TOTAL: &str = "capture_pool_swept_total";
/// Live browser instances (gauge).
pub const POOL_ACTIVE: &str = "capture_pool_active";
/// Instances currently lent to a job (gauge).
pub const POOL_LEASED: &str = "capture_pool_leased";
/// Durable store writes that failed after every retry (counter).
pub const STORE_WRITE_FAILURES_TOTAL: &str = "capture_store_write_failures_total";

/// Install the Prometheus recorder globally and return the render handle.
pub fn install_recorder() -> Result<PrometheusHandle, CaptureError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| CaptureError::Configuration(format!("metrics recorder: {e}")))?;
    info!("Prometheus metrics recorder installed");
    Ok(handle)
}

/// Job outcome label values.
#[derive(Debug, Clone, Copy)]
pub enum JobOutcome {
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl JobOutcome {
    fn label(self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Failed => "failed",
            JobOutcome::Cancelled => "cancelled",
            JobOutcome::TimedOut => "timed_out",
        }
    }
}

pub struct Metrics {
    pub pages_captured: Counter,
    pub pages_failed: Counter,
    pub navigation_retries: Counter,
    pub page_duration: Histogram,
    pub job_duration: Histogram,
    pub jobs_running: Gauge,
    pub pool_launches: Counter,
    pub pool_evictions: Counter,
    pub pool_swept: Counter,
    pub pool_active: Gauge,
    pub pool_leased: Gauge,
    pub store_write_failures: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            pages_captured: counter!(PAGES_CAPTURED_TOTAL),
            pages_failed: counter!(PAGES_FAILED_TOTAL),
            navigation_retries: counter!(NAVIGATION_RETRIES_TOTAL),
            page_duration: histogram!(PAGE_DURATION_SECONDS),
            job_duration: histogram!(JOB_DURATION_SECONDS),
            jobs_running: gauge!(JOBS_RUNNING),
            pool_launches: counter!(POOL_LAUNCHES_TOTAL),
            pool_evictions: counter!(POOL_EVICTIONS_TOTAL),
            pool_swept: counter!(POOL_SWEPT_TOTAL),
            pool_active: gauge!(POOL_ACTIVE),
            pool_leased: gauge!(POOL_LEASED),
            store_write_failures: counter!(STORE_WRITE_FAILURES_TOTAL),
        }
    }

    pub fn record_page(&self, duration: Duration, success: bool) {
        if success {
            self.pages_captured.increment(1);
        } else {
            self.pages_failed.increment(1);
        }
        self.page_duration.record(duration.as_secs_f64());
    }

    pub fn record_job(&self, duration: Duration, outcome: JobOutcome) {
        counter!(JOBS_TOTAL, "outcome" => outcome.label()).increment(1);
        self.job_duration.record(duration.as_secs_f64());
    }

    pub fn record_pool(&self, stats: &PoolStats) {
        self.pool_active.set(stats.active as f64);
        self.pool_leased.set(stats.leased as f64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
