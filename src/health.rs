//! `/health` endpoint.

use crate::PoolStats;
use serde::Serialize;
use std::time::Instant;

/// Pool utilisation above which the service reports itself degraded.
pub const DEGRADED_UTILIZATION: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Ok,
    Degraded,
}

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthLevel,
    /// Seconds since the service started.
    pub uptime_secs: u64,
    pub pool: PoolStats,
    pub running_jobs: usize,
    pub cached_sessions: usize,
}

/// Build a health report from live counters.
pub fn health_check(
    start_time: Instant,
    pool: PoolStats,
    running_jobs: usize,
    cached_sessions: usize,
) -> HealthReport {
    let status = if pool.utilization() > DEGRADED_UTILIZATION {
        HealthLevel::Degraded
    } else {
        HealthLevel::Ok
    };

    HealthReport {
        status,
        uptime_secs: start_time.elapsed().as_secs(),
        pool,
        running_jobs,
        cached_sessions,
    }
}
