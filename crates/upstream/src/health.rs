//! Rolling connection health, process-local and never persisted.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Consecutive failures after which the channel counts as unhealthy.
const UNHEALTHY_AFTER: u32 = 5;

#[derive(Debug, Default)]
struct HealthInner {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    consecutive_failures: u32,
    last_success_at: Option<DateTime<Utc>>,
    last_health_check_at: Option<DateTime<Utc>>,
}

/// Rolling counters over every outbound call, shared by the request path and
/// the keepalive/recovery loops.
#[derive(Debug, Default)]
pub struct ConnectionHealth {
    inner: Mutex<HealthInner>,
}

impl ConnectionHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_requests += 1;
        inner.successful_requests += 1;
        inner.consecutive_failures = 0;
        inner.last_success_at = Some(Utc::now());
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_requests += 1;
        inner.failed_requests += 1;
        inner.consecutive_failures += 1;
    }

    pub fn record_health_check(&self) {
        self.inner.lock().unwrap().last_health_check_at = Some(Utc::now());
    }

    /// Reset after a forced reconnect.
    pub fn reset(&self) {
        *self.inner.lock().unwrap() = HealthInner::default();
    }

    pub fn is_healthy(&self) -> bool {
        self.inner.lock().unwrap().consecutive_failures < UNHEALTHY_AFTER
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().unwrap().consecutive_failures
    }

    /// Snapshot for observability; no side effects.
    pub fn snapshot(
        &self,
        has_valid_session: bool,
        session_seconds_remaining: Option<i64>,
    ) -> HealthSnapshot {
        let inner = self.inner.lock().unwrap();
        let success_rate = if inner.total_requests == 0 {
            100.0
        } else {
            inner.successful_requests as f64 * 100.0 / inner.total_requests as f64
        };
        HealthSnapshot {
            is_healthy: inner.consecutive_failures < UNHEALTHY_AFTER,
            has_valid_session,
            total_requests: inner.total_requests,
            successful_requests: inner.successful_requests,
            failed_requests: inner.failed_requests,
            consecutive_failures: inner.consecutive_failures,
            success_rate_percentage: (success_rate * 100.0).round() / 100.0,
            session_seconds_remaining,
            last_success_at: inner.last_success_at,
            last_health_check_at: inner.last_health_check_at,
        }
    }
}

/// Point-in-time view of the connection state.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub is_healthy: bool,
    pub has_valid_session: bool,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub consecutive_failures: u32,
    pub success_rate_percentage: f64,
    pub session_seconds_remaining: Option<i64>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_health_check_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unhealthy_after_consecutive_failures() {
        let health = ConnectionHealth::new();
        assert!(health.is_healthy());

        for _ in 0..UNHEALTHY_AFTER {
            health.record_failure();
        }
        assert!(!health.is_healthy());

        // One success resets the streak.
        health.record_success();
        assert!(health.is_healthy());
    }

    #[test]
    fn snapshot_reports_rates() {
        let health = ConnectionHealth::new();
        health.record_success();
        health.record_success();
        health.record_failure();

        let snap = health.snapshot(true, Some(3600));
        assert_eq!(snap.total_requests, 3);
        assert_eq!(snap.successful_requests, 2);
        assert_eq!(snap.failed_requests, 1);
        assert!((snap.success_rate_percentage - 66.67).abs() < 0.01);
        assert!(snap.has_valid_session);
    }

    #[test]
    fn reset_clears_everything() {
        let health = ConnectionHealth::new();
        for _ in 0..10 {
            health.record_failure();
        }
        health.reset();
        assert!(health.is_healthy());
        assert_eq!(health.snapshot(false, None).total_requests, 0);
    }
}
