//! The process-wide polling loop.
//!
//! Every cycle loads the in-flight runs, orders them by urgency, and drives
//! each through the orchestrator's `refresh` in fixed-size concurrent
//! batches with an inter-batch delay, staying under the upstream rate
//! budget. The full interval is slept after each cycle regardless of how
//! long the cycle took, so the cadence stays stable under load.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use flowbridge_core::FlowRun;

use crate::orchestrator::RunOrchestrator;

/// Score assigned when a run lacks the timestamp a criterion needs.
const MISSING_SCORE: f64 = 86_400.0;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Cycle cadence.
    pub poll_interval: Duration,
    /// Batch size, bounded by the outbound rate budget rather than job count.
    pub max_concurrent_checks: usize,
    /// Pause between batches within one cycle.
    pub batch_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            max_concurrent_checks: 5,
            batch_delay: Duration::from_secs(2),
        }
    }
}

impl SchedulerConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_concurrent_checks(mut self, max: usize) -> Self {
        self.max_concurrent_checks = max.max(1);
        self
    }

    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }
}

/// Per-cycle accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Cumulative scheduler statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SchedulerStats {
    pub cycles: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Handle to a spawned scheduler.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<SchedulerStats>>,
}

impl SchedulerHandle {
    /// Request shutdown and wait for the in-flight cycle to complete.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.lock().unwrap().clone()
    }
}

/// Drives all non-terminal runs on a fixed cadence.
pub struct PollingScheduler {
    orchestrator: Arc<RunOrchestrator>,
    config: SchedulerConfig,
}

impl PollingScheduler {
    pub fn new(orchestrator: Arc<RunOrchestrator>, config: SchedulerConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// Spawn the polling loop.
    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(SchedulerStats::default()));
        let stats_clone = stats.clone();

        let join = tokio::spawn(async move {
            self.run_loop(shutdown_rx, stats_clone).await;
        });

        SchedulerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }

    async fn run_loop(self, mut shutdown: watch::Receiver<bool>, stats: Arc<Mutex<SchedulerStats>>) {
        info!(
            interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.max_concurrent_checks,
            "polling scheduler started"
        );
        let mut cycle = 0u64;

        loop {
            cycle += 1;
            let started = tokio::time::Instant::now();

            match self.run_once().await {
                Ok(outcome) => {
                    let mut s = stats.lock().unwrap();
                    s.cycles = cycle;
                    s.processed += outcome.processed as u64;
                    s.succeeded += outcome.succeeded as u64;
                    s.failed += outcome.failed as u64;
                    drop(s);
                    info!(
                        cycle,
                        duration_ms = started.elapsed().as_millis() as u64,
                        processed = outcome.processed,
                        succeeded = outcome.succeeded,
                        failed = outcome.failed,
                        "polling cycle completed"
                    );
                }
                Err(e) => error!(cycle, error = %e, "polling cycle failed"),
            }

            // Full interval between cycles, independent of cycle duration.
            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped handle counts as a shutdown request too.
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("polling scheduler stopped");
    }

    /// One full cycle: load, prioritize, refresh in batches.
    pub async fn run_once(&self) -> Result<CycleOutcome, crate::error::EngineError> {
        let runs = self.orchestrator.store().list_pollable().await?;
        if runs.is_empty() {
            debug!("no active runs this cycle");
            return Ok(CycleOutcome::default());
        }

        let prioritized = prioritize(runs, Utc::now());
        let mut outcome = CycleOutcome {
            processed: prioritized.len(),
            ..Default::default()
        };

        let batch_count =
            prioritized.len().div_ceil(self.config.max_concurrent_checks);
        let mut batches = prioritized.into_iter().peekable();
        let mut batch_num = 0usize;

        while batches.peek().is_some() {
            batch_num += 1;
            let batch: Vec<FlowRun> = batches
                .by_ref()
                .take(self.config.max_concurrent_checks)
                .collect();
            debug!(batch_num, batch_count, size = batch.len(), "processing batch");

            let mut handles = Vec::with_capacity(batch.len());
            for run in batch {
                let orchestrator = self.orchestrator.clone();
                handles.push(tokio::spawn(async move {
                    let mut run = run;
                    orchestrator.refresh(&mut run).await
                }));
            }

            for handle in handles {
                match handle.await {
                    Ok(Ok(())) => outcome.succeeded += 1,
                    Ok(Err(e)) => {
                        // Already recorded on the run; only counted here.
                        warn!(error = %e, "run refresh failed");
                        outcome.failed += 1;
                    }
                    Err(e) => {
                        error!(error = %e, "refresh task panicked");
                        outcome.failed += 1;
                    }
                }
            }

            if batches.peek().is_some() {
                tokio::time::sleep(self.config.batch_delay).await;
            }
        }

        Ok(outcome)
    }
}

/// Order runs for processing: runs closest to their deadline first, with
/// stale and old runs weighted behind urgency.
fn prioritize(mut runs: Vec<FlowRun>, now: DateTime<Utc>) -> Vec<FlowRun> {
    runs.sort_by(|a, b| {
        priority_score(a, now)
            .partial_cmp(&priority_score(b, now))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    runs
}

fn priority_score(run: &FlowRun, now: DateTime<Utc>) -> f64 {
    let urgency = match run.timeout_at {
        Some(t) => (t - now).num_seconds() as f64,
        None => MISSING_SCORE,
    };
    let staleness = (now - run.updated_at).num_seconds().max(0) as f64;
    let age = (now - run.created_at).num_seconds().max(0) as f64;

    urgency * 10.0 + staleness * 2.0 + age
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn run_with_deadline(offset_secs: i64) -> FlowRun {
        let mut run = FlowRun::new("/demo", "Demo", serde_json::json!({}));
        run.extend_deadline(Utc::now() + ChronoDuration::seconds(offset_secs));
        run
    }

    #[test]
    fn runs_closest_to_their_deadline_come_first() {
        let far = run_with_deadline(7_200);
        let near = run_with_deadline(60);
        let mid = run_with_deadline(1_800);

        let ordered = prioritize(vec![far.clone(), near.clone(), mid.clone()], Utc::now());
        assert_eq!(ordered[0].id, near.id);
        assert_eq!(ordered[1].id, mid.id);
        assert_eq!(ordered[2].id, far.id);
    }

    #[test]
    fn deadline_free_runs_sort_behind_urgent_ones() {
        let urgent = run_with_deadline(30);
        let unbounded = FlowRun::new("/demo", "Demo", serde_json::json!({}));

        let ordered = prioritize(vec![unbounded.clone(), urgent.clone()], Utc::now());
        assert_eq!(ordered[0].id, urgent.id);
        assert_eq!(ordered[1].id, unbounded.id);
    }

    #[test]
    fn overdue_runs_jump_the_queue() {
        let healthy = run_with_deadline(3_600);
        let overdue = run_with_deadline(-60);

        let ordered = prioritize(vec![healthy.clone(), overdue.clone()], Utc::now());
        assert_eq!(ordered[0].id, overdue.id);
    }
}
