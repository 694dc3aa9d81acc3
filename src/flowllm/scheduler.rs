//! Cron-driven workflow triggering.
//!
//! The [`Scheduler`] periodically scans schedule records and fires every
//! one whose `next_run_at` has passed, submitting the workflow to the
//! orchestrator with the schedule's captured trigger data. Firing is
//! best-effort and at-most-once per tick: the fire stamp is an optimistic
//! update conditioned on the `next_run_at` the tick observed, and the new
//! `next_run_at` is always computed forward from *now*; missed windows
//! are not made up.
//!
//! # Example
//!
//! ```rust,no_run
//! use flowllm::scheduler::Scheduler;
//! use serde_json::json;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo(scheduler: Arc<Scheduler>) {
//! scheduler.create(7, "*/5 * * * *", json!({"source": "cron"})).await.unwrap();
//!
//! let shutdown = CancellationToken::new();
//! let handle = Scheduler::spawn(scheduler, shutdown.clone());
//! // ... later
//! shutdown.cancel();
//! handle.await.unwrap();
//! # }
//! ```

use crate::flowllm::error::EngineError;
use crate::flowllm::model::WorkflowScheduleRecord;
use crate::flowllm::orchestrator::Orchestrator;
use crate::flowllm::store::Store;
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde_json::Value as JsonValue;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default scan interval.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Parse a 5- or 6-field cron expression and return the first fire time
/// strictly after `after`.
///
/// The `cron` crate wants a seconds field, so standard 5-field
/// expressions get `0` prepended; 6-field expressions pass through.
pub fn next_fire(
    cron_expression: &str,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, EngineError> {
    let fields = cron_expression.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {}", cron_expression),
        6 | 7 => cron_expression.to_string(),
        _ => {
            return Err(EngineError::Validation(format!(
                "cron expression '{}' must have 5 or 6 fields",
                cron_expression
            )))
        }
    };
    let schedule = Schedule::from_str(&normalized).map_err(|e| {
        EngineError::Validation(format!("cron expression '{}': {}", cron_expression, e))
    })?;
    schedule.after(&after).next().ok_or_else(|| {
        EngineError::Validation(format!("cron expression '{}' never fires", cron_expression))
    })
}

/// Scans schedules and submits due workflows to the orchestrator.
pub struct Scheduler {
    store: Store,
    orchestrator: Arc<Orchestrator>,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(store: Store, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            store,
            orchestrator,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }

    /// Override the scan interval (builder pattern).
    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// Create a schedule: validates the workflow reference and the cron
    /// expression, computes the first fire time.
    pub async fn create(
        &self,
        workflow_id: i64,
        cron_expression: &str,
        trigger_data: JsonValue,
    ) -> Result<WorkflowScheduleRecord, EngineError> {
        self.store.get_workflow(workflow_id).await?;
        let next = next_fire(cron_expression, Utc::now())?;
        self.store
            .insert_schedule(workflow_id, cron_expression, &trigger_data, next)
            .await
    }

    /// Disable a schedule. The row is kept so it can be reactivated.
    pub async fn cancel(&self, schedule_id: i64) -> Result<(), EngineError> {
        self.store.get_schedule(schedule_id).await?;
        self.store.set_schedule_enabled(schedule_id, false).await
    }

    /// Re-enable a schedule, recomputing `next_run_at` from now so a
    /// long-disabled schedule does not fire immediately on a stale stamp.
    pub async fn reactivate(&self, schedule_id: i64) -> Result<(), EngineError> {
        let schedule = self.store.get_schedule(schedule_id).await?;
        let next = next_fire(&schedule.cron_expression, Utc::now())?;
        self.store
            .update_schedule_next_run(schedule_id, next)
            .await?;
        self.store.set_schedule_enabled(schedule_id, true).await
    }

    /// Replace the cron expression; `next_run_at` is recomputed.
    pub async fn update_cron(
        &self,
        schedule_id: i64,
        cron_expression: &str,
    ) -> Result<(), EngineError> {
        self.store.get_schedule(schedule_id).await?;
        let next = next_fire(cron_expression, Utc::now())?;
        self.store
            .update_schedule_cron(schedule_id, cron_expression, next)
            .await
    }

    /// Replace the trigger data passed on each fire.
    pub async fn update_trigger_data(
        &self,
        schedule_id: i64,
        trigger_data: JsonValue,
    ) -> Result<(), EngineError> {
        self.store.get_schedule(schedule_id).await?;
        self.store
            .update_schedule_trigger_data(schedule_id, &trigger_data)
            .await
    }

    pub async fn list_for_workflow(
        &self,
        workflow_id: i64,
    ) -> Result<Vec<WorkflowScheduleRecord>, EngineError> {
        self.store.list_schedules_for_workflow(workflow_id).await
    }

    /// Scan and fire everything due now. Returns how many schedules
    /// fired.
    pub async fn tick(&self) -> Result<usize, EngineError> {
        self.tick_at(Utc::now()).await
    }

    /// Clock-injected tick, for deterministic tests and embedders with
    /// their own tickers.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let due = self.store.due_schedules(now).await?;
        let mut fired = 0;
        for schedule in due {
            let next = match next_fire(&schedule.cron_expression, now) {
                Ok(next) => next,
                Err(e) => {
                    // An edited-to-invalid expression must not wedge the
                    // whole tick; the schedule stays enabled for repair.
                    log::error!("schedule {} has a bad cron expression: {}", schedule.id, e);
                    continue;
                }
            };
            if !self
                .store
                .mark_schedule_fired(schedule.id, now, next, schedule.next_run_at)
                .await?
            {
                // A concurrent tick already claimed this fire.
                continue;
            }
            fired += 1;
            log::info!(
                "schedule {} fired workflow {} (next run {})",
                schedule.id,
                schedule.workflow_id,
                next
            );
            let orchestrator = Arc::clone(&self.orchestrator);
            let workflow_id = schedule.workflow_id;
            let trigger_data = schedule.trigger_data.clone();
            let schedule_id = schedule.id;
            tokio::spawn(async move {
                if let Err(e) = orchestrator.execute(workflow_id, trigger_data).await {
                    // Submission failures are logged and the schedule is
                    // left enabled.
                    log::error!(
                        "schedule {} failed to submit workflow {}: {}",
                        schedule_id,
                        workflow_id,
                        e
                    );
                }
            });
        }
        Ok(fired)
    }

    /// Run the tick loop until `shutdown` is cancelled.
    pub fn spawn(scheduler: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = scheduler.tick().await {
                            log::error!("scheduler tick failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}
