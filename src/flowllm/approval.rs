//! Approval coordination.
//!
//! [`ApprovalCoordinator`] is the durable bridge between a parked
//! execution and the humans who unblock it: it creates pending approval
//! requests with a deadline, resolves them exactly once, and sweeps
//! expired ones. Resolution races are settled by an optimistic
//! `PENDING → terminal` transition in the store; the loser observes
//! [`EngineError::AlreadyResolved`].
//!
//! Resolving a request immediately re-enters the orchestrator via
//! [`Orchestrator::resume_after_approval`]; a timed-out request resumes
//! as a rejection with reason `"timeout"`.
//!
//! # Example
//!
//! ```rust,no_run
//! use flowllm::approval::ApprovalCoordinator;
//!
//! # async fn demo(approvals: ApprovalCoordinator) {
//! for request in approvals.list_pending(Some("manager")).await.unwrap() {
//!     approvals.approve(request.id, "alice", Some("looks good")).await.unwrap();
//! }
//! # }
//! ```

use crate::flowllm::error::EngineError;
use crate::flowllm::model::{ApprovalRequestRecord, ApprovalStatus};
use crate::flowllm::orchestrator::{ApprovalResolution, Orchestrator};
use crate::flowllm::store::Store;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;

pub struct ApprovalCoordinator {
    store: Store,
    orchestrator: Arc<Orchestrator>,
}

impl ApprovalCoordinator {
    pub fn new(store: Store, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            store,
            orchestrator,
        }
    }

    /// Create a pending request with `timeout_at = now + timeout_minutes`.
    ///
    /// The orchestrator creates its own requests when it parks an
    /// execution; this entry point exists for external callers driving
    /// approvals around the engine.
    pub async fn create(
        &self,
        execution_id: i64,
        step_id: i64,
        required_role: Option<&str>,
        timeout_minutes: i64,
    ) -> Result<ApprovalRequestRecord, EngineError> {
        if timeout_minutes <= 0 {
            return Err(EngineError::Validation(
                "approval timeout must be positive".into(),
            ));
        }
        if self
            .store
            .pending_approval_for_step(execution_id, step_id)
            .await?
            .is_some()
        {
            return Err(EngineError::Validation(format!(
                "step {} already has a pending approval",
                step_id
            )));
        }
        let timeout_at = Utc::now() + ChronoDuration::minutes(timeout_minutes);
        self.store
            .insert_approval(execution_id, step_id, required_role, timeout_at)
            .await
    }

    /// Approve a pending request and resume its execution.
    pub async fn approve(
        &self,
        request_id: i64,
        identity: &str,
        comments: Option<&str>,
    ) -> Result<(), EngineError> {
        self.resolve(request_id, ApprovalStatus::Approved, identity, comments)
            .await
    }

    /// Reject a pending request; the owning step is observed as SKIPPED
    /// by its dependents and the execution continues.
    pub async fn reject(
        &self,
        request_id: i64,
        identity: &str,
        reason: Option<&str>,
    ) -> Result<(), EngineError> {
        self.resolve(request_id, ApprovalStatus::Rejected, identity, reason)
            .await
    }

    async fn resolve(
        &self,
        request_id: i64,
        to: ApprovalStatus,
        identity: &str,
        comments: Option<&str>,
    ) -> Result<(), EngineError> {
        let request = self.store.get_approval(request_id).await?;
        let transitioned = self
            .store
            .resolve_approval(request_id, to, Some(identity), comments)
            .await?;
        if !transitioned {
            return Err(EngineError::AlreadyResolved(request_id));
        }
        log::info!(
            "approval {} {} by {}",
            request_id,
            to.as_str(),
            identity
        );
        self.orchestrator
            .resume_after_approval(
                request.workflow_execution_id,
                request.workflow_step_id,
                ApprovalResolution {
                    approved: to == ApprovalStatus::Approved,
                    approved_by: Some(identity.to_string()),
                    comments: comments.map(|c| c.to_string()),
                },
            )
            .await
    }

    /// Transition every expired pending request to TIMEOUT and resume
    /// its execution as rejected with reason `"timeout"`. Returns how
    /// many requests were timed out.
    pub async fn sweep_timeouts(&self) -> Result<usize, EngineError> {
        self.sweep_timeouts_at(Utc::now()).await
    }

    /// Clock-injected sweep, for deterministic tests and embedders with
    /// their own tickers.
    pub async fn sweep_timeouts_at(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let expired = self.store.expired_pending_approvals(now).await?;
        let mut swept = 0;
        for request in expired {
            // Another actor may resolve concurrently; zero rowcount means
            // this one was already handled.
            if !self
                .store
                .resolve_approval(request.id, ApprovalStatus::Timeout, None, Some("timeout"))
                .await?
            {
                continue;
            }
            swept += 1;
            log::warn!(
                "approval {} timed out (execution {}, step {})",
                request.id,
                request.workflow_execution_id,
                request.workflow_step_id
            );
            if let Err(e) = self
                .orchestrator
                .resume_after_approval(
                    request.workflow_execution_id,
                    request.workflow_step_id,
                    ApprovalResolution {
                        approved: false,
                        approved_by: None,
                        comments: Some("timeout".to_string()),
                    },
                )
                .await
            {
                log::error!(
                    "execution {} failed to resume after approval timeout: {}",
                    request.workflow_execution_id,
                    e
                );
            }
        }
        Ok(swept)
    }

    pub async fn get(&self, request_id: i64) -> Result<ApprovalRequestRecord, EngineError> {
        self.store.get_approval(request_id).await
    }

    /// Pending requests, optionally filtered to a required role.
    pub async fn list_pending(
        &self,
        role: Option<&str>,
    ) -> Result<Vec<ApprovalRequestRecord>, EngineError> {
        self.store.list_pending_approvals(role).await
    }

    pub async fn count_pending(&self) -> Result<i64, EngineError> {
        self.store.count_pending_approvals().await
    }
}
