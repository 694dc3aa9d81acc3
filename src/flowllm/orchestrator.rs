//! Workflow orchestration engine.
//!
//! The [`Orchestrator`] executes a workflow graph exactly once: it loads
//! the workflow and its steps in one coherent read, validates the graph,
//! opens a workflow-execution record, and then runs the steps in
//! **dependency waves**: every step whose dependencies are terminal and
//! whose gating condition holds runs concurrently with the rest of its
//! wave, each task receiving an immutable snapshot of the context.
//! Outputs are merged back by the orchestrator alone between waves.
//!
//! # Step semantics
//!
//! | Kind | Behaviour |
//! |------|-----------|
//! | `AGENT_EXECUTION` | Substitute the input mapping, invoke the agent runner under the step timeout and retry policy, store the result under the output variable |
//! | `CONDITION` | Evaluate the expression, record `true`/`false`, complete immediately |
//! | `PARALLEL` | Marker; completes immediately so dependents fan out |
//! | `APPROVAL` | Create a pending approval request, park the execution (`AWAITING_APPROVAL`), release the in-memory frame |
//!
//! The resumable frame lives entirely in the database: the context map
//! plus per-step terminal statuses under the reserved `meta.steps` key.
//! Any process can therefore resume any execution after an approval
//! resolves; [`Orchestrator::resume_after_approval`] is idempotent.
//!
//! # Example
//!
//! ```rust,no_run
//! use flowllm::orchestrator::Orchestrator;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn demo(orchestrator: Arc<Orchestrator>) {
//! let outcome = orchestrator
//!     .execute(7, json!({"product_code": "A-113"}))
//!     .await
//!     .unwrap();
//! if outcome.success {
//!     println!("context: {}", outcome.context);
//! }
//! # }
//! ```

use crate::flowllm::agent_runner::AgentRunner;
use crate::flowllm::condition::evaluate;
use crate::flowllm::dispatcher::CallScope;
use crate::flowllm::error::EngineError;
use crate::flowllm::model::{
    ApprovalConfig, ApprovalStatus, ExecutionMode, ExecutionStatus, StepKind, StepStatus,
    WorkflowRecord, WorkflowStepRecord,
};
use crate::flowllm::store::Store;
use crate::flowllm::template::substitute;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Map, Value as JsonValue};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Default per-step deadline when a step does not set one.
pub const DEFAULT_STEP_TIMEOUT_SECS: i64 = 300;
/// Hard ceiling on any per-step deadline.
pub const MAX_STEP_TIMEOUT_SECS: i64 = 3600;
/// Approval deadline applied when the approval config omits one.
const DEFAULT_APPROVAL_TIMEOUT_MINUTES: i64 = 60;

/// Terminal (or parked) result of driving an execution.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub execution_id: i64,
    pub status: ExecutionStatus,
    pub context: JsonValue,
    pub error: Option<String>,
}

/// Human decision delivered back into a parked execution.
#[derive(Debug, Clone)]
pub struct ApprovalResolution {
    pub approved: bool,
    pub approved_by: Option<String>,
    pub comments: Option<String>,
}

/// Where one pass of the wave loop ended up.
struct WaveEnd {
    status: ExecutionStatus,
    context: JsonValue,
    error: Option<String>,
}

/// Executes workflow graphs against the store and agent runner.
pub struct Orchestrator {
    store: Store,
    runner: Arc<AgentRunner>,
    default_step_timeout: Duration,
    running: Mutex<HashMap<i64, CancellationToken>>,
}

impl Orchestrator {
    pub fn new(store: Store, runner: Arc<AgentRunner>) -> Self {
        Self {
            store,
            runner,
            default_step_timeout: Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECS as u64),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Override the default step timeout (builder pattern).
    pub fn with_default_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout = timeout;
        self
    }

    /// Execute a workflow with the given trigger data.
    ///
    /// Honors the workflow's execution mode: `SYNC` drives the run to a
    /// terminal state (or approval park) before returning, `ASYNC`
    /// returns as soon as the execution record exists and drives the run
    /// on a spawned task.
    pub async fn execute(
        self: &Arc<Self>,
        workflow_id: i64,
        trigger_data: JsonValue,
    ) -> Result<ExecutionOutcome, EngineError> {
        let (workflow, _steps) = self.load_plan(workflow_id).await?;
        self.start(&workflow, trigger_data).await
    }

    /// Execute a workflow only if its public flag is set, after checking
    /// the trigger data against the workflow's input schema.
    pub async fn execute_public(
        self: &Arc<Self>,
        workflow_id: i64,
        input: JsonValue,
    ) -> Result<ExecutionOutcome, EngineError> {
        let (workflow, _steps) = self.load_plan(workflow_id).await?;
        if !workflow.public {
            return Err(EngineError::NotPublic(workflow_id));
        }
        crate::flowllm::schema::validate_input(&workflow.input_schema, &input)?;
        self.start(&workflow, input).await
    }

    async fn start(
        self: &Arc<Self>,
        workflow: &WorkflowRecord,
        trigger_data: JsonValue,
    ) -> Result<ExecutionOutcome, EngineError> {
        let context = json!({
            "trigger": trigger_data,
            "meta": {"steps": {}},
        });
        let execution = self
            .store
            .insert_execution(workflow.id, ExecutionStatus::Pending, &trigger_data, &context)
            .await?;
        log::info!(
            "execution {} started for workflow '{}' ({})",
            execution.id,
            workflow.name,
            workflow.execution_mode.as_str()
        );

        let token = self.register_token(execution.id).await;
        match workflow.execution_mode {
            ExecutionMode::Sync => self.clone().drive(execution.id, token).await,
            ExecutionMode::Async => {
                let orchestrator = self.clone();
                let execution_id = execution.id;
                tokio::spawn(async move {
                    if let Err(e) = orchestrator.drive(execution_id, token).await {
                        log::error!("execution {} failed to drive: {}", execution_id, e);
                    }
                });
                Ok(ExecutionOutcome {
                    success: true,
                    execution_id: execution.id,
                    status: ExecutionStatus::Pending,
                    context,
                    error: None,
                })
            }
        }
    }

    /// Deliver an approval decision and re-enter the scheduling loop.
    ///
    /// Writes the resolution under the step's output variable, marks the
    /// step terminal (COMPLETED on approve, SKIPPED on reject), flips the
    /// execution back to RUNNING, and drives the remaining waves. Calling
    /// this twice for an already-advanced step is a no-op.
    pub async fn resume_after_approval(
        self: &Arc<Self>,
        execution_id: i64,
        step_id: i64,
        resolution: ApprovalResolution,
    ) -> Result<(), EngineError> {
        let execution = self.store.get_execution(execution_id).await?;
        if execution.status.is_terminal() {
            return Ok(());
        }
        let step = self.store.get_step(step_id).await?;
        let states = read_step_states(&execution.context);
        if states.contains_key(&step.step_order) {
            // Second resume for an already-advanced step.
            return Ok(());
        }

        // Claim the frame before touching it. Losing the race means
        // another actor is driving; it applies the resolved approval row
        // when it next reaches this step's wave.
        if !self
            .store
            .transition_execution(
                execution_id,
                ExecutionStatus::AwaitingApproval,
                ExecutionStatus::Running,
            )
            .await?
        {
            return Ok(());
        }

        let execution = self.store.get_execution(execution_id).await?;
        let mut context = execution.context;
        apply_resolution(&mut context, &step, &resolution);
        self.store
            .save_execution_context(execution_id, &context)
            .await?;

        log::info!(
            "execution {} resumed after approval on step {} (approved: {})",
            execution_id,
            step.step_order,
            resolution.approved
        );
        let token = self.register_token(execution_id).await;
        self.clone().drive(execution_id, token).await.map(|_| ())
    }

    /// Cancel an execution: flips the state to CANCELLED and signals all
    /// in-flight step tasks. Cancellation is cooperative; tasks observe
    /// the signal at their next suspend point.
    pub async fn cancel(&self, execution_id: i64) -> Result<(), EngineError> {
        if let Some(token) = self.running.lock().await.get(&execution_id) {
            token.cancel();
            return Ok(());
        }
        // Nothing in flight here (e.g. parked on an approval); finish the
        // row directly unless it is already terminal.
        let execution = self.store.get_execution(execution_id).await?;
        if !execution.status.is_terminal() {
            self.store
                .finish_execution(execution_id, ExecutionStatus::Cancelled, Some("cancelled"))
                .await?;
            log::info!("execution {} cancelled while parked", execution_id);
        }
        Ok(())
    }

    /// Latest persisted state of an execution.
    pub async fn outcome(&self, execution_id: i64) -> Result<ExecutionOutcome, EngineError> {
        let execution = self.store.get_execution(execution_id).await?;
        Ok(ExecutionOutcome {
            success: execution.status == ExecutionStatus::Completed,
            execution_id,
            status: execution.status,
            context: execution.context,
            error: execution.error_message,
        })
    }

    async fn register_token(&self, execution_id: i64) -> CancellationToken {
        let token = CancellationToken::new();
        self.running
            .lock()
            .await
            .insert(execution_id, token.clone());
        token
    }

    async fn load_plan(
        &self,
        workflow_id: i64,
    ) -> Result<(WorkflowRecord, Vec<WorkflowStepRecord>), EngineError> {
        let (workflow, steps) = self.store.load_workflow_with_steps(workflow_id).await?;
        if !workflow.active {
            return Err(EngineError::WorkflowInactive(workflow_id));
        }
        validate_graph(&steps)?;
        Ok((workflow, steps))
    }

    /// Drive the wave loop to its next suspension or terminal state and
    /// persist the result.
    async fn drive(
        self: Arc<Self>,
        execution_id: i64,
        token: CancellationToken,
    ) -> Result<ExecutionOutcome, EngineError> {
        let result = self.run_waves(execution_id, &token).await;
        self.running.lock().await.remove(&execution_id);
        let end = match result {
            Ok(end) => end,
            Err(e) => {
                // Infrastructure failure; record it so the execution does
                // not hang in RUNNING forever.
                let _ = self
                    .store
                    .finish_execution(execution_id, ExecutionStatus::Failed, Some(&e.to_string()))
                    .await;
                return Err(e);
            }
        };
        Ok(ExecutionOutcome {
            success: end.status == ExecutionStatus::Completed
                || end.status == ExecutionStatus::AwaitingApproval,
            execution_id,
            status: end.status,
            context: end.context,
            error: end.error,
        })
    }

    async fn run_waves(
        &self,
        execution_id: i64,
        token: &CancellationToken,
    ) -> Result<WaveEnd, EngineError> {
        let execution = self.store.get_execution(execution_id).await?;
        let (_workflow, steps) = self
            .store
            .load_workflow_with_steps(execution.workflow_id)
            .await?;
        let mut context = execution.context.clone();
        if execution.status == ExecutionStatus::Pending {
            self.store
                .set_execution_status(execution_id, ExecutionStatus::Running)
                .await?;
        }

        loop {
            if token.is_cancelled() {
                return self
                    .finish(execution_id, ExecutionStatus::Cancelled, context, Some("cancelled"))
                    .await;
            }

            let states = read_step_states(&context);
            let pending: Vec<&WorkflowStepRecord> = steps
                .iter()
                .filter(|s| !states.contains_key(&s.step_order))
                .collect();
            if pending.is_empty() {
                log::info!("execution {} completed ({} steps)", execution_id, steps.len());
                return self
                    .finish(execution_id, ExecutionStatus::Completed, context, None)
                    .await;
            }

            let ready: Vec<&WorkflowStepRecord> = pending
                .iter()
                .copied()
                .filter(|s| {
                    s.depends_on
                        .iter()
                        .all(|dep| states.contains_key(dep))
                })
                .collect();
            if ready.is_empty() {
                let stuck: Vec<String> =
                    pending.iter().map(|s| s.step_order.to_string()).collect();
                let message = format!("steps [{}] can never become ready", stuck.join(", "));
                return self
                    .finish(
                        execution_id,
                        ExecutionStatus::Failed,
                        context,
                        Some(&EngineError::DeadlockDetected(message).to_string()),
                    )
                    .await;
            }

            log::debug!(
                "execution {} wave: steps [{}]",
                execution_id,
                ready
                    .iter()
                    .map(|s| s.step_order.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );

            let mut agent_steps: Vec<WorkflowStepRecord> = Vec::new();
            let mut approval_steps: Vec<WorkflowStepRecord> = Vec::new();

            for step in ready {
                match step.kind {
                    StepKind::Condition => {
                        // Pure decorator: record the verdict, never gate.
                        let expr = step.condition_expression.as_deref().unwrap_or("");
                        match evaluate(expr, &context) {
                            Ok(verdict) => {
                                set_context_value(&mut context, &step.output_key(), json!(verdict));
                                write_step_state(&mut context, step.step_order, StepStatus::Completed);
                            }
                            Err(e) => {
                                return self
                                    .finish(
                                        execution_id,
                                        ExecutionStatus::Failed,
                                        context,
                                        Some(&e.to_string()),
                                    )
                                    .await;
                            }
                        }
                    }
                    _ => {
                        let gate = match &step.condition_expression {
                            Some(expr) => match evaluate(expr, &context) {
                                Ok(verdict) => verdict,
                                Err(e) => {
                                    return self
                                        .finish(
                                            execution_id,
                                            ExecutionStatus::Failed,
                                            context,
                                            Some(&e.to_string()),
                                        )
                                        .await;
                                }
                            },
                            None => true,
                        };
                        if !gate {
                            log::debug!(
                                "execution {} step {} skipped by condition",
                                execution_id,
                                step.step_order
                            );
                            write_step_state(&mut context, step.step_order, StepStatus::Skipped);
                            continue;
                        }
                        match step.kind {
                            StepKind::Parallel => {
                                // Marker node: dependents fan out next wave.
                                if step.output_variable.is_some() {
                                    set_context_value(&mut context, &step.output_key(), json!(true));
                                }
                                write_step_state(&mut context, step.step_order, StepStatus::Completed);
                            }
                            StepKind::Approval => approval_steps.push(step.clone()),
                            StepKind::AgentExecution => agent_steps.push(step.clone()),
                            StepKind::Condition => unreachable!(),
                        }
                    }
                }
            }

            // Launch the wave's agent steps concurrently, each against an
            // immutable snapshot of the context.
            let mut handles = Vec::new();
            for step in agent_steps {
                let runner = Arc::clone(&self.runner);
                let snapshot = context.clone();
                let step_token = token.clone();
                let default_timeout = self.default_step_timeout;
                handles.push(tokio::spawn(async move {
                    let key = step.output_key();
                    let order = step.step_order;
                    let result = execute_agent_step(
                        runner,
                        execution_id,
                        &step,
                        &snapshot,
                        default_timeout,
                        step_token,
                    )
                    .await;
                    (order, key, result)
                }));
            }

            let mut wave_error: Option<EngineError> = None;
            for handle in handles {
                let (order, key, result) = handle
                    .await
                    .map_err(|e| EngineError::Storage(format!("step task join: {}", e)))?;
                match result {
                    Ok(output) => {
                        set_context_value(&mut context, &key, output);
                        write_step_state(&mut context, order, StepStatus::Completed);
                    }
                    Err(e) => {
                        log::warn!("execution {} step {} failed: {}", execution_id, order, e);
                        if wave_error.is_none() || matches!(e, EngineError::Cancelled) {
                            wave_error = Some(e);
                        }
                    }
                }
            }
            self.store
                .save_execution_context(execution_id, &context)
                .await?;

            if let Some(e) = wave_error {
                let status = if matches!(e, EngineError::Cancelled) {
                    ExecutionStatus::Cancelled
                } else {
                    ExecutionStatus::Failed
                };
                return self
                    .finish(execution_id, status, context, Some(&e.to_string()))
                    .await;
            }

            if !approval_steps.is_empty() {
                let mut parked = 0;
                for step in &approval_steps {
                    // At most one non-terminal request per step. A request
                    // that resolved while we were busy (or whose resume lost
                    // the transition race) is applied here instead of being
                    // recreated.
                    match self
                        .store
                        .latest_approval_for_step(execution_id, step.id)
                        .await?
                    {
                        Some(request) if request.status == ApprovalStatus::Pending => {
                            parked += 1;
                        }
                        Some(request) => {
                            apply_resolution(
                                &mut context,
                                step,
                                &ApprovalResolution {
                                    approved: request.status == ApprovalStatus::Approved,
                                    approved_by: request.resolved_by.clone(),
                                    comments: request.comments.clone(),
                                },
                            );
                        }
                        None => {
                            let config = step.approval_config.clone().unwrap_or(ApprovalConfig {
                                required_role: None,
                                timeout_minutes: None,
                            });
                            let timeout_minutes = config
                                .timeout_minutes
                                .unwrap_or(DEFAULT_APPROVAL_TIMEOUT_MINUTES);
                            let timeout_at =
                                Utc::now() + ChronoDuration::minutes(timeout_minutes);
                            let request = self
                                .store
                                .insert_approval(
                                    execution_id,
                                    step.id,
                                    config.required_role.as_deref(),
                                    timeout_at,
                                )
                                .await?;
                            parked += 1;
                            log::info!(
                                "execution {} parked on approval {} (step {}, role {:?})",
                                execution_id,
                                request.id,
                                step.step_order,
                                config.required_role
                            );
                        }
                    }
                }
                self.store
                    .save_execution_context(execution_id, &context)
                    .await?;
                if parked > 0 {
                    self.store
                        .set_execution_status(execution_id, ExecutionStatus::AwaitingApproval)
                        .await?;
                    return Ok(WaveEnd {
                        status: ExecutionStatus::AwaitingApproval,
                        context,
                        error: None,
                    });
                }
            }
        }
    }

    async fn finish(
        &self,
        execution_id: i64,
        status: ExecutionStatus,
        context: JsonValue,
        error: Option<&str>,
    ) -> Result<WaveEnd, EngineError> {
        self.store
            .save_execution_context(execution_id, &context)
            .await?;
        self.store
            .finish_execution(execution_id, status, error)
            .await?;
        Ok(WaveEnd {
            status,
            context,
            error: error.map(|e| e.to_string()),
        })
    }
}

/// Run one AGENT_EXECUTION step under its timeout and retry policy.
async fn execute_agent_step(
    runner: Arc<AgentRunner>,
    execution_id: i64,
    step: &WorkflowStepRecord,
    context: &JsonValue,
    default_timeout: Duration,
    token: CancellationToken,
) -> Result<JsonValue, EngineError> {
    let agent_id = step.agent_id.ok_or_else(|| {
        EngineError::Validation(format!(
            "AGENT_EXECUTION step {} has no agent reference",
            step.step_order
        ))
    })?;
    let input = substitute(&step.input_mapping, context);
    let timeout = step_timeout(step, default_timeout);
    let scope = CallScope {
        workflow_execution_id: Some(execution_id),
        workflow_step_id: Some(step.id),
    };
    let max_retries = step.retry_config.as_ref().map(|r| r.max_retries).unwrap_or(0);

    let mut attempt: u32 = 0;
    loop {
        let run = runner.run(agent_id, input.clone(), scope);
        let err = tokio::select! {
            _ = token.cancelled() => return Err(EngineError::Cancelled),
            result = tokio::time::timeout(timeout, run) => match result {
                Ok(Ok(outcome)) => {
                    return Ok(json!({
                        "text": outcome.text,
                        "tokens_used": outcome.usage.total(),
                    }));
                }
                Ok(Err(e)) => e,
                Err(_) => EngineError::StepTimeout(format!(
                    "step {} exceeded {}s",
                    step.step_order,
                    timeout.as_secs()
                )),
            },
        };

        if err.is_retryable() && attempt < max_retries {
            let delay = step
                .retry_config
                .as_ref()
                .map(|r| r.delay_for_attempt(attempt))
                .unwrap_or_default();
            attempt += 1;
            log::info!(
                "execution {} step {} retrying ({}/{}) after {:?}: {}",
                execution_id,
                step.step_order,
                attempt,
                max_retries,
                delay,
                err
            );
            tokio::time::sleep(delay).await;
        } else {
            return Err(err);
        }
    }
}

fn step_timeout(step: &WorkflowStepRecord, default_timeout: Duration) -> Duration {
    let secs = if step.timeout_seconds <= 0 {
        default_timeout.as_secs() as i64
    } else {
        step.timeout_seconds.min(MAX_STEP_TIMEOUT_SECS)
    };
    Duration::from_secs(secs.max(1) as u64)
}

/// Load-time validation of a workflow graph: positive unique orders,
/// agent references on agent steps, known acyclic dependencies, and no
/// output-key collisions between steps that could run concurrently.
pub fn validate_graph(steps: &[WorkflowStepRecord]) -> Result<(), EngineError> {
    let mut orders = HashSet::new();
    for step in steps {
        if step.step_order <= 0 {
            return Err(EngineError::Validation(format!(
                "step '{}' has non-positive order {}",
                step.name, step.step_order
            )));
        }
        if !orders.insert(step.step_order) {
            return Err(EngineError::Validation(format!(
                "duplicate step order {}",
                step.step_order
            )));
        }
        if step.kind == StepKind::AgentExecution && step.agent_id.is_none() {
            return Err(EngineError::Validation(format!(
                "AGENT_EXECUTION step {} has no agent reference",
                step.step_order
            )));
        }
    }

    for step in steps {
        for dep in &step.depends_on {
            if *dep == step.step_order {
                return Err(EngineError::Validation(format!(
                    "step {} depends on itself",
                    step.step_order
                )));
            }
            if !orders.contains(dep) {
                return Err(EngineError::Validation(format!(
                    "step {} depends on unknown step {}",
                    step.step_order, dep
                )));
            }
        }
    }

    // Kahn's algorithm over the dependency edges.
    let mut in_degree: HashMap<i64, usize> = steps
        .iter()
        .map(|s| (s.step_order, s.depends_on.len()))
        .collect();
    let mut dependents: HashMap<i64, Vec<i64>> = HashMap::new();
    for step in steps {
        for dep in &step.depends_on {
            dependents.entry(*dep).or_default().push(step.step_order);
        }
    }
    let mut queue: Vec<i64> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(o, _)| *o)
        .collect();
    let mut visited = 0;
    while let Some(order) = queue.pop() {
        visited += 1;
        if let Some(children) = dependents.get(&order) {
            for child in children {
                let degree = in_degree.get_mut(child).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    queue.push(*child);
                }
            }
        }
    }
    if visited != steps.len() {
        return Err(EngineError::Validation(
            "step dependencies form a cycle".into(),
        ));
    }

    // Output-key collisions: allowed only when one writer transitively
    // depends on the other (they can never share a wave).
    let ancestors = transitive_ancestors(steps);
    for (i, a) in steps.iter().enumerate() {
        for b in steps.iter().skip(i + 1) {
            if a.output_key() != b.output_key() {
                continue;
            }
            let ordered = ancestors
                .get(&a.step_order)
                .map(|set| set.contains(&b.step_order))
                .unwrap_or(false)
                || ancestors
                    .get(&b.step_order)
                    .map(|set| set.contains(&a.step_order))
                    .unwrap_or(false);
            if !ordered {
                return Err(EngineError::Validation(format!(
                    "steps {} and {} both write '{}' and may run concurrently",
                    a.step_order,
                    b.step_order,
                    a.output_key()
                )));
            }
        }
    }

    Ok(())
}

fn transitive_ancestors(steps: &[WorkflowStepRecord]) -> HashMap<i64, HashSet<i64>> {
    let direct: HashMap<i64, Vec<i64>> = steps
        .iter()
        .map(|s| (s.step_order, s.depends_on.clone()))
        .collect();
    let mut result: HashMap<i64, HashSet<i64>> = HashMap::new();
    for step in steps {
        let mut seen = HashSet::new();
        let mut stack = step.depends_on.clone();
        while let Some(order) = stack.pop() {
            if seen.insert(order) {
                if let Some(parents) = direct.get(&order) {
                    stack.extend(parents.iter().copied());
                }
            }
        }
        result.insert(step.step_order, seen);
    }
    result
}

// ---- context frame helpers ----

/// Write an approval outcome into the frame: the resolution object under
/// the step's output variable and the step's terminal status (COMPLETED
/// on approve, SKIPPED otherwise).
fn apply_resolution(
    context: &mut JsonValue,
    step: &WorkflowStepRecord,
    resolution: &ApprovalResolution,
) {
    set_context_value(
        context,
        &step.output_key(),
        json!({
            "approved": resolution.approved,
            "approvedBy": resolution.approved_by,
            "comments": resolution.comments,
        }),
    );
    let state = if resolution.approved {
        StepStatus::Completed
    } else {
        StepStatus::Skipped
    };
    write_step_state(context, step.step_order, state);
}

fn read_step_states(context: &JsonValue) -> HashMap<i64, StepStatus> {
    let mut states = HashMap::new();
    if let Some(steps) = context
        .get("meta")
        .and_then(|m| m.get("steps"))
        .and_then(|s| s.as_object())
    {
        for (order, status) in steps {
            if let (Ok(order), Some(status)) = (
                order.parse::<i64>(),
                status.as_str().and_then(StepStatus::parse),
            ) {
                states.insert(order, status);
            }
        }
    }
    states
}

fn write_step_state(context: &mut JsonValue, order: i64, status: StepStatus) {
    let root = ensure_object(context);
    let meta = ensure_object(root.entry("meta").or_insert_with(|| json!({})));
    let steps = ensure_object(meta.entry("steps").or_insert_with(|| json!({})));
    steps.insert(order.to_string(), json!(status.as_str()));
}

fn set_context_value(context: &mut JsonValue, key: &str, value: JsonValue) {
    ensure_object(context).insert(key.to_string(), value);
}

fn ensure_object(value: &mut JsonValue) -> &mut Map<String, JsonValue> {
    if !value.is_object() {
        *value = json!({});
    }
    value.as_object_mut().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowllm::model::StepKind;

    fn step(order: i64, depends_on: Vec<i64>, output: Option<&str>) -> WorkflowStepRecord {
        WorkflowStepRecord {
            id: order,
            workflow_id: 1,
            step_order: order,
            kind: StepKind::AgentExecution,
            name: format!("step-{}", order),
            agent_id: Some(1),
            input_mapping: json!({}),
            output_variable: output.map(|s| s.to_string()),
            condition_expression: None,
            depends_on,
            approval_config: None,
            retry_config: None,
            timeout_seconds: 300,
        }
    }

    #[test]
    fn accepts_a_linear_graph() {
        let steps = vec![step(1, vec![], None), step(2, vec![1], None)];
        assert!(validate_graph(&steps).is_ok());
    }

    #[test]
    fn rejects_cycles() {
        let steps = vec![step(1, vec![2], None), step(2, vec![1], None)];
        assert!(matches!(
            validate_graph(&steps),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn rejects_unknown_dependencies() {
        let steps = vec![step(1, vec![9], None)];
        assert!(validate_graph(&steps).is_err());
    }

    #[test]
    fn rejects_concurrent_output_collisions() {
        let steps = vec![step(1, vec![], Some("out")), step(2, vec![], Some("out"))];
        assert!(validate_graph(&steps).is_err());
        // Ordered writers may share a key.
        let steps = vec![step(1, vec![], Some("out")), step(2, vec![1], Some("out"))];
        assert!(validate_graph(&steps).is_ok());
    }

    #[test]
    fn step_state_frame_round_trips() {
        let mut context = json!({"trigger": {}});
        write_step_state(&mut context, 1, StepStatus::Completed);
        write_step_state(&mut context, 2, StepStatus::Skipped);
        let states = read_step_states(&context);
        assert_eq!(states.get(&1), Some(&StepStatus::Completed));
        assert_eq!(states.get(&2), Some(&StepStatus::Skipped));
    }
}
