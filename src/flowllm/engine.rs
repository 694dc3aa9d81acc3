//! Engine facade.
//!
//! [`FlowEngine`] wires the subsystems together (store, gateway router,
//! tool dispatcher, agent runner, orchestrator, approval coordinator,
//! scheduler) and exposes the command surface external collaborators
//! (REST handlers, CLIs, cron) talk to. Requests and responses are plain
//! data; the engine accepts caller identity verbatim and performs no
//! access control of its own.
//!
//! # Example
//!
//! ```rust,no_run
//! use flowllm::engine::FlowEngine;
//! use flowllm::gateway::{GatewayRouter, HttpGateway};
//! use flowllm::store::Store;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn demo() {
//! let store = Store::open("flowllm.db").await.unwrap();
//! let mut gateways = GatewayRouter::new();
//! gateways.register(Arc::new(HttpGateway::new("https://llm.example.com", "key")));
//!
//! let engine = FlowEngine::new(store, gateways).await;
//! let outcome = engine.execute_workflow(1, json!({"sku": "A-113"})).await.unwrap();
//! println!("{} -> {:?}", outcome.execution_id, outcome.status);
//! # }
//! ```

use crate::flowllm::agent_runner::{AgentRunOutcome, AgentRunner, DEFAULT_MAX_ITERATIONS};
use crate::flowllm::approval::ApprovalCoordinator;
use crate::flowllm::dispatcher::{CallScope, ToolDispatcher, ToolHandler};
use crate::flowllm::error::EngineError;
use crate::flowllm::gateway::GatewayRouter;
use crate::flowllm::model::*;
use crate::flowllm::orchestrator::{
    validate_graph, ExecutionOutcome, Orchestrator, DEFAULT_STEP_TIMEOUT_SECS,
    MAX_STEP_TIMEOUT_SECS,
};
use crate::flowllm::scheduler::{Scheduler, DEFAULT_TICK_INTERVAL};
use crate::flowllm::schema::validate_schema;
use crate::flowllm::store::{NewAgent, NewTool, NewWorkflow, NewWorkflowStep, Store};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Handle to a running scheduler loop.
pub struct SchedulerHandle {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal the loop and wait for it to exit.
    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.handle.await;
    }
}

/// Configures and assembles a [`FlowEngine`].
pub struct FlowEngineBuilder {
    store: Store,
    gateways: GatewayRouter,
    max_agent_iterations: usize,
    default_step_timeout: Duration,
    scheduler_tick_interval: Duration,
}

impl FlowEngineBuilder {
    /// Cap on LLM round-trips per agent run.
    pub fn with_max_agent_iterations(mut self, max: usize) -> Self {
        self.max_agent_iterations = max;
        self
    }

    /// Deadline applied to steps that do not set their own.
    pub fn with_default_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout = timeout;
        self
    }

    /// Interval between scheduler scans.
    pub fn with_scheduler_tick_interval(mut self, interval: Duration) -> Self {
        self.scheduler_tick_interval = interval;
        self
    }

    pub async fn build(self) -> FlowEngine {
        let gateways = Arc::new(self.gateways);
        let dispatcher = Arc::new(ToolDispatcher::new(self.store.clone()));
        let runner = Arc::new(
            AgentRunner::new(
                self.store.clone(),
                Arc::clone(&gateways),
                Arc::clone(&dispatcher),
            )
            .with_max_iterations(self.max_agent_iterations),
        );
        // The dispatcher routes invoke_agent_<id> calls back into the
        // runner through this seam.
        dispatcher.set_agent_invoker(runner.clone()).await;

        let orchestrator = Arc::new(
            Orchestrator::new(self.store.clone(), Arc::clone(&runner))
                .with_default_step_timeout(self.default_step_timeout),
        );
        let approvals = ApprovalCoordinator::new(self.store.clone(), Arc::clone(&orchestrator));
        let scheduler = Arc::new(
            Scheduler::new(self.store.clone(), Arc::clone(&orchestrator))
                .with_tick_interval(self.scheduler_tick_interval),
        );

        FlowEngine {
            store: self.store,
            dispatcher,
            runner,
            orchestrator,
            approvals,
            scheduler,
        }
    }
}

/// The assembled engine. Clone-free; share it behind an `Arc` when
/// multiple surfaces need it.
pub struct FlowEngine {
    store: Store,
    dispatcher: Arc<ToolDispatcher>,
    runner: Arc<AgentRunner>,
    orchestrator: Arc<Orchestrator>,
    approvals: ApprovalCoordinator,
    scheduler: Arc<Scheduler>,
}

impl FlowEngine {
    /// Assemble an engine with default runtime toggles.
    pub async fn new(store: Store, gateways: GatewayRouter) -> Self {
        Self::builder(store, gateways).build().await
    }

    pub fn builder(store: Store, gateways: GatewayRouter) -> FlowEngineBuilder {
        FlowEngineBuilder {
            store,
            gateways,
            max_agent_iterations: DEFAULT_MAX_ITERATIONS,
            default_step_timeout: Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECS as u64),
            scheduler_tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }

    // ---- orchestrator commands ----

    /// Run a workflow with the given trigger data, sync or async per the
    /// workflow's execution mode.
    pub async fn execute_workflow(
        &self,
        workflow_id: i64,
        trigger_data: JsonValue,
    ) -> Result<ExecutionOutcome, EngineError> {
        self.orchestrator.execute(workflow_id, trigger_data).await
    }

    /// Run a workflow on behalf of an unauthenticated surface; rejected
    /// unless the workflow's public flag is set.
    pub async fn execute_public_workflow(
        &self,
        workflow_id: i64,
        input: JsonValue,
    ) -> Result<ExecutionOutcome, EngineError> {
        self.orchestrator.execute_public(workflow_id, input).await
    }

    pub async fn cancel_execution(&self, execution_id: i64) -> Result<(), EngineError> {
        self.orchestrator.cancel(execution_id).await
    }

    /// Latest persisted state of an execution.
    pub async fn execution_outcome(
        &self,
        execution_id: i64,
    ) -> Result<ExecutionOutcome, EngineError> {
        self.orchestrator.outcome(execution_id).await
    }

    pub async fn get_execution(
        &self,
        execution_id: i64,
    ) -> Result<WorkflowExecutionRecord, EngineError> {
        self.store.get_execution(execution_id).await
    }

    pub async fn agent_executions_for(
        &self,
        execution_id: i64,
    ) -> Result<Vec<AgentExecutionRecord>, EngineError> {
        self.store.agent_executions_for(execution_id).await
    }

    // ---- agent commands ----

    /// Run a single agent outside any workflow.
    pub async fn execute_agent(
        &self,
        agent_id: i64,
        input: JsonValue,
    ) -> Result<AgentRunOutcome, EngineError> {
        self.runner.run(agent_id, input, CallScope::default()).await
    }

    pub async fn create_agent(&self, new: NewAgent) -> Result<AgentRecord, EngineError> {
        validate_new_agent(&new)?;
        self.store.insert_agent(new).await
    }

    pub async fn get_agent(&self, id: i64) -> Result<AgentRecord, EngineError> {
        self.store.get_agent(id).await
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentRecord>, EngineError> {
        self.store.list_agents().await
    }

    pub async fn update_agent(&self, agent: &AgentRecord) -> Result<(), EngineError> {
        if !(0.0..=2.0).contains(&agent.temperature) {
            return Err(EngineError::Validation(
                "temperature must be within 0.0..=2.0".into(),
            ));
        }
        if agent.max_tokens < 1 {
            return Err(EngineError::Validation("max_tokens must be >= 1".into()));
        }
        self.store.get_agent(agent.id).await?;
        self.store.update_agent(agent).await
    }

    /// Soft-deactivate; existing references keep resolving but the agent
    /// refuses new runs.
    pub async fn deactivate_agent(&self, id: i64) -> Result<(), EngineError> {
        self.store.get_agent(id).await?;
        self.store.set_agent_active(id, false).await
    }

    /// Hard delete, refused while an active workflow step references the
    /// agent (deactivate instead).
    pub async fn delete_agent(&self, id: i64) -> Result<(), EngineError> {
        self.store.get_agent(id).await?;
        let references = self.store.count_active_steps_for_agent(id).await?;
        if references > 0 {
            return Err(EngineError::Validation(format!(
                "agent {} is referenced by {} active workflow step(s); deactivate it instead",
                id, references
            )));
        }
        self.store.delete_agent(id).await
    }

    // ---- tool commands ----

    pub async fn create_tool(&self, new: NewTool) -> Result<ToolRecord, EngineError> {
        if new.name.trim().is_empty() {
            return Err(EngineError::Validation("tool name must not be empty".into()));
        }
        if new.handler.trim().is_empty() {
            return Err(EngineError::Validation(
                "tool handler must not be empty".into(),
            ));
        }
        validate_schema(&new.input_schema)?;
        self.store.insert_tool(new).await
    }

    pub async fn get_tool(&self, id: i64) -> Result<ToolRecord, EngineError> {
        self.store.get_tool(id).await
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolRecord>, EngineError> {
        self.store.list_tools().await
    }

    pub async fn deactivate_tool(&self, id: i64) -> Result<(), EngineError> {
        self.store.get_tool(id).await?;
        self.store.set_tool_active(id, false).await
    }

    /// Hard delete, refused while agent bindings reference the tool.
    pub async fn delete_tool(&self, id: i64) -> Result<(), EngineError> {
        self.store.get_tool(id).await?;
        let bindings = self.store.count_bindings_for_tool(id).await?;
        if bindings > 0 {
            return Err(EngineError::Validation(format!(
                "tool {} is bound to {} agent(s); deactivate it instead",
                id, bindings
            )));
        }
        self.store.delete_tool(id).await
    }

    /// Register the in-process handler behind a `builtin`/`api` tool.
    pub async fn register_tool_handler(
        &self,
        symbol: impl Into<String>,
        handler: Arc<dyn ToolHandler>,
    ) {
        self.dispatcher.register_handler(symbol, handler).await;
    }

    // ---- agent-tool bindings ----

    pub async fn bind_tool_to_agent(
        &self,
        agent_id: i64,
        tool_id: i64,
        config: Option<JsonValue>,
    ) -> Result<(), EngineError> {
        self.store.get_agent(agent_id).await?;
        self.store.get_tool(tool_id).await?;
        self.store.bind_tool(agent_id, tool_id, config).await
    }

    pub async fn unbind_tool_from_agent(
        &self,
        agent_id: i64,
        tool_id: i64,
    ) -> Result<(), EngineError> {
        self.store.unbind_tool(agent_id, tool_id).await
    }

    pub async fn tools_for_agent(&self, agent_id: i64) -> Result<Vec<ToolRecord>, EngineError> {
        self.store.tools_for_agent(agent_id).await
    }

    // ---- workflow commands ----

    /// Create a workflow together with its steps. The whole graph is
    /// validated up front: schema subset, step orders, agent references,
    /// dependency shape, retry/approval configs, timeouts.
    pub async fn create_workflow(
        &self,
        new: NewWorkflow,
        steps: Vec<NewWorkflowStep>,
    ) -> Result<(WorkflowRecord, Vec<WorkflowStepRecord>), EngineError> {
        if new.name.trim().is_empty() {
            return Err(EngineError::Validation(
                "workflow name must not be empty".into(),
            ));
        }
        if !is_empty_schema(&new.input_schema) {
            validate_schema(&new.input_schema)?;
        }
        let mut normalized = Vec::with_capacity(steps.len());
        for step in steps {
            normalized.push(self.validate_new_step(step).await?);
        }
        validate_graph(&as_records(&normalized))?;
        self.store.insert_workflow(new, normalized).await
    }

    pub async fn get_workflow(
        &self,
        id: i64,
    ) -> Result<(WorkflowRecord, Vec<WorkflowStepRecord>), EngineError> {
        self.store.load_workflow_with_steps(id).await
    }

    pub async fn list_workflows(&self) -> Result<Vec<WorkflowRecord>, EngineError> {
        self.store.list_workflows().await
    }

    pub async fn deactivate_workflow(&self, id: i64) -> Result<(), EngineError> {
        self.store.get_workflow(id).await?;
        self.store.set_workflow_active(id, false).await
    }

    pub async fn activate_workflow(&self, id: i64) -> Result<(), EngineError> {
        self.store.get_workflow(id).await?;
        self.store.set_workflow_active(id, true).await
    }

    /// Replace a step's definition; the whole owning graph is revalidated
    /// with the replacement in place before anything is written.
    pub async fn update_workflow_step(&self, step: &WorkflowStepRecord) -> Result<(), EngineError> {
        let current = self.store.get_step(step.id).await?;
        if current.workflow_id != step.workflow_id {
            return Err(EngineError::Validation(format!(
                "step {} belongs to workflow {}, not {}",
                step.id, current.workflow_id, step.workflow_id
            )));
        }
        if step.timeout_seconds <= 0 || step.timeout_seconds > MAX_STEP_TIMEOUT_SECS {
            return Err(EngineError::Validation(format!(
                "step {} timeout must be within 1..={}s",
                step.step_order, MAX_STEP_TIMEOUT_SECS
            )));
        }
        if let Some(agent_id) = step.agent_id {
            self.store.get_agent(agent_id).await?;
        }
        self.validate_step_configs(step.step_order, &step.retry_config, &step.approval_config)?;

        let (_, steps) = self.store.load_workflow_with_steps(step.workflow_id).await?;
        let replaced: Vec<WorkflowStepRecord> = steps
            .into_iter()
            .map(|s| if s.id == step.id { step.clone() } else { s })
            .collect();
        validate_graph(&replaced)?;
        self.store.update_step(step).await
    }

    /// Remove a step; refused if the remaining graph would be invalid
    /// (e.g. another step still depends on it).
    pub async fn delete_workflow_step(&self, step_id: i64) -> Result<(), EngineError> {
        let step = self.store.get_step(step_id).await?;
        let (_, steps) = self.store.load_workflow_with_steps(step.workflow_id).await?;
        let remaining: Vec<WorkflowStepRecord> =
            steps.into_iter().filter(|s| s.id != step_id).collect();
        validate_graph(&remaining)?;
        self.store.delete_step(step_id).await
    }

    async fn validate_new_step(
        &self,
        mut step: NewWorkflowStep,
    ) -> Result<NewWorkflowStep, EngineError> {
        if step.timeout_seconds <= 0 {
            step.timeout_seconds = DEFAULT_STEP_TIMEOUT_SECS;
        }
        if step.timeout_seconds > MAX_STEP_TIMEOUT_SECS {
            return Err(EngineError::Validation(format!(
                "step {} timeout {}s exceeds the {}s ceiling",
                step.step_order, step.timeout_seconds, MAX_STEP_TIMEOUT_SECS
            )));
        }
        if let Some(agent_id) = step.agent_id {
            self.store.get_agent(agent_id).await?;
        }
        if step.kind == StepKind::AgentExecution && step.agent_id.is_none() {
            return Err(EngineError::Validation(format!(
                "AGENT_EXECUTION step {} needs an agent reference",
                step.step_order
            )));
        }
        self.validate_step_configs(step.step_order, &step.retry_config, &step.approval_config)?;
        Ok(step)
    }

    fn validate_step_configs(
        &self,
        step_order: i64,
        retry: &Option<RetryConfig>,
        approval: &Option<ApprovalConfig>,
    ) -> Result<(), EngineError> {
        if let Some(retry) = retry {
            if retry.initial_delay_ms == 0 {
                return Err(EngineError::Validation(format!(
                    "step {}: initialDelayMs must be > 0",
                    step_order
                )));
            }
            if retry.multiplier < 1.0 {
                return Err(EngineError::Validation(format!(
                    "step {}: multiplier must be >= 1",
                    step_order
                )));
            }
        }
        if let Some(approval) = approval {
            if let Some(minutes) = approval.timeout_minutes {
                if minutes <= 0 {
                    return Err(EngineError::Validation(format!(
                        "step {}: timeoutMinutes must be > 0",
                        step_order
                    )));
                }
            }
        }
        Ok(())
    }

    // ---- approval commands ----

    pub async fn create_approval(
        &self,
        execution_id: i64,
        step_id: i64,
        required_role: Option<&str>,
        timeout_minutes: i64,
    ) -> Result<ApprovalRequestRecord, EngineError> {
        self.approvals
            .create(execution_id, step_id, required_role, timeout_minutes)
            .await
    }

    pub async fn approve(
        &self,
        request_id: i64,
        identity: &str,
        comments: Option<&str>,
    ) -> Result<(), EngineError> {
        self.approvals.approve(request_id, identity, comments).await
    }

    pub async fn reject(
        &self,
        request_id: i64,
        identity: &str,
        reason: Option<&str>,
    ) -> Result<(), EngineError> {
        self.approvals.reject(request_id, identity, reason).await
    }

    pub async fn list_pending_approvals(
        &self,
        role: Option<&str>,
    ) -> Result<Vec<ApprovalRequestRecord>, EngineError> {
        self.approvals.list_pending(role).await
    }

    pub async fn count_pending_approvals(&self) -> Result<i64, EngineError> {
        self.approvals.count_pending().await
    }

    pub async fn sweep_approval_timeouts(&self) -> Result<usize, EngineError> {
        self.approvals.sweep_timeouts().await
    }

    // ---- schedule commands ----

    pub async fn create_schedule(
        &self,
        workflow_id: i64,
        cron_expression: &str,
        trigger_data: JsonValue,
    ) -> Result<WorkflowScheduleRecord, EngineError> {
        self.scheduler
            .create(workflow_id, cron_expression, trigger_data)
            .await
    }

    pub async fn cancel_schedule(&self, schedule_id: i64) -> Result<(), EngineError> {
        self.scheduler.cancel(schedule_id).await
    }

    pub async fn reactivate_schedule(&self, schedule_id: i64) -> Result<(), EngineError> {
        self.scheduler.reactivate(schedule_id).await
    }

    pub async fn update_schedule_cron(
        &self,
        schedule_id: i64,
        cron_expression: &str,
    ) -> Result<(), EngineError> {
        self.scheduler.update_cron(schedule_id, cron_expression).await
    }

    pub async fn update_schedule_trigger_data(
        &self,
        schedule_id: i64,
        trigger_data: JsonValue,
    ) -> Result<(), EngineError> {
        self.scheduler
            .update_trigger_data(schedule_id, trigger_data)
            .await
    }

    pub async fn list_schedules_for_workflow(
        &self,
        workflow_id: i64,
    ) -> Result<Vec<WorkflowScheduleRecord>, EngineError> {
        self.scheduler.list_for_workflow(workflow_id).await
    }

    /// Spawn the background tick loop. Call [`SchedulerHandle::stop`] to
    /// shut it down.
    pub fn start_scheduler(&self) -> SchedulerHandle {
        let shutdown = CancellationToken::new();
        let handle = Scheduler::spawn(Arc::clone(&self.scheduler), shutdown.clone());
        SchedulerHandle { shutdown, handle }
    }

    // ---- component access for advanced embedders ----

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn approvals(&self) -> &ApprovalCoordinator {
        &self.approvals
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }
}

fn validate_new_agent(new: &NewAgent) -> Result<(), EngineError> {
    if new.name.trim().is_empty() {
        return Err(EngineError::Validation("agent name must not be empty".into()));
    }
    if !(0.0..=2.0).contains(&new.temperature) {
        return Err(EngineError::Validation(
            "temperature must be within 0.0..=2.0".into(),
        ));
    }
    if new.max_tokens < 1 {
        return Err(EngineError::Validation("max_tokens must be >= 1".into()));
    }
    Ok(())
}

fn is_empty_schema(schema: &JsonValue) -> bool {
    schema.as_object().map(|o| o.is_empty()).unwrap_or(false)
}

/// Shape new steps as records so the graph validator can run before
/// anything is persisted.
fn as_records(steps: &[NewWorkflowStep]) -> Vec<WorkflowStepRecord> {
    steps
        .iter()
        .map(|s| WorkflowStepRecord {
            id: 0,
            workflow_id: 0,
            step_order: s.step_order,
            kind: s.kind,
            name: s.name.clone(),
            agent_id: s.agent_id,
            input_mapping: s.input_mapping.clone(),
            output_variable: s.output_variable.clone(),
            condition_expression: s.condition_expression.clone(),
            depends_on: s.depends_on.clone(),
            approval_config: s.approval_config.clone(),
            retry_config: s.retry_config.clone(),
            timeout_seconds: s.timeout_seconds,
        })
        .collect()
}
