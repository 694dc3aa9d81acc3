//! Persisted entities.
//!
//! Everything the engine orchestrates (agents, tools, workflow graphs,
//! executions, approvals, schedules) is a database record. The structs
//! here are the in-memory shape of those rows; JSON-typed columns are
//! surfaced as `serde_json::Value` so the engine stays free of hard-coded
//! business payloads.
//!
//! Status enums serialize as SCREAMING_SNAKE strings both in JSON and in
//! their TEXT columns, so the database is greppable and the wire format
//! matches the persisted one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// How a tool call is carried out once the dispatcher resolves its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    /// In-process handler located by its registered symbol.
    Builtin,
    /// External JSON-RPC 2.0 endpoint (`tools/call`).
    Rpc,
    /// Domain API handler; resolved through the in-process registry like
    /// `Builtin`, kept as a distinct tag for cataloguing.
    Api,
}

impl ToolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::Builtin => "builtin",
            ToolKind::Rpc => "rpc",
            ToolKind::Api => "api",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "builtin" => Some(ToolKind::Builtin),
            "rpc" => Some(ToolKind::Rpc),
            "api" => Some(ToolKind::Api),
            _ => None,
        }
    }
}

/// What causes a workflow to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerKind {
    Manual,
    Scheduled,
    Event,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Manual => "MANUAL",
            TriggerKind::Scheduled => "SCHEDULED",
            TriggerKind::Event => "EVENT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MANUAL" => Some(TriggerKind::Manual),
            "SCHEDULED" => Some(TriggerKind::Scheduled),
            "EVENT" => Some(TriggerKind::Event),
            _ => None,
        }
    }
}

/// Whether `execute_workflow` blocks for the terminal state or returns
/// as soon as the execution row exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    Sync,
    Async,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Sync => "SYNC",
            ExecutionMode::Async => "ASYNC",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SYNC" => Some(ExecutionMode::Sync),
            "ASYNC" => Some(ExecutionMode::Async),
            _ => None,
        }
    }
}

/// Frontend surface a workflow is authored for. Opaque to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterfaceKind {
    Form,
    Chat,
    Api,
    Custom,
}

impl InterfaceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterfaceKind::Form => "FORM",
            InterfaceKind::Chat => "CHAT",
            InterfaceKind::Api => "API",
            InterfaceKind::Custom => "CUSTOM",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "FORM" => Some(InterfaceKind::Form),
            "CHAT" => Some(InterfaceKind::Chat),
            "API" => Some(InterfaceKind::Api),
            "CUSTOM" => Some(InterfaceKind::Custom),
            _ => None,
        }
    }
}

/// Node kind inside a workflow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    AgentExecution,
    Approval,
    Condition,
    Parallel,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::AgentExecution => "AGENT_EXECUTION",
            StepKind::Approval => "APPROVAL",
            StepKind::Condition => "CONDITION",
            StepKind::Parallel => "PARALLEL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "AGENT_EXECUTION" => Some(StepKind::AgentExecution),
            "APPROVAL" => Some(StepKind::Approval),
            "CONDITION" => Some(StepKind::Condition),
            "PARALLEL" => Some(StepKind::Parallel),
            _ => None,
        }
    }
}

/// Lifecycle of a workflow run.
///
/// Legal transitions:
/// `PENDING → RUNNING → (AWAITING_APPROVAL ⇄ RUNNING)* →
/// {COMPLETED, FAILED, CANCELLED}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    AwaitingApproval,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Cancelled => "CANCELLED",
            ExecutionStatus::AwaitingApproval => "AWAITING_APPROVAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ExecutionStatus::Pending),
            "RUNNING" => Some(ExecutionStatus::Running),
            "COMPLETED" => Some(ExecutionStatus::Completed),
            "FAILED" => Some(ExecutionStatus::Failed),
            "CANCELLED" => Some(ExecutionStatus::Cancelled),
            "AWAITING_APPROVAL" => Some(ExecutionStatus::AwaitingApproval),
            _ => None,
        }
    }

    /// Whether the execution can never change state again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// Lifecycle of a single agent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl AgentRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRunStatus::Pending => "PENDING",
            AgentRunStatus::Running => "RUNNING",
            AgentRunStatus::Completed => "COMPLETED",
            AgentRunStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(AgentRunStatus::Pending),
            "RUNNING" => Some(AgentRunStatus::Running),
            "COMPLETED" => Some(AgentRunStatus::Completed),
            "FAILED" => Some(AgentRunStatus::Failed),
            _ => None,
        }
    }
}

/// Lifecycle of a human approval gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Timeout,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "PENDING",
            ApprovalStatus::Approved => "APPROVED",
            ApprovalStatus::Rejected => "REJECTED",
            ApprovalStatus::Timeout => "TIMEOUT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ApprovalStatus::Pending),
            "APPROVED" => Some(ApprovalStatus::Approved),
            "REJECTED" => Some(ApprovalStatus::Rejected),
            "TIMEOUT" => Some(ApprovalStatus::Timeout),
            _ => None,
        }
    }
}

/// Per-step terminal status recorded in the execution's resumable frame
/// (`context.meta.steps`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Completed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Completed => "COMPLETED",
            StepStatus::Skipped => "SKIPPED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "COMPLETED" => Some(StepStatus::Completed),
            "SKIPPED" => Some(StepStatus::Skipped),
            _ => None,
        }
    }
}

/// An LLM persona: provider/model selection, system prompt, sampling
/// parameters, and a free-form config blob (e.g. `sub_agents` ids).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: i64,
    pub name: String,
    pub provider: String,
    pub model: String,
    pub system_prompt: String,
    pub temperature: f64,
    pub max_tokens: i64,
    pub config: JsonValue,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A capability descriptor the dispatcher can resolve by name.
///
/// `handler` is the registered symbol for `builtin`/`api` tools and the
/// JSON-RPC endpoint URL for `rpc` tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRecord {
    pub id: i64,
    pub name: String,
    pub kind: ToolKind,
    pub description: String,
    pub input_schema: JsonValue,
    pub handler: String,
    pub active: bool,
}

/// Agent-to-tool binding with an optional per-binding config blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentToolBinding {
    pub agent_id: i64,
    pub tool_id: i64,
    pub config: Option<JsonValue>,
}

/// A named, versioned graph of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub trigger_kind: TriggerKind,
    pub trigger_config: JsonValue,
    pub execution_mode: ExecutionMode,
    pub input_schema: JsonValue,
    pub interface_kind: InterfaceKind,
    pub public: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// A node of the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStepRecord {
    pub id: i64,
    pub workflow_id: i64,
    pub step_order: i64,
    pub kind: StepKind,
    pub name: String,
    pub agent_id: Option<i64>,
    /// Template tree expanded against live context to build agent input.
    pub input_mapping: JsonValue,
    /// Context key the step's result lands under; defaults to
    /// `step{N}` / `approval{N}` when empty.
    pub output_variable: Option<String>,
    pub condition_expression: Option<String>,
    /// `step_order`s that must be COMPLETED or SKIPPED first.
    pub depends_on: Vec<i64>,
    pub approval_config: Option<ApprovalConfig>,
    pub retry_config: Option<RetryConfig>,
    pub timeout_seconds: i64,
}

impl WorkflowStepRecord {
    /// Context key this step's output is stored under.
    pub fn output_key(&self) -> String {
        match &self.output_variable {
            Some(v) if !v.is_empty() => v.clone(),
            _ => match self.kind {
                StepKind::Approval => format!("approval{}", self.step_order),
                _ => format!("step{}", self.step_order),
            },
        }
    }
}

/// Approval gate parameters carried on APPROVAL steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    #[serde(rename = "requiredRole", default, skip_serializing_if = "Option::is_none")]
    pub required_role: Option<String>,
    #[serde(rename = "timeoutMinutes", default, skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<i64>,
}

/// Exponential backoff policy for a step.
///
/// `delay = min(initial_delay_ms * multiplier^attempt, max_delay_ms)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(rename = "maxRetries")]
    pub max_retries: u32,
    #[serde(rename = "initialDelayMs")]
    pub initial_delay_ms: u64,
    #[serde(default = "RetryConfig::default_multiplier")]
    pub multiplier: f64,
    #[serde(rename = "maxDelayMs", default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
}

impl RetryConfig {
    fn default_multiplier() -> f64 {
        2.0
    }

    /// Backoff before retry number `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let raw = self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        let capped = match self.max_delay_ms {
            Some(max) => raw.min(max as f64),
            None => raw,
        };
        std::time::Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// One run of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecutionRecord {
    pub id: i64,
    pub workflow_id: i64,
    pub status: ExecutionStatus,
    pub trigger_data: JsonValue,
    /// Monotonically growing context map; also carries the resumable
    /// frame under `meta.steps`.
    pub context: JsonValue,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One agent invocation, optionally owned by a workflow step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecutionRecord {
    pub id: i64,
    pub agent_id: i64,
    pub workflow_execution_id: Option<i64>,
    pub workflow_step_id: Option<i64>,
    pub status: AgentRunStatus,
    pub input: JsonValue,
    pub output: Option<JsonValue>,
    pub tokens_used: i64,
    pub execution_time_ms: i64,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Durable record of a human gate on an APPROVAL step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequestRecord {
    pub id: i64,
    pub workflow_execution_id: i64,
    pub workflow_step_id: i64,
    pub status: ApprovalStatus,
    pub required_role: Option<String>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub comments: Option<String>,
    pub timeout_at: DateTime<Utc>,
    pub requested_at: DateTime<Utc>,
}

/// Cron binding that fires a workflow with captured trigger data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowScheduleRecord {
    pub id: i64,
    pub workflow_id: i64,
    pub cron_expression: String,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    pub trigger_data: JsonValue,
}
