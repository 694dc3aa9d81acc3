//! SQLite persistence.
//!
//! [`Store`] is the single shared mutable resource of the engine: agents,
//! tools, workflow graphs, executions, approvals, and schedules all live
//! here. JSON-typed attributes are TEXT columns round-tripped through
//! `serde_json`; timestamps are RFC 3339 TEXT via chrono.
//!
//! Writes that race with other actors (approval resolution, scheduler
//! fires, cancellation) are optimistic transitions: `UPDATE … WHERE
//! status = <expected>` with a zero rowcount meaning "already handled".
//!
//! # Example
//!
//! ```rust,no_run
//! use flowllm::store::Store;
//!
//! # async {
//! let store = Store::open("flowllm.db").await.unwrap();
//! let agents = store.list_agents().await.unwrap();
//! println!("{} agents defined", agents.len());
//! # };
//! ```

use crate::flowllm::error::EngineError;
use crate::flowllm::model::*;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS agents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    system_prompt TEXT NOT NULL,
    temperature REAL NOT NULL,
    max_tokens INTEGER NOT NULL,
    config TEXT NOT NULL DEFAULT '{}',
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tools (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    kind TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    input_schema TEXT NOT NULL,
    handler TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS agent_tools (
    agent_id INTEGER NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
    tool_id INTEGER NOT NULL REFERENCES tools(id) ON DELETE CASCADE,
    config TEXT,
    PRIMARY KEY (agent_id, tool_id)
);

CREATE TABLE IF NOT EXISTS workflows (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    trigger_kind TEXT NOT NULL,
    trigger_config TEXT NOT NULL DEFAULT '{}',
    execution_mode TEXT NOT NULL,
    input_schema TEXT NOT NULL DEFAULT '{}',
    interface_kind TEXT NOT NULL,
    public INTEGER NOT NULL DEFAULT 0,
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workflow_steps (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    workflow_id INTEGER NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
    step_order INTEGER NOT NULL,
    kind TEXT NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    agent_id INTEGER REFERENCES agents(id),
    input_mapping TEXT NOT NULL DEFAULT '{}',
    output_variable TEXT,
    condition_expression TEXT,
    depends_on TEXT NOT NULL DEFAULT '[]',
    approval_config TEXT,
    retry_config TEXT,
    timeout_seconds INTEGER NOT NULL DEFAULT 300,
    UNIQUE (workflow_id, step_order)
);

CREATE TABLE IF NOT EXISTS workflow_executions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    workflow_id INTEGER NOT NULL REFERENCES workflows(id),
    status TEXT NOT NULL,
    trigger_data TEXT NOT NULL DEFAULT '{}',
    context_data TEXT NOT NULL DEFAULT '{}',
    started_at TEXT,
    completed_at TEXT,
    error_message TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_executions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id INTEGER NOT NULL REFERENCES agents(id),
    workflow_execution_id INTEGER REFERENCES workflow_executions(id) ON DELETE CASCADE,
    workflow_step_id INTEGER,
    status TEXT NOT NULL,
    input TEXT NOT NULL DEFAULT '{}',
    output TEXT,
    tokens_used INTEGER NOT NULL DEFAULT 0,
    execution_time_ms INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    started_at TEXT,
    completed_at TEXT
);

CREATE TABLE IF NOT EXISTS approval_requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    workflow_execution_id INTEGER NOT NULL REFERENCES workflow_executions(id) ON DELETE CASCADE,
    workflow_step_id INTEGER NOT NULL,
    status TEXT NOT NULL,
    required_role TEXT,
    resolved_by TEXT,
    resolved_at TEXT,
    comments TEXT,
    timeout_at TEXT NOT NULL,
    requested_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workflow_schedules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    workflow_id INTEGER NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
    cron_expression TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    last_run_at TEXT,
    next_run_at TEXT NOT NULL,
    trigger_data TEXT NOT NULL DEFAULT '{}'
);
"#;

/// New-row payloads. Validation (schema subset, graph shape, sampling
/// ranges) happens in the engine before these reach the store.
#[derive(Debug, Clone)]
pub struct NewAgent {
    pub name: String,
    pub provider: String,
    pub model: String,
    pub system_prompt: String,
    pub temperature: f64,
    pub max_tokens: i64,
    pub config: JsonValue,
}

#[derive(Debug, Clone)]
pub struct NewTool {
    pub name: String,
    pub kind: ToolKind,
    pub description: String,
    pub input_schema: JsonValue,
    pub handler: String,
}

#[derive(Debug, Clone)]
pub struct NewWorkflow {
    pub name: String,
    pub description: String,
    pub trigger_kind: TriggerKind,
    pub trigger_config: JsonValue,
    pub execution_mode: ExecutionMode,
    pub input_schema: JsonValue,
    pub interface_kind: InterfaceKind,
    pub public: bool,
}

#[derive(Debug, Clone)]
pub struct NewWorkflowStep {
    pub step_order: i64,
    pub kind: StepKind,
    pub name: String,
    pub agent_id: Option<i64>,
    pub input_mapping: JsonValue,
    pub output_variable: Option<String>,
    pub condition_expression: Option<String>,
    pub depends_on: Vec<i64>,
    pub approval_config: Option<ApprovalConfig>,
    pub retry_config: Option<RetryConfig>,
    pub timeout_seconds: i64,
}

/// SQLite-backed durable store. Cheap to clone (shares the pool).
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if necessary) a database file and apply the schema.
    pub async fn open(path: &str) -> Result<Self, EngineError> {
        let url = format!("sqlite:{}?mode=rwc", path);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .after_connect(|conn, _| {
                Box::pin(async move {
                    sqlx::query("PRAGMA foreign_keys = ON")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(&url)
            .await?;
        Self::from_pool(pool).await
    }

    /// Open an in-memory database. A single connection is used so every
    /// query sees the same database.
    pub async fn open_in_memory() -> Result<Self, EngineError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .after_connect(|conn, _| {
                Box::pin(async move {
                    sqlx::query("PRAGMA foreign_keys = ON")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, EngineError> {
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if !statement.is_empty() {
                sqlx::query(statement).execute(&pool).await?;
            }
        }
        Ok(Self { pool })
    }

    // ---- agents ----

    pub async fn insert_agent(&self, new: NewAgent) -> Result<AgentRecord, EngineError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO agents (name, provider, model, system_prompt, temperature,
                                max_tokens, config, active, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?8)
            "#,
        )
        .bind(&new.name)
        .bind(&new.provider)
        .bind(&new.model)
        .bind(&new.system_prompt)
        .bind(new.temperature)
        .bind(new.max_tokens)
        .bind(new.config.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.get_agent(result.last_insert_rowid()).await
    }

    pub async fn get_agent(&self, id: i64) -> Result<AgentRecord, EngineError> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("agent {}", id)))?;
        row_to_agent(&row)
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentRecord>, EngineError> {
        let rows = sqlx::query("SELECT * FROM agents ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_agent).collect()
    }

    pub async fn update_agent(&self, agent: &AgentRecord) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            UPDATE agents
            SET name = ?2, provider = ?3, model = ?4, system_prompt = ?5,
                temperature = ?6, max_tokens = ?7, config = ?8, active = ?9,
                updated_at = ?10
            WHERE id = ?1
            "#,
        )
        .bind(agent.id)
        .bind(&agent.name)
        .bind(&agent.provider)
        .bind(&agent.model)
        .bind(&agent.system_prompt)
        .bind(agent.temperature)
        .bind(agent.max_tokens)
        .bind(agent.config.to_string())
        .bind(agent.active)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_agent_active(&self, id: i64, active: bool) -> Result<(), EngineError> {
        sqlx::query("UPDATE agents SET active = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id)
            .bind(active)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_agent(&self, id: i64) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM agents WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Number of steps in active workflows that reference this agent.
    pub async fn count_active_steps_for_agent(&self, agent_id: i64) -> Result<i64, EngineError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n
            FROM workflow_steps s
            JOIN workflows w ON w.id = s.workflow_id
            WHERE s.agent_id = ?1 AND w.active = 1
            "#,
        )
        .bind(agent_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n"))
    }

    // ---- tools ----

    pub async fn insert_tool(&self, new: NewTool) -> Result<ToolRecord, EngineError> {
        let result = sqlx::query(
            r#"
            INSERT INTO tools (name, kind, description, input_schema, handler, active)
            VALUES (?1, ?2, ?3, ?4, ?5, 1)
            "#,
        )
        .bind(&new.name)
        .bind(new.kind.as_str())
        .bind(&new.description)
        .bind(new.input_schema.to_string())
        .bind(&new.handler)
        .execute(&self.pool)
        .await?;
        self.get_tool(result.last_insert_rowid()).await
    }

    pub async fn get_tool(&self, id: i64) -> Result<ToolRecord, EngineError> {
        let row = sqlx::query("SELECT * FROM tools WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("tool {}", id)))?;
        row_to_tool(&row)
    }

    pub async fn get_tool_by_name(&self, name: &str) -> Result<Option<ToolRecord>, EngineError> {
        let row = sqlx::query("SELECT * FROM tools WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_tool).transpose()
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolRecord>, EngineError> {
        let rows = sqlx::query("SELECT * FROM tools ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_tool).collect()
    }

    pub async fn set_tool_active(&self, id: i64, active: bool) -> Result<(), EngineError> {
        sqlx::query("UPDATE tools SET active = ?2 WHERE id = ?1")
            .bind(id)
            .bind(active)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_tool(&self, id: i64) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM tools WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count_bindings_for_tool(&self, tool_id: i64) -> Result<i64, EngineError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM agent_tools WHERE tool_id = ?1")
            .bind(tool_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n"))
    }

    // ---- agent-tool bindings ----

    pub async fn bind_tool(
        &self,
        agent_id: i64,
        tool_id: i64,
        config: Option<JsonValue>,
    ) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO agent_tools (agent_id, tool_id, config)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (agent_id, tool_id) DO UPDATE SET config = excluded.config
            "#,
        )
        .bind(agent_id)
        .bind(tool_id)
        .bind(config.map(|c| c.to_string()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn unbind_tool(&self, agent_id: i64, tool_id: i64) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM agent_tools WHERE agent_id = ?1 AND tool_id = ?2")
            .bind(agent_id)
            .bind(tool_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Tools visible to an agent: bound via `agent_tools` with both sides
    /// active.
    pub async fn tools_for_agent(&self, agent_id: i64) -> Result<Vec<ToolRecord>, EngineError> {
        let rows = sqlx::query(
            r#"
            SELECT t.*
            FROM tools t
            JOIN agent_tools at ON at.tool_id = t.id
            JOIN agents a ON a.id = at.agent_id
            WHERE at.agent_id = ?1 AND t.active = 1 AND a.active = 1
            ORDER BY t.id
            "#,
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_tool).collect()
    }

    // ---- workflows & steps ----

    /// Insert a workflow together with its steps in one transaction.
    pub async fn insert_workflow(
        &self,
        new: NewWorkflow,
        steps: Vec<NewWorkflowStep>,
    ) -> Result<(WorkflowRecord, Vec<WorkflowStepRecord>), EngineError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            INSERT INTO workflows (name, description, trigger_kind, trigger_config,
                                   execution_mode, input_schema, interface_kind,
                                   public, active, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9)
            "#,
        )
        .bind(&new.name)
        .bind(&new.description)
        .bind(new.trigger_kind.as_str())
        .bind(new.trigger_config.to_string())
        .bind(new.execution_mode.as_str())
        .bind(new.input_schema.to_string())
        .bind(new.interface_kind.as_str())
        .bind(new.public)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        let workflow_id = result.last_insert_rowid();

        for step in &steps {
            sqlx::query(
                r#"
                INSERT INTO workflow_steps (workflow_id, step_order, kind, name, agent_id,
                                            input_mapping, output_variable,
                                            condition_expression, depends_on,
                                            approval_config, retry_config, timeout_seconds)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
            )
            .bind(workflow_id)
            .bind(step.step_order)
            .bind(step.kind.as_str())
            .bind(&step.name)
            .bind(step.agent_id)
            .bind(step.input_mapping.to_string())
            .bind(&step.output_variable)
            .bind(&step.condition_expression)
            .bind(serde_json::to_string(&step.depends_on)?)
            .bind(
                step.approval_config
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
            )
            .bind(
                step.retry_config
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
            )
            .bind(step.timeout_seconds)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        self.load_workflow_with_steps(workflow_id).await
    }

    pub async fn get_workflow(&self, id: i64) -> Result<WorkflowRecord, EngineError> {
        let row = sqlx::query("SELECT * FROM workflows WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("workflow {}", id)))?;
        row_to_workflow(&row)
    }

    /// One coherent read of a workflow and its ordered step list.
    pub async fn load_workflow_with_steps(
        &self,
        id: i64,
    ) -> Result<(WorkflowRecord, Vec<WorkflowStepRecord>), EngineError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM workflows WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("workflow {}", id)))?;
        let workflow = row_to_workflow(&row)?;
        let step_rows =
            sqlx::query("SELECT * FROM workflow_steps WHERE workflow_id = ?1 ORDER BY step_order")
                .bind(id)
                .fetch_all(&mut *tx)
                .await?;
        tx.commit().await?;
        let steps = step_rows
            .iter()
            .map(row_to_step)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((workflow, steps))
    }

    pub async fn list_workflows(&self) -> Result<Vec<WorkflowRecord>, EngineError> {
        let rows = sqlx::query("SELECT * FROM workflows ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_workflow).collect()
    }

    pub async fn set_workflow_active(&self, id: i64, active: bool) -> Result<(), EngineError> {
        sqlx::query("UPDATE workflows SET active = ?2 WHERE id = ?1")
            .bind(id)
            .bind(active)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_step(&self, step_id: i64) -> Result<WorkflowStepRecord, EngineError> {
        let row = sqlx::query("SELECT * FROM workflow_steps WHERE id = ?1")
            .bind(step_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("workflow step {}", step_id)))?;
        row_to_step(&row)
    }

    pub async fn update_step(&self, step: &WorkflowStepRecord) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            UPDATE workflow_steps
            SET step_order = ?2, kind = ?3, name = ?4, agent_id = ?5, input_mapping = ?6,
                output_variable = ?7, condition_expression = ?8, depends_on = ?9,
                approval_config = ?10, retry_config = ?11, timeout_seconds = ?12
            WHERE id = ?1
            "#,
        )
        .bind(step.id)
        .bind(step.step_order)
        .bind(step.kind.as_str())
        .bind(&step.name)
        .bind(step.agent_id)
        .bind(step.input_mapping.to_string())
        .bind(&step.output_variable)
        .bind(&step.condition_expression)
        .bind(serde_json::to_string(&step.depends_on)?)
        .bind(
            step.approval_config
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(
            step.retry_config
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(step.timeout_seconds)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_step(&self, step_id: i64) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM workflow_steps WHERE id = ?1")
            .bind(step_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- workflow executions ----

    pub async fn insert_execution(
        &self,
        workflow_id: i64,
        status: ExecutionStatus,
        trigger_data: &JsonValue,
        context: &JsonValue,
    ) -> Result<WorkflowExecutionRecord, EngineError> {
        let now = Utc::now();
        let started_at = match status {
            ExecutionStatus::Pending => None,
            _ => Some(now),
        };
        let result = sqlx::query(
            r#"
            INSERT INTO workflow_executions (workflow_id, status, trigger_data,
                                             context_data, started_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(workflow_id)
        .bind(status.as_str())
        .bind(trigger_data.to_string())
        .bind(context.to_string())
        .bind(started_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.get_execution(result.last_insert_rowid()).await
    }

    pub async fn get_execution(&self, id: i64) -> Result<WorkflowExecutionRecord, EngineError> {
        let row = sqlx::query("SELECT * FROM workflow_executions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("execution {}", id)))?;
        row_to_execution(&row)
    }

    pub async fn save_execution_context(
        &self,
        id: i64,
        context: &JsonValue,
    ) -> Result<(), EngineError> {
        sqlx::query("UPDATE workflow_executions SET context_data = ?2 WHERE id = ?1")
            .bind(id)
            .bind(context.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Optimistic status transition; `false` means another actor got
    /// there first.
    pub async fn transition_execution(
        &self,
        id: i64,
        expected: ExecutionStatus,
        to: ExecutionStatus,
    ) -> Result<bool, EngineError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = ?3,
                started_at = COALESCE(started_at, ?4)
            WHERE id = ?1 AND status = ?2
            "#,
        )
        .bind(id)
        .bind(expected.as_str())
        .bind(to.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Write the terminal state of an execution.
    pub async fn finish_execution(
        &self,
        id: i64,
        status: ExecutionStatus,
        error: Option<&str>,
    ) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = ?2, error_message = ?3, completed_at = ?4
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_execution_status(
        &self,
        id: i64,
        status: ExecutionStatus,
    ) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = ?2, started_at = COALESCE(started_at, ?3)
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn executions_for_workflow(
        &self,
        workflow_id: i64,
    ) -> Result<Vec<WorkflowExecutionRecord>, EngineError> {
        let rows =
            sqlx::query("SELECT * FROM workflow_executions WHERE workflow_id = ?1 ORDER BY id")
                .bind(workflow_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(row_to_execution).collect()
    }

    // ---- agent executions ----

    pub async fn insert_agent_execution(
        &self,
        agent_id: i64,
        workflow_execution_id: Option<i64>,
        workflow_step_id: Option<i64>,
        input: &JsonValue,
    ) -> Result<i64, EngineError> {
        let result = sqlx::query(
            r#"
            INSERT INTO agent_executions (agent_id, workflow_execution_id, workflow_step_id,
                                          status, input, started_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(agent_id)
        .bind(workflow_execution_id)
        .bind(workflow_step_id)
        .bind(AgentRunStatus::Running.as_str())
        .bind(input.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn complete_agent_execution(
        &self,
        id: i64,
        output: &JsonValue,
        tokens_used: i64,
        execution_time_ms: i64,
    ) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            UPDATE agent_executions
            SET status = ?2, output = ?3, tokens_used = ?4,
                execution_time_ms = ?5, completed_at = ?6
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(AgentRunStatus::Completed.as_str())
        .bind(output.to_string())
        .bind(tokens_used)
        .bind(execution_time_ms)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fail_agent_execution(
        &self,
        id: i64,
        error: &str,
        tokens_used: i64,
        execution_time_ms: i64,
    ) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            UPDATE agent_executions
            SET status = ?2, error_message = ?3, tokens_used = ?4,
                execution_time_ms = ?5, completed_at = ?6
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(AgentRunStatus::Failed.as_str())
        .bind(error)
        .bind(tokens_used)
        .bind(execution_time_ms)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn agent_executions_for(
        &self,
        workflow_execution_id: i64,
    ) -> Result<Vec<AgentExecutionRecord>, EngineError> {
        let rows =
            sqlx::query("SELECT * FROM agent_executions WHERE workflow_execution_id = ?1 ORDER BY id")
                .bind(workflow_execution_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(row_to_agent_execution).collect()
    }

    // ---- approvals ----

    pub async fn insert_approval(
        &self,
        workflow_execution_id: i64,
        workflow_step_id: i64,
        required_role: Option<&str>,
        timeout_at: DateTime<Utc>,
    ) -> Result<ApprovalRequestRecord, EngineError> {
        let result = sqlx::query(
            r#"
            INSERT INTO approval_requests (workflow_execution_id, workflow_step_id, status,
                                           required_role, timeout_at, requested_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(workflow_execution_id)
        .bind(workflow_step_id)
        .bind(ApprovalStatus::Pending.as_str())
        .bind(required_role)
        .bind(timeout_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        self.get_approval(result.last_insert_rowid()).await
    }

    pub async fn get_approval(&self, id: i64) -> Result<ApprovalRequestRecord, EngineError> {
        let row = sqlx::query("SELECT * FROM approval_requests WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("approval request {}", id)))?;
        row_to_approval(&row)
    }

    /// Most recent request for a step, regardless of status.
    pub async fn latest_approval_for_step(
        &self,
        workflow_execution_id: i64,
        workflow_step_id: i64,
    ) -> Result<Option<ApprovalRequestRecord>, EngineError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM approval_requests
            WHERE workflow_execution_id = ?1 AND workflow_step_id = ?2
            ORDER BY id DESC LIMIT 1
            "#,
        )
        .bind(workflow_execution_id)
        .bind(workflow_step_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_approval).transpose()
    }

    /// The at-most-one non-terminal request for a step, if any.
    pub async fn pending_approval_for_step(
        &self,
        workflow_execution_id: i64,
        workflow_step_id: i64,
    ) -> Result<Option<ApprovalRequestRecord>, EngineError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM approval_requests
            WHERE workflow_execution_id = ?1 AND workflow_step_id = ?2 AND status = 'PENDING'
            "#,
        )
        .bind(workflow_execution_id)
        .bind(workflow_step_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_approval).transpose()
    }

    /// Optimistic PENDING → terminal transition. `false` means the
    /// request was already resolved.
    pub async fn resolve_approval(
        &self,
        id: i64,
        to: ApprovalStatus,
        resolved_by: Option<&str>,
        comments: Option<&str>,
    ) -> Result<bool, EngineError> {
        let result = sqlx::query(
            r#"
            UPDATE approval_requests
            SET status = ?2, resolved_by = ?3, comments = ?4, resolved_at = ?5
            WHERE id = ?1 AND status = 'PENDING'
            "#,
        )
        .bind(id)
        .bind(to.as_str())
        .bind(resolved_by)
        .bind(comments)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_pending_approvals(
        &self,
        role: Option<&str>,
    ) -> Result<Vec<ApprovalRequestRecord>, EngineError> {
        let rows = match role {
            Some(role) => {
                sqlx::query(
                    "SELECT * FROM approval_requests WHERE status = 'PENDING' AND required_role = ?1 ORDER BY requested_at",
                )
                .bind(role)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM approval_requests WHERE status = 'PENDING' ORDER BY requested_at")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(row_to_approval).collect()
    }

    pub async fn count_pending_approvals(&self) -> Result<i64, EngineError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM approval_requests WHERE status = 'PENDING'")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n"))
    }

    pub async fn expired_pending_approvals(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ApprovalRequestRecord>, EngineError> {
        let rows = sqlx::query(
            "SELECT * FROM approval_requests WHERE status = 'PENDING' AND timeout_at <= ?1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_approval).collect()
    }

    // ---- schedules ----

    pub async fn insert_schedule(
        &self,
        workflow_id: i64,
        cron_expression: &str,
        trigger_data: &JsonValue,
        next_run_at: DateTime<Utc>,
    ) -> Result<WorkflowScheduleRecord, EngineError> {
        let result = sqlx::query(
            r#"
            INSERT INTO workflow_schedules (workflow_id, cron_expression, enabled,
                                            next_run_at, trigger_data)
            VALUES (?1, ?2, 1, ?3, ?4)
            "#,
        )
        .bind(workflow_id)
        .bind(cron_expression)
        .bind(next_run_at)
        .bind(trigger_data.to_string())
        .execute(&self.pool)
        .await?;
        self.get_schedule(result.last_insert_rowid()).await
    }

    pub async fn get_schedule(&self, id: i64) -> Result<WorkflowScheduleRecord, EngineError> {
        let row = sqlx::query("SELECT * FROM workflow_schedules WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("schedule {}", id)))?;
        row_to_schedule(&row)
    }

    pub async fn list_schedules_for_workflow(
        &self,
        workflow_id: i64,
    ) -> Result<Vec<WorkflowScheduleRecord>, EngineError> {
        let rows = sqlx::query("SELECT * FROM workflow_schedules WHERE workflow_id = ?1 ORDER BY id")
            .bind(workflow_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_schedule).collect()
    }

    pub async fn set_schedule_enabled(&self, id: i64, enabled: bool) -> Result<(), EngineError> {
        sqlx::query("UPDATE workflow_schedules SET enabled = ?2 WHERE id = ?1")
            .bind(id)
            .bind(enabled)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_schedule_cron(
        &self,
        id: i64,
        cron_expression: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        sqlx::query(
            "UPDATE workflow_schedules SET cron_expression = ?2, next_run_at = ?3 WHERE id = ?1",
        )
        .bind(id)
        .bind(cron_expression)
        .bind(next_run_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_schedule_next_run(
        &self,
        id: i64,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        sqlx::query("UPDATE workflow_schedules SET next_run_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(next_run_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_schedule_trigger_data(
        &self,
        id: i64,
        trigger_data: &JsonValue,
    ) -> Result<(), EngineError> {
        sqlx::query("UPDATE workflow_schedules SET trigger_data = ?2 WHERE id = ?1")
            .bind(id)
            .bind(trigger_data.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn due_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkflowScheduleRecord>, EngineError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_schedules WHERE enabled = 1 AND next_run_at <= ?1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_schedule).collect()
    }

    /// Optimistic fire stamp: only succeeds if `next_run_at` is still the
    /// value this tick observed, so concurrent ticks fire at most once.
    pub async fn mark_schedule_fired(
        &self,
        id: i64,
        fired_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
        observed_next_run_at: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_schedules
            SET last_run_at = ?2, next_run_at = ?3
            WHERE id = ?1 AND enabled = 1 AND next_run_at = ?4
            "#,
        )
        .bind(id)
        .bind(fired_at)
        .bind(next_run_at)
        .bind(observed_next_run_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

// ---- row mapping ----

fn parse_json(raw: &str, column: &str) -> Result<JsonValue, EngineError> {
    serde_json::from_str(raw)
        .map_err(|e| EngineError::Storage(format!("column {}: {}", column, e)))
}

fn row_to_agent(row: &SqliteRow) -> Result<AgentRecord, EngineError> {
    Ok(AgentRecord {
        id: row.get("id"),
        name: row.get("name"),
        provider: row.get("provider"),
        model: row.get("model"),
        system_prompt: row.get("system_prompt"),
        temperature: row.get("temperature"),
        max_tokens: row.get("max_tokens"),
        config: parse_json(row.get::<String, _>("config").as_str(), "config")?,
        active: row.get("active"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_tool(row: &SqliteRow) -> Result<ToolRecord, EngineError> {
    let kind_raw: String = row.get("kind");
    Ok(ToolRecord {
        id: row.get("id"),
        name: row.get("name"),
        kind: ToolKind::parse(&kind_raw)
            .ok_or_else(|| EngineError::Storage(format!("unknown tool kind '{}'", kind_raw)))?,
        description: row.get("description"),
        input_schema: parse_json(row.get::<String, _>("input_schema").as_str(), "input_schema")?,
        handler: row.get("handler"),
        active: row.get("active"),
    })
}

fn row_to_workflow(row: &SqliteRow) -> Result<WorkflowRecord, EngineError> {
    let trigger_raw: String = row.get("trigger_kind");
    let mode_raw: String = row.get("execution_mode");
    let iface_raw: String = row.get("interface_kind");
    Ok(WorkflowRecord {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        trigger_kind: TriggerKind::parse(&trigger_raw).ok_or_else(|| {
            EngineError::Storage(format!("unknown trigger kind '{}'", trigger_raw))
        })?,
        trigger_config: parse_json(
            row.get::<String, _>("trigger_config").as_str(),
            "trigger_config",
        )?,
        execution_mode: ExecutionMode::parse(&mode_raw).ok_or_else(|| {
            EngineError::Storage(format!("unknown execution mode '{}'", mode_raw))
        })?,
        input_schema: parse_json(row.get::<String, _>("input_schema").as_str(), "input_schema")?,
        interface_kind: InterfaceKind::parse(&iface_raw).ok_or_else(|| {
            EngineError::Storage(format!("unknown interface kind '{}'", iface_raw))
        })?,
        public: row.get("public"),
        active: row.get("active"),
        created_at: row.get("created_at"),
    })
}

fn row_to_step(row: &SqliteRow) -> Result<WorkflowStepRecord, EngineError> {
    let kind_raw: String = row.get("kind");
    let approval_raw: Option<String> = row.get("approval_config");
    let retry_raw: Option<String> = row.get("retry_config");
    Ok(WorkflowStepRecord {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        step_order: row.get("step_order"),
        kind: StepKind::parse(&kind_raw)
            .ok_or_else(|| EngineError::Storage(format!("unknown step kind '{}'", kind_raw)))?,
        name: row.get("name"),
        agent_id: row.get("agent_id"),
        input_mapping: parse_json(
            row.get::<String, _>("input_mapping").as_str(),
            "input_mapping",
        )?,
        output_variable: row.get("output_variable"),
        condition_expression: row.get("condition_expression"),
        depends_on: serde_json::from_str(row.get::<String, _>("depends_on").as_str())
            .map_err(|e| EngineError::Storage(format!("column depends_on: {}", e)))?,
        approval_config: approval_raw
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| EngineError::Storage(format!("column approval_config: {}", e)))?,
        retry_config: retry_raw
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| EngineError::Storage(format!("column retry_config: {}", e)))?,
        timeout_seconds: row.get("timeout_seconds"),
    })
}

fn row_to_execution(row: &SqliteRow) -> Result<WorkflowExecutionRecord, EngineError> {
    let status_raw: String = row.get("status");
    Ok(WorkflowExecutionRecord {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        status: ExecutionStatus::parse(&status_raw).ok_or_else(|| {
            EngineError::Storage(format!("unknown execution status '{}'", status_raw))
        })?,
        trigger_data: parse_json(row.get::<String, _>("trigger_data").as_str(), "trigger_data")?,
        context: parse_json(row.get::<String, _>("context_data").as_str(), "context_data")?,
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
    })
}

fn row_to_agent_execution(row: &SqliteRow) -> Result<AgentExecutionRecord, EngineError> {
    let status_raw: String = row.get("status");
    let output_raw: Option<String> = row.get("output");
    Ok(AgentExecutionRecord {
        id: row.get("id"),
        agent_id: row.get("agent_id"),
        workflow_execution_id: row.get("workflow_execution_id"),
        workflow_step_id: row.get("workflow_step_id"),
        status: AgentRunStatus::parse(&status_raw).ok_or_else(|| {
            EngineError::Storage(format!("unknown agent run status '{}'", status_raw))
        })?,
        input: parse_json(row.get::<String, _>("input").as_str(), "input")?,
        output: output_raw
            .as_deref()
            .map(|raw| parse_json(raw, "output"))
            .transpose()?,
        tokens_used: row.get("tokens_used"),
        execution_time_ms: row.get("execution_time_ms"),
        error_message: row.get("error_message"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

fn row_to_approval(row: &SqliteRow) -> Result<ApprovalRequestRecord, EngineError> {
    let status_raw: String = row.get("status");
    Ok(ApprovalRequestRecord {
        id: row.get("id"),
        workflow_execution_id: row.get("workflow_execution_id"),
        workflow_step_id: row.get("workflow_step_id"),
        status: ApprovalStatus::parse(&status_raw).ok_or_else(|| {
            EngineError::Storage(format!("unknown approval status '{}'", status_raw))
        })?,
        required_role: row.get("required_role"),
        resolved_by: row.get("resolved_by"),
        resolved_at: row.get("resolved_at"),
        comments: row.get("comments"),
        timeout_at: row.get("timeout_at"),
        requested_at: row.get("requested_at"),
    })
}

fn row_to_schedule(row: &SqliteRow) -> Result<WorkflowScheduleRecord, EngineError> {
    Ok(WorkflowScheduleRecord {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        cron_expression: row.get("cron_expression"),
        enabled: row.get("enabled"),
        last_run_at: row.get("last_run_at"),
        next_run_at: row.get("next_run_at"),
        trigger_data: parse_json(row.get::<String, _>("trigger_data").as_str(), "trigger_data")?,
    })
}
