//! Core domain types: agents, triggers, schedules, runs, delegation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Maximum entries kept in an agent's run log. Oldest entries are dropped.
pub const MAX_LOG_ENTRIES: usize = 200;

/// A configured autonomous worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    /// System prompt driving the agent's behavior.
    pub system_prompt: String,
    /// Tool names this agent may call. Empty or `["*"]` means all tools.
    pub allowed_tools: Vec<String>,
    /// Model identifier (OpenRouter format).
    pub model: String,
    pub schedule: Option<Schedule>,
    pub triggers: Vec<Trigger>,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Bounded append-only run log.
    pub log: Vec<AgentLogEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    /// Create an agent with sensible defaults for the given owner.
    pub fn new(owner_id: Uuid, name: &str, system_prompt: &str, model: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id,
            name: name.to_string(),
            system_prompt: system_prompt.to_string(),
            allowed_tools: Vec::new(),
            model: model.to_string(),
            schedule: None,
            triggers: Vec::new(),
            last_run_at: None,
            log: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this agent may call the named tool.
    pub fn allows_tool(&self, name: &str) -> bool {
        self.allowed_tools.is_empty()
            || self.allowed_tools.iter().any(|t| t == "*" || t == name)
    }
}

/// Recurring cadence for autonomous runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub enabled: bool,
    pub cadence: Cadence,
}

/// Interval and cron cadences are mutually exclusive by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    Interval { minutes: u64 },
    Cron { expr: String },
}

/// Declarative rule mapping events to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub kind: TriggerKind,
    /// For webhook triggers: path the inbound event must match.
    pub webhook_path: Option<String>,
    /// For integration-event triggers: `"source.event"`, `"source.*"` or `"*"`.
    pub event_pattern: Option<String>,
    /// Optional condition tree evaluated against the event payload.
    pub conditions: Option<Value>,
    pub enabled: bool,
}

impl Trigger {
    pub fn webhook(path: &str) -> Self {
        Self {
            kind: TriggerKind::Webhook,
            webhook_path: Some(path.to_string()),
            event_pattern: None,
            conditions: None,
            enabled: true,
        }
    }

    pub fn integration(pattern: &str) -> Self {
        Self {
            kind: TriggerKind::IntegrationEvent,
            webhook_path: None,
            event_pattern: Some(pattern.to_string()),
            conditions: None,
            enabled: true,
        }
    }

    pub fn with_conditions(mut self, conditions: Value) -> Self {
        self.conditions = Some(conditions);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Webhook,
    IntegrationEvent,
    Time,
    Manual,
}

/// A normalized inbound occurrence. Transient, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub kind: EventKind,
    pub source: String,
    pub event_name: String,
    pub payload: Value,
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Webhook,
    IntegrationEvent,
}

/// A single entry in an agent's run log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLogEntry {
    pub timestamp: DateTime<Utc>,
    pub entry_type: LogEntryType,
    pub content: String,
}

impl AgentLogEntry {
    pub fn now(entry_type: LogEntryType, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            entry_type,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEntryType {
    RunStarted,
    ToolCall,
    ToolResult,
    Response,
    Retry,
    Error,
}

/// What caused a run to be requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunSource {
    Scheduled,
    Triggered,
    Manual,
    Delegated,
}

/// One unit of work for the supervisor. Also the queue payload for
/// scheduled runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub agent_id: Uuid,
    pub owner_id: Uuid,
    pub input: String,
    pub source: RunSource,
}

/// Typed self-scheduling output of a run, consumed only by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleDirective {
    pub enabled: bool,
    /// New cadence; `None` with `enabled=true` keeps the current one.
    pub cadence: Option<Cadence>,
}

/// Fan-out request for the delegation coordinator.
#[derive(Debug, Clone, Deserialize)]
pub struct DelegationTask {
    pub user_id: Uuid,
    pub instruction: String,
    pub preferred_agent_ids: Option<Vec<Uuid>>,
    pub timeout_ms: u64,
    pub max_retries: Option<u32>,
}

/// Aggregated delegation outcome.
#[derive(Debug, Clone, Serialize)]
pub struct DelegationResult {
    pub status: DelegationStatus,
    pub per_agent: Vec<AgentDelegationResult>,
    pub summary: String,
    pub total_time_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationStatus {
    Success,
    Partial,
    Failed,
}

/// Per-agent branch outcome of a delegation.
#[derive(Debug, Clone, Serialize)]
pub struct AgentDelegationResult {
    pub agent_id: Uuid,
    pub agent_name: String,
    pub status: BranchStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    Completed,
    Failed,
    Timeout,
}
