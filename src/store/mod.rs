//! Agent persistence.

mod memory;

pub use memory::InMemoryAgentStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::types::{Agent, AgentLogEntry, Schedule};

/// Load/save agent records keyed by id.
///
/// This core only ever mutates agents to append log entries, bump
/// `last_run_at`, and apply schedule changes; full CRUD lives with the
/// (external) management layer but is exposed here so it has a home.
#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Agent>, String>;

    async fn list(&self) -> Result<Vec<Agent>, String>;

    /// All agents owned by the given user.
    async fn list_for_owner(&self, owner_id: Uuid) -> Result<Vec<Agent>, String>;

    async fn insert(&self, agent: Agent) -> Result<(), String>;

    async fn delete(&self, id: Uuid) -> Result<bool, String>;

    /// Append to the bounded run log, dropping the oldest entry when full.
    async fn append_log(&self, id: Uuid, entry: AgentLogEntry) -> Result<(), String>;

    async fn set_last_run(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), String>;

    async fn update_schedule(&self, id: Uuid, schedule: Option<Schedule>) -> Result<(), String>;
}
