//! In-memory agent store (non-persistent).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::AgentStore;
use crate::types::{Agent, AgentLogEntry, Schedule, MAX_LOG_ENTRIES};

#[derive(Clone, Default)]
pub struct InMemoryAgentStore {
    agents: Arc<RwLock<HashMap<Uuid, Agent>>>,
}

impl InMemoryAgentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentStore for InMemoryAgentStore {
    async fn get(&self, id: Uuid) -> Result<Option<Agent>, String> {
        Ok(self.agents.read().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Agent>, String> {
        let mut agents: Vec<Agent> = self.agents.read().await.values().cloned().collect();
        agents.sort_by_key(|a| a.created_at);
        Ok(agents)
    }

    async fn list_for_owner(&self, owner_id: Uuid) -> Result<Vec<Agent>, String> {
        let mut agents: Vec<Agent> = self
            .agents
            .read()
            .await
            .values()
            .filter(|a| a.owner_id == owner_id)
            .cloned()
            .collect();
        agents.sort_by_key(|a| a.created_at);
        Ok(agents)
    }

    async fn insert(&self, agent: Agent) -> Result<(), String> {
        self.agents.write().await.insert(agent.id, agent);
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, String> {
        Ok(self.agents.write().await.remove(&id).is_some())
    }

    async fn append_log(&self, id: Uuid, entry: AgentLogEntry) -> Result<(), String> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(&id)
            .ok_or_else(|| format!("Agent {} not found", id))?;
        agent.log.push(entry);
        if agent.log.len() > MAX_LOG_ENTRIES {
            let excess = agent.log.len() - MAX_LOG_ENTRIES;
            agent.log.drain(..excess);
        }
        agent.updated_at = Utc::now();
        Ok(())
    }

    async fn set_last_run(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), String> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(&id)
            .ok_or_else(|| format!("Agent {} not found", id))?;
        agent.last_run_at = Some(at);
        agent.updated_at = Utc::now();
        Ok(())
    }

    async fn update_schedule(&self, id: Uuid, schedule: Option<Schedule>) -> Result<(), String> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(&id)
            .ok_or_else(|| format!("Agent {} not found", id))?;
        agent.schedule = schedule;
        agent.updated_at = Utc::now();
        Ok(())
    }
}
