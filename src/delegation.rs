//! Delegation: fan one instruction out to several agents at once.
//!
//! Each target agent runs as its own spawned branch with an independent
//! timeout and retry budget; one branch failing, hanging, or panicking never
//! affects the others. Branches that outlive their timeout are actively
//! aborted, not left running detached.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use tokio_util::task::AbortOnDropHandle;

use crate::agent::ConversationDriver;
use crate::config::Config;
use crate::events::{channels, EventBus};
use crate::store::AgentStore;
use crate::types::{
    Agent, AgentDelegationResult, BranchStatus, DelegationResult, DelegationStatus, DelegationTask,
};

pub struct DelegationCoordinator {
    store: Arc<dyn AgentStore>,
    driver: Arc<ConversationDriver>,
    events: Arc<dyn EventBus>,
    default_timeout_ms: u64,
    max_retries: u32,
    retry_base_ms: u64,
}

impl DelegationCoordinator {
    pub fn new(
        store: Arc<dyn AgentStore>,
        driver: Arc<ConversationDriver>,
        events: Arc<dyn EventBus>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            driver,
            events,
            default_timeout_ms: config.delegation_timeout_ms,
            max_retries: config.max_retries,
            retry_base_ms: config.retry_base_ms,
        }
    }

    /// Fan the instruction out to every resolved target and aggregate the
    /// branch outcomes. Never returns an error: an unresolvable task yields
    /// a `Failed` result with an explanatory summary.
    pub async fn delegate(&self, task: DelegationTask) -> DelegationResult {
        let started = tokio::time::Instant::now();

        let targets = match self.resolve_targets(&task).await {
            Ok(targets) => targets,
            Err(reason) => {
                return DelegationResult {
                    status: DelegationStatus::Failed,
                    per_agent: Vec::new(),
                    summary: reason,
                    total_time_ms: started.elapsed().as_millis() as u64,
                };
            }
        };
        if targets.is_empty() {
            return DelegationResult {
                status: DelegationStatus::Failed,
                per_agent: Vec::new(),
                summary: "no agents available for delegation".to_string(),
                total_time_ms: started.elapsed().as_millis() as u64,
            };
        }

        let timeout_ms = if task.timeout_ms == 0 {
            self.default_timeout_ms
        } else {
            task.timeout_ms
        };
        let max_retries = task.max_retries.unwrap_or(self.max_retries);

        self.events.emit(
            channels::DELEGATION,
            "delegation.started",
            json!({
                "user_id": task.user_id,
                "targets": targets.len(),
                "timeout_ms": timeout_ms,
            }),
        );

        let branches = targets
            .into_iter()
            .map(|agent| self.run_branch(agent, task.instruction.clone(), timeout_ms, max_retries));
        let per_agent = join_all(branches).await;

        let completed = per_agent
            .iter()
            .filter(|r| r.status == BranchStatus::Completed)
            .count();
        let status = if completed == per_agent.len() {
            DelegationStatus::Success
        } else if completed > 0 {
            DelegationStatus::Partial
        } else {
            DelegationStatus::Failed
        };
        let summary = format!(
            "{} of {} agents completed ({} failed, {} timed out)",
            completed,
            per_agent.len(),
            per_agent
                .iter()
                .filter(|r| r.status == BranchStatus::Failed)
                .count(),
            per_agent
                .iter()
                .filter(|r| r.status == BranchStatus::Timeout)
                .count(),
        );
        let total_time_ms = started.elapsed().as_millis() as u64;

        self.events.emit(
            channels::DELEGATION,
            "delegation.completed",
            json!({
                "user_id": task.user_id,
                "status": status,
                "summary": summary,
                "total_time_ms": total_time_ms,
            }),
        );

        DelegationResult {
            status,
            per_agent,
            summary,
            total_time_ms,
        }
    }

    /// Resolve target agents: the preferred ids (filtered by ownership) when
    /// given, otherwise every agent the user owns.
    async fn resolve_targets(&self, task: &DelegationTask) -> Result<Vec<Agent>, String> {
        let owned = self
            .store
            .list_for_owner(task.user_id)
            .await
            .map_err(|e| format!("store error: {}", e))?;

        match &task.preferred_agent_ids {
            Some(ids) if !ids.is_empty() => {
                Ok(owned.into_iter().filter(|a| ids.contains(&a.id)).collect())
            }
            _ => Ok(owned),
        }
    }

    /// Run one branch under its timeout, aborting the task if it overruns.
    async fn run_branch(
        &self,
        agent: Agent,
        instruction: String,
        timeout_ms: u64,
        max_retries: u32,
    ) -> AgentDelegationResult {
        let branch_started = tokio::time::Instant::now();
        let (agent_id, agent_name) = (agent.id, agent.name.clone());

        // On timeout the handle is dropped, which aborts the branch task.
        let handle = self.spawn_branch(agent, instruction, max_retries);
        let outcome = tokio::time::timeout(Duration::from_millis(timeout_ms), handle).await;

        let (status, result, error) = match outcome {
            Ok(Ok(Ok(reply))) => (BranchStatus::Completed, reply, None),
            Ok(Ok(Err(error))) => (BranchStatus::Failed, None, Some(error)),
            Ok(Err(join_error)) => (
                BranchStatus::Failed,
                None,
                Some(format!("branch panicked: {}", join_error)),
            ),
            Err(_) => (
                BranchStatus::Timeout,
                None,
                Some(format!("timed out after {}ms", timeout_ms)),
            ),
        };

        if status == BranchStatus::Timeout {
            tracing::warn!("Delegation branch for agent {} timed out", agent_id);
        }
        self.events.emit(
            channels::DELEGATION,
            "delegation.branch",
            json!({"agent_id": agent_id, "status": status}),
        );

        AgentDelegationResult {
            agent_id,
            agent_name,
            status,
            result,
            error,
            execution_time_ms: branch_started.elapsed().as_millis() as u64,
        }
    }

    /// Spawn the branch body: the driver run plus its transient-retry loop.
    /// Returned as a handle so the caller can abort it on timeout.
    fn spawn_branch(
        &self,
        agent: Agent,
        instruction: String,
        max_retries: u32,
    ) -> AbortOnDropHandle<Result<Option<String>, String>> {
        let driver = Arc::clone(&self.driver);
        let retry_base_ms = self.retry_base_ms;
        AbortOnDropHandle::new(tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                match driver.run(&agent, &instruction).await {
                    Ok(outcome) => return Ok(outcome.reply),
                    Err(e) if e.is_transient() && attempt < max_retries => {
                        let delay_ms = retry_base_ms * 2u64.pow(attempt);
                        tracing::debug!(
                            "Delegation branch for agent {} retrying after {} ({}ms)",
                            agent.id,
                            e,
                            delay_ms
                        );
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(e.to_string()),
                }
            }
        }))
    }
}
