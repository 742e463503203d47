//! Recurring-run scheduling.
//!
//! Converts an agent's declared cadence into exactly one durable queue entry
//! keyed by the agent id. Registration is idempotent: re-registering
//! replaces, never duplicates. Schedule changes requested by a run arrive as
//! a typed [`ScheduleDirective`] and are applied as a fresh registration.

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use crate::error::ExecutionError;
use crate::queue::{parse_cron, JobCadence, JobQueue};
use crate::store::AgentStore;
use crate::types::{Cadence, ExecutionRequest, RunSource, Schedule, ScheduleDirective};

/// Queue key for an agent's recurring timer.
pub fn schedule_key(agent_id: Uuid) -> String {
    format!("agent-schedule:{}", agent_id)
}

/// Default input for a scheduled run.
const SCHEDULED_INPUT: &str = "Scheduled run: follow your system prompt.";

pub struct Scheduler {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn AgentStore>,
}

impl Scheduler {
    pub fn new(queue: Arc<dyn JobQueue>, store: Arc<dyn AgentStore>) -> Self {
        Self { queue, store }
    }

    /// Register (or replace) the recurring timer for an agent.
    ///
    /// # Errors
    ///
    /// `ExecutionError::Configuration` for an invalid cron expression; the
    /// existing timer, if any, is left untouched in that case.
    pub async fn register(
        &self,
        agent_id: Uuid,
        owner_id: Uuid,
        cadence: &Cadence,
    ) -> Result<(), ExecutionError> {
        // Validate before removing anything so a bad cadence cannot strand
        // an agent without its previous timer.
        let job_cadence = to_job_cadence(cadence)?;

        let key = schedule_key(agent_id);
        self.queue.remove_by_key(&key).await?;

        let request = ExecutionRequest {
            agent_id,
            owner_id,
            input: SCHEDULED_INPUT.to_string(),
            source: RunSource::Scheduled,
        };
        let payload = json!({
            "kind": "run",
            "request": serde_json::to_value(&request)
                .map_err(|e| ExecutionError::Configuration(e.to_string()))?,
        });

        self.queue.enqueue(&key, payload, job_cadence).await?;
        tracing::info!("Registered schedule for agent {}: {:?}", agent_id, cadence);
        Ok(())
    }

    /// Remove an agent's recurring timer. Idempotent.
    pub async fn unregister(&self, agent_id: Uuid) -> Result<bool, ExecutionError> {
        let removed = self.queue.remove_by_key(&schedule_key(agent_id)).await?;
        if removed {
            tracing::info!("Unregistered schedule for agent {}", agent_id);
        }
        Ok(removed)
    }

    /// Apply a schedule directive produced by a run.
    ///
    /// Always a fresh register/unregister; the stored agent record is kept
    /// in sync.
    pub async fn apply_directive(
        &self,
        agent_id: Uuid,
        owner_id: Uuid,
        directive: &ScheduleDirective,
    ) -> Result<(), ExecutionError> {
        if !directive.enabled {
            self.unregister(agent_id).await?;
            if let Ok(Some(agent)) = self.store.get(agent_id).await {
                let disabled = agent.schedule.map(|s| Schedule {
                    enabled: false,
                    cadence: s.cadence,
                });
                let _ = self.store.update_schedule(agent_id, disabled).await;
            }
            return Ok(());
        }

        // Enabled: use the new cadence, falling back to the stored one.
        let cadence = match &directive.cadence {
            Some(c) => c.clone(),
            None => self
                .store
                .get(agent_id)
                .await
                .map_err(ExecutionError::Configuration)?
                .and_then(|a| a.schedule.map(|s| s.cadence))
                .ok_or_else(|| {
                    ExecutionError::Configuration(format!(
                        "agent {} has no stored cadence to re-enable",
                        agent_id
                    ))
                })?,
        };

        self.register(agent_id, owner_id, &cadence).await?;
        let _ = self
            .store
            .update_schedule(
                agent_id,
                Some(Schedule {
                    enabled: true,
                    cadence,
                }),
            )
            .await;
        Ok(())
    }
}

fn to_job_cadence(cadence: &Cadence) -> Result<JobCadence, ExecutionError> {
    match cadence {
        Cadence::Interval { minutes } => {
            if *minutes == 0 {
                return Err(ExecutionError::Configuration(
                    "interval must be at least one minute".to_string(),
                ));
            }
            Ok(JobCadence::EveryMs(minutes * 60_000))
        }
        Cadence::Cron { expr } => {
            parse_cron(expr)?;
            Ok(JobCadence::Cron(expr.clone()))
        }
    }
}
