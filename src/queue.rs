//! Durable recurring-job queue abstraction.
//!
//! The scheduler and polling bridge register recurring entries here; a
//! [`QueueWorker`] ticks, collects due entries, and hands their payloads to
//! an injected [`JobHandler`]. Firing enqueues work, it never executes
//! inline, so a slow run cannot stall the timer wheel.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use croner::Cron;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::ExecutionError;

/// How often a job fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobCadence {
    EveryMs(u64),
    Cron(String),
}

impl JobCadence {
    /// Next fire time after `from`.
    ///
    /// # Errors
    ///
    /// `ExecutionError::Configuration` for a cron expression that does not
    /// parse or has no future occurrence.
    pub fn next_after(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>, ExecutionError> {
        match self {
            Self::EveryMs(ms) => Ok(from + ChronoDuration::milliseconds(*ms as i64)),
            Self::Cron(expr) => {
                let cron = parse_cron(expr)?;
                cron.find_next_occurrence(&from, false)
                    .map_err(|e| ExecutionError::Configuration(format!("cron '{}': {}", expr, e)))
            }
        }
    }
}

/// Validate a cron expression without scheduling anything.
pub fn parse_cron(expr: &str) -> Result<Cron, ExecutionError> {
    Cron::new(expr)
        .with_seconds_optional()
        .parse()
        .map_err(|e| ExecutionError::Configuration(format!("invalid cron '{}': {}", expr, e)))
}

/// A registered recurring entry.
#[derive(Debug, Clone)]
pub struct JobEntry {
    pub key: String,
    pub payload: Value,
    pub cadence: JobCadence,
    pub next_run: DateTime<Utc>,
}

/// Durable recurring-job queue.
///
/// `enqueue` with an existing key replaces the entry; there is never more
/// than one entry per key.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(
        &self,
        key: &str,
        payload: Value,
        cadence: JobCadence,
    ) -> Result<(), ExecutionError>;

    async fn remove_by_key(&self, key: &str) -> Result<bool, ExecutionError>;

    async fn list_all(&self) -> Result<Vec<JobEntry>, ExecutionError>;

    /// Entries due at `now`. Each returned entry has its `next_run`
    /// advanced, so a slow consumer does not double-fire.
    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<JobEntry>, ExecutionError>;
}

/// In-memory queue implementation.
#[derive(Clone, Default)]
pub struct InMemoryJobQueue {
    entries: Arc<RwLock<HashMap<String, JobEntry>>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(
        &self,
        key: &str,
        payload: Value,
        cadence: JobCadence,
    ) -> Result<(), ExecutionError> {
        // Validate the cadence before touching the map: invalid cron must
        // never be enqueued.
        let next_run = cadence.next_after(Utc::now())?;
        let entry = JobEntry {
            key: key.to_string(),
            payload,
            cadence,
            next_run,
        };
        self.entries.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn remove_by_key(&self, key: &str) -> Result<bool, ExecutionError> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn list_all(&self) -> Result<Vec<JobEntry>, ExecutionError> {
        Ok(self.entries.read().await.values().cloned().collect())
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<JobEntry>, ExecutionError> {
        let mut entries = self.entries.write().await;
        let mut fired = Vec::new();
        for entry in entries.values_mut() {
            if entry.next_run <= now {
                fired.push(entry.clone());
                match entry.cadence.next_after(now) {
                    Ok(next) => entry.next_run = next,
                    Err(e) => {
                        // Validated at enqueue; only reachable if the clock
                        // outran every cron occurrence.
                        tracing::warn!("Failed to advance job '{}': {}", entry.key, e);
                    }
                }
            }
        }
        Ok(fired)
    }
}

/// Consumes due job payloads.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, key: &str, payload: Value);
}

/// Ticks the queue and dispatches due payloads to the handler.
pub struct QueueWorker {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    tick_ms: u64,
}

impl QueueWorker {
    pub fn new(queue: Arc<dyn JobQueue>, handler: Arc<dyn JobHandler>, tick_ms: u64) -> Self {
        Self {
            queue,
            handler,
            tick_ms,
        }
    }

    /// Run the worker loop until the task is dropped.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(self.tick_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let due = match self.queue.due(Utc::now()).await {
                Ok(due) => due,
                Err(e) => {
                    tracing::warn!("Queue poll failed: {}", e);
                    continue;
                }
            };
            for entry in due {
                let handler = Arc::clone(&self.handler);
                // Each firing runs as its own concurrent unit.
                tokio::spawn(async move {
                    handler.handle(&entry.key, entry.payload).await;
                });
            }
        }
    }
}
