//! The retry supervisor: the no-escape boundary around one agent run.
//!
//! Wraps the conversation driver with bounded exponential backoff for
//! transient failures, persists every outcome into the agent's log, and
//! emits run lifecycle events. Nothing thrown inside a run is allowed to
//! propagate to the queue worker or trigger router.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::agent::{ConversationDriver, DriverOutcome, DriverStatus};
use crate::config::Config;
use crate::error::ExecutionError;
use crate::events::{channels, EventBus};
use crate::scheduler::Scheduler;
use crate::store::AgentStore;
use crate::types::{Agent, AgentLogEntry, ExecutionRequest, LogEntryType};

/// Final result of a supervised run, for callers that want it. All
/// persistence and emission has already happened by the time this returns.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub agent_id: Uuid,
    pub attempts: u32,
    pub outcome: RunOutcome,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Success { reply: Option<String> },
    Failed { error: String },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

pub struct RetrySupervisor {
    driver: Arc<ConversationDriver>,
    store: Arc<dyn AgentStore>,
    events: Arc<dyn EventBus>,
    scheduler: Arc<Scheduler>,
    max_retries: u32,
    base_delay_ms: u64,
    // Overlapping runs of one agent id are serialized, not interleaved.
    run_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl RetrySupervisor {
    pub fn new(
        driver: Arc<ConversationDriver>,
        store: Arc<dyn AgentStore>,
        events: Arc<dyn EventBus>,
        scheduler: Arc<Scheduler>,
        config: &Config,
    ) -> Self {
        Self {
            driver,
            store,
            events,
            scheduler,
            max_retries: config.max_retries,
            base_delay_ms: config.retry_base_ms,
            run_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Execute one run to completion. Never returns an error and never
    /// panics past this boundary; all failure modes become a persisted log
    /// entry, an emitted event, and a `RunOutcome::Failed`.
    pub async fn run(&self, request: ExecutionRequest) -> RunReport {
        let agent = match self.store.get(request.agent_id).await {
            Ok(Some(agent)) => agent,
            Ok(None) => {
                let error = ExecutionError::NotFound(request.agent_id).to_string();
                self.emit_failed(request.agent_id, &error);
                return RunReport {
                    agent_id: request.agent_id,
                    attempts: 0,
                    outcome: RunOutcome::Failed { error },
                };
            }
            Err(e) => {
                let error = format!("store error: {}", e);
                self.emit_failed(request.agent_id, &error);
                return RunReport {
                    agent_id: request.agent_id,
                    attempts: 0,
                    outcome: RunOutcome::Failed { error },
                };
            }
        };

        // Ownership mismatch is terminal: no retry, no run.
        if agent.owner_id != request.owner_id {
            let error =
                ExecutionError::Unauthorized(format!("agent {} owner mismatch", agent.id))
                    .to_string();
            self.record_failure(&agent, &error).await;
            return RunReport {
                agent_id: agent.id,
                attempts: 0,
                outcome: RunOutcome::Failed { error },
            };
        }

        let lock = self.run_lock(agent.id).await;
        let _guard = lock.lock().await;

        self.events.emit(
            channels::RUNS,
            "run.started",
            json!({"agent_id": agent.id, "source": request.source}),
        );
        let _ = self
            .store
            .append_log(
                agent.id,
                AgentLogEntry::now(
                    LogEntryType::RunStarted,
                    format!("{:?} run: {}", request.source, truncate(&request.input, 200)),
                ),
            )
            .await;

        let mut attempt: u32 = 0;
        loop {
            match self.driver.run(&agent, &request.input).await {
                Ok(outcome) => {
                    let reply = self.record_success(&agent, &request, &outcome).await;
                    return RunReport {
                        agent_id: agent.id,
                        attempts: attempt + 1,
                        outcome: RunOutcome::Success { reply },
                    };
                }
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay_ms = self.base_delay_ms * 2u64.pow(attempt);
                    tracing::warn!(
                        "Agent {} attempt {} failed transiently ({}); retrying in {}ms",
                        agent.id,
                        attempt + 1,
                        e,
                        delay_ms
                    );
                    let _ = self
                        .store
                        .append_log(
                            agent.id,
                            AgentLogEntry::now(
                                LogEntryType::Retry,
                                format!("attempt {} failed: {}; retrying", attempt + 1, e),
                            ),
                        )
                        .await;
                    self.events.emit(
                        channels::RUNS,
                        "run.retry",
                        json!({
                            "agent_id": agent.id,
                            "attempt": attempt + 1,
                            "delay_ms": delay_ms,
                            "error": e.to_string(),
                        }),
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
                Err(e) => {
                    let error = e.to_string();
                    self.record_failure(&agent, &error).await;
                    return RunReport {
                        agent_id: agent.id,
                        attempts: attempt + 1,
                        outcome: RunOutcome::Failed { error },
                    };
                }
            }
        }
    }

    async fn run_lock(&self, agent_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.run_locks.lock().await;
        locks.entry(agent_id).or_default().clone()
    }

    async fn record_success(
        &self,
        agent: &Agent,
        request: &ExecutionRequest,
        outcome: &DriverOutcome,
    ) -> Option<String> {
        let now = chrono::Utc::now();
        let _ = self.store.set_last_run(agent.id, now).await;

        let summary = match outcome.status {
            DriverStatus::Completed => outcome
                .reply
                .clone()
                .unwrap_or_else(|| "(empty reply)".to_string()),
            DriverStatus::Exhausted => {
                "Run ended: iteration budget exhausted with no tool call or final reply"
                    .to_string()
            }
            DriverStatus::RequiredActionMissed => {
                "Run ended: did not complete required action; fallback invocation performed"
                    .to_string()
            }
        };
        let _ = self
            .store
            .append_log(
                agent.id,
                AgentLogEntry::now(LogEntryType::Response, truncate(&summary, 2000)),
            )
            .await;

        if let Some(directive) = &outcome.schedule_directive {
            if let Err(e) = self
                .scheduler
                .apply_directive(agent.id, agent.owner_id, directive)
                .await
            {
                tracing::warn!("Agent {} schedule directive rejected: {}", agent.id, e);
                let _ = self
                    .store
                    .append_log(
                        agent.id,
                        AgentLogEntry::now(
                            LogEntryType::Error,
                            format!("schedule directive rejected: {}", e),
                        ),
                    )
                    .await;
            }
        }

        self.events.emit(
            channels::RUNS,
            "run.completed",
            json!({
                "agent_id": agent.id,
                "source": request.source,
                "status": match outcome.status {
                    DriverStatus::Completed => "completed",
                    DriverStatus::Exhausted => "exhausted",
                    DriverStatus::RequiredActionMissed => "required_action_missed",
                },
                "tool_calls": outcome.steps.len(),
                "iterations": outcome.iterations,
            }),
        );

        outcome.reply.clone()
    }

    async fn record_failure(&self, agent: &Agent, error: &str) {
        let _ = self
            .store
            .append_log(agent.id, AgentLogEntry::now(LogEntryType::Error, error))
            .await;
        self.emit_failed(agent.id, error);
    }

    fn emit_failed(&self, agent_id: Uuid, error: &str) {
        tracing::error!("Agent {} run failed: {}", agent_id, error);
        self.events.emit(
            channels::RUNS,
            "run.failed",
            json!({"agent_id": agent_id, "error": error}),
        );
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        let mut cut = max_len;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}... [truncated]", &s[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BroadcastEventBus;
    use crate::llm::{ChatMessage, LlmClient};
    use crate::queue::InMemoryJobQueue;
    use crate::store::InMemoryAgentStore;
    use crate::tools::ToolRegistry;
    use crate::types::RunSource;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// LLM that fails transiently a set number of times, then succeeds.
    struct FlakyLlm {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmClient for FlakyLlm {
        async fn chat(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
        ) -> Result<String, ExecutionError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(ExecutionError::Timeout("simulated".into()))
            } else {
                Ok("done".to_string())
            }
        }
    }

    struct TerminalLlm;

    #[async_trait]
    impl LlmClient for TerminalLlm {
        async fn chat(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
        ) -> Result<String, ExecutionError> {
            Err(ExecutionError::Llm("model rejected the request".into()))
        }
    }

    struct Harness {
        supervisor: RetrySupervisor,
        store: Arc<InMemoryAgentStore>,
        bus: Arc<BroadcastEventBus>,
    }

    fn harness(llm: Arc<dyn LlmClient>) -> Harness {
        let config = Config::new("key".into(), "test-model".into());
        let store = Arc::new(InMemoryAgentStore::new());
        let bus = Arc::new(BroadcastEventBus::default());
        let queue = Arc::new(InMemoryJobQueue::new());
        let driver = Arc::new(ConversationDriver::new(
            llm,
            Arc::new(ToolRegistry::new()),
            bus.clone(),
            &config,
        ));
        let scheduler = Arc::new(Scheduler::new(queue, store.clone()));
        let supervisor =
            RetrySupervisor::new(driver, store.clone(), bus.clone(), scheduler, &config);
        Harness {
            supervisor,
            store,
            bus,
        }
    }

    async fn seeded_agent(store: &InMemoryAgentStore) -> Agent {
        let agent = Agent::new(Uuid::new_v4(), "t", "You reply briefly.", "test-model");
        store.insert(agent.clone()).await.expect("insert");
        agent
    }

    fn request_for(agent: &Agent) -> ExecutionRequest {
        ExecutionRequest {
            agent_id: agent.id,
            owner_id: agent.owner_id,
            input: "go".to_string(),
            source: RunSource::Manual,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_transient_failure_makes_exactly_four_attempts() {
        let llm = Arc::new(FlakyLlm {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let h = harness(llm.clone());
        let agent = seeded_agent(&h.store).await;

        let started = tokio::time::Instant::now();
        let report = h.supervisor.run(request_for(&agent)).await;

        assert_eq!(report.attempts, 4);
        assert!(!report.outcome.is_success());
        assert_eq!(llm.calls.load(Ordering::SeqCst), 4);
        // Backoff: 1s + 2s + 4s.
        assert_eq!(started.elapsed(), Duration::from_secs(7));

        let stored = h.store.get(agent.id).await.expect("get").expect("exists");
        let retries = stored
            .log
            .iter()
            .filter(|e| e.entry_type == LogEntryType::Retry)
            .count();
        assert_eq!(retries, 3);
        assert!(stored
            .log
            .iter()
            .any(|e| e.entry_type == LogEntryType::Error));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_then_recovery() {
        let llm = Arc::new(FlakyLlm {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let h = harness(llm);
        let agent = seeded_agent(&h.store).await;

        let report = h.supervisor.run(request_for(&agent)).await;

        assert_eq!(report.attempts, 3);
        assert!(report.outcome.is_success());
        let stored = h.store.get(agent.id).await.expect("get").expect("exists");
        assert!(stored.last_run_at.is_some());
    }

    #[tokio::test]
    async fn terminal_failure_is_not_retried() {
        let h = harness(Arc::new(TerminalLlm));
        let agent = seeded_agent(&h.store).await;
        let mut rx = h.bus.subscribe();

        let report = h.supervisor.run(request_for(&agent)).await;

        assert_eq!(report.attempts, 1);
        assert!(!report.outcome.is_success());

        let mut saw_failed = false;
        while let Ok(event) = rx.try_recv() {
            if event.event == "run.failed" {
                saw_failed = true;
            }
        }
        assert!(saw_failed);
    }

    #[tokio::test]
    async fn ownership_mismatch_fails_without_invoking_the_model() {
        let llm = Arc::new(FlakyLlm {
            failures: 0,
            calls: AtomicU32::new(0),
        });
        let h = harness(llm.clone());
        let agent = seeded_agent(&h.store).await;

        let mut request = request_for(&agent);
        request.owner_id = Uuid::new_v4();
        let report = h.supervisor.run(request).await;

        assert!(!report.outcome.is_success());
        assert_eq!(report.attempts, 0);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_agent_fails_cleanly() {
        let llm = Arc::new(FlakyLlm {
            failures: 0,
            calls: AtomicU32::new(0),
        });
        let h = harness(llm);
        let report = h
            .supervisor
            .run(ExecutionRequest {
                agent_id: Uuid::new_v4(),
                owner_id: Uuid::new_v4(),
                input: "go".into(),
                source: RunSource::Manual,
            })
            .await;
        assert!(!report.outcome.is_success());
    }

    #[tokio::test]
    async fn concurrent_runs_of_one_agent_are_serialized() {
        use tokio::sync::Barrier;

        /// Tracks how many chats are in flight at once.
        struct ConcurrencyLlm {
            active: AtomicU32,
            peak: AtomicU32,
        }

        #[async_trait]
        impl LlmClient for ConcurrencyLlm {
            async fn chat(
                &self,
                _model: &str,
                _messages: &[ChatMessage],
            ) -> Result<String, ExecutionError> {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                Ok("done".to_string())
            }
        }

        let llm = Arc::new(ConcurrencyLlm {
            active: AtomicU32::new(0),
            peak: AtomicU32::new(0),
        });
        let h = Arc::new(harness(llm.clone()));
        let agent = seeded_agent(&h.store).await;

        let barrier = Arc::new(Barrier::new(2));
        let mut handles = Vec::new();
        for _ in 0..2 {
            let h = Arc::clone(&h);
            let request = request_for(&agent);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                h.supervisor.run(request).await
            }));
        }
        for handle in handles {
            assert!(handle.await.expect("join").outcome.is_success());
        }

        assert_eq!(llm.peak.load(Ordering::SeqCst), 1);
    }
}
