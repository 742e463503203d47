//! Polling bridge for push-less sources.
//!
//! Some integrations cannot deliver webhooks. For those, a [`PollSource`]
//! is sampled on its own recurring timer per (agent, source) pair; a
//! non-empty delta is synthesized into a [`TriggerEvent`] and routed through
//! the normal trigger matching path, so polled and pushed events share all
//! downstream execution logic.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::conditions::evaluate;
use crate::error::ExecutionError;
use crate::events::{channels, EventBus};
use crate::queue::{JobCadence, JobQueue};
use crate::triggers::EventSink;
use crate::types::{EventKind, TriggerEvent};

/// Event name used for synthesized delta events: pattern
/// `"{source}.delta"` on an agent's trigger will match.
pub const DELTA_EVENT: &str = "delta";

/// New state observed since the last checkpoint.
#[derive(Debug, Clone)]
pub struct PollDelta {
    /// Items that appeared since the checkpoint. Empty means no change.
    pub items: Vec<Value>,
    /// Opaque checkpoint to resume from next time.
    pub checkpoint: String,
}

/// A pollable external source.
#[async_trait]
pub trait PollSource: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch state newer than `checkpoint` (`None` on the first poll).
    async fn fetch(&self, checkpoint: Option<&str>) -> Result<PollDelta, ExecutionError>;
}

struct PollRegistration {
    agent_id: Uuid,
    owner_id: Uuid,
    source: Arc<dyn PollSource>,
    conditions: Option<Value>,
    checkpoint: Option<String>,
}

/// Queue key for one (agent, source) polling timer.
pub fn poll_key(agent_id: Uuid, source_name: &str) -> String {
    format!("poll:{}:{}", agent_id, source_name)
}

pub struct PollingBridge {
    queue: Arc<dyn JobQueue>,
    sink: Arc<dyn EventSink>,
    events: Arc<dyn EventBus>,
    registrations: RwLock<HashMap<String, PollRegistration>>,
}

impl PollingBridge {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        sink: Arc<dyn EventSink>,
        events: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            queue,
            sink,
            events,
            registrations: RwLock::new(HashMap::new()),
        }
    }

    /// Register a recurring poll for an (agent, source) pair. Idempotent:
    /// re-registration replaces the timer and resets nothing but the
    /// cadence (the checkpoint survives).
    pub async fn register(
        &self,
        agent_id: Uuid,
        owner_id: Uuid,
        source: Arc<dyn PollSource>,
        every_ms: u64,
        conditions: Option<Value>,
    ) -> Result<(), ExecutionError> {
        if every_ms == 0 {
            return Err(ExecutionError::Configuration(
                "poll interval must be non-zero".to_string(),
            ));
        }
        let key = poll_key(agent_id, source.name());
        let payload = json!({
            "kind": "poll",
            "key": key,
        });
        self.queue
            .enqueue(&key, payload, JobCadence::EveryMs(every_ms))
            .await?;

        let mut registrations = self.registrations.write().await;
        let checkpoint = registrations.remove(&key).and_then(|r| r.checkpoint);
        registrations.insert(
            key.clone(),
            PollRegistration {
                agent_id,
                owner_id,
                source,
                conditions,
                checkpoint,
            },
        );
        tracing::info!("Registered poll {}", key);
        Ok(())
    }

    /// Remove the timer and registration for an (agent, source) pair.
    pub async fn unregister(&self, agent_id: Uuid, source_name: &str) -> Result<bool, ExecutionError> {
        let key = poll_key(agent_id, source_name);
        self.registrations.write().await.remove(&key);
        self.queue.remove_by_key(&key).await
    }

    /// Execute one poll cycle for a registration key. Called by the queue
    /// worker when the timer fires.
    ///
    /// The checkpoint only advances after a successful fetch; a failed
    /// sample is retried from the same position on the next tick.
    pub async fn poll(&self, key: &str) {
        let (agent_id, owner_id, source, conditions, checkpoint) = {
            let registrations = self.registrations.read().await;
            let Some(reg) = registrations.get(key) else {
                tracing::warn!("Poll fired for unknown registration {}", key);
                return;
            };
            (
                reg.agent_id,
                reg.owner_id,
                Arc::clone(&reg.source),
                reg.conditions.clone(),
                reg.checkpoint.clone(),
            )
        };

        let delta = match source.fetch(checkpoint.as_deref()).await {
            Ok(delta) => delta,
            Err(e) => {
                tracing::warn!("Poll {} failed: {}", key, e);
                self.events.emit(
                    channels::POLLING,
                    "poll.failed",
                    json!({"key": key, "error": e.to_string()}),
                );
                return;
            }
        };

        // Fetch succeeded: advance the checkpoint before deciding whether
        // to synthesize anything.
        {
            let mut registrations = self.registrations.write().await;
            if let Some(reg) = registrations.get_mut(key) {
                reg.checkpoint = Some(delta.checkpoint.clone());
            }
        }

        if delta.items.is_empty() {
            return;
        }

        let payload = json!({
            "items": delta.items,
            "count": delta.items.len(),
        });
        if let Some(conditions) = &conditions {
            if !evaluate(conditions, &payload) {
                tracing::debug!("Poll {} delta did not satisfy conditions", key);
                return;
            }
        }

        self.events.emit(
            channels::POLLING,
            "poll.delta",
            json!({"key": key, "count": payload["count"]}),
        );

        let event = TriggerEvent {
            kind: EventKind::IntegrationEvent,
            source: source.name().to_string(),
            event_name: DELTA_EVENT.to_string(),
            payload,
            user_id: Some(owner_id),
        };
        let launched = self.sink.route(event).await;
        tracing::debug!("Poll {} for agent {} launched {} runs", key, agent_id, launched);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BroadcastEventBus;
    use crate::queue::InMemoryJobQueue;
    use std::sync::Mutex as StdMutex;

    /// Source that replays scripted fetch results.
    struct ScriptedSource {
        name: &'static str,
        results: StdMutex<Vec<Result<PollDelta, ExecutionError>>>,
        seen_checkpoints: StdMutex<Vec<Option<String>>>,
    }

    impl ScriptedSource {
        fn new(name: &'static str, mut results: Vec<Result<PollDelta, ExecutionError>>) -> Self {
            results.reverse();
            Self {
                name,
                results: StdMutex::new(results),
                seen_checkpoints: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PollSource for ScriptedSource {
        fn name(&self) -> &str {
            self.name
        }

        async fn fetch(&self, checkpoint: Option<&str>) -> Result<PollDelta, ExecutionError> {
            self.seen_checkpoints
                .lock()
                .unwrap()
                .push(checkpoint.map(|s| s.to_string()));
            self.results
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Err(ExecutionError::Timeout("script exhausted".into())))
        }
    }

    /// Sink that records routed events instead of running agents.
    #[derive(Default)]
    struct RecordingSink {
        routed: StdMutex<Vec<TriggerEvent>>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn route(&self, event: TriggerEvent) -> usize {
            self.routed.lock().unwrap().push(event);
            1
        }
    }

    fn bridge_with(sink: Arc<RecordingSink>) -> (PollingBridge, Arc<InMemoryJobQueue>) {
        let queue = Arc::new(InMemoryJobQueue::new());
        let bus = Arc::new(BroadcastEventBus::default());
        (PollingBridge::new(queue.clone(), sink, bus), queue)
    }

    fn delta(items: Vec<Value>, checkpoint: &str) -> Result<PollDelta, ExecutionError> {
        Ok(PollDelta {
            items,
            checkpoint: checkpoint.to_string(),
        })
    }

    #[tokio::test]
    async fn non_empty_delta_synthesizes_an_event() {
        let sink = Arc::new(RecordingSink::default());
        let (bridge, queue) = bridge_with(sink.clone());
        let agent_id = Uuid::new_v4();
        let source = Arc::new(ScriptedSource::new(
            "feed",
            vec![delta(vec![json!({"id": 1})], "cp1")],
        ));

        bridge
            .register(agent_id, Uuid::new_v4(), source, 60_000, None)
            .await
            .expect("register");
        assert_eq!(queue.list_all().await.expect("list").len(), 1);

        bridge.poll(&poll_key(agent_id, "feed")).await;

        let routed = sink.routed.lock().unwrap();
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].source, "feed");
        assert_eq!(routed[0].event_name, DELTA_EVENT);
        assert_eq!(routed[0].payload["count"], 1);
    }

    #[tokio::test]
    async fn empty_delta_routes_nothing_but_advances_checkpoint() {
        let sink = Arc::new(RecordingSink::default());
        let (bridge, _) = bridge_with(sink.clone());
        let agent_id = Uuid::new_v4();
        let source = Arc::new(ScriptedSource::new(
            "feed",
            vec![
                delta(vec![], "cp1"),
                delta(vec![json!({"id": 2})], "cp2"),
            ],
        ));

        bridge
            .register(agent_id, Uuid::new_v4(), source.clone(), 60_000, None)
            .await
            .expect("register");

        let key = poll_key(agent_id, "feed");
        bridge.poll(&key).await;
        assert!(sink.routed.lock().unwrap().is_empty());

        bridge.poll(&key).await;
        assert_eq!(sink.routed.lock().unwrap().len(), 1);

        // Second fetch resumed from the first (empty) delta's checkpoint.
        let seen = source.seen_checkpoints.lock().unwrap();
        assert_eq!(seen.as_slice(), &[None, Some("cp1".to_string())]);
    }

    #[tokio::test]
    async fn failed_fetch_does_not_advance_checkpoint() {
        let sink = Arc::new(RecordingSink::default());
        let (bridge, _) = bridge_with(sink.clone());
        let agent_id = Uuid::new_v4();
        let source = Arc::new(ScriptedSource::new(
            "feed",
            vec![
                delta(vec![json!({"id": 1})], "cp1"),
                Err(ExecutionError::Timeout("down".into())),
                delta(vec![json!({"id": 2})], "cp2"),
            ],
        ));

        bridge
            .register(agent_id, Uuid::new_v4(), source.clone(), 60_000, None)
            .await
            .expect("register");

        let key = poll_key(agent_id, "feed");
        bridge.poll(&key).await;
        bridge.poll(&key).await; // fails
        bridge.poll(&key).await;

        // The failed sample retried from cp1, not from a phantom advance.
        let seen = source.seen_checkpoints.lock().unwrap();
        assert_eq!(
            seen.as_slice(),
            &[None, Some("cp1".to_string()), Some("cp1".to_string())]
        );
    }

    #[tokio::test]
    async fn conditions_filter_the_delta() {
        let sink = Arc::new(RecordingSink::default());
        let (bridge, _) = bridge_with(sink.clone());
        let agent_id = Uuid::new_v4();
        let source = Arc::new(ScriptedSource::new(
            "feed",
            vec![
                delta(vec![json!({"id": 1})], "cp1"),
                delta(vec![json!({"id": 2}), json!({"id": 3})], "cp2"),
            ],
        ));

        bridge
            .register(
                agent_id,
                Uuid::new_v4(),
                source,
                60_000,
                Some(json!({"count": {"$gte": 2}})),
            )
            .await
            .expect("register");

        let key = poll_key(agent_id, "feed");
        bridge.poll(&key).await;
        assert!(sink.routed.lock().unwrap().is_empty());

        bridge.poll(&key).await;
        assert_eq!(sink.routed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reregistration_keeps_one_timer_and_the_checkpoint() {
        let sink = Arc::new(RecordingSink::default());
        let (bridge, queue) = bridge_with(sink);
        let agent_id = Uuid::new_v4();
        let owner = Uuid::new_v4();
        let source = Arc::new(ScriptedSource::new(
            "feed",
            vec![delta(vec![], "cp1")],
        ));

        bridge
            .register(agent_id, owner, source.clone(), 60_000, None)
            .await
            .expect("register");
        bridge.poll(&poll_key(agent_id, "feed")).await;

        bridge
            .register(agent_id, owner, source.clone(), 30_000, None)
            .await
            .expect("re-register");
        assert_eq!(queue.list_all().await.expect("list").len(), 1);

        bridge.poll(&poll_key(agent_id, "feed")).await;
        let seen = source.seen_checkpoints.lock().unwrap();
        // Checkpoint survived the re-registration.
        assert_eq!(seen.last().expect("polled"), &Some("cp1".to_string()));
    }

    #[tokio::test]
    async fn unregister_removes_timer_and_registration() {
        let sink = Arc::new(RecordingSink::default());
        let (bridge, queue) = bridge_with(sink.clone());
        let agent_id = Uuid::new_v4();
        let source = Arc::new(ScriptedSource::new("feed", vec![]));

        bridge
            .register(agent_id, Uuid::new_v4(), source, 60_000, None)
            .await
            .expect("register");
        assert!(bridge.unregister(agent_id, "feed").await.expect("unregister"));
        assert!(queue.list_all().await.expect("list").is_empty());

        // A late firing for the removed key is a no-op.
        bridge.poll(&poll_key(agent_id, "feed")).await;
        assert!(sink.routed.lock().unwrap().is_empty());
    }
}
