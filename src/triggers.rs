//! Trigger matching: which agents should react to an event.
//!
//! Matching itself is a pure, synchronous function over agent records; the
//! [`TriggerRouter`] wraps it with store access and hands each match to the
//! retry supervisor as its own spawned task, so one agent's run can never
//! block or fail another's.

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use crate::conditions::evaluate;
use crate::events::{channels, EventBus};
use crate::retry::RetrySupervisor;
use crate::store::AgentStore;
use crate::types::{
    Agent, EventKind, ExecutionRequest, RunSource, Trigger, TriggerEvent, TriggerKind,
};

/// One agent that should run in response to an event.
#[derive(Debug, Clone)]
pub struct TriggerMatch {
    pub agent_id: Uuid,
    pub owner_id: Uuid,
    pub trigger: Trigger,
}

/// Find every agent whose enabled triggers match the event.
///
/// Pure: mutates neither agents nor the event. Each agent contributes at
/// most one match; its first satisfying trigger wins.
pub fn match_event(agents: &[Agent], event: &TriggerEvent) -> Vec<TriggerMatch> {
    agents
        .iter()
        .filter_map(|agent| {
            agent
                .triggers
                .iter()
                .find(|trigger| trigger_satisfied(trigger, event))
                .map(|trigger| TriggerMatch {
                    agent_id: agent.id,
                    owner_id: agent.owner_id,
                    trigger: trigger.clone(),
                })
        })
        .collect()
}

fn trigger_satisfied(trigger: &Trigger, event: &TriggerEvent) -> bool {
    if !trigger.enabled {
        return false;
    }

    let pattern_matches = match (trigger.kind, event.kind) {
        (TriggerKind::Webhook, EventKind::Webhook) => trigger
            .webhook_path
            .as_deref()
            .map(|path| path == event.event_name)
            .unwrap_or(false),
        (TriggerKind::IntegrationEvent, EventKind::IntegrationEvent) => trigger
            .event_pattern
            .as_deref()
            .map(|pattern| pattern_matches_event(pattern, &event.source, &event.event_name))
            .unwrap_or(false),
        _ => false,
    };
    if !pattern_matches {
        return false;
    }

    match &trigger.conditions {
        Some(conditions) if !is_empty_conditions(conditions) => {
            evaluate(conditions, &event.payload)
        }
        _ => true,
    }
}

/// `"*"` matches everything; `"source.*"` matches any event from that
/// source; otherwise the pattern must equal `"source.event_name"` exactly.
fn pattern_matches_event(pattern: &str, source: &str, event_name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return prefix == source;
    }
    pattern == format!("{}.{}", source, event_name)
}

fn is_empty_conditions(conditions: &serde_json::Value) -> bool {
    conditions.as_object().map(|m| m.is_empty()).unwrap_or(true)
}

/// Anything that can accept a normalized event for routing. Implemented by
/// [`TriggerRouter`]; injected into the polling bridge so synthesized events
/// take the same path as pushed ones.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    /// Route one event; returns the number of runs launched.
    async fn route(&self, event: TriggerEvent) -> usize;
}

/// Routes events to supervised runs.
pub struct TriggerRouter {
    store: Arc<dyn AgentStore>,
    supervisor: Arc<RetrySupervisor>,
    events: Arc<dyn EventBus>,
}

impl TriggerRouter {
    pub fn new(
        store: Arc<dyn AgentStore>,
        supervisor: Arc<RetrySupervisor>,
        events: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            store,
            supervisor,
            events,
        }
    }

    /// Match the event against all candidate agents and launch one
    /// supervised run per match. Returns the number of runs launched.
    pub async fn route(&self, event: TriggerEvent) -> usize {
        self.route_inner(event).await
    }

    async fn route_inner(&self, event: TriggerEvent) -> usize {
        let candidates = match event.user_id {
            Some(user_id) => self.store.list_for_owner(user_id).await,
            None => self.store.list().await,
        };
        let candidates = match candidates {
            Ok(agents) => agents,
            Err(e) => {
                tracing::error!("Trigger routing failed to load agents: {}", e);
                return 0;
            }
        };

        let matches = match_event(&candidates, &event);
        if matches.is_empty() {
            tracing::debug!(
                "Event {}.{} matched no agents",
                event.source,
                event.event_name
            );
            return 0;
        }

        self.events.emit(
            channels::RUNS,
            "event.matched",
            json!({
                "source": event.source,
                "event_name": event.event_name,
                "matched": matches.len(),
            }),
        );

        let launched = matches.len();
        for matched in matches {
            let supervisor = Arc::clone(&self.supervisor);
            let request = ExecutionRequest {
                agent_id: matched.agent_id,
                owner_id: matched.owner_id,
                input: format!(
                    "Event received from {}: {}\nPayload:\n{}",
                    event.source, event.event_name, event.payload
                ),
                source: RunSource::Triggered,
            };
            // Isolated unit per match; the supervisor never lets anything
            // escape.
            tokio::spawn(async move {
                supervisor.run(request).await;
            });
        }
        launched
    }
}

#[async_trait::async_trait]
impl EventSink for TriggerRouter {
    async fn route(&self, event: TriggerEvent) -> usize {
        self.route_inner(event).await
    }
}
