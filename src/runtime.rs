//! Composition root: wires the stores, queue, driver, supervisor, router,
//! polling bridge, and delegation coordinator into one running system.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::agent::ConversationDriver;
use crate::config::Config;
use crate::delegation::DelegationCoordinator;
use crate::events::{BroadcastEventBus, EventBus};
use crate::llm::OpenRouterClient;
use crate::polling::PollingBridge;
use crate::queue::{InMemoryJobQueue, JobHandler, JobQueue, QueueWorker};
use crate::retry::RetrySupervisor;
use crate::scheduler::Scheduler;
use crate::store::{AgentStore, InMemoryAgentStore};
use crate::tools::ToolRegistry;
use crate::triggers::TriggerRouter;
use crate::types::ExecutionRequest;

/// The assembled orchestrator.
pub struct Runtime {
    pub config: Config,
    pub store: Arc<dyn AgentStore>,
    pub events: Arc<BroadcastEventBus>,
    pub queue: Arc<dyn JobQueue>,
    pub scheduler: Arc<Scheduler>,
    pub supervisor: Arc<RetrySupervisor>,
    pub router: Arc<TriggerRouter>,
    pub polling: Arc<PollingBridge>,
    pub delegation: Arc<DelegationCoordinator>,
}

impl Runtime {
    /// Build the production wiring from configuration.
    pub fn new(config: Config) -> Self {
        let store: Arc<dyn AgentStore> = Arc::new(InMemoryAgentStore::new());
        let events = Arc::new(BroadcastEventBus::default());
        let bus: Arc<dyn EventBus> = events.clone();
        let queue: Arc<dyn JobQueue> = Arc::new(InMemoryJobQueue::new());

        let tools = Arc::new(ToolRegistry::with_builtins(bus.clone()));
        let llm = Arc::new(OpenRouterClient::new(config.api_key.clone()));
        let driver = Arc::new(ConversationDriver::new(
            llm,
            tools,
            bus.clone(),
            &config,
        ));

        let scheduler = Arc::new(Scheduler::new(queue.clone(), store.clone()));
        let supervisor = Arc::new(RetrySupervisor::new(
            driver.clone(),
            store.clone(),
            bus.clone(),
            scheduler.clone(),
            &config,
        ));
        let router = Arc::new(TriggerRouter::new(
            store.clone(),
            supervisor.clone(),
            bus.clone(),
        ));
        let polling = Arc::new(PollingBridge::new(
            queue.clone(),
            router.clone(),
            bus.clone(),
        ));
        let delegation = Arc::new(DelegationCoordinator::new(
            store.clone(),
            driver,
            bus,
            &config,
        ));

        Self {
            config,
            store,
            events,
            queue,
            scheduler,
            supervisor,
            router,
            polling,
            delegation,
        }
    }

    /// Spawn the queue worker. Returns its join handle; dropping or
    /// aborting the handle stops the timer loop.
    pub fn start_worker(&self) -> tokio::task::JoinHandle<()> {
        let handler = Arc::new(RuntimeJobHandler {
            supervisor: self.supervisor.clone(),
            polling: self.polling.clone(),
        });
        let worker = QueueWorker::new(self.queue.clone(), handler, self.config.queue_tick_ms);
        tokio::spawn(worker.run())
    }
}

/// Dispatches fired queue entries to the right subsystem.
struct RuntimeJobHandler {
    supervisor: Arc<RetrySupervisor>,
    polling: Arc<PollingBridge>,
}

#[async_trait]
impl JobHandler for RuntimeJobHandler {
    async fn handle(&self, key: &str, payload: Value) {
        match payload.get("kind").and_then(Value::as_str) {
            Some("run") => {
                let request = payload
                    .get("request")
                    .cloned()
                    .map(serde_json::from_value::<ExecutionRequest>);
                match request {
                    Some(Ok(request)) => {
                        self.supervisor.run(request).await;
                    }
                    other => {
                        tracing::error!("Job '{}' has a malformed run payload: {:?}", key, other);
                    }
                }
            }
            Some("poll") => self.polling.poll(key).await,
            other => {
                tracing::error!("Job '{}' has unknown kind {:?}", key, other);
            }
        }
    }
}
