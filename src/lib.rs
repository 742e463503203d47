//! # Conductor
//!
//! An orchestration core for autonomous LLM agents: scheduled runs, event
//! triggers with condition matching, polled integrations, supervised retry,
//! and multi-agent delegation.
//!
//! Each agent run follows the "tools in a loop" pattern:
//! 1. A schedule firing, matched trigger, manual request, or delegation
//!    produces an execution request
//! 2. The retry supervisor loads the agent and drives its conversation
//! 3. The model's replies are parsed for tool calls, dispatched through the
//!    registry, and fed back until a final reply or the iteration cap
//! 4. The outcome is persisted to the agent's log and emitted on the bus
//!
//! ## Example
//!
//! ```rust,ignore
//! use conductor::{config::Config, runtime::Runtime};
//!
//! let config = Config::from_env()?;
//! let runtime = Runtime::new(config);
//! let worker = runtime.start_worker();
//! ```

pub mod agent;
pub mod conditions;
pub mod config;
pub mod delegation;
pub mod error;
pub mod events;
pub mod llm;
pub mod polling;
pub mod queue;
pub mod retry;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod tools;
pub mod triggers;
pub mod types;

pub use config::Config;
pub use error::ExecutionError;
pub use runtime::Runtime;
