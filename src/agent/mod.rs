//! Conversation driving: decision parsing, prompting, and the tool loop.

mod decision;
mod driver;
mod prompt;

pub use decision::{parse_decision, Decision};
pub use driver::{ConversationDriver, DriverOutcome, DriverStatus, ToolStep};
pub use prompt::build_system_prompt;
