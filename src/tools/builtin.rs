//! Builtin tools.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Tool, ToolContext};
use crate::events::{channels, EventBus};

/// Echo the given text back. Mostly useful for wiring checks.
pub struct Echo;

#[async_trait]
impl Tool for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the provided text back verbatim."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": {
                    "type": "string",
                    "description": "The text to echo"
                }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> anyhow::Result<Value> {
        let text = args["text"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'text' argument"))?;
        Ok(json!(text))
    }
}

/// Current UTC time.
pub struct CurrentTime;

#[async_trait]
impl Tool for CurrentTime {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time in UTC (RFC 3339)."
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> anyhow::Result<Value> {
        Ok(json!(chrono::Utc::now().to_rfc3339()))
    }
}

/// Fetch content from a URL.
pub struct FetchUrl {
    client: reqwest::Client,
}

impl FetchUrl {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent("Mozilla/5.0 (compatible; Conductor/1.0)")
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for FetchUrl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for FetchUrl {
    fn name(&self) -> &str {
        "fetch_url"
    }

    fn description(&self) -> &str {
        "Fetch the content of a URL. Returns the text body of the page."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The URL to fetch"
                }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> anyhow::Result<Value> {
        let url = args["url"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'url' argument"))?;

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow::anyhow!("HTTP error: {}", status));
        }

        let body = response.text().await?;
        // Hard cap so a large page cannot blow up the conversation window.
        if body.len() > 20_000 {
            let mut cut = 20_000;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            Ok(json!(format!(
                "{}... [content truncated, showing first {} chars]",
                &body[..cut],
                cut
            )))
        } else {
            Ok(json!(body))
        }
    }
}

/// Send a user-facing notification via the event bus.
///
/// Also the deterministic fallback target when a run's prompt demanded a
/// notification and the model never sent one.
pub struct SendNotification {
    events: Arc<dyn EventBus>,
}

impl SendNotification {
    pub fn new(events: Arc<dyn EventBus>) -> Self {
        Self { events }
    }

    /// Name as referenced by the driver's required-action heuristic.
    pub const NAME: &'static str = "send_notification";
}

#[async_trait]
impl Tool for SendNotification {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Send a notification message to the agent's owner."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "The notification text"
                },
                "title": {
                    "type": "string",
                    "description": "Optional short title"
                }
            },
            "required": ["message"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<Value> {
        let message = args["message"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'message' argument"))?;

        self.events.emit(
            channels::RUNS,
            "notification",
            json!({
                "agent_id": ctx.agent_id,
                "user_id": ctx.user_id,
                "title": args["title"].as_str(),
                "message": message,
            }),
        );

        Ok(json!({"delivered": true}))
    }
}
