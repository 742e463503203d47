//! The conversation driver: one agent's bounded tool-calling loop.
//!
//! Each iteration sends the rolling message window to the model and parses
//! the reply for a decision. Tool calls are dispatched through the registry
//! and their (truncated) results fed back; a plain reply ends the run.
//! The loop is bounded by `max_iterations` and can never spin forever.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{json, Value};

use super::decision::{parse_decision, Decision};
use super::prompt::{build_system_prompt, forced_tool_prompt};
use crate::config::Config;
use crate::error::ExecutionError;
use crate::events::{channels, EventBus};
use crate::llm::{ChatMessage, LlmClient};
use crate::tools::{SendNotification, ToolContext, ToolRegistry};
use crate::types::{Agent, ScheduleDirective};

/// Items kept when summarizing an oversized array result.
const TRUNCATE_MAX_ITEMS: usize = 5;

/// Object fields preserved by result summarization.
const SUMMARY_FIELDS: [&str; 8] = [
    "id", "name", "title", "status", "summary", "url", "email", "subject",
];

/// Character cap for string results re-entering the window.
const MAX_RESULT_CHARS: usize = 4000;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    /// The model produced a final reply.
    Completed,
    /// Iteration budget ran out without a tool call or final reply.
    Exhausted,
    /// A required side effect never happened; the deterministic fallback
    /// invocation was performed instead.
    RequiredActionMissed,
}

/// One executed tool call.
#[derive(Debug, Clone)]
pub struct ToolStep {
    pub name: String,
    pub args: Value,
    pub result: String,
    pub ok: bool,
}

/// Result of driving one conversation to completion.
#[derive(Debug, Clone)]
pub struct DriverOutcome {
    pub status: DriverStatus,
    pub reply: Option<String>,
    pub steps: Vec<ToolStep>,
    pub schedule_directive: Option<ScheduleDirective>,
    pub iterations: usize,
}

/// Drives one agent's conversation against the LLM.
pub struct ConversationDriver {
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    events: Arc<dyn EventBus>,
    max_iterations: usize,
    message_window: usize,
}

impl ConversationDriver {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolRegistry>,
        events: Arc<dyn EventBus>,
        config: &Config,
    ) -> Self {
        Self {
            llm,
            tools,
            events,
            max_iterations: config.max_iterations,
            message_window: config.message_window,
        }
    }

    /// Run the agent on the given input until it replies or the iteration
    /// budget runs out.
    ///
    /// Tool failures are fed back into the conversation; only LLM transport
    /// failures surface as errors (and are retried by the supervisor).
    pub async fn run(&self, agent: &Agent, input: &str) -> Result<DriverOutcome, ExecutionError> {
        let ctx = ToolContext {
            agent_id: agent.id,
            user_id: agent.owner_id,
        };
        let allowed = self.tools.list_allowed(&agent.allowed_tools);
        let system_prompt = build_system_prompt(&agent.system_prompt, &allowed);

        let mut messages = vec![
            ChatMessage::system(system_prompt),
            ChatMessage::user(input.to_string()),
        ];

        let required_tool = self.required_tool(agent, input);
        let mut invoked: HashSet<String> = HashSet::new();
        let mut steps: Vec<ToolStep> = Vec::new();
        let mut schedule_directive: Option<ScheduleDirective> = None;
        let mut forced_reprompt_used = false;
        let mut last_reply: Option<String> = None;
        let mut iterations = 0;

        while iterations < self.max_iterations {
            iterations += 1;
            trim_window(&mut messages, self.message_window);
            tracing::debug!("Agent {} iteration {}", agent.id, iterations);

            let reply = self.llm.chat(&agent.model, &messages).await?;

            if reply.trim().is_empty() {
                // Not a decision and not a usable final reply; spend the
                // iteration and ask again.
                continue;
            }

            match parse_decision(&reply) {
                Decision::ToolCall { target, args } => {
                    messages.push(ChatMessage::assistant(reply.clone()));
                    let step = self.dispatch_tool(agent, &ctx, &target, args).await;
                    if step.ok {
                        invoked.insert(step.name.clone());
                    }
                    messages.push(ChatMessage::tool(step.result.clone()));
                    steps.push(step);
                }
                Decision::Schedule(directive) => {
                    messages.push(ChatMessage::assistant(reply.clone()));
                    messages.push(ChatMessage::tool(
                        "Schedule change recorded; it will apply after this run.".to_string(),
                    ));
                    schedule_directive = Some(directive);
                }
                Decision::Reply(text) => {
                    if let Some(required) = &required_tool {
                        if !invoked.contains(required) && !forced_reprompt_used {
                            // One forced re-prompt before accepting the
                            // text as final.
                            forced_reprompt_used = true;
                            messages.push(ChatMessage::assistant(reply.clone()));
                            messages.push(ChatMessage::user(forced_tool_prompt(required)));
                            last_reply = Some(text);
                            continue;
                        }
                    }
                    return Ok(DriverOutcome {
                        status: DriverStatus::Completed,
                        reply: Some(text),
                        steps,
                        schedule_directive,
                        iterations,
                    });
                }
            }
        }

        // Budget spent. If a mandatory side effect never happened, perform
        // the deterministic fallback invocation before giving up.
        if let Some(required) = required_tool {
            if !invoked.contains(&required) {
                let args = fallback_args(&required, input, last_reply.as_deref());
                let step = self.dispatch_tool(agent, &ctx, &required, args).await;
                tracing::warn!(
                    "Agent {} did not perform required action '{}'; fallback invoked (ok={})",
                    agent.id,
                    required,
                    step.ok
                );
                steps.push(step);
                return Ok(DriverOutcome {
                    status: DriverStatus::RequiredActionMissed,
                    reply: last_reply,
                    steps,
                    schedule_directive,
                    iterations,
                });
            }
        }

        Ok(DriverOutcome {
            status: DriverStatus::Exhausted,
            reply: last_reply,
            steps,
            schedule_directive,
            iterations,
        })
    }

    /// Dispatch one tool call, enforcing the agent's allowed set and
    /// normalizing failures into a conversation turn.
    async fn dispatch_tool(
        &self,
        agent: &Agent,
        ctx: &ToolContext,
        target: &str,
        args: Value,
    ) -> ToolStep {
        self.events.emit(
            channels::RUNS,
            "run.step",
            json!({"agent_id": agent.id, "tool": target}),
        );

        if !agent.allows_tool(target) {
            return ToolStep {
                name: target.to_string(),
                args,
                result: format!("Error: tool '{}' is not allowed for this agent", target),
                ok: false,
            };
        }

        match self.tools.execute(target, args.clone(), ctx).await {
            Ok(value) => {
                let truncated = truncate_tool_result(&value);
                ToolStep {
                    name: target.to_string(),
                    args,
                    result: truncated.to_string(),
                    ok: true,
                }
            }
            Err(e) => ToolStep {
                name: target.to_string(),
                args,
                result: format!("Error: {}", e),
                ok: false,
            },
        }
    }

    /// Task heuristic: does this run require a notification to be sent?
    ///
    /// Only applies when the agent can actually call the tool.
    fn required_tool(&self, agent: &Agent, input: &str) -> Option<String> {
        if !self.tools.has(SendNotification::NAME) || !agent.allows_tool(SendNotification::NAME) {
            return None;
        }
        let haystack = format!("{} {}", agent.system_prompt, input).to_lowercase();
        let demands_notification = ["notify", "notification", "alert me", "send me a message"]
            .iter()
            .any(|needle| haystack.contains(needle));
        demands_notification.then(|| SendNotification::NAME.to_string())
    }
}

/// Best-effort arguments for the deterministic fallback invocation.
fn fallback_args(tool: &str, input: &str, last_reply: Option<&str>) -> Value {
    match tool {
        SendNotification::NAME => {
            let message = last_reply
                .filter(|r| !r.trim().is_empty())
                .unwrap_or(input);
            json!({
                "title": "Agent run incomplete",
                "message": message,
            })
        }
        _ => Value::Null,
    }
}

/// Trim to the system prompt plus the last `window` turns.
fn trim_window(messages: &mut Vec<ChatMessage>, window: usize) {
    if messages.len() <= window + 1 {
        return;
    }
    let tail_start = messages.len() - window;
    messages.drain(1..tail_start);
}

/// Shrink an oversized tool result before it re-enters the context window.
///
/// Arrays become a count plus up to [`TRUNCATE_MAX_ITEMS`] summarized items
/// with the omitted count recorded; large objects keep only the whitelisted
/// summary fields; long strings are cut at [`MAX_RESULT_CHARS`].
pub fn truncate_tool_result(value: &Value) -> Value {
    match value {
        Value::Array(items) if items.len() > TRUNCATE_MAX_ITEMS => {
            let shown: Vec<Value> = items
                .iter()
                .take(TRUNCATE_MAX_ITEMS)
                .map(summarize_item)
                .collect();
            json!({
                "total_items": items.len(),
                "items": shown,
                "omitted_items": items.len() - TRUNCATE_MAX_ITEMS,
            })
        }
        Value::Object(map) if map.len() > SUMMARY_FIELDS.len() => {
            let mut summary = serde_json::Map::new();
            for field in SUMMARY_FIELDS {
                if let Some(v) = map.get(field) {
                    summary.insert(field.to_string(), v.clone());
                }
            }
            let omitted = map.len() - summary.len();
            summary.insert("omitted_fields".to_string(), json!(omitted));
            Value::Object(summary)
        }
        Value::String(s) if s.len() > MAX_RESULT_CHARS => {
            let mut cut = MAX_RESULT_CHARS;
            while !s.is_char_boundary(cut) {
                cut -= 1;
            }
            json!(format!("{}... [truncated {} chars]", &s[..cut], s.len() - cut))
        }
        other => other.clone(),
    }
}

fn summarize_item(item: &Value) -> Value {
    match item.as_object() {
        Some(map) => {
            let mut summary = serde_json::Map::new();
            for field in SUMMARY_FIELDS {
                if let Some(v) = map.get(field) {
                    summary.insert(field.to_string(), v.clone());
                }
            }
            if summary.is_empty() {
                item.clone()
            } else {
                Value::Object(summary)
            }
        }
        None => item.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BroadcastEventBus;
    use crate::tools::{Echo, Tool};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// LLM stub that replays a fixed script of replies.
    struct ScriptedLlm {
        replies: Mutex<Vec<String>>,
        calls: Mutex<usize>,
    }

    impl ScriptedLlm {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().rev().map(|s| s.to_string()).collect()),
                calls: Mutex::new(0),
            }
        }

        fn call_count(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn chat(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
        ) -> Result<String, ExecutionError> {
            *self.calls.lock().unwrap() += 1;
            Ok(self.replies.lock().unwrap().pop().unwrap_or_default())
        }
    }

    /// Tool returning a fixed value.
    struct FixedTool {
        name: &'static str,
        value: Value,
    }

    #[async_trait]
    impl Tool for FixedTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "fixed"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> anyhow::Result<Value> {
            Ok(self.value.clone())
        }
    }

    fn driver_with(
        llm: Arc<dyn LlmClient>,
        registry: ToolRegistry,
        bus: Arc<BroadcastEventBus>,
    ) -> ConversationDriver {
        let config = Config::new("test-key".into(), "test-model".into());
        ConversationDriver::new(llm, Arc::new(registry), bus, &config)
    }

    fn test_agent(prompt: &str) -> Agent {
        Agent::new(Uuid::new_v4(), "t", prompt, "test-model")
    }

    #[tokio::test]
    async fn tool_call_then_final_reply() {
        let llm = Arc::new(ScriptedLlm::new(&[
            r#"{"kind": "tool", "target": "echo", "args": {"text": "hi"}}"#,
            "Echoed successfully.",
        ]));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));
        let bus = Arc::new(BroadcastEventBus::default());
        let driver = driver_with(llm.clone(), registry, bus);

        let outcome = driver
            .run(&test_agent("You echo things."), "echo hi")
            .await
            .expect("run");

        assert_eq!(outcome.status, DriverStatus::Completed);
        assert_eq!(outcome.reply.as_deref(), Some("Echoed successfully."));
        assert_eq!(outcome.steps.len(), 1);
        assert!(outcome.steps[0].ok);
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn empty_replies_exhaust_the_iteration_budget() {
        // A model that never emits a tool call or a final reply terminates
        // at the cap, not in an infinite loop.
        let llm = Arc::new(ScriptedLlm::new(&[]));
        let bus = Arc::new(BroadcastEventBus::default());
        let driver = driver_with(llm.clone(), ToolRegistry::new(), bus);

        let outcome = driver
            .run(&test_agent("You do things."), "do the thing")
            .await
            .expect("run");

        assert_eq!(outcome.status, DriverStatus::Exhausted);
        assert_eq!(outcome.iterations, 8);
        assert_eq!(llm.call_count(), 8);
        assert!(outcome.reply.is_none());
    }

    #[tokio::test]
    async fn tool_error_is_fed_back_not_fatal() {
        let llm = Arc::new(ScriptedLlm::new(&[
            r#"{"kind": "tool", "target": "does_not_exist", "args": {}}"#,
            "Recovered.",
        ]));
        let bus = Arc::new(BroadcastEventBus::default());
        let driver = driver_with(llm, ToolRegistry::new(), bus);

        let outcome = driver
            .run(&test_agent("p"), "go")
            .await
            .expect("run survives tool failure");

        assert_eq!(outcome.status, DriverStatus::Completed);
        assert!(!outcome.steps[0].ok);
        assert!(outcome.steps[0].result.contains("Unknown tool"));
    }

    #[tokio::test]
    async fn disallowed_tool_is_rejected_as_a_turn() {
        let llm = Arc::new(ScriptedLlm::new(&[
            r#"{"kind": "tool", "target": "current_time", "args": {}}"#,
            "Done.",
        ]));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));
        registry.register(Arc::new(crate::tools::CurrentTime));
        let bus = Arc::new(BroadcastEventBus::default());
        let driver = driver_with(llm, registry, bus);

        let mut agent = test_agent("p");
        agent.allowed_tools = vec!["echo".to_string()];

        let outcome = driver.run(&agent, "go").await.expect("run");
        assert!(!outcome.steps[0].ok);
        assert!(outcome.steps[0].result.contains("not allowed"));
    }

    #[tokio::test]
    async fn forced_reprompt_when_required_action_skipped() {
        let bus = Arc::new(BroadcastEventBus::default());
        let mut rx = bus.subscribe();
        let llm = Arc::new(ScriptedLlm::new(&[
            "I checked everything, all good!",
            r#"{"kind": "tool", "target": "send_notification", "args": {"message": "all good"}}"#,
            "Notified the owner.",
        ]));
        let registry = ToolRegistry::with_builtins(bus.clone());
        let driver = driver_with(llm.clone(), registry, bus);

        let outcome = driver
            .run(&test_agent("Check the build and notify me of the result."), "check now")
            .await
            .expect("run");

        assert_eq!(outcome.status, DriverStatus::Completed);
        assert_eq!(llm.call_count(), 3);
        assert!(outcome.steps.iter().any(|s| s.name == "send_notification" && s.ok));
        // The notification really went out.
        let mut saw_notification = false;
        while let Ok(event) = rx.try_recv() {
            if event.event == "notification" {
                saw_notification = true;
            }
        }
        assert!(saw_notification);
    }

    #[tokio::test]
    async fn second_plain_reply_after_reprompt_is_accepted() {
        let llm = Arc::new(ScriptedLlm::new(&[
            "All good, nothing to report.",
            "Really, nothing to report.",
        ]));
        let bus = Arc::new(BroadcastEventBus::default());
        let registry = ToolRegistry::with_builtins(bus.clone());
        let driver = driver_with(llm.clone(), registry, bus);

        let outcome = driver
            .run(&test_agent("Notify me about the deploy."), "check")
            .await
            .expect("run");

        assert_eq!(outcome.status, DriverStatus::Completed);
        assert_eq!(outcome.reply.as_deref(), Some("Really, nothing to report."));
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn exhaustion_with_required_action_triggers_fallback() {
        let bus = Arc::new(BroadcastEventBus::default());
        let mut rx = bus.subscribe();
        // Empty replies only: budget burns out with nothing done.
        let llm = Arc::new(ScriptedLlm::new(&[]));
        let registry = ToolRegistry::with_builtins(bus.clone());
        let driver = driver_with(llm, registry, bus);

        let outcome = driver
            .run(&test_agent("Watch the feed and notify me."), "watch")
            .await
            .expect("run");

        assert_eq!(outcome.status, DriverStatus::RequiredActionMissed);
        let fallback = outcome.steps.last().expect("fallback step");
        assert_eq!(fallback.name, "send_notification");
        assert!(fallback.ok);

        let mut saw_notification = false;
        while let Ok(event) = rx.try_recv() {
            if event.event == "notification" {
                saw_notification = true;
            }
        }
        assert!(saw_notification);
    }

    #[tokio::test]
    async fn schedule_decision_is_recorded_and_applied_after_final_reply() {
        let llm = Arc::new(ScriptedLlm::new(&[
            r#"{"kind": "schedule", "enabled": true, "cadence": {"interval": {"minutes": 15}}}"#,
            "Rescheduled myself to every 15 minutes.",
        ]));
        let bus = Arc::new(BroadcastEventBus::default());
        let driver = driver_with(llm, ToolRegistry::new(), bus);

        let outcome = driver.run(&test_agent("p"), "adjust cadence").await.expect("run");

        assert_eq!(outcome.status, DriverStatus::Completed);
        let directive = outcome.schedule_directive.expect("directive recorded");
        assert!(directive.enabled);
        assert_eq!(
            directive.cadence,
            Some(crate::types::Cadence::Interval { minutes: 15 })
        );
    }

    #[tokio::test]
    async fn oversized_array_result_is_truncated_in_context() {
        let big: Vec<Value> = (0..500).map(|i| json!({"id": i, "data": "x".repeat(50)})).collect();
        let llm = Arc::new(ScriptedLlm::new(&[
            r#"{"kind": "tool", "target": "big_list", "args": {}}"#,
            "Summarized.",
        ]));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(FixedTool {
            name: "big_list",
            value: json!(big),
        }));
        let bus = Arc::new(BroadcastEventBus::default());
        let driver = driver_with(llm, registry, bus);

        let outcome = driver.run(&test_agent("p"), "list").await.expect("run");

        let step = &outcome.steps[0];
        let parsed: Value = serde_json::from_str(&step.result).expect("json result");
        assert_eq!(parsed["total_items"], 500);
        assert_eq!(parsed["omitted_items"], 495);
        assert_eq!(parsed["items"].as_array().expect("items").len(), 5);
    }

    #[test]
    fn truncate_keeps_small_results_intact() {
        let small = json!([{"id": 1}, {"id": 2}]);
        assert_eq!(truncate_tool_result(&small), small);

        let scalar = json!(42);
        assert_eq!(truncate_tool_result(&scalar), scalar);
    }

    #[test]
    fn truncate_summarizes_wide_objects() {
        let mut map = serde_json::Map::new();
        for i in 0..20 {
            map.insert(format!("field{}", i), json!(i));
        }
        map.insert("name".to_string(), json!("keep me"));
        let truncated = truncate_tool_result(&Value::Object(map));
        assert_eq!(truncated["name"], "keep me");
        assert_eq!(truncated["omitted_fields"], 20);
    }

    #[test]
    fn truncate_caps_long_strings() {
        let long = json!("y".repeat(10_000));
        let truncated = truncate_tool_result(&long);
        let s = truncated.as_str().expect("string");
        assert!(s.len() < 5000);
        assert!(s.contains("[truncated"));
    }

    #[test]
    fn window_trim_keeps_system_and_tail() {
        let mut messages = vec![ChatMessage::system("sys")];
        for i in 0..50 {
            messages.push(ChatMessage::user(format!("m{}", i)));
        }
        trim_window(&mut messages, 10);
        assert_eq!(messages.len(), 11);
        assert_eq!(messages[0].content, "sys");
        assert_eq!(messages[1].content, "m40");
        assert_eq!(messages.last().expect("tail").content, "m49");
    }
}
