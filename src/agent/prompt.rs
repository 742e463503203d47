//! System prompt templates for the conversation driver.

use crate::tools::ToolInfo;

/// Build the system prompt: the agent's own prompt plus the tool protocol.
pub fn build_system_prompt(agent_prompt: &str, tools: &[ToolInfo]) -> String {
    let tool_descriptions = tools
        .iter()
        .map(|t| format!("- **{}**: {}", t.name, t.description))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"{agent_prompt}

## Available Tools

{tool_descriptions}

## Tool Protocol

To call a tool, reply with a single JSON object and nothing else:

{{"kind": "tool", "target": "<tool name>", "args": {{ ... }}}}

To change your own recurring schedule, reply with:

{{"kind": "schedule", "enabled": true, "cadence": {{"interval": {{"minutes": 30}}}}}}

Any other reply is treated as your final answer for this run.

## Rules

1. Use tools to act - don't describe actions you did not perform.
2. One tool call per reply. The system executes it and returns the result.
3. When the task is complete, reply with a short summary of what you did."#,
        agent_prompt = agent_prompt,
        tool_descriptions = tool_descriptions
    )
}

/// One-shot corrective prompt used when a required side effect was skipped.
pub fn forced_tool_prompt(tool_name: &str) -> String {
    format!(
        "Your task requires calling the '{tool_name}' tool, but you have not \
         called it. Reply with exactly one JSON tool call for '{tool_name}' \
         now - no prose.",
        tool_name = tool_name
    )
}
