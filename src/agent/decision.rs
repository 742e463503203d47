//! Parsing of model replies into decisions.
//!
//! The primary path is a strict parse of the whole reply as a tagged
//! decision object. Models wrap JSON in prose and markdown fences often
//! enough that a heuristic fallback is kept: extract the first balanced
//! `{...}` block, repair trailing commas, and retry. A reply that yields no
//! decision either way is the final answer.

use serde::Deserialize;
use serde_json::Value;

use crate::types::{Cadence, ScheduleDirective};

/// What the model decided to do this turn.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Final textual reply; ends the run.
    Reply(String),
    /// Invoke a tool and continue the conversation.
    ToolCall { target: String, args: Value },
    /// Request a schedule change; acknowledged and applied after the run.
    Schedule(ScheduleDirective),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WireDecision {
    Tool {
        target: String,
        #[serde(default)]
        args: Value,
    },
    Schedule {
        enabled: bool,
        #[serde(default)]
        cadence: Option<Cadence>,
    },
}

impl From<WireDecision> for Decision {
    fn from(wire: WireDecision) -> Self {
        match wire {
            WireDecision::Tool { target, args } => Decision::ToolCall { target, args },
            WireDecision::Schedule { enabled, cadence } => {
                Decision::Schedule(ScheduleDirective { enabled, cadence })
            }
        }
    }
}

/// Parse a model reply into a decision. Total: any unparseable reply is a
/// [`Decision::Reply`].
pub fn parse_decision(reply: &str) -> Decision {
    let candidate = strip_fences(reply.trim());

    // Strict primary parse.
    if let Ok(wire) = serde_json::from_str::<WireDecision>(candidate) {
        return wire.into();
    }

    // Heuristic fallback: first balanced object, trailing-comma repair.
    if let Some(block) = extract_balanced_object(candidate) {
        let repaired = repair_trailing_commas(&block);
        if let Ok(wire) = serde_json::from_str::<WireDecision>(&repaired) {
            return wire.into();
        }
    }

    Decision::Reply(reply.trim().to_string())
}

/// Strip a single surrounding markdown code fence, if present.
fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(inner) = rest.strip_suffix("```") else {
        return trimmed;
    };
    // Drop an optional language tag on the opening fence line.
    match inner.split_once('\n') {
        Some((first, body)) if !first.trim().is_empty() && !first.trim_start().starts_with('{') => {
            body.trim()
        }
        _ => inner.trim(),
    }
}

/// Extract the first balanced `{...}` block, respecting string literals.
fn extract_balanced_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + c.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Remove commas that directly precede a closing brace or bracket.
fn repair_trailing_commas(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    let mut in_string = false;
    let mut escaped = false;

    for c in json.chars() {
        if in_string {
            out.push(c);
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '}' | ']' => {
                while out.ends_with(char::is_whitespace) {
                    out.pop();
                }
                if out.ends_with(',') {
                    out.pop();
                }
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}
