//! LLM client interface.

mod openrouter;

pub use openrouter::OpenRouterClient;

use async_trait::async_trait;

use crate::error::ExecutionError;

/// Message roles in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// A single turn in the rolling conversation window.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
        }
    }
}

/// Chat completion client.
///
/// The driver speaks a text protocol: the assistant reply either contains an
/// embedded decision object or is the final answer, so the client only needs
/// to return the reply text.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(&self, model: &str, messages: &[ChatMessage]) -> Result<String, ExecutionError>;
}
