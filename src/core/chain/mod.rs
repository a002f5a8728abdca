//! Conversation state exchanged with the model.
//!
//! A chain is an ordered list of [`Message`]s. Tool calls live inside AI
//! messages and every call must be answered by a Tool message carrying a
//! response with the same id before the chain goes back to the model (see
//! [`consistency`]).

pub mod consistency;

pub use consistency::{
    FALLBACK_TOOL_RESPONSE, add_tool_call_response_or_human, ensure_chain_consistency,
    find_unresponded_tool_calls,
};

use serde::{Deserialize, Serialize};

use crate::core::error::ChainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    Human,
    Ai,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::Human => "human",
            Role::Ai => "ai",
            Role::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments as produced by the model.
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallResponse {
    pub tool_call_id: String,
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text { text: String },
    ToolCall(ToolCall),
    ToolCallResponse(ToolCallResponse),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<Part>,
    /// Thinking content attached to an AI turn. Persisted for audit only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl Message {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![Part::Text { text: text.into() }],
            reasoning: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::text(Role::System, text)
    }

    pub fn human(text: impl Into<String>) -> Self {
        Self::text(Role::Human, text)
    }

    pub fn ai(text: impl Into<String>) -> Self {
        Self::text(Role::Ai, text)
    }

    /// One AI turn: optional text followed by every tool call, in order.
    pub fn ai_tool_calls(content: &str, calls: &[ToolCall], reasoning: Option<String>) -> Self {
        let mut parts = Vec::with_capacity(calls.len() + 1);
        if !content.is_empty() {
            parts.push(Part::Text {
                text: content.to_string(),
            });
        }
        parts.extend(calls.iter().cloned().map(Part::ToolCall));
        Self {
            role: Role::Ai,
            parts,
            reasoning: reasoning.filter(|r| !r.is_empty()),
        }
    }

    pub fn tool_response(response: ToolCallResponse) -> Self {
        Self {
            role: Role::Tool,
            parts: vec![Part::ToolCallResponse(response)],
            reasoning: None,
        }
    }

    /// Concatenated text parts.
    pub fn content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.parts.iter().filter_map(|p| match p {
            Part::ToolCall(call) => Some(call),
            _ => None,
        })
    }

    pub fn tool_responses(&self) -> impl Iterator<Item = &ToolCallResponse> {
        self.parts.iter().filter_map(|p| match p {
            Part::ToolCallResponse(resp) => Some(resp),
            _ => None,
        })
    }
}

pub fn serialize_chain(chain: &[Message]) -> Result<String, ChainError> {
    Ok(serde_json::to_string(chain)?)
}

pub fn deserialize_chain(raw: &str) -> Result<Vec<Message>, ChainError> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(raw)?)
}
