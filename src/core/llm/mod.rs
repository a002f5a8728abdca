pub mod retry;

pub use retry::{CallResult, RetryPolicy, call_simple_retry, call_with_tools_retry};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::agent::AgentRole;
use crate::core::chain::{Message, ToolCall};

/// A tool as advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: serde_json::Value,
}

/// Provider-specific metadata attached to a choice (token counts, stop reason...).
pub type GenerationInfo = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Default)]
pub struct ContentChoice {
    pub content: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub generation_info: Option<GenerationInfo>,
}

#[derive(Debug, Clone, Default)]
pub struct ContentResponse {
    pub choices: Vec<ContentChoice>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
    }
}

fn info_u64(info: &GenerationInfo, keys: &[&str]) -> u64 {
    keys.iter()
        .find_map(|k| info.get(*k).and_then(serde_json::Value::as_u64))
        .unwrap_or(0)
}

/// The model client. Adapters for concrete APIs live in the host.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider label recorded on every chain row.
    fn name(&self) -> &str;

    /// Model used for a given agent role.
    fn model(&self, role: AgentRole) -> String;

    /// Plain prompt in, text out. Used by the reflector, adviser, fixer and summarizer.
    /// These calls carry no generation info, so their tokens are not added to
    /// any chain's usage; only [`LlmProvider::call_with_tools`] turns are counted.
    async fn call(&self, role: AgentRole, prompt: &str) -> Result<String>;

    async fn call_with_tools(
        &self,
        role: AgentRole,
        chain: &[Message],
        tools: &[ToolDefinition],
        stream: Option<&StreamWriter>,
    ) -> Result<ContentResponse>;

    fn usage(&self, info: &GenerationInfo) -> TokenUsage {
        TokenUsage {
            input_tokens: info_u64(info, &["input_tokens", "prompt_tokens", "PromptTokens"]),
            output_tokens: info_u64(
                info,
                &["output_tokens", "completion_tokens", "CompletionTokens"],
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Thinking,
    Content,
    /// Final chunk of a turn: consumers replace the accumulated text with this one.
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub stream_id: u64,
    pub kind: StreamKind,
    pub content: String,
}

/// Best-effort sink for incremental model output. Never blocks the caller.
#[derive(Clone)]
pub struct StreamSink {
    tx: mpsc::Sender<StreamChunk>,
    next_id: Arc<AtomicU64>,
}

impl StreamSink {
    pub fn new(tx: mpsc::Sender<StreamChunk>) -> Self {
        Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StreamChunk>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Starts a new stream with a fresh id.
    pub fn open(&self) -> StreamWriter {
        StreamWriter {
            sink: self.clone(),
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn send(&self, chunk: StreamChunk) {
        if let Err(e) = self.tx.try_send(chunk) {
            debug!("dropping stream chunk: {}", e);
        }
    }
}

/// One model turn's stream.
#[derive(Clone)]
pub struct StreamWriter {
    sink: StreamSink,
    id: u64,
}

impl StreamWriter {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn thinking(&self, text: &str) {
        self.emit(StreamKind::Thinking, text);
    }

    pub fn content(&self, text: &str) {
        self.emit(StreamKind::Content, text);
    }

    pub fn update(&self, text: &str) {
        self.emit(StreamKind::Update, text);
    }

    fn emit(&self, kind: StreamKind, text: &str) {
        self.sink.send(StreamChunk {
            stream_id: self.id,
            kind,
            content: text.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_reads_common_key_spellings() {
        let mut info = GenerationInfo::new();
        info.insert("prompt_tokens".into(), 120.into());
        info.insert("CompletionTokens".into(), 44.into());
        let usage = info_u64(&info, &["input_tokens", "prompt_tokens"]);
        assert_eq!(usage, 120);
        assert_eq!(info_u64(&info, &["output_tokens", "CompletionTokens"]), 44);
        assert_eq!(info_u64(&info, &["missing"]), 0);
    }

    #[test]
    fn token_usage_accumulates() {
        let mut total = TokenUsage::default();
        assert!(total.is_empty());
        total += TokenUsage {
            input_tokens: 10,
            output_tokens: 3,
        };
        total += TokenUsage {
            input_tokens: 5,
            output_tokens: 2,
        };
        assert_eq!(total.input_tokens, 15);
        assert_eq!(total.output_tokens, 5);
        assert_eq!(total.total(), 20);
    }

    #[test]
    fn stream_ids_increase_per_open() {
        let (sink, mut rx) = StreamSink::channel(8);
        let first = sink.open();
        let second = sink.open();
        assert!(second.id() > first.id());

        first.thinking("plan");
        second.update("final");
        let a = rx.try_recv().unwrap();
        let b = rx.try_recv().unwrap();
        assert_eq!(a.kind, StreamKind::Thinking);
        assert_eq!(a.stream_id, first.id());
        assert_eq!(b.kind, StreamKind::Update);
        assert_eq!(b.content, "final");
    }

    #[test]
    fn full_or_closed_stream_never_blocks() {
        let (sink, rx) = StreamSink::channel(1);
        let writer = sink.open();
        writer.content("one");
        writer.content("two");
        drop(rx);
        writer.content("three");
    }
}
