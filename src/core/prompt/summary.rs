use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::core::llm::{ChatMessage, GenerationBackend, GenerationOptions, ToolChoice};
use crate::core::transcript::{ChatTurn, TurnRole};

const SUMMARY_INSTRUCTION: &str = "Summarize the conversation below for your own future reference. \
     Keep facts, decisions, open tasks and tool results. Reply with the summary only.";

/// Shrinks a turn sequence before prompt assembly.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, agent_name: &str, turns: &[ChatTurn]) -> Result<Vec<ChatTurn>>;
}

/// Replaces everything but the last `keep_recent` turns with one system turn
/// written by the generation backend.
pub struct LlmSummarizer {
    backend: Arc<dyn GenerationBackend>,
    keep_recent: usize,
    max_tokens: u32,
}

impl LlmSummarizer {
    pub fn new(backend: Arc<dyn GenerationBackend>, keep_recent: usize, max_tokens: u32) -> Self {
        Self {
            backend,
            keep_recent: keep_recent.max(1),
            max_tokens,
        }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, agent_name: &str, turns: &[ChatTurn]) -> Result<Vec<ChatTurn>> {
        if turns.len() <= self.keep_recent {
            return Ok(turns.to_vec());
        }
        let split = turns.len() - self.keep_recent;
        let (older, recent) = turns.split_at(split);

        let transcript: String = older
            .iter()
            .map(|t| format!("{}: {}\n", t.name, t.mes))
            .collect();
        let messages = vec![
            ChatMessage::new("system", SUMMARY_INSTRUCTION),
            ChatMessage::new("user", transcript),
        ];
        let options = GenerationOptions {
            temperature: 0.2,
            max_tokens: self.max_tokens,
            tools: Vec::new(),
            tool_choice: ToolChoice::None,
        };
        let out = self.backend.generate(&messages, &options).await?;
        let summary = out.text.trim();
        if summary.is_empty() {
            return Err(anyhow!("summary backend returned empty text"));
        }
        info!(
            "Summarized {} older turns for agent [{}] ({} chars)",
            older.len(),
            agent_name,
            summary.len()
        );

        let mut reduced = Vec::with_capacity(recent.len() + 1);
        reduced.push(ChatTurn::new(
            "System",
            TurnRole::System,
            format!("[Summary of earlier conversation]\n{}", summary),
        ));
        reduced.extend_from_slice(recent);
        Ok(reduced)
    }
}
