mod summary;

use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::info;

use crate::core::llm::ChatMessage;
use crate::core::transcript::{ChatTurn, TurnRole};
pub use summary::{LlmSummarizer, Summarizer};

/// Used when an agent has no `persona.md`.
pub const FALLBACK_SYSTEM_PROMPT: &str = "You are an autonomous agent working through a recurring task. \
     Use the available tools when they help. When the task is complete, call the `finish` tool \
     with a short reason instead of continuing.";

pub struct PromptRequest<'a> {
    pub agent_name: &'a str,
    pub turns: &'a [ChatTurn],
    pub system_prompt: &'a str,
    pub use_lorebooks: bool,
    pub use_example_messages: bool,
}

#[async_trait]
pub trait PromptAssembler: Send + Sync {
    async fn assemble(&self, request: PromptRequest<'_>) -> Result<Vec<ChatMessage>>;
}

#[async_trait]
pub trait PersonaSource: Send + Sync {
    async fn system_prompt(&self, agent_name: &str) -> Result<String>;
}

fn role_for(turn: &ChatTurn) -> &'static str {
    match turn.role() {
        TurnRole::User => "user",
        TurnRole::System => "system",
        TurnRole::Agent => "assistant",
    }
}

async fn read_optional(path: PathBuf) -> Option<String> {
    match tokio::fs::read_to_string(&path).await {
        Ok(text) if !text.trim().is_empty() => Some(text),
        _ => None,
    }
}

/// Reads persona, lorebook and example dialogue from `<agents_dir>/<agent>/`.
pub struct TranscriptPromptAssembler {
    agents_dir: PathBuf,
}

impl TranscriptPromptAssembler {
    pub fn new(agents_dir: PathBuf) -> Self {
        Self { agents_dir }
    }
}

#[async_trait]
impl PromptAssembler for TranscriptPromptAssembler {
    async fn assemble(&self, request: PromptRequest<'_>) -> Result<Vec<ChatMessage>> {
        let agent_dir = self.agents_dir.join(request.agent_name);
        let mut messages = vec![ChatMessage::new("system", request.system_prompt)];

        if request.use_lorebooks
            && let Some(lore) = read_optional(agent_dir.join("lorebook.md")).await
        {
            messages.push(ChatMessage::new(
                "system",
                format!("--- WORLD INFO ---\n{}\n---", lore.trim()),
            ));
        }

        if request.use_example_messages
            && let Some(examples) = read_optional(agent_dir.join("examples.md")).await
        {
            messages.push(ChatMessage::new(
                "system",
                format!("--- EXAMPLE DIALOGUE ---\n{}\n---", examples.trim()),
            ));
        }

        for turn in request.turns {
            messages.push(ChatMessage::new(role_for(turn), turn.mes.clone()));
        }

        Ok(messages)
    }
}

pub struct FilePersonaSource {
    agents_dir: PathBuf,
}

impl FilePersonaSource {
    pub fn new(agents_dir: PathBuf) -> Self {
        Self { agents_dir }
    }
}

#[async_trait]
impl PersonaSource for FilePersonaSource {
    async fn system_prompt(&self, agent_name: &str) -> Result<String> {
        let path = self.agents_dir.join(agent_name).join("persona.md");
        match read_optional(path).await {
            Some(persona) => Ok(format!(
                "{}\n\n--- AGENT PERSONA ---\n{}\n--- END PERSONA ---",
                FALLBACK_SYSTEM_PROMPT,
                persona.trim()
            )),
            None => {
                info!("No persona.md for agent [{}], using generic prompt", agent_name);
                Ok(FALLBACK_SYSTEM_PROMPT.to_string())
            }
        }
    }
}
