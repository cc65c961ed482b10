use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};

use super::JobKey;
use super::config::SubroutineConfig;
use crate::core::error::{EngineError, EngineResult};
use crate::core::llm::{GenerationBackend, GenerationOptions, ToolCall, ToolChoice};
use crate::core::prompt::{PersonaSource, PromptAssembler, PromptRequest, Summarizer};
use crate::core::transcript::{ChatRecord, ChatTurn, TranscriptStore, TurnRole};
use crate::skills::{FINISH_TOOL, ToolExecutor, ToolResult, finish_reason, finish_tool_spec};

/// Hard bound on chained continuations within one cycle.
pub const MAX_CHAIN_DEPTH: u32 = 20;

pub const DEFAULT_TRIGGER_TEXT: &str =
    "[Scheduled check-in] Continue with your ongoing task. Call `finish` when there is nothing left to do.";
pub const DEFAULT_AUTO_QUEUE_PROMPT: &str = "Continue.";
pub const DEFAULT_FINISH_REASON: &str = "Task complete.";

const SYSTEM_SPEAKER: &str = "System";
const TOOL_SPEAKER: &str = "Tool Results";

/// How a chain ended.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CycleEnd {
    /// The model (or a tool) asked to stop.
    Finished { reason: String },
    /// No tool call and nothing queued.
    Idle,
    /// Stopped by the depth guard.
    DepthExceeded,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CycleOutcome {
    pub finished: bool,
    pub end: CycleEnd,
    /// Depth reached when the chain stopped (0 for a single generation).
    pub depth: u32,
    pub turns_appended: usize,
}

/// Collaborators one executor drives.
pub struct ExecutorParts {
    pub assembler: Arc<dyn PromptAssembler>,
    pub persona: Arc<dyn PersonaSource>,
    pub summarizer: Arc<dyn Summarizer>,
    pub backend: Arc<dyn GenerationBackend>,
    pub tools: Arc<dyn ToolExecutor>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Runs generation chains against conversation records.
///
/// At most one chain runs per [`JobKey`] at a time; a second caller gets
/// [`EngineError::Conflict`] instead of waiting.
pub struct CycleExecutor {
    store: TranscriptStore,
    parts: ExecutorParts,
    in_flight: Mutex<HashMap<JobKey, Arc<Mutex<()>>>>,
}

/// State carried through one chain.
struct Chain<'a> {
    key: &'a JobKey,
    path: &'a Path,
    agent_name: &'a str,
    config: &'a SubroutineConfig,
    record: ChatRecord,
    start_len: usize,
    depth: u32,
}

impl Chain<'_> {
    fn appended(&self) -> usize {
        self.record.turns.len() - self.start_len
    }

    fn outcome(&self, end: CycleEnd) -> CycleOutcome {
        CycleOutcome {
            finished: !matches!(end, CycleEnd::Idle),
            end,
            depth: self.depth,
            turns_appended: self.appended(),
        }
    }

    /// Speaker name for an injected turn.
    fn speaker(&self, role: TurnRole) -> String {
        match role {
            TurnRole::User => self.record.header.user_name.clone(),
            TurnRole::System => SYSTEM_SPEAKER.to_string(),
            TurnRole::Agent => self.agent_name.to_string(),
        }
    }

    fn inject(&mut self, text: &str) {
        let role = TurnRole::from(self.config.trigger_role);
        let turn = ChatTurn::new(self.speaker(role), role, text);
        self.record.push(turn);
    }
}

impl CycleExecutor {
    pub fn new(store: TranscriptStore, parts: ExecutorParts) -> Self {
        Self {
            store,
            parts,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    async fn slot(&self, key: &JobKey) -> Arc<Mutex<()>> {
        let mut map = self.in_flight.lock().await;
        map.entry(key.clone()).or_default().clone()
    }

    /// True while a chain (or an editor holding [`Self::hold`]) owns the key.
    pub async fn is_running(&self, key: &JobKey) -> bool {
        let map = self.in_flight.lock().await;
        map.get(key).is_some_and(|slot| slot.try_lock().is_err())
    }

    /// Drops the key's guard slot when nobody holds or waits on it. Called once
    /// the conversation is gone.
    pub async fn forget(&self, key: &JobKey) {
        let mut map = self.in_flight.lock().await;
        if map.get(key).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            map.remove(key);
        }
    }

    #[cfg(test)]
    pub(crate) async fn tracked_keys(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Waits for any in-flight chain on `key` and blocks new ones until the
    /// guard is dropped. Used for edits to the record made outside a cycle.
    pub async fn hold(&self, key: &JobKey) -> OwnedMutexGuard<()> {
        self.slot(key).await.lock_owned().await
    }

    /// Runs one cycle, chaining continuations until the model finishes, goes
    /// idle, or the depth guard trips.
    pub async fn run_cycle(
        &self,
        key: &JobKey,
        path: &Path,
        agent_name: &str,
        config: &SubroutineConfig,
    ) -> EngineResult<CycleOutcome> {
        let _guard = self.slot(key).await.try_lock_owned().map_err(|_| {
            EngineError::conflict(format!("a cycle for {} is already running", key))
        })?;

        let record = self.store.load(path).await?;
        let start_len = record.turns.len();
        let mut chain = Chain {
            key,
            path,
            agent_name,
            config,
            record,
            start_len,
            depth: 0,
        };

        info!("Subroutine [{}] cycle started", key);
        let outcome = self.drive(&mut chain).await?;
        info!(
            "Subroutine [{}] cycle ended: {:?} at depth {} ({} new turns)",
            key, outcome.end, outcome.depth, outcome.turns_appended
        );
        Ok(outcome)
    }

    async fn drive(&self, chain: &mut Chain<'_>) -> EngineResult<CycleOutcome> {
        let trigger = chain
            .config
            .effective_trigger_text()
            .unwrap_or(DEFAULT_TRIGGER_TEXT)
            .to_string();
        chain.inject(&trigger);

        let system_prompt = self
            .parts
            .persona
            .system_prompt(chain.agent_name)
            .await
            .map_err(EngineError::backend)?;

        let mut tools = vec![finish_tool_spec()];
        tools.extend(self.parts.tools.tools_for(chain.agent_name).await);
        let options = GenerationOptions {
            temperature: self.parts.temperature,
            max_tokens: self.parts.max_tokens,
            tools,
            tool_choice: ToolChoice::Auto,
        };

        loop {
            let messages = {
                let turns = self.prompt_turns(chain).await;
                self.parts
                    .assembler
                    .assemble(PromptRequest {
                        agent_name: chain.agent_name,
                        turns: &turns,
                        system_prompt: &system_prompt,
                        use_lorebooks: chain.config.use_lorebooks,
                        use_example_messages: chain.config.use_example_messages,
                    })
                    .await
                    .map_err(EngineError::backend)?
            };

            let generation = self
                .parts
                .backend
                .generate(&messages, &options)
                .await
                .map_err(EngineError::backend)?;

            let has_text = !generation.text.trim().is_empty();
            let body = if has_text {
                generation.text.clone()
            } else {
                placeholder_text(&generation.tool_calls)
            };
            chain.record.push(ChatTurn::new(
                chain.agent_name,
                TurnRole::Agent,
                body,
            ));

            if let Some(call) = generation.tool_calls.iter().find(|c| c.name == FINISH_TOOL) {
                let reason =
                    finish_reason(call).unwrap_or_else(|| DEFAULT_FINISH_REASON.to_string());
                return self.finish(chain, reason).await;
            }

            if !generation.tool_calls.is_empty() {
                if chain.depth >= MAX_CHAIN_DEPTH {
                    return self.depth_exceeded(chain).await;
                }
                let outcome = self
                    .parts
                    .tools
                    .execute(chain.agent_name, &generation.tool_calls)
                    .await
                    .map_err(EngineError::backend)?;
                if outcome.finished {
                    let reason = outcome
                        .reason
                        .unwrap_or_else(|| DEFAULT_FINISH_REASON.to_string());
                    return self.finish(chain, reason).await;
                }
                chain.record.push(ChatTurn::new(
                    TOOL_SPEAKER,
                    TurnRole::User,
                    format_tool_results(&generation.tool_calls, &outcome.results),
                ));
                self.checkpoint(chain).await?;
                continue;
            }

            if chain.config.auto_queue && has_text {
                if chain.depth >= MAX_CHAIN_DEPTH {
                    return self.depth_exceeded(chain).await;
                }
                let prompt = if chain.config.auto_queue_prompt.trim().is_empty() {
                    DEFAULT_AUTO_QUEUE_PROMPT.to_string()
                } else {
                    chain.config.auto_queue_prompt.clone()
                };
                chain.inject(&prompt);
                self.checkpoint(chain).await?;
                continue;
            }

            self.persist(chain).await?;
            return Ok(chain.outcome(CycleEnd::Idle));
        }
    }

    /// Turns handed to the assembler, summarised when the subroutine asks for it.
    async fn prompt_turns(&self, chain: &Chain<'_>) -> Vec<ChatTurn> {
        if !chain.config.use_summary {
            return chain.record.turns.clone();
        }
        match self
            .parts
            .summarizer
            .summarize(chain.agent_name, &chain.record.turns)
            .await
        {
            Ok(turns) => turns,
            Err(e) => {
                warn!(
                    "Subroutine [{}] summary failed, using full transcript: {}",
                    chain.key, e
                );
                chain.record.turns.clone()
            }
        }
    }

    async fn persist(&self, chain: &Chain<'_>) -> EngineResult<()> {
        self.store.save(chain.path, &chain.record).await
    }

    /// Saves the prefix so far, then moves to the next depth.
    async fn checkpoint(&self, chain: &mut Chain<'_>) -> EngineResult<()> {
        self.persist(chain).await?;
        chain.depth += 1;
        Ok(())
    }

    async fn finish(&self, chain: &mut Chain<'_>, reason: String) -> EngineResult<CycleOutcome> {
        chain.record.push(ChatTurn::new(
            SYSTEM_SPEAKER,
            TurnRole::System,
            format!("[Subroutine finished] {}", reason),
        ));
        self.persist(chain).await?;
        Ok(chain.outcome(CycleEnd::Finished { reason }))
    }

    async fn depth_exceeded(&self, chain: &mut Chain<'_>) -> EngineResult<CycleOutcome> {
        error!(
            "Subroutine [{}] hit the chain depth limit ({}), stopping",
            chain.key, MAX_CHAIN_DEPTH
        );
        self.persist(chain).await?;
        Ok(chain.outcome(CycleEnd::DepthExceeded))
    }
}

fn placeholder_text(calls: &[ToolCall]) -> String {
    if calls.is_empty() {
        "[empty response]".to_string()
    } else {
        let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
        format!("[tool call: {}]", names.join(", "))
    }
}

fn format_tool_results(calls: &[ToolCall], results: &[ToolResult]) -> String {
    if results.is_empty() {
        let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
        return format!("[Tool results]\n(no output from {})", names.join(", "));
    }
    let mut out = String::from("[Tool results]");
    for r in results {
        let status = if r.success { "ok" } else { "error" };
        out.push_str(&format!("\n- {} ({}): {}", r.name, status, r.output.trim()));
    }
    out
}
