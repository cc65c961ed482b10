use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::core::llm::{ChatMessage, Generation, GenerationBackend, GenerationOptions, ToolCall, ToolSpec};
use crate::core::prompt::{PersonaSource, PromptAssembler, PromptRequest, Summarizer};
use crate::core::subroutine::config::{TriggerRole, TriggerType};
use crate::core::subroutine::{CycleExecutor, ExecutorParts, JobKey, SubroutineConfig};
use crate::core::transcript::{ChatRecord, ChatTurn, TranscriptStore, TurnRole};
use crate::skills::{FINISH_TOOL, ToolExecutor, ToolOutcome, ToolResult};

pub const AGENT: &str = "ada";
pub const CHAT: &str = "inbox-watch";

pub fn config(trigger_type: TriggerType) -> SubroutineConfig {
    let now = Utc::now().to_rfc3339();
    SubroutineConfig {
        id: "sub-test".to_string(),
        trigger_type,
        active: false,
        trigger_text: "ping".to_string(),
        fallback_trigger_text: String::new(),
        trigger_role: TriggerRole::User,
        interval: (trigger_type == TriggerType::Time).then_some(5),
        tool_name: (trigger_type == TriggerType::Tool).then(|| "inbox".to_string()),
        tool_condition: None,
        auto_queue: false,
        auto_queue_prompt: String::new(),
        use_summary: false,
        use_lorebooks: false,
        use_example_messages: false,
        color: None,
        created_at: now.clone(),
        updated_at: now,
        extra: serde_json::Map::new(),
    }
}

pub fn text(t: &str) -> Generation {
    Generation {
        text: t.to_string(),
        tool_calls: Vec::new(),
    }
}

pub fn with_calls(t: &str, names: &[&str]) -> Generation {
    Generation {
        text: t.to_string(),
        tool_calls: names
            .iter()
            .map(|n| ToolCall::new(n, serde_json::json!({})))
            .collect(),
    }
}

pub fn finish(t: &str, reason: &str) -> Generation {
    Generation {
        text: t.to_string(),
        tool_calls: vec![ToolCall::new(
            FINISH_TOOL,
            serde_json::json!({ "reason": reason }),
        )],
    }
}

/// Plays back queued generations, then repeats `fallback` forever.
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Generation>>,
    fallback: Generation,
    pub calls: AtomicUsize,
    pub seen_tools: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl ScriptedBackend {
    pub fn new(script: Vec<Generation>, fallback: Generation) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicUsize::new(0),
            seen_tools: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn repeating(fallback: Generation) -> Self {
        Self::new(Vec::new(), fallback)
    }

    pub fn slow(fallback: Generation, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::repeating(fallback)
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn generate(
        &self,
        _messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<Generation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.seen_tools.lock().unwrap() = options.tools.iter().map(|t| t.name.clone()).collect();
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }
}

pub struct FailingBackend;

#[async_trait]
impl GenerationBackend for FailingBackend {
    async fn generate(
        &self,
        _messages: &[ChatMessage],
        _options: &GenerationOptions,
    ) -> Result<Generation> {
        Err(anyhow!("model unavailable"))
    }
}

/// Records every batch of calls; optionally reports `finished`.
#[derive(Default)]
pub struct RecordingTools {
    pub batches: Mutex<Vec<Vec<String>>>,
    pub finish_with: Option<String>,
}

impl RecordingTools {
    pub fn batch_count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }
}

#[async_trait]
impl ToolExecutor for RecordingTools {
    async fn tools_for(&self, _agent_name: &str) -> Vec<ToolSpec> {
        vec![ToolSpec {
            name: "inbox".to_string(),
            description: "Reads the inbox".to_string(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
        }]
    }

    async fn execute(&self, _agent_name: &str, calls: &[ToolCall]) -> Result<ToolOutcome> {
        self.batches
            .lock()
            .unwrap()
            .push(calls.iter().map(|c| c.name.clone()).collect());
        if let Some(reason) = &self.finish_with {
            return Ok(ToolOutcome {
                finished: true,
                reason: Some(reason.clone()),
                results: Vec::new(),
            });
        }
        Ok(ToolOutcome {
            finished: false,
            reason: None,
            results: calls
                .iter()
                .map(|c| ToolResult {
                    name: c.name.clone(),
                    success: true,
                    output: "3 unread".to_string(),
                })
                .collect(),
        })
    }
}

/// Passes turns straight through and remembers how many it saw.
#[derive(Default)]
pub struct CountingAssembler {
    pub last_turns: AtomicUsize,
}

#[async_trait]
impl PromptAssembler for CountingAssembler {
    async fn assemble(&self, request: PromptRequest<'_>) -> Result<Vec<ChatMessage>> {
        self.last_turns.store(request.turns.len(), Ordering::SeqCst);
        let mut out = vec![ChatMessage::new("system", request.system_prompt)];
        out.extend(
            request
                .turns
                .iter()
                .map(|t| ChatMessage::new("user", t.mes.clone())),
        );
        Ok(out)
    }
}

pub struct StaticPersona;

#[async_trait]
impl PersonaSource for StaticPersona {
    async fn system_prompt(&self, agent_name: &str) -> Result<String> {
        Ok(format!("You are {}.", agent_name))
    }
}

/// Keeps only the last turn.
pub struct LastTurnSummarizer;

#[async_trait]
impl Summarizer for LastTurnSummarizer {
    async fn summarize(&self, _agent_name: &str, turns: &[ChatTurn]) -> Result<Vec<ChatTurn>> {
        Ok(turns.last().cloned().into_iter().collect())
    }
}

pub struct FailingSummarizer;

#[async_trait]
impl Summarizer for FailingSummarizer {
    async fn summarize(&self, _agent_name: &str, _turns: &[ChatTurn]) -> Result<Vec<ChatTurn>> {
        Err(anyhow!("summary model down"))
    }
}

/// Executor over `store` with canned collaborators around `backend`.
pub fn executor_for(
    store: TranscriptStore,
    backend: Arc<dyn GenerationBackend>,
) -> Arc<CycleExecutor> {
    Arc::new(CycleExecutor::new(
        store,
        ExecutorParts {
            assembler: Arc::new(CountingAssembler::default()),
            persona: Arc::new(StaticPersona),
            summarizer: Arc::new(LastTurnSummarizer),
            backend,
            tools: Arc::new(RecordingTools::default()),
            temperature: 0.7,
            max_tokens: 256,
        },
    ))
}

pub struct Harness {
    pub _dir: tempfile::TempDir,
    pub store: TranscriptStore,
    pub executor: Arc<CycleExecutor>,
    pub assembler: Arc<CountingAssembler>,
    pub key: JobKey,
    pub path: PathBuf,
}

pub struct HarnessBuilder {
    backend: Arc<dyn GenerationBackend>,
    tools: Arc<dyn ToolExecutor>,
    summarizer: Arc<dyn Summarizer>,
    config: SubroutineConfig,
    history: Vec<ChatTurn>,
}

impl HarnessBuilder {
    pub fn new(backend: Arc<dyn GenerationBackend>) -> Self {
        Self {
            backend,
            tools: Arc::new(RecordingTools::default()),
            summarizer: Arc::new(LastTurnSummarizer),
            config: config(TriggerType::Time),
            history: Vec::new(),
        }
    }

    pub fn tools(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.tools = tools;
        self
    }

    pub fn summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn config(mut self, config: SubroutineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn history(mut self, turns: Vec<ChatTurn>) -> Self {
        self.history = turns;
        self
    }

    pub async fn build(self) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = TranscriptStore::new(dir.path().join("chats"));
        let path = store.chat_path(AGENT, CHAT).unwrap();
        let mut record = ChatRecord::new_agent_chat("User", AGENT, self.config);
        for turn in self.history {
            record.push(turn);
        }
        store.save(&path, &record).await.unwrap();

        let assembler = Arc::new(CountingAssembler::default());
        let executor = Arc::new(CycleExecutor::new(
            store.clone(),
            ExecutorParts {
                assembler: assembler.clone(),
                persona: Arc::new(StaticPersona),
                summarizer: self.summarizer,
                backend: self.backend,
                tools: self.tools,
                temperature: 0.7,
                max_tokens: 256,
            },
        ));

        Harness {
            _dir: dir,
            store,
            executor,
            assembler,
            key: JobKey::new(AGENT, CHAT),
            path,
        }
    }
}

impl Harness {
    pub async fn record(&self) -> ChatRecord {
        self.store.load(&self.path).await.unwrap()
    }

    pub async fn subroutine(&self) -> SubroutineConfig {
        self.record().await.subroutine().cloned().unwrap()
    }
}

pub fn turn(role: TurnRole, text: &str) -> ChatTurn {
    ChatTurn::new("someone", role, text)
}
