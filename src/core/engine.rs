use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::core::config::EngineConfig;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::llm::GenerationBackend;
use crate::core::llm::openai::OpenAiCompatBackend;
use crate::core::prompt::{FilePersonaSource, LlmSummarizer, TranscriptPromptAssembler};
use crate::core::subroutine::{CycleExecutor, ExecutorParts, JobKey, TriggerRegistry};
use crate::core::transcript::{TranscriptStore, is_agent_chat};
use crate::skills::SkillToolExecutor;
use crate::skills::native_executor::NativeExecutor;

/// Everything a running engine owns, wired once at boot.
pub struct Engine {
    pub config: EngineConfig,
    pub data_dir: PathBuf,
    pub store: TranscriptStore,
    pub executor: Arc<CycleExecutor>,
    pub registry: Arc<TriggerRegistry>,
}

impl Engine {
    pub async fn boot(data_dir: &Path, config: EngineConfig) -> Result<Self> {
        let chats_dir = data_dir.join("chats");
        let agents_dir = data_dir.join("agents");
        tokio::fs::create_dir_all(&chats_dir).await?;
        tokio::fs::create_dir_all(&agents_dir).await?;

        let backend: Arc<dyn GenerationBackend> =
            Arc::new(OpenAiCompatBackend::from_config(&config.generation)?);
        let api_base = format!(
            "http://{}:{}/api",
            config.server.host, config.server.port
        );
        let sandbox = Arc::new(NativeExecutor::new(api_base));

        let store = TranscriptStore::new(&chats_dir);
        let executor = Arc::new(CycleExecutor::new(
            store.clone(),
            ExecutorParts {
                assembler: Arc::new(TranscriptPromptAssembler::new(agents_dir.clone())),
                persona: Arc::new(FilePersonaSource::new(agents_dir.clone())),
                summarizer: Arc::new(LlmSummarizer::new(
                    backend.clone(),
                    config.engine.summary_keep_recent,
                    config.generation.max_tokens,
                )),
                backend,
                tools: Arc::new(SkillToolExecutor::new(agents_dir, sandbox)),
                temperature: config.generation.temperature,
                max_tokens: config.generation.max_tokens,
            },
        ));
        let registry = Arc::new(
            TriggerRegistry::new(executor.clone())
                .await?
                .with_cycle_timeout(Duration::from_secs(config.engine.cycle_timeout_secs.max(1))),
        );
        info!("Engine booted with data dir {:?}", data_dir);

        Ok(Self {
            config,
            data_dir: data_dir.to_path_buf(),
            store,
            executor,
            registry,
        })
    }
}

/// Restarts every subroutine whose record says `active = true`. Returns how
/// many were started.
pub async fn resume_active(store: &TranscriptStore, registry: &TriggerRegistry) -> usize {
    let agents = match store.list_agents().await {
        Ok(a) => a,
        Err(e) => {
            warn!("Could not scan chats for active subroutines: {}", e);
            return 0;
        }
    };

    let mut started = 0;
    for agent in agents {
        let chats = match store.list_chats(&agent).await {
            Ok(c) => c,
            Err(e) => {
                warn!("Could not list chats for agent [{}]: {}", agent, e);
                continue;
            }
        };
        for chat in chats {
            let Ok(path) = store.chat_path(&agent, &chat) else {
                continue;
            };
            let record = match store.load(&path).await {
                Ok(r) => r,
                Err(e) => {
                    warn!("Skipping {:?}: {}", path, e);
                    continue;
                }
            };
            let Some(config) = record.subroutine().filter(|c| c.active) else {
                continue;
            };
            if !is_agent_chat(&record) {
                continue;
            }
            let key = JobKey::new(&agent, &chat);
            match registry.start(key.clone(), config.clone(), &path, &agent).await {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) => warn!("Could not resume subroutine [{}]: {}", key, e),
            }
        }
    }
    info!("Resumed {} active subroutine(s)", started);
    started
}

/// Resumes saved jobs on start and releases every timer on shutdown.
pub struct RegistryComponent {
    store: TranscriptStore,
    registry: Arc<TriggerRegistry>,
    resume: bool,
}

impl RegistryComponent {
    pub fn new(store: TranscriptStore, registry: Arc<TriggerRegistry>, resume: bool) -> Self {
        Self {
            store,
            registry,
            resume,
        }
    }
}

#[async_trait]
impl LifecycleComponent for RegistryComponent {
    async fn on_start(&mut self) -> Result<()> {
        if self.resume {
            resume_active(&self.store, &self.registry).await;
        }
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        self.registry.shutdown_all().await;
        Ok(())
    }
}
