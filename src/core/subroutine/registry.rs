use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::JobKey;
use super::config::{SubroutineConfig, TriggerType};
use super::executor::CycleExecutor;
use crate::core::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Interval,
    ToolPolling,
    ApiActivated,
}

impl From<TriggerType> for JobKind {
    fn from(t: TriggerType) -> Self {
        match t {
            TriggerType::Time => JobKind::Interval,
            TriggerType::Tool => JobKind::ToolPolling,
            TriggerType::Api => JobKind::ApiActivated,
        }
    }
}

/// In-memory entry for a running subroutine. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveJob {
    pub key: JobKey,
    pub kind: JobKind,
    /// Scheduler handle, interval jobs only.
    #[serde(skip)]
    pub timer: Option<Uuid>,
    pub config: Arc<SubroutineConfig>,
    pub path: PathBuf,
    pub agent_name: String,
    pub started_at: DateTime<Utc>,
}

/// Default wall-clock limit for one fired cycle.
pub const DEFAULT_CYCLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Process-wide table of running subroutines, at most one per [`JobKey`].
pub struct TriggerRegistry {
    scheduler: JobScheduler,
    executor: Arc<CycleExecutor>,
    cycle_timeout: Duration,
    jobs: Mutex<HashMap<JobKey, ActiveJob>>,
    shut_down: AtomicBool,
}

impl TriggerRegistry {
    pub async fn new(executor: Arc<CycleExecutor>) -> EngineResult<Self> {
        let scheduler = JobScheduler::new().await?;
        scheduler.start().await?;
        Ok(Self {
            scheduler,
            executor,
            cycle_timeout: DEFAULT_CYCLE_TIMEOUT,
            jobs: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Cycles fired by timers or `trigger` are cancelled after `limit`,
    /// releasing the key for the next tick.
    pub fn with_cycle_timeout(mut self, limit: Duration) -> Self {
        self.cycle_timeout = limit;
        self
    }

    pub fn executor(&self) -> &Arc<CycleExecutor> {
        &self.executor
    }

    /// Registers a job for `key`. Returns `Ok(false)` when the key already has
    /// one; the existing job is left alone.
    pub async fn start(
        &self,
        key: JobKey,
        config: SubroutineConfig,
        path: &Path,
        agent_name: &str,
    ) -> EngineResult<bool> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(EngineError::conflict("trigger registry is shut down"));
        }

        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&key) {
            info!("Subroutine [{}] is already running", key);
            return Ok(false);
        }
        config.validate()?;

        let config = Arc::new(config);
        let kind = JobKind::from(config.trigger_type);
        let timer = match kind {
            JobKind::Interval => {
                // validate() guarantees interval >= 1 for time-based jobs
                let secs = config.interval.unwrap_or(1).max(1);
                Some(self.schedule_interval(&key, &config, path, agent_name, secs).await?)
            }
            JobKind::ToolPolling | JobKind::ApiActivated => None,
        };

        info!(
            "Subroutine [{}] started ({}{})",
            key,
            config.trigger_type,
            config
                .interval
                .filter(|_| timer.is_some())
                .map(|s| format!(", every {}s", s))
                .unwrap_or_default()
        );
        jobs.insert(
            key.clone(),
            ActiveJob {
                key,
                kind,
                timer,
                config,
                path: path.to_path_buf(),
                agent_name: agent_name.to_string(),
                started_at: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn schedule_interval(
        &self,
        key: &JobKey,
        config: &Arc<SubroutineConfig>,
        path: &Path,
        agent_name: &str,
        secs: u64,
    ) -> EngineResult<Uuid> {
        let executor = self.executor.clone();
        let limit = self.cycle_timeout;
        let key = key.clone();
        let config = config.clone();
        let path = path.to_path_buf();
        let agent_name = agent_name.to_string();

        let job = Job::new_repeated_async(Duration::from_secs(secs), move |_uuid, mut _l| {
            let executor = executor.clone();
            let key = key.clone();
            let config = config.clone();
            let path = path.clone();
            let agent_name = agent_name.clone();
            Box::pin(async move {
                run_tick(executor, key, path, agent_name, config, limit).await;
            })
        })?;
        Ok(self.scheduler.add(job).await?)
    }

    /// Removes the job for `key`. Returns `false` when there was none.
    pub async fn stop(&self, key: &JobKey) -> bool {
        let removed = self.jobs.lock().await.remove(key);
        match removed {
            Some(job) => {
                self.release(&job).await;
                info!("Subroutine [{}] stopped", key);
                true
            }
            None => false,
        }
    }

    async fn release(&self, job: &ActiveJob) {
        if let Some(id) = job.timer
            && let Err(e) = self.scheduler.remove(&id).await
        {
            warn!("Failed to unschedule subroutine [{}]: {}", job.key, e);
        }
    }

    /// Releases every timer and empties the table. Later `start` calls fail.
    pub async fn shutdown_all(&self) {
        let first = !self.shut_down.swap(true, Ordering::SeqCst);
        let drained: Vec<ActiveJob> = self.jobs.lock().await.drain().map(|(_, j)| j).collect();
        for job in &drained {
            self.release(job).await;
        }
        if first {
            let mut scheduler = self.scheduler.clone();
            if let Err(e) = scheduler.shutdown().await {
                warn!("Scheduler shutdown error: {}", e);
            }
            info!("Trigger registry shut down ({} job(s) released)", drained.len());
        }
    }

    /// Runs one cycle for a registered job in the background, whatever its kind.
    pub async fn trigger(&self, key: &JobKey) -> EngineResult<()> {
        let job = self
            .jobs
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("running subroutine {}", key)))?;
        if self.executor.is_running(key).await {
            return Err(EngineError::conflict(format!(
                "a cycle for {} is already running",
                key
            )));
        }
        info!("Subroutine [{}] triggered on demand", key);
        let executor = self.executor.clone();
        tokio::spawn(run_tick(
            executor,
            job.key,
            job.path,
            job.agent_name,
            job.config,
            self.cycle_timeout,
        ));
        Ok(())
    }

    pub async fn is_active(&self, key: &JobKey) -> bool {
        self.jobs.lock().await.contains_key(key)
    }

    pub async fn get(&self, key: &JobKey) -> Option<ActiveJob> {
        self.jobs.lock().await.get(key).cloned()
    }

    /// Snapshot of running jobs, sorted by key.
    pub async fn list(&self) -> Vec<ActiveJob> {
        let mut all: Vec<ActiveJob> = self.jobs.lock().await.values().cloned().collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }
}

/// One timer tick. Failures, panics and overruns end here; the timer keeps
/// running. An overrunning cycle is aborted, which drops its key guard; the
/// record keeps its last checkpoint.
async fn run_tick(
    executor: Arc<CycleExecutor>,
    key: JobKey,
    path: PathBuf,
    agent_name: String,
    config: Arc<SubroutineConfig>,
    limit: Duration,
) {
    let label = key.to_string();
    let handle = tokio::spawn(async move {
        executor
            .run_cycle(&key, &path, &agent_name, &config)
            .await
    });
    let abort = handle.abort_handle();
    match tokio::time::timeout(limit, handle).await {
        Ok(Ok(Ok(_))) => {}
        Ok(Ok(Err(EngineError::Conflict(msg)))) => {
            warn!("Subroutine [{}] tick skipped: {}", label, msg);
        }
        Ok(Ok(Err(e))) => error!("Subroutine [{}] cycle failed: {}", label, e),
        Ok(Err(e)) => error!("Subroutine [{}] cycle panicked: {}", label, e),
        Err(_) => {
            abort.abort();
            error!(
                "Subroutine [{}] cycle exceeded {}s and was cancelled",
                label,
                limit.as_secs_f32()
            );
        }
    }
}
