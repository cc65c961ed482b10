mod handlers;
mod router;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

use crate::core::lifecycle::LifecycleComponent;
use crate::core::subroutine::TriggerRegistry;
use crate::core::transcript::TranscriptStore;

pub struct ApiServer {
    store: TranscriptStore,
    registry: Arc<TriggerRegistry>,
    user_name: String,
    log_tx: tokio::sync::broadcast::Sender<String>,
    api_host: String,
    api_port: u16,
}

pub struct ApiServerConfig {
    pub store: TranscriptStore,
    pub registry: Arc<TriggerRegistry>,
    pub user_name: String,
    pub log_tx: tokio::sync::broadcast::Sender<String>,
    pub api_host: String,
    pub api_port: u16,
}

#[derive(Clone)]
pub struct AppState {
    pub(crate) store: TranscriptStore,
    pub(crate) registry: Arc<TriggerRegistry>,
    /// Owner name written into records created over HTTP.
    pub(crate) user_name: String,
    pub(crate) log_tx: tokio::sync::broadcast::Sender<String>,
    pub(crate) api_port: u16,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig) -> Self {
        Self {
            store: config.store,
            registry: config.registry,
            user_name: config.user_name,
            log_tx: config.log_tx,
            api_host: config.api_host,
            api_port: config.api_port,
        }
    }
}

// --- SSE Logs (used by router) ---

async fn sse_logs_endpoint(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.log_tx.subscribe();
    let stream = BroadcastStream::new(receiver).map(|msg| match msg {
        Ok(log) => Ok(Event::default().data(log)),
        Err(_) => Ok(Event::default().data("Log stream lagged")),
    });

    Sse::new(stream)
}

#[async_trait]
impl LifecycleComponent for ApiServer {
    async fn on_init(&mut self) -> Result<()> {
        info!("API Server Interface initializing...");
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let state = AppState {
            store: self.store.clone(),
            registry: self.registry.clone(),
            user_name: self.user_name.clone(),
            log_tx: self.log_tx.clone(),
            api_port: self.api_port,
        };
        let addr = format!("{}:{}", self.api_host, self.api_port);

        // A taken port fails the boot.
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind API server on {}: {}", addr, e))?;
        let app = router::build_api_router(state);

        tokio::spawn(async move {
            info!("API Server running at http://{addr}");
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("API Server crashed: {}", e);
            }
        });
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("API Server Interface shutting down...");
        Ok(())
    }
}
