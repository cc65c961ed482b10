use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
};
use serde_json::{Value, json};
use tracing::{info, warn};

use super::super::AppState;
use crate::core::error::{EngineError, EngineResult};
use crate::core::subroutine::{JobKey, NewSubroutine, SubroutineConfig, SubroutinePatch};
use crate::core::transcript::{ChatRecord, is_agent_chat, validate_name};

pub(crate) type Reply = (StatusCode, Json<Value>);

pub(crate) fn failure(err: EngineError) -> Reply {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(json!({
            "success": false,
            "error": err.to_string()
        })),
    )
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> EngineResult<T> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| EngineError::config(e.body_text()))
}

/// Loads an agent-managed record and its subroutine. Plain chats are invisible here.
async fn load_subroutine(
    state: &AppState,
    agent: &str,
    name: &str,
) -> EngineResult<(std::path::PathBuf, ChatRecord, SubroutineConfig)> {
    let path = state.store.chat_path(agent, name)?;
    let record = state.store.load(&path).await?;
    let config = match record.subroutine() {
        Some(cfg) if is_agent_chat(&record) => cfg.clone(),
        _ => return Err(EngineError::not_found(format!("subroutine {}", name))),
    };
    Ok((path, record, config))
}

async fn describe(state: &AppState, agent: &str, name: &str, record: &ChatRecord) -> Value {
    let key = JobKey::new(agent, name);
    json!({
        "name": name,
        "subroutine": record.subroutine(),
        "running": state.registry.is_active(&key).await,
        "turns": record.turns.len(),
    })
}

pub async fn list_subroutines_endpoint(
    Path(agent): Path<String>,
    State(state): State<AppState>,
) -> Reply {
    list_subroutines(&state, &agent)
        .await
        .unwrap_or_else(failure)
}

async fn list_subroutines(state: &AppState, agent: &str) -> EngineResult<Reply> {
    validate_name("agent", agent)?;
    let mut items = Vec::new();
    for chat in state.store.list_chats(agent).await? {
        let path = state.store.chat_path(agent, &chat)?;
        match state.store.load(&path).await {
            Ok(record) if is_agent_chat(&record) && record.subroutine().is_some() => {
                items.push(describe(state, agent, &chat, &record).await);
            }
            Ok(_) => {}
            Err(e) => warn!("Skipping unreadable chat {:?}: {}", path, e),
        }
    }
    Ok((
        StatusCode::OK,
        Json(json!({
            "success": true,
            "subroutines": items
        })),
    ))
}

pub async fn create_subroutine_endpoint(
    Path(agent): Path<String>,
    State(state): State<AppState>,
    payload: Result<Json<NewSubroutine>, JsonRejection>,
) -> Reply {
    create_subroutine(&state, &agent, payload)
        .await
        .unwrap_or_else(failure)
}

async fn create_subroutine(
    state: &AppState,
    agent: &str,
    payload: Result<Json<NewSubroutine>, JsonRejection>,
) -> EngineResult<Reply> {
    let (name, config) = body(payload)?.into_config()?;
    let path = state.store.chat_path(agent, &name)?;
    let key = JobKey::new(agent, &name);

    let _hold = state.registry.executor().hold(&key).await;
    if state.store.exists(&path).await {
        return Err(EngineError::conflict(format!(
            "a chat named {} already exists",
            name
        )));
    }
    let record = ChatRecord::new_agent_chat(&state.user_name, agent, config);
    state.store.save(&path, &record).await?;
    info!("Created subroutine [{}]", key);

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "name": name,
            "subroutine": record.subroutine()
        })),
    ))
}

pub async fn get_subroutine_endpoint(
    Path((agent, name)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Reply {
    get_subroutine(&state, &agent, &name)
        .await
        .unwrap_or_else(failure)
}

async fn get_subroutine(state: &AppState, agent: &str, name: &str) -> EngineResult<Reply> {
    let (_, record, _) = load_subroutine(state, agent, name).await?;
    let mut view = describe(state, agent, name, &record).await;
    view["success"] = json!(true);
    Ok((StatusCode::OK, Json(view)))
}

pub async fn update_subroutine_endpoint(
    Path((agent, name)): Path<(String, String)>,
    State(state): State<AppState>,
    payload: Result<Json<SubroutinePatch>, JsonRejection>,
) -> Reply {
    update_subroutine(&state, &agent, &name, payload)
        .await
        .unwrap_or_else(failure)
}

async fn update_subroutine(
    state: &AppState,
    agent: &str,
    name: &str,
    payload: Result<Json<SubroutinePatch>, JsonRejection>,
) -> EngineResult<Reply> {
    let patch = body(payload)?;
    if patch.is_empty() {
        return Err(EngineError::config("no updatable fields in request"));
    }
    let key = JobKey::new(agent, name);
    let _hold = state.registry.executor().hold(&key).await;

    let (path, mut record, current) = load_subroutine(state, agent, name).await?;
    let next = current.apply(&patch)?;
    record.header.chat_metadata.subroutine = Some(next.clone());
    state.store.save(&path, &record).await?;

    // A running job picks up the new definition on restart.
    let mut restarted = false;
    if state.registry.stop(&key).await {
        restarted = state
            .registry
            .start(key.clone(), next.clone(), &path, agent)
            .await?;
    }
    info!("Updated subroutine [{}] (restarted: {})", key, restarted);

    Ok((
        StatusCode::OK,
        Json(json!({
            "success": true,
            "subroutine": next,
            "restarted": restarted
        })),
    ))
}

pub async fn delete_subroutine_endpoint(
    Path((agent, name)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Reply {
    delete_subroutine(&state, &agent, &name)
        .await
        .unwrap_or_else(failure)
}

async fn delete_subroutine(state: &AppState, agent: &str, name: &str) -> EngineResult<Reply> {
    let key = JobKey::new(agent, name);
    let (path, _, _) = load_subroutine(state, agent, name).await?;
    let stopped = state.registry.stop(&key).await;
    {
        let _hold = state.registry.executor().hold(&key).await;
        state.store.delete(&path).await?;
    }
    state.registry.executor().forget(&key).await;
    info!("Deleted subroutine [{}]", key);
    Ok((
        StatusCode::OK,
        Json(json!({
            "success": true,
            "stopped": stopped
        })),
    ))
}

pub async fn start_subroutine_endpoint(
    Path((agent, name)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Reply {
    start_subroutine(&state, &agent, &name)
        .await
        .unwrap_or_else(failure)
}

async fn start_subroutine(state: &AppState, agent: &str, name: &str) -> EngineResult<Reply> {
    let key = JobKey::new(agent, name);
    let _hold = state.registry.executor().hold(&key).await;
    let (path, mut record, mut config) = load_subroutine(state, agent, name).await?;

    config.active = true;
    if !state
        .registry
        .start(key.clone(), config.clone(), &path, agent)
        .await?
    {
        return Err(EngineError::conflict(format!(
            "subroutine {} is already running",
            name
        )));
    }

    record.header.chat_metadata.subroutine = Some(config);
    if let Err(e) = state.store.save(&path, &record).await {
        state.registry.stop(&key).await;
        return Err(e);
    }

    Ok((
        StatusCode::OK,
        Json(json!({
            "success": true,
            "message": format!("Subroutine {} started", name)
        })),
    ))
}

pub async fn stop_subroutine_endpoint(
    Path((agent, name)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Reply {
    stop_subroutine(&state, &agent, &name)
        .await
        .unwrap_or_else(failure)
}

async fn stop_subroutine(state: &AppState, agent: &str, name: &str) -> EngineResult<Reply> {
    validate_name("agent", agent)?;
    validate_name("chat", name)?;
    let key = JobKey::new(agent, name);
    if !state.registry.stop(&key).await {
        return Err(EngineError::not_found(format!("running subroutine {}", key)));
    }

    // Waits out an in-flight cycle before rewriting the record.
    let _hold = state.registry.executor().hold(&key).await;
    let (path, mut record, mut config) = load_subroutine(state, agent, name).await?;
    config.active = false;
    record.header.chat_metadata.subroutine = Some(config);
    state.store.save(&path, &record).await?;

    Ok((
        StatusCode::OK,
        Json(json!({
            "success": true,
            "message": format!("Subroutine {} stopped", name)
        })),
    ))
}

pub async fn trigger_subroutine_endpoint(
    Path((agent, name)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Reply {
    let key = JobKey::new(&agent, &name);
    match state.registry.trigger(&key).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "success": true,
                "message": format!("Cycle queued for {}", key)
            })),
        ),
        Err(e) => failure(e),
    }
}

pub async fn active_subroutines_endpoint(State(state): State<AppState>) -> Reply {
    let jobs = state.registry.list().await;
    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "active": jobs
        })),
    )
}
