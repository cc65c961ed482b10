use anyhow::{Result, anyhow};
use console::style;
use std::path::Path;

use super::TargetArgs;
use crate::core::config::EngineConfig;
use crate::core::engine::Engine;
use crate::core::subroutine::{CycleEnd, JobKey};
use crate::core::terminal;
use crate::core::transcript::{TranscriptStore, is_agent_chat};

/// Runs a single cycle in the foreground and prints how it ended.
pub async fn run_once(data_dir: &Path, config: EngineConfig, target: &TargetArgs) -> Result<()> {
    crate::logging::init_logging(false);
    let engine = Engine::boot(data_dir, config).await?;
    let path = engine.store.chat_path(&target.agent, &target.chat)?;
    let record = engine.store.load(&path).await?;
    let subroutine = record
        .subroutine()
        .filter(|_| is_agent_chat(&record))
        .cloned()
        .ok_or_else(|| anyhow!("{} is not a subroutine chat", target.chat))?;

    let key = JobKey::new(&target.agent, &target.chat);
    let result = engine
        .executor
        .run_cycle(&key, &path, &target.agent, &subroutine)
        .await;
    engine.registry.shutdown_all().await;
    let outcome = result?;

    let summary = match &outcome.end {
        CycleEnd::Finished { reason } => format!("finished: {}", reason),
        CycleEnd::Idle => "idle".to_string(),
        CycleEnd::DepthExceeded => "stopped by depth limit".to_string(),
    };
    terminal::print_success(&format!("Cycle for {} {}", key, summary));
    terminal::print_status("Depth", &outcome.depth.to_string());
    terminal::print_status("New turns", &outcome.turns_appended.to_string());
    Ok(())
}

pub async fn list(data_dir: &Path, agent: &str) -> Result<()> {
    let store = TranscriptStore::new(data_dir.join("chats"));
    let chats = store.list_chats(agent).await?;
    let mut shown = 0;
    for chat in chats {
        let path = store.chat_path(agent, &chat)?;
        let Ok(record) = store.load(&path).await else {
            terminal::print_warn(&format!("{}: unreadable", chat));
            continue;
        };
        let Some(cfg) = record.subroutine().filter(|_| is_agent_chat(&record)) else {
            continue;
        };
        let state = if cfg.active {
            style("active").green()
        } else {
            style("inactive").dim()
        };
        let schedule = cfg
            .interval
            .map(|s| format!(" every {}s", s))
            .unwrap_or_default();
        println!(
            "  {}  {}{}  [{}]  {} turns",
            style(&chat).bold(),
            cfg.trigger_type,
            schedule,
            state,
            record.turns.len()
        );
        shown += 1;
    }
    if shown == 0 {
        terminal::print_info(&format!("Agent {} has no subroutines.", agent));
    }
    Ok(())
}
