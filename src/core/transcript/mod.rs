pub mod types;

use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::core::error::{EngineError, EngineResult};
pub use types::{ChatHeader, ChatRecord, ChatTurn, TurnRole};

/// JSONL chat files, one per (agent, chat), under `<root>/<agent>/<chat>.jsonl`.
///
/// The file format is shared with the chat front-end: one header object on the
/// first line, then one object per turn. Writes always replace the whole file.
#[derive(Debug, Clone)]
pub struct TranscriptStore {
    root: PathBuf,
}

impl TranscriptStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn agent_dir(&self, agent: &str) -> EngineResult<PathBuf> {
        validate_name("agent", agent)?;
        Ok(self.root.join(agent))
    }

    pub fn chat_path(&self, agent: &str, chat: &str) -> EngineResult<PathBuf> {
        validate_name("chat", chat)?;
        Ok(self.agent_dir(agent)?.join(format!("{}.jsonl", chat)))
    }

    pub async fn load(&self, path: &Path) -> EngineResult<ChatRecord> {
        let content = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::not_found(format!("conversation {:?}", path)));
            }
            Err(e) => return Err(e.into()),
        };

        let mut lines = content.lines().filter(|l| !l.trim().is_empty());
        let header_line = lines
            .next()
            .ok_or_else(|| EngineError::malformed(path, "record is empty"))?;
        let header: ChatHeader = serde_json::from_str(header_line)
            .map_err(|e| EngineError::malformed(path, format!("header: {}", e)))?;

        let mut turns = Vec::new();
        for (idx, line) in lines.enumerate() {
            let turn: ChatTurn = serde_json::from_str(line)
                .map_err(|e| EngineError::malformed(path, format!("turn {}: {}", idx + 1, e)))?;
            turns.push(turn);
        }

        Ok(ChatRecord { header, turns })
    }

    /// Serialises the record and swaps it into place with a rename, so readers
    /// never observe a half-written file.
    pub async fn save(&self, path: &Path, record: &ChatRecord) -> EngineResult<()> {
        let mut buf = serde_json::to_string(&record.header)
            .map_err(|e| EngineError::malformed(path, format!("header: {}", e)))?;
        buf.push('\n');
        for turn in &record.turns {
            let line = serde_json::to_string(turn)
                .map_err(|e| EngineError::malformed(path, format!("turn: {}", e)))?;
            buf.push_str(&line);
            buf.push('\n');
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp_path = path.with_extension("jsonl.tmp");
        {
            let mut file = fs::File::create(&tmp_path).await?;
            file.write_all(buf.as_bytes()).await?;
            file.sync_all().await?;
        }
        fs::rename(&tmp_path, path).await?;
        Ok(())
    }

    pub async fn exists(&self, path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }

    pub async fn delete(&self, path: &Path) -> EngineResult<()> {
        match fs::remove_file(path).await {
            Ok(()) => {
                info!("Deleted conversation record {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(EngineError::not_found(format!("conversation {:?}", path)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Chat names (file stems) for an agent, sorted. Missing agent dir yields none.
    pub async fn list_chats(&self, agent: &str) -> EngineResult<Vec<String>> {
        let dir = self.agent_dir(agent)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("jsonl")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Agent directory names under the root, sorted.
    pub async fn list_agents(&self) -> EngineResult<Vec<String>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

pub fn is_agent_chat(record: &ChatRecord) -> bool {
    record.header.chat_metadata.agent_managed
}

/// Names become path components, so reject anything that could escape the
/// agent directory.
pub fn validate_name(kind: &str, name: &str) -> EngineResult<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(EngineError::config(format!("{} name is required", kind)));
    }
    if trimmed != name
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0'])
        || name.len() > 128
    {
        return Err(EngineError::config(format!(
            "invalid {} name: {:?}",
            kind, name
        )));
    }
    Ok(())
}
