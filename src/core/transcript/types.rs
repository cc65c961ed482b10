use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::subroutine::config::{SubroutineConfig, TriggerRole};

/// First line of a chat file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatHeader {
    pub user_name: String,
    pub character_name: String,
    pub create_date: String,
    #[serde(default)]
    pub chat_metadata: ChatMetadata,
    /// Keys written by the chat application that this engine does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChatMetadata {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub agent_managed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subroutine: Option<SubroutineConfig>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnRole {
    User,
    System,
    Agent,
}

impl From<TriggerRole> for TurnRole {
    fn from(role: TriggerRole) -> Self {
        match role {
            TriggerRole::User => TurnRole::User,
            TriggerRole::System => TurnRole::System,
            TriggerRole::Assistant => TurnRole::Agent,
        }
    }
}

/// One transcript entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub name: String,
    pub is_user: bool,
    #[serde(default)]
    pub is_system: bool,
    pub send_date: String,
    pub mes: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatTurn {
    pub fn new(name: impl Into<String>, role: TurnRole, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_user: role == TurnRole::User,
            is_system: role == TurnRole::System,
            send_date: now_stamp(),
            mes: text.into(),
            extra: Map::new(),
        }
    }

    pub fn role(&self) -> TurnRole {
        if self.is_system {
            TurnRole::System
        } else if self.is_user {
            TurnRole::User
        } else {
            TurnRole::Agent
        }
    }
}

/// A whole conversation: header plus ordered turns.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRecord {
    pub header: ChatHeader,
    pub turns: Vec<ChatTurn>,
}

impl ChatRecord {
    /// Fresh agent-managed record carrying a subroutine definition.
    pub fn new_agent_chat(user_name: &str, agent_name: &str, config: SubroutineConfig) -> Self {
        Self {
            header: ChatHeader {
                user_name: user_name.to_string(),
                character_name: agent_name.to_string(),
                create_date: now_stamp(),
                chat_metadata: ChatMetadata {
                    agent_managed: true,
                    subroutine: Some(config),
                    extra: Map::new(),
                },
                extra: Map::new(),
            },
            turns: Vec::new(),
        }
    }

    pub fn subroutine(&self) -> Option<&SubroutineConfig> {
        self.header.chat_metadata.subroutine.as_ref()
    }

    pub fn push(&mut self, turn: ChatTurn) {
        self.turns.push(turn);
    }
}

pub(crate) fn now_stamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
