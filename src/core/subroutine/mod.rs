pub mod config;
pub mod executor;
pub mod registry;

pub use config::{NewSubroutine, SubroutineConfig, SubroutinePatch};
pub use executor::{CycleEnd, CycleExecutor, ExecutorParts};
pub use registry::TriggerRegistry;

use serde::Serialize;

/// Identity of one conversation: the agent that owns it and the chat name.
///
/// Kept as two fields so that distinct pairs can never collide, whatever
/// characters the names contain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct JobKey {
    pub agent: String,
    pub chat: String,
}

impl JobKey {
    pub fn new(agent: impl Into<String>, chat: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            chat: chat.into(),
        }
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.agent, self.chat)
    }
}

#[cfg(test)]
pub(crate) mod tests;
