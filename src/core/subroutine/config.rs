use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::error::{EngineError, EngineResult};
use crate::core::transcript::types::now_stamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerType {
    #[serde(rename = "time-based")]
    Time,
    #[serde(rename = "tool-based")]
    Tool,
    #[serde(rename = "api-based")]
    Api,
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TriggerType::Time => "time-based",
            TriggerType::Tool => "tool-based",
            TriggerType::Api => "api-based",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TriggerRole {
    User,
    #[default]
    System,
    Assistant,
}

/// One recurring-job definition. Lives in the conversation record header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubroutineConfig {
    pub id: String,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub trigger_text: String,
    #[serde(default)]
    pub fallback_trigger_text: String,
    #[serde(default)]
    pub trigger_role: TriggerRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_condition: Option<String>,
    #[serde(default)]
    pub auto_queue: bool,
    #[serde(default)]
    pub auto_queue_prompt: String,
    #[serde(default)]
    pub use_summary: bool,
    #[serde(default)]
    pub use_lorebooks: bool,
    #[serde(default)]
    pub use_example_messages: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// RFC 3339, kept as written so a load/save cycle leaves the header untouched.
    pub created_at: String,
    pub updated_at: String,
    /// Keys written by other tools that this engine does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SubroutineConfig {
    /// Checks the per-trigger-type invariants. Called before anything is
    /// persisted or scheduled.
    pub fn validate(&self) -> EngineResult<()> {
        match self.trigger_type {
            TriggerType::Time => match self.interval {
                Some(secs) if secs >= 1 => {}
                Some(secs) => {
                    return Err(EngineError::config(format!(
                        "interval must be at least 1 second, got {}",
                        secs
                    )));
                }
                None => {
                    return Err(EngineError::config(
                        "interval is required for time-based subroutines",
                    ));
                }
            },
            TriggerType::Tool => {
                let has_tool = self
                    .tool_name
                    .as_deref()
                    .is_some_and(|t| !t.trim().is_empty());
                if !has_tool {
                    return Err(EngineError::config(
                        "toolName is required for tool-based subroutines",
                    ));
                }
            }
            TriggerType::Api => {}
        }

        if matches!(self.trigger_type, TriggerType::Time | TriggerType::Tool)
            && self.trigger_text.trim().is_empty()
            && self.fallback_trigger_text.trim().is_empty()
        {
            return Err(EngineError::config(format!(
                "triggerText is required for {} subroutines",
                self.trigger_type
            )));
        }

        Ok(())
    }

    /// Applies a typed patch and revalidates. `self` is left untouched on error.
    pub fn apply(&self, patch: &SubroutinePatch) -> EngineResult<SubroutineConfig> {
        let mut next = self.clone();
        if let Some(v) = patch.trigger_type {
            next.trigger_type = v;
        }
        if let Some(v) = &patch.trigger_text {
            next.trigger_text = v.clone();
        }
        if let Some(v) = &patch.fallback_trigger_text {
            next.fallback_trigger_text = v.clone();
        }
        if let Some(v) = patch.trigger_role {
            next.trigger_role = v;
        }
        if let Some(v) = patch.interval {
            next.interval = Some(v);
        }
        if let Some(v) = &patch.tool_name {
            next.tool_name = Some(v.clone());
        }
        if let Some(v) = &patch.tool_condition {
            next.tool_condition = Some(v.clone());
        }
        if let Some(v) = patch.auto_queue {
            next.auto_queue = v;
        }
        if let Some(v) = &patch.auto_queue_prompt {
            next.auto_queue_prompt = v.clone();
        }
        if let Some(v) = patch.use_summary {
            next.use_summary = v;
        }
        if let Some(v) = patch.use_lorebooks {
            next.use_lorebooks = v;
        }
        if let Some(v) = patch.use_example_messages {
            next.use_example_messages = v;
        }
        if let Some(v) = &patch.color {
            next.color = Some(v.clone());
        }
        next.validate()?;
        next.updated_at = now_stamp();
        Ok(next)
    }

    pub fn effective_trigger_text(&self) -> Option<&str> {
        [self.trigger_text.as_str(), self.fallback_trigger_text.as_str()]
            .into_iter()
            .find(|t| !t.trim().is_empty())
    }
}

/// Fields a client may change on an existing subroutine. Anything else in the
/// request body is rejected.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SubroutinePatch {
    pub trigger_type: Option<TriggerType>,
    pub trigger_text: Option<String>,
    pub fallback_trigger_text: Option<String>,
    pub trigger_role: Option<TriggerRole>,
    pub interval: Option<u64>,
    pub tool_name: Option<String>,
    pub tool_condition: Option<String>,
    pub auto_queue: Option<bool>,
    pub auto_queue_prompt: Option<String>,
    pub use_summary: Option<bool>,
    pub use_lorebooks: Option<bool>,
    pub use_example_messages: Option<bool>,
    pub color: Option<String>,
}

impl SubroutinePatch {
    pub fn is_empty(&self) -> bool {
        self.trigger_type.is_none()
            && self.trigger_text.is_none()
            && self.fallback_trigger_text.is_none()
            && self.trigger_role.is_none()
            && self.interval.is_none()
            && self.tool_name.is_none()
            && self.tool_condition.is_none()
            && self.auto_queue.is_none()
            && self.auto_queue_prompt.is_none()
            && self.use_summary.is_none()
            && self.use_lorebooks.is_none()
            && self.use_example_messages.is_none()
            && self.color.is_none()
    }
}

/// Creation payload: the conversation name plus the initial field values.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NewSubroutine {
    pub name: String,
    pub trigger_type: Option<TriggerType>,
    pub trigger_text: Option<String>,
    pub fallback_trigger_text: Option<String>,
    pub trigger_role: Option<TriggerRole>,
    pub interval: Option<u64>,
    pub tool_name: Option<String>,
    pub tool_condition: Option<String>,
    pub auto_queue: Option<bool>,
    pub auto_queue_prompt: Option<String>,
    pub use_summary: Option<bool>,
    pub use_lorebooks: Option<bool>,
    pub use_example_messages: Option<bool>,
    pub color: Option<String>,
}

impl NewSubroutine {
    fn fields(&self) -> SubroutinePatch {
        SubroutinePatch {
            trigger_type: self.trigger_type,
            trigger_text: self.trigger_text.clone(),
            fallback_trigger_text: self.fallback_trigger_text.clone(),
            trigger_role: self.trigger_role,
            interval: self.interval,
            tool_name: self.tool_name.clone(),
            tool_condition: self.tool_condition.clone(),
            auto_queue: self.auto_queue,
            auto_queue_prompt: self.auto_queue_prompt.clone(),
            use_summary: self.use_summary,
            use_lorebooks: self.use_lorebooks,
            use_example_messages: self.use_example_messages,
            color: self.color.clone(),
        }
    }

    pub fn into_config(self) -> EngineResult<(String, SubroutineConfig)> {
        let now = now_stamp();
        let trigger_type = self.trigger_type.unwrap_or(TriggerType::Time);
        let base = SubroutineConfig {
            id: uuid::Uuid::new_v4().to_string(),
            trigger_type,
            active: false,
            trigger_text: String::new(),
            fallback_trigger_text: String::new(),
            trigger_role: TriggerRole::System,
            // The default interval only makes sense for time-based jobs.
            interval: (trigger_type == TriggerType::Time).then_some(60),
            tool_name: None,
            tool_condition: None,
            auto_queue: false,
            auto_queue_prompt: String::new(),
            use_summary: false,
            use_lorebooks: false,
            use_example_messages: false,
            color: None,
            created_at: now.clone(),
            updated_at: now,
            extra: Map::new(),
        };
        let mut config = base.apply(&self.fields())?;
        config.created_at = config.updated_at.clone();
        Ok((self.name.trim().to_string(), config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn time_config(interval: Option<u64>, text: &str) -> SubroutineConfig {
        let now = "2024-05-01T12:00:00.000Z".to_string();
        SubroutineConfig {
            id: "sub-1".to_string(),
            trigger_type: TriggerType::Time,
            active: false,
            trigger_text: text.to_string(),
            fallback_trigger_text: String::new(),
            trigger_role: TriggerRole::User,
            interval,
            tool_name: None,
            tool_condition: None,
            auto_queue: false,
            auto_queue_prompt: String::new(),
            use_summary: false,
            use_lorebooks: false,
            use_example_messages: false,
            color: None,
            created_at: now.clone(),
            updated_at: now,
            extra: Map::new(),
        }
    }

    #[test]
    fn time_based_requires_positive_interval() {
        assert!(time_config(Some(5), "ping").validate().is_ok());
        assert!(matches!(
            time_config(Some(0), "ping").validate(),
            Err(EngineError::Configuration(_))
        ));
        assert!(matches!(
            time_config(None, "ping").validate(),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn time_based_requires_some_trigger_text() {
        assert!(time_config(Some(5), "   ").validate().is_err());
        let mut cfg = time_config(Some(5), "");
        cfg.fallback_trigger_text = "fallback".to_string();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.effective_trigger_text(), Some("fallback"));
    }

    #[test]
    fn tool_based_requires_tool_name() {
        let mut cfg = time_config(None, "check the queue");
        cfg.trigger_type = TriggerType::Tool;
        assert!(cfg.validate().is_err());
        cfg.tool_name = Some("  ".to_string());
        assert!(cfg.validate().is_err());
        cfg.tool_name = Some("inbox".to_string());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn api_based_needs_nothing_extra() {
        let mut cfg = time_config(None, "");
        cfg.trigger_type = TriggerType::Api;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn serializes_with_camel_case_and_kebab_trigger_type() {
        let cfg = time_config(Some(5), "ping");
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["triggerType"], "time-based");
        assert_eq!(json["triggerText"], "ping");
        assert_eq!(json["triggerRole"], "user");
        assert_eq!(json["interval"], 5);
        assert!(json.get("toolName").is_none());
    }

    #[test]
    fn unmodelled_keys_and_timestamp_text_survive() {
        let line = r#"{"id":"s1","triggerType":"api-based","active":false,"triggerText":"","fallbackTriggerText":"","triggerRole":"system","autoQueue":false,"autoQueuePrompt":"","useSummary":false,"useLorebooks":false,"useExampleMessages":false,"createdAt":"2024-05-01T12:00:00.000Z","updatedAt":"2024-05-01T12:00:00.000Z","skills":["inbox"]}"#;
        let cfg: SubroutineConfig = serde_json::from_str(line).unwrap();
        assert_eq!(cfg.extra["skills"], serde_json::json!(["inbox"]));
        assert_eq!(serde_json::to_string(&cfg).unwrap(), line);
    }

    #[test]
    fn patch_rejects_unknown_fields() {
        let err = serde_json::from_str::<SubroutinePatch>(r#"{"active": true}"#);
        assert!(err.is_err());
        let err = serde_json::from_str::<SubroutinePatch>(r#"{"intervall": 3}"#);
        assert!(err.is_err());
    }

    #[test]
    fn apply_validates_before_returning() {
        let cfg = time_config(Some(5), "ping");
        let patch = SubroutinePatch {
            interval: Some(0),
            ..Default::default()
        };
        assert!(cfg.apply(&patch).is_err());
        assert_eq!(cfg.interval, Some(5));

        let patch = SubroutinePatch {
            interval: Some(30),
            auto_queue: Some(true),
            ..Default::default()
        };
        let next = cfg.apply(&patch).unwrap();
        assert_eq!(next.interval, Some(30));
        assert!(next.auto_queue);
        assert_eq!(next.id, cfg.id);
        assert_ne!(next.updated_at, cfg.updated_at);
        assert_eq!(next.created_at, cfg.created_at);
    }

    #[test]
    fn new_subroutine_applies_defaults() {
        let req: NewSubroutine =
            serde_json::from_str(r#"{"name": " heartbeat ", "triggerText": "ping"}"#).unwrap();
        let (name, cfg) = req.into_config().unwrap();
        assert_eq!(name, "heartbeat");
        assert_eq!(cfg.trigger_type, TriggerType::Time);
        assert_eq!(cfg.interval, Some(60));
        assert!(!cfg.active);
        assert_eq!(cfg.trigger_role, TriggerRole::System);
    }

    #[test]
    fn new_api_subroutine_drops_default_interval() {
        let req: NewSubroutine =
            serde_json::from_str(r#"{"name": "hook", "triggerType": "api-based"}"#).unwrap();
        let (_, cfg) = req.into_config().unwrap();
        assert_eq!(cfg.interval, None);
    }

    #[test]
    fn new_subroutine_without_text_is_rejected() {
        let req: NewSubroutine = serde_json::from_str(r#"{"name": "tick"}"#).unwrap();
        assert!(matches!(
            req.into_config(),
            Err(EngineError::Configuration(_))
        ));
    }
}
