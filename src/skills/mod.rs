pub mod native_executor;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::core::llm::{ToolCall, ToolSpec};

/// Name of the sentinel tool that ends a chain.
pub const FINISH_TOOL: &str = "finish";

/// Maximum chars of skill output fed back into the transcript.
const TOOL_OUTPUT_MAX_CHARS: usize = 2000;

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct SkillManifest {
    pub name: String,
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,

    // Optional path to the executable script (defaults to run.sh)
    #[serde(default = "default_entrypoint")]
    pub entrypoint: String,

    #[serde(default = "default_run_command")]
    pub run_command: String,

    // Internal path injected during load to know where the skill lives
    #[serde(skip)]
    pub skill_dir: PathBuf,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

fn default_entrypoint() -> String {
    "run.sh".to_string()
}

fn default_run_command() -> String {
    "sh".to_string()
}

#[async_trait]
pub trait SkillSandbox: Send + Sync {
    async fn execute(&self, manifest: &SkillManifest, args: &[String]) -> Result<String>;
}

/// The `finish` tool is declared on every generation call.
pub fn finish_tool_spec() -> ToolSpec {
    ToolSpec {
        name: FINISH_TOOL.to_string(),
        description: "Call when the task is complete and no further steps are needed.".to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "reason": {
                    "type": "string",
                    "description": "Short explanation of why the task is finished."
                }
            },
            "required": []
        }),
    }
}

/// Reason string carried by a `finish` call, if any.
pub fn finish_reason(call: &ToolCall) -> Option<String> {
    call.arguments
        .get("reason")
        .and_then(|r| r.as_str())
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ToolResult {
    pub name: String,
    pub success: bool,
    pub output: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutcome {
    pub finished: bool,
    pub reason: Option<String>,
    pub results: Vec<ToolResult>,
}

/// Runs tool calls requested by the model on behalf of an agent.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Tools contributed by the agent's attached skills (not including `finish`).
    async fn tools_for(&self, agent_name: &str) -> Vec<ToolSpec>;

    async fn execute(&self, agent_name: &str, calls: &[ToolCall]) -> Result<ToolOutcome>;
}

pub struct SkillManager {
    skills: HashMap<String, SkillManifest>,
    sandbox: Arc<dyn SkillSandbox>,
}

impl SkillManager {
    pub fn new(sandbox: Arc<dyn SkillSandbox>) -> Self {
        Self {
            skills: HashMap::new(),
            sandbox,
        }
    }

    pub fn register_skill(&mut self, manifest: SkillManifest) {
        debug!("Registering skill: {}", manifest.name);
        self.skills.insert(manifest.name.clone(), manifest);
    }

    pub fn get_all_skills(&self) -> Vec<SkillManifest> {
        let mut all: Vec<SkillManifest> = self.skills.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Tool declarations for every registered skill, sorted by name.
    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        self.get_all_skills()
            .into_iter()
            .filter(|m| m.name != FINISH_TOOL)
            .map(|m| ToolSpec {
                name: m.name,
                description: m.description,
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "args": {
                            "type": "array",
                            "items": {"type": "string"},
                            "description": "Positional arguments passed to the skill."
                        }
                    },
                    "required": []
                }),
            })
            .collect()
    }

    pub async fn execute_skill(&self, name: &str, args: &[String]) -> Result<String> {
        let manifest = self
            .skills
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Skill not found: {}", name))?;
        self.sandbox.execute(manifest, args).await
    }

    pub async fn load_skills_from_dir<P: AsRef<Path>>(&mut self, dir_path: P) -> Result<()> {
        let path = dir_path.as_ref();
        if !path.is_dir() {
            return Ok(());
        }

        let mut entries = fs::read_dir(path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let skill_dir = entry.path();
            if skill_dir.is_dir() {
                let manifest_path = skill_dir.join("manifest.toml");
                if manifest_path.exists() {
                    match fs::read_to_string(&manifest_path).await {
                        Ok(contents) => match toml::from_str::<SkillManifest>(&contents) {
                            Ok(mut manifest) => {
                                manifest.skill_dir = skill_dir.clone();
                                self.register_skill(manifest);
                            }
                            Err(e) => {
                                warn!("Failed to parse manifest at {:?}: {}", manifest_path, e)
                            }
                        },
                        Err(e) => warn!("Failed to read manifest at {:?}: {}", manifest_path, e),
                    }
                }
            }
        }
        Ok(())
    }
}

/// Accepts `{"args": [..]}`, a bare array, a bare string, or any other JSON
/// value (passed through as its serialised text).
pub fn call_args(arguments: &serde_json::Value) -> Vec<String> {
    fn stringify(v: &serde_json::Value) -> String {
        match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
    match arguments {
        serde_json::Value::Null => Vec::new(),
        serde_json::Value::Object(map) => match map.get("args") {
            Some(serde_json::Value::Array(items)) => items.iter().map(stringify).collect(),
            Some(other) => vec![stringify(other)],
            None if map.is_empty() => Vec::new(),
            None => vec![arguments.to_string()],
        },
        serde_json::Value::Array(items) => items.iter().map(stringify).collect(),
        other => vec![stringify(other)],
    }
}

fn truncate_output(out: &str) -> String {
    if out.chars().count() > TOOL_OUTPUT_MAX_CHARS {
        let cut: String = out.chars().take(TOOL_OUTPUT_MAX_CHARS).collect();
        format!("{}... [truncated]", cut)
    } else {
        out.to_string()
    }
}

/// Serves each agent's skills from `<agents_dir>/<agent>/skills/`. The
/// directory is rescanned on every lookup, so skills added while the engine
/// runs are picked up on the next cycle.
pub struct SkillToolExecutor {
    agents_dir: PathBuf,
    sandbox: Arc<dyn SkillSandbox>,
}

impl SkillToolExecutor {
    pub fn new(agents_dir: PathBuf, sandbox: Arc<dyn SkillSandbox>) -> Self {
        Self {
            agents_dir,
            sandbox,
        }
    }

    async fn manager_for(&self, agent_name: &str) -> SkillManager {
        let mut manager = SkillManager::new(self.sandbox.clone());
        let skills_dir = self.agents_dir.join(agent_name).join("skills");
        if let Err(e) = manager.load_skills_from_dir(&skills_dir).await {
            warn!(
                "Error loading skills from directory {:?}: {}",
                skills_dir, e
            );
        }
        manager
    }
}

#[async_trait]
impl ToolExecutor for SkillToolExecutor {
    async fn tools_for(&self, agent_name: &str) -> Vec<ToolSpec> {
        self.manager_for(agent_name).await.tool_specs()
    }

    async fn execute(&self, agent_name: &str, calls: &[ToolCall]) -> Result<ToolOutcome> {
        let manager = self.manager_for(agent_name).await;
        let mut outcome = ToolOutcome::default();

        for call in calls {
            if call.name == FINISH_TOOL {
                outcome.finished = true;
                outcome.reason = finish_reason(call);
                break;
            }
            let args = call_args(&call.arguments);
            info!("Invoking skill: {} with args {:?}", call.name, args);
            let result = match manager.execute_skill(&call.name, &args).await {
                Ok(out) => ToolResult {
                    name: call.name.clone(),
                    success: true,
                    output: truncate_output(&out),
                },
                Err(e) => ToolResult {
                    name: call.name.clone(),
                    success: false,
                    output: truncate_output(&e.to_string()),
                },
            };
            outcome.results.push(result);
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoSandbox;

    #[async_trait]
    impl SkillSandbox for EchoSandbox {
        async fn execute(&self, manifest: &SkillManifest, args: &[String]) -> Result<String> {
            Ok(format!("{}:{}", manifest.name, args.join(",")))
        }
    }

    async fn write_skill(root: &Path, agent: &str, name: &str) {
        let dir = root.join(agent).join("skills").join(name);
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(
            dir.join("manifest.toml"),
            format!("name = \"{}\"\ndescription = \"does {}\"\n", name, name),
        )
        .await
        .unwrap();
    }

    #[test]
    fn call_args_accepts_common_shapes() {
        assert_eq!(
            call_args(&serde_json::json!({"args": ["a", 1]})),
            vec!["a", "1"]
        );
        assert_eq!(call_args(&serde_json::json!(["x"])), vec!["x"]);
        assert_eq!(call_args(&serde_json::json!("solo")), vec!["solo"]);
        assert!(call_args(&serde_json::json!({})).is_empty());
        assert!(call_args(&serde_json::Value::Null).is_empty());
        assert_eq!(
            call_args(&serde_json::json!({"q": "rust"})),
            vec![r#"{"q":"rust"}"#]
        );
    }

    #[test]
    fn finish_reason_ignores_blank() {
        let call = ToolCall::new(FINISH_TOOL, serde_json::json!({"reason": "  "}));
        assert_eq!(finish_reason(&call), None);
        let call = ToolCall::new(FINISH_TOOL, serde_json::json!({"reason": "ok"}));
        assert_eq!(finish_reason(&call).as_deref(), Some("ok"));
    }

    #[test]
    fn truncates_long_output() {
        let long = "x".repeat(TOOL_OUTPUT_MAX_CHARS + 10);
        let out = truncate_output(&long);
        assert!(out.ends_with("... [truncated]"));
    }

    #[tokio::test]
    async fn skills_become_sorted_tool_specs() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "ada", "weather").await;
        write_skill(dir.path(), "ada", "inbox").await;
        let executor = SkillToolExecutor::new(dir.path().to_path_buf(), Arc::new(EchoSandbox));
        let tools = executor.tools_for("ada").await;
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["inbox", "weather"]);
        assert!(executor.tools_for("nobody").await.is_empty());
    }

    #[tokio::test]
    async fn skills_added_later_are_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let executor = SkillToolExecutor::new(dir.path().to_path_buf(), Arc::new(EchoSandbox));
        assert!(executor.tools_for("ada").await.is_empty());
        write_skill(dir.path(), "ada", "inbox").await;
        assert_eq!(executor.tools_for("ada").await.len(), 1);
    }

    #[tokio::test]
    async fn executes_calls_in_order_and_reports_unknown_skills() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "ada", "inbox").await;
        let executor = SkillToolExecutor::new(dir.path().to_path_buf(), Arc::new(EchoSandbox));
        let calls = vec![
            ToolCall::new("inbox", serde_json::json!({"args": ["unread"]})),
            ToolCall::new("missing", serde_json::json!({})),
        ];
        let outcome = executor.execute("ada", &calls).await.unwrap();
        assert!(!outcome.finished);
        assert_eq!(outcome.results.len(), 2);
        assert!(outcome.results[0].success);
        assert_eq!(outcome.results[0].output, "inbox:unread");
        assert!(!outcome.results[1].success);
        assert!(outcome.results[1].output.contains("Skill not found"));
    }

    #[tokio::test]
    async fn finish_call_stops_execution() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "ada", "inbox").await;
        let executor = SkillToolExecutor::new(dir.path().to_path_buf(), Arc::new(EchoSandbox));
        let calls = vec![
            ToolCall::new(FINISH_TOOL, serde_json::json!({"reason": "all done"})),
            ToolCall::new("inbox", serde_json::json!({})),
        ];
        let outcome = executor.execute("ada", &calls).await.unwrap();
        assert!(outcome.finished);
        assert_eq!(outcome.reason.as_deref(), Some("all done"));
        assert!(outcome.results.is_empty());
    }
}
