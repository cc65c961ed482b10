use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::info;

use crate::skills::{SkillManifest, SkillSandbox};

const SKILL_TIMEOUT: Duration = Duration::from_secs(120);

/// Native skill executor - runs skills directly on the host via their
/// `run_command` (default `sh`).
///
/// Arguments are passed both as CLI arguments and as a JSON array on stdin.
pub struct NativeExecutor {
    api_base: String,
}

impl NativeExecutor {
    pub fn new(api_base: String) -> Self {
        Self { api_base }
    }
}

#[async_trait]
impl SkillSandbox for NativeExecutor {
    async fn execute(&self, manifest: &SkillManifest, args: &[String]) -> Result<String> {
        info!(
            "Executing skill [{}] natively... (v{})",
            manifest.name, manifest.version
        );

        let script_path = manifest.skill_dir.join(&manifest.entrypoint);
        if !script_path.exists() {
            return Err(anyhow::anyhow!(
                "Skill entrypoint not found at {:?}",
                script_path
            ));
        }

        let mut cmd = Command::new(&manifest.run_command);
        cmd.arg(&script_path);

        // Oversized argument lists travel on stdin only (ARG_MAX).
        let total_args_len: usize = args.iter().map(|a| a.len()).sum();
        if total_args_len <= 100_000 {
            cmd.args(args);
        }
        cmd.current_dir(&manifest.skill_dir);
        cmd.env("SUBROUTINES_API_BASE", &self.api_base);
        cmd.env("SUBROUTINES_ARGS_MODE", "stdin");
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let args_json = serde_json::to_string(args)?;
        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(args_json.as_bytes()).await;
            drop(stdin);
        }

        let output = tokio::time::timeout(SKILL_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "Skill {} timed out after {}s",
                    manifest.name,
                    SKILL_TIMEOUT.as_secs()
                )
            })??;

        if !output.status.success() {
            let err = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Err(anyhow::anyhow!(
                "Skill execution failed: {} {}",
                err,
                stdout
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}
