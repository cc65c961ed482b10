use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use super::{ChatMessage, Generation, GenerationBackend, GenerationOptions, ToolCall, ToolSpec};
use crate::core::config::GenerationConfig;

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OpenAiTool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'a str>,
}

#[derive(Serialize)]
struct OpenAiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct OpenAiTool<'a> {
    r#type: &'static str,
    function: OpenAiFunction<'a>,
}

#[derive(Serialize)]
struct OpenAiFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessageOwned,
}

#[derive(Deserialize)]
struct OpenAiMessageOwned {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Deserialize)]
struct OpenAiToolCall {
    #[serde(default)]
    id: String,
    function: OpenAiFunctionCall,
}

#[derive(Deserialize)]
struct OpenAiFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

/// Any backend speaking the OpenAI chat-completions dialect with function calling.
pub struct OpenAiCompatBackend {
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: Client,
}

impl OpenAiCompatBackend {
    pub fn new(
        base_url: &str,
        model: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
            client,
        })
    }

    pub fn from_config(config: &GenerationConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty());
        if api_key.is_none() {
            warn!(
                "{} is not set; generation requests will be sent without credentials",
                config.api_key_env
            );
        }
        info!(
            "Generation backend: {} (model {})",
            config.base_url, config.model
        );
        Self::new(
            &config.base_url,
            &config.model,
            api_key,
            Duration::from_secs(config.request_timeout_secs.max(1)),
        )
    }
}

fn to_tool_call(call: OpenAiToolCall) -> ToolCall {
    let raw = call.function.arguments.trim();
    let arguments = if raw.is_empty() {
        serde_json::json!({})
    } else {
        serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
    };
    ToolCall {
        id: call.id,
        name: call.function.name,
        arguments,
    }
}

fn build_tools(tools: &[ToolSpec]) -> Vec<OpenAiTool<'_>> {
    tools
        .iter()
        .map(|t| OpenAiTool {
            r#type: "function",
            function: OpenAiFunction {
                name: &t.name,
                description: &t.description,
                parameters: &t.parameters,
            },
        })
        .collect()
}

#[async_trait]
impl GenerationBackend for OpenAiCompatBackend {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<Generation> {
        let tools = build_tools(&options.tools);
        let tool_choice = (!tools.is_empty()).then(|| options.tool_choice.as_str());
        let req = OpenAiRequest {
            model: &self.model,
            messages: messages
                .iter()
                .map(|m| OpenAiMessage {
                    role: &m.role,
                    content: &m.content,
                })
                .collect(),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            tools,
            tool_choice,
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&req);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }
        let res = builder.send().await?;
        if !res.status().is_success() {
            let status = res.status();
            return Err(anyhow!(
                "Generation API error ({}): {}",
                status,
                res.text().await.unwrap_or_default()
            ));
        }

        let parsed: OpenAiResponse = res.json().await?;
        let message = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| anyhow!("Generation API returned no choices"))?;

        Ok(Generation {
            text: message.content.unwrap_or_default(),
            tool_calls: message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(to_tool_call)
                .collect(),
        })
    }
}
