use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::{ChatMessage, ChatRole, GenerateOptions, Generator, MAX_TOOL_ROUNDS};

const CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Default generator backend: a local Ollama instance speaking `/api/chat`.
///
/// Base URL comes from `OLLAMA_BASE_URL` (default `http://localhost:11434`);
/// the model from `OLLAMA_MODEL`. A per-call timeout keeps a hung backend
/// from wedging the fire loop.
#[derive(Debug, Clone)]
pub struct OllamaGenerator {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaGenerator {
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("OLLAMA_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:11434".to_string());
        let model = std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| "llama3.1:8b".to_string());
        let client = reqwest::Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()
            .context("building http client")?;
        Ok(Self {
            client,
            base_url,
            model,
        })
    }

    fn role_name(role: ChatRole) -> &'static str {
        match role {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }

    async fn chat_once(&self, messages: &[Value], options: &GenerateOptions) -> Result<Value> {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
            "options": {"num_predict": options.max_tokens},
        });
        if !options.tools.is_empty() {
            let tools: Vec<Value> = options
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.input_schema,
                        },
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .context("ollama request failed")?;
        if !response.status().is_success() {
            bail!("ollama returned {}", response.status());
        }
        let parsed: Value = response.json().await.context("ollama reply not json")?;
        Ok(parsed)
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    async fn generate(
        &self,
        system: &str,
        history: &[ChatMessage],
        user: &str,
        options: &GenerateOptions,
    ) -> Result<String> {
        let mut messages: Vec<Value> = Vec::with_capacity(history.len() + 2);
        if !system.is_empty() {
            messages.push(json!({"role": "system", "content": system}));
        }
        for msg in history {
            messages.push(json!({
                "role": Self::role_name(msg.role),
                "content": msg.content,
            }));
        }
        messages.push(json!({"role": "user", "content": user}));

        // Tool-call loop: feed results back until the model answers in text
        // or the round cap is hit.
        for round in 0..=MAX_TOOL_ROUNDS {
            let reply = self.chat_once(&messages, options).await?;
            let message = reply.get("message").cloned().unwrap_or_default();

            let tool_calls = message
                .get("tool_calls")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            if tool_calls.is_empty() {
                let content = message
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                debug!(round, chars = content.len(), "ollama reply");
                return Ok(content);
            }

            let Some(host) = options.tool_host.as_ref() else {
                bail!("generator requested tools but no tool host is wired");
            };
            messages.push(message.clone());
            for call in &tool_calls {
                let name = call
                    .pointer("/function/name")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let args = call
                    .pointer("/function/arguments")
                    .cloned()
                    .unwrap_or(Value::Null);
                let output = host
                    .call(name, &args)
                    .unwrap_or_else(|err| format!("tool error: {err:#}"));
                messages.push(json!({"role": "tool", "content": output}));
            }
        }

        bail!("tool-call rounds exceeded {MAX_TOOL_ROUNDS}")
    }
}
