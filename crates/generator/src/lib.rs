//! The opaque model capability.
//!
//! The engine core never knows which backend sits behind [`Generator`]; the
//! transport adapters provide an implementation at wiring time. This crate
//! ships the trait, the tool-call capability, a scripted mock for tests,
//! and the cost-tracking decorator every call is routed through.

mod cost;
mod mock;
mod ollama;

pub use cost::{CostCategory, CostRecord, CostTracker, COST_WINDOW_DAYS};
pub use mock::MockGenerator;
pub use ollama::OllamaGenerator;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Upper bound on generator-driven tool-call rounds per `generate`.
pub const MAX_TOOL_ROUNDS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Descriptor for a tool the generator may invoke.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Late-bound tool-call capability handed to the generator.
pub trait ToolHost: Send + Sync {
    fn call(&self, name: &str, args: &Value) -> Result<String>;
}

#[derive(Clone, Default)]
pub struct GenerateOptions {
    pub max_tokens: u32,
    pub tools: Vec<ToolSpec>,
    pub tool_host: Option<Arc<dyn ToolHost>>,
}

impl GenerateOptions {
    pub fn with_budget(max_tokens: u32) -> Self {
        Self {
            max_tokens,
            ..Default::default()
        }
    }
}

impl std::fmt::Debug for GenerateOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerateOptions")
            .field("max_tokens", &self.max_tokens)
            .field("tools", &self.tools.len())
            .field("has_tool_host", &self.tool_host.is_some())
            .finish()
    }
}

/// A pure model capability: system + history + user in, text out.
///
/// Implementations may suspend (network I/O) but must not mutate any engine
/// state; a timeout returns an error without partial effects.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        system: &str,
        history: &[ChatMessage],
        user: &str,
        options: &GenerateOptions,
    ) -> Result<String>;
}

/// `⌈chars/4⌉` — the estimation rule used for all cost accounting.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}
