//! Engine configuration — `soul.toml` plus environment overrides.
//!
//! The merged record is built once at startup and never mutated afterwards.
//! Every section struct uses `#[serde(default)]` so a partial `soul.toml`
//! (or none at all) yields the documented defaults, and the `SOUL_*`
//! environment variables win over the file.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SoulConfig {
    /// Root directory holding SEED.md and all runtime files.
    pub root: String,
    /// Display name used in banners and generator prompts.
    pub name: String,
}

impl Default for SoulConfig {
    fn default() -> Self {
        Self {
            root: ".".to_string(),
            name: "Soul".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BusConfig {
    /// Dump every emitted event to stderr (`SOUL_BUS_DEBUG`).
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImpulseConfig {
    pub enabled: bool,
    /// Lower bound on the fire delay, seconds (`IMPULSE_MIN_DELAY`).
    pub min_delay_secs: u64,
    /// Upper bound on the fire delay, seconds (`IMPULSE_MAX_DELAY`).
    pub max_delay_secs: u64,
    /// Hour at which the night range begins (`IMPULSE_NIGHT_START`).
    pub night_start_hour: u8,
    /// Hour at which the night range ends (`IMPULSE_NIGHT_END`).
    pub night_end_hour: u8,
    /// Tick period, seconds.
    pub tick_secs: u64,
}

impl Default for ImpulseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_delay_secs: 30 * 60,
            max_delay_secs: 4 * 60 * 60,
            night_start_hour: 23,
            night_end_hour: 7,
            tick_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidatorConfig {
    pub enabled: bool,
}

impl Default for ConsolidatorConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VersioningConfig {
    pub enabled: bool,
    /// Debounce window for queued commits, seconds.
    pub debounce_secs: u64,
}

impl Default for VersioningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectionConfig {
    pub enabled: bool,
    /// Token budget for one reflection pass (`SOUL_REFLECTION_LLM_BUDGET`).
    pub llm_budget: u32,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            llm_budget: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Cron expression driving the heartbeat (`HEARTBEAT_CRON`).
    pub cron: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            cron: "0 0 */4 * * *".to_string(),
        }
    }
}

/// Per-category generator token caps plus the daily total.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenBudgets {
    pub conversation: u32,
    pub impulse: u32,
    pub heartbeat: u32,
    pub reflection: u32,
    pub consolidation: u32,
    /// Daily cap across all categories; 0 disables (`SOUL_DAILY_TOKEN_BUDGET`).
    pub daily: u64,
}

impl Default for TokenBudgets {
    fn default() -> Self {
        Self {
            conversation: 2048,
            impulse: 512,
            heartbeat: 1024,
            reflection: 1024,
            consolidation: 1024,
            daily: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SafetyConfig {
    /// Enable output authenticity checks (`SOUL_ANTI_PERFORMANCE`).
    pub anti_performance: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub soul: SoulConfig,
    pub bus: BusConfig,
    pub impulse: ImpulseConfig,
    pub consolidator: ConsolidatorConfig,
    pub versioning: VersioningConfig,
    pub reflection: ReflectionConfig,
    pub heartbeat: HeartbeatConfig,
    pub budgets: TokenBudgets,
    pub safety: SafetyConfig,
}

impl EngineConfig {
    /// Load `soul.toml` (missing file yields defaults), then apply the
    /// `SOUL_*` / `IMPULSE_*` / `HEARTBEAT_CRON` environment variables.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }
        config.apply_env();
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn soul_root(&self) -> PathBuf {
        PathBuf::from(&self.soul.root)
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_bool("SOUL_BUS_DEBUG") {
            self.bus.debug = v;
        }
        if let Some(v) = env_bool("SOUL_IMPULSE") {
            self.impulse.enabled = v;
        }
        if let Some(v) = env_bool("SOUL_CONSOLIDATOR") {
            self.consolidator.enabled = v;
        }
        if let Some(v) = env_bool("SOUL_VERSIONING") {
            self.versioning.enabled = v;
        }
        if let Some(v) = env_bool("SOUL_ANTI_PERFORMANCE") {
            self.safety.anti_performance = v;
        }
        if let Some(v) = env_bool("SOUL_REFLECTION") {
            self.reflection.enabled = v;
        }
        if let Some(v) = env_parse::<u32>("SOUL_REFLECTION_LLM_BUDGET") {
            self.reflection.llm_budget = v;
        }
        if let Some(v) = env_parse::<u32>("SOUL_TOKEN_BUDGET_CONVERSATION") {
            self.budgets.conversation = v;
        }
        if let Some(v) = env_parse::<u32>("SOUL_TOKEN_BUDGET_IMPULSE") {
            self.budgets.impulse = v;
        }
        if let Some(v) = env_parse::<u32>("SOUL_TOKEN_BUDGET_HEARTBEAT") {
            self.budgets.heartbeat = v;
        }
        if let Some(v) = env_parse::<u32>("SOUL_TOKEN_BUDGET_REFLECTION") {
            self.budgets.reflection = v;
        }
        if let Some(v) = env_parse::<u32>("SOUL_TOKEN_BUDGET_CONSOLIDATION") {
            self.budgets.consolidation = v;
        }
        if let Some(v) = env_parse::<u64>("SOUL_DAILY_TOKEN_BUDGET") {
            self.budgets.daily = v;
        }
        if let Some(v) = env_parse::<u64>("IMPULSE_MIN_DELAY") {
            self.impulse.min_delay_secs = v;
        }
        if let Some(v) = env_parse::<u64>("IMPULSE_MAX_DELAY") {
            self.impulse.max_delay_secs = v;
        }
        if let Some(v) = env_parse::<u8>("IMPULSE_NIGHT_START") {
            self.impulse.night_start_hour = v;
        }
        if let Some(v) = env_parse::<u8>("IMPULSE_NIGHT_END") {
            self.impulse.night_end_hour = v;
        }
        if let Ok(v) = env::var("HEARTBEAT_CRON") {
            if !v.trim().is_empty() {
                self.heartbeat.cron = v;
            }
        }
        if let Ok(v) = env::var("SOUL_ROOT") {
            if !v.trim().is_empty() {
                self.soul.root = v;
            }
        }
    }

    /// The secret-encryption key, read lazily so `rotate-key` can observe a
    /// freshly exported value without reloading the whole config.
    pub fn secret_key() -> Option<String> {
        env::var("SOUL_SECRET_KEY").ok().filter(|v| !v.is_empty())
    }
}

fn env_bool(key: &str) -> Option<bool> {
    env::var(key).ok().and_then(|v| parse_bool(&v))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_documented_values() {
        let config = EngineConfig::default();
        assert!(config.impulse.enabled);
        assert!(config.consolidator.enabled);
        assert!(config.versioning.enabled);
        assert_eq!(config.impulse.tick_secs, 120);
        assert_eq!(config.versioning.debounce_secs, 60);
        assert_eq!(config.budgets.daily, 0);
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("Off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("soul.toml");

        let mut config = EngineConfig::default();
        config.soul.name = "Ember".to_string();
        config.impulse.min_delay_secs = 600;
        config.save_to(&path).unwrap();

        let loaded = EngineConfig::load_from(&path).unwrap();
        assert_eq!(loaded.soul.name, "Ember");
        assert_eq!(loaded.impulse.min_delay_secs, 600);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let loaded = EngineConfig::load_from("/nonexistent/soul.toml").unwrap();
        assert_eq!(loaded.soul.name, "Soul");
    }
}
