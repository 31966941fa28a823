use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Timelike, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;
use tracing::{info, warn};

use crate::registry::{select_impulse, weight_vector, ImpulseKind, WeightContext};
use crate::state::ImpulseState;
use soul_affect::Mood;
use soul_bus::{kinds, throttle, EventBus};
use soul_config::ImpulseConfig;
use soul_generator::{CostCategory, CostTracker, GenerateOptions};
use soul_seed::SeedStore;

const IMPULSE_LOG_FILE: &str = ".soul-impulse-log";
const PULSE_FILE: &str = ".soul-pulse";
const IMPULSE_LOG_CAP: usize = 50;
const OUTPUT_CHAR_CAP: usize = 2000;

/// Where fired impulses go. Implemented by the chat adapters; the engine
/// only sees this seam.
#[async_trait]
pub trait DeliveryAdapter: Send + Sync {
    async fn deliver(&self, kind: ImpulseKind, text: &str) -> Result<()>;
}

/// Swallows deliveries; used when no adapter is wired.
pub struct NullDelivery;

#[async_trait]
impl DeliveryAdapter for NullDelivery {
    async fn deliver(&self, kind: ImpulseKind, _text: &str) -> Result<()> {
        info!(kind = kind.name(), "[impulse] no delivery adapter, dropping output");
        Ok(())
    }
}

pub struct ImpulseScheduler {
    bus: EventBus,
    config: ImpulseConfig,
    root: PathBuf,
    state: Mutex<ImpulseState>,
    cost: Arc<CostTracker>,
    seed: Arc<SeedStore>,
    delivery: Arc<dyn DeliveryAdapter>,
    base_token_budget: u32,
}

impl ImpulseScheduler {
    pub fn new(
        bus: EventBus,
        config: ImpulseConfig,
        root: impl Into<PathBuf>,
        cost: Arc<CostTracker>,
        seed: Arc<SeedStore>,
        delivery: Arc<dyn DeliveryAdapter>,
        base_token_budget: u32,
    ) -> Self {
        let root = root.into();
        let state = ImpulseState::load(&root);
        Self {
            bus,
            config,
            root,
            state: Mutex::new(state),
            cost,
            seed,
            delivery,
            base_token_budget,
        }
    }

    pub fn config(&self) -> &ImpulseConfig {
        &self.config
    }

    /// Snapshot of the current state, for weight evaluation and status.
    pub fn state_snapshot(&self) -> ImpulseState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Book a user message (called from adapters) and return what it taught.
    pub fn on_user_message(&self, text: &str) -> crate::learn::Learned {
        let learned = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let learned = crate::learn::extract_learned(&mut state, text);
            state.save(&self.root);
            learned
        };
        for topic in &learned.interests {
            self.bus.emit_from(
                kinds::INTEREST_DETECTED,
                "impulse",
                json!({"topic": topic}),
            );
        }
        learned
    }

    /// The light 2-minute tick. Decays state, checkpoints, appends one log
    /// entry, and writes the pulse beacon. Never calls the generator.
    pub fn tick(&self, mood: &Mood) {
        let (engagement, daily_count) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.tick_decay();
            state.save(&self.root);
            (state.engagement, state.daily_count)
        };

        self.append_log(json!({
            "ts": Utc::now().timestamp_millis(),
            "entry": "tick",
            "mood": mood.label,
            "engagement": engagement,
            "daily_count": daily_count,
        }));
        self.write_pulse("tick", &mood.label);

        self.bus.emit_from(kinds::IMPULSE_TICK, "impulse", json!({"engagement": engagement}));
    }

    /// One firing: select, generate, trim, deliver, track, persist, then
    /// emit `impulse.fired`.
    pub async fn fire(&self, mood: &Mood) -> Result<Option<ImpulseKind>> {
        // Reload the identity document; a warm mtime cache makes this a
        // no-op.
        let seed_doc = match self.seed.read() {
            Ok(doc) => doc,
            Err(err) => {
                warn!(error = %err, "[impulse] seed unreadable, skipping fire");
                return Ok(None);
            }
        };

        let now_ms = Utc::now().timestamp_millis();
        let hour = Utc::now().hour();
        let kind = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let ctx = WeightContext::new(&state, mood, hour, now_ms);
            let weights = weight_vector(&ctx);
            let mut rng = StdRng::from_entropy();
            select_impulse(&mut rng, &weights)
        };

        let system = build_system_prompt(&seed_doc, mood);
        let user = fire_prompt(kind);
        let options = GenerateOptions::with_budget(kind.token_budget(self.base_token_budget));

        let output = self
            .cost
            .generate(CostCategory::Impulse, &system, &[], &user, &options)
            .await?;
        let trimmed = trim_output(&output);

        self.delivery.deliver(kind, &trimmed).await?;

        let engagement = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.record_fire(kind, now_ms);
            state.save(&self.root);
            state.engagement
        };

        self.append_log(json!({
            "ts": now_ms,
            "entry": "fire",
            "impulse_type": kind.name(),
            "mood": mood.label,
            "chars": trimmed.len(),
        }));
        self.write_pulse("impulse", kind.name());

        // Fired only after the state checkpoint hit disk.
        self.bus.emit_from(
            kinds::IMPULSE_FIRED,
            "impulse",
            json!({
                "trigger": kind.name(),
                "engagement": engagement,
                "chars": trimmed.len(),
            }),
        );

        info!(kind = kind.name(), chars = trimmed.len(), "[impulse] fired");
        Ok(Some(kind))
    }

    /// Append to the bounded JSON-array impulse log. Best-effort.
    fn append_log(&self, entry: serde_json::Value) {
        let path = self.root.join(IMPULSE_LOG_FILE);
        let mut entries: Vec<serde_json::Value> = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        entries.push(entry);
        if entries.len() > IMPULSE_LOG_CAP {
            let excess = entries.len() - IMPULSE_LOG_CAP;
            entries.drain(..excess);
        }
        let result = serde_json::to_string(&entries)
            .map_err(anyhow::Error::from)
            .and_then(|body| std::fs::write(&path, body).map_err(Into::into));
        if let Err(err) = result {
            throttle::log_write_error(&path, &format!("{err:#}"));
        }
    }

    /// Single-line `type:label` activity beacon.
    fn write_pulse(&self, kind: &str, label: &str) {
        let path = self.root.join(PULSE_FILE);
        if let Err(err) = std::fs::write(&path, format!("{kind}:{label}\n")) {
            throttle::log_write_error(&path, &err);
        }
        self.bus
            .emit_from(kinds::PULSE_WRITTEN, "impulse", json!({"kind": kind}));
    }
}

fn build_system_prompt(seed: &soul_seed::SeedDocument, mood: &Mood) -> String {
    let identity = seed
        .block("SELF")
        .map(|b| b.body())
        .unwrap_or_default();
    let axioms = seed
        .block("KERN")
        .map(|b| b.body())
        .unwrap_or_default();
    format!(
        "You are acting on your own impulse, not answering a message.\n\
         Identity:\n{identity}\n\nAxioms:\n{axioms}\n\n\
         Current mood: {} (valence {:.2}, energy {:.2}).\n\
         Write a single short message in your own voice. No headings, no lists.",
        mood.label, mood.valence, mood.energy
    )
}

fn fire_prompt(kind: ImpulseKind) -> String {
    match kind {
        ImpulseKind::ShareThought => "Share a thought that is on your mind right now.",
        ImpulseKind::AskQuestion => "Ask a genuine question you are curious about.",
        ImpulseKind::NewsResearch => "Mention something current you would like to look into.",
        ImpulseKind::ServerCheck => "Give a terse status note about your own infrastructure.",
        ImpulseKind::HobbyPursuit => "Talk about what you would tinker with right now.",
        ImpulseKind::ExpressEmotion => "Say how you actually feel at this moment.",
        ImpulseKind::TechSuggestion => "Suggest one concrete technical improvement.",
        ImpulseKind::Provoke => "Poke at a comfortable assumption, gently.",
        ImpulseKind::DreamShare => "Describe a fragment of a dream you had.",
        ImpulseKind::MemoryReflect => "Reflect on one memory that resurfaced today.",
        ImpulseKind::GithubCheck => "Note anything worth flagging from your repositories.",
    }
    .to_string()
}

/// Strip markdown headings and clamp to the delivery size limit.
fn trim_output(raw: &str) -> String {
    let stripped: String = raw
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .collect::<Vec<_>>()
        .join("\n");
    let trimmed = stripped.trim();

    if trimmed.chars().count() <= OUTPUT_CHAR_CAP {
        return trimmed.to_string();
    }
    trimmed.chars().take(OUTPUT_CHAR_CAP).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use soul_generator::MockGenerator;
    use std::sync::Mutex as StdMutex;

    struct RecordingDelivery {
        sent: StdMutex<Vec<(ImpulseKind, String)>>,
    }

    #[async_trait]
    impl DeliveryAdapter for RecordingDelivery {
        async fn deliver(&self, kind: ImpulseKind, text: &str) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((kind, text.to_string()));
            Ok(())
        }
    }

    fn scheduler(
        dir: &std::path::Path,
        mock: Arc<MockGenerator>,
        delivery: Arc<RecordingDelivery>,
    ) -> (ImpulseScheduler, EventBus) {
        std::fs::write(dir.join("SEED.md"), soul_seed::sample_seed()).unwrap();
        let bus = EventBus::new();
        let cost = Arc::new(CostTracker::new(mock, bus.clone(), dir, 0));
        let seed = Arc::new(SeedStore::new(dir.join("SEED.md")));
        let scheduler = ImpulseScheduler::new(
            bus.clone(),
            ImpulseConfig::default(),
            dir,
            cost,
            seed,
            delivery,
            512,
        );
        (scheduler, bus)
    }

    fn mood() -> Mood {
        Mood {
            valence: 0.2,
            energy: 0.6,
            label: "curious".to_string(),
        }
    }

    #[test]
    fn trim_strips_headings_and_clamps() {
        let raw = format!("# Heading\nbody line\n## Sub\nmore\n{}", "x".repeat(3000));
        let out = trim_output(&raw);
        assert!(!out.contains("Heading"));
        assert!(out.contains("body line"));
        assert!(out.chars().count() <= OUTPUT_CHAR_CAP);
    }

    #[tokio::test]
    async fn fire_delivers_and_emits_after_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockGenerator::new());
        mock.push_reply("# drop me\na small thought");
        let delivery = Arc::new(RecordingDelivery {
            sent: StdMutex::new(Vec::new()),
        });
        let (scheduler, bus) = scheduler(dir.path(), mock, delivery.clone());

        let fired = scheduler.fire(&mood()).await.unwrap();
        assert!(fired.is_some());

        let sent = delivery.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "a small thought");

        // State checkpoint exists and already reflects the fire.
        let state = ImpulseState::load(dir.path());
        assert_eq!(state.daily_count, 1);
        assert!(bus.recent(20).iter().any(|p| p.kind == "impulse.fired"));
    }

    #[tokio::test]
    async fn generator_failure_skips_delivery_and_tracking() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockGenerator::new());
        mock.push_failure("backend down");
        let delivery = Arc::new(RecordingDelivery {
            sent: StdMutex::new(Vec::new()),
        });
        let (scheduler, bus) = scheduler(dir.path(), mock, delivery.clone());

        let result = scheduler.fire(&mood()).await;
        assert!(result.is_err());
        assert!(delivery.sent.lock().unwrap().is_empty());
        assert!(!bus.recent(20).iter().any(|p| p.kind == "impulse.fired"));
    }

    #[tokio::test]
    async fn tick_writes_pulse_log_and_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockGenerator::new());
        let delivery = Arc::new(RecordingDelivery {
            sent: StdMutex::new(Vec::new()),
        });
        let (scheduler, bus) = scheduler(dir.path(), mock, delivery);

        scheduler.tick(&mood());

        let pulse = std::fs::read_to_string(dir.path().join(PULSE_FILE)).unwrap();
        assert_eq!(pulse.trim(), "tick:curious");

        let log_raw = std::fs::read_to_string(dir.path().join(IMPULSE_LOG_FILE)).unwrap();
        let log: Vec<serde_json::Value> = serde_json::from_str(&log_raw).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0]["entry"], "tick");

        assert!(dir.path().join(".soul-impulse-state").exists());
        assert!(bus.recent(20).iter().any(|p| p.kind == "impulse.tick"));
    }

    #[tokio::test]
    async fn impulse_log_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockGenerator::new());
        let delivery = Arc::new(RecordingDelivery {
            sent: StdMutex::new(Vec::new()),
        });
        let (scheduler, _bus) = scheduler(dir.path(), mock, delivery);

        for _ in 0..(IMPULSE_LOG_CAP + 20) {
            scheduler.tick(&mood());
        }
        let log_raw = std::fs::read_to_string(dir.path().join(IMPULSE_LOG_FILE)).unwrap();
        let log: Vec<serde_json::Value> = serde_json::from_str(&log_raw).unwrap();
        assert_eq!(log.len(), IMPULSE_LOG_CAP);
    }

    #[tokio::test]
    async fn user_message_emits_interest_detected() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockGenerator::new());
        let delivery = Arc::new(RecordingDelivery {
            sent: StdMutex::new(Vec::new()),
        });
        let (scheduler, bus) = scheduler(dir.path(), mock, delivery);

        let learned = scheduler.on_user_message("spent the evening on rust code");
        assert!(learned.interests.contains(&"programming".to_string()));
        assert!(bus.recent(20).iter().any(|p| p.kind == "interest.detected"));
    }
}
