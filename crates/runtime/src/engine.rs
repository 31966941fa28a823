use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};

use soul_affect::AffectState;
use soul_audit::AuditLogger;
use soul_bus::{kinds, EventBus};
use soul_config::EngineConfig;
use soul_consolidator::Consolidator;
use soul_generator::{CostTracker, Generator};
use soul_impulse::{DeliveryAdapter, ImpulseScheduler};
use soul_seed::SeedStore;
use soul_versioner::Versioner;

pub const SESSION_GUARD_FILE: &str = ".session-active";

/// Event kinds the affective state reacts to with fixed nudges.
const AFFECT_REACT_KINDS: &[&str] = &[
    kinds::MESSAGE_RECEIVED,
    kinds::HEARTBEAT_COMPLETED,
    kinds::PERFORMANCE_DETECTED,
    kinds::INTEREST_DETECTED,
    kinds::REFLECTION_COMPLETED,
    kinds::RLUF_FEEDBACK,
    kinds::IMPULSE_FIRED,
    kinds::CORRECTION_APPLIED,
];

/// The process-scoped owner of every core subsystem.
pub struct EngineContext {
    pub config: EngineConfig,
    pub bus: EventBus,
    pub affect: Arc<Mutex<AffectState>>,
    pub seed: Arc<SeedStore>,
    pub versioner: Versioner,
    pub cost: Arc<CostTracker>,
    pub consolidator: Arc<Consolidator>,
    pub impulse: Arc<ImpulseScheduler>,
    pub audit: AuditLogger,
    root: PathBuf,
    shutdown_tx: watch::Sender<bool>,
}

impl EngineContext {
    /// Wire the engine. Refuses to run without an identity document — that
    /// is a fatal condition, not a recoverable one.
    pub async fn init(
        config: EngineConfig,
        generator: Arc<dyn Generator>,
        delivery: Arc<dyn DeliveryAdapter>,
    ) -> Result<Arc<Self>> {
        let root = config.soul_root();
        let seed_path = root.join("SEED.md");
        if !seed_path.exists() {
            bail!(
                "identity document missing at {} — refusing to run",
                seed_path.display()
            );
        }

        let bus = EventBus::with_journal(&root, config.bus.debug);
        info!(debug = config.bus.debug, "[bus] journal at .soul-events/current.jsonl");

        let audit = AuditLogger::new(&root);
        audit.attach(&bus);

        // Migrate an old-format seed before anything reads it.
        let migration = soul_seed::migrate_if_needed(&seed_path)
            .context("seed migration failed")?;
        if migration.migrated {
            bus.emit_from(
                kinds::SEED_MIGRATED,
                "seed",
                json!({"from": migration.from, "to": migration.to}),
            );
        }

        let seed = Arc::new(SeedStore::new(&seed_path));

        let affect = Arc::new(Mutex::new(AffectState::load(&root)));
        for kind in AFFECT_REACT_KINDS {
            let affect = affect.clone();
            let bus_for_handler = bus.clone();
            bus.on(kind, move |event| {
                let mut state = affect.lock().unwrap_or_else(|e| e.into_inner());
                state.apply_event(&event.kind, &bus_for_handler);
                Ok(())
            });
        }
        let mood_label = affect
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .mood()
            .label
            .clone();
        info!(mood = %mood_label, "[affect] state ready");

        let versioner = Versioner::new(
            &root,
            bus.clone(),
            Duration::from_secs(config.versioning.debounce_secs),
        );
        if config.versioning.enabled {
            versioner.init().await.context("versioner init failed")?;
            info!(debounce_secs = config.versioning.debounce_secs, "[versioner] active");
        } else {
            info!("[versioner] disabled");
        }

        let cost = Arc::new(CostTracker::new(
            generator,
            bus.clone(),
            &root,
            config.budgets.daily,
        ));
        info!(daily_budget = config.budgets.daily, "[cost] tracker ready");

        let consolidator = Consolidator::new(
            bus.clone(),
            &root,
            seed.clone(),
            versioner.clone(),
            cost.clone(),
        );
        consolidator.attach();
        info!(enabled = config.consolidator.enabled, "[consolidator] ready");

        let impulse = Arc::new(ImpulseScheduler::new(
            bus.clone(),
            config.impulse.clone(),
            &root,
            cost.clone(),
            seed.clone(),
            delivery,
            config.budgets.impulse,
        ));
        info!(
            enabled = config.impulse.enabled,
            tick_secs = config.impulse.tick_secs,
            "[impulse] scheduler ready"
        );

        let (shutdown_tx, _) = watch::channel(false);
        let engine = Arc::new(Self {
            config,
            bus,
            affect,
            seed,
            versioner,
            cost,
            consolidator,
            impulse,
            audit,
            root,
            shutdown_tx,
        });

        engine.check_session_guard();
        engine.bump_session_counter();
        Ok(engine)
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Start every loop the configuration enables. Returns immediately; the
    /// loops run until [`EngineContext::shutdown`].
    pub fn spawn_loops(self: &Arc<Self>) {
        tokio::spawn(crate::loops::tick_loop(
            self.clone(),
            self.shutdown_signal(),
        ));
        if self.config.impulse.enabled {
            tokio::spawn(crate::loops::fire_loop(
                self.clone(),
                self.shutdown_signal(),
            ));
        }
        tokio::spawn(crate::loops::heartbeat_loop(
            self.clone(),
            self.shutdown_signal(),
        ));
        if self.config.reflection.enabled {
            tokio::spawn(crate::loops::reflection_loop(
                self.clone(),
                self.shutdown_signal(),
            ));
        }
    }

    /// Cooperative shutdown in the documented order: stop timers, one last
    /// deep consolidation, versioner flush + session end, journal drain.
    pub async fn shutdown(&self) {
        info!("[engine] shutting down");
        let _ = self.shutdown_tx.send(true);

        if self.config.consolidator.enabled {
            let affect = self.affect_snapshot();
            if let Err(err) = self.consolidator.consolidate_deep(&affect).await {
                warn!(error = %err, "[engine] final consolidation failed");
            }
        }

        if self.config.versioning.enabled {
            self.versioner.shutdown().await;
        }

        self.cost.flush();
        self.bus.drain_journal().await;

        let _ = std::fs::remove_file(self.root.join(SESSION_GUARD_FILE));
        info!("[engine] shutdown complete");
    }

    /// A clone of the current affective state, for readers.
    pub fn affect_snapshot(&self) -> AffectState {
        self.affect.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn check_session_guard(&self) {
        let guard = self.root.join(SESSION_GUARD_FILE);
        if guard.exists() {
            warn!("[engine] session guard present — previous run ended uncleanly");
            self.bus.emit_from(
                kinds::SESSION_GUARD_WARNING,
                "engine",
                json!({"guard": guard.display().to_string()}),
            );
        }
        if let Err(err) = std::fs::write(&guard, format!("{}\n", std::process::id())) {
            warn!(error = %err, "[engine] could not write session guard");
        }
    }

    /// Session counter lives in the seed header; one increment per start.
    fn bump_session_counter(&self) {
        let result = self.seed.read_raw().map(|raw| {
            let sessions = soul_seed::SeedDocument::parse(&raw)
                .map(|d| d.sessions)
                .unwrap_or(0);
            soul_seed::update_header(
                &raw,
                &Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
                sessions + 1,
            )
        });
        match result {
            Ok(updated) => {
                if let Err(err) = self.seed.persist(&updated) {
                    warn!(error = %err, "[engine] session counter bump rejected");
                }
            }
            Err(err) => warn!(error = %err, "[engine] could not read seed for session bump"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use soul_generator::MockGenerator;
    use soul_impulse::NullDelivery;

    async fn engine(dir: &std::path::Path) -> Arc<EngineContext> {
        std::fs::write(dir.join("SEED.md"), soul_seed::sample_seed()).unwrap();
        let mut config = EngineConfig::default();
        config.soul.root = dir.display().to_string();
        EngineContext::init(
            config,
            Arc::new(MockGenerator::new()),
            Arc::new(NullDelivery),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn init_refuses_to_run_without_seed() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.soul.root = dir.path().display().to_string();
        let result = EngineContext::init(
            config,
            Arc::new(MockGenerator::new()),
            Arc::new(NullDelivery),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn init_bumps_session_counter_and_writes_guard() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = engine(dir.path()).await;

        let doc = ctx.seed.read().unwrap();
        assert_eq!(doc.sessions, 43); // fixture starts at 42
        assert!(dir.path().join(SESSION_GUARD_FILE).exists());
    }

    #[tokio::test]
    async fn stale_guard_emits_warning_event() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SESSION_GUARD_FILE), "1234\n").unwrap();
        let ctx = engine(dir.path()).await;

        assert!(ctx
            .bus
            .recent(50)
            .iter()
            .any(|p| p.kind == "session.guard_warning"));
    }

    #[tokio::test]
    async fn shutdown_removes_guard_and_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = engine(dir.path()).await;
        assert!(dir.path().join(SESSION_GUARD_FILE).exists());

        ctx.shutdown().await;
        assert!(!dir.path().join(SESSION_GUARD_FILE).exists());
    }

    #[tokio::test]
    async fn message_event_nudges_affect_through_the_bus() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = engine(dir.path()).await;

        let before = ctx
            .affect_snapshot()
            .field()
            .get(soul_affect::Dimension::SocialOrientation);
        ctx.bus
            .emit_from(kinds::MESSAGE_RECEIVED, "test", json!({"user": "d"}));
        let after = ctx
            .affect_snapshot()
            .field()
            .get(soul_affect::Dimension::SocialOrientation);
        assert!(after > before);
    }
}
