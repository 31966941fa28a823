//! The seed consolidator — incremental compression of the identity document.
//!
//! Listens to the bus, accumulates a dirty-block set, and rewrites the seed
//! in two modes: a fast pass that runs pure mechanical templaters, and a
//! deep pass that additionally asks the generator to rewrite `@STATE` and
//! condense `@MEM` under strict rules. Every write goes through validation;
//! a failed write triggers recovery from version history, and repeated
//! failures lock the consolidator to mechanical-only mode.

mod dirty;
mod templates;

pub use dirty::{blocks_for_event, DirtyState, DIRTY_TABLE};
pub use templates::{interests_template, state_template, MECHANICAL_BLOCKS};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use soul_affect::AffectState;
use soul_bus::{kinds, EventBus};
use soul_generator::{CostCategory, CostTracker, GenerateOptions};
use soul_seed::{replace_blocks, update_header, SeedStore};
use soul_versioner::Versioner;

/// Deep failures tolerated before entering mechanical-only mode.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

const DEEP_TOKEN_BUDGET: u32 = 1024;
const NOTES_TAIL_BYTES: usize = 2048;
const MEM_MAX_LINES: usize = 30;

/// What `should_consolidate` decided for this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Deep,
    Fast,
    None,
}

pub struct Consolidator {
    bus: EventBus,
    root: PathBuf,
    seed: Arc<SeedStore>,
    versioner: Versioner,
    cost: Arc<CostTracker>,
    dirty: Arc<Mutex<DirtyState>>,
    consolidating: AtomicBool,
    consecutive_failures: AtomicU32,
    mechanical_only: AtomicBool,
    recovery_mode_emitted: AtomicBool,
}

impl Consolidator {
    pub fn new(
        bus: EventBus,
        root: impl Into<PathBuf>,
        seed: Arc<SeedStore>,
        versioner: Versioner,
        cost: Arc<CostTracker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            root: root.into(),
            seed,
            versioner,
            cost,
            dirty: Arc::new(Mutex::new(DirtyState::default())),
            consolidating: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            mechanical_only: AtomicBool::new(false),
            recovery_mode_emitted: AtomicBool::new(false),
        })
    }

    /// Subscribe to every event kind in the dirty table.
    pub fn attach(self: &Arc<Self>) {
        for (kind, _) in DIRTY_TABLE {
            let dirty = self.dirty.clone();
            self.bus.on(kind, move |event| {
                let mut state = dirty.lock().unwrap_or_else(|e| e.into_inner());
                state.record_event(&event.kind);
                Ok(())
            });
        }
        info!(kinds = DIRTY_TABLE.len(), "[consolidator] attached to bus");
    }

    pub fn dirty_snapshot(&self) -> DirtyState {
        self.dirty.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_mechanical_only(&self) -> bool {
        self.mechanical_only.load(Ordering::SeqCst)
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Operator escape hatch: leave mechanical-only mode.
    pub fn reset_recovery_state(&self) {
        self.mechanical_only.store(false, Ordering::SeqCst);
        self.recovery_mode_emitted.store(false, Ordering::SeqCst);
        self.consecutive_failures.store(0, Ordering::SeqCst);
        info!("[consolidator] recovery state reset by operator");
    }

    /// Polled from the scheduler tick.
    pub fn should_consolidate(&self) -> Decision {
        let now = Utc::now().timestamp_millis();
        let state = self.dirty.lock().unwrap_or_else(|e| e.into_inner());
        state.decide(now)
    }

    /// Mark specific blocks dirty out-of-band (used by recovery tests and
    /// adapter hooks).
    pub fn mark_dirty(&self, blocks: &[&str]) {
        let mut state = self.dirty.lock().unwrap_or_else(|e| e.into_inner());
        for block in blocks {
            state.dirty_blocks.insert(block.to_string());
        }
    }

    /// Fast pass: mechanical templaters only. Returns `false` when another
    /// pass held the writer flag.
    pub async fn consolidate_fast(&self, affect: &AffectState) -> Result<bool> {
        if self.consolidating.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        let result = self.fast_locked(affect).await;
        self.consolidating.store(false, Ordering::SeqCst);
        result.map(|_| true)
    }

    /// Deep pass: fast templaters, then generator-assisted STATE and MEM
    /// rewrites unless mechanical-only mode is active.
    pub async fn consolidate_deep(&self, affect: &AffectState) -> Result<bool> {
        if self.consolidating.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        let result = self.deep_locked(affect).await;
        self.consolidating.store(false, Ordering::SeqCst);
        result.map(|_| true)
    }

    async fn fast_locked(&self, affect: &AffectState) -> Result<()> {
        let dirty_blocks: Vec<String> = {
            let state = self.dirty.lock().unwrap_or_else(|e| e.into_inner());
            state
                .dirty_blocks
                .iter()
                .filter(|b| MECHANICAL_BLOCKS.contains(&b.as_str()))
                .cloned()
                .collect()
        };

        let raw = self.seed.read_raw()?;
        let mut replacements: Vec<(&str, String)> = Vec::new();
        for block in &dirty_blocks {
            match block.as_str() {
                "STATE" => replacements.push(("STATE", templates::state_template(affect))),
                "INTERESTS" => {
                    if let Some(body) = templates::interests_template(&self.root) {
                        replacements.push(("INTERESTS", body));
                    }
                }
                _ => {}
            }
        }

        let updated = replace_blocks(&raw, replacements);
        let updated = update_header(
            &updated,
            &Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            soul_seed::SeedDocument::parse(&raw).map(|d| d.sessions).unwrap_or(0),
        );

        match self.seed.persist(&updated) {
            Ok(validation) => {
                for warning in &validation.warnings {
                    warn!(%warning, "[consolidator] seed size warning");
                }
                let mut state = self.dirty.lock().unwrap_or_else(|e| e.into_inner());
                state.complete_fast(Utc::now().timestamp_millis(), &dirty_blocks);
                drop(state);
                self.versioner.queue("seed", "fast consolidation");
                info!(blocks = ?dirty_blocks, "[consolidator] fast pass persisted");
                Ok(())
            }
            Err(err) => {
                self.handle_write_failure("fast", &err).await;
                Err(err.into())
            }
        }
    }

    async fn deep_locked(&self, affect: &AffectState) -> Result<()> {
        // The deep pass always begins with the mechanical templaters.
        self.fast_locked(affect).await?;

        if self.mechanical_only.load(Ordering::SeqCst) {
            info!("[consolidator] mechanical-only mode, skipping generator");
            return Ok(());
        }

        let raw = self.seed.read_raw()?;
        let doc = soul_seed::SeedDocument::parse(&raw)?;
        let notes = read_notes_tail(&self.root);

        let state_body = match self.generate_state(&doc, affect, &notes).await {
            Ok(body) => body,
            Err(err) => {
                self.advance_failures("state rewrite", &err);
                return Err(err);
            }
        };
        let mem_body = match self.generate_mem(&doc, &notes).await {
            Ok(body) => body,
            Err(err) => {
                self.advance_failures("mem condense", &err);
                return Err(err);
            }
        };

        let updated = replace_blocks(
            &raw,
            [("STATE", state_body), ("MEM", mem_body)],
        );
        let updated = update_header(
            &updated,
            &Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            doc.sessions,
        );

        match self.seed.persist(&updated) {
            Ok(_) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                let mut state = self.dirty.lock().unwrap_or_else(|e| e.into_inner());
                state.complete_deep(Utc::now().timestamp_millis());
                drop(state);
                self.versioner.queue("seed", "deep consolidation");
                info!("[consolidator] deep pass persisted");
                Ok(())
            }
            Err(err) => {
                self.handle_write_failure("deep", &err).await;
                Err(err.into())
            }
        }
    }

    async fn generate_state(
        &self,
        doc: &soul_seed::SeedDocument,
        affect: &AffectState,
        notes: &str,
    ) -> Result<String> {
        let current = doc.block("STATE").map(|b| b.body()).unwrap_or_default();
        let consciousness = std::fs::read_to_string(self.root.join("consciousness.md"))
            .unwrap_or_default();
        let mood = affect.mood();

        let system = "You maintain the @STATE block of a compressed identity document. \
                      Reply with the new block body only: key:value segments separated by `|` \
                      within a line, one aspect per line. Include exactly the lines \
                      mood, focus and condition. Never emit the @STATE{...} wrapper."
            .to_string();
        let user = format!(
            "Current @STATE:\n{current}\n\nConsciousness notes:\n{consciousness}\n\n\
             Today's notes (tail):\n{notes}\n\n\
             Mood: {} (valence {:.2}, energy {:.2})\nField: {}",
            mood.label,
            mood.valence,
            mood.energy,
            affect.field().summary(),
        );

        let reply = self
            .cost
            .generate(
                CostCategory::Consolidation,
                &system,
                &[],
                &user,
                &GenerateOptions::with_budget(DEEP_TOKEN_BUDGET),
            )
            .await?;
        Ok(strip_block_wrapper(&reply, "STATE"))
    }

    async fn generate_mem(&self, doc: &soul_seed::SeedDocument, notes: &str) -> Result<String> {
        let current = doc.block("MEM").map(|b| b.body()).unwrap_or_default();

        let system = format!(
            "You condense the @MEM block of a compressed identity document. Rules: \
             never modify [core] entries; entries with r>3 are near-immutable and may \
             only be archived with strong cause; increment r when an entry's subject \
             recurs in the notes; insert new [active|c:0.5|r:1] entries for meaningful \
             events; drop [active] entries with c<0.3 and r<2 older than a month; keep \
             the block under {MEM_MAX_LINES} lines. Reply with the block body only, one \
             tagged entry per line."
        );
        let user = format!("Current @MEM:\n{current}\n\nToday's notes:\n{notes}");

        let reply = self
            .cost
            .generate(
                CostCategory::Consolidation,
                &system,
                &[],
                &user,
                &GenerateOptions::with_budget(DEEP_TOKEN_BUDGET),
            )
            .await?;
        Ok(strip_block_wrapper(&reply, "MEM"))
    }

    /// A write was rejected by validation: publish, recover, advance the
    /// failure counter.
    async fn handle_write_failure(&self, pass: &str, err: &soul_seed::SeedError) {
        warn!(pass, error = %err, "[consolidator] write rejected");
        self.bus.emit_from(
            kinds::SEED_VALIDATION_FAILED,
            "consolidator",
            json!({"pass": pass, "error": err.to_string()}),
        );

        if let Err(recover_err) = self.versioner.recover_last_valid(&self.seed).await {
            warn!(error = %recover_err, "[consolidator] recovery failed");
        }
        self.advance_failures(pass, &anyhow::anyhow!("{err}"));
    }

    fn advance_failures(&self, pass: &str, err: &anyhow::Error) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(pass, failures, error = %err, "[consolidator] failure counter advanced");

        if failures >= MAX_CONSECUTIVE_FAILURES
            && !self.mechanical_only.swap(true, Ordering::SeqCst)
            && !self.recovery_mode_emitted.swap(true, Ordering::SeqCst)
        {
            warn!("[consolidator] entering mechanical-only mode");
            self.bus.emit_from(
                kinds::SEED_RECOVERY_MODE_ENTERED,
                "consolidator",
                json!({"failures": failures}),
            );
        }
    }
}

/// Last 2 KiB of today's notes, when the adapters have written any.
fn read_notes_tail(root: &std::path::Path) -> String {
    let path = root
        .join("memory")
        .join(format!("{}.md", Utc::now().format("%Y-%m-%d")));
    let raw = std::fs::read_to_string(path).unwrap_or_default();
    if raw.len() <= NOTES_TAIL_BYTES {
        return raw;
    }
    let mut start = raw.len() - NOTES_TAIL_BYTES;
    while start < raw.len() && !raw.is_char_boundary(start) {
        start += 1;
    }
    raw[start..].to_string()
}

/// Generators sometimes echo the `@NAME{…}` wrapper back; strip it.
fn strip_block_wrapper(reply: &str, name: &str) -> String {
    let trimmed = reply.trim();
    let prefix = format!("@{name}{{");
    if let Some(rest) = trimmed.strip_prefix(&prefix) {
        if let Some(inner) = rest.strip_suffix('}') {
            return inner.trim_matches('\n').to_string();
        }
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use soul_seed::{replace_block, sample_seed, SeedDocument};

    async fn setup(dir: &std::path::Path) -> (Arc<Consolidator>, Arc<soul_generator::MockGenerator>, EventBus) {
        std::fs::write(dir.join("SEED.md"), sample_seed()).unwrap();
        let bus = EventBus::new();
        let mock = Arc::new(soul_generator::MockGenerator::new());
        let cost = Arc::new(CostTracker::new(mock.clone(), bus.clone(), dir, 0));
        let seed = Arc::new(SeedStore::new(dir.join("SEED.md")));
        let versioner = Versioner::new(dir, bus.clone(), std::time::Duration::from_millis(50));
        versioner.init().await.unwrap();
        let consolidator = Consolidator::new(bus.clone(), dir, seed, versioner, cost);
        consolidator.attach();
        (consolidator, mock, bus)
    }

    #[tokio::test]
    async fn events_dirty_blocks_per_table() {
        let dir = tempfile::tempdir().unwrap();
        let (consolidator, _mock, bus) = setup(dir.path()).await;

        bus.emit(kinds::MESSAGE_RECEIVED, json!({}));
        bus.emit(kinds::INTEREST_DETECTED, json!({}));

        let snapshot = consolidator.dirty_snapshot();
        assert!(snapshot.dirty_blocks.contains("MEM"));
        assert!(snapshot.dirty_blocks.contains("BONDS"));
        assert!(snapshot.dirty_blocks.contains("INTERESTS"));
        assert_eq!(snapshot.events_since_fast, 2);
        assert_eq!(snapshot.events_since_deep, 2);
    }

    #[tokio::test]
    async fn fast_pass_rewrites_state_and_updates_header() {
        let dir = tempfile::tempdir().unwrap();
        let (consolidator, mock, _bus) = setup(dir.path()).await;
        let affect = AffectState::default();

        consolidator.mark_dirty(&["STATE"]);
        assert!(consolidator.consolidate_fast(&affect).await.unwrap());

        let raw = std::fs::read_to_string(dir.path().join("SEED.md")).unwrap();
        let doc = SeedDocument::parse(&raw).unwrap();
        assert!(doc.block("STATE").unwrap().fields.contains_key("mood"));
        // Mechanical pass never touches the model.
        assert_eq!(mock.call_count(), 0);
        // Dirty set consumed.
        assert!(!consolidator.dirty_snapshot().dirty_blocks.contains("STATE"));
    }

    #[tokio::test]
    async fn validation_failure_triggers_recovery_from_history() {
        let dir = tempfile::tempdir().unwrap();
        let (consolidator, _mock, bus) = setup(dir.path()).await;
        let affect = AffectState::default();

        // Three valid revisions: founding (A), B, C.
        let b = replace_block(&sample_seed(), "STATE", "mood:warm");
        std::fs::write(dir.path().join("SEED.md"), &b).unwrap();
        consolidator.versioner.commit("[seed] revision B").await.unwrap();
        let c = replace_block(&sample_seed(), "STATE", "mood:steady");
        std::fs::write(dir.path().join("SEED.md"), &c).unwrap();
        consolidator.versioner.commit("[seed] revision C").await.unwrap();

        // Corrupt the working tree: no @KERN. The fast pass parses it, but
        // validation rejects the rewrite and recovery must restore C.
        let broken = c.replace("@KERN{", "@KORN{");
        std::fs::write(dir.path().join("SEED.md"), &broken).unwrap();
        consolidator.seed.invalidate();

        consolidator.mark_dirty(&["STATE"]);
        let result = consolidator.consolidate_fast(&affect).await;
        assert!(result.is_err());

        let restored = std::fs::read_to_string(dir.path().join("SEED.md")).unwrap();
        assert_eq!(restored, c);

        let recent = bus.recent(40);
        assert!(recent.iter().any(|p| p.kind == "seed.validation-failed"));
        assert_eq!(
            recent.iter().filter(|p| p.kind == "seed.recovered").count(),
            1
        );
    }

    #[tokio::test]
    async fn deep_pass_rewrites_state_and_mem_via_generator() {
        let dir = tempfile::tempdir().unwrap();
        let (consolidator, mock, _bus) = setup(dir.path()).await;
        let affect = AffectState::default();

        mock.push_reply("@STATE{\nmood:calm | focus:writing\ncondition:settled\n}");
        mock.push_reply(
            "[core|c:1.0|r:9] founding conversation with D\n[active|c:0.5|r:1] learning rust lifetimes",
        );

        assert!(consolidator.consolidate_deep(&affect).await.unwrap());
        assert_eq!(mock.call_count(), 2);

        let raw = std::fs::read_to_string(dir.path().join("SEED.md")).unwrap();
        let doc = SeedDocument::parse(&raw).unwrap();
        // Wrapper stripped, body landed.
        assert_eq!(doc.block("STATE").unwrap().fields["focus"], "writing");
        assert_eq!(doc.mem_entries().len(), 2);
        assert_eq!(consolidator.failure_count(), 0);
    }

    #[tokio::test]
    async fn three_failures_lock_to_mechanical_only() {
        let dir = tempfile::tempdir().unwrap();
        let (consolidator, mock, bus) = setup(dir.path()).await;
        let affect = AffectState::default();

        for _ in 0..MAX_CONSECUTIVE_FAILURES {
            mock.push_failure("generator down");
            let result = consolidator.consolidate_deep(&affect).await;
            assert!(result.is_err());
        }

        assert!(consolidator.is_mechanical_only());
        let entered = bus
            .recent(60)
            .into_iter()
            .filter(|p| p.kind == "seed.recovery-mode-entered")
            .count();
        assert_eq!(entered, 1);

        // Subsequent deep passes only run the fast templaters.
        let calls_before = mock.call_count();
        assert!(consolidator.consolidate_deep(&affect).await.unwrap());
        assert_eq!(mock.call_count(), calls_before);

        // Operator reset reopens the generator path.
        consolidator.reset_recovery_state();
        assert!(!consolidator.is_mechanical_only());
        assert_eq!(consolidator.failure_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_passes_are_no_ops() {
        let dir = tempfile::tempdir().unwrap();
        let (consolidator, _mock, _bus) = setup(dir.path()).await;

        consolidator.consolidating.store(true, Ordering::SeqCst);
        let affect = AffectState::default();
        assert!(!consolidator.consolidate_fast(&affect).await.unwrap());
        assert!(!consolidator.consolidate_deep(&affect).await.unwrap());
    }

    #[test]
    fn wrapper_stripping() {
        assert_eq!(strip_block_wrapper("@STATE{\nmood:calm\n}", "STATE"), "mood:calm");
        assert_eq!(strip_block_wrapper("mood:calm", "STATE"), "mood:calm");
    }
}
