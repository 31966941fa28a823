use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::field::{AllostaticField, DriftContext};
use crate::mood::{Mood, MoodEngine, MoodUpdate};
use soul_bus::{throttle, EventBus};

const STATE_FILE: &str = ".soul-allostatic-field";
const PROJECTION_FILE: &str = ".soul-field";

/// The combined affective state: mood machine plus allostatic field.
///
/// The runtime owns exactly one of these behind its affect lock; everything
/// else sees snapshots. Checkpointed on every tick to the authoritative
/// state file and the observer projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffectState {
    mood: MoodEngine,
    field: AllostaticField,
}

impl Default for AffectState {
    fn default() -> Self {
        Self {
            mood: MoodEngine::default(),
            field: AllostaticField::default(),
        }
    }
}

impl AffectState {
    /// Load the checkpoint from `<root>/.soul-allostatic-field`, falling
    /// back to defaults when the file is missing or corrupt.
    pub fn load(root: &Path) -> Self {
        let path = root.join(STATE_FILE);
        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(state) => {
                    info!(path = %path.display(), "[affect] state restored");
                    state
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "[affect] corrupt checkpoint, using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn mood(&self) -> &Mood {
        self.mood.mood()
    }

    pub fn field(&self) -> &AllostaticField {
        &self.field
    }

    /// Route a mood nudge through the clamp pipeline and keep the slaved
    /// field dimensions in step.
    pub fn update_mood(&mut self, dv: f64, de: f64, trigger: &str, bus: &EventBus) -> MoodUpdate {
        let update = self.mood.update(dv, de, trigger, bus);
        self.field.sync_with_mood(self.mood.mood());
        update
    }

    /// React to a bus event: fixed field nudges plus the mood deltas a few
    /// kinds carry.
    pub fn apply_event(&mut self, kind: &str, bus: &EventBus) {
        self.field.apply_event(kind);
        match kind {
            soul_bus::kinds::MESSAGE_RECEIVED => {
                self.update_mood(0.02, 0.05, kind, bus);
            }
            soul_bus::kinds::RLUF_FEEDBACK => {
                self.update_mood(0.05, 0.0, kind, bus);
            }
            soul_bus::kinds::PERFORMANCE_DETECTED => {
                self.update_mood(-0.05, 0.0, kind, bus);
            }
            _ => {}
        }
    }

    /// One drift tick: advance the mood tick window, drift the field, and
    /// re-slave the mood dimensions.
    pub fn drift_tick(&mut self, ctx: DriftContext) {
        self.mood.tick();
        self.field.drift_tick(ctx);
        self.field.sync_with_mood(self.mood.mood());
    }

    /// Best-effort checkpoint of both files. Never fails the caller.
    pub fn checkpoint(&self, root: &Path) {
        write_best_effort(&root.join(STATE_FILE), || {
            serde_json::to_string(self).map_err(Into::into)
        });
        write_best_effort(&root.join(PROJECTION_FILE), || {
            serde_json::to_string_pretty(&self.field.snapshot()).map_err(Into::into)
        });
    }
}

fn write_best_effort(path: &PathBuf, render: impl FnOnce() -> anyhow::Result<String>) {
    let result = render().and_then(|body| std::fs::write(path, body).map_err(Into::into));
    if let Err(err) = result {
        throttle::log_write_error(path, &format!("{err:#}"));
    }
}
