use std::collections::VecDeque;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::json;

use soul_bus::{kinds, EventBus};

/// Retained mood snapshots. The source carried two competing caps for this;
/// one constant rules here.
pub const MAX_MOOD_HISTORY: usize = 20;

const HOUR_MS: i64 = 60 * 60 * 1000;

/// Six quadrant families with their synonym sets. Valence splits at ±0.2,
/// energy bisects at 0.5.
const LABEL_FAMILIES: &[(&str, &[&str])] = &[
    ("positive-high", &["excited", "inspired", "playful", "radiant"]),
    ("positive-low", &["content", "serene", "warm", "mellow"]),
    ("negative-high", &["restless", "frustrated", "tense", "agitated"]),
    ("negative-low", &["melancholic", "drained", "somber", "weary"]),
    ("neutral-high", &["alert", "curious", "focused", "charged"]),
    ("neutral-low", &["calm", "quiet", "pensive", "steady"]),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mood {
    pub valence: f64,
    pub energy: f64,
    pub label: String,
}

impl Default for Mood {
    fn default() -> Self {
        Self {
            valence: 0.0,
            energy: 0.5,
            label: "calm".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoodSnapshot {
    pub ts_ms: i64,
    pub valence: f64,
    pub energy: f64,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoodParams {
    /// Per-update cap on |Δ| per axis.
    pub max_delta_per_tick: f64,
    /// Cap on the trailing 1-hour sum of |Δ| per axis.
    pub hourly_cap: f64,
    pub baseline_valence: f64,
    pub baseline_energy: f64,
    pub gravity: f64,
    /// Gravity engages only past this deviation from baseline.
    pub deviation_threshold: f64,
}

impl Default for MoodParams {
    fn default() -> Self {
        Self {
            max_delta_per_tick: 0.3,
            hourly_cap: 0.6,
            baseline_valence: 0.0,
            baseline_energy: 0.5,
            gravity: 0.02,
            deviation_threshold: 0.5,
        }
    }
}

/// Outcome of one `update` call.
#[derive(Debug, Clone)]
pub struct MoodUpdate {
    pub requested: (f64, f64),
    pub applied: (f64, f64),
    pub clamped: bool,
    pub emitted_change: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeltaEntry {
    ts: i64,
    dv: f64,
    de: f64,
}

/// Mood state machine: per-update clamp, hourly drift budget, baseline
/// gravity, and the `mood.changed` / `mood.clamped` emission rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoodEngine {
    mood: Mood,
    params: MoodParams,
    deltas: VecDeque<DeltaEntry>,
    history: VecDeque<MoodSnapshot>,
    /// Epoch ms of the last label-class change; `since` in emissions.
    since_ms: i64,
    /// Bumped once per scheduler tick; label choice is stable within a tick.
    label_seed: u64,
}

impl Default for MoodEngine {
    fn default() -> Self {
        Self::new(MoodParams::default())
    }
}

impl MoodEngine {
    pub fn new(params: MoodParams) -> Self {
        Self {
            mood: Mood::default(),
            params,
            deltas: VecDeque::new(),
            history: VecDeque::new(),
            since_ms: Utc::now().timestamp_millis(),
            label_seed: 0,
        }
    }

    pub fn mood(&self) -> &Mood {
        &self.mood
    }

    pub fn params(&self) -> &MoodParams {
        &self.params
    }

    pub fn history(&self) -> impl Iterator<Item = &MoodSnapshot> {
        self.history.iter()
    }

    /// Advance the tick counter: prunes the delta window and re-seeds the
    /// label choice so repeated derivations within one tick stay stable.
    pub fn tick(&mut self) {
        self.label_seed = self.label_seed.wrapping_add(1);
        let cutoff = Utc::now().timestamp_millis() - HOUR_MS;
        while self.deltas.front().is_some_and(|d| d.ts < cutoff) {
            self.deltas.pop_front();
        }
    }

    /// Apply a mood nudge. The requested delta is reduced first by the
    /// per-update cap, then by what remains of the hourly budget; the
    /// applied delta is what actually lands. Emits per the §4.B rules.
    pub fn update(&mut self, dv: f64, de: f64, trigger: &str, bus: &EventBus) -> MoodUpdate {
        let now = Utc::now().timestamp_millis();
        let requested = (dv, de);

        let cap = self.params.max_delta_per_tick;
        let mut applied_v = dv.clamp(-cap, cap);
        let mut applied_e = de.clamp(-cap, cap);
        let mut reason: Option<&str> = if applied_v != dv || applied_e != de {
            Some("per-tick cap")
        } else {
            None
        };

        let (spent_v, spent_e) = self.hourly_spent(now);
        let room_v = (self.params.hourly_cap - spent_v).max(0.0);
        let room_e = (self.params.hourly_cap - spent_e).max(0.0);
        if applied_v.abs() > room_v {
            applied_v = room_v * applied_v.signum();
            reason = Some("hourly cap");
        }
        if applied_e.abs() > room_e {
            applied_e = room_e * applied_e.signum();
            reason = Some("hourly cap");
        }

        self.mood.valence = (self.mood.valence + applied_v).clamp(-1.0, 1.0);
        self.mood.energy = (self.mood.energy + applied_e).clamp(0.0, 1.0);
        self.deltas.push_back(DeltaEntry {
            ts: now,
            dv: applied_v,
            de: applied_e,
        });

        // Gravity pulls toward baseline past the deviation threshold. It is
        // deliberately not booked against the hourly budget.
        self.apply_gravity();

        let old_class = family_key(&self.mood.label);
        let (class, label) = derive_label(self.mood.valence, self.mood.energy, self.label_seed);
        let class_changed = old_class != Some(class);
        if class_changed {
            self.mood.label = label;
            self.since_ms = now;
        }

        if let Some(reason) = reason {
            bus.emit_from(
                kinds::MOOD_CLAMPED,
                "affect",
                json!({
                    "requested": {"dv": requested.0, "de": requested.1},
                    "applied": {"dv": applied_v, "de": applied_e},
                    "reason": reason,
                    "trigger": trigger,
                }),
            );
        }

        let emitted_change = applied_v.abs() > 0.1 || applied_e.abs() > 0.15 || class_changed;
        if emitted_change {
            bus.emit_from(
                kinds::MOOD_CHANGED,
                "affect",
                json!({
                    "valence": self.mood.valence,
                    "energy": self.mood.energy,
                    "label": self.mood.label,
                    "trigger": trigger,
                    "since": self.since_ms,
                }),
            );
        }

        self.push_snapshot(now);

        MoodUpdate {
            requested,
            applied: (applied_v, applied_e),
            clamped: reason.is_some(),
            emitted_change,
        }
    }

    fn apply_gravity(&mut self) {
        let p = &self.params;
        if (self.mood.valence - p.baseline_valence).abs() > p.deviation_threshold {
            self.mood.valence += p.gravity * (p.baseline_valence - self.mood.valence).signum();
        }
        if (self.mood.energy - p.baseline_energy).abs() > p.deviation_threshold {
            self.mood.energy += p.gravity * (p.baseline_energy - self.mood.energy).signum();
        }
    }

    fn hourly_spent(&self, now: i64) -> (f64, f64) {
        let cutoff = now - HOUR_MS;
        self.deltas
            .iter()
            .filter(|d| d.ts >= cutoff)
            .fold((0.0, 0.0), |(v, e), d| (v + d.dv.abs(), e + d.de.abs()))
    }

    fn push_snapshot(&mut self, now: i64) {
        if self.history.len() >= MAX_MOOD_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(MoodSnapshot {
            ts_ms: now,
            valence: self.mood.valence,
            energy: self.mood.energy,
            label: self.mood.label.clone(),
        });
    }
}

/// Quadrant family key plus a synonym chosen deterministically from `seed`.
fn derive_label(valence: f64, energy: f64, seed: u64) -> (&'static str, String) {
    let v_class = if valence > 0.2 {
        "positive"
    } else if valence < -0.2 {
        "negative"
    } else {
        "neutral"
    };
    let e_class = if energy > 0.5 { "high" } else { "low" };
    let key = format!("{v_class}-{e_class}");

    let (family, synonyms) = LABEL_FAMILIES
        .iter()
        .find(|(name, _)| *name == key)
        .copied()
        .unwrap_or(LABEL_FAMILIES[5]);

    let mut rng = StdRng::seed_from_u64(seed);
    let label = synonyms[rng.gen_range(0..synonyms.len())].to_string();
    (family, label)
}

/// Reverse lookup: which family does a label belong to.
fn family_key(label: &str) -> Option<&'static str> {
    LABEL_FAMILIES
        .iter()
        .find(|(_, synonyms)| synonyms.contains(&label))
        .map(|(name, _)| *name)
}
