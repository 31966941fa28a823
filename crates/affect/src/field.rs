use std::collections::VecDeque;

use chrono::{Timelike, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::mood::Mood;
use soul_bus::kinds;

/// The fixed dimension set, in canonical order.
pub const DIMENSIONS: [Dimension; 8] = [
    Dimension::Arousal,
    Dimension::Valence,
    Dimension::Openness,
    Dimension::Vigilance,
    Dimension::CreativeTension,
    Dimension::SocialOrientation,
    Dimension::TimeFocus,
    Dimension::IntegrationPressure,
];

const FIELD_HISTORY_CAP: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Arousal,
    Valence,
    Openness,
    Vigilance,
    CreativeTension,
    SocialOrientation,
    TimeFocus,
    IntegrationPressure,
}

impl Dimension {
    pub fn name(&self) -> &'static str {
        match self {
            Dimension::Arousal => "arousal",
            Dimension::Valence => "valence",
            Dimension::Openness => "openness",
            Dimension::Vigilance => "vigilance",
            Dimension::CreativeTension => "creative_tension",
            Dimension::SocialOrientation => "social_orientation",
            Dimension::TimeFocus => "time_focus",
            Dimension::IntegrationPressure => "integration_pressure",
        }
    }

    fn index(&self) -> usize {
        DIMENSIONS.iter().position(|d| d == self).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DimensionParams {
    pub baseline: f64,
    pub gravity: f64,
    pub max_delta_per_tick: f64,
    pub min: f64,
    pub max: f64,
    /// Gravity engages only past this deviation from baseline.
    pub deviation_threshold: f64,
}

impl DimensionParams {
    const fn unit(baseline: f64) -> Self {
        Self {
            baseline,
            gravity: 0.02,
            max_delta_per_tick: 0.15,
            min: 0.0,
            max: 1.0,
            deviation_threshold: 0.3,
        }
    }
}

fn default_params() -> [DimensionParams; 8] {
    [
        DimensionParams::unit(0.4), // arousal
        DimensionParams {
            min: -1.0,
            ..DimensionParams::unit(0.0)
        }, // valence
        DimensionParams::unit(0.6), // openness
        DimensionParams::unit(0.3), // vigilance
        DimensionParams::unit(0.4), // creative_tension
        DimensionParams::unit(0.5), // social_orientation
        DimensionParams::unit(0.5), // time_focus
        DimensionParams::unit(0.3), // integration_pressure
    ]
}

/// Read-only multipliers derived from the field for downstream consumers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Modulations {
    pub impulse_cadence: f64,
    pub heartbeat_depth: f64,
    pub router_sensitivity: f64,
    pub consolidation_frequency: f64,
    pub memory_encoding: f64,
}

/// Exported snapshot written to `.soul-field` for observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSnapshot {
    pub ts_ms: i64,
    pub values: Vec<(String, f64)>,
    pub modulations: Modulations,
    pub dominant: String,
    pub label: String,
}

/// Inputs the drift tick folds in besides noise.
#[derive(Debug, Clone, Copy, Default)]
pub struct DriftContext {
    pub hours_since_user_message: f64,
    pub hours_since_dream: f64,
}

/// The 8-dimensional slow-modulation vector. `arousal` and `valence` are
/// slaved to the mood; the rest drift on their own clocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllostaticField {
    values: [f64; 8],
    params: [DimensionParams; 8],
    history: VecDeque<(i64, [f64; 8])>,
    drift_seed: u64,
}

impl Default for AllostaticField {
    fn default() -> Self {
        let params = default_params();
        let values = core::array::from_fn(|i| params[i].baseline);
        Self {
            values,
            params,
            history: VecDeque::new(),
            drift_seed: 0,
        }
    }
}

impl AllostaticField {
    pub fn get(&self, dim: Dimension) -> f64 {
        self.values[dim.index()]
    }

    pub fn params(&self, dim: Dimension) -> &DimensionParams {
        &self.params[dim.index()]
    }

    /// Apply a bounded nudge to one dimension.
    pub fn nudge(&mut self, dim: Dimension, delta: f64) {
        let i = dim.index();
        let p = self.params[i];
        let clamped = delta.clamp(-p.max_delta_per_tick, p.max_delta_per_tick);
        self.values[i] = (self.values[i] + clamped).clamp(p.min, p.max);
    }

    /// Fixed event→dimension reaction table. Unknown kinds are ignored.
    pub fn apply_event(&mut self, kind: &str) {
        let nudges: &[(Dimension, f64)] = match kind {
            kinds::MESSAGE_RECEIVED => &[
                (Dimension::Arousal, 0.1),
                (Dimension::SocialOrientation, 0.15),
                (Dimension::TimeFocus, -0.05),
            ],
            kinds::HEARTBEAT_COMPLETED => &[
                (Dimension::CreativeTension, -0.1),
                (Dimension::IntegrationPressure, -0.05),
            ],
            kinds::PERFORMANCE_DETECTED => &[(Dimension::Vigilance, 0.15)],
            kinds::INTEREST_DETECTED => &[
                (Dimension::Openness, 0.1),
                (Dimension::CreativeTension, 0.05),
            ],
            kinds::REFLECTION_COMPLETED => &[
                (Dimension::IntegrationPressure, -0.1),
                (Dimension::Openness, 0.05),
            ],
            kinds::RLUF_FEEDBACK => &[
                (Dimension::SocialOrientation, 0.1),
                (Dimension::Valence, 0.05),
            ],
            kinds::IMPULSE_FIRED => &[
                (Dimension::Arousal, 0.05),
                (Dimension::SocialOrientation, 0.05),
            ],
            kinds::CORRECTION_APPLIED => &[
                (Dimension::Vigilance, 0.1),
                (Dimension::Openness, -0.05),
            ],
            _ => return,
        };
        for (dim, delta) in nudges {
            self.nudge(*dim, *delta);
        }
    }

    /// One drift tick: zero-mean noise on the free dimensions, time-of-day
    /// influence, context pressure, then per-dimension gravity. Gravity runs
    /// last and only past each dimension's deviation threshold.
    pub fn drift_tick(&mut self, ctx: DriftContext) {
        self.drift_seed = self.drift_seed.wrapping_add(1);
        let mut rng = StdRng::seed_from_u64(self.drift_seed ^ 0x5eed_f1e1d);

        for dim in [
            Dimension::Openness,
            Dimension::CreativeTension,
            Dimension::TimeFocus,
            Dimension::IntegrationPressure,
        ] {
            let noise = rng.gen_range(-0.02..=0.02);
            self.nudge(dim, noise);
        }

        let hour = Utc::now().hour();
        if (6..11).contains(&hour) {
            self.nudge(Dimension::Openness, 0.02);
        }
        if hour >= 22 || hour < 5 {
            self.nudge(Dimension::CreativeTension, 0.03);
        }
        if (14..17).contains(&hour) {
            self.nudge(Dimension::IntegrationPressure, 0.02);
        }

        if ctx.hours_since_user_message > 1.0 {
            let pull = (ctx.hours_since_user_message * 0.005).min(0.05);
            self.nudge(Dimension::SocialOrientation, -pull);
        }
        if ctx.hours_since_dream > 12.0 {
            let push = (ctx.hours_since_dream * 0.002).min(0.04);
            self.nudge(Dimension::CreativeTension, push);
        }

        for i in 0..8 {
            let p = self.params[i];
            if (self.values[i] - p.baseline).abs() > p.deviation_threshold {
                self.values[i] =
                    (self.values[i] + p.gravity * (p.baseline - self.values[i]).signum())
                        .clamp(p.min, p.max);
            }
        }

        if self.history.len() >= FIELD_HISTORY_CAP {
            self.history.pop_front();
        }
        self.history
            .push_back((Utc::now().timestamp_millis(), self.values));
    }

    /// Slave `arousal` and `valence` to the current mood.
    pub fn sync_with_mood(&mut self, mood: &Mood) {
        let i = Dimension::Arousal.index();
        self.values[i] = mood.energy.clamp(self.params[i].min, self.params[i].max);
        let i = Dimension::Valence.index();
        self.values[i] = mood.valence.clamp(self.params[i].min, self.params[i].max);
    }

    /// Derived multipliers, each kept within [0.5, 1.5].
    pub fn modulations(&self) -> Modulations {
        let g = |d: Dimension| self.get(d);
        let clamp = |x: f64| x.clamp(0.5, 1.5);
        Modulations {
            impulse_cadence: clamp(0.7 + 0.4 * g(Dimension::Arousal) + 0.4 * g(Dimension::SocialOrientation)),
            heartbeat_depth: clamp(0.6 + 0.5 * g(Dimension::IntegrationPressure) + 0.3 * g(Dimension::CreativeTension)),
            router_sensitivity: clamp(0.7 + 0.6 * g(Dimension::Vigilance)),
            consolidation_frequency: clamp(0.7 + 0.6 * g(Dimension::IntegrationPressure)),
            memory_encoding: clamp(0.6 + 0.4 * g(Dimension::Arousal) + 0.3 * g(Dimension::Openness)),
        }
    }

    /// The dimension currently furthest from its baseline, range-normalized.
    pub fn dominant(&self) -> Dimension {
        let mut best = Dimension::Arousal;
        let mut best_dev = -1.0;
        for dim in DIMENSIONS {
            let i = dim.index();
            let p = self.params[i];
            let span = (p.max - p.min).max(f64::EPSILON);
            let dev = (self.values[i] - p.baseline).abs() / span;
            if dev > best_dev {
                best_dev = dev;
                best = dim;
            }
        }
        best
    }

    /// Human-readable summary of the field's leaning.
    pub fn label(&self) -> String {
        let dim = self.dominant();
        let value = self.get(dim);
        let p = self.params(dim);
        let side = if value >= p.baseline { "elevated" } else { "suppressed" };
        format!("{} {}", side, dim.name().replace('_', " "))
    }

    /// One-line textual summary used in generator prompts.
    pub fn summary(&self) -> String {
        DIMENSIONS
            .iter()
            .map(|d| format!("{}={:.2}", d.name(), self.get(*d)))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn snapshot(&self) -> FieldSnapshot {
        FieldSnapshot {
            ts_ms: Utc::now().timestamp_millis(),
            values: DIMENSIONS
                .iter()
                .map(|d| (d.name().to_string(), self.get(*d)))
                .collect(),
            modulations: self.modulations(),
            dominant: self.dominant().name().to_string(),
            label: self.label(),
        }
    }
}
