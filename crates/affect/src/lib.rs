//! Affective state — a bounded, drift-limited mood plus the slow
//! 8-dimensional allostatic field that modulates the rest of the engine.
//!
//! All mutation is funneled through one owning task (the runtime's affect
//! lock); everything exported here is either a snapshot or a pure
//! derivation.

mod field;
mod mood;
mod state;

pub use field::{
    AllostaticField, Dimension, DimensionParams, DriftContext, FieldSnapshot, Modulations,
    DIMENSIONS,
};
pub use mood::{Mood, MoodEngine, MoodParams, MoodSnapshot, MoodUpdate, MAX_MOOD_HISTORY};
pub use state::AffectState;
