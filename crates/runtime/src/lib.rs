//! Engine wiring and the cooperative timer loops.
//!
//! One `EngineContext` owns every subsystem; the event bus is the only
//! many-to-many channel between them. The loops (impulse tick, impulse
//! fire, heartbeat cron, reflection cron) all follow the same shape: wait
//! on a deadline or the shutdown watch channel, do the work, compute the
//! next deadline.

mod engine;
mod loops;

pub use engine::{EngineContext, SESSION_GUARD_FILE};
