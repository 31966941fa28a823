use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use self::rand_like::next_delay;
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::engine::EngineContext;
use soul_affect::DriftContext;
use soul_bus::kinds;
use soul_consolidator::Decision;
use soul_generator::{CostCategory, GenerateOptions};
use soul_impulse::ImpulseKind;

/// The light scheduler tick: affect drift, impulse state decay, checkpoints,
/// and the consolidation poll. Never calls the generator directly — the
/// consolidator decides that on its own clock.
pub async fn tick_loop(ctx: Arc<EngineContext>, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_secs(ctx.config.impulse.tick_secs);
    let mut interval = tokio::time::interval(period);
    interval.tick().await; // skip the immediate first tick
    info!(period_secs = period.as_secs(), "[engine] tick loop started");

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let impulse_state = ctx.impulse.state_snapshot();
        let now_ms = Utc::now().timestamp_millis();
        let drift = DriftContext {
            hours_since_user_message: hours_since(impulse_state.last_user_message_ts, now_ms),
            hours_since_dream: hours_since(
                impulse_state
                    .recent_types
                    .iter()
                    .rev()
                    .find(|(k, _)| *k == ImpulseKind::DreamShare)
                    .map(|(_, ts)| *ts)
                    .unwrap_or(0),
                now_ms,
            ),
        };

        let mood = {
            let mut affect = ctx.affect.lock().unwrap_or_else(|e| e.into_inner());
            affect.drift_tick(drift);
            affect.checkpoint(ctx.root());
            affect.mood().clone()
        };

        ctx.impulse.tick(&mood);

        if ctx.config.consolidator.enabled {
            let decision = ctx.consolidator.should_consolidate();
            if decision != Decision::None {
                let affect = ctx.affect_snapshot();
                let result = match decision {
                    Decision::Deep => ctx.consolidator.consolidate_deep(&affect).await,
                    Decision::Fast => ctx.consolidator.consolidate_fast(&affect).await,
                    Decision::None => Ok(false),
                };
                if let Err(err) = result {
                    warn!(error = %err, "[engine] consolidation pass failed");
                }
            }
        }
    }
    info!("[engine] tick loop stopped");
}

/// The heavy fire loop: wait a computed delay, fire one impulse, repeat.
pub async fn fire_loop(ctx: Arc<EngineContext>, mut shutdown: watch::Receiver<bool>) {
    info!("[engine] fire loop started");
    loop {
        let delay = {
            let state = ctx.impulse.state_snapshot();
            let mood = { ctx.affect_snapshot().mood().clone() };
            let hour = Utc::now().format("%H").to_string().parse().unwrap_or(12);
            next_delay(ctx.impulse.config(), &state, &mood, hour)
        };
        info!(delay_secs = delay.as_secs(), "[impulse] next fire scheduled");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let mood = ctx.affect_snapshot().mood().clone();
        if let Err(err) = ctx.impulse.fire(&mood).await {
            warn!(error = %err, "[impulse] fire failed");
        }
    }
    info!("[engine] fire loop stopped");
}

/// Cron-driven heartbeat: a generator-backed self-reflection written to the
/// daily heartbeat file.
pub async fn heartbeat_loop(ctx: Arc<EngineContext>, mut shutdown: watch::Receiver<bool>) {
    let schedule = match Schedule::from_str(&ctx.config.heartbeat.cron) {
        Ok(schedule) => schedule,
        Err(err) => {
            warn!(cron = %ctx.config.heartbeat.cron, error = %err, "[heartbeat] bad cron expression");
            return;
        }
    };
    info!(cron = %ctx.config.heartbeat.cron, "[heartbeat] scheduled");

    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            break;
        };
        let wait = (next - Utc::now())
            .to_std()
            .unwrap_or(Duration::from_secs(1));

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        run_heartbeat(&ctx).await;
    }
    info!("[heartbeat] stopped");
}

async fn run_heartbeat(ctx: &Arc<EngineContext>) {
    let affect = ctx.affect_snapshot();
    let mood = affect.mood();
    let system = "This is your scheduled heartbeat: a private moment of \
                  self-reflection, not a message to anyone. Write a few honest \
                  sentences about your current state.";
    let user = format!(
        "Mood: {} (valence {:.2}, energy {:.2})\nField: {}",
        mood.label,
        mood.valence,
        mood.energy,
        affect.field().summary()
    );

    let options = GenerateOptions::with_budget(ctx.config.budgets.heartbeat);
    match ctx
        .cost
        .generate(CostCategory::Heartbeat, system, &[], &user, &options)
        .await
    {
        Ok(reflection) => {
            let dir = ctx.root().join("heartbeat");
            let path = dir.join(format!("{}.md", Utc::now().format("%Y-%m-%d")));
            let entry = format!("\n## {}\n\n{}\n", Utc::now().format("%H:%M"), reflection.trim());
            let result = std::fs::create_dir_all(&dir).and_then(|_| {
                use std::io::Write;
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .and_then(|mut f| f.write_all(entry.as_bytes()))
            });
            if let Err(err) = result {
                soul_bus::throttle::log_write_error(&path, &err);
            }

            ctx.bus.emit_from(
                kinds::HEARTBEAT_COMPLETED,
                "heartbeat",
                json!({"chars": reflection.len()}),
            );
            if ctx.config.versioning.enabled {
                ctx.versioner.queue("heartbeat", "scheduled reflection");
            }
        }
        Err(err) => warn!(error = %err, "[heartbeat] generator unavailable, skipping"),
    }
}

/// Nightly reflection pass, budget-capped via `SOUL_REFLECTION_LLM_BUDGET`.
pub async fn reflection_loop(ctx: Arc<EngineContext>, mut shutdown: watch::Receiver<bool>) {
    // Fixed small-hours slot; the impulse cadence already covers the day.
    let schedule = match Schedule::from_str("0 45 3 * * *") {
        Ok(schedule) => schedule,
        Err(_) => return,
    };
    info!(budget = ctx.config.reflection.llm_budget, "[reflection] scheduled");

    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            break;
        };
        let wait = (next - Utc::now())
            .to_std()
            .unwrap_or(Duration::from_secs(1));

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let recent = ctx.bus.recent(50);
        let summary: Vec<String> = recent
            .iter()
            .map(|p| format!("{} ({})", p.kind, p.source))
            .collect();
        let system = "Review the recent event trail of your own engine and note \
                      anything that deserves follow-up. Be brief and concrete.";
        let user = summary.join("\n");
        let options = GenerateOptions::with_budget(ctx.config.reflection.llm_budget);

        match ctx
            .cost
            .generate(CostCategory::Reflection, system, &[], &user, &options)
            .await
        {
            Ok(outcome) => {
                ctx.bus.emit_from(
                    kinds::REFLECTION_COMPLETED,
                    "reflection",
                    json!({"chars": outcome.len()}),
                );
            }
            Err(err) => warn!(error = %err, "[reflection] generator unavailable, skipping"),
        }
    }
    info!("[reflection] stopped");
}

fn hours_since(ts_ms: i64, now_ms: i64) -> f64 {
    if ts_ms <= 0 {
        return f64::MAX;
    }
    (now_ms - ts_ms).max(0) as f64 / 3_600_000.0
}

/// Thin wrapper so the loop body stays free of RNG plumbing.
mod rand_like {
    use std::time::Duration;

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use soul_affect::Mood;
    use soul_config::ImpulseConfig;
    use soul_impulse::{calculate_delay, ImpulseState};

    pub fn next_delay(
        config: &ImpulseConfig,
        state: &ImpulseState,
        mood: &Mood,
        hour: u32,
    ) -> Duration {
        let mut rng = StdRng::from_entropy();
        calculate_delay(config, state, mood, hour, &mut rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hours_since_handles_unset_timestamps() {
        assert_eq!(hours_since(0, 1_000), f64::MAX);
        let two_hours = 2 * 3_600_000;
        assert!((hours_since(1_000, 1_000 + two_hours) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn default_heartbeat_cron_parses() {
        let config = soul_config::EngineConfig::default();
        assert!(Schedule::from_str(&config.heartbeat.cron).is_ok());
    }
}
