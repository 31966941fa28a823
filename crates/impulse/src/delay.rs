use std::time::Duration;

use rand::Rng;

use crate::state::ImpulseState;
use soul_affect::Mood;
use soul_config::ImpulseConfig;

/// Compute the delay until the next fire.
///
/// Night draws from a 1–4 h range; day draws from the configured min/max
/// ramp. Energy and engagement shorten the wait, a string of ignored
/// impulses backs it off up to 4×, and ±30% jitter keeps the cadence from
/// looking mechanical. The result is clamped to the configured bounds.
pub fn calculate_delay<R: Rng>(
    config: &ImpulseConfig,
    state: &ImpulseState,
    mood: &Mood,
    hour: u32,
    rng: &mut R,
) -> Duration {
    let night = is_night(config, hour);

    let base_secs = if night {
        rng.gen_range(3600.0..=4.0 * 3600.0)
    } else {
        let min = config.min_delay_secs as f64;
        let max = (config.max_delay_secs as f64).max(min + 1.0);
        min + (max - min) * rng.gen_range(0.0..=1.0)
    };

    let mut secs = base_secs * (1.0 - mood.energy * 0.4) * (1.0 - state.engagement * 0.3);

    if state.consecutive_ignored > 3 {
        let backoff = (1.0 + 0.5 * (state.consecutive_ignored - 3) as f64).min(4.0);
        secs *= backoff;
    }

    let jitter = rng.gen_range(-0.3..=0.3);
    secs *= 1.0 + jitter;

    let clamped = secs.clamp(config.min_delay_secs as f64, config.max_delay_secs as f64);
    Duration::from_secs_f64(clamped)
}

fn is_night(config: &ImpulseConfig, hour: u32) -> bool {
    let start = config.night_start_hour as u32;
    let end = config.night_end_hour as u32;
    if start <= end {
        (start..end).contains(&hour)
    } else {
        hour >= start || hour < end
    }
}
