use std::collections::{BTreeMap, VecDeque};
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::registry::ImpulseKind;

/// Interests below this weight fall out of the map.
pub const INTEREST_FLOOR: f64 = 0.05;
/// Ring of recently fired types, for cooldown windows.
pub const RECENT_TYPES_CAP: usize = 24;

const STATE_FILE: &str = ".soul-impulse-state";
const ENGAGEMENT_TICK_DECAY: f64 = 0.002;
const ENGAGEMENT_FIRE_DECAY: f64 = 0.03;
const INTEREST_TICK_DECAY: f64 = 0.005;

/// Checkpointed scheduler state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpulseState {
    pub last_impulse_ts: i64,
    pub last_user_message_ts: i64,
    pub engagement: f64,
    pub daily_count: u32,
    pub daily_date: String,
    pub consecutive_ignored: u32,
    pub recent_types: VecDeque<(ImpulseKind, i64)>,
    pub interests: BTreeMap<String, f64>,
    /// Kind of the last fired impulse, until the user responds to it.
    pub awaiting_response: Option<ImpulseKind>,
}

impl Default for ImpulseState {
    fn default() -> Self {
        Self {
            last_impulse_ts: 0,
            last_user_message_ts: 0,
            engagement: 0.5,
            daily_count: 0,
            daily_date: today(),
            consecutive_ignored: 0,
            recent_types: VecDeque::new(),
            interests: BTreeMap::new(),
            awaiting_response: None,
        }
    }
}

fn today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

impl ImpulseState {
    pub fn load(root: &Path) -> Self {
        let path = root.join(STATE_FILE);
        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(state) => {
                    info!(path = %path.display(), "[impulse] state restored");
                    state
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "[impulse] corrupt checkpoint, using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Best-effort checkpoint.
    pub fn save(&self, root: &Path) {
        let path = root.join(STATE_FILE);
        let result = serde_json::to_string(self)
            .map_err(anyhow::Error::from)
            .and_then(|body| std::fs::write(&path, body).map_err(Into::into));
        if let Err(err) = result {
            soul_bus::throttle::log_write_error(&path, &format!("{err:#}"));
        }
    }

    /// Per-tick decay: engagement eases off, interests fade linearly and
    /// fall out below the floor, the daily counter rolls over at midnight.
    pub fn tick_decay(&mut self) {
        self.engagement = (self.engagement - ENGAGEMENT_TICK_DECAY).clamp(0.0, 1.0);

        for weight in self.interests.values_mut() {
            *weight -= INTEREST_TICK_DECAY;
        }
        self.interests.retain(|_, w| *w > INTEREST_FLOOR);

        let now = today();
        if self.daily_date != now {
            self.daily_date = now;
            self.daily_count = 0;
        }
    }

    /// Book a fired impulse: ring entry, daily counter, engagement dip, and
    /// the ignored counter advances until a response arrives.
    pub fn record_fire(&mut self, kind: ImpulseKind, now_ms: i64) {
        if self.recent_types.len() >= RECENT_TYPES_CAP {
            self.recent_types.pop_front();
        }
        self.recent_types.push_back((kind, now_ms));
        self.last_impulse_ts = now_ms;
        self.daily_count += 1;
        self.engagement = (self.engagement - ENGAGEMENT_FIRE_DECAY).clamp(0.0, 1.0);
        if self.awaiting_response.is_some() {
            self.consecutive_ignored += 1;
        }
        self.awaiting_response = Some(kind);
    }

    /// Book a user message. When it answers an impulse fired within the last
    /// hour, engagement is boosted in proportion to how fast the reply came.
    pub fn record_user_message(&mut self, now_ms: i64) -> Option<f64> {
        self.last_user_message_ts = now_ms;

        let responded = self.awaiting_response.take().is_some();
        if !responded {
            return None;
        }

        let latency_ms = now_ms.saturating_sub(self.last_impulse_ts);
        let hour_ms = 60 * 60 * 1000;
        if latency_ms > hour_ms {
            // Too late to count as a response to the impulse.
            return None;
        }
        let boost = 0.2 * (1.0 - latency_ms as f64 / hour_ms as f64);
        self.engagement = (self.engagement + boost).clamp(0.0, 1.0);
        self.consecutive_ignored = 0;
        Some(boost)
    }

    /// Raise (or insert) an interest, clamped into (0, 1].
    pub fn bump_interest(&mut self, topic: &str, delta: f64) {
        let entry = self.interests.entry(topic.to_string()).or_insert(0.0);
        *entry = (*entry + delta).clamp(INTEREST_FLOOR + f64::EPSILON, 1.0);
    }

    /// How many impulses of `kind` fired within the trailing window.
    pub fn fired_within(&self, kind: ImpulseKind, window_ms: i64, now_ms: i64) -> usize {
        self.recent_types
            .iter()
            .filter(|(k, ts)| *k == kind && now_ms - ts <= window_ms)
            .count()
    }

    /// Total fires within the trailing window, any kind.
    pub fn total_fired_within(&self, window_ms: i64, now_ms: i64) -> usize {
        self.recent_types
            .iter()
            .filter(|(_, ts)| now_ms - ts <= window_ms)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR_MS: i64 = 60 * 60 * 1000;

    #[test]
    fn engagement_decays_and_stays_in_range() {
        let mut state = ImpulseState::default();
        for _ in 0..1000 {
            state.tick_decay();
        }
        assert_eq!(state.engagement, 0.0);
    }

    #[test]
    fn interests_fall_out_below_floor() {
        let mut state = ImpulseState::default();
        state.bump_interest("rust", 0.3);
        state.bump_interest("synths", 0.06);
        for _ in 0..3 {
            state.tick_decay();
        }
        assert!(state.interests.contains_key("rust"));
        assert!(!state.interests.contains_key("synths"));
    }

    #[test]
    fn fast_response_boosts_more_than_slow() {
        let mut fast = ImpulseState::default();
        fast.record_fire(ImpulseKind::AskQuestion, 0);
        let fast_boost = fast.record_user_message(5 * 60 * 1000).unwrap();

        let mut slow = ImpulseState::default();
        slow.record_fire(ImpulseKind::AskQuestion, 0);
        let slow_boost = slow.record_user_message(55 * 60 * 1000).unwrap();

        assert!(fast_boost > slow_boost);
        assert_eq!(fast.consecutive_ignored, 0);
    }

    #[test]
    fn response_after_an_hour_does_not_count() {
        let mut state = ImpulseState::default();
        state.record_fire(ImpulseKind::ShareThought, 0);
        assert!(state.record_user_message(2 * HOUR_MS).is_none());
    }

    #[test]
    fn unanswered_fires_accumulate_ignored() {
        let mut state = ImpulseState::default();
        state.record_fire(ImpulseKind::ShareThought, 0);
        state.record_fire(ImpulseKind::AskQuestion, HOUR_MS);
        state.record_fire(ImpulseKind::DreamShare, 2 * HOUR_MS);
        assert_eq!(state.consecutive_ignored, 2);
    }

    #[test]
    fn recent_ring_is_bounded() {
        let mut state = ImpulseState::default();
        for i in 0..(RECENT_TYPES_CAP + 10) {
            state.record_fire(ImpulseKind::ServerCheck, i as i64);
        }
        assert_eq!(state.recent_types.len(), RECENT_TYPES_CAP);
    }

    #[test]
    fn checkpoint_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = ImpulseState::default();
        state.bump_interest("rust", 0.5);
        state.record_fire(ImpulseKind::Provoke, 123);
        state.save(dir.path());

        let restored = ImpulseState::load(dir.path());
        assert_eq!(restored.daily_count, 1);
        assert!(restored.interests.contains_key("rust"));
        assert_eq!(restored.recent_types.len(), 1);
    }
}
