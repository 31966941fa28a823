use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::state::ImpulseState;
use soul_affect::Mood;

const HOUR_MS: i64 = 60 * 60 * 1000;

/// The fixed impulse registry.
pub const IMPULSE_KINDS: [ImpulseKind; 11] = [
    ImpulseKind::ShareThought,
    ImpulseKind::AskQuestion,
    ImpulseKind::NewsResearch,
    ImpulseKind::ServerCheck,
    ImpulseKind::HobbyPursuit,
    ImpulseKind::ExpressEmotion,
    ImpulseKind::TechSuggestion,
    ImpulseKind::Provoke,
    ImpulseKind::DreamShare,
    ImpulseKind::MemoryReflect,
    ImpulseKind::GithubCheck,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpulseKind {
    ShareThought,
    AskQuestion,
    NewsResearch,
    ServerCheck,
    HobbyPursuit,
    ExpressEmotion,
    TechSuggestion,
    Provoke,
    DreamShare,
    MemoryReflect,
    GithubCheck,
}

impl ImpulseKind {
    pub fn name(&self) -> &'static str {
        match self {
            ImpulseKind::ShareThought => "share_thought",
            ImpulseKind::AskQuestion => "ask_question",
            ImpulseKind::NewsResearch => "news_research",
            ImpulseKind::ServerCheck => "server_check",
            ImpulseKind::HobbyPursuit => "hobby_pursuit",
            ImpulseKind::ExpressEmotion => "express_emotion",
            ImpulseKind::TechSuggestion => "tech_suggestion",
            ImpulseKind::Provoke => "provoke",
            ImpulseKind::DreamShare => "dream_share",
            ImpulseKind::MemoryReflect => "memory_reflect",
            ImpulseKind::GithubCheck => "github_check",
        }
    }

    /// Whether firing this kind hands tool descriptors to the generator.
    pub fn needs_tools(&self) -> bool {
        matches!(
            self,
            ImpulseKind::NewsResearch
                | ImpulseKind::ServerCheck
                | ImpulseKind::TechSuggestion
                | ImpulseKind::GithubCheck
        )
    }

    /// Token budget for one firing, derived from the configured base.
    pub fn token_budget(&self, base: u32) -> u32 {
        match self {
            ImpulseKind::NewsResearch | ImpulseKind::MemoryReflect => base.saturating_mul(2),
            ImpulseKind::ServerCheck | ImpulseKind::GithubCheck => base / 2,
            _ => base,
        }
    }

    /// State-dependent selection weight in [0, 1].
    ///
    /// Every weight folds in a base rate, mood, time of day, engagement,
    /// and recent-fire cooldowns; pure in the context.
    pub fn weight(&self, ctx: &WeightContext) -> f64 {
        let recent_same = ctx.state.fired_within(*self, 4 * HOUR_MS, ctx.now_ms);
        let cooldown = match recent_same {
            0 => 1.0,
            1 => 0.4,
            _ => 0.15,
        };
        let engagement = ctx.state.engagement;
        let mood = ctx.mood;
        let night = ctx.hour >= 23 || ctx.hour < 7;

        let raw = match self {
            ImpulseKind::ShareThought => {
                0.35 + 0.2 * engagement + 0.1 * mood.valence.max(0.0)
            }
            ImpulseKind::AskQuestion => {
                let social_gap =
                    (ctx.now_ms - ctx.state.last_user_message_ts) as f64 / (6.0 * HOUR_MS as f64);
                0.2 + 0.25 * engagement + 0.15 * social_gap.min(1.0)
            }
            ImpulseKind::NewsResearch => {
                let day_factor = if (9..22).contains(&ctx.hour) { 1.0 } else { 0.3 };
                (0.15 + 0.2 * ctx.interest_pull) * day_factor
            }
            ImpulseKind::ServerCheck => 0.1 + 0.15 * (1.0 - engagement),
            ImpulseKind::HobbyPursuit => 0.15 + 0.3 * ctx.interest_pull + 0.1 * mood.energy,
            ImpulseKind::ExpressEmotion => {
                0.1 + 0.4 * mood.valence.abs() + 0.1 * mood.energy
            }
            ImpulseKind::TechSuggestion => 0.1 + 0.25 * engagement,
            ImpulseKind::Provoke => {
                // Hard 2-hour cooldown, then a low base that needs energy.
                if ctx.state.fired_within(ImpulseKind::Provoke, 2 * HOUR_MS, ctx.now_ms) > 0 {
                    return 0.0;
                }
                0.05 + 0.15 * mood.energy + 0.1 * engagement
            }
            ImpulseKind::DreamShare => {
                let base = if night { 0.35 } else { 0.05 };
                base + 0.1 * mood.valence.max(0.0)
            }
            ImpulseKind::MemoryReflect => {
                let quiet = 1.0 - 0.5 * ctx.state.total_fired_within(2 * HOUR_MS, ctx.now_ms).min(2) as f64;
                0.15 + 0.2 * quiet.max(0.0)
            }
            ImpulseKind::GithubCheck => {
                let day_factor = if (8..20).contains(&ctx.hour) { 1.0 } else { 0.2 };
                (0.1 + 0.15 * engagement) * day_factor
            }
        };

        (raw * cooldown).clamp(0.0, 1.0)
    }
}

/// Everything a weight function may look at.
pub struct WeightContext<'a> {
    pub state: &'a ImpulseState,
    pub mood: &'a Mood,
    pub hour: u32,
    pub now_ms: i64,
    /// Mean interest weight, 0 when no interests are tracked.
    pub interest_pull: f64,
}

impl<'a> WeightContext<'a> {
    pub fn new(state: &'a ImpulseState, mood: &'a Mood, hour: u32, now_ms: i64) -> Self {
        let interest_pull = if state.interests.is_empty() {
            0.0
        } else {
            state.interests.values().sum::<f64>() / state.interests.len() as f64
        };
        Self {
            state,
            mood,
            hour,
            now_ms,
            interest_pull,
        }
    }
}

/// The full weight vector over the registry, in registry order.
pub fn weight_vector(ctx: &WeightContext) -> Vec<(ImpulseKind, f64)> {
    IMPULSE_KINDS.iter().map(|k| (*k, k.weight(ctx))).collect()
}

/// Weighted random choice. A zero total falls back to `share_thought`.
pub fn select_impulse<R: Rng>(rng: &mut R, weights: &[(ImpulseKind, f64)]) -> ImpulseKind {
    let total: f64 = weights.iter().map(|(_, w)| w).sum();
    if total <= 0.0 {
        return ImpulseKind::ShareThought;
    }

    let mut roll = rng.gen_range(0.0..total);
    for (kind, weight) in weights {
        if roll < *weight {
            return *kind;
        }
        roll -= weight;
    }
    // Floating-point tail; last non-zero entry wins.
    weights
        .iter()
        .rev()
        .find(|(_, w)| *w > 0.0)
        .map(|(k, _)| *k)
        .unwrap_or(ImpulseKind::ShareThought)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn mood() -> Mood {
        Mood {
            valence: 0.3,
            energy: 0.6,
            label: "curious".to_string(),
        }
    }

    #[test]
    fn weights_stay_in_unit_interval() {
        let mut state = ImpulseState::default();
        state.engagement = 1.0;
        state.bump_interest("rust", 1.0);
        let mood_val = mood();
        for hour in 0..24 {
            let ctx = WeightContext::new(&state, &mood_val, hour, 10 * HOUR_MS);
            for (kind, weight) in weight_vector(&ctx) {
                assert!(
                    (0.0..=1.0).contains(&weight),
                    "{} out of range: {weight}",
                    kind.name()
                );
            }
        }
    }

    #[test]
    fn provoke_has_a_hard_two_hour_cooldown() {
        let mut state = ImpulseState::default();
        let now = 10 * HOUR_MS;
        state.record_fire(ImpulseKind::Provoke, now - HOUR_MS);
        let mood_val = mood();
        let ctx = WeightContext::new(&state, &mood_val, 12, now);
        assert_eq!(ImpulseKind::Provoke.weight(&ctx), 0.0);

        let later = now + 2 * HOUR_MS;
        let ctx = WeightContext::new(&state, &mood_val, 12, later);
        assert!(ImpulseKind::Provoke.weight(&ctx) > 0.0);
    }

    #[test]
    fn recent_fire_reduces_weight() {
        let mut state = ImpulseState::default();
        let now = 10 * HOUR_MS;
        let mood = mood();
        let before = {
            let ctx = WeightContext::new(&state, &mood, 12, now);
            ImpulseKind::ShareThought.weight(&ctx)
        };
        state.record_fire(ImpulseKind::ShareThought, now - HOUR_MS);
        let after = {
            let ctx = WeightContext::new(&state, &mood, 12, now);
            ImpulseKind::ShareThought.weight(&ctx)
        };
        assert!(after < before);
    }

    #[test]
    fn dream_share_prefers_night() {
        let state = ImpulseState::default();
        let mood = mood();
        let night = WeightContext::new(&state, &mood, 2, 10 * HOUR_MS);
        let day = WeightContext::new(&state, &mood, 14, 10 * HOUR_MS);
        assert!(ImpulseKind::DreamShare.weight(&night) > ImpulseKind::DreamShare.weight(&day));
    }

    #[test]
    fn zero_total_falls_back_to_default() {
        let weights: Vec<(ImpulseKind, f64)> =
            IMPULSE_KINDS.iter().map(|k| (*k, 0.0)).collect();
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(select_impulse(&mut rng, &weights), ImpulseKind::ShareThought);
    }

    #[test]
    fn selection_distribution_matches_weights() {
        // Two live types at 0.7 / 0.3: over 10k draws the 0.7 type must land
        // in the 6,800–7,200 band.
        let weights = vec![
            (ImpulseKind::ShareThought, 0.7),
            (ImpulseKind::DreamShare, 0.3),
        ];
        let mut rng = StdRng::seed_from_u64(42);
        let mut hits = 0;
        for _ in 0..10_000 {
            if select_impulse(&mut rng, &weights) == ImpulseKind::ShareThought {
                hits += 1;
            }
        }
        assert!((6_800..=7_200).contains(&hits), "hits = {hits}");
    }

    #[test]
    fn selected_type_always_has_positive_weight() {
        let weights = vec![
            (ImpulseKind::ShareThought, 0.0),
            (ImpulseKind::Provoke, 0.0),
            (ImpulseKind::MemoryReflect, 0.4),
        ];
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..200 {
            assert_eq!(select_impulse(&mut rng, &weights), ImpulseKind::MemoryReflect);
        }
    }
}
