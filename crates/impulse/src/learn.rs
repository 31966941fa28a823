use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::state::ImpulseState;

/// Topic keyword table: surface keyword → tracked interest topic.
const TOPIC_KEYWORDS: &[(&str, &str)] = &[
    ("rust", "programming"),
    ("code", "programming"),
    ("compiler", "programming"),
    ("server", "infrastructure"),
    ("deploy", "infrastructure"),
    ("docker", "infrastructure"),
    ("linux", "infrastructure"),
    ("song", "music"),
    ("music", "music"),
    ("synth", "music"),
    ("album", "music"),
    ("game", "games"),
    ("gaming", "games"),
    ("movie", "films"),
    ("film", "films"),
    ("book", "reading"),
    ("novel", "reading"),
    ("dream", "dreams"),
    ("travel", "travel"),
    ("trip", "travel"),
    ("ai", "ai"),
    ("model", "ai"),
    ("llm", "ai"),
];

const OPINION_MARKERS: &[&str] = &["i think", "i believe", "i feel", "imo", "in my opinion"];

/// What one user message taught the scheduler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Learned {
    pub interests: Vec<String>,
    pub entities: Vec<String>,
    pub is_question: bool,
    pub is_opinion: bool,
    /// Engagement boost granted because the message answered a recent
    /// impulse, if any.
    pub response_boost: Option<f64>,
}

/// Extract interests and topics from a user message and book the message
/// into the scheduler state. Called from the transport adapters.
pub fn extract_learned(state: &mut ImpulseState, text: &str) -> Learned {
    let now_ms = Utc::now().timestamp_millis();
    extract_learned_at(state, text, now_ms)
}

pub(crate) fn extract_learned_at(state: &mut ImpulseState, text: &str, now_ms: i64) -> Learned {
    let lower = text.to_lowercase();
    let mut learned = Learned {
        is_question: text.contains('?'),
        is_opinion: OPINION_MARKERS.iter().any(|m| lower.contains(m)),
        response_boost: state.record_user_message(now_ms),
        ..Default::default()
    };

    for (keyword, topic) in TOPIC_KEYWORDS {
        let hit = lower
            .split(|c: char| !c.is_alphanumeric())
            .any(|word| word == *keyword);
        if hit && !learned.interests.contains(&topic.to_string()) {
            learned.interests.push(topic.to_string());
            state.bump_interest(topic, 0.15);
        }
    }

    // Capitalized mid-sentence words are a cheap entity heuristic.
    for window in text.split_whitespace().collect::<Vec<_>>().windows(2) {
        let candidate = window[1].trim_matches(|c: char| !c.is_alphanumeric());
        let prev_ends_sentence = window[0].ends_with(['.', '!', '?']);
        if !prev_ends_sentence
            && candidate.len() > 2
            && candidate.chars().next().is_some_and(|c| c.is_uppercase())
            && !learned.entities.contains(&candidate.to_string())
        {
            learned.entities.push(candidate.to_string());
        }
    }

    learned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ImpulseKind;

    #[test]
    fn keywords_become_interests() {
        let mut state = ImpulseState::default();
        let learned = extract_learned_at(&mut state, "been writing rust code all day", 1_000);
        assert_eq!(learned.interests, vec!["programming"]);
        assert!(state.interests.contains_key("programming"));
    }

    #[test]
    fn question_and_opinion_are_detected() {
        let mut state = ImpulseState::default();
        let learned =
            extract_learned_at(&mut state, "I think the new synth is great, right?", 1_000);
        assert!(learned.is_question);
        assert!(learned.is_opinion);
        assert!(learned.interests.contains(&"music".to_string()));
    }

    #[test]
    fn entities_skip_sentence_starts() {
        let mut state = ImpulseState::default();
        let learned = extract_learned_at(
            &mut state,
            "Today we talked about Lisbon. Then nothing else.",
            1_000,
        );
        assert!(learned.entities.contains(&"Lisbon".to_string()));
        assert!(!learned.entities.contains(&"Then".to_string()));
    }

    #[test]
    fn answering_an_impulse_boosts_engagement() {
        let mut state = ImpulseState::default();
        state.record_fire(ImpulseKind::AskQuestion, 0);
        let before = state.engagement;
        let learned = extract_learned_at(&mut state, "yes!", 10 * 60 * 1000);
        assert!(learned.response_boost.is_some());
        assert!(state.engagement > before);
    }

    #[test]
    fn repeated_keyword_adds_interest_once() {
        let mut state = ImpulseState::default();
        let learned = extract_learned_at(&mut state, "music music music", 1_000);
        assert_eq!(learned.interests.len(), 1);
    }
}
