//! Mechanical templaters — pure functions of on-disk files and the affect
//! snapshot. These run on the fast path and never touch the generator.

use std::path::Path;

use soul_affect::AffectState;

/// Blocks the fast pass may re-derive mechanically. Everything else waits
/// for the deep pass.
pub const MECHANICAL_BLOCKS: &[&str] = &["STATE", "INTERESTS"];

/// New `@STATE` body from the current affect snapshot.
pub fn state_template(affect: &AffectState) -> String {
    let mood = affect.mood();
    let field = affect.field();
    format!(
        "mood:{} | valence:{:.2} | energy:{:.2}\nfocus:{}\ncondition:{}",
        mood.label,
        mood.valence,
        mood.energy,
        field.dominant().name(),
        field.label(),
    )
}

/// New `@INTERESTS` body from the impulse checkpoint on disk. `None` when
/// no checkpoint exists or it tracks nothing.
pub fn interests_template(root: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(root.join(".soul-impulse-state")).ok()?;
    let parsed: serde_json::Value = serde_json::from_str(&raw).ok()?;
    let interests = parsed.get("interests")?.as_object()?;
    if interests.is_empty() {
        return None;
    }

    let mut pairs: Vec<(String, f64)> = interests
        .iter()
        .filter_map(|(topic, weight)| weight.as_f64().map(|w| (topic.clone(), w)))
        .collect();
    pairs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    Some(
        pairs
            .iter()
            .map(|(topic, weight)| format!("{topic}:{weight:.2}"))
            .collect::<Vec<_>>()
            .join(" | "),
    )
}
