use std::collections::BTreeSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::Decision;
use soul_bus::kinds;

const FAST_INTERVAL_MS: i64 = 30 * 60 * 1000;
const DEEP_INTERVAL_MS: i64 = 4 * 60 * 60 * 1000;
const FAST_EVENT_THRESHOLD: u64 = 20;
const DEEP_EVENT_THRESHOLD: u64 = 100;

/// Which blocks each event kind dirties.
pub const DIRTY_TABLE: &[(&str, &[&str])] = &[
    (kinds::MESSAGE_RECEIVED, &["MEM", "BONDS"]),
    (kinds::HEARTBEAT_COMPLETED, &["STATE", "DREAMS"]),
    (kinds::INTEREST_DETECTED, &["INTERESTS"]),
    (kinds::PERFORMANCE_DETECTED, &["SHADOW"]),
    (kinds::RLUF_FEEDBACK, &["BONDS", "GROWTH"]),
    (kinds::REFLECTION_COMPLETED, &["STATE", "GROWTH"]),
    (kinds::MEMORY_WRITTEN, &["MEM"]),
    (kinds::MEDIA_STORED, &["MEM"]),
    (kinds::IMPULSE_FIRED, &["STATE"]),
    (kinds::MOOD_CHANGED, &["STATE"]),
    (kinds::CORRECTION_APPLIED, &["OPEN"]),
];

/// Blocks dirtied by one event kind, per the fixed table.
pub fn blocks_for_event(kind: &str) -> &'static [&'static str] {
    DIRTY_TABLE
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, blocks)| *blocks)
        .unwrap_or(&[])
}

/// Accumulated re-derivation debt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirtyState {
    pub dirty_blocks: BTreeSet<String>,
    pub events_since_fast: u64,
    pub events_since_deep: u64,
    pub last_fast_ts: i64,
    pub last_deep_ts: i64,
}

impl Default for DirtyState {
    fn default() -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            dirty_blocks: BTreeSet::new(),
            events_since_fast: 0,
            events_since_deep: 0,
            last_fast_ts: now,
            last_deep_ts: now,
        }
    }
}

impl DirtyState {
    pub fn record_event(&mut self, kind: &str) {
        for block in blocks_for_event(kind) {
            self.dirty_blocks.insert(block.to_string());
        }
        self.events_since_fast += 1;
        self.events_since_deep += 1;
    }

    /// The §4.F scheduling decision.
    pub fn decide(&self, now_ms: i64) -> Decision {
        if now_ms - self.last_deep_ts >= DEEP_INTERVAL_MS
            || self.events_since_deep >= DEEP_EVENT_THRESHOLD
        {
            return Decision::Deep;
        }
        if !self.dirty_blocks.is_empty()
            && (now_ms - self.last_fast_ts >= FAST_INTERVAL_MS
                || self.events_since_fast >= FAST_EVENT_THRESHOLD)
        {
            return Decision::Fast;
        }
        Decision::None
    }

    /// A fast pass consumed these blocks.
    pub fn complete_fast(&mut self, now_ms: i64, consumed: &[String]) {
        for block in consumed {
            self.dirty_blocks.remove(block);
        }
        self.events_since_fast = 0;
        self.last_fast_ts = now_ms;
    }

    /// A deep pass consumed everything.
    pub fn complete_deep(&mut self, now_ms: i64) {
        self.dirty_blocks.clear();
        self.events_since_fast = 0;
        self.events_since_deep = 0;
        self.last_fast_ts = now_ms;
        self.last_deep_ts = now_ms;
    }
}
