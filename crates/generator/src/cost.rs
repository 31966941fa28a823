use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::{estimate_tokens, ChatMessage, GenerateOptions, Generator};
use soul_bus::{kinds, throttle, EventBus};

/// Trailing retention window for daily aggregates.
pub const COST_WINDOW_DAYS: i64 = 90;
/// Ledger writes are debounced to every N tracked calls.
const FLUSH_EVERY: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostCategory {
    Conversation,
    Impulse,
    Heartbeat,
    Reflection,
    Consolidation,
}

impl CostCategory {
    pub fn name(&self) -> &'static str {
        match self {
            CostCategory::Conversation => "conversation",
            CostCategory::Impulse => "impulse",
            CostCategory::Heartbeat => "heartbeat",
            CostCategory::Reflection => "reflection",
            CostCategory::Consolidation => "consolidation",
        }
    }
}

/// One day × category aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    pub date: String,
    pub category: CostCategory,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub calls: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Ledger {
    records: Vec<CostRecord>,
    /// Date for which the budget event already fired, if any.
    #[serde(default)]
    budget_emitted_on: Option<String>,
}

impl Ledger {
    fn trim(&mut self, today: &str) {
        let cutoff = chrono::NaiveDate::parse_from_str(today, "%Y-%m-%d")
            .map(|d| d - chrono::Duration::days(COST_WINDOW_DAYS));
        if let Ok(cutoff) = cutoff {
            self.records.retain(|r| {
                chrono::NaiveDate::parse_from_str(&r.date, "%Y-%m-%d")
                    .map(|d| d > cutoff)
                    .unwrap_or(false)
            });
        }
    }

    fn day_total(&self, date: &str) -> u64 {
        self.records
            .iter()
            .filter(|r| r.date == date)
            .map(|r| r.input_tokens + r.output_tokens)
            .sum()
    }
}

/// Decorator attributing every generator call to a category and keeping the
/// 90-day daily ledger in `.soul-cost.json`.
pub struct CostTracker {
    inner: Arc<dyn Generator>,
    bus: EventBus,
    path: PathBuf,
    ledger: Mutex<Ledger>,
    calls_since_flush: AtomicU32,
    /// 0 disables the daily budget.
    daily_budget: u64,
}

impl CostTracker {
    pub fn new(
        inner: Arc<dyn Generator>,
        bus: EventBus,
        root: &Path,
        daily_budget: u64,
    ) -> Self {
        let path = root.join(".soul-cost.json");
        let ledger = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            inner,
            bus,
            path,
            ledger: Mutex::new(ledger),
            calls_since_flush: AtomicU32::new(0),
            daily_budget,
        }
    }

    /// Generate with attribution. Token usage is estimated as `⌈chars/4⌉`
    /// over the full input and the output.
    pub async fn generate(
        &self,
        category: CostCategory,
        system: &str,
        history: &[ChatMessage],
        user: &str,
        options: &GenerateOptions,
    ) -> Result<String> {
        let input_tokens = estimate_tokens(system)
            + history.iter().map(|m| estimate_tokens(&m.content)).sum::<u64>()
            + estimate_tokens(user);

        let output = self.inner.generate(system, history, user, options).await?;
        let output_tokens = estimate_tokens(&output);

        self.record(category, input_tokens, output_tokens);
        Ok(output)
    }

    fn record(&self, category: CostCategory, input_tokens: u64, output_tokens: u64) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let mut ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());

        match ledger
            .records
            .iter_mut()
            .find(|r| r.date == today && r.category == category)
        {
            Some(record) => {
                record.input_tokens += input_tokens;
                record.output_tokens += output_tokens;
                record.calls += 1;
            }
            None => ledger.records.push(CostRecord {
                date: today.clone(),
                category,
                input_tokens,
                output_tokens,
                calls: 1,
            }),
        }
        ledger.trim(&today);

        if self.daily_budget > 0
            && ledger.day_total(&today) > self.daily_budget
            && ledger.budget_emitted_on.as_deref() != Some(today.as_str())
        {
            ledger.budget_emitted_on = Some(today.clone());
            self.bus.emit_from(
                kinds::COST_BUDGET_EXCEEDED,
                "cost",
                json!({
                    "date": today,
                    "total_tokens": ledger.day_total(&today),
                    "budget": self.daily_budget,
                }),
            );
        }

        let pending = self.calls_since_flush.fetch_add(1, Ordering::Relaxed) + 1;
        if pending >= FLUSH_EVERY {
            self.calls_since_flush.store(0, Ordering::Relaxed);
            self.persist(&ledger);
        }
    }

    /// Force the ledger to disk. Called at shutdown.
    pub fn flush(&self) {
        let ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        self.persist(&ledger);
        debug!("[cost] ledger flushed");
    }

    /// Records for one day, for status surfaces.
    pub fn day_records(&self, date: &str) -> Vec<CostRecord> {
        let ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        ledger
            .records
            .iter()
            .filter(|r| r.date == date)
            .cloned()
            .collect()
    }

    fn persist(&self, ledger: &Ledger) {
        let result = serde_json::to_string_pretty(ledger)
            .map_err(anyhow::Error::from)
            .and_then(|body| std::fs::write(&self.path, body).map_err(Into::into));
        if let Err(err) = result {
            throttle::log_write_error(&self.path, &format!("{err:#}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockGenerator;

    fn tracker(dir: &Path, budget: u64) -> (Arc<MockGenerator>, CostTracker, EventBus) {
        let mock = Arc::new(MockGenerator::new());
        let bus = EventBus::new();
        let tracker = CostTracker::new(mock.clone(), bus.clone(), dir, budget);
        (mock, tracker, bus)
    }

    #[tokio::test]
    async fn calls_are_aggregated_per_day_and_category() {
        let dir = tempfile::tempdir().unwrap();
        let (mock, tracker, _bus) = tracker(dir.path(), 0);
        mock.push_reply("12345678"); // 2 output tokens
        mock.push_reply("1234"); // 1 output token

        let opts = GenerateOptions::with_budget(64);
        tracker
            .generate(CostCategory::Impulse, "sys!", &[], "12345678", &opts)
            .await
            .unwrap();
        tracker
            .generate(CostCategory::Impulse, "sys!", &[], "1234", &opts)
            .await
            .unwrap();

        let today = Utc::now().format("%Y-%m-%d").to_string();
        let records = tracker.day_records(&today);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].calls, 2);
        assert_eq!(records[0].input_tokens, 1 + 2 + 1 + 1); // sys + user per call
        assert_eq!(records[0].output_tokens, 3);
    }

    #[tokio::test]
    async fn budget_event_fires_at_most_once_per_day() {
        let dir = tempfile::tempdir().unwrap();
        let (mock, tracker, bus) = tracker(dir.path(), 2);
        for _ in 0..5 {
            mock.push_reply("a very long reply that blows the tiny budget");
        }

        let opts = GenerateOptions::with_budget(64);
        for _ in 0..5 {
            tracker
                .generate(CostCategory::Conversation, "", &[], "hi", &opts)
                .await
                .unwrap();
        }

        let fired = bus
            .recent(50)
            .into_iter()
            .filter(|p| p.kind == "cost.budget-exceeded")
            .count();
        assert_eq!(fired, 1);
    }

    #[tokio::test]
    async fn flush_persists_and_reload_restores() {
        let dir = tempfile::tempdir().unwrap();
        let (mock, tracker, bus) = tracker(dir.path(), 0);
        mock.push_reply("ok");

        let opts = GenerateOptions::with_budget(64);
        tracker
            .generate(CostCategory::Heartbeat, "", &[], "check", &opts)
            .await
            .unwrap();
        tracker.flush();

        let reloaded = CostTracker::new(Arc::new(MockGenerator::new()), bus, dir.path(), 0);
        let today = Utc::now().format("%Y-%m-%d").to_string();
        assert_eq!(reloaded.day_records(&today).len(), 1);
    }

    #[tokio::test]
    async fn failed_generation_is_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let (mock, tracker, _bus) = tracker(dir.path(), 0);
        mock.push_failure("backend down");

        let opts = GenerateOptions::with_budget(64);
        let result = tracker
            .generate(CostCategory::Reflection, "", &[], "x", &opts)
            .await;
        assert!(result.is_err());

        let today = Utc::now().format("%Y-%m-%d").to_string();
        assert!(tracker.day_records(&today).is_empty());
    }
}
