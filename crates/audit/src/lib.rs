//! Append-only security journal.
//!
//! Subscribes to a fixed allowlist of security-relevant event kinds and
//! appends compact JSON lines to `.soul-audit.jsonl`. The current file
//! rotates into an immutable per-month archive on month change and at
//! 5 MiB. The audit logger is the sole writer of these files.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use soul_bus::{kinds, Event, EventBus};

const CURRENT_FILE: &str = ".soul-audit.jsonl";
const MAX_FILE_BYTES: u64 = 5 * 1024 * 1024;

/// Event kinds that enter the audit trail.
pub const AUDIT_ALLOWLIST: &[&str] = &[
    kinds::SEED_VALIDATION_FAILED,
    kinds::SEED_DRIFT_DETECTED,
    kinds::SEED_RECOVERED,
    kinds::SEED_RECOVERY_FAILED,
    kinds::SEED_RECOVERY_MODE_ENTERED,
    kinds::SEED_MIGRATED,
    kinds::MOOD_CLAMPED,
    kinds::PERFORMANCE_DETECTED,
    kinds::STATE_ROLLED_BACK,
    kinds::SESSION_GUARD_WARNING,
    kinds::COST_BUDGET_EXCEEDED,
    "secrets.migrated",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ts: i64,
    pub event: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl AuditEntry {
    fn from_event(event: &Event) -> Self {
        Self {
            ts: event.ts_ms,
            event: event.kind.clone(),
            source: event.source.clone(),
            severity: event.field("severity").map(str::to_string),
            changes: event.payload.get("changes").cloned(),
            error: event.field("error").map(str::to_string),
            detail: match event.payload {
                serde_json::Value::Null => None,
                ref payload => Some(payload.clone()),
            },
        }
    }
}

struct AuditInner {
    root: PathBuf,
    /// `YYYY-MM` the current file is collecting for.
    month: Mutex<String>,
}

#[derive(Clone)]
pub struct AuditLogger {
    inner: Arc<AuditInner>,
}

impl AuditLogger {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(AuditInner {
                root: root.into(),
                month: Mutex::new(Utc::now().format("%Y-%m").to_string()),
            }),
        }
    }

    /// Subscribe to every allowlisted kind. The logger observes silently;
    /// append failures are recorded as handler errors on the bus.
    pub fn attach(&self, bus: &EventBus) {
        for kind in AUDIT_ALLOWLIST {
            let logger = self.clone();
            bus.on(kind, move |event| logger.append(&AuditEntry::from_event(event)));
        }
        info!(kinds = AUDIT_ALLOWLIST.len(), "[audit] attached to bus");
    }

    pub fn current_path(&self) -> PathBuf {
        self.inner.root.join(CURRENT_FILE)
    }

    /// Append one entry, rotating first when the month rolled over or the
    /// current file grew past the size cap.
    pub fn append(&self, entry: &AuditEntry) -> Result<()> {
        self.rotate_if_needed()?;

        use std::io::Write;
        let line = serde_json::to_string(entry)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.current_path())?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    fn rotate_if_needed(&self) -> Result<()> {
        let now_month = Utc::now().format("%Y-%m").to_string();
        let path = self.current_path();

        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let mut month = self.inner.month.lock().unwrap_or_else(|e| e.into_inner());

        if (*month != now_month && size > 0) || size > MAX_FILE_BYTES {
            let archive = self
                .inner
                .root
                .join(format!(".soul-audit-{}.jsonl", *month));
            // Archives are per-month; a size rotation within a month folds
            // into the same archive.
            if archive.exists() {
                let current = std::fs::read_to_string(&path).unwrap_or_default();
                let mut file = std::fs::OpenOptions::new().append(true).open(&archive)?;
                use std::io::Write;
                file.write_all(current.as_bytes())?;
                std::fs::remove_file(&path)?;
            } else if let Err(err) = std::fs::rename(&path, &archive) {
                warn!(error = %err, "[audit] rotation failed");
            }
            info!(archive = %archive.display(), "[audit] rotated");
        }
        *month = now_month;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn allowlisted_event_lands_in_audit_file() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let logger = AuditLogger::new(dir.path());
        logger.attach(&bus);

        bus.emit_from(
            kinds::SEED_VALIDATION_FAILED,
            "consolidator",
            json!({"error": "missing @KERN"}),
        );
        bus.emit(kinds::MESSAGE_RECEIVED, json!({"user": "d"}));

        let raw = std::fs::read_to_string(logger.current_path()).unwrap();
        assert_eq!(raw.lines().count(), 1);
        let entry: AuditEntry = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(entry.event, "seed.validation-failed");
        assert_eq!(entry.error.as_deref(), Some("missing @KERN"));
    }

    #[test]
    fn non_allowlisted_kinds_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        AuditLogger::new(dir.path()).attach(&bus);

        bus.emit(kinds::IMPULSE_FIRED, json!({}));
        bus.emit(kinds::MEMORY_WRITTEN, json!({}));
        assert!(!dir.path().join(CURRENT_FILE).exists());
    }

    #[test]
    fn month_change_rotates_into_archive() {
        let dir = tempfile::tempdir().unwrap();
        let logger = AuditLogger::new(dir.path());

        logger
            .append(&AuditEntry {
                ts: 0,
                event: "mood.clamped".into(),
                source: "affect".into(),
                severity: None,
                changes: None,
                error: None,
                detail: None,
            })
            .unwrap();

        // Simulate a file written last month.
        {
            let mut month = logger.inner.month.lock().unwrap();
            *month = "2020-01".to_string();
        }
        logger
            .append(&AuditEntry {
                ts: 1,
                event: "state.rolled-back".into(),
                source: "versioner".into(),
                severity: None,
                changes: None,
                error: None,
                detail: None,
            })
            .unwrap();

        let archive = dir.path().join(".soul-audit-2020-01.jsonl");
        assert!(archive.exists());
        let current = std::fs::read_to_string(logger.current_path()).unwrap();
        assert_eq!(current.lines().count(), 1);
        assert!(current.contains("state.rolled-back"));
    }
}
