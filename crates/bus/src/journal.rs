use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::event::EventProjection;
use crate::throttle;

/// In-memory ring of compact projections.
pub const RECENT_RING_CAPACITY: usize = 200;
/// File journal line cap.
pub const JOURNAL_MAX_LINES: usize = 100;

enum WriterMsg {
    Line(EventProjection),
    Mood(Value),
    Drain(oneshot::Sender<()>),
}

/// Serial writer for the cross-process journal and the mood side-channel.
///
/// All writes are best-effort: a failed write is logged (rate-limited per
/// path) and never surfaces to the emitter. Appends that arrive while a
/// flush is in flight coalesce into the next flush.
pub(crate) struct JournalWriter {
    tx: mpsc::UnboundedSender<WriterMsg>,
}

impl JournalWriter {
    pub(crate) fn spawn(root: &Path) -> Self {
        let journal_path = root.join(".soul-events").join("current.jsonl");
        let mood_path = root.join(".soul-mood");
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_loop(rx, journal_path, mood_path));
        Self { tx }
    }

    pub(crate) fn append(&self, projection: EventProjection) {
        let _ = self.tx.send(WriterMsg::Line(projection));
    }

    pub(crate) fn mood_snapshot(&self, payload: Value) {
        let _ = self.tx.send(WriterMsg::Mood(payload));
    }

    pub(crate) async fn drain(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(WriterMsg::Drain(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

async fn writer_loop(
    mut rx: mpsc::UnboundedReceiver<WriterMsg>,
    journal_path: PathBuf,
    mood_path: PathBuf,
) {
    let mut lines: VecDeque<String> = VecDeque::with_capacity(JOURNAL_MAX_LINES);
    let mut pending_mood: Option<Value> = None;
    let mut pending_acks: Vec<oneshot::Sender<()>> = Vec::new();

    while let Some(first) = rx.recv().await {
        let mut journal_dirty = false;
        let mut batch = vec![first];
        // Coalesce everything already queued into one flush.
        while let Ok(msg) = rx.try_recv() {
            batch.push(msg);
        }

        for msg in batch {
            match msg {
                WriterMsg::Line(projection) => {
                    if let Ok(line) = serde_json::to_string(&projection) {
                        if lines.len() >= JOURNAL_MAX_LINES {
                            lines.pop_front();
                        }
                        lines.push_back(line);
                        journal_dirty = true;
                    }
                }
                WriterMsg::Mood(payload) => pending_mood = Some(payload),
                WriterMsg::Drain(ack) => pending_acks.push(ack),
            }
        }

        if journal_dirty {
            let body: String = lines.iter().map(|l| format!("{l}\n")).collect();
            if let Err(err) = write_full(&journal_path, &body).await {
                throttle::log_write_error(&journal_path, &err);
            }
        }

        if let Some(payload) = pending_mood.take() {
            let line = payload.to_string();
            if let Err(err) = write_full(&mood_path, &line).await {
                throttle::log_write_error(&mood_path, &err);
            }
        }

        for ack in pending_acks.drain(..) {
            let _ = ack.send(());
        }
    }
}

async fn write_full(path: &Path, body: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, body).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::kinds;
    use serde_json::json;

    #[tokio::test]
    async fn journal_is_capped_and_skips_high_frequency_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let bus = crate::EventBus::with_journal(dir.path(), false);

        for _ in 0..(JOURNAL_MAX_LINES + 30) {
            bus.emit(kinds::MEMORY_WRITTEN, json!({}));
        }
        bus.emit(kinds::IMPULSE_TICK, json!({}));
        bus.emit(kinds::PULSE_WRITTEN, json!({}));
        bus.drain_journal().await;

        let raw = std::fs::read_to_string(dir.path().join(".soul-events/current.jsonl")).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), JOURNAL_MAX_LINES);
        assert!(!raw.contains("impulse.tick"));
        assert!(!raw.contains("pulse.written"));
    }

    #[tokio::test]
    async fn mood_changed_writes_side_channel_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let bus = crate::EventBus::with_journal(dir.path(), false);

        bus.emit(
            kinds::MOOD_CHANGED,
            json!({"valence": 0.4, "energy": 0.6, "label": "curious", "trigger": "test", "since": 0}),
        );
        bus.drain_journal().await;

        let raw = std::fs::read_to_string(dir.path().join(".soul-mood")).unwrap();
        let parsed: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["label"], "curious");
        assert_eq!(parsed["valence"], 0.4);
    }

    #[tokio::test]
    async fn journal_lines_round_trip_as_projections() {
        let dir = tempfile::tempdir().unwrap();
        let bus = crate::EventBus::with_journal(dir.path(), false);
        bus.emit_from(kinds::MESSAGE_RECEIVED, "whatsapp", json!({"user": "d"}));
        bus.drain_journal().await;

        let raw = std::fs::read_to_string(dir.path().join(".soul-events/current.jsonl")).unwrap();
        let proj: EventProjection = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(proj.kind, "message.received");
        assert_eq!(proj.source, "whatsapp");
        assert_eq!(proj.user.as_deref(), Some("d"));
    }
}
