//! Rate-limited logging for best-effort disk writes.
//!
//! Pulse beacons, mood snapshots, checkpoints and ledgers are written on
//! every tick; when a disk fills up those failures must not flood the log.
//! Each path logs at most once per minute.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use tracing::warn;

const LOG_INTERVAL: Duration = Duration::from_secs(60);

static SLOTS: OnceLock<Mutex<HashMap<PathBuf, Instant>>> = OnceLock::new();

/// True when this path has not logged a failure in the last minute.
pub fn should_log(path: &Path) -> bool {
    let slots = SLOTS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut slots = slots.lock().unwrap_or_else(|e| e.into_inner());
    let now = Instant::now();
    match slots.get(path) {
        Some(last) if now.duration_since(*last) < LOG_INTERVAL => false,
        _ => {
            slots.insert(path.to_path_buf(), now);
            true
        }
    }
}

/// Log a best-effort write failure, at most once per minute per path.
pub fn log_write_error(path: &Path, err: &dyn std::fmt::Display) {
    if should_log(path) {
        warn!(path = %path.display(), error = %err, "best-effort write failed");
    }
}
