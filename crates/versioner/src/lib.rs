//! Version history for the soul root — a debounced, event-driven commit
//! layer over git, providing the recovery substrate for the consolidator
//! and drift detection across identity-document revisions.
//!
//! All git work goes through the `git` binary as a subprocess; every call
//! is best-effort with a hard timeout, and a history failure never crashes
//! the engine — it logs and returns an error.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use soul_bus::{kinds, EventBus};
use soul_seed::{diff as seed_diff, SeedDocument, SeedStore, validate};

const GIT_TIMEOUT: Duration = Duration::from_secs(30);
const RECOVERY_DEPTH: usize = 5;
const SEED_FILE: &str = "SEED.md";

/// Runtime artifacts that never belong in history.
const IGNORED_PATHS: &[&str] = &[
    ".soul-pulse",
    ".soul-mood",
    ".soul-events/",
    ".soul-impulse-state",
    ".soul-impulse-log",
    ".soul-allostatic-field",
    ".soul-field",
    ".soul-cost.json",
    ".soul-audit.jsonl",
    ".soul-audit-*.jsonl",
    ".soul-index/",
    ".session-active",
    ".env.enc",
    "*.tmp",
];

#[derive(Debug, Error)]
pub enum VersionerError {
    #[error("invalid commit hash: {0:?}")]
    InvalidHash(String),
    #[error("git {args:?} failed: {stderr}")]
    Git { args: Vec<String>, stderr: String },
    #[error("git {0:?} timed out")]
    Timeout(Vec<String>),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRecord {
    pub hash: String,
    pub ts: i64,
    pub message: String,
}

#[derive(Debug, Clone)]
struct QueuedChange {
    kind: String,
    detail: String,
}

struct VersionerInner {
    root: PathBuf,
    bus: EventBus,
    debounce: Duration,
    queue: Mutex<Vec<QueuedChange>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// Debounced commit layer. Cheap to clone; all clones share the queue.
#[derive(Clone)]
pub struct Versioner {
    inner: Arc<VersionerInner>,
}

impl Versioner {
    pub fn new(root: impl Into<PathBuf>, bus: EventBus, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(VersionerInner {
                root: root.into(),
                bus,
                debounce,
                queue: Mutex::new(Vec::new()),
                timer: Mutex::new(None),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Create the repository when missing, ensure the ignore list, and make
    /// sure at least one commit exists.
    pub async fn init(&self) -> Result<()> {
        let root = &self.inner.root;
        if !root.join(".git").exists() {
            self.run_git(&["init"]).await?;
            info!(root = %root.display(), "[versioner] initialised repository");
        }
        self.ensure_ignore_list()?;

        if self.run_git(&["rev-parse", "HEAD"]).await.is_err() {
            self.run_git(&["add", "-A"]).await?;
            self.run_git(&["commit", "-m", "[init] founding state", "--no-verify"])
                .await?;
            info!("[versioner] founding commit created");
        }
        Ok(())
    }

    /// Queue a dirty entry and (re)arm the debounce timer. Each arrival
    /// pushes the flush out by the full debounce window.
    pub fn queue(&self, kind: &str, detail: &str) {
        {
            let mut queue = self.inner.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.push(QueuedChange {
                kind: kind.to_string(),
                detail: detail.to_string(),
            });
        }

        let versioner = self.clone();
        let delay = self.inner.debounce;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = versioner.flush().await {
                warn!(error = %err, "[versioner] debounced flush failed");
            }
        });

        let mut timer = self.inner.timer.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = timer.replace(handle) {
            old.abort();
        }
    }

    /// Coalesce the queue into one commit. Returns the new hash, or `None`
    /// when the queue was empty or the tree was clean.
    pub async fn flush(&self) -> Result<Option<String>> {
        let drained: Vec<QueuedChange> = {
            let mut queue = self.inner.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.drain(..).collect()
        };
        if drained.is_empty() {
            return Ok(None);
        }

        let message = commit_message(&drained);
        self.commit(&message).await
    }

    /// Stage everything and commit iff the tree differs. Captures the prior
    /// seed revision first so drift detection can compare across the commit.
    pub async fn commit(&self, message: &str) -> Result<Option<String>> {
        let prior_seed = self
            .run_git(&["show", &format!("HEAD:{SEED_FILE}")])
            .await
            .ok();

        self.run_git(&["add", "-A"]).await?;

        // Exit code 0 means nothing staged.
        if self
            .run_git(&["diff", "--cached", "--quiet"])
            .await
            .is_ok()
        {
            return Ok(None);
        }

        self.run_git(&["commit", "-m", message, "--no-verify"]).await?;
        let hash = self.run_git(&["rev-parse", "HEAD"]).await?.trim().to_string();

        info!(%hash, message, "[versioner] committed");
        self.inner.bus.emit_from(
            kinds::STATE_COMMITTED,
            "versioner",
            json!({"hash": hash, "message": message}),
        );

        self.detect_drift(prior_seed.as_deref()).await;
        Ok(Some(hash))
    }

    /// Compare the seed across the commit boundary and publish the diff.
    async fn detect_drift(&self, prior_seed: Option<&str>) {
        let Some(prior_raw) = prior_seed else { return };
        let current_raw = match std::fs::read_to_string(self.inner.root.join(SEED_FILE)) {
            Ok(raw) => raw,
            Err(_) => return,
        };
        let (Ok(old), Ok(new)) = (
            SeedDocument::parse(prior_raw),
            SeedDocument::parse(&current_raw),
        ) else {
            return;
        };

        let summary = seed_diff(&old, &new);
        if summary.changed {
            self.inner.bus.emit_from(
                kinds::SEED_DRIFT_DETECTED,
                "versioner",
                serde_json::to_value(&summary).unwrap_or_default(),
            );
        }
    }

    /// Commit log, optionally scoped to one path.
    pub async fn history(&self, path: Option<&str>, limit: usize) -> Result<Vec<CommitRecord>> {
        let limit_arg = format!("-n{limit}");
        let mut args = vec!["log", "--format=%H%x09%ct%x09%s", limit_arg.as_str()];
        if let Some(path) = path {
            args.push("--");
            args.push(path);
        }
        let out = self.run_git(&args).await?;
        Ok(parse_log(&out))
    }

    /// Patch text for one commit. The hash is the only untrusted input that
    /// crosses into the subprocess layer; validate before use.
    pub async fn diff(&self, hash: &str) -> Result<String> {
        Self::check_hash(hash)?;
        Ok(self.run_git(&["show", hash]).await?)
    }

    /// Commits since a point in time (anything `git log --since` accepts).
    pub async fn timeline(&self, since: &str) -> Result<Vec<CommitRecord>> {
        let since_arg = format!("--since={since}");
        let out = self
            .run_git(&["log", "--format=%H%x09%ct%x09%s", since_arg.as_str()])
            .await?;
        Ok(parse_log(&out))
    }

    /// Produce a forward commit inverting `hash`. History is never rewritten.
    pub async fn revert(&self, hash: &str) -> Result<String> {
        Self::check_hash(hash)?;
        self.run_git(&["revert", "--no-edit", hash]).await?;
        let new_hash = self.run_git(&["rev-parse", "HEAD"]).await?.trim().to_string();

        info!(target_hash = hash, %new_hash, "[versioner] reverted");
        self.inner.bus.emit_from(
            kinds::STATE_ROLLED_BACK,
            "versioner",
            json!({"reverted": hash, "hash": new_hash}),
        );
        Ok(new_hash)
    }

    /// Walk the last commits of the seed in reverse and restore the first
    /// revision that validates. Idempotent when the working copy is already
    /// valid.
    pub async fn recover_last_valid(&self, store: &SeedStore) -> Result<String> {
        if let Ok(current) = std::fs::read_to_string(store.path()) {
            if validate(&current).valid {
                return Ok("current".to_string());
            }
        }

        let commits = self.history(Some(SEED_FILE), RECOVERY_DEPTH).await?;
        for record in &commits {
            let shown = self
                .run_git(&["show", &format!("{}:{SEED_FILE}", record.hash)])
                .await;
            let Ok(content) = shown else { continue };
            if !validate(&content).valid {
                continue;
            }

            store.persist(&content)?;
            info!(hash = %record.hash, "[versioner] seed recovered from history");
            self.inner.bus.emit_from(
                kinds::SEED_RECOVERED,
                "versioner",
                json!({"hash": record.hash, "depth": commits.len()}),
            );
            return Ok(record.hash.clone());
        }

        warn!(depth = RECOVERY_DEPTH, "[versioner] no valid seed revision found");
        self.inner.bus.emit_from(
            kinds::SEED_RECOVERY_FAILED,
            "versioner",
            json!({"depth": RECOVERY_DEPTH}),
        );
        anyhow::bail!(soul_seed::SeedError::NoValidRevision(RECOVERY_DEPTH))
    }

    /// Final flush plus a session-end marker commit.
    pub async fn shutdown(&self) {
        {
            let mut timer = self.inner.timer.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(handle) = timer.take() {
                handle.abort();
            }
        }
        if let Err(err) = self.flush().await {
            warn!(error = %err, "[versioner] shutdown flush failed");
        }
        if let Err(err) = self.commit("[session] end").await {
            warn!(error = %err, "[versioner] session-end commit failed");
        }
    }

    fn check_hash(hash: &str) -> Result<(), VersionerError> {
        let ok = (4..=40).contains(&hash.len())
            && hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase());
        if ok {
            Ok(())
        } else {
            Err(VersionerError::InvalidHash(hash.to_string()))
        }
    }

    fn ensure_ignore_list(&self) -> Result<()> {
        let path = self.inner.root.join(".gitignore");
        let existing = std::fs::read_to_string(&path).unwrap_or_default();
        let mut out = existing.clone();
        for entry in IGNORED_PATHS {
            if !existing.lines().any(|l| l.trim() == *entry) {
                out.push_str(entry);
                out.push('\n');
            }
        }
        if out != existing {
            std::fs::write(&path, out)?;
        }
        Ok(())
    }

    async fn run_git(&self, args: &[&str]) -> Result<String, VersionerError> {
        let args_owned: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let fut = tokio::process::Command::new("git")
            .args(args)
            .current_dir(&self.inner.root)
            .env("GIT_AUTHOR_NAME", "Soul Engine")
            .env("GIT_AUTHOR_EMAIL", "soul@localhost")
            .env("GIT_COMMITTER_NAME", "Soul Engine")
            .env("GIT_COMMITTER_EMAIL", "soul@localhost")
            .output();

        let out = tokio::time::timeout(GIT_TIMEOUT, fut)
            .await
            .map_err(|_| VersionerError::Timeout(args_owned.clone()))??;

        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).to_string())
        } else {
            Err(VersionerError::Git {
                args: args_owned,
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            })
        }
    }
}

fn commit_message(changes: &[QueuedChange]) -> String {
    let mut kinds: Vec<&str> = Vec::new();
    for change in changes {
        if !kinds.contains(&change.kind.as_str()) {
            kinds.push(&change.kind);
        }
    }
    if kinds.len() == 1 {
        format!("[{}] {}", kinds[0], changes.last().map(|c| c.detail.as_str()).unwrap_or(""))
    } else {
        format!("[auto] {} changes: {}", changes.len(), kinds.join(", "))
    }
}

fn parse_log(out: &str) -> Vec<CommitRecord> {
    out.lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, '\t');
            let hash = parts.next()?.to_string();
            let ts = parts.next()?.parse().ok()?;
            let message = parts.next().unwrap_or("").to_string();
            Some(CommitRecord { hash, ts, message })
        })
        .collect()
}
