use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use crate::event::{Event, EventProjection, kinds};
use crate::journal::{JournalWriter, RECENT_RING_CAPACITY};

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

const MAX_HANDLER_ERRORS: usize = 50;

/// Opaque registration handle returned by `on`/`on_task`, consumed by `off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerToken(u64);

/// A recorded listener failure, observable via [`EventBus::errors`].
#[derive(Debug, Clone)]
pub struct HandlerError {
    pub ts_ms: i64,
    pub kind: String,
    pub message: String,
}

#[derive(Clone)]
enum Handler {
    Sync(Arc<dyn Fn(&Event) -> Result<()> + Send + Sync>),
    Task(Arc<dyn Fn(Event) -> TaskFuture + Send + Sync>),
}

struct Registration {
    token: HandlerToken,
    handler: Handler,
}

struct BusInner {
    handlers: Mutex<HashMap<String, Vec<Registration>>>,
    recent: Mutex<VecDeque<EventProjection>>,
    errors: Mutex<VecDeque<HandlerError>>,
    next_id: AtomicU64,
    next_token: AtomicU64,
    journal: Option<JournalWriter>,
    debug_dump: bool,
}

/// The process-local fan-out channel. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// A bus with no file journal — in-memory ring and dispatch only.
    pub fn new() -> Self {
        Self::build(None, false)
    }

    /// A bus journaling to `<root>/.soul-events/current.jsonl` and mirroring
    /// mood shifts to `<root>/.soul-mood`. Spawns the writer task, so this
    /// must be called from within a tokio runtime.
    pub fn with_journal(root: &std::path::Path, debug_dump: bool) -> Self {
        Self::build(Some(JournalWriter::spawn(root)), debug_dump)
    }

    fn build(journal: Option<JournalWriter>, debug_dump: bool) -> Self {
        Self {
            inner: Arc::new(BusInner {
                handlers: Mutex::new(HashMap::new()),
                recent: Mutex::new(VecDeque::with_capacity(RECENT_RING_CAPACITY)),
                errors: Mutex::new(VecDeque::new()),
                next_id: AtomicU64::new(1),
                next_token: AtomicU64::new(1),
                journal,
                debug_dump,
            }),
        }
    }

    /// Register a synchronous listener. Long work must not run here; spawn a
    /// background task instead (or register with [`EventBus::on_task`]).
    pub fn on<F>(&self, kind: &str, handler: F) -> HandlerToken
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.register(kind, Handler::Sync(Arc::new(handler)))
    }

    /// Register a listener that returns a future. The bus spawns the future
    /// and records its eventual error without ever failing the emit.
    pub fn on_task<F>(&self, kind: &str, handler: F) -> HandlerToken
    where
        F: Fn(Event) -> TaskFuture + Send + Sync + 'static,
    {
        self.register(kind, Handler::Task(Arc::new(handler)))
    }

    fn register(&self, kind: &str, handler: Handler) -> HandlerToken {
        let token = HandlerToken(self.inner.next_token.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.inner.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers
            .entry(kind.to_string())
            .or_default()
            .push(Registration { token, handler });
        token
    }

    pub fn off(&self, kind: &str, token: HandlerToken) {
        let mut handlers = self.inner.handlers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = handlers.get_mut(kind) {
            list.retain(|reg| reg.token != token);
        }
    }

    pub fn emit(&self, kind: &str, payload: Value) -> u64 {
        self.emit_from(kind, "engine", payload)
    }

    /// Emit an event. Listeners run in registration order on the calling
    /// task; handler failures are recorded, never propagated.
    pub fn emit_from(&self, kind: &str, source: &str, payload: Value) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let event = Event::new(id, kind, source, payload);

        if self.inner.debug_dump {
            eprintln!("[bus] {}", serde_json::to_string(&event).unwrap_or_default());
        }

        self.record(&event);
        self.dispatch(&event);
        id
    }

    fn record(&self, event: &Event) {
        let projection = EventProjection::from(event);

        {
            let mut recent = self.inner.recent.lock().unwrap_or_else(|e| e.into_inner());
            if recent.len() >= RECENT_RING_CAPACITY {
                recent.pop_front();
            }
            recent.push_back(projection.clone());
        }

        if let Some(journal) = &self.inner.journal {
            // High-frequency kinds stay out of the cross-process journal.
            if event.kind != kinds::PULSE_WRITTEN && event.kind != kinds::IMPULSE_TICK {
                journal.append(projection);
            }
            if event.kind == kinds::MOOD_CHANGED {
                journal.mood_snapshot(event.payload.clone());
            }
        }
    }

    fn dispatch(&self, event: &Event) {
        // Snapshot the registration list so handlers may re-enter the bus
        // (emit, on, off) without deadlocking on the registry lock.
        let snapshot: Vec<Handler> = {
            let handlers = self.inner.handlers.lock().unwrap_or_else(|e| e.into_inner());
            match handlers.get(&event.kind) {
                Some(list) => list.iter().map(|reg| reg.handler.clone()).collect(),
                None => return,
            }
        };

        for handler in &snapshot {
            match handler {
                Handler::Sync(f) => {
                    if let Err(err) = f(event) {
                        self.record_error(&event.kind, &err);
                    }
                }
                Handler::Task(f) => {
                    let fut = f(event.clone());
                    let bus = self.clone();
                    let kind = event.kind.clone();
                    tokio::spawn(async move {
                        if let Err(err) = fut.await {
                            bus.record_error(&kind, &err);
                        }
                    });
                }
            }
        }
    }

    fn record_error(&self, kind: &str, err: &anyhow::Error) {
        warn!(kind, error = %err, "[bus] handler failed");
        let mut errors = self.inner.errors.lock().unwrap_or_else(|e| e.into_inner());
        if errors.len() >= MAX_HANDLER_ERRORS {
            errors.pop_front();
        }
        errors.push_back(HandlerError {
            ts_ms: Utc::now().timestamp_millis(),
            kind: kind.to_string(),
            message: format!("{err:#}"),
        });
    }

    /// The last `n` compact projections, oldest first.
    pub fn recent(&self, n: usize) -> Vec<EventProjection> {
        let recent = self.inner.recent.lock().unwrap_or_else(|e| e.into_inner());
        recent.iter().rev().take(n).rev().cloned().collect()
    }

    pub fn errors(&self) -> Vec<HandlerError> {
        let errors = self.inner.errors.lock().unwrap_or_else(|e| e.into_inner());
        errors.iter().cloned().collect()
    }

    /// Total events emitted so far.
    pub fn count(&self) -> u64 {
        self.inner.next_id.load(Ordering::SeqCst) - 1
    }

    /// Flush any pending journal writes. Called once at shutdown.
    pub async fn drain_journal(&self) {
        if let Some(journal) = &self.inner.journal {
            journal.drain().await;
        }
        debug!("[bus] journal drained");
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
