use crate::sync::models::{
    EntityProgress, QueueEntry, SessionRecord, SyncEvent, SyncKind, SyncSession,
};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub const DEFAULT_HISTORY_LIMIT: usize = 50;
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct Inner {
    session: Option<SyncSession>,
    queue: VecDeque<QueueEntry>,
    history: VecDeque<SessionRecord>,
}

/// Single-flight gate and progress broadcaster for sync sessions.
///
/// Shared as `Arc<SyncStateManager>`. The lock is never held across an await point.
pub struct SyncStateManager {
    inner: Mutex<Inner>,
    events: broadcast::Sender<SyncEvent>,
    history_limit: usize,
}

impl Default for SyncStateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStateManager {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
            history_limit: history_limit.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: SyncEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Atomically claim the session. `None` means another session is active; the request is
    /// recorded in the advisory queue and the caller must not proceed.
    ///
    /// The queue holds at most one pending entry per [`SyncKind`]; a repeated request of the
    /// same kind refreshes that entry's unit count.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn try_start(&self, kind: SyncKind, total_units: usize) -> Option<SyncSession> {
        let event = {
            let mut inner = self.lock();
            if inner.session.is_some() {
                match inner.queue.iter_mut().find(|e| e.kind == kind) {
                    Some(pending) => pending.total_units = total_units,
                    None => inner.queue.push_back(QueueEntry {
                        kind,
                        total_units,
                        queued_at: Utc::now(),
                    }),
                }
                let queue_size = inner.queue.len();
                drop(inner);
                tracing::info!(%kind, queue_size, "sync already active; request queued");
                self.emit(SyncEvent::QueueUpdated {
                    queue_size,
                    dequeued: None,
                });
                return None;
            }
            let session = SyncSession::new(kind, total_units);
            inner.session = Some(session.clone());
            session
        };
        tracing::info!(session_id = %event.id, %kind, total_units, "sync session started");
        self.emit(SyncEvent::Started {
            session: event.clone(),
        });
        Some(event)
    }

    #[tracing::instrument(level = "debug", skip(self, entity_progress))]
    pub fn update_progress(
        &self,
        index: usize,
        label: &str,
        entity_progress: Option<EntityProgress>,
    ) {
        let snapshot = {
            let mut inner = self.lock();
            let Some(session) = inner.session.as_mut() else {
                tracing::debug!("progress update without an active session ignored");
                return;
            };
            session.current_index = index;
            session.current_label = label.to_string();
            session.entity_progress = entity_progress;
            session.clone()
        };
        self.emit(SyncEvent::Progress { session: snapshot });
    }

    /// Release the session and append it to history. Returns `None` if nothing was active.
    ///
    /// The advisory queue is cleared; its oldest entry is announced as the one to dispatch.
    #[tracing::instrument(level = "debug", skip(self, message))]
    pub fn end(&self, success: bool, message: impl Into<String>) -> Option<SessionRecord> {
        let message = message.into();
        let (record, dequeued, queue_size) = {
            let mut inner = self.lock();
            let session = inner.session.take()?;
            let ended_at = Utc::now();
            let completed_units = if success {
                session.total_units
            } else {
                (session.current_index + 1).min(session.total_units)
            };
            let record = SessionRecord {
                session_id: session.id,
                kind: session.kind,
                success,
                message,
                started_at: session.started_at,
                ended_at,
                duration_ms: (ended_at - session.started_at).num_milliseconds(),
                completed_units,
                total_units: session.total_units,
            };
            inner.history.push_back(record.clone());
            while inner.history.len() > self.history_limit {
                inner.history.pop_front();
            }
            let dequeued = inner.queue.pop_front();
            inner.queue.clear();
            (record, dequeued, 0)
        };

        tracing::info!(
            session_id = %record.session_id,
            success = record.success,
            duration_ms = record.duration_ms,
            "sync session ended"
        );
        self.emit(SyncEvent::Ended {
            record: record.clone(),
        });
        if let Some(entry) = dequeued {
            self.emit(SyncEvent::QueueUpdated {
                queue_size,
                dequeued: Some(entry),
            });
        }
        Some(record)
    }

    pub fn is_active(&self) -> bool {
        self.lock().session.is_some()
    }

    pub fn current(&self) -> Option<SyncSession> {
        self.lock().session.clone()
    }

    pub fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Most recent sessions first.
    pub fn history(&self, limit: usize) -> Vec<SessionRecord> {
        self.lock().history.iter().rev().take(limit).cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Deliver every event to `handler` on a background task until the returned handle is
    /// dropped or unsubscribed. Must be called inside a tokio runtime.
    pub fn on_event<F>(&self, handler: F) -> Subscription
    where
        F: Fn(SyncEvent) + Send + Sync + 'static,
    {
        let mut rx = self.events.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => handler(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "sync event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { task }
    }
}

/// Handle returned by [`SyncStateManager::on_event`]. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop aborts the task.
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
