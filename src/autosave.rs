//! Debounced journal persistence.
//!
//! The editor fires a change notification on every keystroke; persisting each
//! one would hammer the storage endpoint. The queue coalesces a burst of
//! notifications into a single save after a quiet interval measured from the
//! *last* edit, skips saves whose content hash matches the last confirmed
//! persist, and flushes any pending edit on teardown so navigating away never
//! drops text.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flume::Sender;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::ClientConfig;
use crate::error::ApiError;

/// The journal persistence endpoint as the queue sees it. Implemented by
/// [`crate::api::ApiClient`] and by in-memory test doubles.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn save_document(&self, document: &Value) -> Result<(), ApiError>;
}

/// Outcomes of timer-driven saves, which have no awaiting caller.
#[derive(Debug, Clone)]
pub enum AutosaveEvent {
    Saved { snapshot_hash: String },
    SaveFailed { error: String },
}

/// Content hash of a serialized editor document.
pub fn snapshot_hash(snapshot: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_string(snapshot).unwrap_or_default().as_bytes());
    format!("{:x}", hasher.finalize())
}

struct PendingEdit {
    snapshot: Value,
    snapshot_hash: String,
    last_edit_at: DateTime<Utc>,
}

struct QueueState {
    last_persisted_hash: Option<String>,
    pending: Option<PendingEdit>,
    /// Bumped on every (re)schedule and on flush; a sleeping timer that wakes
    /// to a different generation was cancelled and must not persist.
    timer_gen: u64,
}

/// Coalesces edit notifications into delayed persist calls.
pub struct DebouncedPersistenceQueue<S: DocumentStore + 'static> {
    store: Arc<S>,
    delay: Duration,
    state: Arc<Mutex<QueueState>>,
    events: Sender<AutosaveEvent>,
}

impl<S: DocumentStore + 'static> DebouncedPersistenceQueue<S> {
    pub fn new(store: Arc<S>, config: &ClientConfig, events: Sender<AutosaveEvent>) -> Self {
        Self::with_delay(store, config.autosave_delay(), events)
    }

    pub fn with_delay(store: Arc<S>, delay: Duration, events: Sender<AutosaveEvent>) -> Self {
        Self {
            store,
            delay,
            state: Arc::new(Mutex::new(QueueState {
                last_persisted_hash: None,
                pending: None,
                timer_gen: 0,
            })),
            events,
        }
    }

    /// Record a fresh edit and (re)start the quiet-interval timer.
    ///
    /// No-op when the snapshot's content hash equals the last successfully
    /// persisted one. Repeated identical edits never issue redundant writes.
    pub fn notify(&self, snapshot: &Value) {
        let hash = snapshot_hash(snapshot);
        let generation = {
            let mut state = self.lock_state();
            if state.last_persisted_hash.as_deref() == Some(hash.as_str()) {
                // The editor is back at the persisted content; drop any
                // superseded draft still waiting on the timer.
                state.pending = None;
                state.timer_gen += 1;
                return;
            }
            state.pending = Some(PendingEdit {
                snapshot: snapshot.clone(),
                snapshot_hash: hash,
                last_edit_at: Utc::now(),
            });
            state.timer_gen += 1;
            state.timer_gen
        };

        let store = self.store.clone();
        let shared = self.state.clone();
        let events = self.events.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let state = lock_shared(&shared);
                if state.timer_gen != generation {
                    // Superseded by a later notify or a teardown flush.
                    return;
                }
            }
            match flush_pending(&shared, store.as_ref()).await {
                Ok(Some(snapshot_hash)) => {
                    let _ = events.send(AutosaveEvent::Saved { snapshot_hash });
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!("Autosave failed: {}", error);
                    let _ = events.send(AutosaveEvent::SaveFailed {
                        error: error.to_string(),
                    });
                }
            }
        });
    }

    /// Teardown: cancel the timer and persist any pending edit immediately.
    pub async fn flush(&self) -> Result<(), ApiError> {
        {
            let mut state = self.lock_state();
            state.timer_gen += 1;
        }
        match flush_pending(&self.state, self.store.as_ref()).await {
            Ok(Some(snapshot_hash)) => {
                let _ = self.events.send(AutosaveEvent::Saved { snapshot_hash });
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(error) => {
                let _ = self.events.send(AutosaveEvent::SaveFailed {
                    error: error.to_string(),
                });
                Err(error)
            }
        }
    }

    /// Seed the dedup baseline, e.g. with the freshly loaded document, so the
    /// first unedited change notification does not trigger a save.
    pub fn mark_persisted(&self, snapshot: &Value) {
        let hash = snapshot_hash(snapshot);
        self.lock_state().last_persisted_hash = Some(hash);
    }

    pub fn has_pending(&self) -> bool {
        self.lock_state().pending.is_some()
    }

    /// When the oldest unsaved edit was made, if any. Drives "unsaved changes
    /// since …" in the editing surface.
    pub fn pending_since(&self) -> Option<DateTime<Utc>> {
        self.lock_state()
            .pending
            .as_ref()
            .map(|pending| pending.last_edit_at)
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        lock_shared(&self.state)
    }
}

fn lock_shared(state: &Arc<Mutex<QueueState>>) -> MutexGuard<'_, QueueState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Take the pending edit and persist it. The last-persisted hash is updated
/// only on confirmed success, so an identical later edit retries naturally.
async fn flush_pending<S: DocumentStore>(
    state: &Arc<Mutex<QueueState>>,
    store: &S,
) -> Result<Option<String>, ApiError> {
    let pending = {
        let mut guard = lock_shared(state);
        let Some(pending) = guard.pending.take() else {
            return Ok(None);
        };
        if guard.last_persisted_hash.as_deref() == Some(pending.snapshot_hash.as_str()) {
            return Ok(None);
        }
        pending
    };

    store.save_document(&pending.snapshot).await?;
    lock_shared(state).last_persisted_hash = Some(pending.snapshot_hash.clone());
    Ok(Some(pending.snapshot_hash))
}
