//! Conversation log ownership and reconciliation.
//!
//! The [`SessionReconciler`] is the single writer of a session's message log.
//! Sending appends a completed human message plus a pending agent placeholder,
//! then folds the streamed response into that placeholder in place, never
//! appending per fragment. Completed exchanges periodically trigger a full
//! resync against the authoritative server copy so server-side post-processing
//! (auto-naming, summarization) becomes visible without the client tracking it.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flume::Sender;
use serde::{Deserialize, Serialize};

use crate::config::ClientConfig;
use crate::error::ApiError;
use crate::stream::{ByteChunkStream, ChunkStreamReader, IncrementalMessageAssembler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    Human,
    Agent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Complete,
    Errored,
}

/// One entry in the conversation log. Ids are generated locally so
/// reconciliation can tell entries apart even across wholesale replacement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub text: String,
    pub status: MessageStatus,
}

impl Message {
    fn human(text: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: MessageRole::Human,
            text: text.to_string(),
            status: MessageStatus::Complete,
        }
    }

    fn pending_agent() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: MessageRole::Agent,
            text: String::new(),
            status: MessageStatus::Pending,
        }
    }

    /// The in-flight response placeholder, identified by role and status,
    /// not by position alone.
    pub fn is_pending_agent(&self) -> bool {
        self.role == MessageRole::Agent && self.status == MessageStatus::Pending
    }
}

/// Client-side copy of a session. The authoritative copy lives server-side.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub display_name: String,
    pub messages: Vec<Message>,
    pub created_at: Option<DateTime<Utc>>,
}

/// The server's session JSON shape.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionPayload {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub messages: Vec<MessagePayload>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagePayload {
    pub content: String,
    #[serde(rename = "isFromUser")]
    pub is_from_user: bool,
}

impl SessionPayload {
    pub fn into_session(self) -> Session {
        Session {
            id: self.id,
            display_name: self.name.unwrap_or_else(|| "Untitled".to_string()),
            messages: self
                .messages
                .into_iter()
                .map(|message| Message {
                    id: uuid::Uuid::new_v4().to_string(),
                    role: if message.is_from_user {
                        MessageRole::Human
                    } else {
                        MessageRole::Agent
                    },
                    text: message.content,
                    status: MessageStatus::Complete,
                })
                .collect(),
            created_at: self.created_at,
        }
    }
}

/// Per-session send/stream state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatPhase {
    Idle,
    Sending,
    Streaming,
    ErroredIdle,
}

impl ChatPhase {
    /// A new send is accepted only when no exchange is outstanding. An
    /// errored session stays usable; retry is the user's call.
    pub fn can_send(self) -> bool {
        matches!(self, ChatPhase::Idle | ChatPhase::ErroredIdle)
    }
}

/// Events published by the reconciler for UI consumption.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    PhaseChanged {
        session_id: String,
        phase: ChatPhase,
    },
    MessageAppended {
        session_id: String,
        message: Message,
    },
    /// The placeholder's full text so far, after a fragment arrived.
    StreamingUpdate {
        session_id: String,
        message_id: String,
        text: String,
    },
    MessageCompleted {
        session_id: String,
        message_id: String,
    },
    MessageErrored {
        session_id: String,
        message_id: String,
        error: String,
    },
    SessionResynced {
        session_id: String,
    },
    SessionRenamed {
        session_id: String,
        name: String,
    },
    ResyncFailed {
        session_id: String,
        error: String,
    },
}

/// What the session endpoints look like to the reconciler. Implemented by
/// [`crate::api::ApiClient`] and by in-memory test doubles.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn fetch_session(&self, session_id: &str) -> Result<SessionPayload, ApiError>;

    async fn rename_session(&self, session_id: &str, name: &str)
        -> Result<SessionPayload, ApiError>;

    /// Open the response stream for a prompt. The returned stream is raw
    /// unframed text chunks until the connection closes.
    async fn open_message_stream(
        &self,
        session_id: &str,
        prompt: &str,
    ) -> Result<ByteChunkStream, ApiError>;
}

/// Result of a send attempt that did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Completed,
    /// Another send was already outstanding; the log was left untouched.
    Rejected,
}

struct LogState {
    display_name: String,
    messages: Vec<Message>,
    phase: ChatPhase,
    /// Bumped on every local mutation; a resync that started before the
    /// latest bump discards its result instead of clobbering fresher edits.
    mutation_seq: u64,
}

/// Owns and mutates one session's message log. All writes to the log go
/// through this type; readers get clones.
pub struct SessionReconciler<B: ChatBackend> {
    backend: Arc<B>,
    session_id: String,
    resync_every: usize,
    state: Mutex<LogState>,
    events: Sender<ChatEvent>,
}

impl<B: ChatBackend> SessionReconciler<B> {
    pub fn new(
        backend: Arc<B>,
        session_id: impl Into<String>,
        config: &ClientConfig,
        events: Sender<ChatEvent>,
    ) -> Self {
        Self {
            backend,
            session_id: session_id.into(),
            resync_every: config.resync_every_messages.max(1),
            state: Mutex::new(LogState {
                display_name: "Untitled".to_string(),
                messages: Vec::new(),
                phase: ChatPhase::Idle,
                mutation_seq: 0,
            }),
            events,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn phase(&self) -> ChatPhase {
        self.lock_state().phase
    }

    pub fn display_name(&self) -> String {
        self.lock_state().display_name.clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock_state().messages.clone()
    }

    /// Initial authoritative fetch, installing the server log wholesale.
    pub async fn load(&self) -> Result<(), ApiError> {
        let payload = self.backend.fetch_session(&self.session_id).await?;
        self.install_session(payload.into_session());
        Ok(())
    }

    /// Send a prompt and stream the response into the log.
    ///
    /// Rejected (no-op, immediate return) when another send is outstanding
    /// for this session. On a stream failure the placeholder keeps whatever
    /// partial text arrived, marked errored, and the error is returned;
    /// nothing is retried automatically.
    pub async fn send(&self, prompt: &str) -> Result<SendOutcome, ApiError> {
        {
            let mut state = self.lock_state();
            if !state.phase.can_send() {
                tracing::debug!(
                    "Rejecting send for session {}: already {:?}",
                    self.session_id,
                    state.phase
                );
                return Ok(SendOutcome::Rejected);
            }
            state.phase = ChatPhase::Sending;
            state.mutation_seq += 1;
            let human = Message::human(prompt);
            self.emit(ChatEvent::PhaseChanged {
                session_id: self.session_id.clone(),
                phase: ChatPhase::Sending,
            });
            self.emit(ChatEvent::MessageAppended {
                session_id: self.session_id.clone(),
                message: human.clone(),
            });
            state.messages.push(human);
        }

        self.run_exchange(prompt).await
    }

    /// Stream the assistant's opening message into a brand-new session
    /// without appending a human entry. Rejected once the log is non-empty.
    pub async fn request_opening_message(&self) -> Result<SendOutcome, ApiError> {
        {
            let mut state = self.lock_state();
            if !state.phase.can_send() || !state.messages.is_empty() {
                return Ok(SendOutcome::Rejected);
            }
            state.phase = ChatPhase::Sending;
            state.mutation_seq += 1;
            self.emit(ChatEvent::PhaseChanged {
                session_id: self.session_id.clone(),
                phase: ChatPhase::Sending,
            });
        }

        self.run_exchange("").await
    }

    /// Rename the session via partial update; the local name is taken from
    /// the server's authoritative response.
    pub async fn rename(&self, name: &str) -> Result<String, ApiError> {
        let payload = self.backend.rename_session(&self.session_id, name).await?;
        let session = payload.into_session();
        {
            let mut state = self.lock_state();
            state.display_name = session.display_name.clone();
            state.mutation_seq += 1;
        }
        self.emit(ChatEvent::SessionRenamed {
            session_id: self.session_id.clone(),
            name: session.display_name.clone(),
        });
        Ok(session.display_name)
    }

    /// Refetch the authoritative session and replace the local log wholesale.
    ///
    /// If any local mutation landed while the fetch was in flight the result
    /// is discarded; just-sent content wins over a stale read.
    pub async fn resync(&self) -> Result<(), ApiError> {
        let seq_before = self.lock_state().mutation_seq;
        let payload = self.backend.fetch_session(&self.session_id).await?;
        let session = payload.into_session();

        {
            let state = self.lock_state();
            if state.mutation_seq != seq_before {
                tracing::debug!(
                    "Discarding stale resync for session {} (log changed while fetching)",
                    self.session_id
                );
                return Ok(());
            }
        }
        self.install_session(session);
        Ok(())
    }

    async fn run_exchange(&self, prompt: &str) -> Result<SendOutcome, ApiError> {
        let placeholder_id = {
            let mut state = self.lock_state();
            let placeholder = Message::pending_agent();
            let id = placeholder.id.clone();
            state.mutation_seq += 1;
            self.emit(ChatEvent::MessageAppended {
                session_id: self.session_id.clone(),
                message: placeholder.clone(),
            });
            state.messages.push(placeholder);
            id
        };

        let stream = match self
            .backend
            .open_message_stream(&self.session_id, prompt)
            .await
        {
            Ok(stream) => stream,
            Err(error) => {
                self.fail_placeholder(&placeholder_id, &error);
                return Err(error);
            }
        };

        let mut reader = ChunkStreamReader::new(stream);
        let outcome = IncrementalMessageAssembler::consume(&mut reader, |total| {
            self.apply_stream_update(&placeholder_id, total);
        })
        .await;

        match outcome {
            Ok(_) => {
                let due_for_resync = self.complete_placeholder(&placeholder_id);
                if due_for_resync {
                    if let Err(error) = self.resync().await {
                        tracing::warn!(
                            "Post-exchange resync failed for session {}: {}",
                            self.session_id,
                            error
                        );
                        self.emit(ChatEvent::ResyncFailed {
                            session_id: self.session_id.clone(),
                            error: error.to_string(),
                        });
                    }
                }
                Ok(SendOutcome::Completed)
            }
            Err(error) => {
                self.fail_placeholder(&placeholder_id, &error);
                Err(error)
            }
        }
    }

    /// Replace the placeholder's text with the new running total. Updates in
    /// place only (intermediate fragments never append a message) and only
    /// while the log's last entry is still the pending placeholder.
    fn apply_stream_update(&self, placeholder_id: &str, total: &str) {
        let mut state = self.lock_state();
        if state.phase == ChatPhase::Sending {
            state.phase = ChatPhase::Streaming;
            self.emit(ChatEvent::PhaseChanged {
                session_id: self.session_id.clone(),
                phase: ChatPhase::Streaming,
            });
        }

        let Some(last) = state.messages.last_mut() else {
            return;
        };
        if !last.is_pending_agent() || last.id != placeholder_id {
            tracing::warn!(
                "Dropping stream update for session {}: last entry is not the placeholder",
                self.session_id
            );
            return;
        }
        last.text = total.to_string();
        let message_id = last.id.clone();
        state.mutation_seq += 1;
        self.emit(ChatEvent::StreamingUpdate {
            session_id: self.session_id.clone(),
            message_id,
            text: total.to_string(),
        });
    }

    /// Finalize the placeholder and report whether the log size crossed the
    /// resync threshold.
    fn complete_placeholder(&self, placeholder_id: &str) -> bool {
        let mut state = self.lock_state();
        if let Some(message) = state
            .messages
            .iter_mut()
            .find(|message| message.id == placeholder_id)
        {
            message.status = MessageStatus::Complete;
        }
        state.phase = ChatPhase::Idle;
        state.mutation_seq += 1;
        self.emit(ChatEvent::MessageCompleted {
            session_id: self.session_id.clone(),
            message_id: placeholder_id.to_string(),
        });
        self.emit(ChatEvent::PhaseChanged {
            session_id: self.session_id.clone(),
            phase: ChatPhase::Idle,
        });

        !state.messages.is_empty() && state.messages.len() % self.resync_every == 0
    }

    fn fail_placeholder(&self, placeholder_id: &str, error: &ApiError) {
        let mut state = self.lock_state();
        if let Some(message) = state
            .messages
            .iter_mut()
            .find(|message| message.id == placeholder_id)
        {
            message.status = MessageStatus::Errored;
        }
        state.phase = ChatPhase::ErroredIdle;
        state.mutation_seq += 1;
        self.emit(ChatEvent::MessageErrored {
            session_id: self.session_id.clone(),
            message_id: placeholder_id.to_string(),
            error: error.to_string(),
        });
        self.emit(ChatEvent::PhaseChanged {
            session_id: self.session_id.clone(),
            phase: ChatPhase::ErroredIdle,
        });
    }

    fn install_session(&self, session: Session) {
        {
            let mut state = self.lock_state();
            state.display_name = session.display_name;
            state.messages = session.messages;
            state.mutation_seq += 1;
        }
        self.emit(ChatEvent::SessionResynced {
            session_id: self.session_id.clone(),
        });
    }

    fn lock_state(&self) -> MutexGuard<'_, LogState> {
        // A poisoned lock only means some reader panicked mid-clone; the log
        // itself is still consistent.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }
}
