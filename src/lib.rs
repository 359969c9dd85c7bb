//! Client core for the Haven wellness app.
//!
//! The surrounding application is thin view glue; the hard parts live here:
//!
//! - **Streamed chat**: [`stream`] decodes the raw response stream with a
//!   stateful UTF-8 decoder and folds fragments into the message-so-far;
//!   [`session`] owns the conversation log, updating an in-flight placeholder
//!   in place and periodically resyncing against the authoritative server
//!   copy.
//! - **Optimistic writes**: [`cache`] is a key-addressed write-through store
//!   with rollback-on-failure and last-submitted-wins semantics; [`mood`]
//!   builds the daily mood tracker on top of it.
//! - **Coalesced autosave**: [`autosave`] debounces journal edit
//!   notifications into single persist calls with flush-on-teardown.
//!
//! Transports are injected: [`api::ApiClient`] is the one HTTP adapter, and
//! every consumer depends on a narrow async trait instead, so the core runs
//! against in-memory doubles in tests.

pub mod api;
pub mod autosave;
pub mod cache;
pub mod config;
pub mod error;
pub mod mood;
pub mod retry;
pub mod session;
pub mod stream;

pub use api::{ApiClient, StaticTokenProvider, TokenProvider};
pub use autosave::{AutosaveEvent, DebouncedPersistenceQueue, DocumentStore};
pub use cache::{CachedView, DerivedView, OptimisticCache};
pub use config::ClientConfig;
pub use error::ApiError;
pub use mood::{MoodBackend, MoodEntry, MoodStore, MoodSummary, MoodTrendPoint, MoodWrite};
pub use retry::{with_backoff, RetryPolicy};
pub use session::{
    ChatBackend, ChatEvent, ChatPhase, Message, MessageRole, MessageStatus, SendOutcome, Session,
    SessionPayload, SessionReconciler,
};
pub use stream::{ByteChunkStream, ChunkStreamReader, IncrementalMessageAssembler};
