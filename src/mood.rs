//! Daily mood tracking over the optimistic cache.
//!
//! The mood-of-the-day is the canonical small, frequently-rewritten entity:
//! picking an option must reflect instantly, a failed save must fall back to
//! the previous value, and a second pick before the first save lands must win.
//! The trend and summary read-models derive from it and are refetched lazily
//! after a confirmed write.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::{CachedView, OptimisticCache};
use crate::config::ClientConfig;
use crate::error::ApiError;

pub const MOOD_SCORE_MIN: u8 = 1;
pub const MOOD_SCORE_MAX: u8 = 10;

const TODAY_KEY: &str = "mood/today";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoodEntry {
    pub id: String,
    #[serde(default)]
    pub user_id: String,
    pub mood_score: u8,
    pub mood_emoji: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Write payload for `PUT /mood/daily`.
#[derive(Debug, Clone, Serialize)]
pub struct MoodWrite {
    pub mood_score: u8,
    pub mood_emoji: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoodTrendPoint {
    pub date: String,
    pub day: String,
    #[serde(default)]
    pub mood_score: u8,
    #[serde(default)]
    pub mood_emoji: String,
    pub has_entry: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Declining,
    Stable,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MoodSummary {
    #[serde(default)]
    pub current_mood: Option<MoodEntry>,
    #[serde(default)]
    pub recent_average: Option<f32>,
    #[serde(default)]
    pub trend_direction: Option<TrendDirection>,
    pub total_entries: u32,
    pub streak_days: u32,
}

/// Emoji for a score on the 1–10 scale, matching the daily tracker options.
pub fn emoji_for_score(score: u8) -> &'static str {
    match score {
        0..=2 => "😞",
        3..=4 => "😟",
        5..=6 => "😐",
        7..=8 => "😊",
        _ => "😄",
    }
}

/// The mood endpoints as the store sees them. Implemented by
/// [`crate::api::ApiClient`] and by in-memory test doubles.
#[async_trait]
pub trait MoodBackend: Send + Sync {
    /// Today's entry, if one was recorded.
    async fn fetch_today_mood(&self) -> Result<Option<MoodEntry>, ApiError>;

    /// Upsert today's entry; the response is the authoritative stored entry.
    async fn put_daily_mood(&self, write: &MoodWrite) -> Result<MoodEntry, ApiError>;

    async fn fetch_mood_trend(&self, days: u32) -> Result<Vec<MoodTrendPoint>, ApiError>;

    async fn fetch_mood_summary(&self) -> Result<MoodSummary, ApiError>;
}

/// Single owner of the mood caches. All writes go through [`set_today`]
/// (optimistic, rollback on failure, last pick wins); reads prefer the
/// optimistic value and otherwise fetch through.
///
/// [`set_today`]: MoodStore::set_today
pub struct MoodStore<B: MoodBackend> {
    backend: Arc<B>,
    trend_days: u32,
    today: OptimisticCache<MoodEntry>,
    trend: CachedView<Vec<MoodTrendPoint>>,
    summary: CachedView<MoodSummary>,
}

impl<B: MoodBackend> MoodStore<B> {
    pub async fn new(backend: Arc<B>, config: &ClientConfig) -> Self {
        let store = Self {
            backend,
            trend_days: config.mood_trend_days,
            today: OptimisticCache::new(),
            trend: CachedView::new(),
            summary: CachedView::new(),
        };
        // A confirmed write to today's mood stales the derived views, never
        // the today-slot itself (it already holds the authoritative value).
        store
            .today
            .register_dependent(TODAY_KEY, store.trend.flag())
            .await;
        store
            .today
            .register_dependent(TODAY_KEY, store.summary.flag())
            .await;
        store
    }

    /// Record today's mood optimistically.
    ///
    /// The picked value becomes visible immediately; the server's response
    /// replaces it on success, the previous value returns on failure. Scores
    /// outside the 1–10 scale are clamped; the UI only offers fixed options,
    /// so anything else is a caller bug, not a user action.
    pub async fn set_today(&self, score: u8) -> Result<MoodEntry, ApiError> {
        let score = score.clamp(MOOD_SCORE_MIN, MOOD_SCORE_MAX);
        let now = Utc::now();
        let optimistic = MoodEntry {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: String::new(),
            mood_score: score,
            mood_emoji: emoji_for_score(score).to_string(),
            created_at: now,
            updated_at: now,
        };
        let write = MoodWrite {
            mood_score: score,
            mood_emoji: optimistic.mood_emoji.clone(),
        };

        let backend = self.backend.clone();
        self.today
            .apply(TODAY_KEY, optimistic, async move {
                backend.put_daily_mood(&write).await
            })
            .await
    }

    /// Today's visible mood: the optimistic value when a save is in flight,
    /// otherwise the cached or freshly fetched server value.
    pub async fn today(&self) -> Result<Option<MoodEntry>, ApiError> {
        let backend = self.backend.clone();
        self.today
            .fetch_with(TODAY_KEY, async move { backend.fetch_today_mood().await })
            .await
    }

    pub async fn trend(&self) -> Result<Vec<MoodTrendPoint>, ApiError> {
        let backend = self.backend.clone();
        let days = self.trend_days;
        self.trend
            .get_or_refresh(async move { backend.fetch_mood_trend(days).await })
            .await
    }

    pub async fn summary(&self) -> Result<MoodSummary, ApiError> {
        let backend = self.backend.clone();
        self.summary
            .get_or_refresh(async move { backend.fetch_mood_summary().await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    fn entry(score: u8) -> MoodEntry {
        let now = Utc::now();
        MoodEntry {
            id: format!("m-{score}"),
            user_id: "u1".to_string(),
            mood_score: score,
            mood_emoji: emoji_for_score(score).to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[derive(Default)]
    struct MockMoodBackend {
        today: Mutex<Option<MoodEntry>>,
        fail_next_put: Mutex<bool>,
        put_gates: Mutex<VecDeque<oneshot::Receiver<()>>>,
        today_fetches: AtomicUsize,
        trend_fetches: AtomicUsize,
        summary_fetches: AtomicUsize,
    }

    impl MockMoodBackend {
        fn with_today(entry: Option<MoodEntry>) -> Self {
            let backend = Self::default();
            *backend.today.lock().unwrap() = entry;
            backend
        }

        fn fail_next_put(&self) {
            *self.fail_next_put.lock().unwrap() = true;
        }

        fn gate_next_put(&self) -> oneshot::Sender<()> {
            let (tx, rx) = oneshot::channel();
            self.put_gates.lock().unwrap().push_back(rx);
            tx
        }
    }

    #[async_trait]
    impl MoodBackend for MockMoodBackend {
        async fn fetch_today_mood(&self) -> Result<Option<MoodEntry>, ApiError> {
            self.today_fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.today.lock().unwrap().clone())
        }

        async fn put_daily_mood(&self, write: &MoodWrite) -> Result<MoodEntry, ApiError> {
            let gate = self.put_gates.lock().unwrap().pop_front();
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            if std::mem::take(&mut *self.fail_next_put.lock().unwrap()) {
                return Err(ApiError::Persist {
                    entity: "mood",
                    message: "save failed".to_string(),
                });
            }
            let stored = MoodEntry {
                id: "server-id".to_string(),
                user_id: "u1".to_string(),
                mood_score: write.mood_score,
                mood_emoji: write.mood_emoji.clone(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            };
            *self.today.lock().unwrap() = Some(stored.clone());
            Ok(stored)
        }

        async fn fetch_mood_trend(&self, days: u32) -> Result<Vec<MoodTrendPoint>, ApiError> {
            self.trend_fetches.fetch_add(1, Ordering::SeqCst);
            Ok((0..days)
                .map(|i| MoodTrendPoint {
                    date: format!("2026-08-{:02}", i + 1),
                    day: "Mon".to_string(),
                    mood_score: 5,
                    mood_emoji: "😐".to_string(),
                    has_entry: true,
                })
                .collect())
        }

        async fn fetch_mood_summary(&self) -> Result<MoodSummary, ApiError> {
            self.summary_fetches.fetch_add(1, Ordering::SeqCst);
            Ok(MoodSummary {
                total_entries: 3,
                streak_days: 2,
                ..MoodSummary::default()
            })
        }
    }

    async fn store_with(
        backend: Arc<MockMoodBackend>,
    ) -> MoodStore<MockMoodBackend> {
        MoodStore::new(backend, &ClientConfig::default()).await
    }

    #[tokio::test]
    async fn set_today_is_visible_immediately_and_confirmed_by_the_server() {
        let backend = Arc::new(MockMoodBackend::default());
        let store = store_with(backend.clone()).await;

        let saved = store.set_today(7).await.expect("save");
        assert_eq!(saved.id, "server-id");
        assert_eq!(saved.mood_score, 7);

        // The slot holds the authoritative response; no refetch needed.
        let today = store.today().await.expect("today").expect("entry");
        assert_eq!(today.mood_score, 7);
        assert_eq!(backend.today_fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_save_rolls_back_to_the_previous_value() {
        let backend = Arc::new(MockMoodBackend::with_today(Some(entry(5))));
        let store = store_with(backend.clone()).await;

        // Prime the cache with the server's current value.
        let before = store.today().await.expect("today").expect("entry");
        assert_eq!(before.mood_score, 5);

        backend.fail_next_put();
        let result = store.set_today(7).await;
        assert!(matches!(result, Err(ApiError::Persist { .. })));

        let after = store.today().await.expect("today").expect("entry");
        assert_eq!(after.mood_score, 5);
    }

    #[tokio::test]
    async fn optimistic_value_shows_while_the_save_is_in_flight() {
        let backend = Arc::new(MockMoodBackend::with_today(Some(entry(5))));
        let store = Arc::new(store_with(backend.clone()).await);
        store.today().await.expect("prime");

        let release = backend.gate_next_put();
        let save = {
            let store = store.clone();
            tokio::spawn(async move { store.set_today(9).await })
        };
        tokio::task::yield_now().await;

        let visible = store.today().await.expect("today").expect("entry");
        assert_eq!(visible.mood_score, 9);

        release.send(()).expect("release save");
        save.await.expect("join").expect("save");
        let confirmed = store.today().await.expect("today").expect("entry");
        assert_eq!(confirmed.mood_score, 9);
        assert_eq!(confirmed.id, "server-id");
    }

    #[tokio::test]
    async fn picking_twice_before_the_first_save_lands_keeps_the_second_pick() {
        let backend = Arc::new(MockMoodBackend::default());
        let store = Arc::new(store_with(backend.clone()).await);

        let release_first = backend.gate_next_put();
        let first = {
            let store = store.clone();
            tokio::spawn(async move { store.set_today(3).await })
        };
        tokio::task::yield_now().await;

        store.set_today(8).await.expect("second save");
        release_first.send(()).expect("release first save");
        first.await.expect("join").expect("first save");

        let today = store.today().await.expect("today").expect("entry");
        assert_eq!(today.mood_score, 8);
    }

    #[tokio::test]
    async fn confirmed_save_stales_trend_and_summary_views() {
        let backend = Arc::new(MockMoodBackend::default());
        let store = store_with(backend.clone()).await;

        store.trend().await.expect("trend");
        store.summary().await.expect("summary");
        store.trend().await.expect("trend cached");
        assert_eq!(backend.trend_fetches.load(Ordering::SeqCst), 1);
        assert_eq!(backend.summary_fetches.load(Ordering::SeqCst), 1);

        store.set_today(6).await.expect("save");

        store.trend().await.expect("trend refetched");
        store.summary().await.expect("summary refetched");
        assert_eq!(backend.trend_fetches.load(Ordering::SeqCst), 2);
        assert_eq!(backend.summary_fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_save_leaves_derived_views_fresh() {
        let backend = Arc::new(MockMoodBackend::default());
        let store = store_with(backend.clone()).await;

        store.trend().await.expect("trend");
        backend.fail_next_put();
        let _ = store.set_today(6).await;

        store.trend().await.expect("trend still cached");
        assert_eq!(backend.trend_fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn today_fetches_through_once_and_then_serves_from_cache() {
        let backend = Arc::new(MockMoodBackend::with_today(Some(entry(4))));
        let store = store_with(backend.clone()).await;

        store.today().await.expect("first read");
        store.today().await.expect("second read");
        assert_eq!(backend.today_fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn emoji_scale_matches_the_daily_options() {
        assert_eq!(emoji_for_score(1), "😞");
        assert_eq!(emoji_for_score(4), "😟");
        assert_eq!(emoji_for_score(5), "😐");
        assert_eq!(emoji_for_score(8), "😊");
        assert_eq!(emoji_for_score(10), "😄");
    }

    #[test]
    fn summary_tolerates_minimal_server_payloads() {
        let parsed: MoodSummary =
            serde_json::from_str(r#"{"total_entries":0,"streak_days":0}"#).expect("decode");
        assert!(parsed.current_mood.is_none());
        assert!(parsed.trend_direction.is_none());
    }
}
