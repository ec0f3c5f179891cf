//! Time-tiered conversation memory.
//!
//! A tier becomes due once the conversation has run for half of its
//! threshold; every check re-evaluates every tier, so a due tier is
//! re-summarized (and its record replaced) on each call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Mutex, RwLock};
use proto::{ChatEvent, MemoryError, MemoryRecord, MemoryTier, Message};
use tracing::{debug, info};

use crate::events::EventBus;
use crate::summarizer::Summarizer;

/// Persistence port for memory records.
#[async_trait]
pub trait MemoryStorage: Send + Sync {
    async fn load(&self) -> Result<Vec<MemoryRecord>, MemoryError>;
    async fn save(&self, records: &[MemoryRecord]) -> Result<(), MemoryError>;
    async fn clear(&self) -> Result<(), MemoryError>;
}

/// Process-local storage. Counts saves so callers can observe persistence.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    records: Mutex<Vec<MemoryRecord>>,
    saves: Mutex<usize>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage pre-populated with records.
    pub fn with_records(records: Vec<MemoryRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            saves: Mutex::new(0),
        }
    }

    /// Number of `save` calls so far.
    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }

    /// Currently stored records.
    pub fn snapshot(&self) -> Vec<MemoryRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl MemoryStorage for InMemoryStorage {
    async fn load(&self) -> Result<Vec<MemoryRecord>, MemoryError> {
        Ok(self.records.lock().clone())
    }

    async fn save(&self, records: &[MemoryRecord]) -> Result<(), MemoryError> {
        *self.records.lock() = records.to_vec();
        *self.saves.lock() += 1;
        Ok(())
    }

    async fn clear(&self) -> Result<(), MemoryError> {
        self.records.lock().clear();
        Ok(())
    }
}

/// Tier thresholds, summary length and retention window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryOptions {
    pub short_term: Duration,
    pub mid_term: Duration,
    pub long_term: Duration,
    /// Maximum summary length in characters.
    pub max_summary_length: usize,
    /// Records older than this are evicted by cleanup.
    pub retention: Duration,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            short_term: Duration::from_secs(60),
            mid_term: Duration::from_secs(240),
            long_term: Duration::from_secs(540),
            max_summary_length: 500,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl MemoryOptions {
    /// Thresholds must be non-zero and strictly ascending.
    pub fn validate(&self) -> Result<(), MemoryError> {
        if self.short_term.is_zero() {
            return Err(MemoryError::InvalidOptions(
                "short-term threshold must be positive".to_string(),
            ));
        }
        if !(self.short_term < self.mid_term && self.mid_term < self.long_term) {
            return Err(MemoryError::InvalidOptions(format!(
                "thresholds must ascend (short {:?} < mid {:?} < long {:?})",
                self.short_term, self.mid_term, self.long_term
            )));
        }
        if self.max_summary_length == 0 {
            return Err(MemoryError::InvalidOptions(
                "max summary length must be positive".to_string(),
            ));
        }
        TimeDelta::from_std(self.retention)
            .map_err(|e| MemoryError::InvalidOptions(format!("retention: {e}")))?;
        Ok(())
    }

    pub fn threshold(&self, tier: MemoryTier) -> Duration {
        match tier {
            MemoryTier::Short => self.short_term,
            MemoryTier::Mid => self.mid_term,
            MemoryTier::Long => self.long_term,
        }
    }

    /// A tier is due once elapsed time reaches half its threshold.
    pub fn is_due(&self, tier: MemoryTier, elapsed: Duration) -> bool {
        elapsed >= self.threshold(tier) / 2
    }
}

/// Derives, persists and evicts tiered summaries of the transcript.
pub struct MemoryManager {
    options: MemoryOptions,
    retention: TimeDelta,
    storage: Arc<dyn MemoryStorage>,
    summarizer: RwLock<Arc<dyn Summarizer>>,
    events: Arc<EventBus>,
    // Held across storage calls; replaced only after storage accepts the change.
    records: tokio::sync::Mutex<Vec<MemoryRecord>>,
}

impl MemoryManager {
    pub fn new(
        options: MemoryOptions,
        storage: Arc<dyn MemoryStorage>,
        summarizer: Arc<dyn Summarizer>,
        events: Arc<EventBus>,
    ) -> Result<Self, MemoryError> {
        options.validate()?;
        let retention = TimeDelta::from_std(options.retention)
            .map_err(|e| MemoryError::InvalidOptions(format!("retention: {e}")))?;
        Ok(Self {
            options,
            retention,
            storage,
            summarizer: RwLock::new(summarizer),
            events,
            records: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn options(&self) -> &MemoryOptions {
        &self.options
    }

    /// Replaces the summarizer, e.g. after a provider switch.
    pub fn set_summarizer(&self, summarizer: Arc<dyn Summarizer>) {
        *self.summarizer.write() = summarizer;
    }

    /// Snapshot of the current records.
    pub async fn records(&self) -> Vec<MemoryRecord> {
        self.records.lock().await.clone()
    }

    /// Replaces the in-memory set with what storage holds. When storage has
    /// several records for one tier, the newest wins.
    pub async fn load(&self) -> Result<usize, MemoryError> {
        let mut records = self.records.lock().await;
        let mut loaded = self.storage.load().await?;
        loaded.sort_by_key(|r| r.timestamp);
        let mut latest: Vec<MemoryRecord> = Vec::with_capacity(MemoryTier::ALL.len());
        for record in loaded {
            latest.retain(|r| r.tier != record.tier);
            latest.push(record);
        }
        *records = latest;
        let count = records.len();
        info!(count, "Memories loaded");
        self.events.emit(&ChatEvent::MemoryLoaded { count });
        Ok(count)
    }

    /// Creates (or replaces) a record for every tier that is due given the
    /// time elapsed since `start_time`. Tiers are processed one at a time and
    /// the full set is persisted after each. Returns the tiers written.
    pub async fn create_memory_if_needed(
        &self,
        transcript: &[Message],
        start_time: DateTime<Utc>,
    ) -> Result<Vec<MemoryTier>, MemoryError> {
        if transcript.is_empty() {
            return Ok(Vec::new());
        }
        let elapsed = (Utc::now() - start_time).to_std().unwrap_or_default();
        let due: Vec<MemoryTier> = MemoryTier::ALL
            .into_iter()
            .filter(|&tier| self.options.is_due(tier, elapsed))
            .collect();
        if due.is_empty() {
            return Ok(due);
        }
        debug!(elapsed_secs = elapsed.as_secs(), ?due, "Memory tiers due");

        for &tier in &due {
            let summarizer = Arc::clone(&*self.summarizer.read());
            let summary = summarizer
                .summarize(transcript, Some(self.options.max_summary_length), None)
                .await;
            let record = MemoryRecord::new(tier, summary);

            let mut records = self.records.lock().await;
            let (replaced, mut next): (Vec<_>, Vec<_>) =
                records.iter().cloned().partition(|r| r.tier == tier);
            next.push(record.clone());
            self.storage.save(&next).await?;
            *records = next;

            for old in replaced {
                self.events.emit(&ChatEvent::MemoryRemoved { record: old });
            }
            self.events.emit(&ChatEvent::MemorySaved {
                count: records.len(),
            });
            info!(%tier, chars = record.summary.chars().count(), "Memory created");
            self.events.emit(&ChatEvent::MemoryCreated { record });
        }
        Ok(due)
    }

    /// Renders present tiers, short to long, as labeled lines.
    pub async fn memory_for_prompt(&self) -> Option<String> {
        let records = self.records.lock().await;
        let lines: Vec<String> = MemoryTier::ALL
            .into_iter()
            .filter_map(|tier| records.iter().find(|r| r.tier == tier))
            .map(|r| format!("{}: {}", r.tier.label(), r.summary))
            .collect();
        (!lines.is_empty()).then(|| lines.join("\n"))
    }

    /// Evicts records older than the retention window, whatever their tier,
    /// and persists the remaining set once. Returns how many were evicted.
    pub async fn cleanup_old_memories(&self) -> Result<usize, MemoryError> {
        let cutoff = Utc::now() - self.retention;
        let mut records = self.records.lock().await;
        let (expired, kept): (Vec<_>, Vec<_>) =
            records.iter().cloned().partition(|r| r.timestamp < cutoff);
        self.storage.save(&kept).await?;
        *records = kept;

        let removed = expired.len();
        for record in expired {
            self.events.emit(&ChatEvent::MemoryRemoved { record });
        }
        self.events.emit(&ChatEvent::MemorySaved {
            count: records.len(),
        });
        if removed > 0 {
            debug!(removed, "Evicted stale memories");
        }
        Ok(removed)
    }

    /// Drops every record and clears storage.
    pub async fn clear_all_memories(&self) -> Result<(), MemoryError> {
        let mut records = self.records.lock().await;
        self.storage.clear().await?;
        let dropped = std::mem::take(&mut *records);
        for record in dropped {
            self.events.emit(&ChatEvent::MemoryRemoved { record });
        }
        info!("All memories cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use proto::EventKind;

    use super::*;

    /// Returns "summary #n" and counts calls.
    #[derive(Default)]
    struct CountingSummarizer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Summarizer for CountingSummarizer {
        async fn summarize(
            &self,
            _messages: &[Message],
            _max_length: Option<usize>,
            _custom_prompt: Option<&str>,
        ) -> String {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            format!("summary #{n}")
        }
    }

    struct Fixture {
        manager: MemoryManager,
        storage: Arc<InMemoryStorage>,
        summarizer: Arc<CountingSummarizer>,
        events: Arc<EventBus>,
    }

    fn fixture(storage: InMemoryStorage) -> Fixture {
        let storage = Arc::new(storage);
        let summarizer = Arc::new(CountingSummarizer::default());
        let events = Arc::new(EventBus::new());
        let manager = MemoryManager::new(
            MemoryOptions::default(),
            storage.clone(),
            summarizer.clone(),
            events.clone(),
        )
        .expect("valid options");
        Fixture {
            manager,
            storage,
            summarizer,
            events,
        }
    }

    fn counter(events: &EventBus, kind: EventKind) -> Arc<AtomicUsize> {
        let hits = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&hits);
        events.subscribe(kind, move |_| {
            inner.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        hits
    }

    fn transcript() -> Vec<Message> {
        vec![Message::user("hello"), Message::assistant("hi there")]
    }

    fn aged(tier: MemoryTier, summary: &str, age: TimeDelta) -> MemoryRecord {
        let mut record = MemoryRecord::new(tier, summary);
        record.timestamp = Utc::now() - age;
        record
    }

    #[tokio::test]
    async fn elapsed_125s_creates_short_and_mid_only() {
        let f = fixture(InMemoryStorage::new());
        let start = Utc::now() - TimeDelta::seconds(125);
        let created = f
            .manager
            .create_memory_if_needed(&transcript(), start)
            .await
            .expect("create");
        assert_eq!(created, vec![MemoryTier::Short, MemoryTier::Mid]);

        let records = f.manager.records().await;
        assert_eq!(records.iter().filter(|r| r.tier == MemoryTier::Short).count(), 1);
        assert_eq!(records.iter().filter(|r| r.tier == MemoryTier::Mid).count(), 1);
        assert_eq!(records.iter().filter(|r| r.tier == MemoryTier::Long).count(), 0);
        assert_eq!(f.storage.snapshot().len(), 2);
        assert_eq!(f.summarizer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn nothing_is_due_early_in_a_conversation() {
        let f = fixture(InMemoryStorage::new());
        let created = f
            .manager
            .create_memory_if_needed(&transcript(), Utc::now() - TimeDelta::seconds(5))
            .await
            .expect("create");
        assert!(created.is_empty());
        assert_eq!(f.storage.save_count(), 0);
    }

    #[tokio::test]
    async fn empty_transcript_is_never_summarized() {
        let f = fixture(InMemoryStorage::new());
        let created = f
            .manager
            .create_memory_if_needed(&[], Utc::now() - TimeDelta::seconds(600))
            .await
            .expect("create");
        assert!(created.is_empty());
        assert_eq!(f.summarizer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn new_record_replaces_existing_tier() {
        let f = fixture(InMemoryStorage::new());
        let removed = counter(&f.events, EventKind::MemoryRemoved);
        let created = counter(&f.events, EventKind::MemoryCreated);
        let start = Utc::now() - TimeDelta::seconds(40);

        f.manager
            .create_memory_if_needed(&transcript(), start)
            .await
            .expect("first");
        f.manager
            .create_memory_if_needed(&transcript(), start)
            .await
            .expect("second");

        let records = f.manager.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].summary, "summary #2");
        assert_eq!(removed.load(Ordering::SeqCst), 1);
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cleanup_evicts_only_stale_records_and_saves_once() {
        let storage = InMemoryStorage::with_records(vec![
            aged(MemoryTier::Short, "fresh", TimeDelta::minutes(5)),
            aged(MemoryTier::Mid, "stale", TimeDelta::days(8)),
            aged(MemoryTier::Long, "ancient", TimeDelta::days(30)),
        ]);
        let f = fixture(storage);
        f.manager.load().await.expect("load");

        let evicted = f.manager.cleanup_old_memories().await.expect("cleanup");
        assert_eq!(evicted, 2);
        assert_eq!(f.storage.save_count(), 1);
        let remaining = f.storage.snapshot();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].summary, "fresh");
    }

    #[tokio::test]
    async fn cleanup_with_nothing_stale_still_persists_once() {
        let f = fixture(InMemoryStorage::new());
        assert_eq!(f.manager.cleanup_old_memories().await.expect("cleanup"), 0);
        assert_eq!(f.storage.save_count(), 1);
    }

    #[tokio::test]
    async fn prompt_orders_tiers_short_to_long() {
        let storage = InMemoryStorage::with_records(vec![
            aged(MemoryTier::Long, "L", TimeDelta::seconds(1)),
            aged(MemoryTier::Short, "S", TimeDelta::seconds(3)),
            aged(MemoryTier::Mid, "M", TimeDelta::seconds(2)),
        ]);
        let f = fixture(storage);
        assert_eq!(f.manager.load().await.expect("load"), 3);
        assert_eq!(
            f.manager.memory_for_prompt().await.as_deref(),
            Some("Short-term memory: S\nMid-term memory: M\nLong-term memory: L")
        );
    }

    #[tokio::test]
    async fn prompt_is_none_without_records() {
        let f = fixture(InMemoryStorage::new());
        assert!(f.manager.memory_for_prompt().await.is_none());
    }

    #[tokio::test]
    async fn load_keeps_newest_record_per_tier() {
        let storage = InMemoryStorage::with_records(vec![
            aged(MemoryTier::Short, "newer", TimeDelta::seconds(1)),
            aged(MemoryTier::Short, "older", TimeDelta::seconds(100)),
        ]);
        let f = fixture(storage);
        let loaded = counter(&f.events, EventKind::MemoryLoaded);
        assert_eq!(f.manager.load().await.expect("load"), 1);
        assert_eq!(f.manager.records().await[0].summary, "newer");
        assert_eq!(loaded.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clear_drops_records_and_storage() {
        let storage = InMemoryStorage::with_records(vec![aged(
            MemoryTier::Short,
            "x",
            TimeDelta::seconds(1),
        )]);
        let f = fixture(storage);
        f.manager.load().await.expect("load");
        f.manager.clear_all_memories().await.expect("clear");
        assert!(f.manager.records().await.is_empty());
        assert!(f.storage.snapshot().is_empty());
    }

    /// Accepts nothing: every write fails.
    struct RejectingStorage;

    #[async_trait]
    impl MemoryStorage for RejectingStorage {
        async fn load(&self) -> Result<Vec<MemoryRecord>, MemoryError> {
            Ok(vec![
                aged(MemoryTier::Short, "old short", TimeDelta::seconds(5)),
                aged(MemoryTier::Long, "stale long", TimeDelta::days(30)),
            ])
        }

        async fn save(&self, _records: &[MemoryRecord]) -> Result<(), MemoryError> {
            Err(MemoryError::Storage("disk full".to_string()))
        }

        async fn clear(&self) -> Result<(), MemoryError> {
            Err(MemoryError::Storage("read-only".to_string()))
        }
    }

    #[tokio::test]
    async fn failed_writes_leave_records_untouched() {
        let events = Arc::new(EventBus::new());
        let manager = MemoryManager::new(
            MemoryOptions::default(),
            Arc::new(RejectingStorage),
            Arc::new(CountingSummarizer::default()),
            Arc::clone(&events),
        )
        .expect("valid options");
        let removed = counter(&events, EventKind::MemoryRemoved);
        manager.load().await.expect("load");
        let before = manager.records().await;

        let err = manager
            .create_memory_if_needed(&transcript(), Utc::now() - TimeDelta::seconds(125))
            .await
            .expect_err("save fails");
        assert!(matches!(err, MemoryError::Storage(ref m) if m == "disk full"));
        assert_eq!(manager.records().await, before);

        manager.cleanup_old_memories().await.expect_err("save fails");
        assert_eq!(manager.records().await, before);

        manager.clear_all_memories().await.expect_err("clear fails");
        assert_eq!(manager.records().await, before);
        assert_eq!(removed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn options_must_ascend() {
        let mut options = MemoryOptions::default();
        assert!(options.validate().is_ok());
        options.mid_term = Duration::from_secs(30);
        assert!(matches!(
            options.validate(),
            Err(MemoryError::InvalidOptions(_))
        ));
    }

    #[test]
    fn due_rule_uses_half_threshold() {
        let options = MemoryOptions::default();
        assert!(options.is_due(MemoryTier::Short, Duration::from_secs(30)));
        assert!(!options.is_due(MemoryTier::Short, Duration::from_secs(29)));
        assert!(options.is_due(MemoryTier::Mid, Duration::from_secs(120)));
        assert!(!options.is_due(MemoryTier::Long, Duration::from_secs(269)));
    }
}
