//! Deduplicating attendance recorder
//!
//! Two independent rules keep the record clean:
//!
//! 1. **Cooldown**: an in-memory map of when each identity was last recorded.
//!    Rapid re-detections within the cooldown never reach the store.
//! 2. **Once per day**: checked against the store itself, since the cooldown
//!    map does not survive a restart.
//!
//! The cooldown map is guarded by one async lock that is held across the store
//! calls, so two concurrent detections of the same person insert once.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use super::store::{AttendanceRecord, AttendanceStore};
use crate::error::{Error, Result};
use crate::session::EngineCounters;

/// Result of a `record` call that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecordOutcome {
    /// A new record was written
    Recorded,
    /// Seen too recently; nothing was written
    CoolingDown,
    /// The store already has a record for this identity today
    AlreadyRecordedToday,
}

impl RecordOutcome {
    pub fn recorded(&self) -> bool {
        matches!(self, RecordOutcome::Recorded)
    }
}

/// Broadcast for every record written
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceEvent {
    pub identity_id: String,
    pub display_name: String,
    pub confidence: f32,
    pub recorded_at: DateTime<Local>,
}

pub struct AttendanceRecorder {
    store: Arc<dyn AttendanceStore>,
    cooldown: Duration,
    last_recorded: Mutex<HashMap<String, DateTime<Local>>>,
    events: broadcast::Sender<AttendanceEvent>,
    counters: Arc<EngineCounters>,
}

impl AttendanceRecorder {
    pub fn new(store: Arc<dyn AttendanceStore>, cooldown: Duration, counters: Arc<EngineCounters>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            store,
            cooldown,
            last_recorded: Mutex::new(HashMap::new()),
            events,
            counters,
        }
    }

    /// Record attendance for `identity_id` at `now`, unless a dedup rule applies.
    ///
    /// Dedup hits are reported as `Ok` outcomes. Only store failures are errors,
    /// and a failed insert leaves the cooldown untouched so the next detection
    /// retries.
    pub async fn record(
        &self,
        identity_id: &str,
        display_name: &str,
        confidence: f32,
        now: DateTime<Local>,
    ) -> Result<RecordOutcome> {
        let mut last_recorded = self.last_recorded.lock().await;

        if let Some(previous) = last_recorded.get(identity_id) {
            // A negative gap (clock stepped back) counts as still cooling down
            let cooling = match now.signed_duration_since(*previous).to_std() {
                Ok(elapsed) => elapsed < self.cooldown,
                Err(_) => true,
            };
            if cooling {
                self.counters.duplicates_suppressed.fetch_add(1, Ordering::Relaxed);
                return Ok(RecordOutcome::CoolingDown);
            }
        }

        let date = now.date_naive();
        let already = self
            .store
            .already_recorded_today(identity_id, date)
            .await
            .map_err(|e| self.store_error(identity_id, e))?;
        if already {
            debug!(identity = identity_id, %date, "Already recorded today");
            self.counters.duplicates_suppressed.fetch_add(1, Ordering::Relaxed);
            return Ok(RecordOutcome::AlreadyRecordedToday);
        }

        let record = AttendanceRecord {
            identity_id: identity_id.to_string(),
            date,
            time: now.time(),
            confidence,
        };
        self.store
            .insert(&record)
            .await
            .map_err(|e| self.store_error(identity_id, e))?;

        last_recorded.insert(identity_id.to_string(), now);
        drop(last_recorded);

        self.counters.attendance_recorded.fetch_add(1, Ordering::Relaxed);
        info!(
            identity = identity_id,
            name = display_name,
            confidence = %format!("{confidence:.2}"),
            "Attendance recorded"
        );
        // No receivers is not an error
        let _ = self.events.send(AttendanceEvent {
            identity_id: identity_id.to_string(),
            display_name: display_name.to_string(),
            confidence,
            recorded_at: now,
        });

        Ok(RecordOutcome::Recorded)
    }

    /// Receive every future `AttendanceEvent`; slow receivers lose the oldest
    pub fn subscribe(&self) -> broadcast::Receiver<AttendanceEvent> {
        self.events.subscribe()
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    fn store_error(&self, identity_id: &str, e: anyhow::Error) -> Error {
        self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
        warn!(identity = identity_id, error = %format!("{e:#}"), "Attendance store call failed");
        Error::Store(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attendance::store::MemoryAttendanceStore;
    use chrono::{NaiveDate, TimeZone};
    use std::sync::atomic::AtomicU64;

    /// Store that never reports an existing daily record, isolating the cooldown rule
    #[derive(Default)]
    struct CountingStore {
        inserts: AtomicU64,
    }

    #[async_trait::async_trait]
    impl AttendanceStore for CountingStore {
        async fn already_recorded_today(&self, _: &str, _: NaiveDate) -> anyhow::Result<bool> {
            Ok(false)
        }

        async fn insert(&self, _: &AttendanceRecord) -> anyhow::Result<()> {
            self.inserts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    const COOLDOWN: Duration = Duration::from_secs(30);

    fn t0() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 9, 2, 9, 0, 0).unwrap()
    }

    fn recorder(store: Arc<dyn AttendanceStore>) -> AttendanceRecorder {
        AttendanceRecorder::new(store, COOLDOWN, Arc::new(EngineCounters::default()))
    }

    #[tokio::test]
    async fn cooldown_suppresses_rapid_repeats() {
        let store = Arc::new(CountingStore::default());
        let recorder = recorder(store.clone());
        let eps = chrono::Duration::milliseconds(500);
        let cooldown = chrono::Duration::from_std(COOLDOWN).unwrap();

        assert_eq!(recorder.record("alice", "Alice", 0.8, t0()).await.unwrap(), RecordOutcome::Recorded);
        assert_eq!(
            recorder.record("alice", "Alice", 0.8, t0() + eps).await.unwrap(),
            RecordOutcome::CoolingDown
        );
        assert_eq!(store.inserts.load(Ordering::SeqCst), 1);

        let outcome = recorder.record("alice", "Alice", 0.8, t0() + cooldown + eps).await.unwrap();
        assert!(outcome.recorded());
        assert_eq!(store.inserts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cooldown_is_per_identity() {
        let store = Arc::new(CountingStore::default());
        let recorder = recorder(store.clone());
        recorder.record("alice", "Alice", 0.8, t0()).await.unwrap();
        let outcome = recorder.record("bob", "Bob", 0.9, t0()).await.unwrap();
        assert_eq!(outcome, RecordOutcome::Recorded);
        assert_eq!(store.inserts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn daily_record_blocks_insert() {
        let existing = AttendanceRecord {
            identity_id: "alice".into(),
            date: t0().date_naive(),
            time: chrono::NaiveTime::from_hms_opt(7, 45, 0).unwrap(),
            confidence: 0.9,
        };
        let store = Arc::new(MemoryAttendanceStore::with_records(vec![existing]));
        let recorder = recorder(store.clone());

        for minutes in [0, 5, 60, 240] {
            let now = t0() + chrono::Duration::minutes(minutes);
            let outcome = recorder.record("alice", "Alice", 0.8, now).await.unwrap();
            assert_eq!(outcome, RecordOutcome::AlreadyRecordedToday);
        }
        assert_eq!(store.insert_count(), 0);

        // Next day is a fresh record
        let tomorrow = t0() + chrono::Duration::days(1);
        assert!(recorder.record("alice", "Alice", 0.8, tomorrow).await.unwrap().recorded());
        assert_eq!(store.insert_count(), 1);
    }

    #[tokio::test]
    async fn cooling_down_skips_the_store() {
        let store = Arc::new(MemoryAttendanceStore::new());
        let recorder = recorder(store.clone());
        recorder.record("alice", "Alice", 0.8, t0()).await.unwrap();
        let lookups = store.lookup_count();
        recorder
            .record("alice", "Alice", 0.8, t0() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(store.lookup_count(), lookups);
    }

    #[tokio::test]
    async fn failed_insert_leaves_cooldown_untouched() {
        let store = Arc::new(MemoryAttendanceStore::new());
        let counters = Arc::new(EngineCounters::default());
        let recorder = AttendanceRecorder::new(store.clone(), COOLDOWN, counters.clone());

        store.set_failing(true);
        let err = recorder.record("alice", "Alice", 0.8, t0()).await.unwrap_err();
        assert!(matches!(err, Error::Store(_)));
        assert_eq!(counters.store_errors.load(Ordering::Relaxed), 1);

        store.set_failing(false);
        let outcome = recorder
            .record("alice", "Alice", 0.8, t0() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(outcome, RecordOutcome::Recorded);
    }

    #[tokio::test]
    async fn clock_going_backwards_counts_as_cooling_down() {
        let store = Arc::new(CountingStore::default());
        let recorder = recorder(store.clone());
        recorder.record("alice", "Alice", 0.8, t0()).await.unwrap();
        let outcome = recorder
            .record("alice", "Alice", 0.8, t0() - chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(outcome, RecordOutcome::CoolingDown);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_detections_insert_once() {
        let store = Arc::new(CountingStore::default());
        let recorder = Arc::new(recorder(store.clone()));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let recorder = recorder.clone();
                tokio::spawn(async move {
                    let now = t0() + chrono::Duration::milliseconds(i);
                    recorder.record("alice", "Alice", 0.8, now).await.unwrap()
                })
            })
            .collect();

        let mut recorded = 0;
        for handle in handles {
            if handle.await.unwrap().recorded() {
                recorded += 1;
            }
        }
        assert_eq!(recorded, 1);
        assert_eq!(store.inserts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn events_are_broadcast() {
        let recorder = recorder(Arc::new(MemoryAttendanceStore::new()));
        let mut events = recorder.subscribe();
        recorder.record("alice", "Alice", 0.75, t0()).await.unwrap();
        recorder
            .record("alice", "Alice", 0.75, t0() + chrono::Duration::seconds(1))
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.identity_id, "alice");
        assert_eq!(event.display_name, "Alice");
        assert_eq!(event.recorded_at, t0());
        assert!(events.try_recv().is_err());
    }
}
