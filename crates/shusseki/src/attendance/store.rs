//! Attendance persistence
//!
//! The engine only needs two calls from a store: whether an identity already
//! has a record for a given day, and inserting a new record. Two backends:
//!
//! - `MemoryAttendanceStore`: process-local, used in tests and demos
//! - `JsonlAttendanceStore`: append-only JSON lines file; the per-day index is
//!   rebuilt when the file is opened, so the once-per-day rule holds across
//!   restarts

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// One attendance row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub identity_id: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub confidence: f32,
}

/// Storage backend for attendance records
#[async_trait::async_trait]
pub trait AttendanceStore: Send + Sync {
    /// Whether `identity_id` already has a record dated `date`
    async fn already_recorded_today(&self, identity_id: &str, date: NaiveDate) -> Result<bool>;

    /// Persist a record
    async fn insert(&self, record: &AttendanceRecord) -> Result<()>;
}

// ============================================================================
// In-memory store
// ============================================================================

/// Attendance store that keeps records in memory
#[derive(Default)]
pub struct MemoryAttendanceStore {
    records: Mutex<Vec<AttendanceRecord>>,
    inserts: AtomicU64,
    lookups: AtomicU64,
    fail_inserts: AtomicBool,
}

impl MemoryAttendanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate with existing records, as if written by an earlier run
    pub fn with_records(records: Vec<AttendanceRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            ..Default::default()
        }
    }

    pub async fn records(&self) -> Vec<AttendanceRecord> {
        self.records.lock().await.clone()
    }

    /// Number of successful `insert` calls
    pub fn insert_count(&self) -> u64 {
        self.inserts.load(Ordering::SeqCst)
    }

    /// Number of `already_recorded_today` calls
    pub fn lookup_count(&self) -> u64 {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Make subsequent inserts fail, simulating an unavailable database
    pub fn set_failing(&self, failing: bool) {
        self.fail_inserts.store(failing, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl AttendanceStore for MemoryAttendanceStore {
    async fn already_recorded_today(&self, identity_id: &str, date: NaiveDate) -> Result<bool> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .any(|r| r.identity_id == identity_id && r.date == date))
    }

    async fn insert(&self, record: &AttendanceRecord) -> Result<()> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            bail!("memory store is failing inserts");
        }
        self.records.lock().await.push(record.clone());
        self.inserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// JSON lines store
// ============================================================================

struct JsonlState {
    file: tokio::fs::File,
    days: HashSet<(String, NaiveDate)>,
}

/// Attendance store backed by an append-only JSON lines file
pub struct JsonlAttendanceStore {
    path: PathBuf,
    state: Mutex<JsonlState>,
}

impl JsonlAttendanceStore {
    /// Open (or create) the file and index the records already in it.
    ///
    /// Unparsable lines are skipped with a warning.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {:?}", parent))?;
            }
        }

        let mut days = HashSet::new();
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                for (line_no, line) in contents.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<AttendanceRecord>(line) {
                        Ok(record) => {
                            days.insert((record.identity_id, record.date));
                        }
                        Err(e) => warn!("Skipping bad attendance line {} in {:?}: {}", line_no + 1, path, e),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("Failed to read {:?}", path)),
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open {:?} for appending", path))?;

        info!("Attendance log {:?}: {} day record(s) indexed", path, days.len());

        Ok(Self {
            path,
            state: Mutex::new(JsonlState { file, days }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl AttendanceStore for JsonlAttendanceStore {
    async fn already_recorded_today(&self, identity_id: &str, date: NaiveDate) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state.days.contains(&(identity_id.to_string(), date)))
    }

    async fn insert(&self, record: &AttendanceRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut state = self.state.lock().await;
        state
            .file
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("Failed to append to {:?}", self.path))?;
        state.file.flush().await?;
        state.days.insert((record.identity_id.clone(), record.date));
        Ok(())
    }
}
