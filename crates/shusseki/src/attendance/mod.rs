//! Attendance recording
//!
//! - `AttendanceStore` trait and its memory and JSON lines backends
//! - `AttendanceRecorder`, which applies the cooldown and once-per-day rules

pub mod recorder;
pub mod store;

pub use recorder::{AttendanceEvent, AttendanceRecorder, RecordOutcome};
pub use store::{AttendanceRecord, AttendanceStore, JsonlAttendanceStore, MemoryAttendanceStore};
