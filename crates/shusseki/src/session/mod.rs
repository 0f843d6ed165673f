//! Session lifecycle
//!
//! - `SessionController`: start/stop/detection/roster commands and status
//! - `EngineCounters` / `EngineStats`: lock-free statistics shared by all components

mod controller;
mod stats;

pub use controller::{CameraLink, CommandOutcome, SessionController, SessionState, SessionStatus};
pub use stats::{EngineCounters, EngineStats};
