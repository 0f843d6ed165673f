//! Shusseki - camera attendance engine
//!
//! Continuously acquires video from a camera, periodically samples frames for
//! face matching against a known roster, records attendance without duplicates,
//! and republishes annotated frames to live viewers.
//!
//! - **Core types** (always available): Frame, LatestSlot, Error, EngineConfig
//! - **`capture`**: camera backends, device scanning and the capture loop
//! - **`recognition`**: face embedder seam, roster matching, detection worker
//! - **`attendance`**: attendance stores and the deduplicating recorder
//! - **`publish`**: overlay drawing and latest-wins fan-out to viewers
//! - **`session`**: the controller that owns the lifecycle and wires it together
//!
//! # Example
//!
//! ```ignore
//! use shusseki::session::SessionController;
//!
//! let controller = SessionController::new(config, backend, embedder, roster, store)?;
//! controller.reload_roster().await;
//! let outcome = controller.start().await;
//! assert!(outcome.ok, "{}", outcome.message);
//! let mut viewer = controller.subscribe();
//! while let Some(frame) = viewer.recv().await {
//!     // push frame.jpeg to the dashboard
//! }
//! ```

// Core modules (always compiled)
mod config;
mod error;
mod frame;
mod mailbox;

pub use config::*;
pub use error::{Error, Result};
pub use frame::{BoundingBox, Frame, RawFrame};
pub use mailbox::LatestSlot;

// Camera devices, scanning and capture
pub mod capture;

// Embedding seam, matcher, detection worker
pub mod recognition;

// Stores and the deduplicating recorder
pub mod attendance;

// Overlays and fan-out to viewers
pub mod publish;

// Lifecycle controller
pub mod session;

// ============================================================================
// Re-exports for convenience
// ============================================================================

pub use attendance::{AttendanceEvent, AttendanceRecord, AttendanceRecorder, AttendanceStore};
pub use capture::{CameraBackend, CameraDescriptor, CameraDevice, DeviceScanner, FrameSource};
pub use publish::{EncodedFrame, FramePublisher, Subscription};
pub use recognition::{Detection, FaceEmbedder, IdentityMatcher, KnownIdentity, MatchResult};
pub use recognition::{Roster, RosterProvider};
pub use session::{CameraLink, CommandOutcome, EngineStats, SessionController, SessionState, SessionStatus};
