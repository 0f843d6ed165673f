//! Face recognition
//!
//! - `FaceEmbedder` seam and an HTTP client implementation
//! - Roster snapshots and providers
//! - `IdentityMatcher`: nearest-neighbour matching against the roster
//! - `DetectionWorker`: the sampling loop tying them to the recorder

pub mod embedder;
pub mod http;
pub mod matcher;
pub mod roster;
pub mod worker;

pub use embedder::{Detection, FaceEmbedder, FaceEmbedding};
pub use http::HttpFaceEmbedder;
pub use matcher::{IdentityMatcher, MatchResult};
pub use roster::{JsonRosterProvider, KnownIdentity, Roster, RosterProvider, StaticRosterProvider};
pub use worker::{DetectionReport, DetectionWorker, FaceReport, FaceStatus};
