//! Error types for the attendance engine

use thiserror::Error;

/// Errors surfaced by the engine.
///
/// Collaborator traits return `anyhow::Result`; their failures are wrapped into
/// the `Store`, `Roster` and `Embedder` variants where they cross into the engine.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no camera responded on indices 0..{scanned}")]
    NoDeviceFound { scanned: u32 },

    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),

    #[error("attendance store error: {0:#}")]
    Store(anyhow::Error),

    #[error("roster error: {0:#}")]
    Roster(anyhow::Error),

    #[error("face embedder error: {0:#}")]
    Embedder(anyhow::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context_chain() {
        let inner = anyhow::anyhow!("disk full").context("append record");
        let err = Error::Store(inner);
        assert_eq!(err.to_string(), "attendance store error: append record: disk full");
    }

    #[test]
    fn no_device_found_names_range() {
        let err = Error::NoDeviceFound { scanned: 10 };
        assert_eq!(err.to_string(), "no camera responded on indices 0..10");
    }
}
