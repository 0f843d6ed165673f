//! Engine configuration
//!
//! Every component takes its own config struct; `EngineConfig` groups them for
//! the session controller. All structs implement `Default` with production
//! values, so callers only override what they need.

use std::time::Duration;

use crate::error::{Error, Result};

/// Camera discovery settings
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Probe indices `0..max_index`
    pub max_index: u32,
    /// How long to wait for the first frame from a probed device
    pub probe_timeout: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_index: 10,
            probe_timeout: Duration::from_millis(1500),
        }
    }
}

/// Capture loop settings
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Requested resolution and rate; devices may deliver something else
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Maximum time a single device read may block
    pub read_timeout: Duration,
    /// Consecutive failed reads before the capture loop gives up
    pub max_consecutive_failures: u32,
    /// Pause between retries after a failed read
    pub failure_backoff: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
            read_timeout: Duration::from_secs(2),
            max_consecutive_failures: 5,
            failure_backoff: Duration::from_millis(100),
        }
    }
}

/// How often the detection worker samples the latest frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionCadence {
    /// At most once per interval
    Interval(Duration),
    /// Once every N newly captured frames
    EveryNthFrame(u64),
}

/// Detection worker settings
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    pub cadence: DetectionCadence,
    /// How often to check for new frames in `EveryNthFrame` mode
    pub poll_interval: Duration,
    /// Downsample factor applied before the embedder sees the frame
    pub scale: f32,
    /// Matches require a Euclidean distance strictly below this value
    pub match_threshold: f32,
    /// Overlays older than this are no longer drawn on published frames
    pub report_ttl: Duration,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            cadence: DetectionCadence::Interval(Duration::from_millis(500)),
            poll_interval: Duration::from_millis(10),
            scale: 0.25,
            match_threshold: 0.5,
            report_ttl: Duration::from_secs(1),
        }
    }
}

/// Attendance recorder settings
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Minimum time between two records for the same identity
    pub cooldown: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Frame publisher settings
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Publish pump tick
    pub interval: Duration,
    /// Publish only when the frame sequence advanced by at least this much
    pub every_nth: u64,
    /// JPEG quality, 1-100
    pub jpeg_quality: u8,
    /// Draw detection boxes and labels on published frames
    pub draw_overlays: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(33),
            every_nth: 1,
            jpeg_quality: 80,
            draw_overlays: true,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub scan: ScanConfig,
    pub capture: CaptureConfig,
    pub detection: DetectionConfig,
    pub recorder: RecorderConfig,
    pub publisher: PublisherConfig,
    /// Upper bound on how long `stop()` waits for workers before forcing release
    pub shutdown_timeout: Duration,
    /// Whether detection runs as soon as a session starts
    pub detection_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scan: ScanConfig::default(),
            capture: CaptureConfig::default(),
            detection: DetectionConfig::default(),
            recorder: RecorderConfig::default(),
            publisher: PublisherConfig::default(),
            shutdown_timeout: Duration::from_secs(5),
            detection_enabled: true,
        }
    }
}

impl EngineConfig {
    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.scan.max_index == 0 {
            return Err(Error::Config("scan.max_index must be at least 1".into()));
        }
        if self.capture.max_consecutive_failures == 0 {
            return Err(Error::Config(
                "capture.max_consecutive_failures must be at least 1".into(),
            ));
        }
        if self.capture.read_timeout.is_zero() {
            return Err(Error::Config("capture.read_timeout must be non-zero".into()));
        }
        match self.detection.cadence {
            DetectionCadence::Interval(d) if d.is_zero() => {
                return Err(Error::Config("detection interval must be non-zero".into()));
            }
            DetectionCadence::EveryNthFrame(0) => {
                return Err(Error::Config("detection frame stride must be at least 1".into()));
            }
            _ => {}
        }
        if self.detection.poll_interval.is_zero() {
            return Err(Error::Config("detection.poll_interval must be non-zero".into()));
        }
        let scale = self.detection.scale;
        if !(scale > 0.0 && scale <= 1.0) {
            return Err(Error::Config(format!(
                "detection.scale must be in (0, 1], got {scale}"
            )));
        }
        let threshold = self.detection.match_threshold;
        if !(threshold > 0.0 && threshold <= 2.0) {
            return Err(Error::Config(format!(
                "detection.match_threshold must be in (0, 2], got {threshold}"
            )));
        }
        if self.publisher.interval.is_zero() {
            return Err(Error::Config("publisher.interval must be non-zero".into()));
        }
        if self.publisher.every_nth == 0 {
            return Err(Error::Config("publisher.every_nth must be at least 1".into()));
        }
        if !(1..=100).contains(&self.publisher.jpeg_quality) {
            return Err(Error::Config(format!(
                "publisher.jpeg_quality must be in 1..=100, got {}",
                self.publisher.jpeg_quality
            )));
        }
        if self.shutdown_timeout.is_zero() {
            return Err(Error::Config("shutdown_timeout must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scan.max_index, 10);
        assert_eq!(config.capture.max_consecutive_failures, 5);
        assert_eq!(config.recorder.cooldown, Duration::from_secs(30));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.detection.match_threshold, 0.5);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut config = EngineConfig::default();
        config.detection.scale = 0.0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = EngineConfig::default();
        config.detection.match_threshold = 2.5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.publisher.jpeg_quality = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.scan.max_index = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.capture.max_consecutive_failures = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_cadence() {
        let mut config = EngineConfig::default();
        config.detection.cadence = DetectionCadence::EveryNthFrame(0);
        assert!(config.validate().is_err());

        config.detection.cadence = DetectionCadence::Interval(Duration::ZERO);
        assert!(config.validate().is_err());

        config.detection.cadence = DetectionCadence::EveryNthFrame(3);
        assert!(config.validate().is_ok());
    }
}
