//! Camera discovery and selection
//!
//! Probes a bounded range of device indices, scores every responding camera
//! and picks the best one. Scoring is a pure function of the descriptor, so the
//! same set of cameras always yields the same choice.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::device::{CameraBackend, CameraDevice, DeviceFormat};
use crate::config::{CaptureConfig, ScanConfig};
use crate::error::{Error, Result};

/// Name fragments that mark a camera as external. Checked before the built-in list.
const EXTERNAL_KEYWORDS: &[&str] = &[
    "usb",
    "external",
    "logitech",
    "razer",
    "elgato",
    "creative",
    "microsoft lifecam",
    "phone",
    "mobile",
    "iphone",
    "android",
    "droidcam",
    "continuity",
];

/// Name fragments that mark a camera as built into the machine
const BUILT_IN_KEYWORDS: &[&str] = &[
    "integrated",
    "built-in",
    "builtin",
    "internal",
    "facetime",
    "isight",
    "laptop",
    "chicony",
    "realtek",
];

/// A camera found by a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CameraDescriptor {
    pub index: u32,
    pub display_name: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub is_built_in: bool,
    pub priority_score: i32,
}

impl CameraDescriptor {
    /// Build a descriptor and compute its classification and score
    pub fn new(index: u32, display_name: impl Into<String>, format: DeviceFormat) -> Self {
        let display_name = display_name.into();
        let is_built_in = classify_built_in(index, &display_name);
        let priority_score = priority_score(is_built_in, index, format.width, format.height);
        Self {
            index,
            display_name,
            width: format.width,
            height: format.height,
            fps: format.fps,
            is_built_in,
            priority_score,
        }
    }
}

/// Decide whether a camera is built in from its index and name.
///
/// Index 0 is always built in. Otherwise external keywords win over built-in
/// keywords, and with no keyword match indices 0 and 1 count as built in.
pub fn classify_built_in(index: u32, display_name: &str) -> bool {
    if index == 0 {
        return true;
    }
    let name = display_name.to_lowercase();
    if EXTERNAL_KEYWORDS.iter().any(|k| name.contains(k)) {
        return false;
    }
    if BUILT_IN_KEYWORDS.iter().any(|k| name.contains(k)) {
        return true;
    }
    index <= 1
}

/// Selection score: built-in bonus, lower-index bonus, resolution class bonus
pub fn priority_score(is_built_in: bool, index: u32, width: u32, height: u32) -> i32 {
    let base = if is_built_in { 1000 } else { 0 };
    let index_bonus = 10i32.saturating_sub(index.min(10) as i32) * 10;
    let resolution_bonus = if width >= 1280 && height >= 720 {
        50
    } else if width >= 640 && height >= 480 {
        30
    } else {
        10
    };
    base + index_bonus + resolution_bonus
}

/// Sort descending by score, ties broken by ascending index
pub fn rank(candidates: &mut [CameraDescriptor]) {
    candidates.sort_by(|a, b| {
        b.priority_score
            .cmp(&a.priority_score)
            .then(a.index.cmp(&b.index))
    });
}

/// Enumerates cameras through a backend and selects one to capture from
pub struct DeviceScanner {
    backend: Arc<dyn CameraBackend>,
    scan: ScanConfig,
    requested: DeviceFormat,
}

impl DeviceScanner {
    pub fn new(backend: Arc<dyn CameraBackend>, scan: ScanConfig, capture: &CaptureConfig) -> Self {
        Self {
            backend,
            scan,
            requested: DeviceFormat::new(capture.width, capture.height, capture.fps),
        }
    }

    /// Probe every index in range and return the cameras that delivered a frame,
    /// ranked best first.
    ///
    /// Devices that fail to open or read are skipped silently; the scan only
    /// fails when nothing responds at all.
    pub fn scan(&self) -> Result<Vec<CameraDescriptor>> {
        let mut found = Vec::new();

        for index in 0..self.scan.max_index {
            let Some(name) = self.backend.display_name(index) else {
                continue;
            };
            match self.probe(index) {
                Some(format) => {
                    let descriptor = CameraDescriptor::new(index, name, format);
                    debug!(
                        camera = index,
                        name = %descriptor.display_name,
                        score = descriptor.priority_score,
                        "Found {}x{}@{}",
                        descriptor.width,
                        descriptor.height,
                        descriptor.fps
                    );
                    found.push(descriptor);
                }
                None => debug!(camera = index, name = %name, "Device did not respond, skipping"),
            }
        }

        if found.is_empty() {
            return Err(Error::NoDeviceFound {
                scanned: self.scan.max_index,
            });
        }

        rank(&mut found);
        info!("Camera scan found {} device(s)", found.len());
        Ok(found)
    }

    /// Scan, then return the highest-ranked camera that re-opens and reads.
    ///
    /// The verified device handle is returned so the caller can capture from it
    /// without opening the camera a second time.
    pub fn select_best(&self) -> Result<(CameraDescriptor, Box<dyn CameraDevice>)> {
        let candidates = self.scan()?;
        self.verify_first(candidates)
    }

    /// Try candidates in order; the first that re-opens with a good read wins
    pub fn verify_first(
        &self,
        candidates: Vec<CameraDescriptor>,
    ) -> Result<(CameraDescriptor, Box<dyn CameraDevice>)> {
        for descriptor in candidates.iter() {
            match self.open_and_read(descriptor.index) {
                Ok(device) => {
                    info!(
                        camera = descriptor.index,
                        name = %descriptor.display_name,
                        score = descriptor.priority_score,
                        "Selected camera"
                    );
                    return Ok((descriptor.clone(), device));
                }
                Err(e) => {
                    warn!(camera = descriptor.index, error = %e, "Camera failed verification, trying next");
                }
            }
        }
        Err(Error::CameraUnavailable(format!(
            "none of {} candidate camera(s) could be re-opened",
            candidates.len()
        )))
    }

    fn probe(&self, index: u32) -> Option<DeviceFormat> {
        // The probe handle is dropped here, releasing the camera before selection
        self.open_and_read(index).ok().map(|device| device.format())
    }

    fn open_and_read(&self, index: u32) -> anyhow::Result<Box<dyn CameraDevice>> {
        let mut device = self.backend.open(index, &self.requested)?;
        match device.read_frame(self.scan.probe_timeout)? {
            Some(frame) if !frame.is_empty() => Ok(device),
            Some(_) => anyhow::bail!("camera {index} returned an empty frame"),
            None => anyhow::bail!("camera {index} produced no frame within {:?}", self.scan.probe_timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::{SyntheticCamera, SyntheticCameraBackend};

    fn descriptor(index: u32, name: &str, width: u32, height: u32) -> CameraDescriptor {
        CameraDescriptor::new(index, name, DeviceFormat::new(width, height, 30))
    }

    fn scanner(backend: Arc<SyntheticCameraBackend>) -> DeviceScanner {
        let scan = ScanConfig {
            probe_timeout: std::time::Duration::from_millis(200),
            ..Default::default()
        };
        DeviceScanner::new(backend, scan, &CaptureConfig::default())
    }

    #[test]
    fn classification_rules() {
        assert!(classify_built_in(0, "USB Camera"));
        assert!(!classify_built_in(1, "Logitech C920"));
        assert!(!classify_built_in(2, "Integrated USB Webcam"));
        assert!(classify_built_in(3, "FaceTime HD Camera"));
        assert!(classify_built_in(1, "Video Device"));
        assert!(!classify_built_in(2, "Video Device"));
        assert!(!classify_built_in(1, "DroidCam Phone"));
    }

    #[test]
    fn score_components() {
        assert_eq!(priority_score(true, 0, 1280, 720), 1000 + 100 + 50);
        assert_eq!(priority_score(false, 2, 640, 480), 80 + 30);
        assert_eq!(priority_score(false, 3, 320, 240), 70 + 10);
        // Index bonus is clamped at zero past index 10
        assert_eq!(priority_score(false, 12, 320, 240), 10);
        assert_eq!(priority_score(false, 10, 1920, 1080), 50);
    }

    #[test]
    fn ranking_is_deterministic() {
        let cameras = vec![
            descriptor(3, "Logitech BRIO", 1920, 1080),
            descriptor(0, "Integrated Camera", 640, 480),
            descriptor(2, "USB Video", 1280, 720),
            descriptor(1, "Integrated IR Camera", 640, 480),
        ];

        let mut first = cameras.clone();
        rank(&mut first);
        let mut reversed: Vec<_> = cameras.into_iter().rev().collect();
        rank(&mut reversed);

        assert_eq!(first, reversed);
        let order: Vec<u32> = first.iter().map(|d| d.index).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn equal_scores_tie_break_on_index() {
        // Same class and resolution; 11 and 12 both get no index bonus
        let mut cameras = vec![
            descriptor(12, "USB A", 640, 480),
            descriptor(11, "USB B", 640, 480),
        ];
        rank(&mut cameras);
        assert_eq!(cameras[0].index, 11);
    }

    #[test]
    fn scan_skips_unresponsive_devices() {
        let backend = Arc::new(
            SyntheticCameraBackend::new()
                .with_camera(SyntheticCamera::new(0, "Integrated Camera").silent())
                .with_camera(SyntheticCamera::new(2, "USB Webcam").with_resolution(640, 480)),
        );
        let found = scanner(backend.clone()).scan().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].index, 2);
        assert_eq!((found[0].width, found[0].height), (640, 480));
        // Probe handles are released after the scan
        assert_eq!(backend.open_handles(), 0);
    }

    #[test]
    fn scan_with_no_devices_fails() {
        let backend = Arc::new(SyntheticCameraBackend::new());
        let err = scanner(backend).scan().unwrap_err();
        assert!(matches!(err, Error::NoDeviceFound { scanned: 10 }));
    }

    #[test]
    fn select_best_falls_through_on_failed_reopen() {
        // Built-in camera answers the probe but cannot be opened again
        let backend = Arc::new(
            SyntheticCameraBackend::new()
                .with_camera(SyntheticCamera::new(0, "Integrated Camera").max_opens(1))
                .with_camera(SyntheticCamera::new(1, "USB Webcam")),
        );
        let (chosen, device) = scanner(backend.clone()).select_best().unwrap();
        assert_eq!(chosen.index, 1);
        assert_eq!(backend.open_handles(), 1);
        drop(device);
        assert_eq!(backend.open_handles(), 0);
    }

    #[test]
    fn select_best_fails_when_no_candidate_reopens() {
        let backend = Arc::new(
            SyntheticCameraBackend::new()
                .with_camera(SyntheticCamera::new(0, "Integrated Camera").max_opens(1)),
        );
        let err = scanner(backend).select_best().err().expect("select_best should fail");
        assert!(matches!(err, Error::CameraUnavailable(_)));
    }
}
