//! Synthetic camera backend for development and tests
//!
//! Cameras are scripted in-process: healthy cameras produce a moving test
//! pattern at their frame rate, silent cameras never deliver a frame, and
//! failing cameras return read errors after a number of frames. The backend
//! counts opens per index and live handles so tests can check that devices
//! are opened once and released on stop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use bytes::Bytes;
use tracing::debug;

use super::device::{CameraBackend, CameraDevice, DeviceFormat};
use crate::frame::RawFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Healthy,
    Silent,
    /// Deliver this many frames per open, then fail every read
    FailAfter(u64),
}

/// Script for one synthetic camera
#[derive(Debug, Clone)]
pub struct SyntheticCamera {
    index: u32,
    name: String,
    format: DeviceFormat,
    behavior: Behavior,
    max_opens: Option<u32>,
}

impl SyntheticCamera {
    /// A healthy 320x240@30 camera
    pub fn new(index: u32, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            format: DeviceFormat::new(320, 240, 30),
            behavior: Behavior::Healthy,
            max_opens: None,
        }
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.format.width = width;
        self.format.height = height;
        self
    }

    pub fn with_fps(mut self, fps: u32) -> Self {
        self.format.fps = fps.max(1);
        self
    }

    /// Never deliver a frame; reads block until their timeout
    pub fn silent(mut self) -> Self {
        self.behavior = Behavior::Silent;
        self
    }

    /// Deliver `frames` frames after each open, then fail every read
    pub fn fail_after(mut self, frames: u64) -> Self {
        self.behavior = Behavior::FailAfter(frames);
        self
    }

    /// Refuse to open more than `opens` times over the backend's lifetime
    pub fn max_opens(mut self, opens: u32) -> Self {
        self.max_opens = Some(opens);
        self
    }
}

struct CameraState {
    script: SyntheticCamera,
    opens: u32,
    unplugged: Arc<AtomicBool>,
}

/// In-process camera backend driven by `SyntheticCamera` scripts
#[derive(Default)]
pub struct SyntheticCameraBackend {
    cameras: Mutex<HashMap<u32, CameraState>>,
    live_handles: Arc<AtomicUsize>,
}

impl SyntheticCameraBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_camera(self, camera: SyntheticCamera) -> Self {
        self.lock().insert(
            camera.index,
            CameraState {
                script: camera,
                opens: 0,
                unplugged: Arc::new(AtomicBool::new(false)),
            },
        );
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u32, CameraState>> {
        self.cameras.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// How many times the camera at `index` has been opened
    pub fn open_count(&self, index: u32) -> u32 {
        self.lock().get(&index).map(|c| c.opens).unwrap_or(0)
    }

    /// Number of device handles currently alive across all cameras
    pub fn open_handles(&self) -> usize {
        self.live_handles.load(Ordering::SeqCst)
    }

    /// Make every open handle of this camera fail from its next read on,
    /// simulating a cable pull. Further opens also fail.
    pub fn unplug(&self, index: u32) {
        if let Some(camera) = self.lock().get(&index) {
            camera.unplugged.store(true, Ordering::SeqCst);
        }
    }
}

impl CameraBackend for SyntheticCameraBackend {
    fn display_name(&self, index: u32) -> Option<String> {
        self.lock().get(&index).map(|c| c.script.name.clone())
    }

    fn open(&self, index: u32, _requested: &DeviceFormat) -> Result<Box<dyn CameraDevice>> {
        let mut cameras = self.lock();
        let Some(camera) = cameras.get_mut(&index) else {
            bail!("no synthetic camera at index {index}");
        };
        if camera.unplugged.load(Ordering::SeqCst) {
            bail!("synthetic camera {index} is unplugged");
        }
        if let Some(max) = camera.script.max_opens {
            if camera.opens >= max {
                bail!("synthetic camera {index} refused open (limit {max})");
            }
        }
        camera.opens += 1;
        self.live_handles.fetch_add(1, Ordering::SeqCst);
        debug!(camera = index, opens = camera.opens, "Synthetic camera opened");

        Ok(Box::new(SyntheticDevice {
            index,
            format: camera.script.format,
            behavior: camera.script.behavior,
            delivered: 0,
            unplugged: camera.unplugged.clone(),
            live_handles: self.live_handles.clone(),
        }))
    }
}

struct SyntheticDevice {
    index: u32,
    format: DeviceFormat,
    behavior: Behavior,
    delivered: u64,
    unplugged: Arc<AtomicBool>,
    live_handles: Arc<AtomicUsize>,
}

impl SyntheticDevice {
    fn render(&self) -> RawFrame {
        let (w, h) = (self.format.width, self.format.height);
        let bar = (self.delivered * 8 % w.max(1) as u64) as u32;
        let mut pixels = Vec::with_capacity(w as usize * h as usize * 3);
        for y in 0..h {
            for x in 0..w {
                if x.abs_diff(bar) < 4 {
                    pixels.extend_from_slice(&[255, 255, 255]);
                } else {
                    pixels.push((x * 255 / w.max(1)) as u8);
                    pixels.push((y * 255 / h.max(1)) as u8);
                    pixels.push((self.index * 60 % 256) as u8);
                }
            }
        }
        RawFrame::new(w, h, Bytes::from(pixels))
    }
}

impl CameraDevice for SyntheticDevice {
    fn read_frame(&mut self, timeout: Duration) -> Result<Option<RawFrame>> {
        if self.unplugged.load(Ordering::SeqCst) {
            bail!("synthetic camera {} disconnected", self.index);
        }
        match self.behavior {
            Behavior::Silent => {
                std::thread::sleep(timeout);
                return Ok(None);
            }
            Behavior::FailAfter(n) if self.delivered >= n => {
                bail!("synthetic camera {} read failed", self.index);
            }
            _ => {}
        }
        let frame_time = Duration::from_micros(1_000_000 / self.format.fps as u64);
        if frame_time > timeout {
            std::thread::sleep(timeout);
            return Ok(None);
        }
        std::thread::sleep(frame_time);
        let frame = self.render();
        self.delivered += 1;
        Ok(Some(frame))
    }

    fn format(&self) -> DeviceFormat {
        self.format
    }
}

impl Drop for SyntheticDevice {
    fn drop(&mut self) {
        self.live_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(200);

    #[test]
    fn healthy_camera_produces_frames() {
        let backend = SyntheticCameraBackend::new()
            .with_camera(SyntheticCamera::new(0, "Test").with_resolution(16, 8).with_fps(200));
        let mut device = backend.open(0, &DeviceFormat::new(1280, 720, 30)).unwrap();
        let frame = device.read_frame(TIMEOUT).unwrap().unwrap();
        assert_eq!((frame.width, frame.height), (16, 8));
        assert!(!frame.is_empty());
        assert_eq!(backend.open_count(0), 1);
        assert_eq!(backend.open_handles(), 1);
        drop(device);
        assert_eq!(backend.open_handles(), 0);
    }

    #[test]
    fn fail_after_counts_per_open() {
        let backend = SyntheticCameraBackend::new()
            .with_camera(SyntheticCamera::new(1, "Flaky").with_fps(200).fail_after(2));
        let format = DeviceFormat::new(320, 240, 30);
        let mut device = backend.open(1, &format).unwrap();
        assert!(device.read_frame(TIMEOUT).unwrap().is_some());
        assert!(device.read_frame(TIMEOUT).unwrap().is_some());
        assert!(device.read_frame(TIMEOUT).is_err());

        let mut reopened = backend.open(1, &format).unwrap();
        assert!(reopened.read_frame(TIMEOUT).unwrap().is_some());
    }

    #[test]
    fn silent_camera_times_out() {
        let backend = SyntheticCameraBackend::new().with_camera(SyntheticCamera::new(0, "Dark").silent());
        let mut device = backend.open(0, &DeviceFormat::new(320, 240, 30)).unwrap();
        assert!(device.read_frame(Duration::from_millis(10)).unwrap().is_none());
    }

    #[test]
    fn open_limit_and_unplug() {
        let backend = SyntheticCameraBackend::new()
            .with_camera(SyntheticCamera::new(0, "Once").max_opens(1))
            .with_camera(SyntheticCamera::new(1, "Cable").with_fps(200));
        let format = DeviceFormat::new(320, 240, 30);
        assert!(backend.open(0, &format).is_ok());
        assert!(backend.open(0, &format).is_err());
        assert!(backend.open(5, &format).is_err());

        let mut device = backend.open(1, &format).unwrap();
        assert!(device.read_frame(TIMEOUT).unwrap().is_some());
        backend.unplug(1);
        assert!(device.read_frame(TIMEOUT).is_err());
        assert!(backend.open(1, &format).is_err());
    }
}
