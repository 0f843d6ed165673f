//! Camera device traits
//!
//! A `CameraBackend` knows how to name and open devices by index; an open
//! `CameraDevice` is a blocking frame reader owned by exactly one capture loop.
//! Dropping a device releases the underlying camera.

use std::time::Duration;

use anyhow::Result;

use crate::frame::RawFrame;

/// Resolution and rate, either requested from or reported by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFormat {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl DeviceFormat {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self { width, height, fps }
    }
}

/// An open camera.
pub trait CameraDevice: Send {
    /// Block until the next frame is available or `timeout` elapses.
    ///
    /// `Ok(None)` means the timeout expired without a frame, which callers
    /// treat as a transient failure.
    fn read_frame(&mut self, timeout: Duration) -> Result<Option<RawFrame>>;

    /// Format actually delivered by the device
    fn format(&self) -> DeviceFormat;
}

/// Factory for camera devices addressed by index.
pub trait CameraBackend: Send + Sync {
    /// Human-readable device name, or None if nothing exists at this index
    fn display_name(&self, index: u32) -> Option<String>;

    /// Open the device, requesting the given format
    fn open(&self, index: u32, requested: &DeviceFormat) -> Result<Box<dyn CameraDevice>>;
}
