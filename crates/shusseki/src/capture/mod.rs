//! Camera capture
//!
//! - Device traits implemented by camera backends
//! - Device scanning, scoring and selection
//! - The frame source and its capture loop
//! - A V4L2 backend via ffmpeg, and a synthetic backend for tests

pub mod device;
pub mod ffmpeg;
pub mod scanner;
pub mod source;
#[cfg(any(test, feature = "test-source"))]
pub mod synthetic;

pub use device::{CameraBackend, CameraDevice, DeviceFormat};
pub use ffmpeg::FfmpegCameraBackend;
pub use scanner::{CameraDescriptor, DeviceScanner};
pub use source::{CaptureHealth, FrameSource};

#[cfg(any(test, feature = "test-source"))]
pub use synthetic::{SyntheticCamera, SyntheticCameraBackend};
