//! Frame source: one open camera and its capture loop
//!
//! The capture loop runs on a dedicated OS thread because device reads block.
//! Every good frame is stamped with the next sequence number and written to a
//! `LatestSlot`, so readers always see the newest frame and never slow the
//! loop down. Transient read failures are retried after a short backoff; after
//! `max_consecutive_failures` in a row the loop gives up and reports
//! `CaptureHealth::Failed`.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::device::{CameraBackend, CameraDevice, DeviceFormat};
use super::scanner::CameraDescriptor;
use crate::config::CaptureConfig;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::mailbox::LatestSlot;
use crate::session::EngineCounters;

/// Liveness of a capture loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureHealth {
    Running,
    /// Stopped on request; the device has been released
    Stopped,
    /// Gave up after repeated read failures; the device has been released
    Failed(String),
}

impl CaptureHealth {
    pub fn is_running(&self) -> bool {
        matches!(self, CaptureHealth::Running)
    }
}

/// An open camera with a running capture loop
pub struct FrameSource {
    descriptor: CameraDescriptor,
    slot: Arc<LatestSlot<Frame>>,
    cancel: CancellationToken,
    health: watch::Receiver<CaptureHealth>,
}

impl FrameSource {
    /// Open the described camera and start capturing
    pub fn open(
        backend: &dyn CameraBackend,
        descriptor: CameraDescriptor,
        config: &CaptureConfig,
        counters: Arc<EngineCounters>,
    ) -> Result<Self> {
        let requested = DeviceFormat::new(config.width, config.height, config.fps);
        let device = backend.open(descriptor.index, &requested).map_err(|e| {
            Error::CameraUnavailable(format!("camera {}: {e:#}", descriptor.index))
        })?;
        Self::start(device, descriptor, config, counters)
    }

    /// Start capturing from a device that is already open
    pub fn start(
        device: Box<dyn CameraDevice>,
        descriptor: CameraDescriptor,
        config: &CaptureConfig,
        counters: Arc<EngineCounters>,
    ) -> Result<Self> {
        let slot = Arc::new(LatestSlot::new());
        let cancel = CancellationToken::new();
        let (health_tx, health) = watch::channel(CaptureHealth::Running);

        let capture = CaptureLoop {
            index: descriptor.index,
            device,
            slot: slot.clone(),
            cancel: cancel.clone(),
            config: config.clone(),
            counters,
        };
        std::thread::Builder::new()
            .name(format!("capture-{}", descriptor.index))
            .spawn(move || {
                let outcome = capture.run();
                health_tx.send_replace(outcome);
            })?;

        info!(
            camera = descriptor.index,
            name = %descriptor.display_name,
            "Capture started"
        );

        Ok(Self {
            descriptor,
            slot,
            cancel,
            health,
        })
    }

    /// Most recent frame, if any has been captured yet
    pub fn latest(&self) -> Option<Frame> {
        self.slot.latest()
    }

    /// Shared handle to the frame mailbox for consumers running elsewhere
    pub fn slot(&self) -> Arc<LatestSlot<Frame>> {
        self.slot.clone()
    }

    pub fn descriptor(&self) -> &CameraDescriptor {
        &self.descriptor
    }

    pub fn health(&self) -> CaptureHealth {
        self.health.borrow().clone()
    }

    /// Watch channel that changes once when the capture loop exits
    pub fn health_watch(&self) -> watch::Receiver<CaptureHealth> {
        self.health.clone()
    }

    /// Stop the capture loop and wait for it to release the device.
    ///
    /// Returns false if the loop did not exit before `deadline`; the thread is
    /// then abandoned and releases the device whenever its current read returns.
    pub async fn close(self, deadline: tokio::time::Instant) -> bool {
        self.cancel.cancel();
        let mut health = self.health.clone();
        let exited = tokio::time::timeout_at(deadline, health.wait_for(|h| !h.is_running())).await;
        match exited {
            // A dropped sender means the thread is gone, and the device with it
            Ok(_) => {
                info!(camera = self.descriptor.index, "Capture closed, camera released");
                true
            }
            Err(_) => {
                warn!(
                    camera = self.descriptor.index,
                    "Capture thread did not exit before the shutdown deadline, abandoning it"
                );
                false
            }
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct CaptureLoop {
    index: u32,
    device: Box<dyn CameraDevice>,
    slot: Arc<LatestSlot<Frame>>,
    cancel: CancellationToken,
    config: CaptureConfig,
    counters: Arc<EngineCounters>,
}

impl CaptureLoop {
    fn run(mut self) -> CaptureHealth {
        let started = Instant::now();
        let mut seq = 0u64;
        let mut consecutive_failures = 0u32;

        let outcome = loop {
            if self.cancel.is_cancelled() {
                break CaptureHealth::Stopped;
            }

            let failure = match self.device.read_frame(self.config.read_timeout) {
                Ok(Some(raw)) if !raw.is_empty() => {
                    consecutive_failures = 0;
                    seq += 1;
                    let timestamp_us = started.elapsed().as_micros() as u64;
                    self.counters.frames_captured.fetch_add(1, Ordering::Relaxed);
                    self.counters.last_frame_seq.store(seq, Ordering::Relaxed);
                    self.slot.put(Frame::from_raw(raw, seq, timestamp_us));
                    if seq % 300 == 0 {
                        debug!(camera = self.index, seq, "Capture progress");
                    }
                    continue;
                }
                Ok(Some(_)) => "empty frame".to_string(),
                Ok(None) => format!("no frame within {:?}", self.config.read_timeout),
                Err(e) => format!("{e:#}"),
            };

            consecutive_failures += 1;
            self.counters.read_errors.fetch_add(1, Ordering::Relaxed);
            debug!(
                camera = self.index,
                consecutive_failures,
                "Read failed: {}",
                failure
            );

            if consecutive_failures >= self.config.max_consecutive_failures {
                error!(
                    camera = self.index,
                    "Capture failed after {} consecutive read errors: {}", consecutive_failures, failure
                );
                break CaptureHealth::Failed(format!(
                    "{consecutive_failures} consecutive read failures, last: {failure}"
                ));
            }

            if self.cancel.is_cancelled() {
                break CaptureHealth::Stopped;
            }
            std::thread::sleep(self.config.failure_backoff);
        };

        info!(camera = self.index, frames = seq, "Capture loop finished");
        // Dropping self releases the device before the outcome is published
        drop(self);
        outcome
    }
}
