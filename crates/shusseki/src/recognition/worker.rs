//! Detection worker
//!
//! Samples the latest captured frame on a fixed cadence while detection is
//! enabled, downsamples it off the async runtime, asks the embedder for faces,
//! matches each face against one roster snapshot and hands matches to the
//! attendance recorder. The outcome of every cycle is published as a
//! `DetectionReport` for the overlay drawer.
//!
//! The worker only ever reads from the frame mailbox, so a slow embedder
//! never holds up capture. Embedder failures skip the cycle and are counted.
//! Cancellation abandons a pending embedder call but never an attendance
//! write: the face being recorded finishes, the remaining faces are skipped.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use chrono::Local;
use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::embedder::{Detection, FaceEmbedder};
use super::embedder::FaceEmbedding;
use super::matcher::{IdentityMatcher, MatchResult};
use crate::attendance::{AttendanceRecorder, RecordOutcome};
use crate::config::{DetectionCadence, DetectionConfig};
use crate::error::{Error, Result};
use crate::frame::{BoundingBox, Frame};
use crate::mailbox::LatestSlot;
use crate::session::EngineCounters;

/// What happened to a face in one detection cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FaceStatus {
    /// Matched and a new attendance record was written
    Recorded,
    /// Matched, but deduplicated (cooldown or already recorded today)
    AlreadyRecorded,
    /// No roster entry close enough
    Unknown,
    /// Matched, but the store failed
    RecordFailed,
}

/// One face in a detection report, in full-frame coordinates
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceReport {
    pub bbox: BoundingBox,
    pub result: MatchResult,
    pub display_name: Option<String>,
    pub status: FaceStatus,
}

/// Result of one detection cycle
#[derive(Debug, Clone)]
pub struct DetectionReport {
    pub frame_seq: u64,
    pub faces: Vec<FaceReport>,
    pub produced_at: Instant,
}

pub struct DetectionWorker {
    frames: Arc<LatestSlot<Frame>>,
    embedder: Arc<dyn FaceEmbedder>,
    matcher: Arc<IdentityMatcher>,
    recorder: Arc<AttendanceRecorder>,
    reports: Arc<LatestSlot<DetectionReport>>,
    config: DetectionConfig,
    counters: Arc<EngineCounters>,
}

impl DetectionWorker {
    pub fn new(
        frames: Arc<LatestSlot<Frame>>,
        embedder: Arc<dyn FaceEmbedder>,
        matcher: Arc<IdentityMatcher>,
        recorder: Arc<AttendanceRecorder>,
        reports: Arc<LatestSlot<DetectionReport>>,
        config: DetectionConfig,
        counters: Arc<EngineCounters>,
    ) -> Self {
        Self {
            frames,
            embedder,
            matcher,
            recorder,
            reports,
            config,
            counters,
        }
    }

    /// Run until cancelled. Cycles only happen while `enabled` is true.
    pub async fn run(self, mut enabled: watch::Receiver<bool>, cancel: CancellationToken) {
        let (tick, stride) = match self.config.cadence {
            DetectionCadence::Interval(period) => (period, 1),
            DetectionCadence::EveryNthFrame(n) => (self.config.poll_interval, n.max(1)),
        };
        let mut ticker = interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_seq = 0u64;

        info!("Detection worker started");

        loop {
            if !*enabled.borrow_and_update() {
                debug!("Detection paused");
                let resumed = tokio::select! {
                    _ = cancel.cancelled() => false,
                    ok = async { enabled.wait_for(|on| *on).await.is_ok() } => ok,
                };
                if !resumed {
                    break;
                }
                debug!("Detection resumed");
                ticker.reset();
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                changed = enabled.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            let Some(frame) = self.frames.latest() else {
                continue;
            };
            // Stale or not enough new frames since the last cycle
            if frame.seq <= last_seq || frame.seq - last_seq < stride {
                continue;
            }
            last_seq = frame.seq;

            if let Some(report) = self.run_cycle(frame, &cancel).await {
                self.reports.put(report);
            }
            if cancel.is_cancelled() {
                break;
            }
        }

        info!("Detection worker stopped");
    }

    /// Detect, match and record the faces in one frame.
    ///
    /// Returns None when the cycle was skipped (unusable frame, embedder
    /// failure, or cancelled while waiting on the embedder). A frame without
    /// faces yields an empty report; a cycle cancelled between faces reports
    /// only the faces handled so far.
    pub async fn run_cycle(&self, frame: Frame, cancel: &CancellationToken) -> Option<DetectionReport> {
        self.counters.detection_cycles.fetch_add(1, Ordering::Relaxed);
        let seq = frame.seq;
        let (full_width, full_height) = (frame.width, frame.height);
        let scale = self.config.scale;

        let small = match tokio::task::spawn_blocking(move || downsample(&frame, scale)).await {
            Ok(Some(image)) => image,
            Ok(None) => {
                debug!(seq, "Frame buffer does not match its dimensions, skipping");
                return None;
            }
            Err(e) => {
                warn!(seq, error = %e, "Downsample task failed");
                return None;
            }
        };
        let factor_x = full_width as f32 / small.width().max(1) as f32;
        let factor_y = full_height as f32 / small.height().max(1) as f32;

        let detected = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            detected = self.detect(&small) => detected,
        };
        let faces = match detected {
            Ok(faces) => faces,
            Err(e) => {
                self.counters.embedder_errors.fetch_add(1, Ordering::Relaxed);
                warn!(seq, error = %e, "Skipping detection cycle");
                return None;
            }
        };

        let mut reports = Vec::with_capacity(faces.len());
        if !faces.is_empty() {
            self.counters
                .faces_detected
                .fetch_add(faces.len() as u64, Ordering::Relaxed);

            // One snapshot for the whole cycle
            let roster = self.matcher.snapshot();
            let now = Local::now();

            for face in faces {
                if cancel.is_cancelled() {
                    debug!(seq, handled = reports.len(), "Cycle cancelled between faces");
                    break;
                }
                let detection = Detection {
                    bbox: face.bbox.scaled(factor_x, factor_y),
                    embedding: face.embedding,
                    source_frame_seq: seq,
                };
                let result = self.matcher.match_detection(&detection, &roster);

                let (display_name, status) = match result.identity_id.as_deref() {
                    Some(id) => {
                        self.counters.faces_matched.fetch_add(1, Ordering::Relaxed);
                        let name = roster.display_name(id).unwrap_or(id).to_string();
                        let status = match self.recorder.record(id, &name, result.confidence, now).await {
                            Ok(RecordOutcome::Recorded) => FaceStatus::Recorded,
                            Ok(RecordOutcome::CoolingDown | RecordOutcome::AlreadyRecordedToday) => {
                                FaceStatus::AlreadyRecorded
                            }
                            Err(_) => FaceStatus::RecordFailed,
                        };
                        (Some(name), status)
                    }
                    None => {
                        self.counters.faces_unknown.fetch_add(1, Ordering::Relaxed);
                        (None, FaceStatus::Unknown)
                    }
                };

                reports.push(FaceReport {
                    bbox: detection.bbox,
                    result,
                    display_name,
                    status,
                });
            }
            debug!(seq, faces = reports.len(), "Detection cycle complete");
        }

        Some(DetectionReport {
            frame_seq: seq,
            faces: reports,
            produced_at: Instant::now(),
        })
    }

    async fn detect(&self, image: &RgbImage) -> Result<Vec<FaceEmbedding>> {
        self.embedder.detect(image).await.map_err(Error::Embedder)
    }
}

/// Copy the frame into an image and shrink it by `scale`
fn downsample(frame: &Frame, scale: f32) -> Option<RgbImage> {
    let image = frame.to_rgb_image()?;
    if scale >= 1.0 {
        return Some(image);
    }
    let width = ((image.width() as f32 * scale).round() as u32).max(1);
    let height = ((image.height() as f32 * scale).round() as u32).max(1);
    Some(imageops::resize(&image, width, height, FilterType::Triangle))
}
