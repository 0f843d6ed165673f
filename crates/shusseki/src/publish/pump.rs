//! Publish pump: moves frames from capture to the publisher on its own cadence

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::publisher::FramePublisher;
use crate::config::PublisherConfig;
use crate::frame::Frame;
use crate::mailbox::LatestSlot;
use crate::recognition::{DetectionReport, FaceReport};

pub struct PublishPump {
    publisher: FramePublisher,
    frames: Arc<LatestSlot<Frame>>,
    reports: Arc<LatestSlot<DetectionReport>>,
    interval: Duration,
    every_nth: u64,
    report_ttl: Duration,
}

impl PublishPump {
    pub fn new(
        publisher: FramePublisher,
        frames: Arc<LatestSlot<Frame>>,
        reports: Arc<LatestSlot<DetectionReport>>,
        config: &PublisherConfig,
        report_ttl: Duration,
    ) -> Self {
        Self {
            publisher,
            frames,
            reports,
            interval: config.interval,
            every_nth: config.every_nth.max(1),
            report_ttl,
        }
    }

    /// Faces from the latest detection report, unless it has expired
    fn current_faces(&self) -> Vec<FaceReport> {
        self.reports
            .latest()
            .filter(|report| report.produced_at.elapsed() <= self.report_ttl)
            .map(|report| report.faces)
            .unwrap_or_default()
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_seq = 0u64;

        info!("Publish pump started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if self.publisher.subscriber_count() == 0 {
                continue;
            }
            let Some(frame) = self.frames.latest() else {
                continue;
            };
            if frame.seq <= last_seq || frame.seq - last_seq < self.every_nth {
                continue;
            }
            last_seq = frame.seq;

            let faces = self.current_faces();
            let publisher = self.publisher.clone();
            match tokio::task::spawn_blocking(move || publisher.publish(&frame, &faces)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(seq = last_seq, error = %e, "Failed to publish frame"),
                Err(e) => warn!(seq = last_seq, error = %e, "Publish task failed"),
            }
        }

        info!("Publish pump stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::BoundingBox;
    use crate::recognition::{FaceStatus, MatchResult};
    use crate::session::EngineCounters;
    use bytes::Bytes;
    use std::time::Instant;

    fn frame(seq: u64) -> Frame {
        Frame {
            seq,
            timestamp_us: 0,
            width: 32,
            height: 32,
            pixels: Bytes::from(vec![0u8; 32 * 32 * 3]),
        }
    }

    fn report(age: Duration) -> DetectionReport {
        DetectionReport {
            frame_seq: 1,
            faces: vec![FaceReport {
                bbox: BoundingBox::new(2.0, 2.0, 10.0, 10.0),
                result: MatchResult {
                    identity_id: None,
                    distance: 1.0,
                    confidence: 0.0,
                },
                display_name: None,
                status: FaceStatus::Unknown,
            }],
            produced_at: Instant::now() - age,
        }
    }

    fn pump(every_nth: u64) -> (PublishPump, Arc<LatestSlot<Frame>>, Arc<LatestSlot<DetectionReport>>, FramePublisher) {
        let config = PublisherConfig {
            interval: Duration::from_millis(5),
            every_nth,
            ..Default::default()
        };
        let publisher = FramePublisher::new(&config, Arc::new(EngineCounters::default()));
        let frames = Arc::new(LatestSlot::new());
        let reports = Arc::new(LatestSlot::new());
        let pump = PublishPump::new(
            publisher.clone(),
            frames.clone(),
            reports.clone(),
            &config,
            Duration::from_secs(1),
        );
        (pump, frames, reports, publisher)
    }

    #[test]
    fn expired_reports_are_not_drawn() {
        let (pump, _, reports, _) = pump(1);
        assert!(pump.current_faces().is_empty());
        reports.put(report(Duration::from_millis(100)));
        assert_eq!(pump.current_faces().len(), 1);
        reports.put(report(Duration::from_secs(5)));
        assert!(pump.current_faces().is_empty());
    }

    #[tokio::test]
    async fn publishes_new_frames_with_overlay() {
        let (pump, frames, reports, publisher) = pump(1);
        let sub = publisher.subscribe();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(pump.run(cancel.clone()));

        reports.put(report(Duration::ZERO));
        frames.put(frame(1));
        let got = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.seq, 1);
        assert_eq!(got.faces, 1);

        // Unchanged frame is not republished
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(sub.try_recv().is_none());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn every_nth_skips_intermediate_frames() {
        let (pump, frames, _, publisher) = pump(3);
        let sub = publisher.subscribe();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(pump.run(cancel.clone()));

        frames.put(frame(2));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(sub.try_recv().is_none());

        frames.put(frame(3));
        let got = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.seq, 3);

        cancel.cancel();
        handle.await.unwrap();
    }
}
