//! Frame publisher: annotate, encode, fan out
//!
//! Each subscriber owns a single-slot outbox. Publishing overwrites every
//! outbox and returns immediately, so a slow viewer only ever misses frames;
//! it cannot grow memory or hold up the publisher or other viewers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use image::codecs::jpeg::JpegEncoder;
use image::error::{ImageError, ParameterError, ParameterErrorKind};
use tracing::debug;

use super::overlay;
use crate::config::PublisherConfig;
use crate::error::Result;
use crate::frame::Frame;
use crate::mailbox::LatestSlot;
use crate::recognition::FaceReport;
use crate::session::EngineCounters;

/// A published frame, JPEG encoded
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub seq: u64,
    pub timestamp_us: u64,
    pub width: u32,
    pub height: u32,
    /// Number of faces drawn onto this frame
    pub faces: usize,
    pub jpeg: Bytes,
}

type Outbox = Arc<LatestSlot<EncodedFrame>>;

struct PublisherInner {
    subscribers: Mutex<HashMap<u64, Outbox>>,
    next_id: AtomicU64,
    jpeg_quality: u8,
    draw_overlays: bool,
    counters: Arc<EngineCounters>,
}

impl PublisherInner {
    fn subscribers(&self) -> MutexGuard<'_, HashMap<u64, Outbox>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove(&self, id: u64) -> bool {
        match self.subscribers().remove(&id) {
            Some(outbox) => {
                outbox.close();
                debug!(subscriber = id, "Viewer unsubscribed");
                true
            }
            None => false,
        }
    }
}

/// Fan-out of annotated frames to live viewers
#[derive(Clone)]
pub struct FramePublisher {
    inner: Arc<PublisherInner>,
}

impl FramePublisher {
    pub fn new(config: &PublisherConfig, counters: Arc<EngineCounters>) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                jpeg_quality: config.jpeg_quality.clamp(1, 100),
                draw_overlays: config.draw_overlays,
                counters,
            }),
        }
    }

    /// Register a viewer. Dropping the subscription unsubscribes it.
    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let outbox = Arc::new(LatestSlot::new());
        self.inner.subscribers().insert(id, outbox.clone());
        debug!(subscriber = id, "Viewer subscribed");
        Subscription {
            id,
            outbox,
            publisher: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a viewer by id; its stream ends once drained
    pub fn unsubscribe(&self, id: u64) -> bool {
        self.inner.remove(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers().len()
    }

    /// Draw `faces` onto a copy of `frame`, encode it and deliver it to every viewer.
    ///
    /// Returns the number of viewers the frame was delivered to. With no
    /// viewers nothing is drawn or encoded.
    pub fn publish(&self, frame: &Frame, faces: &[FaceReport]) -> Result<usize> {
        let outboxes: Vec<Outbox> = self.inner.subscribers().values().cloned().collect();
        if outboxes.is_empty() {
            return Ok(0);
        }

        let faces: &[FaceReport] = if self.inner.draw_overlays { faces } else { &[] };
        let image = if faces.is_empty() {
            frame.to_rgb_image()
        } else {
            overlay::annotate(frame, faces)
        }
        .ok_or_else(|| {
            ImageError::Parameter(ParameterError::from_kind(ParameterErrorKind::DimensionMismatch))
        })?;

        let mut jpeg = Vec::with_capacity(image.as_raw().len() / 8);
        JpegEncoder::new_with_quality(&mut jpeg, self.inner.jpeg_quality).encode_image(&image)?;

        let encoded = EncodedFrame {
            seq: frame.seq,
            timestamp_us: frame.timestamp_us,
            width: frame.width,
            height: frame.height,
            faces: faces.len(),
            jpeg: Bytes::from(jpeg),
        };

        let mut dropped = 0u64;
        for outbox in &outboxes {
            if outbox.put(encoded.clone()) {
                dropped += 1;
            }
        }

        self.inner.counters.frames_published.fetch_add(1, Ordering::Relaxed);
        if dropped > 0 {
            self.inner.counters.frames_dropped.fetch_add(dropped, Ordering::Relaxed);
        }
        Ok(outboxes.len())
    }
}

/// A viewer's handle on the publisher
pub struct Subscription {
    id: u64,
    outbox: Outbox,
    publisher: Weak<PublisherInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next frame; None once unsubscribed
    pub async fn recv(&self) -> Option<EncodedFrame> {
        self.outbox.recv().await
    }

    /// Frame waiting in the outbox, if any
    pub fn try_recv(&self) -> Option<EncodedFrame> {
        self.outbox.take()
    }

    /// Turn the subscription into a stream of frames for a transport layer
    pub fn into_stream(self) -> impl Stream<Item = EncodedFrame> + Send {
        stream::unfold(self, |sub| async move {
            let frame = sub.recv().await?;
            Some((frame, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.publisher.upgrade() {
            inner.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::BoundingBox;
    use crate::recognition::{FaceStatus, MatchResult};
    use futures_util::StreamExt;
    use std::time::Duration;

    fn frame(seq: u64) -> Frame {
        Frame {
            seq,
            timestamp_us: seq * 1000,
            width: 64,
            height: 48,
            pixels: Bytes::from(vec![128u8; 64 * 48 * 3]),
        }
    }

    fn publisher() -> (FramePublisher, Arc<EngineCounters>) {
        let counters = Arc::new(EngineCounters::default());
        (FramePublisher::new(&PublisherConfig::default(), counters.clone()), counters)
    }

    fn unknown_face() -> FaceReport {
        FaceReport {
            bbox: BoundingBox::new(8.0, 8.0, 16.0, 16.0),
            result: MatchResult {
                identity_id: None,
                distance: 0.9,
                confidence: 0.1,
            },
            display_name: None,
            status: FaceStatus::Unknown,
        }
    }

    #[test]
    fn no_subscribers_skips_encoding() {
        let (publisher, counters) = publisher();
        assert_eq!(publisher.publish(&frame(1), &[]).unwrap(), 0);
        assert_eq!(counters.snapshot().frames_published, 0);
    }

    #[tokio::test]
    async fn subscriber_receives_jpeg() {
        let (publisher, counters) = publisher();
        let sub = publisher.subscribe();
        assert_eq!(publisher.publish(&frame(1), &[unknown_face()]).unwrap(), 1);

        let got = sub.recv().await.unwrap();
        assert_eq!(got.seq, 1);
        assert_eq!(got.faces, 1);
        assert_eq!((got.width, got.height), (64, 48));
        assert_eq!(&got.jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(counters.snapshot().frames_published, 1);
    }

    #[tokio::test]
    async fn slow_viewer_gets_latest_only() {
        let (publisher, counters) = publisher();
        let slow = publisher.subscribe();
        let fast = publisher.subscribe();

        for seq in 1..=5 {
            publisher.publish(&frame(seq), &[]).unwrap();
            assert_eq!(fast.try_recv().map(|f| f.seq), Some(seq));
        }

        assert_eq!(slow.recv().await.map(|f| f.seq), Some(5));
        assert!(slow.try_recv().is_none());
        assert_eq!(counters.snapshot().frames_dropped, 4);
    }

    #[tokio::test]
    async fn unsubscribe_ends_stream() {
        let (publisher, _) = publisher();
        let sub = publisher.subscribe();
        let id = sub.id();
        publisher.publish(&frame(1), &[]).unwrap();

        let mut stream = Box::pin(sub.into_stream());
        assert_eq!(stream.next().await.map(|f| f.seq), Some(1));

        assert!(publisher.unsubscribe(id));
        assert!(!publisher.unsubscribe(id));
        let end = tokio::time::timeout(Duration::from_secs(1), stream.next()).await.unwrap();
        assert!(end.is_none());
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let (publisher, _) = publisher();
        let sub = publisher.subscribe();
        assert_eq!(publisher.subscriber_count(), 1);
        drop(sub);
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[test]
    fn overlays_can_be_disabled() {
        let config = PublisherConfig {
            draw_overlays: false,
            ..Default::default()
        };
        let publisher = FramePublisher::new(&config, Arc::new(EngineCounters::default()));
        let sub = publisher.subscribe();
        publisher.publish(&frame(1), &[unknown_face()]).unwrap();
        assert_eq!(sub.try_recv().unwrap().faces, 0);
    }

    #[test]
    fn bad_frame_is_an_error() {
        let (publisher, _) = publisher();
        let _sub = publisher.subscribe();
        let mut broken = frame(1);
        broken.pixels = Bytes::from_static(b"nope");
        assert!(publisher.publish(&broken, &[]).is_err());
    }
}
