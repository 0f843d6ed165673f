//! Face embedder seam

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::frame::BoundingBox;

/// One face found by an embedder, in the coordinates of the image it was given
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceEmbedding {
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
}

/// A face found in a sampled frame, mapped back to full-frame coordinates
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
    pub source_frame_seq: u64,
}

/// Locates faces in an image and computes an embedding for each.
///
/// Implementations may fail transiently; the detection worker logs the error
/// and skips the cycle.
#[async_trait::async_trait]
pub trait FaceEmbedder: Send + Sync {
    async fn detect(&self, image: &RgbImage) -> anyhow::Result<Vec<FaceEmbedding>>;
}
