//! HTTP client for a remote face-embedding service
//!
//! ## Protocol
//!
//! - `POST {base_url}/v1/faces`, multipart form with one JPEG part named `image`
//! - Response: `{"faces":[{"x":..,"y":..,"width":..,"height":..,"embedding":[..]}]}`
//! - `GET {base_url}/healthz` for a liveness probe

use std::time::Duration;

use anyhow::{bail, Context};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

use super::embedder::{FaceEmbedder, FaceEmbedding};
use crate::frame::BoundingBox;

#[derive(Debug, Deserialize)]
struct FacesResponse {
    faces: Vec<FaceEntry>,
}

#[derive(Debug, Deserialize)]
struct FaceEntry {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
    embedding: Vec<f32>,
}

impl From<FaceEntry> for FaceEmbedding {
    fn from(face: FaceEntry) -> Self {
        FaceEmbedding {
            bbox: BoundingBox::new(face.x, face.y, face.width, face.height),
            embedding: face.embedding,
        }
    }
}

/// Face embedder backed by an HTTP service
pub struct HttpFaceEmbedder {
    client: reqwest::Client,
    base_url: String,
    jpeg_quality: u8,
}

impl HttpFaceEmbedder {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(5))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            jpeg_quality: 90,
        })
    }

    /// Check whether the service answers its health endpoint
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/healthz", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    fn encode(&self, image: &RgbImage) -> anyhow::Result<Vec<u8>> {
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, self.jpeg_quality)
            .encode_image(image)
            .context("Failed to encode frame as JPEG")?;
        Ok(jpeg)
    }
}

#[async_trait::async_trait]
impl FaceEmbedder for HttpFaceEmbedder {
    async fn detect(&self, image: &RgbImage) -> anyhow::Result<Vec<FaceEmbedding>> {
        let url = format!("{}/v1/faces", self.base_url);
        let jpeg = self.encode(image)?;

        let form = Form::new().part(
            "image",
            Part::bytes(jpeg)
                .file_name("frame.jpg")
                .mime_str("image/jpeg")?,
        );

        let resp = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("Face service request to {url} failed"))?;

        if !resp.status().is_success() {
            bail!("Face service returned {}", resp.status());
        }

        let body: FacesResponse = resp.json().await.context("Invalid face service response")?;
        Ok(body.faces.into_iter().map(FaceEmbedding::from).collect())
    }
}
