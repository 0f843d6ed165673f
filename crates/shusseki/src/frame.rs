//! Frame types for captured video and detected regions

use bytes::Bytes;
use image::RgbImage;
use serde::{Deserialize, Serialize};

/// A frame as delivered by a camera device, before the capture loop stamps it.
///
/// Pixels are packed RGB24, row-major, `width * height * 3` bytes.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Bytes,
}

impl RawFrame {
    pub fn new(width: u32, height: u32, pixels: Bytes) -> Self {
        Self {
            width,
            height,
            pixels,
        }
    }

    /// True when the device returned nothing usable (zero size or short buffer).
    pub fn is_empty(&self) -> bool {
        self.width == 0
            || self.height == 0
            || self.pixels.len() < rgb_len(self.width, self.height)
    }
}

/// A captured frame.
///
/// Immutable once published: `pixels` is a shared `Bytes` buffer, so clones
/// handed out by the capture mailbox are cheap and never alias a writer.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Strictly increasing per capture session, starting at 1
    pub seq: u64,
    /// Microseconds since the capture session started
    pub timestamp_us: u64,
    pub width: u32,
    pub height: u32,
    /// Packed RGB24 pixels
    pub pixels: Bytes,
}

impl Frame {
    /// Stamp a raw device frame with its sequence number and capture time
    pub fn from_raw(raw: RawFrame, seq: u64, timestamp_us: u64) -> Self {
        Self {
            seq,
            timestamp_us,
            width: raw.width,
            height: raw.height,
            pixels: raw.pixels,
        }
    }

    /// Copy the pixels into an owned image buffer.
    ///
    /// Returns None if the pixel buffer does not match the frame dimensions.
    pub fn to_rgb_image(&self) -> Option<RgbImage> {
        let len = rgb_len(self.width, self.height);
        if self.pixels.len() < len {
            return None;
        }
        RgbImage::from_raw(self.width, self.height, self.pixels[..len].to_vec())
    }
}

/// Axis-aligned face region in pixel coordinates of the frame it was found in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Scale horizontal and vertical coordinates independently, e.g. to map a
    /// box from a downsampled image back onto the full-resolution frame.
    pub fn scaled(&self, factor_x: f32, factor_y: f32) -> Self {
        Self {
            x: self.x * factor_x,
            y: self.y * factor_y,
            width: self.width * factor_x,
            height: self.height * factor_y,
        }
    }

    /// Corner coordinates `(x0, y0, x1, y1)` clamped to an image of the given size.
    ///
    /// Returns None if the box lies entirely outside the image or is degenerate.
    pub fn clamped_corners(&self, img_width: u32, img_height: u32) -> Option<(u32, u32, u32, u32)> {
        if img_width == 0 || img_height == 0 || self.width <= 0.0 || self.height <= 0.0 {
            return None;
        }
        let max_x = (img_width - 1) as f32;
        let max_y = (img_height - 1) as f32;
        let x1 = self.x + self.width;
        let y1 = self.y + self.height;
        if x1 < 0.0 || y1 < 0.0 || self.x > max_x || self.y > max_y {
            return None;
        }
        Some((
            self.x.clamp(0.0, max_x) as u32,
            self.y.clamp(0.0, max_y) as u32,
            x1.clamp(0.0, max_x) as u32,
            y1.clamp(0.0, max_y) as u32,
        ))
    }
}

pub(crate) fn rgb_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 3
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, value: u8) -> Bytes {
        Bytes::from(vec![value; rgb_len(width, height)])
    }

    #[test]
    fn raw_frame_empty_detection() {
        assert!(RawFrame::new(0, 10, Bytes::new()).is_empty());
        assert!(RawFrame::new(4, 4, Bytes::from(vec![0u8; 10])).is_empty());
        assert!(!RawFrame::new(4, 4, solid(4, 4, 1)).is_empty());
    }

    #[test]
    fn frame_from_raw_keeps_pixels() {
        let frame = Frame::from_raw(RawFrame::new(2, 2, solid(2, 2, 7)), 3, 1500);
        assert_eq!(frame.seq, 3);
        assert_eq!(frame.timestamp_us, 1500);
        let img = frame.to_rgb_image().unwrap();
        assert_eq!(img.dimensions(), (2, 2));
        assert_eq!(img.get_pixel(1, 1).0, [7, 7, 7]);
    }

    #[test]
    fn to_rgb_image_rejects_short_buffer() {
        let frame = Frame {
            seq: 1,
            timestamp_us: 0,
            width: 8,
            height: 8,
            pixels: Bytes::from_static(b"short"),
        };
        assert!(frame.to_rgb_image().is_none());
    }

    #[test]
    fn bounding_box_scaling() {
        let bbox = BoundingBox::new(10.0, 20.0, 30.0, 40.0).scaled(4.0, 4.0);
        assert_eq!(bbox, BoundingBox::new(40.0, 80.0, 120.0, 160.0));

        let stretched = BoundingBox::new(10.0, 20.0, 30.0, 40.0).scaled(2.0, 0.5);
        assert_eq!(stretched, BoundingBox::new(20.0, 10.0, 60.0, 20.0));
    }

    #[test]
    fn clamped_corners_inside_and_outside() {
        let inside = BoundingBox::new(2.0, 3.0, 4.0, 5.0);
        assert_eq!(inside.clamped_corners(100, 100), Some((2, 3, 6, 8)));

        let partial = BoundingBox::new(-5.0, 90.0, 20.0, 20.0);
        assert_eq!(partial.clamped_corners(100, 100), Some((0, 90, 15, 99)));

        let outside = BoundingBox::new(150.0, 10.0, 5.0, 5.0);
        assert_eq!(outside.clamped_corners(100, 100), None);

        let degenerate = BoundingBox::new(1.0, 1.0, 0.0, 5.0);
        assert_eq!(degenerate.clamped_corners(100, 100), None);
    }
}
