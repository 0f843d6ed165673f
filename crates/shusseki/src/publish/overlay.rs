//! Overlay drawing: face boxes and identity labels
//!
//! Always draws onto a copy; captured frames are shared and never mutated.

use image::{Rgb, RgbImage};

use super::font;
use crate::frame::{BoundingBox, Frame};
use crate::recognition::{FaceReport, FaceStatus};

const LABEL_TEXT: Rgb<u8> = Rgb([255, 255, 255]);

/// Box and label colour for a face status
pub fn status_color(status: FaceStatus) -> Rgb<u8> {
    match status {
        FaceStatus::Recorded => Rgb([0, 200, 0]),
        FaceStatus::AlreadyRecorded => Rgb([0, 140, 255]),
        FaceStatus::Unknown => Rgb([220, 0, 0]),
        FaceStatus::RecordFailed => Rgb([255, 140, 0]),
    }
}

/// Label text for a face, e.g. `ALICE 72%` or `UNKNOWN`
pub fn label_for(face: &FaceReport) -> String {
    match (&face.display_name, face.status) {
        (Some(name), FaceStatus::RecordFailed) => format!("{name} (not saved)"),
        (Some(name), _) => format!("{name} {:.0}%", face.result.confidence * 100.0),
        (None, _) => "Unknown".to_string(),
    }
}

/// Draw a rectangle outline `thickness` pixels wide, growing inwards
pub fn draw_box(img: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>, thickness: u32) {
    let Some((x0, y0, x1, y1)) = bbox.clamped_corners(img.width(), img.height()) else {
        return;
    };
    for t in 0..thickness {
        let xx0 = x0 + t;
        let yy0 = y0 + t;
        let xx1 = x1.saturating_sub(t);
        let yy1 = y1.saturating_sub(t);
        if xx0 > xx1 || yy0 > yy1 {
            break;
        }
        for x in xx0..=xx1 {
            img.put_pixel(x, yy0, color);
            img.put_pixel(x, yy1, color);
        }
        for y in yy0..=yy1 {
            img.put_pixel(xx0, y, color);
            img.put_pixel(xx1, y, color);
        }
    }
}

fn fill_rect(img: &mut RgbImage, x0: u32, y0: u32, x1: u32, y1: u32, color: Rgb<u8>) {
    let x1 = x1.min(img.width());
    let y1 = y1.min(img.height());
    for y in y0..y1 {
        for x in x0..x1 {
            img.put_pixel(x, y, color);
        }
    }
}

/// Draw a filled label tab above the box, or inside it when the box touches the top edge
pub fn draw_label(img: &mut RgbImage, bbox: &BoundingBox, text: &str, color: Rgb<u8>, scale: u32) {
    let Some((x0, y0, _, _)) = bbox.clamped_corners(img.width(), img.height()) else {
        return;
    };
    let pad = scale;
    let tab_w = font::text_width(text, scale) + 2 * pad;
    let tab_h = font::text_height(scale) + 2 * pad;
    let tab_y = if y0 >= tab_h { y0 - tab_h } else { y0 };

    fill_rect(img, x0, tab_y, x0 + tab_w, tab_y + tab_h, color);
    font::draw_text(
        img,
        (x0 + pad) as i64,
        (tab_y + pad) as i64,
        text,
        scale,
        LABEL_TEXT,
    );
}

/// Copy the frame and draw every face onto the copy.
///
/// Returns None if the frame's pixel buffer is unusable.
pub fn annotate(frame: &Frame, faces: &[FaceReport]) -> Option<RgbImage> {
    let mut img = frame.to_rgb_image()?;
    let thickness = (img.width() / 320).max(2);
    let text_scale = (img.width() / 480).max(1);
    for face in faces {
        let color = status_color(face.status);
        draw_box(&mut img, &face.bbox, color, thickness);
        draw_label(&mut img, &face.bbox, &label_for(face), color, text_scale);
    }
    Some(img)
}
