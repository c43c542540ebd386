//! Recognition overlay drawn onto a still frame.

use crate::types::BoundingBox;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

const FACE_BOX: Rgb<u8> = Rgb([0, 255, 0]);
const RECOGNIZED_BANNER: Rgb<u8> = Rgb([0, 100, 0]);
const UNKNOWN_BANNER: Rgb<u8> = Rgb([230, 150, 0]);
const BAR: Rgb<u8> = Rgb([255, 255, 255]);

const BANNER_ORIGIN: (i32, i32) = (10, 10);
const BANNER_SIZE: (u32, u32) = (290, 90);
const BAR_INSET: u32 = 12;
const BAR_HEIGHT: u32 = 14;

/// What the overlay should report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    /// No face, or nothing to report yet.
    Scanning,
    Recognized { similarity: f32 },
    Unknown { similarity: f32 },
}

/// Draw face boxes and the status banner in place.
///
/// The banner's bar length is proportional to the similarity (0..=1).
pub fn annotate(frame: &mut RgbImage, faces: &[BoundingBox], outcome: Outcome) {
    for face in faces {
        draw_face_box(frame, face);
    }

    let (color, similarity) = match outcome {
        Outcome::Scanning => return,
        Outcome::Recognized { similarity } => (RECOGNIZED_BANNER, similarity),
        Outcome::Unknown { similarity } => (UNKNOWN_BANNER, similarity),
    };

    let (bx, by) = BANNER_ORIGIN;
    let (bw, bh) = BANNER_SIZE;
    draw_filled_rect_mut(frame, Rect::at(bx, by).of_size(bw, bh), color);

    let track = bw - 2 * BAR_INSET;
    let filled = (track as f32 * similarity.clamp(0.0, 1.0)).round() as u32;
    if filled > 0 {
        let bar_y = by + (bh - BAR_INSET - BAR_HEIGHT) as i32;
        draw_filled_rect_mut(
            frame,
            Rect::at(bx + BAR_INSET as i32, bar_y).of_size(filled, BAR_HEIGHT),
            BAR,
        );
    }
}

/// Two-pixel outline around a detection.
fn draw_face_box(frame: &mut RgbImage, face: &BoundingBox) {
    let w = face.width.round() as i64;
    let h = face.height.round() as i64;
    if w < 3 || h < 3 {
        return;
    }
    let (x, y) = (face.x.round() as i32, face.y.round() as i32);
    draw_hollow_rect_mut(frame, Rect::at(x, y).of_size(w as u32, h as u32), FACE_BOX);
    draw_hollow_rect_mut(
        frame,
        Rect::at(x + 1, y + 1).of_size(w as u32 - 2, h as u32 - 2),
        FACE_BOX,
    );
}
