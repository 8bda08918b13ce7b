//! Annotated copies of processed images. Never alters pipeline state.

use std::path::Path;

use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

use crate::error::{Error, Result};
use crate::types::BoundingBox;

const GREEN: Rgb<u8> = Rgb([0, 200, 0]);
const RED: Rgb<u8> = Rgb([220, 0, 0]);
const ORANGE: Rgb<u8> = Rgb([255, 165, 0]);
const BLUE: Rgb<u8> = Rgb([40, 120, 255]);
const GREY: Rgb<u8> = Rgb([90, 90, 90]);

const BOX_THICKNESS: u32 = 2;
const BAR_HEIGHT: u32 = 6;

/// What to draw on the copy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Annotation<'a> {
    /// Enrollment photo with exactly one face.
    Valid(BoundingBox),
    /// Enrollment photo with no face: red banner.
    NoFace,
    /// Enrollment photo with several faces: every box plus an orange banner.
    MultiFace(&'a [BoundingBox]),
    /// Region used as a training sample.
    TrainingRoi(BoundingBox),
    /// Recognition outcome with a confidence bar under the box.
    Recognition {
        face: BoundingBox,
        accepted: bool,
        confidence: f64,
    },
}

pub fn annotate(image: &DynamicImage, annotation: Annotation<'_>) -> RgbImage {
    let mut canvas = image.to_rgb8();
    match annotation {
        Annotation::Valid(face) => draw_box(&mut canvas, &face, GREEN),
        Annotation::NoFace => draw_banner(&mut canvas, RED),
        Annotation::MultiFace(faces) => {
            for face in faces {
                draw_box(&mut canvas, face, ORANGE);
            }
            draw_banner(&mut canvas, ORANGE);
        }
        Annotation::TrainingRoi(face) => draw_box(&mut canvas, &face, BLUE),
        Annotation::Recognition {
            face,
            accepted,
            confidence,
        } => {
            let color = if accepted { GREEN } else { RED };
            draw_box(&mut canvas, &face, color);
            draw_confidence_bar(&mut canvas, &face, confidence, color);
        }
    }
    canvas
}

/// Annotate and write to `dest`; the format follows the extension.
pub fn emit(image: &DynamicImage, annotation: Annotation<'_>, dest: &Path) -> Result<()> {
    annotate(image, annotation)
        .save(dest)
        .map_err(|source| Error::ImageWrite {
            path: dest.to_path_buf(),
            source,
        })?;
    tracing::debug!(path = %dest.display(), "debug image written");
    Ok(())
}

fn draw_box(canvas: &mut RgbImage, face: &BoundingBox, color: Rgb<u8>) {
    let Some(face) = face.clamp_to(canvas.width(), canvas.height()) else {
        return;
    };
    for inset in 0..BOX_THICKNESS {
        let (w, h) = (face.width.saturating_sub(2 * inset), face.height.saturating_sub(2 * inset));
        if w == 0 || h == 0 {
            break;
        }
        let rect = Rect::at((face.x + inset) as i32, (face.y + inset) as i32).of_size(w, h);
        draw_hollow_rect_mut(canvas, rect, color);
    }
}

fn draw_banner(canvas: &mut RgbImage, color: Rgb<u8>) {
    let height = (canvas.height() / 12).max(8).min(canvas.height());
    if canvas.width() == 0 || height == 0 {
        return;
    }
    draw_filled_rect_mut(canvas, Rect::at(0, 0).of_size(canvas.width(), height), color);
}

fn draw_confidence_bar(canvas: &mut RgbImage, face: &BoundingBox, confidence: f64, color: Rgb<u8>) {
    let top = face.y.saturating_add(face.height).saturating_add(BOX_THICKNESS);
    if top + BAR_HEIGHT > canvas.height() || face.x >= canvas.width() || face.width == 0 {
        return;
    }
    let width = face.width.min(canvas.width() - face.x);
    let filled = ((confidence.clamp(0.0, 100.0) / 100.0) * width as f64).round() as u32;
    let origin = Rect::at(face.x as i32, top as i32);
    draw_filled_rect_mut(canvas, origin.of_size(width, BAR_HEIGHT), GREY);
    if filled > 0 {
        draw_filled_rect_mut(canvas, origin.of_size(filled, BAR_HEIGHT), color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank() -> DynamicImage {
        DynamicImage::new_rgb8(120, 120)
    }

    #[test]
    fn test_valid_draws_green_box() {
        let out = annotate(&blank(), Annotation::Valid(BoundingBox::new(10, 10, 40, 40)));
        assert_eq!(*out.get_pixel(10, 10), GREEN);
        assert_eq!(*out.get_pixel(30, 30), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_no_face_draws_red_banner() {
        let out = annotate(&blank(), Annotation::NoFace);
        assert_eq!(*out.get_pixel(60, 2), RED);
        assert_eq!(*out.get_pixel(60, 100), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_multi_face_boxes_and_banner() {
        let faces = [BoundingBox::new(5, 40, 30, 30), BoundingBox::new(60, 40, 30, 30)];
        let out = annotate(&blank(), Annotation::MultiFace(&faces));
        assert_eq!(*out.get_pixel(5, 50), ORANGE);
        assert_eq!(*out.get_pixel(60, 50), ORANGE);
        assert_eq!(*out.get_pixel(0, 0), ORANGE);
    }

    #[test]
    fn test_confidence_bar_length() {
        let face = BoundingBox::new(10, 10, 50, 50);
        let out = annotate(
            &blank(),
            Annotation::Recognition {
                face,
                accepted: true,
                confidence: 50.0,
            },
        );
        let bar_y = 10 + 50 + BOX_THICKNESS + 1;
        assert_eq!(*out.get_pixel(20, bar_y), GREEN);
        assert_eq!(*out.get_pixel(50, bar_y), GREY);
    }

    #[test]
    fn test_box_outside_image_is_ignored() {
        let out = annotate(&blank(), Annotation::Valid(BoundingBox::new(500, 500, 10, 10)));
        assert!(out.pixels().all(|p| *p == Rgb([0, 0, 0])));
    }

    #[test]
    fn test_emit_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("debug_face_1.png");
        emit(&blank(), Annotation::NoFace, &dest).unwrap();
        assert!(dest.is_file());
    }
}
