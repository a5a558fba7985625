//! Presentation copy of a frame with face boxes drawn in.
//!
//! Only rectangles are rasterized; labels and distances travel as
//! [`Annotation`] data for the presentation layer to render.

use crate::types::BoundingBox;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

const BORDER: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationKind {
    Matched,
    Unknown,
    /// The face could not be embedded or matched.
    Failed,
}

impl AnnotationKind {
    pub fn color(self) -> Rgb<u8> {
        match self {
            AnnotationKind::Matched => Rgb([0, 255, 0]),
            AnnotationKind::Unknown => Rgb([255, 255, 0]),
            AnnotationKind::Failed => Rgb([255, 0, 0]),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub bbox: BoundingBox,
    pub kind: AnnotationKind,
    pub label: String,
    pub distance: Option<f32>,
}

impl Annotation {
    /// Caption as shown next to the box, e.g. `Alice (001) d:0.14`.
    pub fn caption(&self) -> String {
        match self.distance {
            Some(d) if d.is_finite() => format!("{} d:{d:.2}", self.label),
            _ => self.label.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PresentationFrame {
    pub image: RgbImage,
    pub annotations: Vec<Annotation>,
}

/// Accumulates annotations on a private copy of a frame.
pub(crate) struct Overlay {
    image: RgbImage,
    annotations: Vec<Annotation>,
}

impl Overlay {
    pub(crate) fn new(frame: &RgbImage) -> Self {
        Self {
            image: frame.clone(),
            annotations: Vec::new(),
        }
    }

    pub(crate) fn annotate(&mut self, bbox: BoundingBox, kind: AnnotationKind, label: String, distance: Option<f32>) {
        draw_box(&mut self.image, &bbox, kind.color());
        self.annotations.push(Annotation {
            bbox,
            kind,
            label,
            distance,
        });
    }

    pub(crate) fn finish(self) -> PresentationFrame {
        PresentationFrame {
            image: self.image,
            annotations: self.annotations,
        }
    }
}

/// Draw a hollow rectangle `BORDER` pixels thick, clipped to the image.
fn draw_box(image: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>) {
    let Some((x, y, w, h)) = bbox.clamp_to(image.width(), image.height()) else {
        return;
    };
    for inset in 0..BORDER {
        if w <= 2 * inset || h <= 2 * inset {
            break;
        }
        let rect = Rect::at((x + inset) as i32, (y + inset) as i32).of_size(w - 2 * inset, h - 2 * inset);
        draw_hollow_rect_mut(image, rect, color);
    }
}
