//! Face embedding: the [`Embedder`] seam and a FaceNet implementation via ONNX Runtime.
//!
//! FaceNet takes a 160×160 RGB crop in NHWC layout with per-image
//! standardization and produces a 512-dimensional embedding, which is
//! L2-normalized so Euclidean distances fall in [0, 2].

use crate::types::{BoundingBox, Embedding};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::borrow::Cow;
use std::path::Path;
use thiserror::Error;

/// Side length of the square face crop FaceNet expects.
pub const FACENET_INPUT_SIZE: u32 = 160;
const FACENET_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("empty face crop")]
    EmptyCrop,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Turns a face crop into an embedding vector.
pub trait Embedder: Send {
    /// Side length of the square crop this embedder expects.
    fn input_size(&self) -> u32 {
        FACENET_INPUT_SIZE
    }

    /// Deterministic for identical input.
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, EmbedderError>;
}

/// Copy the part of `frame` covered by `bbox`, clipped to the frame.
///
/// `None` when the box has no pixels inside the frame.
pub fn crop_face(frame: &RgbImage, bbox: &BoundingBox) -> Option<RgbImage> {
    let (x, y, w, h) = bbox.clamp_to(frame.width(), frame.height())?;
    Some(imageops::crop_imm(frame, x, y, w, h).to_image())
}

/// FaceNet-based embedder.
pub struct FacenetEmbedder {
    session: Session,
}

impl FacenetEmbedder {
    /// Load the FaceNet ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, EmbedderError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded FaceNet model"
        );

        Ok(Self { session })
    }

    /// Standardize a 160×160 crop into a `[1, 160, 160, 3]` tensor.
    ///
    /// Each image is shifted to zero mean and scaled to unit variance; the
    /// standard deviation is floored at `1/sqrt(n)` for flat images.
    fn preprocess(face: &RgbImage) -> Array4<f32> {
        let size = FACENET_INPUT_SIZE as usize;
        let raw = face.as_raw();
        let n = raw.len() as f32;

        let mean = raw.iter().map(|&v| v as f32).sum::<f32>() / n;
        let variance = raw.iter().map(|&v| (v as f32 - mean).powi(2)).sum::<f32>() / n;
        let std = variance.sqrt().max(1.0 / n.sqrt());

        let mut tensor = Array4::<f32>::zeros((1, size, size, 3));
        for (x, y, pixel) in face.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, y as usize, x as usize, c]] = (pixel[c] as f32 - mean) / std;
            }
        }
        tensor
    }
}

impl Embedder for FacenetEmbedder {
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, EmbedderError> {
        if face.width() == 0 || face.height() == 0 {
            return Err(EmbedderError::EmptyCrop);
        }

        let face = if face.dimensions() == (FACENET_INPUT_SIZE, FACENET_INPUT_SIZE) {
            Cow::Borrowed(face)
        } else {
            Cow::Owned(imageops::resize(face, FACENET_INPUT_SIZE, FACENET_INPUT_SIZE, FilterType::Triangle))
        };

        let input = Self::preprocess(&face);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != FACENET_EMBEDDING_DIM {
            return Err(EmbedderError::InferenceFailed(format!(
                "expected {FACENET_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding::new(l2_normalize(raw)))
    }
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_output_shape() {
        let face = RgbImage::from_pixel(FACENET_INPUT_SIZE, FACENET_INPUT_SIZE, image::Rgb([10, 20, 30]));
        let tensor = FacenetEmbedder::preprocess(&face);
        assert_eq!(tensor.shape(), &[1, 160, 160, 3]);
    }

    #[test]
    fn test_preprocess_standardizes() {
        let face = RgbImage::from_fn(FACENET_INPUT_SIZE, FACENET_INPUT_SIZE, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        });
        let tensor = FacenetEmbedder::preprocess(&face);
        let n = tensor.len() as f32;
        let mean = tensor.iter().sum::<f32>() / n;
        let var = tensor.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        assert!(mean.abs() < 1e-3, "mean {mean}");
        assert!((var - 1.0).abs() < 1e-2, "variance {var}");
    }

    #[test]
    fn test_preprocess_flat_image_is_finite() {
        let face = RgbImage::from_pixel(FACENET_INPUT_SIZE, FACENET_INPUT_SIZE, image::Rgb([128, 128, 128]));
        let tensor = FacenetEmbedder::preprocess(&face);
        assert!(tensor.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_crop_face_clips_to_frame() {
        let frame = RgbImage::from_fn(10, 10, |x, y| image::Rgb([x as u8, y as u8, 0]));
        let bbox = BoundingBox { x: 6.0, y: -2.0, width: 8.0, height: 5.0, confidence: 0.9 };
        let crop = crop_face(&frame, &bbox).unwrap();
        assert_eq!(crop.dimensions(), (4, 3));
        assert_eq!(*crop.get_pixel(0, 0), image::Rgb([6, 0, 0]));

        let outside = BoundingBox { x: 20.0, ..bbox };
        assert!(crop_face(&frame, &outside).is_none());
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6 && (v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }
}
