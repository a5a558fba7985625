//! facewatch-core — live face recognition engine.
//!
//! Holds the identity gallery, the Euclidean matcher, and the recognition
//! worker that drives a camera through detect → embed → match and reports
//! what it saw on an event channel. Detection (SCRFD) and embedding
//! (FaceNet) run via ONNX Runtime on the CPU.

pub mod detector;
pub mod embedder;
pub mod events;
pub mod gallery;
pub mod matcher;
pub mod overlay;
pub mod source;
pub mod types;
pub mod worker;

use std::path::PathBuf;

pub use detector::{FaceLocalizer, ScrfdLocalizer};
pub use embedder::{Embedder, FacenetEmbedder};
pub use events::WorkerEvent;
pub use gallery::{Gallery, GalleryError, GalleryStore, LoadSummary};
pub use matcher::{EuclideanMatcher, Matcher, DEFAULT_THRESHOLD};
pub use overlay::{Annotation, AnnotationKind, PresentationFrame};
pub use source::{CameraProvider, FrameError, FrameSource, SourceError};
pub use types::{BoundingBox, Embedding, Identity, MatchResult};
pub use worker::{Pipeline, RecognitionWorker, WorkerConfig, WorkerError, WorkerState};

/// File name of the SCRFD detection model inside the model directory.
pub const DETECTOR_MODEL: &str = "det_10g.onnx";
/// File name of the FaceNet embedding model inside the model directory.
pub const EMBEDDER_MODEL: &str = "facenet512.onnx";

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facewatch")
}

/// `$XDG_DATA_HOME/facewatch/models`.
pub fn default_model_dir() -> PathBuf {
    data_dir().join("models")
}

/// `$XDG_DATA_HOME/facewatch/gallery.json`.
pub fn default_gallery_path() -> PathBuf {
    data_dir().join("gallery.json")
}
