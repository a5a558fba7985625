use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Integer pixel rectangle `(x, y, w, h)` clipped to a `width`×`height` frame.
    ///
    /// Returns `None` when nothing of the box lies inside the frame.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        if !(self.x.is_finite() && self.y.is_finite() && self.width.is_finite() && self.height.is_finite()) {
            return None;
        }
        let x1 = self.x.max(0.0).floor() as i64;
        let y1 = self.y.max(0.0).floor() as i64;
        let x2 = ((self.x + self.width).ceil() as i64).min(width as i64);
        let y2 = ((self.y + self.height).ceil() as i64).min(height as i64);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some((x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32))
    }
}

/// Face embedding vector (512-dimensional for FaceNet).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Only the shared prefix is compared; callers check dimensions first.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// A known person: id, display name and reference embedding.
///
/// Serializes to the persisted gallery record `{"id", "name", "embedding": [..]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub embedding: Embedding,
}

impl Identity {
    pub fn new(id: impl Into<String>, name: impl Into<String>, embedding: impl Into<Embedding>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            embedding: embedding.into(),
        }
    }

    /// Overlay caption, e.g. `Alice (001)`.
    pub fn display_label(&self) -> String {
        format!("{} ({})", self.name, self.id)
    }
}

/// Result of classifying a query embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// The nearest identity, present only when it cleared the threshold.
    pub identity: Option<Identity>,
    /// Distance to the nearest gallery entry (`+inf` for an empty gallery).
    pub distance: f32,
}

impl MatchResult {
    pub fn unmatched(distance: f32) -> Self {
        Self {
            identity: None,
            distance,
        }
    }

    pub fn is_match(&self) -> bool {
        self.identity.is_some()
    }
}
