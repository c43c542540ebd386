use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default cosine similarity a face must reach to count as a known patient.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.6;

/// A usable threshold is finite and within (0, 1].
pub fn is_valid_threshold(threshold: f32) -> bool {
    threshold.is_finite() && threshold > 0.0 && threshold <= 1.0
}

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);

        let overlap = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - overlap;
        if union > 0.0 {
            overlap / union
        } else {
            0.0
        }
    }
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding blob length {0} is not a multiple of 4")]
    InvalidLength(usize),
    #[error("embedding is empty")]
    Empty,
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dims(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// Zero-norm vectors compare as 0.0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let (dot, norm_a, norm_b) = self
            .values
            .iter()
            .zip(other.values.iter())
            .fold((0.0f32, 0.0f32, 0.0f32), |(dot, na, nb), (a, b)| {
                (dot + a * b, na + a * a, nb + b * b)
            });

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }

    /// Packed little-endian f32 bytes, the on-disk representation.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self, EmbeddingError> {
        if bytes.is_empty() {
            return Err(EmbeddingError::Empty);
        }
        if bytes.len() % 4 != 0 {
            return Err(EmbeddingError::InvalidLength(bytes.len()));
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self::new(values))
    }
}

/// A patient's stored face encoding, as held in the in-memory gallery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientFace {
    pub patient_id: String,
    pub embedding: Embedding,
    pub registered_at: String,
}

/// Result of matching a probe embedding against the gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub matched: bool,
    /// Cosine similarity of the best candidate [-1, 1].
    pub similarity: f32,
    /// Patient of the best candidate, set only on a match.
    pub patient_id: Option<String>,
}

impl MatchResult {
    pub fn no_match(similarity: f32) -> Self {
        Self {
            matched: false,
            similarity,
            patient_id: None,
        }
    }
}

/// Strategy for comparing a probe embedding against the registered patients.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &[PatientFace], threshold: f32) -> MatchResult;
}

/// Linear-scan cosine matcher.
///
/// Visits every gallery entry; the first entry with the strictly highest
/// similarity wins. A match needs a positive similarity at or above the
/// threshold.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[PatientFace], threshold: f32) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;

        for (i, face) in gallery.iter().enumerate() {
            let sim = probe.similarity(&face.embedding);
            if best.map_or(true, |(_, best_sim)| sim > best_sim) {
                best = Some((i, sim));
            }
        }

        match best {
            Some((idx, sim)) if sim > 0.0 && sim >= threshold => MatchResult {
                matched: true,
                similarity: sim,
                patient_id: Some(gallery[idx].patient_id.clone()),
            },
            Some((_, sim)) => MatchResult::no_match(sim),
            None => MatchResult::no_match(0.0),
        }
    }
}
