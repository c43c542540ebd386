//! Detector + recognizer bundle used by the CLI and the daemon engine.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// The primary face of a frame and its embedding.
#[derive(Debug, Clone)]
pub struct FaceSample {
    pub face: BoundingBox,
    pub embedding: Embedding,
}

/// Everything found in one frame.
#[derive(Debug, Clone, Default)]
pub struct FrameAnalysis {
    /// All detections, highest confidence first.
    pub faces: Vec<BoundingBox>,
    /// Embedding of the highest-confidence face, if any.
    pub sample: Option<FaceSample>,
}

/// Model directory: `$CLINIC_MODEL_DIR`, else `$XDG_DATA_HOME/clinic/models`,
/// else `~/.local/share/clinic/models`.
pub fn default_model_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CLINIC_MODEL_DIR") {
        return PathBuf::from(dir);
    }
    data_home().join("clinic").join("models")
}

/// `$XDG_DATA_HOME`, falling back to `~/.local/share`.
pub fn data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
}

pub struct FacePipeline {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl FacePipeline {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, PipelineError> {
        let detector = FaceDetector::load(&model_dir.join(SCRFD_MODEL_FILE))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(ARCFACE_MODEL_FILE))?;
        Ok(Self {
            detector,
            recognizer,
        })
    }

    /// Faces in the frame, highest confidence first.
    pub fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, PipelineError> {
        Ok(self.detector.detect(frame)?)
    }

    pub fn extract(&mut self, frame: &RgbImage, face: &BoundingBox) -> Result<Embedding, PipelineError> {
        Ok(self.recognizer.extract(frame, face)?)
    }

    /// Detect all faces and embed the most confident one.
    pub fn analyze(&mut self, frame: &RgbImage) -> Result<FrameAnalysis, PipelineError> {
        let faces = self.detect(frame)?;
        let sample = match faces.first() {
            Some(face) => Some(FaceSample {
                face: face.clone(),
                embedding: self.extract(frame, face)?,
            }),
            None => None,
        };

        tracing::debug!(
            faces = faces.len(),
            confidence = sample.as_ref().map(|s| s.face.confidence),
            "frame analyzed"
        );
        Ok(FrameAnalysis { faces, sample })
    }

    /// Embedding of the most confident face, `None` when no face is found.
    pub fn embed_primary(&mut self, frame: &RgbImage) -> Result<Option<FaceSample>, PipelineError> {
        Ok(self.analyze(frame)?.sample)
    }
}
