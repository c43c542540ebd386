//! clinic-core — Face detection, recognition and matching for clinic check-in.
//!
//! Uses SCRFD for face detection and ArcFace for face embeddings, both
//! running via ONNX Runtime on the CPU. Matching is a linear cosine scan
//! over the registered patients.

pub mod alignment;
pub mod annotate;
pub mod detector;
pub mod pipeline;
pub mod recognizer;
pub mod report;
pub mod types;

pub use pipeline::{
    data_home, default_model_dir, FacePipeline, FaceSample, FrameAnalysis, PipelineError,
};
pub use report::RecognitionReport;
pub use types::{
    is_valid_threshold, BoundingBox, CosineMatcher, Embedding, MatchResult, Matcher, PatientFace,
    DEFAULT_SIMILARITY_THRESHOLD,
};
