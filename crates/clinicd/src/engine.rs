use crate::config::Config;
use clinic_core::{
    BoundingBox, CosineMatcher, Embedding, FacePipeline, MatchResult, Matcher, PatientFace,
    PipelineError,
};
use clinic_hw::{Camera, Frame};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] clinic_hw::CameraError),
    #[error("{0}")]
    Pipeline(#[from] PipelineError),
    #[error("no face detected in any captured frame")]
    NoFaceDetected,
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Result of a registration capture.
pub struct RegisterResult {
    pub embedding: Embedding,
    /// Detector confidence of the face the embedding came from.
    pub quality: f32,
}

/// Result of an identification attempt.
pub struct IdentifyResult {
    pub result: MatchResult,
    pub quality: f32,
}

/// Messages sent from async tasks to the engine thread.
enum EngineRequest {
    Register {
        frames: usize,
        reply: oneshot::Sender<Result<RegisterResult, EngineError>>,
    },
    Identify {
        gallery: Arc<Vec<PatientFace>>,
        threshold: f32,
        frames: usize,
        reply: oneshot::Sender<Result<IdentifyResult, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Capture frames and embed the most confident face among them.
    pub async fn register(&self, frames: usize) -> Result<RegisterResult, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Register { frames, reply })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Capture frames and match each primary face against `gallery`.
    pub async fn identify(
        &self,
        gallery: Arc<Vec<PatientFace>>,
        threshold: f32,
        frames: usize,
    ) -> Result<IdentifyResult, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Identify {
                gallery,
                threshold,
                frames,
                reply,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

#[cfg(test)]
impl EngineHandle {
    /// Handle whose engine thread has already gone away.
    pub(crate) fn closed() -> Self {
        let (tx, _) = mpsc::channel(1);
        Self { tx }
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The camera and both models are opened before the thread starts so a
/// missing device or model fails daemon startup.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let camera = Camera::open(&config.camera_device, config.camera_width, config.camera_height)?;
    tracing::info!(
        device = %config.camera_device,
        width = camera.width,
        height = camera.height,
        format = ?camera.pixel_format(),
        "camera opened"
    );

    let mut pipeline = FacePipeline::load(&config.model_dir)?;
    tracing::info!(dir = %config.model_dir.display(), "face models loaded");

    if config.warmup_frames > 0 {
        tracing::info!(count = config.warmup_frames, "discarding warmup frames");
        for _ in 0..config.warmup_frames {
            if let Err(e) = camera.capture_frame() {
                tracing::debug!(error = %e, "warmup frame failed");
            }
        }
    }

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("clinic-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Register { frames, reply } => {
                        let _ = reply.send(run_register(&camera, &mut pipeline, frames));
                    }
                    EngineRequest::Identify {
                        gallery,
                        threshold,
                        frames,
                        reply,
                    } => {
                        let result =
                            run_identify(&camera, &mut pipeline, &gallery, threshold, frames);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn capture(camera: &Camera, count: usize) -> Result<Vec<Frame>, EngineError> {
    let (frames, dark_skipped) = camera.capture_frames(count.max(1))?;
    tracing::debug!(captured = frames.len(), dark_skipped, "frames captured");
    if frames.is_empty() {
        return Err(EngineError::NoFaceDetected);
    }
    Ok(frames)
}

/// Detect on every frame, extract once from the most confident face.
fn run_register(
    camera: &Camera,
    pipeline: &mut FacePipeline,
    count: usize,
) -> Result<RegisterResult, EngineError> {
    let frames = capture(camera, count)?;

    let mut best: Option<(usize, BoundingBox)> = None;
    for (i, frame) in frames.iter().enumerate() {
        let Some(face) = pipeline.detect(&frame.image)?.into_iter().next() else {
            continue;
        };
        if best.as_ref().map_or(true, |(_, b)| face.confidence > b.confidence) {
            best = Some((i, face));
        }
    }

    let (idx, face) = best.ok_or(EngineError::NoFaceDetected)?;
    tracing::info!(confidence = face.confidence, frame = idx, "register: best face selected");

    let embedding = pipeline.extract(&frames[idx].image, &face)?;
    Ok(RegisterResult {
        embedding,
        quality: face.confidence,
    })
}

fn run_identify(
    camera: &Camera,
    pipeline: &mut FacePipeline,
    gallery: &[PatientFace],
    threshold: f32,
    count: usize,
) -> Result<IdentifyResult, EngineError> {
    let frames = capture(camera, count)?;
    let matcher = CosineMatcher;

    let mut attempts = Vec::with_capacity(frames.len());
    for frame in &frames {
        if let Some(sample) = pipeline.embed_primary(&frame.image)? {
            let result = matcher.compare(&sample.embedding, gallery, threshold);
            attempts.push(IdentifyResult {
                result,
                quality: sample.face.confidence,
            });
        }
    }

    pick_best(attempts).ok_or(EngineError::NoFaceDetected)
}

/// Highest similarity across frames; the earliest frame wins ties.
fn pick_best(attempts: Vec<IdentifyResult>) -> Option<IdentifyResult> {
    attempts.into_iter().fold(None, |best, next| match best {
        Some(b) if b.result.similarity >= next.result.similarity => Some(b),
        _ => Some(next),
    })
}
