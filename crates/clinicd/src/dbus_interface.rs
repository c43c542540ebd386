use crate::engine::EngineError;
use crate::state::AppState;
use clinic_core::RecognitionReport;
use clinic_store::{encodings, patients, visits, StoreError, Visit};
use serde::Serialize;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.clinic.CheckIn1";
pub const OBJECT_PATH: &str = "/org/clinic/CheckIn1";

/// D-Bus interface for the clinic check-in daemon.
///
/// Bus name: org.clinic.CheckIn1
/// Object path: /org/clinic/CheckIn1
pub struct CheckInService {
    state: Arc<AppState>,
}

impl CheckInService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

/// The patient shown on the kiosk screen.
#[derive(Debug, Serialize)]
struct DisplayedPatient {
    patient_id: String,
    name: Option<String>,
    phone: Option<String>,
    email: Option<String>,
    confidence: f32,
    on_screen_secs: u64,
    recent_visits: Vec<Visit>,
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.clinic.CheckIn1")]
impl CheckInService {
    /// Daemon status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let gallery = self.state.gallery().await;
        let current = self
            .state
            .tracker
            .lock()
            .await
            .current()
            .map(|c| c.patient_id.clone());

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera": self.state.config.camera_device,
            "registered_faces": gallery.len(),
            "similarity_threshold": self.state.config.similarity_threshold,
            "current_patient": current,
        })
        .to_string())
    }

    /// Profile and recent visits of the displayed patient, or "" if nobody is shown.
    async fn current_patient(&self) -> zbus::fdo::Result<String> {
        let Some(current) = self.state.tracker.lock().await.current().cloned() else {
            return Ok(String::new());
        };

        let id = current.patient_id.clone();
        let (profile, recent_visits) = self
            .state
            .with_store(move |conn| {
                let profile = patients::get(conn, &id)?;
                let recent = visits::recent(conn, &id, visits::DEFAULT_VISIT_LIMIT)?;
                Ok((profile, recent))
            })
            .await
            .map_err(failed)?;

        let shown = DisplayedPatient {
            patient_id: current.patient_id,
            name: profile.as_ref().map(|p| p.name.clone()),
            phone: profile.as_ref().and_then(|p| p.phone.clone()),
            email: profile.as_ref().and_then(|p| p.email.clone()),
            confidence: current.similarity,
            on_screen_secs: current.since.elapsed().as_secs(),
            recent_visits,
        };
        serde_json::to_string(&shown).map_err(failed)
    }

    /// Run one identification attempt without touching the check-in state.
    async fn recognize_now(&self) -> zbus::fdo::Result<String> {
        let gallery = self.state.gallery().await;
        let report = match self
            .state
            .engine
            .identify(
                gallery,
                self.state.config.similarity_threshold,
                self.state.config.frames_per_attempt,
            )
            .await
        {
            Ok(identified) => RecognitionReport::from_match(&identified.result),
            Err(EngineError::NoFaceDetected) => RecognitionReport::no_face(),
            Err(e) => return Err(failed(e)),
        };
        tracing::info!(recognized = report.recognized, "recognize_now");
        Ok(report.to_json())
    }

    /// Capture the face in front of the camera and store it for `patient_id`.
    ///
    /// Returns false when no face was visible.
    async fn register_from_camera(&self, patient_id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(patient_id, "register_from_camera requested");
        let id = patient_id.trim().to_string();

        let lookup = id.clone();
        let exists = self
            .state
            .with_store(move |conn| patients::exists(conn, &lookup))
            .await
            .map_err(failed)?;
        if !exists {
            return Err(failed(StoreError::NotFound(id)));
        }

        let registered = match self
            .state
            .engine
            .register(self.state.config.frames_per_register)
            .await
        {
            Ok(r) => r,
            Err(EngineError::NoFaceDetected) => {
                tracing::warn!(patient_id = %id, "no face visible for registration");
                return Ok(false);
            }
            Err(e) => return Err(failed(e)),
        };

        let cipher = self.state.cipher();
        let embedding = registered.embedding;
        let save_id = id.clone();
        self.state
            .with_store(move |conn| encodings::save(conn, &cipher, &save_id, &embedding))
            .await
            .map_err(failed)?;

        let count = self.state.reload_gallery().await.map_err(failed)?;
        tracing::info!(
            patient_id = %id,
            quality = registered.quality,
            gallery = count,
            "patient registered from camera"
        );
        Ok(true)
    }

    /// Reload encodings from the database; returns how many were loaded.
    async fn reload_gallery(&self) -> zbus::fdo::Result<u32> {
        let count = self.state.reload_gallery().await.map_err(failed)?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }
}
