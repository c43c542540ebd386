//! JSON recognition report shared by `clinic recognize` and the daemon.

use crate::types::MatchResult;
use serde::{Deserialize, Serialize};

pub const NO_FACE_MESSAGE: &str = "No face detected in image";
pub const NO_MATCH_MESSAGE: &str = "No matching patient found";

/// `{"recognized":true,"patientId":"PAT001","confidence":0.83}` or
/// `{"recognized":false,"message":"..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionReport {
    pub recognized: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RecognitionReport {
    pub fn from_match(result: &MatchResult) -> Self {
        match (&result.patient_id, result.matched) {
            (Some(id), true) => Self {
                recognized: true,
                patient_id: Some(id.clone()),
                confidence: Some(result.similarity),
                message: None,
            },
            _ => Self::failure(NO_MATCH_MESSAGE),
        }
    }

    pub fn no_face() -> Self {
        Self::failure(NO_FACE_MESSAGE)
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            recognized: false,
            patient_id: None,
            confidence: None,
            message: Some(message.into()),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"recognized":false,"message":"report serialization failed"}"#.to_string()
        })
    }
}
