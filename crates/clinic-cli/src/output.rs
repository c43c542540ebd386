//! Terminal and JSON rendering for CLI results.

use clinic_store::{Patient, Visit};
use serde::Serialize;

/// `clinic extract` output.
#[derive(Serialize)]
pub struct ExtractOutput<'a> {
    pub success: bool,
    pub descriptor: &'a [f32],
    pub vector_length: usize,
}

/// A patient profile with recent visits.
#[derive(Serialize)]
pub struct ProfileOutput<'a> {
    #[serde(flatten)]
    pub patient: &'a Patient,
    pub visits: &'a [Visit],
}

pub fn extract_json(descriptor: &[f32]) -> String {
    let out = ExtractOutput {
        success: true,
        descriptor,
        vector_length: descriptor.len(),
    };
    serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
}

/// `{"error": "..."}` for commands whose output is consumed by scripts.
pub fn error_json(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}

pub fn pretty<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "null".to_string())
}

pub fn format_profile(patient: &Patient, visits: &[Visit]) -> String {
    let mut out = String::new();
    out.push_str(&format!("{} ({})\n", patient.name, patient.patient_id));
    out.push_str(&format!("  Phone:      {}\n", patient.phone.as_deref().unwrap_or("-")));
    out.push_str(&format!("  Email:      {}\n", patient.email.as_deref().unwrap_or("-")));
    out.push_str(&format!("  Registered: {}\n", day(&patient.created_at)));
    out.push('\n');
    out.push_str(&format_visits(visits));
    out
}

pub fn format_visits(visits: &[Visit]) -> String {
    if visits.is_empty() {
        return "No visits recorded".to_string();
    }

    let mut out = format!(
        "{} recent visit{}:\n",
        visits.len(),
        if visits.len() == 1 { "" } else { "s" }
    );
    for visit in visits {
        out.push_str(&format!("  {}  {}\n", visit.day(), visit.purpose));
        if let Some(notes) = &visit.notes {
            out.push_str(&format!("              notes: {notes}\n"));
        }
        if let Some(rx) = &visit.prescription {
            out.push_str(&format!("              prescription: {rx}\n"));
        }
    }
    out.trim_end().to_string()
}

pub fn format_patient_list(patients: &[Patient]) -> String {
    if patients.is_empty() {
        return "No patients registered".to_string();
    }

    let id_width = patients
        .iter()
        .map(|p| p.patient_id.len())
        .max()
        .unwrap_or(0)
        .max("ID".len());
    let mut out = format!("{:<id_width$}  NAME\n", "ID");
    for p in patients {
        out.push_str(&format!("{:<id_width$}  {}\n", p.patient_id, p.name));
    }
    out.trim_end().to_string()
}

fn day(timestamp: &str) -> &str {
    timestamp.get(..10).unwrap_or(timestamp)
}
