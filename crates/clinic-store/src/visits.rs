//! Visit history.

use crate::{now, patients, Result, StoreError};
use rusqlite::{params, Connection};
use serde::Serialize;

pub const CHECK_IN_PURPOSE: &str = "Face Recognition Check-in";
pub const DEFAULT_PURPOSE: &str = "General Checkup";
pub const DEFAULT_VISIT_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Visit {
    pub id: i64,
    pub patient_id: String,
    pub visit_date: String,
    pub purpose: String,
    pub notes: Option<String>,
    pub prescription: Option<String>,
}

impl Visit {
    /// `YYYY-MM-DD` part of the visit timestamp.
    pub fn day(&self) -> &str {
        self.visit_date.get(..10).unwrap_or(&self.visit_date)
    }
}

#[derive(Debug, Clone)]
pub struct NewVisit {
    pub patient_id: String,
    pub purpose: String,
    pub notes: Option<String>,
    pub prescription: Option<String>,
}

impl NewVisit {
    /// A manually entered visit; blank purpose becomes "General Checkup".
    pub fn manual(
        patient_id: &str,
        purpose: Option<&str>,
        notes: Option<&str>,
        prescription: Option<&str>,
    ) -> Self {
        let clean = |v: Option<&str>| v.map(str::trim).filter(|v| !v.is_empty()).map(String::from);
        Self {
            patient_id: patient_id.to_string(),
            purpose: clean(purpose).unwrap_or_else(|| DEFAULT_PURPOSE.to_string()),
            notes: clean(notes),
            prescription: clean(prescription),
        }
    }

    /// The visit recorded when the kiosk recognises a patient.
    pub fn check_in(patient_id: &str) -> Self {
        let local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        Self {
            patient_id: patient_id.to_string(),
            purpose: CHECK_IN_PURPOSE.to_string(),
            notes: Some(format!("Automated check-in at {local}")),
            prescription: None,
        }
    }
}

/// Insert a visit; returns its row id.
pub fn record(conn: &Connection, visit: &NewVisit) -> Result<i64> {
    if !patients::exists(conn, &visit.patient_id)? {
        return Err(StoreError::NotFound(visit.patient_id.clone()));
    }
    conn.execute(
        "INSERT INTO visit_history (patient_id, visit_date, purpose, notes, prescription)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            visit.patient_id,
            now(),
            visit.purpose,
            visit.notes,
            visit.prescription
        ],
    )?;
    let id = conn.last_insert_rowid();
    tracing::info!(patient_id = %visit.patient_id, purpose = %visit.purpose, id, "visit recorded");
    Ok(id)
}

/// Most recent visits first.
pub fn recent(conn: &Connection, patient_id: &str, limit: usize) -> Result<Vec<Visit>> {
    let mut stmt = conn.prepare(
        "SELECT id, patient_id, visit_date, purpose, notes, prescription
         FROM visit_history
         WHERE patient_id = ?1
         ORDER BY visit_date DESC, id DESC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![patient_id, limit as i64], |row| {
        Ok(Visit {
            id: row.get(0)?,
            patient_id: row.get(1)?,
            visit_date: row.get(2)?,
            purpose: row.get(3)?,
            notes: row.get(4)?,
            prescription: row.get(5)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patients::{insert, NewPatient};

    fn setup() -> Connection {
        let conn = crate::open_in_memory().unwrap();
        insert(
            &conn,
            &NewPatient {
                patient_id: "PAT001".into(),
                name: "John Doe".into(),
                ..Default::default()
            },
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_manual_defaults() {
        let v = NewVisit::manual("PAT001", Some("  "), Some("ok"), None);
        assert_eq!(v.purpose, DEFAULT_PURPOSE);
        assert_eq!(v.notes.as_deref(), Some("ok"));
        assert_eq!(v.prescription, None);
    }

    #[test]
    fn test_check_in_visit() {
        let v = NewVisit::check_in("PAT001");
        assert_eq!(v.purpose, CHECK_IN_PURPOSE);
        assert!(v.notes.unwrap().starts_with("Automated check-in at "));
    }

    #[test]
    fn test_recent_newest_first_and_limited() {
        let conn = setup();
        for purpose in ["first", "second", "third"] {
            record(&conn, &NewVisit::manual("PAT001", Some(purpose), None, None)).unwrap();
        }

        let visits = recent(&conn, "PAT001", 2).unwrap();
        let purposes: Vec<&str> = visits.iter().map(|v| v.purpose.as_str()).collect();
        assert_eq!(purposes, vec!["third", "second"]);
        assert_eq!(visits[0].day().len(), 10);
    }

    #[test]
    fn test_record_unknown_patient() {
        let conn = setup();
        let err = record(&conn, &NewVisit::check_in("PAT404")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(id) if id == "PAT404"));
    }

    #[test]
    fn test_recent_empty() {
        let conn = setup();
        assert!(recent(&conn, "PAT001", DEFAULT_VISIT_LIMIT).unwrap().is_empty());
    }
}
