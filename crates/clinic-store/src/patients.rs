//! Patient records.

use crate::{is_constraint_violation, now, Result, StoreError};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Patient {
    pub patient_id: String,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct NewPatient {
    pub patient_id: String,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
}

const COLUMNS: &str = "patient_id, name, phone, email, created_at, updated_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<Patient> {
    Ok(Patient {
        patient_id: row.get(0)?,
        name: row.get(1)?,
        phone: row.get(2)?,
        email: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

/// Blank optional fields are stored as NULL.
fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

pub fn insert(conn: &Connection, new: &NewPatient) -> Result<Patient> {
    let patient_id = new.patient_id.trim();
    let name = new.name.trim();
    if patient_id.is_empty() {
        return Err(StoreError::Invalid {
            field: "patient_id",
            reason: "required".into(),
        });
    }
    if name.is_empty() {
        return Err(StoreError::Invalid {
            field: "name",
            reason: "required".into(),
        });
    }

    let ts = now();
    conn.execute(
        "INSERT INTO patients (patient_id, name, phone, email, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![patient_id, name, non_blank(&new.phone), non_blank(&new.email), ts],
    )
    .map_err(|e| {
        if is_constraint_violation(&e) {
            StoreError::PatientExists(patient_id.to_string())
        } else {
            e.into()
        }
    })?;

    tracing::info!(patient_id, "patient added");
    get(conn, patient_id)?.ok_or_else(|| StoreError::NotFound(patient_id.to_string()))
}

pub fn get(conn: &Connection, patient_id: &str) -> Result<Option<Patient>> {
    Ok(conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM patients WHERE patient_id = ?1"),
            [patient_id],
            from_row,
        )
        .optional()?)
}

pub fn exists(conn: &Connection, patient_id: &str) -> Result<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM patients WHERE patient_id = ?1",
            [patient_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

/// All patients ordered by name.
pub fn list(conn: &Connection) -> Result<Vec<Patient>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM patients ORDER BY name COLLATE NOCASE, patient_id"
    ))?;
    let rows = stmt.query_map([], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Update contact details; `None` leaves a field unchanged.
pub fn update_contact(
    conn: &Connection,
    patient_id: &str,
    phone: Option<&str>,
    email: Option<&str>,
) -> Result<Patient> {
    let changed = conn.execute(
        "UPDATE patients
         SET phone = COALESCE(?2, phone), email = COALESCE(?3, email), updated_at = ?4
         WHERE patient_id = ?1",
        params![patient_id, phone, email, now()],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound(patient_id.to_string()));
    }
    get(conn, patient_id)?.ok_or_else(|| StoreError::NotFound(patient_id.to_string()))
}
