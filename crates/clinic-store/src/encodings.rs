//! Encrypted face encodings, one per patient.

use crate::cipher::EmbeddingCipher;
use crate::patients::{NewPatient, Patient};
use crate::{now, patients, schema, Result, StoreError};
use clinic_core::{Embedding, PatientFace};
use rusqlite::{params, Connection};

/// Store (or replace) a patient's face encoding.
pub fn save(
    conn: &Connection,
    cipher: &EmbeddingCipher,
    patient_id: &str,
    embedding: &Embedding,
) -> Result<()> {
    if embedding.values.is_empty() {
        return Err(StoreError::Invalid {
            field: "embedding",
            reason: "empty vector".into(),
        });
    }
    if !patients::exists(conn, patient_id)? {
        return Err(StoreError::NotFound(patient_id.to_string()));
    }
    schema::bind_key(conn, cipher)?;

    let blob = cipher.seal(&embedding.to_le_bytes())?;
    conn.execute(
        "INSERT INTO face_encodings (patient_id, embedding, dims, model_version, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(patient_id) DO UPDATE SET
             embedding = excluded.embedding,
             dims = excluded.dims,
             model_version = excluded.model_version,
             created_at = excluded.created_at",
        params![
            patient_id,
            blob,
            embedding.dims() as i64,
            embedding.model_version,
            now()
        ],
    )?;

    tracing::info!(patient_id, dims = embedding.dims(), "face encoding saved");
    Ok(())
}

/// Create a patient and store their first encoding in one transaction.
///
/// Nothing is written if either step fails.
pub fn enroll(
    conn: &mut Connection,
    cipher: &EmbeddingCipher,
    new: &NewPatient,
    embedding: &Embedding,
) -> Result<Patient> {
    schema::bind_key(conn, cipher)?;
    let tx = conn.transaction()?;
    let patient = patients::insert(&tx, new)?;
    save(&tx, cipher, &patient.patient_id, embedding)?;
    tx.commit()?;
    Ok(patient)
}

/// Remove a patient's encoding. Returns false if there was none.
pub fn delete(conn: &Connection, patient_id: &str) -> Result<bool> {
    let removed = conn.execute("DELETE FROM face_encodings WHERE patient_id = ?1", [patient_id])?;
    if removed > 0 {
        tracing::info!(patient_id, "face encoding deleted");
    }
    Ok(removed > 0)
}

/// Patients that have a registered encoding.
pub fn list_ids(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT patient_id FROM face_encodings ORDER BY patient_id")?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
}

/// Decrypt every stored encoding into the in-memory gallery.
///
/// Rows that fail to decrypt or decode are logged and skipped so one bad
/// entry does not take the kiosk down. A key mismatch is still an error.
pub fn load_gallery(conn: &Connection, cipher: &EmbeddingCipher) -> Result<Vec<PatientFace>> {
    schema::bind_key(conn, cipher)?;

    let mut stmt = conn.prepare(
        "SELECT patient_id, embedding, dims, model_version, created_at
         FROM face_encodings ORDER BY patient_id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, Vec<u8>>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;

    let mut gallery = Vec::new();
    for row in rows {
        let (patient_id, blob, dims, model_version, registered_at) = row?;
        match decode(cipher, &patient_id, &blob, dims) {
            Ok(mut embedding) => {
                embedding.model_version = model_version;
                gallery.push(PatientFace {
                    patient_id,
                    embedding,
                    registered_at,
                });
            }
            Err(e) => tracing::warn!(patient_id = %patient_id, error = %e, "skipping face encoding"),
        }
    }

    tracing::info!(count = gallery.len(), "face gallery loaded");
    Ok(gallery)
}

fn decode(cipher: &EmbeddingCipher, patient_id: &str, blob: &[u8], dims: i64) -> Result<Embedding> {
    let plain = cipher
        .open(blob)
        .ok_or_else(|| StoreError::Decrypt(patient_id.to_string()))?;
    let embedding = Embedding::from_le_bytes(&plain).map_err(|source| StoreError::Corrupt {
        patient_id: patient_id.to_string(),
        source,
    })?;
    if embedding.dims() as i64 != dims {
        return Err(StoreError::Invalid {
            field: "dims",
            reason: format!("{patient_id}: stored {dims}, decoded {}", embedding.dims()),
        });
    }
    Ok(embedding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patients::{insert, NewPatient};

    fn setup(ids: &[&str]) -> (Connection, EmbeddingCipher) {
        let conn = crate::open_in_memory().unwrap();
        for id in ids {
            insert(
                &conn,
                &NewPatient {
                    patient_id: id.to_string(),
                    name: format!("Patient {id}"),
                    ..Default::default()
                },
            )
            .unwrap();
        }
        (conn, EmbeddingCipher::from_key(&[3u8; 32]))
    }

    fn embedding(values: &[f32]) -> Embedding {
        Embedding {
            values: values.to_vec(),
            model_version: Some("w600k_r50".into()),
        }
    }

    #[test]
    fn test_save_and_load_gallery() {
        let (conn, cipher) = setup(&["PAT001", "PAT002"]);
        save(&conn, &cipher, "PAT002", &embedding(&[0.0, 1.0])).unwrap();
        save(&conn, &cipher, "PAT001", &embedding(&[0.6, 0.8])).unwrap();

        let gallery = load_gallery(&conn, &cipher).unwrap();
        assert_eq!(gallery.len(), 2);
        assert_eq!(gallery[0].patient_id, "PAT001");
        assert_eq!(gallery[0].embedding, embedding(&[0.6, 0.8]));
        assert_eq!(list_ids(&conn).unwrap(), vec!["PAT001", "PAT002"]);
    }

    #[test]
    fn test_encoding_is_not_stored_in_clear() {
        let (conn, cipher) = setup(&["PAT001"]);
        let e = embedding(&[0.25, 0.5, 0.75]);
        save(&conn, &cipher, "PAT001", &e).unwrap();

        let blob: Vec<u8> = conn
            .query_row("SELECT embedding FROM face_encodings", [], |r| r.get(0))
            .unwrap();
        let clear = e.to_le_bytes();
        assert!(!blob.windows(clear.len()).any(|w| w == clear.as_slice()));
    }

    #[test]
    fn test_reregister_replaces() {
        let (conn, cipher) = setup(&["PAT001"]);
        save(&conn, &cipher, "PAT001", &embedding(&[1.0, 0.0])).unwrap();
        save(&conn, &cipher, "PAT001", &embedding(&[0.0, 1.0, 0.0])).unwrap();

        let gallery = load_gallery(&conn, &cipher).unwrap();
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery[0].embedding.values, vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_save_requires_patient() {
        let (conn, cipher) = setup(&[]);
        assert!(matches!(
            save(&conn, &cipher, "PAT404", &embedding(&[1.0])),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let (conn, cipher) = setup(&["PAT001"]);
        save(&conn, &cipher, "PAT001", &embedding(&[1.0])).unwrap();

        let other = EmbeddingCipher::from_key(&[4u8; 32]);
        assert!(matches!(load_gallery(&conn, &other), Err(StoreError::KeyMismatch)));
    }

    #[test]
    fn test_corrupt_row_skipped() {
        let (conn, cipher) = setup(&["PAT001", "PAT002"]);
        save(&conn, &cipher, "PAT001", &embedding(&[1.0])).unwrap();
        save(&conn, &cipher, "PAT002", &embedding(&[1.0])).unwrap();
        conn.execute(
            "UPDATE face_encodings SET embedding = x'00010203' WHERE patient_id = 'PAT002'",
            [],
        )
        .unwrap();

        let gallery = load_gallery(&conn, &cipher).unwrap();
        let ids: Vec<&str> = gallery.iter().map(|f| f.patient_id.as_str()).collect();
        assert_eq!(ids, vec!["PAT001"]);
    }

    #[test]
    fn test_enroll_creates_patient_and_encoding() {
        let (mut conn, cipher) = setup(&[]);
        let new = NewPatient {
            patient_id: "PAT009".into(),
            name: "Grace Hopper".into(),
            ..Default::default()
        };
        let patient = enroll(&mut conn, &cipher, &new, &embedding(&[0.6, 0.8])).unwrap();
        assert_eq!(patient.patient_id, "PAT009");
        assert_eq!(list_ids(&conn).unwrap(), vec!["PAT009"]);
    }

    #[test]
    fn test_enroll_with_wrong_key_leaves_no_patient() {
        let (mut conn, cipher) = setup(&["PAT001"]);
        save(&conn, &cipher, "PAT001", &embedding(&[1.0])).unwrap();

        let other = EmbeddingCipher::from_key(&[4u8; 32]);
        let new = NewPatient {
            patient_id: "PAT009".into(),
            name: "Grace Hopper".into(),
            ..Default::default()
        };
        assert!(matches!(
            enroll(&mut conn, &other, &new, &embedding(&[1.0])),
            Err(StoreError::KeyMismatch)
        ));
        assert!(!patients::exists(&conn, "PAT009").unwrap());

        // A retry with the right key is not blocked by a leftover row.
        enroll(&mut conn, &cipher, &new, &embedding(&[1.0])).unwrap();
        assert_eq!(list_ids(&conn).unwrap(), vec!["PAT001", "PAT009"]);
    }

    #[test]
    fn test_enroll_rolls_back_when_save_fails() {
        let (mut conn, cipher) = setup(&[]);
        let new = NewPatient {
            patient_id: "PAT009".into(),
            name: "Grace Hopper".into(),
            ..Default::default()
        };
        assert!(matches!(
            enroll(&mut conn, &cipher, &new, &embedding(&[])),
            Err(StoreError::Invalid { field: "embedding", .. })
        ));
        assert!(!patients::exists(&conn, "PAT009").unwrap());
    }

    #[test]
    fn test_delete() {
        let (conn, cipher) = setup(&["PAT001"]);
        save(&conn, &cipher, "PAT001", &embedding(&[1.0])).unwrap();
        assert!(delete(&conn, "PAT001").unwrap());
        assert!(!delete(&conn, "PAT001").unwrap());
        assert!(list_ids(&conn).unwrap().is_empty());
    }
}
