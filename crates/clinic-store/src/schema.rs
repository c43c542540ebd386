//! Table definitions, migration and the `store_meta` key/value table.

use crate::cipher::EmbeddingCipher;
use crate::{Result, StoreError};
use rusqlite::{Connection, OptionalExtension};

pub const SCHEMA_VERSION: i64 = 1;
const KEY_FINGERPRINT: &str = "key_fingerprint";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS patients (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    patient_id  TEXT UNIQUE NOT NULL,
    name        TEXT NOT NULL,
    phone       TEXT,
    email       TEXT,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS face_encodings (
    patient_id     TEXT PRIMARY KEY NOT NULL REFERENCES patients(patient_id) ON DELETE CASCADE,
    embedding      BLOB NOT NULL,
    dims           INTEGER NOT NULL,
    model_version  TEXT,
    created_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS visit_history (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    patient_id    TEXT NOT NULL REFERENCES patients(patient_id),
    visit_date    TEXT NOT NULL,
    purpose       TEXT NOT NULL,
    notes         TEXT,
    prescription  TEXT
);

CREATE INDEX IF NOT EXISTS idx_visits_patient_date
    ON visit_history(patient_id, visit_date DESC);

CREATE TABLE IF NOT EXISTS store_meta (
    key    TEXT PRIMARY KEY NOT NULL,
    value  TEXT NOT NULL
);
";

/// Create missing tables. Safe to run on every open.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(SCHEMA)?;
    conn.execute(
        "INSERT OR IGNORE INTO store_meta (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

pub fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row("SELECT value FROM store_meta WHERE key = ?1", [key], |row| row.get(0))
        .optional()?)
}

pub fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO store_meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [key, value],
    )?;
    Ok(())
}

/// Tie the database to `cipher`'s key on first use; reject any other key after.
pub fn bind_key(conn: &Connection, cipher: &EmbeddingCipher) -> Result<()> {
    match get_meta(conn, KEY_FINGERPRINT)? {
        Some(stored) if stored == cipher.fingerprint() => Ok(()),
        Some(_) => Err(StoreError::KeyMismatch),
        None => {
            tracing::info!(fingerprint = cipher.fingerprint(), "binding encoding key to database");
            set_meta(conn, KEY_FINGERPRINT, cipher.fingerprint())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = crate::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        assert_eq!(
            get_meta(&conn, "schema_version").unwrap().as_deref(),
            Some("1")
        );
    }

    #[test]
    fn test_meta_upsert() {
        let conn = crate::open_in_memory().unwrap();
        assert_eq!(get_meta(&conn, "k").unwrap(), None);
        set_meta(&conn, "k", "a").unwrap();
        set_meta(&conn, "k", "b").unwrap();
        assert_eq!(get_meta(&conn, "k").unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn test_bind_key_rejects_second_key() {
        let conn = crate::open_in_memory().unwrap();
        let first = EmbeddingCipher::from_key(&[1u8; 32]);
        let second = EmbeddingCipher::from_key(&[2u8; 32]);

        bind_key(&conn, &first).unwrap();
        bind_key(&conn, &first).unwrap();
        assert!(matches!(bind_key(&conn, &second), Err(StoreError::KeyMismatch)));
    }
}
