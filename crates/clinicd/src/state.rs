use crate::checkin::CheckInTracker;
use crate::config::Config;
use crate::engine::EngineHandle;
use anyhow::{anyhow, Context, Result};
use clinic_core::PatientFace;
use clinic_store::{encodings, schema, EmbeddingCipher};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Shared daemon state behind the D-Bus service and the check-in loop.
pub struct AppState {
    pub config: Config,
    pub engine: EngineHandle,
    db: tokio_rusqlite::Connection,
    cipher: Arc<EmbeddingCipher>,
    gallery: RwLock<Arc<Vec<PatientFace>>>,
    pub tracker: Mutex<CheckInTracker>,
}

impl AppState {
    pub fn new(
        config: Config,
        engine: EngineHandle,
        db: tokio_rusqlite::Connection,
        cipher: EmbeddingCipher,
    ) -> Self {
        let tracker = CheckInTracker::new(config.display_hold(), config.revisit_cooldown());
        Self {
            config,
            engine,
            db,
            cipher: Arc::new(cipher),
            gallery: RwLock::new(Arc::new(Vec::new())),
            tracker: Mutex::new(tracker),
        }
    }

    /// Run a store operation on the database thread.
    pub async fn with_store<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&rusqlite::Connection) -> clinic_store::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.db
            .call(move |conn| Ok(f(conn)))
            .await
            .map_err(|e| anyhow!("database: {e}"))?
            .map_err(anyhow::Error::from)
    }

    pub fn cipher(&self) -> Arc<EmbeddingCipher> {
        Arc::clone(&self.cipher)
    }

    /// Snapshot of the registered faces.
    pub async fn gallery(&self) -> Arc<Vec<PatientFace>> {
        Arc::clone(&*self.gallery.read().await)
    }

    /// Decrypt all encodings from the store and swap them in. Returns the count.
    pub async fn reload_gallery(&self) -> Result<usize> {
        let cipher = self.cipher();
        let faces = self
            .with_store(move |conn| encodings::load_gallery(conn, &cipher))
            .await?;
        let count = faces.len();
        *self.gallery.write().await = Arc::new(faces);
        Ok(count)
    }
}

#[cfg(test)]
impl AppState {
    /// Default config, a closed engine and a fresh in-memory database.
    pub(crate) async fn in_memory() -> Self {
        let db = tokio_rusqlite::Connection::open_in_memory().await.unwrap();
        db.call(|conn| Ok(schema::migrate(conn))).await.unwrap().unwrap();
        AppState::new(
            Config::default(),
            EngineHandle::closed(),
            db,
            EmbeddingCipher::from_key(&[9u8; 32]),
        )
    }
}

/// Open the database on its own thread and apply the schema.
pub async fn open_database(path: &Path) -> Result<tokio_rusqlite::Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let db = tokio_rusqlite::Connection::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    db.call(|conn| Ok(schema::migrate(conn)))
        .await
        .map_err(|e| anyhow!("database: {e}"))?
        .context("applying schema")?;
    tracing::info!(path = %path.display(), "database ready");
    Ok(db)
}
