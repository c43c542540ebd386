//! Client side of the clinicd session-bus interface.

use zbus::{proxy, Connection};

#[proxy(
    interface = "org.clinic.CheckIn1",
    default_service = "org.clinic.CheckIn1",
    default_path = "/org/clinic/CheckIn1"
)]
pub trait CheckIn {
    fn status(&self) -> zbus::Result<String>;
    fn current_patient(&self) -> zbus::Result<String>;
    fn reload_gallery(&self) -> zbus::Result<u32>;
}

pub async fn connect() -> zbus::Result<CheckInProxy<'static>> {
    let conn = Connection::session().await?;
    CheckInProxy::new(&conn).await
}

/// Ask a running daemon to pick up changed encodings. Silent when it is not running.
pub async fn notify_gallery_changed() {
    match reload().await {
        Ok(count) => tracing::info!(count, "daemon gallery reloaded"),
        Err(e) => tracing::debug!(error = %e, "daemon not notified"),
    }
}

async fn reload() -> zbus::Result<u32> {
    connect().await?.reload_gallery().await
}
