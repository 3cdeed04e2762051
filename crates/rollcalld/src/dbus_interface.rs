use crate::config::Config;
use crate::engine::{EngineError, EngineHandle};
use rollcall_core::pipeline::UNKNOWN_LABEL;
use rollcall_core::{
    AttendanceStore, EnrollError, EnrollOutcome, EnrollRequest, Recognition, StoreError,
};
use std::path::PathBuf;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    engine: EngineHandle,
    store: Arc<dyn AttendanceStore>,
    status: serde_json::Value,
}

impl AttendanceService {
    pub fn new(engine: EngineHandle, store: Arc<dyn AttendanceStore>, config: &Config) -> Self {
        Self {
            engine,
            store,
            status: status_json(config),
        }
    }

    /// Run a store query on the blocking pool; SQLite calls never touch the executor.
    async fn query<T, F>(&self, f: F) -> zbus::fdo::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn AttendanceStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("store task failed: {e}")))?
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Enroll (or re-enroll) an identity from encoded photos. Returns a JSON summary.
    async fn enroll(
        &self,
        id: &str,
        full_name: &str,
        department: &str,
        images: Vec<Vec<u8>>,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(id, images = images.len(), "enroll requested");
        let request = EnrollRequest {
            id: id.to_string(),
            full_name: full_name.to_string(),
            department: department.to_string(),
            images,
        };
        let outcome = self.engine.enroll(request).await.map_err(to_fdo)?;
        Ok(enroll_json(&outcome).to_string())
    }

    /// Recognize one camera frame and record attendance. Returns a JSON reply.
    async fn recognize(&self, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::debug!(bytes = image.len(), "recognize requested");
        let recognition = self.engine.recognize(image).await;
        Ok(recognition_json(&recognition))
    }

    /// List enrolled identities, newest first.
    async fn list_users(&self) -> zbus::fdo::Result<String> {
        let users = self.query(|store| store.list_identities()).await?;
        serde_json::to_string(&users).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// The latest `limit` check-ins, newest first.
    async fn attendance_logs(&self, limit: u32) -> zbus::fdo::Result<String> {
        let logs = self
            .query(move |store| store.recent_attendance(limit as usize))
            .await?;
        serde_json::to_string(&logs).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.status.to_string())
    }
}

fn enroll_json(outcome: &EnrollOutcome) -> serde_json::Value {
    serde_json::json!({
        "identity_id": outcome.identity_id,
        "used": outcome.used,
        "skipped": outcome.skipped,
        "image_dir": outcome.image_dir.to_string_lossy(),
    })
}

/// Recognition never fails towards the caller, serialization included.
fn recognition_json(recognition: &Recognition) -> String {
    serde_json::to_string(&recognition.reply()).unwrap_or_else(|err| {
        tracing::warn!(error = %err, "could not serialize recognition; reporting unknown");
        serde_json::json!({
            "identity": UNKNOWN_LABEL,
            "identity_id": null,
            "confidence": 0.0,
            "attendance_message": "",
            "bbox": null,
        })
        .to_string()
    })
}

fn status_json(config: &Config) -> serde_json::Value {
    let path = |p: &PathBuf| p.to_string_lossy().into_owned();
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "db_path": path(&config.db_path),
        "model_dir": path(&config.model_dir),
        "storage_dir": path(&config.storage_dir),
        "liveness_threshold": config.liveness_threshold,
        "match_threshold": config.match_threshold,
        "window": {
            "opens": config.window_opens,
            "late_after": config.late_after,
            "closes": config.window_closes,
        },
    })
}

/// Caller mistakes become `InvalidArgs`; everything else is a daemon failure.
fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    match &err {
        EngineError::Enroll(
            EnrollError::InvalidId | EnrollError::Decode { .. } | EnrollError::NoUsableFace { .. },
        ) => zbus::fdo::Error::InvalidArgs(err.to_string()),
        _ => zbus::fdo::Error::Failed(err.to_string()),
    }
}
