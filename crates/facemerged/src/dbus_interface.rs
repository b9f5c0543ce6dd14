use facemerge_core::MergeError;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use zbus::interface;

use crate::config::Config;
use crate::engine::{EngineError, EngineHandle};

/// D-Bus interface for the face merge daemon.
///
/// Bus name: org.facemerge.FaceMerge1
/// Object path: /org/facemerge/FaceMerge1
pub struct FaceMergeService {
    engine: EngineHandle,
    merge_timeout: Duration,
    detector_model: PathBuf,
    landmark_model: PathBuf,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl FaceMergeService {
    pub fn new(engine: EngineHandle, config: &Config) -> Self {
        Self {
            engine,
            merge_timeout: config.merge_timeout(),
            detector_model: config.detector_model.clone(),
            landmark_model: config.landmark_model.clone(),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    async fn run_merge(&self, source: &str, target: &str, result: &str) -> zbus::fdo::Result<String> {
        let request = self
            .engine
            .merge(PathBuf::from(source), PathBuf::from(target), PathBuf::from(result));

        match tokio::time::timeout(self.merge_timeout, request).await {
            Ok(Ok(written)) => Ok(written.to_string_lossy().into_owned()),
            Ok(Err(e)) => Err(to_fdo_error(e)),
            Err(_) => {
                tracing::warn!(timeout_secs = self.merge_timeout.as_secs(), "merge timed out");
                Err(zbus::fdo::Error::Failed(format!(
                    "merge timed out after {}s",
                    self.merge_timeout.as_secs()
                )))
            }
        }
    }

    fn status_json(&self) -> serde_json::Value {
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "models_loaded": true,
            "detector_model": self.detector_model.display().to_string(),
            "landmark_model": self.landmark_model.display().to_string(),
            "merge_timeout_secs": self.merge_timeout.as_secs(),
            "merges_completed": self.completed.load(Ordering::Relaxed),
            "merges_failed": self.failed.load(Ordering::Relaxed),
        })
    }
}

/// Map engine failures to D-Bus errors. A missing face is the caller's input
/// problem; everything else is a daemon-side failure.
fn to_fdo_error(e: EngineError) -> zbus::fdo::Error {
    match e {
        EngineError::Merge(MergeError::NoFaceDetected) => zbus::fdo::Error::InvalidArgs(e.to_string()),
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}

#[interface(name = "org.facemerge.FaceMerge1")]
impl FaceMergeService {
    /// Merge the face in `source` onto the face in `target`; returns the path
    /// of the written result.
    async fn merge(&self, source: &str, target: &str, result: &str) -> zbus::fdo::Result<String> {
        tracing::info!(source, target, result, "merge requested");
        let outcome = self.run_merge(source, target, result).await;
        let counter = if outcome.is_ok() { &self.completed } else { &self.failed };
        counter.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.status_json().to_string())
    }
}
