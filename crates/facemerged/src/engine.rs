use facemerge_core::{ExtractError, FaceMerger, LandmarkDetector, MergeError, MergeOptions, OnnxLandmarkDetector};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("model load failed: {0}")]
    Load(#[from] ExtractError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Merge {
        source: PathBuf,
        target: PathBuf,
        result: PathBuf,
        reply: oneshot::Sender<Result<PathBuf, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Merge the face in `source` onto `target`, writing `result`.
    pub async fn merge(&self, source: PathBuf, target: PathBuf, result: PathBuf) -> Result<PathBuf, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Merge {
                source,
                target,
                result,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Load both ONNX models and start the engine. Fails fast if either model
/// is unavailable.
pub fn start(config: &Config) -> Result<EngineHandle, EngineError> {
    let detector = OnnxLandmarkDetector::load(&config.detector_model, &config.landmark_model, config.intra_threads)?;
    tracing::info!(
        detector = %config.detector_model.display(),
        landmarks = %config.landmark_model.display(),
        threads = config.intra_threads,
        "landmark models loaded"
    );

    let options = MergeOptions {
        mask_threshold: config.mask_threshold,
        ..MergeOptions::default()
    };
    spawn_engine(FaceMerger::with_options(detector, options))
}

/// Spawn the engine on a dedicated OS thread that owns `merger` and serves
/// requests one at a time.
pub fn spawn_engine<D>(mut merger: FaceMerger<D>) -> Result<EngineHandle, EngineError>
where
    D: LandmarkDetector + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("facemerge-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Merge {
                        source,
                        target,
                        result,
                        reply,
                    } => {
                        let outcome = merger.merge(&source, &target, &result).map_err(EngineError::from);
                        if let Err(e) = &outcome {
                            tracing::warn!(source = %source.display(), target = %target.display(), error = %e, "merge failed");
                        }
                        let _ = reply.send(outcome);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}
