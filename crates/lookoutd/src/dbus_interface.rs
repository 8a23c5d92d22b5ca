use crate::blob::{BlobError, BlobStore};
use crate::cases::CaseDirectory;
use crate::collaborators::{FrameId, FrameRepository, UserId};
use crate::dispatcher::{DispatcherHandle, IngestError};
use crate::engine::{MatchingEngine, RegisterError};
use lookout_core::CaseId;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.lookout.Matcher1";
pub const OBJECT_PATH: &str = "/org/lookout/Matcher1";

/// D-Bus interface for the lookout matching daemon.
///
/// Bus name: org.lookout.Matcher1
/// Object path: /org/lookout/Matcher1
pub struct MatcherService {
    pub engine: Arc<MatchingEngine>,
    pub dispatcher: DispatcherHandle,
    pub cases: Arc<CaseDirectory>,
    pub frames: Arc<dyn FrameRepository>,
    pub blobs: Arc<dyn BlobStore>,
    pub max_active_cases: usize,
}

/// Map a failure to load a reference photo. An undecodable photo has no
/// detectable face, so it reports the same error as a faceless one.
fn reference_blob_error(path: &str, e: BlobError) -> zbus::fdo::Error {
    match e {
        BlobError::Decode(decode) => {
            tracing::debug!(path, error = %decode, "reference photo does not decode");
            register_error(RegisterError::NoFaceDetected)
        }
        BlobError::Io(e) => zbus::fdo::Error::IOError(format!("{path}: {e}")),
        other => zbus::fdo::Error::InvalidArgs(format!("{path}: {other}")),
    }
}

fn register_error(e: RegisterError) -> zbus::fdo::Error {
    match e {
        RegisterError::NoFaceDetected => zbus::fdo::Error::Failed(e.to_string()),
        RegisterError::CaseNotActive(_) => zbus::fdo::Error::InvalidArgs(e.to_string()),
        RegisterError::Store(inner) => {
            tracing::error!(error = %inner, "registration store failure");
            zbus::fdo::Error::Failed(format!("store: {inner}"))
        }
    }
}

fn join_error(e: tokio::task::JoinError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(format!("task failed: {e}"))
}

#[interface(name = "org.lookout.Matcher1")]
impl MatcherService {
    /// Register the face in a stored reference photo for an active case.
    /// Returns the representation reference.
    async fn register_image(&self, case_id: &str, blob_path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(case_id, blob_path, "register requested");
        let engine = Arc::clone(&self.engine);
        let blobs = Arc::clone(&self.blobs);
        let case_id = CaseId::from(case_id);
        let path = blob_path.to_string();

        let result = tokio::task::spawn_blocking(move || {
            let image = blobs
                .read_image(&path)
                .map_err(|e| reference_blob_error(&path, e))?
                .to_rgb8();
            engine.register(&image, &case_id).map_err(register_error)
        })
        .await
        .map_err(join_error)??;

        Ok(result.to_string())
    }

    /// Accept a camera frame for background matching. Returns the frame id.
    async fn submit_frame(&self, bytes: Vec<u8>) -> zbus::fdo::Result<String> {
        let dispatcher = self.dispatcher.clone();
        let id = tokio::task::spawn_blocking(move || dispatcher.submit_frame(&bytes))
            .await
            .map_err(join_error)?
            .map_err(|e| match e {
                IngestError::Saturated => {
                    tracing::warn!("frame rejected: ingestion queue full");
                    zbus::fdo::Error::LimitsExceeded(e.to_string())
                }
                other => {
                    tracing::error!(error = %other, "frame submission failed");
                    zbus::fdo::Error::Failed(other.to_string())
                }
            })?;
        Ok(id.to_string())
    }

    /// Mark a case active and record who reported it.
    async fn open_case(&self, case_id: &str, reporter: &str) -> zbus::fdo::Result<()> {
        let cases = Arc::clone(&self.cases);
        let case_id = CaseId::from(case_id);
        let reporter = UserId(reporter.to_string());
        tokio::task::spawn_blocking(move || cases.open_case(&case_id, &reporter))
            .await
            .map_err(join_error)?
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Close notification from the case owner. Never fails the caller.
    async fn case_closed(&self, case_id: &str) {
        let cases = Arc::clone(&self.cases);
        let id = CaseId::from(case_id);
        let outcome = tokio::task::spawn_blocking(move || cases.close_case(&id)).await;
        match outcome {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::error!(case_id, error = %e, "case close failed"),
            Err(e) => tracing::error!(case_id, error = %e, "case close task failed"),
        }
    }

    /// Processing state of a submitted frame, as JSON.
    async fn frame_status(&self, frame_id: &str) -> zbus::fdo::Result<String> {
        let frames = Arc::clone(&self.frames);
        let id = FrameId(frame_id.to_string());
        let frame = tokio::task::spawn_blocking(move || frames.get(&id))
            .await
            .map_err(join_error)?
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?
            .ok_or_else(|| zbus::fdo::Error::InvalidArgs(format!("unknown frame {frame_id}")))?;

        Ok(serde_json::json!({
            "id": frame.id,
            "state": frame.state,
            "processed": frame.processed(),
            "matched_case": frame.matched_case,
            "captured_at": frame.captured_at,
            "image_path": frame.image_path,
        })
        .to_string())
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let cases = Arc::clone(&self.cases);
        let max = self.max_active_cases;
        let (active, ready) = tokio::task::spawn_blocking(move || (cases.active_count(), cases.is_ready(max)))
            .await
            .map_err(join_error)?;

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "ready": ready,
            "active_cases": active,
            "max_cases": max,
            "cached_cases": self.engine.store().len(),
            "threshold": self.engine.threshold(),
            "queue_pending": self.dispatcher.pending(),
            "queue_depth": self.dispatcher.queue_depth(),
        })
        .to_string())
    }
}
