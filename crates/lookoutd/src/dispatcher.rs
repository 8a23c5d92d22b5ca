//! Frame ingestion: accept, acknowledge, match in the background.
//!
//! Submission only persists the upload and queues its id; a fixed pool of
//! worker threads drains the queue. The queue is bounded and a full queue
//! rejects new frames instead of growing.

use crate::blob::{BlobError, BlobStore};
use crate::collaborators::{
    CaseProvider, CollaboratorError, Frame, FrameId, FrameRepository, FrameState, Notification,
    NotificationSink,
};
use crate::engine::{MatchOutcome, MatchingEngine};
use chrono::Utc;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("ingestion queue is full")]
    Saturated,
    #[error("dispatcher is shut down")]
    Closed,
    #[error("blob: {0}")]
    Blob(#[from] BlobError),
    #[error("frame record: {0}")]
    Record(#[from] CollaboratorError),
}

#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub queue_depth: usize,
}

/// Everything a job touches, shared by the handle and every worker.
struct Pipeline {
    engine: Arc<MatchingEngine>,
    frames: Arc<dyn FrameRepository>,
    blobs: Arc<dyn BlobStore>,
    cases: Arc<dyn CaseProvider>,
    notifier: Arc<dyn NotificationSink>,
}

/// Clone-safe handle for submitting frames.
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<FrameId>,
    /// Shared with the workers; held here too so the queue stays open while
    /// no worker is running.
    _rx: Arc<Mutex<mpsc::Receiver<FrameId>>>,
    pipeline: Arc<Pipeline>,
}

impl DispatcherHandle {
    /// Persist an uploaded frame and queue it for matching.
    ///
    /// Returns as soon as the frame is recorded as Received.
    pub fn submit_frame(&self, bytes: &[u8]) -> Result<FrameId, IngestError> {
        let permit = self.tx.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(()) => IngestError::Saturated,
            mpsc::error::TrySendError::Closed(()) => IngestError::Closed,
        })?;

        let id = FrameId::generate();
        let image_path = format!("frames/{id}.{}", extension_for(bytes));
        self.pipeline.blobs.write(&image_path, bytes)?;

        let frame = Frame {
            id: id.clone(),
            image_path: image_path.clone(),
            captured_at: Utc::now(),
            state: FrameState::Received,
            matched_case: None,
        };
        if let Err(e) = self.pipeline.frames.insert(&frame) {
            if let Err(cleanup) = self.pipeline.blobs.delete(&image_path) {
                tracing::warn!(path = %image_path, error = %cleanup, "orphaned frame blob");
            }
            return Err(e.into());
        }

        permit.send(id.clone());
        tracing::debug!(frame_id = %id, bytes = bytes.len(), "frame accepted");
        Ok(id)
    }

    /// Re-queue frames a previous run left unfinished. Waits for capacity.
    pub async fn resume(&self, ids: Vec<FrameId>) -> Result<usize, IngestError> {
        let count = ids.len();
        for id in ids {
            self.tx.send(id).await.map_err(|_| IngestError::Closed)?;
        }
        if count > 0 {
            tracing::info!(count, "resumed unfinished frames");
        }
        Ok(count)
    }

    /// Frames queued and not yet picked up by a worker.
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn queue_depth(&self) -> usize {
        self.tx.max_capacity()
    }
}

fn extension_for(bytes: &[u8]) -> &'static str {
    image::guess_format(bytes)
        .ok()
        .and_then(|format| format.extensions_str().first().copied())
        .unwrap_or("bin")
}

/// Spawn the worker pool on dedicated OS threads.
pub fn spawn_dispatcher(
    config: DispatcherConfig,
    engine: Arc<MatchingEngine>,
    frames: Arc<dyn FrameRepository>,
    blobs: Arc<dyn BlobStore>,
    cases: Arc<dyn CaseProvider>,
    notifier: Arc<dyn NotificationSink>,
) -> std::io::Result<DispatcherHandle> {
    let (tx, rx) = mpsc::channel::<FrameId>(config.queue_depth.max(1));
    let rx = Arc::new(Mutex::new(rx));
    let pipeline = Arc::new(Pipeline { engine, frames, blobs, cases, notifier });

    for index in 0..config.workers {
        let rx = Arc::clone(&rx);
        let pipeline = Arc::clone(&pipeline);
        std::thread::Builder::new()
            .name(format!("lookout-worker-{index}"))
            .spawn(move || {
                tracing::debug!(worker = index, "worker started");
                loop {
                    let next = match rx.lock() {
                        Ok(mut queue) => queue.blocking_recv(),
                        Err(_) => {
                            tracing::error!(worker = index, "ingestion queue lock poisoned");
                            break;
                        }
                    };
                    let Some(id) = next else { break };
                    pipeline.run(&id);
                }
                tracing::debug!(worker = index, "worker exiting");
            })?;
    }

    tracing::info!(workers = config.workers, queue_depth = config.queue_depth, "dispatcher started");
    Ok(DispatcherHandle { tx, _rx: rx, pipeline })
}

#[derive(Error, Debug)]
enum JobError {
    #[error("frame {0} has no record")]
    Missing(FrameId),
    #[error(transparent)]
    Record(#[from] CollaboratorError),
    #[error(transparent)]
    Blob(#[from] BlobError),
}

impl Pipeline {
    /// Process one frame. The frame always ends Completed, whatever happens
    /// in between.
    fn run(&self, id: &FrameId) {
        match self.frames.mark_processing(id) {
            Ok(()) => {}
            Err(CollaboratorError::NotFound(_)) => {
                tracing::debug!(frame_id = %id, "frame missing or already completed; skipping");
                return;
            }
            Err(e) => tracing::warn!(frame_id = %id, error = %e, "failed to mark frame processing"),
        }

        let outcome = match catch_unwind(AssertUnwindSafe(|| self.evaluate(id))) {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                tracing::warn!(frame_id = %id, error = %e, "match task failed");
                None
            }
            Err(_) => {
                tracing::error!(frame_id = %id, "match task panicked");
                None
            }
        };

        let matched = outcome.map(|m| m.case_id);
        if let Err(e) = self.frames.complete(id, matched.as_ref()) {
            tracing::error!(frame_id = %id, error = %e, "failed to complete frame");
        }
    }

    fn evaluate(&self, id: &FrameId) -> Result<Option<MatchOutcome>, JobError> {
        let frame = self.frames.get(id)?.ok_or_else(|| JobError::Missing(id.clone()))?;
        let image = self.blobs.read_image(&frame.image_path)?.to_rgb8();

        let Some(outcome) = self.engine.match_image(&image) else {
            return Ok(None);
        };
        self.notify(&frame, &outcome);
        Ok(Some(outcome))
    }

    fn notify(&self, frame: &Frame, outcome: &MatchOutcome) {
        let Some(user) = self.cases.reporter_of(&outcome.case_id) else {
            tracing::warn!(case_id = %outcome.case_id, frame_id = %frame.id, "matched case has no reporter");
            return;
        };
        let notification = Notification {
            user,
            case_id: outcome.case_id.clone(),
            image_path: frame.image_path.clone(),
            detected_at: frame.captured_at,
            similarity: outcome.similarity,
        };
        if let Err(e) = self.notifier.emit(&notification) {
            tracing::error!(case_id = %outcome.case_id, frame_id = %frame.id, error = %e, "notification failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::FsBlobStore;
    use crate::cases::CaseDirectory;
    use crate::db::Database;
    use crate::store::RepresentationStore;
    use image::RgbImage;
    use lookout_core::{BoundingBox, DetectorError, FaceDetect, LinearScanMatcher};
    use std::time::{Duration, Instant};

    struct NoFaces;

    impl FaceDetect for NoFaces {
        fn detect(&self, _: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
            Ok(vec![])
        }
    }

    struct Panicking;

    impl FaceDetect for Panicking {
        fn detect(&self, _: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
            panic!("detector exploded")
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        db: Arc<Database>,
        blobs: Arc<FsBlobStore>,
        handle: DispatcherHandle,
    }

    fn fixture(detector: Box<dyn FaceDetect>, workers: usize, queue_depth: usize) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let blobs = Arc::new(FsBlobStore::new(tmp.path().join("blobs")).unwrap());
        let store = Arc::new(RepresentationStore::load(tmp.path()).unwrap());
        let cases = Arc::new(CaseDirectory::new(Arc::clone(&db)));
        let engine = Arc::new(MatchingEngine::new(
            detector,
            Box::new(LinearScanMatcher),
            store,
            cases.clone(),
            0.6,
        ));
        let handle = spawn_dispatcher(
            DispatcherConfig { workers, queue_depth },
            engine,
            db.clone(),
            blobs.clone(),
            cases,
            db.clone(),
        )
        .unwrap();
        Fixture { _tmp: tmp, db, blobs, handle }
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut out = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(RgbImage::new(width, height))
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn wait_completed(db: &Database, id: &FrameId) -> Frame {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let frame = db.get(id).unwrap().unwrap();
            if frame.processed() || Instant::now() > deadline {
                return frame;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_submit_persists_blob_and_record() {
        let fx = fixture(Box::new(NoFaces), 0, 4);
        let bytes = png(16, 16);
        let id = fx.handle.submit_frame(&bytes).unwrap();

        let frame = fx.db.get(&id).unwrap().unwrap();
        assert_eq!(frame.state, FrameState::Received);
        assert!(frame.image_path.ends_with(".png"));
        assert_eq!(fx.blobs.read(&frame.image_path).unwrap(), bytes);
        assert_eq!(fx.handle.pending(), 1);
    }

    #[test]
    fn test_full_queue_rejects_without_persisting() {
        let fx = fixture(Box::new(NoFaces), 0, 2);
        fx.handle.submit_frame(&png(4, 4)).unwrap();
        fx.handle.submit_frame(&png(4, 4)).unwrap();

        let err = fx.handle.submit_frame(&png(4, 4)).unwrap_err();
        assert!(matches!(err, IngestError::Saturated));
        assert_eq!(fx.db.unfinished().unwrap().len(), 2);
    }

    #[test]
    fn test_faceless_frame_completes_without_match() {
        let fx = fixture(Box::new(NoFaces), 1, 4);
        let id = fx.handle.submit_frame(&png(32, 32)).unwrap();
        let frame = wait_completed(&fx.db, &id);
        assert!(frame.processed());
        assert_eq!(frame.matched_case, None);
    }

    #[test]
    fn test_undecodable_bytes_still_complete() {
        let fx = fixture(Box::new(NoFaces), 1, 4);
        let id = fx.handle.submit_frame(b"definitely not an image").unwrap();
        let frame = wait_completed(&fx.db, &id);
        assert!(frame.image_path.ends_with(".bin"));
        assert!(frame.processed());
        assert_eq!(frame.matched_case, None);
    }

    #[test]
    fn test_panicking_job_still_completes() {
        let fx = fixture(Box::new(Panicking), 1, 4);
        let id = fx.handle.submit_frame(&png(32, 32)).unwrap();
        assert!(wait_completed(&fx.db, &id).processed());

        // The worker survives and keeps draining.
        let next = fx.handle.submit_frame(&png(32, 32)).unwrap();
        assert!(wait_completed(&fx.db, &next).processed());
    }

    #[tokio::test]
    async fn test_resume_requeues_unfinished() {
        let fx = fixture(Box::new(NoFaces), 1, 4);
        let frame = Frame {
            id: FrameId("left-over".into()),
            image_path: "frames/left-over.png".into(),
            captured_at: Utc::now(),
            state: FrameState::Processing,
            matched_case: None,
        };
        fx.blobs.write(&frame.image_path, &png(8, 8)).unwrap();
        fx.db.insert(&frame).unwrap();

        let ids = fx.db.unfinished().unwrap();
        assert_eq!(fx.handle.resume(ids).await.unwrap(), 1);

        let db = Arc::clone(&fx.db);
        let done = tokio::task::spawn_blocking(move || wait_completed(&db, &frame.id))
            .await
            .unwrap();
        assert!(done.processed());
    }
}
