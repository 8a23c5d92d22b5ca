//! End-to-end scenarios: register, submit, close, restart.
//!
//! Runs the real store, dispatcher and SQLite collaborators against a test
//! detector that reports the lit region of a black canvas as the face, so no
//! model files are needed.

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use lookout_core::{BoundingBox, CaseId, DetectorError, FaceDetect, LinearScanMatcher};
use lookoutd::blob::{BlobStore, FsBlobStore};
use lookoutd::cases::CaseDirectory;
use lookoutd::collaborators::{Frame, FrameId, FrameRepository, UserId};
use lookoutd::db::Database;
use lookoutd::dispatcher::{spawn_dispatcher, DispatcherConfig, DispatcherHandle};
use lookoutd::engine::{MatchingEngine, RegisterError};
use lookoutd::lifecycle;
use lookoutd::store::RepresentationStore;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct BrightRegion;

impl FaceDetect for BrightRegion {
    fn detect(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let mut bounds: Option<(u32, u32, u32, u32)> = None;
        for (x, y, p) in image.enumerate_pixels() {
            if p.0 == [0, 0, 0] {
                continue;
            }
            bounds = Some(match bounds {
                None => (x, y, x, y),
                Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
            });
        }
        Ok(bounds
            .map(|(x0, y0, x1, y1)| BoundingBox {
                x: x0 as f32,
                y: y0 as f32,
                width: (x1 - x0 + 1) as f32,
                height: (y1 - y0 + 1) as f32,
                confidence: 0.99,
            })
            .into_iter()
            .collect())
    }
}

struct Harness {
    db: Arc<Database>,
    cases: Arc<CaseDirectory>,
    store: Arc<RepresentationStore>,
    blobs: Arc<FsBlobStore>,
    engine: Arc<MatchingEngine>,
    dispatcher: DispatcherHandle,
}

impl Harness {
    fn start(root: &Path, workers: usize) -> Self {
        let db = Arc::new(Database::open(&root.join("lookout.db")).unwrap());
        let store = Arc::new(RepresentationStore::load(root).unwrap());
        let blobs = Arc::new(FsBlobStore::new(root.join("blobs")).unwrap());
        let cases = Arc::new(CaseDirectory::new(Arc::clone(&db)));
        lifecycle::install(cases.as_ref(), Arc::clone(&store));
        lifecycle::reconcile(cases.as_ref(), &store);

        let engine = Arc::new(MatchingEngine::new(
            Box::new(BrightRegion),
            Box::new(LinearScanMatcher),
            Arc::clone(&store),
            cases.clone(),
            0.6,
        ));
        let dispatcher = spawn_dispatcher(
            DispatcherConfig { workers, queue_depth: 64 },
            Arc::clone(&engine),
            db.clone(),
            blobs.clone(),
            cases.clone(),
            db.clone(),
        )
        .unwrap();

        Self { db, cases, store, blobs, engine, dispatcher }
    }

    fn open(&self, case: &str, reporter: &str) {
        self.cases.open_case(&CaseId::from(case), &UserId(reporter.into())).unwrap();
    }

    /// Upload a reference photo to the blob store and register it, as the
    /// D-Bus handler does.
    fn register(&self, case: &str, photo: &RgbImage) -> Result<(), RegisterError> {
        let path = format!("uploads/{case}-{}.png", self.store.len());
        self.blobs.write(&path, &png(photo)).unwrap();
        let image = self.blobs.read_image(&path).unwrap().to_rgb8();
        self.engine.register(&image, &CaseId::from(case)).map(|_| ())
    }

    fn wait(&self, id: &FrameId) -> Frame {
        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            let frame = self.db.get(id).unwrap().unwrap();
            if frame.processed() {
                return frame;
            }
            assert!(Instant::now() < deadline, "frame {id} never completed");
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

fn face(seed: u32) -> RgbImage {
    RgbImage::from_fn(32, 32, |x, y| {
        Rgb([
            ((x * seed + y * 3) % 240 + 10) as u8,
            ((y * seed + x) % 200 + 20) as u8,
            ((x + y) * 5 % 180 + 30) as u8,
        ])
    })
}

fn scene(face: &RgbImage, at: (i64, i64)) -> RgbImage {
    let mut canvas = RgbImage::new(160, 120);
    image::imageops::replace(&mut canvas, face, at.0, at.1);
    canvas
}

fn png(image: &RgbImage) -> Vec<u8> {
    let mut out = std::io::Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image.clone())
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

#[test]
fn register_then_submit_matches_and_notifies_reporter() {
    let tmp = tempfile::tempdir().unwrap();
    let h = Harness::start(tmp.path(), 2);
    h.open("case-1", "alice");
    h.register("case-1", &scene(&face(7), (10, 10))).unwrap();

    let id = h.dispatcher.submit_frame(&png(&scene(&face(7), (90, 60)))).unwrap();
    let frame = h.wait(&id);
    assert_eq!(frame.matched_case, Some(CaseId::from("case-1")));

    let notes = h.db.notifications_for(&UserId("alice".into())).unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].case_id, CaseId::from("case-1"));
    assert_eq!(notes[0].image_path, frame.image_path);
    assert_eq!(notes[0].detected_at, frame.captured_at);
    assert!(notes[0].similarity >= 0.6);
}

#[test]
fn closed_case_no_longer_matches() {
    let tmp = tempfile::tempdir().unwrap();
    let h = Harness::start(tmp.path(), 1);
    h.open("case-1", "alice");
    h.register("case-1", &scene(&face(7), (0, 0))).unwrap();

    assert!(h.cases.close_case(&CaseId::from("case-1")).unwrap());
    assert!(h.store.entries_for(&CaseId::from("case-1")).is_empty());

    let id = h.dispatcher.submit_frame(&png(&scene(&face(7), (0, 0)))).unwrap();
    assert_eq!(h.wait(&id).matched_case, None);
    assert!(h.db.notifications_for(&UserId("alice".into())).unwrap().is_empty());
}

#[test]
fn register_against_closed_case_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let h = Harness::start(tmp.path(), 1);
    h.open("case-1", "alice");
    h.cases.close_case(&CaseId::from("case-1")).unwrap();

    let err = h.register("case-1", &scene(&face(7), (0, 0))).unwrap_err();
    assert!(matches!(err, RegisterError::CaseNotActive(_)));
    assert!(h.store.is_empty());
}

#[test]
fn faceless_and_garbage_frames_complete_without_match() {
    let tmp = tempfile::tempdir().unwrap();
    let h = Harness::start(tmp.path(), 1);
    h.open("case-1", "alice");
    h.register("case-1", &scene(&face(7), (0, 0))).unwrap();

    let blank = h.dispatcher.submit_frame(&png(&RgbImage::new(64, 64))).unwrap();
    let garbage = h.dispatcher.submit_frame(b"\x00\x01 not a picture").unwrap();

    assert_eq!(h.wait(&blank).matched_case, None);
    assert_eq!(h.wait(&garbage).matched_case, None);
}

#[test]
fn concurrent_submissions_all_complete() {
    let tmp = tempfile::tempdir().unwrap();
    let h = Arc::new(Harness::start(tmp.path(), 4));
    h.open("case-a", "alice");
    h.open("case-b", "bob");
    h.register("case-a", &scene(&face(7), (5, 5))).unwrap();

    let registrar = {
        let h = Arc::clone(&h);
        std::thread::spawn(move || h.register("case-b", &scene(&face(13), (40, 40))))
    };

    let submitters: Vec<_> = (0..8)
        .map(|i| {
            let h = Arc::clone(&h);
            std::thread::spawn(move || {
                h.dispatcher
                    .submit_frame(&png(&scene(&face(7), (i * 10, i * 5))))
                    .unwrap()
            })
        })
        .collect();

    registrar.join().unwrap().unwrap();
    let ids: Vec<FrameId> = submitters.into_iter().map(|t| t.join().unwrap()).collect();

    for id in &ids {
        let frame = h.wait(id);
        assert!(frame.processed());
        assert_eq!(frame.matched_case, Some(CaseId::from("case-a")));
    }
    assert_eq!(h.db.notifications_for(&UserId("alice".into())).unwrap().len(), ids.len());
    assert_eq!(h.store.entries_for(&CaseId::from("case-b")).len(), 1);
}

#[test]
fn restart_purges_cases_closed_while_down() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let h = Harness::start(tmp.path(), 1);
        h.open("keep", "alice");
        h.open("drop", "bob");
        h.register("keep", &scene(&face(7), (0, 0))).unwrap();
        h.register("drop", &scene(&face(13), (0, 0))).unwrap();
        h.store.flush().unwrap();
    }

    // Close behind the daemon's back: no hook is subscribed here.
    let db = Database::open(&tmp.path().join("lookout.db")).unwrap();
    assert!(db.close_case(&CaseId::from("drop")).unwrap());
    drop(db);

    let h = Harness::start(tmp.path(), 1);
    assert_eq!(h.store.case_ids(), vec![CaseId::from("keep")]);
    assert_eq!(h.store.entries_for(&CaseId::from("keep")).len(), 1);
}

#[test]
fn unfinished_frames_are_resumed_after_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let pending = {
        let h = Harness::start(tmp.path(), 0);
        h.open("case-1", "alice");
        h.register("case-1", &scene(&face(7), (0, 0))).unwrap();
        h.dispatcher.submit_frame(&png(&scene(&face(7), (30, 30)))).unwrap()
    };

    let h = Harness::start(tmp.path(), 1);
    let unfinished = h.db.unfinished().unwrap();
    assert_eq!(unfinished, vec![pending.clone()]);

    let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
    runtime.block_on(h.dispatcher.resume(unfinished)).unwrap();
    let frame = h.wait(&pending);
    assert_eq!(frame.matched_case, Some(CaseId::from("case-1")));

    let notes = h.db.notifications_for(&UserId("alice".into())).unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].detected_at, frame.captured_at);
}
