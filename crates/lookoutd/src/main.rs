use anyhow::{Context, Result};
use lookout_core::{LinearScanMatcher, ScrfdDetector};
use lookoutd::blob::FsBlobStore;
use lookoutd::cases::CaseDirectory;
use lookoutd::collaborators::FrameRepository;
use lookoutd::config::{BusKind, Config};
use lookoutd::db::Database;
use lookoutd::dbus_interface::{MatcherService, BUS_NAME, OBJECT_PATH};
use lookoutd::dispatcher::{spawn_dispatcher, DispatcherConfig};
use lookoutd::engine::MatchingEngine;
use lookoutd::lifecycle;
use lookoutd::store::RepresentationStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("lookoutd starting");

    let config = Config::from_env();

    // Fail fast: no point accepting frames without a detector.
    let scrfd_path = config.scrfd_model_path();
    let detector = ScrfdDetector::load(&scrfd_path, config.detector)
        .with_context(|| format!("loading SCRFD model from {scrfd_path}"))?;
    tracing::info!(path = %scrfd_path, "SCRFD detector loaded");

    let store = Arc::new(
        RepresentationStore::load(&config.data_dir).context("opening representation store")?,
    );
    let blobs = Arc::new(FsBlobStore::new(config.blob_root()).context("opening blob store")?);
    let db = Arc::new(Database::open(&config.db_path).context("opening database")?);
    tracing::info!(path = %config.db_path.display(), "database opened");

    let cases = Arc::new(CaseDirectory::new(Arc::clone(&db)));
    lifecycle::install(cases.as_ref(), Arc::clone(&store));
    lifecycle::reconcile(cases.as_ref(), &store);

    let engine = Arc::new(MatchingEngine::new(
        Box::new(detector),
        Box::new(LinearScanMatcher),
        Arc::clone(&store),
        cases.clone(),
        config.similarity_threshold,
    ));

    let dispatcher = spawn_dispatcher(
        DispatcherConfig { workers: config.workers, queue_depth: config.queue_depth },
        Arc::clone(&engine),
        db.clone(),
        blobs.clone(),
        cases.clone(),
        db.clone(),
    )
    .context("spawning ingestion workers")?;

    let unfinished = db.unfinished().context("listing unfinished frames")?;
    dispatcher.resume(unfinished).await?;

    let service = MatcherService {
        engine,
        dispatcher,
        cases,
        frames: db.clone(),
        blobs,
        max_active_cases: config.max_active_cases,
    };

    let builder = match config.bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(
        bus = ?config.bus,
        threshold = config.similarity_threshold,
        workers = config.workers,
        "lookoutd ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("lookoutd shutting down");

    if let Err(e) = store.flush() {
        tracing::error!(error = %e, "final representation index write failed");
    }

    Ok(())
}
