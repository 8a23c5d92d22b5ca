use lookout_core::DetectorConfig;
use std::path::PathBuf;

/// Which message bus the service registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    System,
    Session,
}

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Root for the representation store, blobs and database (default: $XDG_DATA_HOME/lookout).
    pub data_dir: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Histogram similarity at or above which a frame matches a case.
    pub similarity_threshold: f32,
    /// Upper bound of the advisory readiness gate.
    pub max_active_cases: usize,
    pub detector: DetectorConfig,
    /// Worker threads draining the ingestion queue.
    pub workers: usize,
    /// Frames that may wait for a worker before submissions are rejected.
    pub queue_depth: usize,
    pub bus: BusKind,
}

impl Config {
    /// Load configuration from `LOOKOUT_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("LOOKOUT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::var("XDG_DATA_HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| {
                        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                        PathBuf::from(home).join(".local/share")
                    })
                    .join("lookout")
            });

        let model_dir = std::env::var("LOOKOUT_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| lookout_core::default_model_dir());

        let db_path = std::env::var("LOOKOUT_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("lookout.db"));

        let defaults = DetectorConfig::default();
        let detector = DetectorConfig {
            confidence_threshold: env_f32("LOOKOUT_DETECT_CONFIDENCE", defaults.confidence_threshold),
            nms_threshold: env_f32("LOOKOUT_DETECT_NMS", defaults.nms_threshold),
            min_face_size: env_f32("LOOKOUT_MIN_FACE_SIZE", defaults.min_face_size),
            min_neighbors: env_usize("LOOKOUT_MIN_NEIGHBORS", defaults.min_neighbors),
        };

        let bus = match std::env::var("LOOKOUT_BUS").as_deref() {
            Ok("session") => BusKind::Session,
            _ => BusKind::System,
        };

        Self {
            data_dir,
            model_dir,
            db_path,
            similarity_threshold: env_f32("LOOKOUT_SIMILARITY_THRESHOLD", 0.6),
            max_active_cases: env_usize("LOOKOUT_MAX_ACTIVE_CASES", 20),
            detector,
            workers: env_usize("LOOKOUT_WORKERS", 2).max(1),
            queue_depth: env_usize("LOOKOUT_QUEUE_DEPTH", 32).max(1),
            bus,
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join(lookout_core::SCRFD_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    pub fn blob_root(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
