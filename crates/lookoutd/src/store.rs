//! Durable per-case cache of registered face crops.
//!
//! Layout under the store root:
//!
//! ```text
//! representations.json        index: case id -> ordered crop paths
//! crops/<case_id>/<uuid>.png  one artifact per registered reference photo
//! ```
//!
//! Every mutation (artifact write, index update, index persist) runs under
//! the write half of one `RwLock`, so mutations never interleave. Readers
//! clone a snapshot under the read half. The index is replaced on disk by
//! write-to-temp, fsync, rename: a reader after a crash sees either the old or
//! the new mapping, never a torn one.

use lookout_core::{CaseId, FaceCrop};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

const INDEX_FILE: &str = "representations.json";
const INDEX_VERSION: u32 = 1;
const CROPS_DIR: &str = "crops";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("encode crop: {0}")]
    Encode(#[from] image::ImageError),
    #[error("serialize index: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("case id {0:?} is not usable as a directory name")]
    InvalidCaseId(String),
    #[error("append for case {0} rejected")]
    Rejected(CaseId),
    #[error("store lock poisoned")]
    LockPoisoned,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io { path: path.display().to_string(), source }
}

/// Stable on-disk reference to one stored crop, relative to the store root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepresentationRef(String);

impl RepresentationRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RepresentationRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

type Index = BTreeMap<CaseId, Vec<RepresentationRef>>;

#[derive(Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    cases: Index,
}

pub struct RepresentationStore {
    root: PathBuf,
    index: RwLock<Index>,
}

impl RepresentationStore {
    /// Open the store rooted at `root`, reading the persisted index.
    ///
    /// A missing index starts empty. An unreadable or corrupt index is logged
    /// and also starts empty; only failing to create the root is an error.
    pub fn load(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join(CROPS_DIR)).map_err(io_err(&root))?;

        let index_path = root.join(INDEX_FILE);
        let index = match fs::read(&index_path) {
            Ok(bytes) => match serde_json::from_slice::<IndexFile>(&bytes) {
                Ok(file) if file.version == INDEX_VERSION => file.cases,
                Ok(file) => {
                    tracing::error!(
                        path = %index_path.display(),
                        version = file.version,
                        "unsupported representation index version; starting empty"
                    );
                    Index::new()
                }
                Err(e) => {
                    tracing::error!(path = %index_path.display(), error = %e, "representation index corrupt; starting empty");
                    Index::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Index::new(),
            Err(e) => {
                tracing::error!(path = %index_path.display(), error = %e, "representation index unreadable; starting empty");
                Index::new()
            }
        };

        tracing::info!(
            root = %root.display(),
            cases = index.len(),
            representations = index.values().map(Vec::len).sum::<usize>(),
            "representation store loaded"
        );

        Ok(Self { root, index: RwLock::new(index) })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Index>, StoreError> {
        self.index.read().map_err(|_| StoreError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Index>, StoreError> {
        self.index.write().map_err(|_| StoreError::LockPoisoned)
    }

    /// Store `crop` under `case_id` unconditionally.
    pub fn append(&self, case_id: &CaseId, crop: &FaceCrop) -> Result<RepresentationRef, StoreError> {
        self.append_if(case_id, crop, || true)
    }

    /// Store `crop` under `case_id` if `guard` still holds.
    ///
    /// `guard` runs inside the exclusive section, so a concurrent
    /// [`delete`](Self::delete) cannot slip between the check and the write.
    pub fn append_if(
        &self,
        case_id: &CaseId,
        crop: &FaceCrop,
        guard: impl FnOnce() -> bool,
    ) -> Result<RepresentationRef, StoreError> {
        let case_dir = self.case_dir(case_id)?;
        let mut index = self.write()?;
        if !guard() {
            return Err(StoreError::Rejected(case_id.clone()));
        }

        let file_name = format!("{}.png", uuid::Uuid::new_v4());
        fs::create_dir_all(&case_dir).map_err(io_err(&case_dir))?;
        let artifact = case_dir.join(&file_name);
        let png = crop.encode_png()?;
        write_atomic(&artifact, &png)?;

        let reference = RepresentationRef(format!("{CROPS_DIR}/{case_id}/{file_name}"));
        index.entry(case_id.clone()).or_default().push(reference.clone());

        if let Err(e) = self.persist(&index) {
            tracing::error!(case_id = %case_id, error = %e, "failed to persist representation index after append");
        }
        tracing::debug!(case_id = %case_id, reference = %reference, "representation stored");
        Ok(reference)
    }

    /// Stored references for `case_id`, in registration order. Empty if unknown.
    pub fn entries_for(&self, case_id: &CaseId) -> Vec<RepresentationRef> {
        match self.read() {
            Ok(index) => index.get(case_id).cloned().unwrap_or_default(),
            Err(e) => {
                tracing::error!(case_id = %case_id, error = %e, "representation index unavailable");
                Vec::new()
            }
        }
    }

    /// Load a stored crop. Missing or unreadable artifacts yield `None`.
    pub fn load_representation(&self, reference: &RepresentationRef) -> Option<FaceCrop> {
        let path = self.root.join(&reference.0);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) => {
                tracing::debug!(reference = %reference, error = %e, "skipping missing representation");
                return None;
            }
        };
        match FaceCrop::decode(&bytes) {
            Ok(crop) => Some(crop),
            Err(e) => {
                tracing::debug!(reference = %reference, error = %e, "skipping unreadable representation");
                None
            }
        }
    }

    /// Remove `case_id` and all of its artifacts. Deleting an absent key is a no-op.
    ///
    /// The key is dropped from the index even if the artifact directory could
    /// not be removed; that failure is still returned.
    pub fn delete(&self, case_id: &CaseId) -> Result<(), StoreError> {
        let mut index = self.write()?;

        let removed = index.remove(case_id);
        // An id that is not a usable directory name never got a crop directory.
        let dir_result = match self.case_dir(case_id) {
            Ok(case_dir) => match fs::remove_dir_all(&case_dir) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(io_err(&case_dir)(e)),
                _ => Ok(()),
            },
            Err(_) => Ok(()),
        };

        if let Some(refs) = &removed {
            self.persist(&index)?;
            tracing::info!(case_id = %case_id, removed = refs.len(), "representations purged");
        }
        dir_result
    }

    /// Case ids currently holding representations.
    pub fn case_ids(&self) -> Vec<CaseId> {
        self.read().map(|index| index.keys().cloned().collect()).unwrap_or_default()
    }

    /// Number of cases in the cache.
    pub fn len(&self) -> usize {
        self.read().map(|index| index.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist the current mapping. Called at shutdown.
    pub fn flush(&self) -> Result<(), StoreError> {
        let index = self.write()?;
        self.persist(&index)
    }

    fn case_dir(&self, case_id: &CaseId) -> Result<PathBuf, StoreError> {
        let id = case_id.as_str();
        let usable = !id.is_empty()
            && id != "."
            && id != ".."
            && !id.contains(['/', '\\', '\0']);
        if !usable {
            return Err(StoreError::InvalidCaseId(id.to_string()));
        }
        Ok(self.root.join(CROPS_DIR).join(id))
    }

    fn persist(&self, index: &Index) -> Result<(), StoreError> {
        let file = IndexFile { version: INDEX_VERSION, cases: index.clone() };
        let bytes = serde_json::to_vec_pretty(&file)?;
        write_atomic(&self.root.join(INDEX_FILE), &bytes)
    }
}

/// Write `bytes` to `path` via a sibling temp file, fsync, then rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp).map_err(io_err(&tmp))?;
    file.write_all(bytes).map_err(io_err(&tmp))?;
    file.sync_all().map_err(io_err(&tmp))?;
    drop(file);
    fs::rename(&tmp, path).map_err(io_err(path))
}
