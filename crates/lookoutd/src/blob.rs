//! Raw upload storage.

use image::DynamicImage;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("blob path escapes the store root: {0}")]
    InvalidPath(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("decode: {0}")]
    Decode(#[from] image::ImageError),
}

/// Generic blob storage for uploaded images, addressed by relative path.
pub trait BlobStore: Send + Sync {
    fn read(&self, path: &str) -> Result<Vec<u8>, BlobError>;
    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), BlobError>;
    fn delete(&self, path: &str) -> Result<(), BlobError>;

    /// Read and decode an image blob.
    fn read_image(&self, path: &str) -> Result<DynamicImage, BlobError> {
        let bytes = self.read(path)?;
        Ok(image::load_from_memory(&bytes)?)
    }
}

/// Blob store backed by a directory on the local filesystem.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, BlobError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Resolve a relative blob path, refusing absolute paths and `..`.
    fn resolve(&self, path: &str) -> Result<PathBuf, BlobError> {
        let rel = Path::new(path);
        let clean = rel.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if path.is_empty() || !clean {
            return Err(BlobError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

impl BlobStore for FsBlobStore {
    fn read(&self, path: &str) -> Result<Vec<u8>, BlobError> {
        let full = self.resolve(path)?;
        std::fs::read(&full).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => BlobError::NotFound(path.to_string()),
            _ => BlobError::Io(e),
        })
    }

    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), BlobError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&full, bytes)?;
        Ok(())
    }

    fn delete(&self, path: &str) -> Result<(), BlobError> {
        let full = self.resolve(path)?;
        match std::fs::remove_file(&full) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(BlobError::Io(e)),
            _ => Ok(()),
        }
    }
}
