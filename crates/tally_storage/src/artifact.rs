#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;

use tally_kernel_contracts::report::ArtifactKey;
use tally_kernel_contracts::Validate;

#[derive(Debug, Error)]
pub enum ArtifactStoreError {
    #[error("artifact store i/o failure for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },
    #[error("artifact not found: {key}")]
    NotFound { key: String },
    #[error("invalid artifact key: {key}")]
    InvalidKey { key: String },
}

/// Blob storage for rendered report artifacts.
///
/// A key is only authoritative once a committed report row references it; before
/// that a `put` to the same key replaces the previous bytes.
pub trait ArtifactStore: Send + Sync {
    fn put(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<(), ArtifactStoreError>;
    fn get(&self, key: &ArtifactKey) -> Result<Vec<u8>, ArtifactStoreError>;
    fn exists(&self, key: &ArtifactKey) -> Result<bool, ArtifactStoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }

    /// Replaces stored bytes without any checks. Used to simulate out-of-band tampering.
    pub fn overwrite_raw(&self, key: &ArtifactKey, bytes: Vec<u8>) {
        self.blobs.lock().insert(key.to_string(), bytes);
    }
}

impl ArtifactStore for InMemoryArtifactStore {
    fn put(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<(), ArtifactStoreError> {
        self.blobs.lock().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, key: &ArtifactKey) -> Result<Vec<u8>, ArtifactStoreError> {
        self.blobs
            .lock()
            .get(key.as_str())
            .cloned()
            .ok_or_else(|| ArtifactStoreError::NotFound {
                key: key.to_string(),
            })
    }

    fn exists(&self, key: &ArtifactKey) -> Result<bool, ArtifactStoreError> {
        Ok(self.blobs.lock().contains_key(key.as_str()))
    }
}

/// Artifacts as files under `root`, one path segment per key segment.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &ArtifactKey) -> Result<PathBuf, ArtifactStoreError> {
        key.validate().map_err(|_| ArtifactStoreError::InvalidKey {
            key: key.to_string(),
        })?;
        let mut p = self.root.clone();
        for seg in key.segments() {
            p.push(seg);
        }
        Ok(p)
    }
}

fn io_err(key: &ArtifactKey) -> impl FnOnce(io::Error) -> ArtifactStoreError + '_ {
    move |source| ArtifactStoreError::Io {
        key: key.to_string(),
        source,
    }
}

impl ArtifactStore for FsArtifactStore {
    fn put(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<(), ArtifactStoreError> {
        let path = self.path_for(key)?;
        let parent = path.parent().ok_or_else(|| ArtifactStoreError::InvalidKey {
            key: key.to_string(),
        })?;
        fs::create_dir_all(parent).map_err(io_err(key))?;
        // Unique temp name per writer; concurrent puts to one key each rename their own file.
        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(io_err(key))?;
        tmp.write_all(bytes).map_err(io_err(key))?;
        tmp.persist(&path).map_err(|e| io_err(key)(e.error))?;
        Ok(())
    }

    fn get(&self, key: &ArtifactKey) -> Result<Vec<u8>, ArtifactStoreError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ArtifactStoreError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(io_err(key)(e)),
        }
    }

    fn exists(&self, key: &ArtifactKey) -> Result<bool, ArtifactStoreError> {
        let path = self.path_for(key)?;
        Ok(path.is_file())
    }
}
