//! Content-addressed packaging of a directory of source files.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub mod pack;

pub use pack::PackArchiver;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Source directory {0} has no files")]
    EmptySource(PathBuf),

    #[error("Archive size {size} is below the minimum of {minimum} bytes")]
    TooSmall { size: u64, minimum: u64 },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Archive lists {matched} of {expected} staged files")]
    UnmatchedEntries { expected: usize, matched: usize },

    #[error("Archiver task failed: {0}")]
    Task(String),
}

impl ArchiveError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A file packed into an archive, with its own content id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub file_name: String,
    pub size: u64,
    pub content_id: String,
}

/// Result of packing one directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveDescriptor {
    pub archive_name: String,
    pub archive_path: PathBuf,
    pub archive_size: u64,
    /// md5 of the archive bytes, lowercase hex.
    pub checksum: String,
    pub content_id: String,
    pub piece_id: String,
    /// Packed files in archive order.
    pub entries: Vec<ArchiveEntry>,
}

impl ArchiveDescriptor {
    pub fn entry(&self, file_name: &str) -> Option<&ArchiveEntry> {
        self.entries.iter().find(|e| e.file_name == file_name)
    }
}

#[async_trait]
pub trait Archiver: Send + Sync {
    /// Pack every regular file of `source_dir` into one archive under `out_dir`.
    async fn bundle(&self, source_dir: &Path, out_dir: &Path) -> Result<ArchiveDescriptor, ArchiveError>;
}
