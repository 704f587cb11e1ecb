//! Persistent revisioned bundle cache for Carrack.
//!
//! This crate provides the storage layer: `BundleCache` owns a cache root
//! and the archives inside it, `BundleArchive` persists one bundle's state
//! and its ordered list of content `Revision`s across process restarts, and
//! `RevisionContent` abstracts packed (tar) versus exploded (directory)
//! bundle content. Archive state lives in a consolidated `bundle.info` file
//! written atomically with an embedded blake3 checksum; a legacy one-file-
//! per-field layout is still read as a fallback.

pub mod archive;
pub mod cache;
pub mod content;
pub mod layout;
pub mod location;
pub mod revision;

pub use archive::{BundleArchive, PersistentState};
pub use cache::BundleCache;
pub use content::RevisionContent;
pub use layout::{CacheLayout, DEFAULT_BUFFER_SIZE};
pub use location::{percent_decode, LocationKind, FILE_PROTOCOL, INPUTSTREAM_PROTOCOL, REFERENCE_PROTOCOL};
pub use revision::{Revision, RevisionKind};

use std::path::Path;
use thiserror::Error;

/// Fsync a directory to ensure that a preceding `rename()` is durable.
///
/// On Linux with ext4 `data=ordered` (the default), renames are usually
/// durable without an explicit dir fsync, but POSIX does not guarantee this.
/// Calling `fsync()` on the parent directory makes the rename durable on
/// all filesystems and mount configurations.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("manifest error: {0}")]
    Manifest(#[from] carrack_manifest::ManifestError),
    #[error("unsupported bundle location: {0}")]
    UnsupportedLocation(String),
    #[error("reference locations can only be files: {0}")]
    NonFileReference(String),
    #[error("referenced file does not exist: {0}")]
    ReferencedFileMissing(String),
    #[error("invalid percent escape in '{input}' at offset {offset}")]
    InvalidEscape { input: String, offset: usize },
    #[error("no archive for bundle id {0}")]
    ArchiveNotFound(u64),
    #[error("archive directory already exists for bundle id {0}")]
    DuplicateArchive(u64),
    #[error("bundle id must be greater than zero, got {0}")]
    InvalidBundleId(u64),
    #[error("data file path must be relative and must not contain '..': {0}")]
    InvalidDataPath(String),
    #[error("bundle.info integrity check failed for archive '{archive}': expected {expected}, got {actual}")]
    IntegrityFailure {
        archive: String,
        expected: String,
        actual: String,
    },
    #[error("corrupt archive state in {path}: {reason}")]
    CorruptInfo { path: String, reason: String },
    #[error("cache lock acquisition failed: {0}")]
    LockFailed(String),
    #[error("cache profile not configured: set cache.profile or cache.profiledir")]
    MissingProfile,
    #[error("bundle content has no manifest entry '{0}'")]
    MissingManifest(String),
}
