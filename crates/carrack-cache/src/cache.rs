//! The bundle cache: owns a cache root, the archives inside it, and the
//! persisted next-bundle-id counter.

use crate::archive::BundleArchive;
use crate::layout::{CacheLayout, DEFAULT_BUFFER_SIZE};
use crate::{fsync_dir, CacheError};
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

pub struct BundleCache {
    layout: CacheLayout,
    buf_size: usize,
    archives: Mutex<BTreeMap<u64, Arc<BundleArchive>>>,
    /// Held for the life of the cache so two processes never share a root.
    _lock: File,
}

impl BundleCache {
    /// Open (creating if necessary) the cache at the resolved root and
    /// reconstruct every archive found inside it. Corrupt archive
    /// directories are skipped with a warning; they will be reported again
    /// on the next open.
    pub fn open(layout: CacheLayout, buf_size: usize) -> Result<Self, CacheError> {
        fs::create_dir_all(layout.root())?;

        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(layout.lock_file())?;
        lock_file
            .try_lock_exclusive()
            .map_err(|e| CacheError::LockFailed(format!("{}: {e}", layout.root().display())))?;

        let mut archives = BTreeMap::new();
        for entry in fs::read_dir(layout.root())? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(CacheLayout::parse_archive_dir_name) else {
                continue;
            };
            match BundleArchive::open(&entry.path(), buf_size) {
                Ok(archive) => {
                    archives.insert(id, Arc::new(archive));
                }
                Err(e) => {
                    warn!("skipping corrupt archive {}: {e}", entry.path().display());
                }
            }
        }
        debug!(
            "opened bundle cache at {} with {} archive(s)",
            layout.root().display(),
            archives.len()
        );

        Ok(Self {
            layout,
            buf_size,
            archives: Mutex::new(archives),
            _lock: lock_file,
        })
    }

    /// Open with the default buffer size.
    pub fn open_default(layout: CacheLayout) -> Result<Self, CacheError> {
        Self::open(layout, DEFAULT_BUFFER_SIZE)
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    /// Create the archive for a newly installed bundle.
    pub fn create(
        &self,
        id: u64,
        location: &str,
        start_level: u32,
        stream: Option<&mut dyn Read>,
    ) -> Result<Arc<BundleArchive>, CacheError> {
        let dir = self.layout.archive_dir(id);
        if dir.exists() {
            return Err(CacheError::DuplicateArchive(id));
        }
        let archive = Arc::new(BundleArchive::create(
            &dir,
            id,
            location,
            start_level,
            stream,
            self.buf_size,
        )?);
        self.archives
            .lock()
            .expect("cache state poisoned")
            .insert(id, Arc::clone(&archive));
        Ok(archive)
    }

    /// All archives, ordered by bundle id.
    pub fn get_archives(&self) -> Vec<Arc<BundleArchive>> {
        self.archives
            .lock()
            .expect("cache state poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn get(&self, id: u64) -> Result<Arc<BundleArchive>, CacheError> {
        self.archives
            .lock()
            .expect("cache state poisoned")
            .get(&id)
            .cloned()
            .ok_or(CacheError::ArchiveNotFound(id))
    }

    /// Remove an archive from the cache and delete its directory.
    pub fn remove(&self, archive: &Arc<BundleArchive>) -> Result<(), CacheError> {
        self.archives
            .lock()
            .expect("cache state poisoned")
            .remove(&archive.id());
        archive.close_and_delete()
    }

    /// Delete every archive and the next-id file.
    pub fn flush(&self) -> Result<(), CacheError> {
        let drained: Vec<Arc<BundleArchive>> = {
            let mut guard = self.archives.lock().expect("cache state poisoned");
            let drained = guard.values().cloned().collect();
            guard.clear();
            drained
        };
        for archive in drained {
            archive.close_and_delete()?;
        }
        let next_id = self.layout.next_id_file();
        if next_id.exists() {
            fs::remove_file(next_id)?;
        }
        Ok(())
    }

    /// Read the persisted next-bundle-id counter, if one was stored.
    pub fn load_next_id(&self) -> Option<u64> {
        let content = fs::read_to_string(self.layout.next_id_file()).ok()?;
        match content.trim().parse() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!("ignoring unparsable next-id file in {}", self.layout.root().display());
                None
            }
        }
    }

    /// Persist the next-bundle-id counter. Called before a new id is handed
    /// out so a crash can never reuse one.
    pub fn store_next_id(&self, next_id: u64) -> Result<(), CacheError> {
        let mut tmp = NamedTempFile::new_in(self.layout.root())?;
        tmp.write_all(next_id.to_string().as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.layout.next_id_file())
            .map_err(|e| CacheError::Io(e.error))?;
        fsync_dir(self.layout.root())?;
        Ok(())
    }
}
