//! Persistent backing of one bundle across revisions and process restarts.
//!
//! An archive directory holds a consolidated `bundle.info` state file, a
//! private `data/` directory, and one directory per revision named
//! `version<refresh_count>.<revision_index>`. The refresh count is part of
//! the directory name so every refresh gives revision content (and the
//! native libraries inside it) a fresh absolute path.

use crate::revision::Revision;
use crate::{fsync_dir, CacheError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

const BUNDLE_INFO_FILE: &str = "bundle.info";
const REVISION_LOCATION_FILE: &str = "revision.location";
const REVISION_DIR_PREFIX: &str = "version";
const DATA_DIR: &str = "data";
const INPUTSTREAM_LOCATION: &str = "inputstream:";

// Legacy one-file-per-field layout, read as a fallback.
const LEGACY_ID_FILE: &str = "bundle.id";
const LEGACY_LOCATION_FILE: &str = "bundle.location";
const LEGACY_STATE_FILE: &str = "bundle.state";
const LEGACY_START_LEVEL_FILE: &str = "bundle.startlevel";
const LEGACY_LAST_MODIFIED_FILE: &str = "bundle.lastmodified";
const LEGACY_REFRESH_COUNTER_FILE: &str = "refresh.counter";

/// The remembered running intent of a bundle, persisted across restarts and
/// independent of the transient lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistentState {
    Installed,
    Active,
    Uninstalled,
}

impl std::fmt::Display for PersistentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistentState::Installed => write!(f, "installed"),
            PersistentState::Active => write!(f, "active"),
            PersistentState::Uninstalled => write!(f, "uninstalled"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InfoRecord {
    id: u64,
    location: String,
    persistent_state: PersistentState,
    start_level: u32,
    last_modified: i64,
    refresh_count: u64,
    /// blake3 checksum for integrity verification. `None` for legacy records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    checksum: Option<String>,
}

impl InfoRecord {
    /// Checksum over the record content, excluding the checksum field itself.
    fn compute_checksum(&self) -> Result<String, CacheError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string_pretty(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }
}

struct ArchiveState {
    info: InfoRecord,
    /// Ordered oldest → newest. Slots may hold `None` for stale orphan
    /// revisions discovered at reconstruction; `purge` drops their
    /// directories with everything else.
    revisions: Vec<Option<Arc<Revision>>>,
}

pub struct BundleArchive {
    root: PathBuf,
    buf_size: usize,
    state: Mutex<ArchiveState>,
}

impl BundleArchive {
    /// Create a new archive for a freshly installed bundle and materialize
    /// its first revision.
    pub fn create(
        root: &Path,
        id: u64,
        location: &str,
        start_level: u32,
        stream: Option<&mut dyn Read>,
        buf_size: usize,
    ) -> Result<Self, CacheError> {
        if id == 0 {
            return Err(CacheError::InvalidBundleId(id));
        }
        fs::create_dir_all(root)?;

        let info = InfoRecord {
            id,
            location: location.to_owned(),
            persistent_state: PersistentState::Installed,
            start_level,
            last_modified: chrono::Utc::now().timestamp_millis(),
            refresh_count: 0,
            checksum: None,
        };
        write_info(root, &info)?;

        let archive = Self {
            root: root.to_path_buf(),
            buf_size,
            state: Mutex::new(ArchiveState {
                info,
                revisions: Vec::new(),
            }),
        };
        if let Err(e) = archive.revise(location, stream) {
            // A failed first revision leaves a dead archive directory behind.
            let _ = fs::remove_dir_all(root);
            return Err(e);
        }
        Ok(archive)
    }

    /// Reconstruct an archive from disk after a process restart. Revision
    /// directories beyond the newest become placeholder slots so a later
    /// `purge` removes them; only the newest revision is fully rebuilt.
    pub fn open(root: &Path, buf_size: usize) -> Result<Self, CacheError> {
        let info = read_info(root)?;

        let mut count = 0usize;
        while revision_dir(root, info.refresh_count, count).exists() {
            count += 1;
        }
        if count == 0 {
            return Err(CacheError::CorruptInfo {
                path: root.display().to_string(),
                reason: "archive has no revision directories".to_owned(),
            });
        }

        let newest_dir = revision_dir(root, info.refresh_count, count - 1);
        let location = read_revision_location(&newest_dir)?;
        let newest = Revision::open(&newest_dir, &location, buf_size)?;

        let mut revisions: Vec<Option<Arc<Revision>>> = vec![None; count - 1];
        revisions.push(Some(Arc::new(newest)));

        Ok(Self {
            root: root.to_path_buf(),
            buf_size,
            state: Mutex::new(ArchiveState { info, revisions }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn id(&self) -> u64 {
        self.lock().info.id
    }

    pub fn location(&self) -> String {
        self.lock().info.location.clone()
    }

    pub fn persistent_state(&self) -> PersistentState {
        self.lock().info.persistent_state
    }

    pub fn set_persistent_state(&self, state: PersistentState) -> Result<(), CacheError> {
        let mut guard = self.lock();
        if guard.info.persistent_state != state {
            guard.info.persistent_state = state;
            write_info(&self.root, &guard.info)?;
        }
        Ok(())
    }

    pub fn start_level(&self) -> u32 {
        self.lock().info.start_level
    }

    pub fn set_start_level(&self, level: u32) -> Result<(), CacheError> {
        let mut guard = self.lock();
        if guard.info.start_level != level {
            guard.info.start_level = level;
            write_info(&self.root, &guard.info)?;
        }
        Ok(())
    }

    pub fn last_modified(&self) -> i64 {
        self.lock().info.last_modified
    }

    pub fn set_last_modified(&self, last_modified: i64) -> Result<(), CacheError> {
        let mut guard = self.lock();
        if guard.info.last_modified != last_modified {
            guard.info.last_modified = last_modified;
            write_info(&self.root, &guard.info)?;
        }
        Ok(())
    }

    pub fn refresh_count(&self) -> u64 {
        self.lock().info.refresh_count
    }

    pub fn revision_count(&self) -> usize {
        self.lock().revisions.len()
    }

    /// The i-th revision, oldest first. `None` for out-of-range indices and
    /// for placeholder slots of stale orphan revisions.
    pub fn revision(&self, i: usize) -> Option<Arc<Revision>> {
        self.lock().revisions.get(i).cloned().flatten()
    }

    /// The newest revision, which always exists.
    pub fn current_revision(&self) -> Arc<Revision> {
        self.lock()
            .revisions
            .last()
            .cloned()
            .flatten()
            .expect("archive without a current revision")
    }

    /// Append a revision for updated content.
    pub fn revise(
        &self,
        location: &str,
        stream: Option<&mut dyn Read>,
    ) -> Result<(), CacheError> {
        // A supplied stream wins over whatever the location says.
        let location = if stream.is_some() {
            INPUTSTREAM_LOCATION
        } else {
            location
        };

        let mut guard = self.lock();
        let index = guard.revisions.len();
        let dir = revision_dir(&self.root, guard.info.refresh_count, index);
        let revision = Revision::create(&dir, location, stream, self.buf_size)?;
        if let Err(e) = write_revision_location(&dir, location) {
            let _ = fs::remove_dir_all(&dir);
            return Err(e);
        }
        guard.revisions.push(Some(Arc::new(revision)));
        Ok(())
    }

    /// Undo the most recent `revise`. Returns false when only one revision
    /// exists, since the original content must survive.
    pub fn rollback_revise(&self) -> Result<bool, CacheError> {
        let mut guard = self.lock();
        if guard.revisions.len() <= 1 {
            return Ok(false);
        }
        let index = guard.revisions.len() - 1;
        let dir = revision_dir(&self.root, guard.info.refresh_count, index);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        guard.revisions.pop();
        Ok(true)
    }

    /// Remove every revision except the newest and bump the refresh count.
    /// The surviving revision directory is renamed to index zero of the new
    /// refresh level, changing its absolute path so native libraries can be
    /// rebound.
    pub fn purge(&self) -> Result<(), CacheError> {
        let mut guard = self.lock();
        let old_refresh = guard.info.refresh_count;
        let count = guard.revisions.len();

        for i in 0..count - 1 {
            let dir = revision_dir(&self.root, old_refresh, i);
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
        }

        let newest = guard
            .revisions
            .last()
            .cloned()
            .flatten()
            .expect("archive without a current revision");
        let location = newest.location().to_owned();
        drop(newest);

        guard.info.refresh_count = old_refresh + 1;
        write_info(&self.root, &guard.info)?;

        let old_dir = revision_dir(&self.root, old_refresh, count - 1);
        let new_dir = revision_dir(&self.root, old_refresh + 1, 0);
        fs::rename(&old_dir, &new_dir)?;

        let revision = Revision::open(&new_dir, &location, self.buf_size)?;
        guard.revisions = vec![Some(Arc::new(revision))];
        Ok(())
    }

    /// Drop in-memory revision handles. Content on disk is untouched.
    pub fn close(&self) {
        debug!("closing archive at {}", self.root.display());
    }

    /// Close the archive and delete its directory tree.
    pub fn close_and_delete(&self) -> Result<(), CacheError> {
        self.close();
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }

    /// Path of a file inside the bundle's private data area. The relative
    /// path may not be absolute or traverse upwards.
    pub fn data_file(&self, relative: &str) -> Result<PathBuf, CacheError> {
        let rel = Path::new(relative);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::RootDir))
        {
            return Err(CacheError::InvalidDataPath(relative.to_owned()));
        }
        let data_dir = self.root.join(DATA_DIR);
        fs::create_dir_all(&data_dir)?;
        Ok(data_dir.join(rel))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ArchiveState> {
        self.state.lock().expect("archive state poisoned")
    }
}

fn revision_dir(root: &Path, refresh: u64, index: usize) -> PathBuf {
    root.join(format!("{REVISION_DIR_PREFIX}{refresh}.{index}"))
}

fn write_revision_location(dir: &Path, location: &str) -> Result<(), CacheError> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(location.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(dir.join(REVISION_LOCATION_FILE))
        .map_err(|e| CacheError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

fn read_revision_location(dir: &Path) -> Result<String, CacheError> {
    let content = fs::read_to_string(dir.join(REVISION_LOCATION_FILE))?;
    Ok(content.lines().next().unwrap_or("").to_owned())
}

fn write_info(root: &Path, info: &InfoRecord) -> Result<(), CacheError> {
    let mut record = info.clone();
    record.checksum = Some(record.compute_checksum()?);
    let content = serde_json::to_string_pretty(&record)?;

    let mut tmp = NamedTempFile::new_in(root)?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(root.join(BUNDLE_INFO_FILE))
        .map_err(|e| CacheError::Io(e.error))?;
    fsync_dir(root)?;
    Ok(())
}

fn read_info(root: &Path) -> Result<InfoRecord, CacheError> {
    let path = root.join(BUNDLE_INFO_FILE);
    if !path.exists() {
        return read_legacy_info(root);
    }
    let content = fs::read_to_string(&path)?;
    let info: InfoRecord = serde_json::from_str(&content)?;

    if let Some(ref expected) = info.checksum {
        let actual = info.compute_checksum()?;
        if actual != *expected {
            return Err(CacheError::IntegrityFailure {
                archive: root.display().to_string(),
                expected: expected.clone(),
                actual,
            });
        }
    }
    Ok(info)
}

/// Read the deprecated one-value-per-file archive state.
fn read_legacy_info(root: &Path) -> Result<InfoRecord, CacheError> {
    warn!(
        "archive {} has no bundle.info; reading legacy per-file state",
        root.display()
    );

    let id = match read_trimmed(root, LEGACY_ID_FILE) {
        Some(text) => text.parse().map_err(|_| CacheError::CorruptInfo {
            path: root.display().to_string(),
            reason: "legacy bundle.id is not a number".to_owned(),
        })?,
        // Oldest caches persisted no id file at all; the archive directory
        // name carries it.
        None => root
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(crate::layout::CacheLayout::parse_archive_dir_name)
            .ok_or_else(|| CacheError::CorruptInfo {
                path: root.display().to_string(),
                reason: "cannot determine bundle id".to_owned(),
            })?,
    };

    let location = read_trimmed(root, LEGACY_LOCATION_FILE).ok_or_else(|| {
        CacheError::CorruptInfo {
            path: root.display().to_string(),
            reason: "missing bundle.location".to_owned(),
        }
    })?;

    let persistent_state = match read_trimmed(root, LEGACY_STATE_FILE).as_deref() {
        Some("active") => PersistentState::Active,
        Some("uninstalled") => PersistentState::Uninstalled,
        // "starting" and anything unknown degrade to installed.
        _ => PersistentState::Installed,
    };

    let start_level = read_trimmed(root, LEGACY_START_LEVEL_FILE)
        .and_then(|s| s.parse().ok())
        .unwrap_or(1);
    let last_modified = read_trimmed(root, LEGACY_LAST_MODIFIED_FILE)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let refresh_count = read_trimmed(root, LEGACY_REFRESH_COUNTER_FILE)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    Ok(InfoRecord {
        id,
        location,
        persistent_state,
        start_level,
        last_modified,
        refresh_count,
        checksum: None,
    })
}

fn read_trimmed(root: &Path, name: &str) -> Option<String> {
    fs::read_to_string(root.join(name))
        .ok()
        .map(|s| s.lines().next().unwrap_or("").trim().to_owned())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::MANIFEST_ENTRY;
    use crate::layout::DEFAULT_BUFFER_SIZE;

    fn bundle_tree(name: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_ENTRY),
            format!("manifest_version = 2\n[bundle]\nsymbolic_name = \"{name}\"\nversion = \"1.0.0\"\n"),
        )
        .unwrap();
        dir
    }

    fn new_archive(tree: &tempfile::TempDir) -> (tempfile::TempDir, BundleArchive) {
        let root = tempfile::tempdir().unwrap();
        let location = format!("reference:file:{}", tree.path().display());
        let archive = BundleArchive::create(
            &root.path().join("bundle1"),
            1,
            &location,
            1,
            None,
            DEFAULT_BUFFER_SIZE,
        )
        .unwrap();
        (root, archive)
    }

    #[test]
    fn create_writes_info_and_first_revision() {
        let tree = bundle_tree("arch.a");
        let (_root, archive) = new_archive(&tree);
        assert_eq!(archive.id(), 1);
        assert_eq!(archive.revision_count(), 1);
        assert_eq!(archive.refresh_count(), 0);
        assert_eq!(archive.persistent_state(), PersistentState::Installed);
        assert!(archive.last_modified() > 0);
        assert_eq!(
            archive.current_revision().manifest().bundle.symbolic_name,
            "arch.a"
        );
    }

    #[test]
    fn rejects_bundle_id_zero() {
        let tree = bundle_tree("arch.zero");
        let root = tempfile::tempdir().unwrap();
        let location = format!("reference:file:{}", tree.path().display());
        let result = BundleArchive::create(
            &root.path().join("bundle0"),
            0,
            &location,
            1,
            None,
            DEFAULT_BUFFER_SIZE,
        );
        assert!(matches!(result, Err(CacheError::InvalidBundleId(0))));
    }

    #[test]
    fn revise_appends_and_rollback_removes() {
        let tree = bundle_tree("arch.b");
        let tree2 = bundle_tree("arch.b2");
        let (_root, archive) = new_archive(&tree);

        let location2 = format!("reference:file:{}", tree2.path().display());
        archive.revise(&location2, None).unwrap();
        assert_eq!(archive.revision_count(), 2);
        assert_eq!(
            archive.current_revision().manifest().bundle.symbolic_name,
            "arch.b2"
        );

        assert!(archive.rollback_revise().unwrap());
        assert_eq!(archive.revision_count(), 1);
        assert_eq!(
            archive.current_revision().manifest().bundle.symbolic_name,
            "arch.b"
        );
    }

    #[test]
    fn rollback_with_single_revision_refuses() {
        let tree = bundle_tree("arch.c");
        let (_root, archive) = new_archive(&tree);
        assert!(!archive.rollback_revise().unwrap());
        assert_eq!(archive.revision_count(), 1);
    }

    #[test]
    fn purge_keeps_newest_and_bumps_refresh_count() {
        let tree = bundle_tree("arch.d");
        let tree2 = bundle_tree("arch.d2");
        let (_root, archive) = new_archive(&tree);
        let location2 = format!("reference:file:{}", tree2.path().display());
        archive.revise(&location2, None).unwrap();

        let old_dir = archive.root().join("version0.0");
        assert!(old_dir.exists());

        archive.purge().unwrap();
        assert_eq!(archive.revision_count(), 1);
        assert_eq!(archive.refresh_count(), 1);
        assert!(!old_dir.exists());
        assert!(archive.root().join("version1.0").exists());
        assert_eq!(
            archive.current_revision().manifest().bundle.symbolic_name,
            "arch.d2"
        );
    }

    #[test]
    fn reopen_restores_persisted_state() {
        let tree = bundle_tree("arch.e");
        let (_root, archive) = new_archive(&tree);
        archive
            .set_persistent_state(PersistentState::Active)
            .unwrap();
        archive.set_start_level(5).unwrap();
        let root = archive.root().to_path_buf();
        let location = archive.location();
        drop(archive);

        let reopened = BundleArchive::open(&root, DEFAULT_BUFFER_SIZE).unwrap();
        assert_eq!(reopened.id(), 1);
        assert_eq!(reopened.location(), location);
        assert_eq!(reopened.persistent_state(), PersistentState::Active);
        assert_eq!(reopened.start_level(), 5);
    }

    #[test]
    fn reopen_with_multiple_revisions_keeps_placeholders() {
        let tree = bundle_tree("arch.f");
        let tree2 = bundle_tree("arch.f2");
        let (_root, archive) = new_archive(&tree);
        let location2 = format!("reference:file:{}", tree2.path().display());
        archive.revise(&location2, None).unwrap();
        let root = archive.root().to_path_buf();
        drop(archive);

        let reopened = BundleArchive::open(&root, DEFAULT_BUFFER_SIZE).unwrap();
        assert_eq!(reopened.revision_count(), 2);
        // Older revision is a placeholder, newest is live.
        assert!(reopened.revision(0).is_none());
        assert!(reopened.revision(1).is_some());

        // Purge drops the orphan directory and the placeholder.
        reopened.purge().unwrap();
        assert_eq!(reopened.revision_count(), 1);
        assert!(!root.join("version0.0").exists());
        assert!(!root.join("version0.1").exists());
    }

    #[test]
    fn legacy_per_file_state_is_read() {
        let tree = bundle_tree("arch.legacy");
        let root = tempfile::tempdir().unwrap();
        let archive_dir = root.path().join("bundle9");

        // Build a legacy-layout archive by hand.
        let location = format!("reference:file:{}", tree.path().display());
        std::fs::create_dir_all(&archive_dir).unwrap();
        std::fs::write(archive_dir.join(LEGACY_ID_FILE), "9\n").unwrap();
        std::fs::write(archive_dir.join(LEGACY_LOCATION_FILE), format!("{location}\n")).unwrap();
        std::fs::write(archive_dir.join(LEGACY_STATE_FILE), "active\n").unwrap();
        std::fs::write(archive_dir.join(LEGACY_START_LEVEL_FILE), "3\n").unwrap();
        std::fs::write(archive_dir.join(LEGACY_LAST_MODIFIED_FILE), "12345\n").unwrap();
        std::fs::write(archive_dir.join(LEGACY_REFRESH_COUNTER_FILE), "2\n").unwrap();
        let rev_dir = archive_dir.join("version2.0");
        std::fs::create_dir_all(&rev_dir).unwrap();
        std::fs::write(rev_dir.join(REVISION_LOCATION_FILE), location).unwrap();

        let archive = BundleArchive::open(&archive_dir, DEFAULT_BUFFER_SIZE).unwrap();
        assert_eq!(archive.id(), 9);
        assert_eq!(archive.persistent_state(), PersistentState::Active);
        assert_eq!(archive.start_level(), 3);
        assert_eq!(archive.last_modified(), 12345);
        assert_eq!(archive.refresh_count(), 2);
    }

    #[test]
    fn legacy_id_falls_back_to_directory_name() {
        let tree = bundle_tree("arch.oldest");
        let root = tempfile::tempdir().unwrap();
        let archive_dir = root.path().join("bundle42");
        let location = format!("reference:file:{}", tree.path().display());

        std::fs::create_dir_all(&archive_dir).unwrap();
        std::fs::write(archive_dir.join(LEGACY_LOCATION_FILE), &location).unwrap();
        let rev_dir = archive_dir.join("version0.0");
        std::fs::create_dir_all(&rev_dir).unwrap();
        std::fs::write(rev_dir.join(REVISION_LOCATION_FILE), location).unwrap();

        let archive = BundleArchive::open(&archive_dir, DEFAULT_BUFFER_SIZE).unwrap();
        assert_eq!(archive.id(), 42);
        assert_eq!(archive.persistent_state(), PersistentState::Installed);
    }

    #[test]
    fn corrupted_info_checksum_is_rejected() {
        let tree = bundle_tree("arch.bad");
        let (_root, archive) = new_archive(&tree);
        let root = archive.root().to_path_buf();
        drop(archive);

        let info_path = root.join(BUNDLE_INFO_FILE);
        let content = std::fs::read_to_string(&info_path).unwrap();
        std::fs::write(&info_path, content.replace("\"start_level\": 1", "\"start_level\": 99"))
            .unwrap();

        assert!(matches!(
            BundleArchive::open(&root, DEFAULT_BUFFER_SIZE),
            Err(CacheError::IntegrityFailure { .. })
        ));
    }

    #[test]
    fn data_file_validations() {
        let tree = bundle_tree("arch.data");
        let (_root, archive) = new_archive(&tree);

        let path = archive.data_file("settings/state.json").unwrap();
        assert!(path.starts_with(archive.root().join("data")));
        assert!(archive.root().join("data").is_dir());

        assert!(matches!(
            archive.data_file("/absolute"),
            Err(CacheError::InvalidDataPath(_))
        ));
        assert!(matches!(
            archive.data_file("up/../../escape"),
            Err(CacheError::InvalidDataPath(_))
        ));
    }

    #[test]
    fn close_and_delete_removes_tree() {
        let tree = bundle_tree("arch.del");
        let (_root, archive) = new_archive(&tree);
        let root = archive.root().to_path_buf();
        archive.close_and_delete().unwrap();
        assert!(!root.exists());
    }
}
