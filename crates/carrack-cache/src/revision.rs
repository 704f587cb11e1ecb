//! One revision of a bundle's content.
//!
//! A revision owns a directory under its archive root. Depending on the
//! location the content is copied into that directory (packed files,
//! streams) or used in place (referenced files and directories). Native
//! libraries declared in the manifest are extracted into the revision
//! directory so every refresh gives them a fresh absolute path.

use crate::content::RevisionContent;
use crate::location::{classify, LocationKind};
use crate::CacheError;
use carrack_manifest::BundleManifest;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File name of packed content copied into a revision directory.
const PACKED_FILE: &str = "bundle.tar";
/// Subdirectory of a revision directory holding extracted native libraries.
const NATIVE_DIR: &str = "native";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionKind {
    /// Packed content copied into the revision directory.
    Packed,
    /// Packed content used in place.
    ReferencedPacked,
    /// Exploded directory used in place.
    Directory,
    /// Content supplied as a byte stream and copied into the revision directory.
    Stream,
}

#[derive(Debug)]
pub struct Revision {
    kind: RevisionKind,
    location: String,
    root: PathBuf,
    content: RevisionContent,
    manifest: BundleManifest,
}

impl Revision {
    /// Materialize a new revision in `root` from a location and optional
    /// stream. On failure the partially created revision directory is
    /// removed.
    pub(crate) fn create(
        root: &Path,
        location: &str,
        stream: Option<&mut dyn Read>,
        buf_size: usize,
    ) -> Result<Self, CacheError> {
        match Self::build(root, location, stream, buf_size, false) {
            Ok(revision) => Ok(revision),
            Err(e) => {
                if root.exists() {
                    if let Err(rm) = std::fs::remove_dir_all(root) {
                        warn!("unable to delete revision directory {}: {rm}", root.display());
                    }
                }
                Err(e)
            }
        }
    }

    /// Reconstruct a revision whose content already sits in `root` (process
    /// restart path). Nothing is copied.
    pub(crate) fn open(root: &Path, location: &str, buf_size: usize) -> Result<Self, CacheError> {
        Self::build(root, location, None, buf_size, true)
    }

    fn build(
        root: &Path,
        location: &str,
        stream: Option<&mut dyn Read>,
        buf_size: usize,
        reload: bool,
    ) -> Result<Self, CacheError> {
        std::fs::create_dir_all(root)?;

        let (kind, content) = match classify(location)? {
            LocationKind::ReferencedDirectory(path) => (
                RevisionKind::Directory,
                RevisionContent::Directory { root: path },
            ),
            LocationKind::ReferencedFile(path) => (
                RevisionKind::ReferencedPacked,
                RevisionContent::Packed { archive: path },
            ),
            LocationKind::Stream => {
                let packed = root.join(PACKED_FILE);
                if !reload {
                    let stream = stream.ok_or_else(|| CacheError::CorruptInfo {
                        path: location.to_owned(),
                        reason: "inputstream location without a stream".to_owned(),
                    })?;
                    copy_stream(stream, &packed, buf_size)?;
                }
                (RevisionKind::Stream, RevisionContent::Packed { archive: packed })
            }
            LocationKind::File(source) => {
                let packed = root.join(PACKED_FILE);
                if !reload {
                    let mut file = File::open(&source)?;
                    copy_stream(&mut file, &packed, buf_size)?;
                }
                (RevisionKind::Packed, RevisionContent::Packed { archive: packed })
            }
        };

        let manifest = content.manifest()?;

        let revision = Self {
            kind,
            location: location.to_owned(),
            root: root.to_path_buf(),
            content,
            manifest,
        };
        // Directory revisions use everything in place; for packed kinds the
        // declared native libraries need real paths on the filesystem.
        if revision.kind != RevisionKind::Directory {
            revision.extract_native_libraries()?;
        }
        debug!(
            "revision ready at {} (kind {:?}, location {location})",
            root.display(),
            revision.kind
        );
        Ok(revision)
    }

    pub fn kind(&self) -> RevisionKind {
        self.kind
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn content(&self) -> &RevisionContent {
        &self.content
    }

    pub fn manifest(&self) -> &BundleManifest {
        &self.manifest
    }

    /// Ordered header map of this revision's manifest.
    pub fn headers(&self) -> std::collections::BTreeMap<String, String> {
        self.manifest.headers()
    }

    /// Absolute path of a declared native library, if its entry exists.
    /// For directory revisions this is the in-place path; for packed kinds
    /// it is the extracted copy inside the revision directory.
    pub fn native_library_path(&self, entry: &str) -> Option<PathBuf> {
        let path = match &self.content {
            RevisionContent::Directory { root } => root.join(entry),
            RevisionContent::Packed { .. } => self.root.join(NATIVE_DIR).join(entry),
        };
        path.is_file().then_some(path)
    }

    fn extract_native_libraries(&self) -> Result<(), CacheError> {
        for lib in &self.manifest.native.libraries {
            let dest = self.root.join(NATIVE_DIR).join(&lib.entry);
            if !self.content.extract_entry(&lib.entry, &dest)? {
                // Presence is verified when the module is created; absence
                // here must not fail cache reconstruction.
                warn!(
                    "declared native library '{}' not found in {}",
                    lib.entry, self.location
                );
            }
        }
        Ok(())
    }
}

fn copy_stream(source: &mut dyn Read, dest: &Path, buf_size: usize) -> Result<(), CacheError> {
    let mut out = File::create(dest)?;
    let mut buf = vec![0u8; buf_size.max(1)];
    loop {
        let n = source.read(&mut buf)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
    }
    out.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{pack_directory, MANIFEST_ENTRY};
    use crate::layout::DEFAULT_BUFFER_SIZE;

    fn bundle_tree(manifest: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_ENTRY), manifest).unwrap();
        dir
    }

    const BASIC: &str =
        "manifest_version = 2\n[bundle]\nsymbolic_name = \"rev.test\"\nversion = \"1.0.0\"\n";

    const WITH_NATIVE: &str = "manifest_version = 2\n[bundle]\nsymbolic_name = \"rev.native\"\n[native]\nlibraries = [{ entry = \"native/libn.so\" }]\n";

    #[test]
    fn referenced_directory_in_place() {
        let tree = bundle_tree(BASIC);
        let rev_root = tempfile::tempdir().unwrap();
        let location = format!("reference:file:{}", tree.path().display());

        let rev = Revision::create(
            &rev_root.path().join("version0.0"),
            &location,
            None,
            DEFAULT_BUFFER_SIZE,
        )
        .unwrap();
        assert_eq!(rev.kind(), RevisionKind::Directory);
        assert_eq!(rev.manifest().bundle.symbolic_name, "rev.test");
        // Nothing copied into the revision directory.
        assert!(!rev.root().join("bundle.tar").exists());
    }

    #[test]
    fn file_location_copies_packed_content() {
        let tree = bundle_tree(BASIC);
        let staging = tempfile::tempdir().unwrap();
        let tar_path = staging.path().join("b.tar");
        pack_directory(tree.path(), &tar_path).unwrap();

        let rev_root = tempfile::tempdir().unwrap();
        let location = format!("file:{}", tar_path.display());
        let rev = Revision::create(
            &rev_root.path().join("version0.0"),
            &location,
            None,
            DEFAULT_BUFFER_SIZE,
        )
        .unwrap();
        assert_eq!(rev.kind(), RevisionKind::Packed);
        assert!(rev.root().join("bundle.tar").exists());

        // The original can disappear; the copy serves content.
        std::fs::remove_file(&tar_path).unwrap();
        assert!(rev.content().has_entry(MANIFEST_ENTRY));
    }

    #[test]
    fn stream_location_copies_bytes() {
        let tree = bundle_tree(BASIC);
        let staging = tempfile::tempdir().unwrap();
        let tar_path = staging.path().join("b.tar");
        pack_directory(tree.path(), &tar_path).unwrap();
        let bytes = std::fs::read(&tar_path).unwrap();

        let rev_root = tempfile::tempdir().unwrap();
        let mut reader: &[u8] = &bytes;
        let rev = Revision::create(
            &rev_root.path().join("version0.0"),
            "inputstream:",
            Some(&mut reader),
            DEFAULT_BUFFER_SIZE,
        )
        .unwrap();
        assert_eq!(rev.kind(), RevisionKind::Stream);
        assert_eq!(rev.manifest().bundle.symbolic_name, "rev.test");
    }

    #[test]
    fn referenced_packed_extracts_native_libraries() {
        let tree = bundle_tree(WITH_NATIVE);
        std::fs::create_dir_all(tree.path().join("native")).unwrap();
        std::fs::write(tree.path().join("native/libn.so"), b"\x7fELF").unwrap();
        let staging = tempfile::tempdir().unwrap();
        let tar_path = staging.path().join("b.tar");
        pack_directory(tree.path(), &tar_path).unwrap();

        let rev_root = tempfile::tempdir().unwrap();
        let location = format!("reference:file:{}", tar_path.display());
        let rev = Revision::create(
            &rev_root.path().join("version0.0"),
            &location,
            None,
            DEFAULT_BUFFER_SIZE,
        )
        .unwrap();
        assert_eq!(rev.kind(), RevisionKind::ReferencedPacked);
        let lib = rev.native_library_path("native/libn.so").unwrap();
        assert!(lib.starts_with(rev.root()));
        assert!(lib.is_file());
    }

    #[test]
    fn missing_native_library_path_is_none() {
        let tree = bundle_tree(BASIC);
        let rev_root = tempfile::tempdir().unwrap();
        let location = format!("reference:file:{}", tree.path().display());
        let rev = Revision::create(
            &rev_root.path().join("version0.0"),
            &location,
            None,
            DEFAULT_BUFFER_SIZE,
        )
        .unwrap();
        assert!(rev.native_library_path("native/absent.so").is_none());
    }

    #[test]
    fn create_failure_removes_revision_dir() {
        let rev_root = tempfile::tempdir().unwrap();
        let dir = rev_root.path().join("version0.0");
        let result = Revision::create(
            &dir,
            "reference:file:/nope/missing",
            None,
            DEFAULT_BUFFER_SIZE,
        );
        assert!(result.is_err());
        assert!(!dir.exists());
    }

    #[test]
    fn open_reconstructs_packed_revision() {
        let tree = bundle_tree(BASIC);
        let staging = tempfile::tempdir().unwrap();
        let tar_path = staging.path().join("b.tar");
        pack_directory(tree.path(), &tar_path).unwrap();

        let rev_root = tempfile::tempdir().unwrap();
        let dir = rev_root.path().join("version0.0");
        let location = format!("file:{}", tar_path.display());
        Revision::create(&dir, &location, None, DEFAULT_BUFFER_SIZE).unwrap();

        let reopened = Revision::open(&dir, &location, DEFAULT_BUFFER_SIZE).unwrap();
        assert_eq!(reopened.kind(), RevisionKind::Packed);
        assert_eq!(reopened.manifest().bundle.symbolic_name, "rev.test");
    }
}
