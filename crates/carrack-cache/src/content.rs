//! Access to bundle content: packed tar archives or exploded directory trees.

use crate::CacheError;
use carrack_manifest::{parse_manifest_str, BundleManifest};
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

/// Name of the manifest entry every bundle carries at its content root.
pub const MANIFEST_ENTRY: &str = "bundle.toml";

#[derive(Debug, Clone)]
pub enum RevisionContent {
    /// An exploded bundle directory, used in place.
    Directory { root: PathBuf },
    /// A packed tar archive.
    Packed { archive: PathBuf },
}

impl RevisionContent {
    /// Read a named entry. Returns `Ok(None)` when the entry does not exist.
    pub fn entry(&self, name: &str) -> Result<Option<Vec<u8>>, CacheError> {
        match self {
            RevisionContent::Directory { root } => {
                let path = root.join(name);
                if !path.is_file() {
                    return Ok(None);
                }
                Ok(Some(std::fs::read(path)?))
            }
            RevisionContent::Packed { archive } => {
                let file = File::open(archive)?;
                let mut ar = tar::Archive::new(file);
                for entry in ar.entries()? {
                    let mut entry = entry?;
                    let matches = entry_matches(entry.path()?.as_ref(), name);
                    if matches {
                        let mut buf = Vec::with_capacity(entry.size() as usize);
                        entry.read_to_end(&mut buf)?;
                        return Ok(Some(buf));
                    }
                }
                Ok(None)
            }
        }
    }

    pub fn has_entry(&self, name: &str) -> bool {
        match self {
            RevisionContent::Directory { root } => root.join(name).is_file(),
            RevisionContent::Packed { .. } => matches!(self.entry(name), Ok(Some(_))),
        }
    }

    /// Parse the `bundle.toml` manifest at the content root.
    pub fn manifest(&self) -> Result<BundleManifest, CacheError> {
        let bytes = self
            .entry(MANIFEST_ENTRY)?
            .ok_or_else(|| CacheError::MissingManifest(MANIFEST_ENTRY.to_owned()))?;
        let text = String::from_utf8(bytes).map_err(|_| CacheError::CorruptInfo {
            path: MANIFEST_ENTRY.to_owned(),
            reason: "manifest is not valid UTF-8".to_owned(),
        })?;
        Ok(parse_manifest_str(&text)?)
    }

    /// Copy a named entry to a destination path, creating parent directories.
    pub fn extract_entry(&self, name: &str, dest: &Path) -> Result<bool, CacheError> {
        let Some(bytes) = self.entry(name)? else {
            return Ok(false);
        };
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, bytes)?;
        Ok(true)
    }
}

/// Compare a tar entry path against an entry name, ignoring a leading `./`.
fn entry_matches(entry_path: &Path, name: &str) -> bool {
    let wanted: Vec<Component<'_>> = Path::new(name).components().collect();
    let actual: Vec<Component<'_>> = entry_path
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();
    wanted == actual
}

/// Pack a directory tree into a tar archive file. Test and tooling helper;
/// entries are sorted for deterministic output.
pub fn pack_directory(source: &Path, dest: &Path) -> Result<(), CacheError> {
    let mut entries = Vec::new();
    collect_files(source, source, &mut entries)?;
    entries.sort();

    let file = File::create(dest)?;
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(false);
    for rel in &entries {
        builder.append_path_with_name(source.join(rel), rel)?;
    }
    builder.finish()?;
    Ok(())
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), CacheError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_path_buf());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_ENTRY),
            "manifest_version = 2\n[bundle]\nsymbolic_name = \"sample\"\nversion = \"1.0.0\"\n",
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("native")).unwrap();
        std::fs::write(dir.path().join("native/libx.so"), b"\x7fELF").unwrap();
        dir
    }

    #[test]
    fn directory_entry_lookup() {
        let dir = sample_tree();
        let content = RevisionContent::Directory {
            root: dir.path().to_path_buf(),
        };
        assert!(content.has_entry(MANIFEST_ENTRY));
        assert!(content.has_entry("native/libx.so"));
        assert!(!content.has_entry("absent"));
        assert_eq!(content.entry("native/libx.so").unwrap().unwrap(), b"\x7fELF");
    }

    #[test]
    fn directory_manifest_parses() {
        let dir = sample_tree();
        let content = RevisionContent::Directory {
            root: dir.path().to_path_buf(),
        };
        let manifest = content.manifest().unwrap();
        assert_eq!(manifest.bundle.symbolic_name, "sample");
    }

    #[test]
    fn packed_roundtrip() {
        let dir = sample_tree();
        let out = tempfile::tempdir().unwrap();
        let tar_path = out.path().join("b.tar");
        pack_directory(dir.path(), &tar_path).unwrap();

        let content = RevisionContent::Packed { archive: tar_path };
        assert!(content.has_entry(MANIFEST_ENTRY));
        assert_eq!(content.entry("native/libx.so").unwrap().unwrap(), b"\x7fELF");
        assert!(content.entry("absent").unwrap().is_none());
        assert_eq!(content.manifest().unwrap().bundle.symbolic_name, "sample");
    }

    #[test]
    fn missing_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let content = RevisionContent::Directory {
            root: dir.path().to_path_buf(),
        };
        assert!(matches!(
            content.manifest(),
            Err(CacheError::MissingManifest(_))
        ));
    }

    #[test]
    fn extract_entry_creates_parents() {
        let dir = sample_tree();
        let content = RevisionContent::Directory {
            root: dir.path().to_path_buf(),
        };
        let out = tempfile::tempdir().unwrap();
        let dest = out.path().join("deep/nested/libx.so");
        assert!(content.extract_entry("native/libx.so", &dest).unwrap());
        assert!(dest.is_file());
        assert!(!content.extract_entry("absent", &out.path().join("n")).unwrap());
    }
}
