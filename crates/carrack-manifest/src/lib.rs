//! Bundle manifest parsing, typed identifiers, and localization resources for Carrack.
//!
//! This crate defines the schema layer: TOML manifest parsing
//! (`BundleManifest`), the four-segment bundle [`Version`] model, string
//! newtypes for identifiers, and the `key=value` localization resource
//! format used to resolve `%`-prefixed header values.

pub mod manifest;
pub mod properties;
pub mod types;
pub mod version;

pub use manifest::{
    parse_manifest_file, parse_manifest_str, BundleManifest, BundleSection, ExportsSection,
    ImportsSection, MetadataSection, NativeLibrary, NativeSection, RequiresSection,
    MANIFEST_VERSION_CURRENT,
};
pub use properties::{locale_resource_names, parse_properties};
pub use types::{PackageName, SymbolicName};
pub use version::Version;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse manifest: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("unsupported manifest_version: {0}, expected 1 or 2")]
    UnsupportedVersion(u32),
    #[error("bundle.symbolic_name must not be empty")]
    EmptySymbolicName,
    #[error("invalid bundle version '{input}': {reason}")]
    InvalidVersion { input: String, reason: String },
    #[error("native library entry must not be empty")]
    EmptyNativeEntry,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_error_display_unsupported_version() {
        let e = ManifestError::UnsupportedVersion(7);
        assert!(e.to_string().contains('7'));
    }

    #[test]
    fn manifest_error_display_invalid_version() {
        let e = ManifestError::InvalidVersion {
            input: "a.b".to_owned(),
            reason: "segment is not a number".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("a.b"));
        assert!(msg.contains("segment"));
    }
}
