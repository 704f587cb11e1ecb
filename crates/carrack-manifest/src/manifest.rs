use crate::types::{PackageName, SymbolicName};
use crate::version::Version;
use crate::ManifestError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Highest manifest format version this framework understands. Version 2
/// additionally enforces (symbolic name, version) uniqueness across installs.
pub const MANIFEST_VERSION_CURRENT: u32 = 2;

/// Default base name for localization resources inside bundle content.
pub const DEFAULT_LOCALIZATION_BASE: &str = "locale/bundle";

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BundleManifest {
    pub manifest_version: u32,
    pub bundle: BundleSection,
    #[serde(default)]
    pub exports: ExportsSection,
    #[serde(default)]
    pub imports: ImportsSection,
    #[serde(default)]
    pub requires: RequiresSection,
    #[serde(default)]
    pub native: NativeSection,
    #[serde(default)]
    pub metadata: MetadataSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BundleSection {
    pub symbolic_name: SymbolicName,
    #[serde(default)]
    pub version: Version,
    /// Name of the activator to instantiate via the registered activator
    /// factories. Absent means the bundle starts and stops trivially.
    #[serde(default)]
    pub activator: Option<String>,
    /// Location to fetch updated content from; falls back to the original
    /// install location when absent.
    #[serde(default)]
    pub update_location: Option<String>,
    /// Comma-separated execution environments this bundle requires. At least
    /// one must be provided by the framework.
    #[serde(default)]
    pub execution_environments: Option<String>,
    /// Base name of localization resources, relative to bundle content.
    #[serde(default)]
    pub localization: Option<String>,
    /// Extension bundles attach their exports to the system bundle and skip
    /// the starting/active states.
    #[serde(default)]
    pub extension: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ExportsSection {
    #[serde(default)]
    pub packages: Vec<PackageName>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ImportsSection {
    #[serde(default)]
    pub packages: Vec<PackageName>,
    /// Wildcard-capable package patterns resolved lazily at runtime.
    #[serde(default)]
    pub dynamic: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RequiresSection {
    #[serde(default)]
    pub bundles: Vec<SymbolicName>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NativeSection {
    #[serde(default)]
    pub libraries: Vec<NativeLibrary>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NativeLibrary {
    /// Path of the library inside bundle content.
    pub entry: String,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub processor: Option<String>,
}

/// Free-form headers. Values beginning with `%` are localization keys
/// resolved against the bundle's locale resources.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct MetadataSection {
    #[serde(flatten)]
    pub entries: BTreeMap<String, String>,
}

impl BundleManifest {
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.manifest_version == 0 || self.manifest_version > MANIFEST_VERSION_CURRENT {
            return Err(ManifestError::UnsupportedVersion(self.manifest_version));
        }
        if self.bundle.symbolic_name.as_str().trim().is_empty() {
            return Err(ManifestError::EmptySymbolicName);
        }
        for lib in &self.native.libraries {
            if lib.entry.trim().is_empty() {
                return Err(ManifestError::EmptyNativeEntry);
            }
        }
        Ok(())
    }

    /// The localization resource base name, defaulted.
    pub fn localization_base(&self) -> &str {
        self.bundle
            .localization
            .as_deref()
            .unwrap_or(DEFAULT_LOCALIZATION_BASE)
    }

    /// The execution environments this bundle requires, split and trimmed.
    /// Empty means no requirement.
    pub fn required_execution_environments(&self) -> Vec<&str> {
        self.bundle
            .execution_environments
            .as_deref()
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Flatten the manifest into an ordered header-name → value map. Core
    /// fields are synthesized under `bundle.*` keys; `[metadata]` entries are
    /// carried verbatim and may hold `%`-prefixed localization keys.
    pub fn headers(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert(
            "bundle.manifest-version".to_owned(),
            self.manifest_version.to_string(),
        );
        map.insert(
            "bundle.symbolic-name".to_owned(),
            self.bundle.symbolic_name.to_string(),
        );
        map.insert("bundle.version".to_owned(), self.bundle.version.to_string());
        if let Some(ref activator) = self.bundle.activator {
            map.insert("bundle.activator".to_owned(), activator.clone());
        }
        if let Some(ref loc) = self.bundle.update_location {
            map.insert("bundle.update-location".to_owned(), loc.clone());
        }
        if let Some(ref ee) = self.bundle.execution_environments {
            map.insert("bundle.execution-environments".to_owned(), ee.clone());
        }
        if !self.exports.packages.is_empty() {
            map.insert(
                "bundle.exports".to_owned(),
                join_names(&self.exports.packages),
            );
        }
        if !self.imports.packages.is_empty() {
            map.insert(
                "bundle.imports".to_owned(),
                join_names(&self.imports.packages),
            );
        }
        for (key, value) in &self.metadata.entries {
            map.insert(key.clone(), value.clone());
        }
        map
    }
}

fn join_names<T: AsRef<str>>(names: &[T]) -> String {
    names
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(",")
}

pub fn parse_manifest_str(input: &str) -> Result<BundleManifest, ManifestError> {
    let manifest: BundleManifest = toml::from_str(input)?;
    manifest.validate()?;
    Ok(manifest)
}

pub fn parse_manifest_file(path: impl AsRef<Path>) -> Result<BundleManifest, ManifestError> {
    let content = fs::read_to_string(path)?;
    parse_manifest_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
manifest_version = 2

[bundle]
symbolic_name = "com.example.exporter"
version = "1.2.0"
activator = "example.activator"
update_location = "file:/srv/bundles/exporter-next.tar"
execution_environments = "std-2021, std-2018"
extension = false

[exports]
packages = ["com.example.api", "com.example.util"]

[imports]
packages = ["com.example.spi"]
dynamic = ["com.example.ext.*"]

[requires]
bundles = ["com.example.base"]

[native]
libraries = [{ entry = "native/libdemo.so", os = "linux" }]

[metadata]
name = "%bundle.name"
vendor = "Example Corp"
"#;

    #[test]
    fn parses_full_manifest() {
        let m = parse_manifest_str(FULL).unwrap();
        assert_eq!(m.manifest_version, 2);
        assert_eq!(m.bundle.symbolic_name, "com.example.exporter");
        assert_eq!(m.bundle.version, Version::parse("1.2.0").unwrap());
        assert_eq!(m.bundle.activator.as_deref(), Some("example.activator"));
        assert_eq!(m.exports.packages.len(), 2);
        assert_eq!(m.imports.packages.len(), 1);
        assert_eq!(m.imports.dynamic, vec!["com.example.ext.*"]);
        assert_eq!(m.requires.bundles.len(), 1);
        assert_eq!(m.native.libraries[0].entry, "native/libdemo.so");
        assert_eq!(
            m.metadata.entries.get("vendor").map(String::as_str),
            Some("Example Corp")
        );
    }

    #[test]
    fn minimal_manifest_defaults() {
        let m = parse_manifest_str(
            "manifest_version = 1\n[bundle]\nsymbolic_name = \"tiny\"\n",
        )
        .unwrap();
        assert_eq!(m.bundle.version, Version::default());
        assert!(m.exports.packages.is_empty());
        assert!(m.bundle.activator.is_none());
        assert!(!m.bundle.extension);
        assert_eq!(m.localization_base(), DEFAULT_LOCALIZATION_BASE);
    }

    #[test]
    fn rejects_unknown_fields() {
        let result = parse_manifest_str(
            "manifest_version = 2\n[bundle]\nsymbolic_name = \"x\"\nbogus = true\n",
        );
        assert!(result.is_err());
    }

    #[test]
    fn rejects_unsupported_version() {
        let result =
            parse_manifest_str("manifest_version = 9\n[bundle]\nsymbolic_name = \"x\"\n");
        assert!(matches!(result, Err(ManifestError::UnsupportedVersion(9))));
    }

    #[test]
    fn rejects_empty_symbolic_name() {
        let result =
            parse_manifest_str("manifest_version = 2\n[bundle]\nsymbolic_name = \"  \"\n");
        assert!(matches!(result, Err(ManifestError::EmptySymbolicName)));
    }

    #[test]
    fn rejects_empty_native_entry() {
        let result = parse_manifest_str(
            "manifest_version = 2\n[bundle]\nsymbolic_name = \"x\"\n[native]\nlibraries = [{ entry = \"\" }]\n",
        );
        assert!(matches!(result, Err(ManifestError::EmptyNativeEntry)));
    }

    #[test]
    fn execution_environments_split_and_trimmed() {
        let m = parse_manifest_str(FULL).unwrap();
        assert_eq!(
            m.required_execution_environments(),
            vec!["std-2021", "std-2018"]
        );
    }

    #[test]
    fn headers_flatten_core_and_metadata() {
        let m = parse_manifest_str(FULL).unwrap();
        let headers = m.headers();
        assert_eq!(
            headers.get("bundle.symbolic-name").map(String::as_str),
            Some("com.example.exporter")
        );
        assert_eq!(
            headers.get("bundle.exports").map(String::as_str),
            Some("com.example.api,com.example.util")
        );
        assert_eq!(headers.get("name").map(String::as_str), Some("%bundle.name"));
    }

    #[test]
    fn headers_omit_absent_fields() {
        let m = parse_manifest_str(
            "manifest_version = 1\n[bundle]\nsymbolic_name = \"tiny\"\n",
        )
        .unwrap();
        let headers = m.headers();
        assert!(!headers.contains_key("bundle.activator"));
        assert!(!headers.contains_key("bundle.update-location"));
    }
}
