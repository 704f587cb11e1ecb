//! Mutable per-bundle bookkeeping: lifecycle state, flags, the module
//! list, and localized header resolution.

use crate::activator::Activator;
use crate::bundle::BundleContext;
use crate::module::ModuleId;
use carrack_manifest::{locale_resource_names, parse_properties};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleState {
    Installed,
    Resolved,
    Starting,
    Active,
    Stopping,
    Uninstalled,
}

impl std::fmt::Display for BundleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BundleState::Installed => write!(f, "installed"),
            BundleState::Resolved => write!(f, "resolved"),
            BundleState::Starting => write!(f, "starting"),
            BundleState::Active => write!(f, "active"),
            BundleState::Stopping => write!(f, "stopping"),
            BundleState::Uninstalled => write!(f, "uninstalled"),
        }
    }
}

/// Transient state of one bundle. Persistent fields (persistent state,
/// start level, last-modified) live in the archive; this is everything that
/// evaporates on process exit.
pub struct BundleInfo {
    pub(crate) state: BundleState,
    pub(crate) removal_pending: bool,
    pub(crate) stale: bool,
    pub(crate) extension: bool,
    pub(crate) activator: Option<Box<dyn Activator>>,
    pub(crate) context: Option<BundleContext>,
    /// Opaque token a security provider attaches at install/update/refresh
    /// and consumes for permission decisions.
    pub(crate) protection_domain: Option<std::sync::Arc<dyn std::any::Any + Send + Sync>>,
    /// Modules oldest → newest; the last entry is the current revision's.
    pub(crate) modules: Vec<ModuleId>,
}

impl BundleInfo {
    pub fn new(extension: bool) -> Self {
        Self {
            state: BundleState::Installed,
            removal_pending: false,
            stale: false,
            extension,
            activator: None,
            context: None,
            protection_domain: None,
            modules: Vec::new(),
        }
    }

    pub fn current_module(&self) -> Option<ModuleId> {
        self.modules.last().copied()
    }
}

/// Localized header cache keyed by locale, invalidated when the bundle's
/// last-modified timestamp advances past the cache timestamp.
#[derive(Default)]
pub struct HeaderCache {
    pub(crate) timestamp: i64,
    pub(crate) by_locale: HashMap<String, BTreeMap<String, String>>,
}

/// Resolve `%key` header values against locale resources. `load_resource`
/// maps a resource name (without extension) to its bytes, typically from
/// revision content; unresolved keys render as the key itself.
pub fn localize_headers(
    raw: &BTreeMap<String, String>,
    base: &str,
    locale: &str,
    load_resource: impl Fn(&str) -> Option<Vec<u8>>,
) -> BTreeMap<String, String> {
    if !raw.values().any(|v| v.starts_with('%')) {
        return raw.clone();
    }

    let mut merged: BTreeMap<String, String> = BTreeMap::new();
    for name in locale_resource_names(base, locale) {
        if let Some(bytes) = load_resource(&format!("{name}.properties")) {
            if let Ok(text) = String::from_utf8(bytes) {
                merged.extend(parse_properties(&text));
            }
        }
    }

    raw.iter()
        .map(|(name, value)| {
            let resolved = match value.strip_prefix('%') {
                Some(key) => merged.get(key).cloned().unwrap_or_else(|| key.to_owned()),
                None => value.clone(),
            };
            (name.clone(), resolved)
        })
        .collect()
}
