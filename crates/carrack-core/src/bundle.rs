//! The bundle identity callers manipulate, and the context handed to its
//! activator.

use crate::activator::Activator;
use crate::events::ListenerId;
use crate::framework::FrameworkInner;
use crate::info::{localize_headers, BundleInfo, HeaderCache};
use crate::module::ModuleId;
use crate::registry::Service;
use crate::{BundleId, FrameworkError};
use carrack_cache::{BundleArchive, PersistentState};
use carrack_manifest::{BundleManifest, SymbolicName, Version};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::warn;

pub use crate::info::BundleState;

/// Bundle id 0 is reserved for the system bundle.
pub const SYSTEM_BUNDLE_ID: BundleId = 0;
pub const SYSTEM_BUNDLE_LOCATION: &str = "System Bundle";
pub const SYSTEM_BUNDLE_SYMBOLIC_NAME: &str = "system.bundle";

enum BundleBacking {
    /// The framework itself; nothing on disk backs it.
    System,
    Regular(Arc<BundleArchive>),
}

pub struct Bundle {
    id: BundleId,
    location: String,
    backing: BundleBacking,
    info: Mutex<BundleInfo>,
    header_cache: Mutex<HeaderCache>,
}

impl Bundle {
    pub(crate) fn new_regular(archive: Arc<BundleArchive>, extension: bool) -> Self {
        Self {
            id: archive.id(),
            location: archive.location(),
            backing: BundleBacking::Regular(archive),
            info: Mutex::new(BundleInfo::new(extension)),
            header_cache: Mutex::new(HeaderCache::default()),
        }
    }

    pub(crate) fn new_system() -> Self {
        Self {
            id: SYSTEM_BUNDLE_ID,
            location: SYSTEM_BUNDLE_LOCATION.to_owned(),
            backing: BundleBacking::System,
            info: Mutex::new(BundleInfo::new(false)),
            header_cache: Mutex::new(HeaderCache::default()),
        }
    }

    pub fn id(&self) -> BundleId {
        self.id
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn is_system(&self) -> bool {
        matches!(self.backing, BundleBacking::System)
    }

    pub(crate) fn archive(&self) -> Option<&Arc<BundleArchive>> {
        match &self.backing {
            BundleBacking::System => None,
            BundleBacking::Regular(archive) => Some(archive),
        }
    }

    pub(crate) fn info(&self) -> MutexGuard<'_, BundleInfo> {
        self.info.lock().expect("bundle info poisoned")
    }

    pub fn state(&self) -> BundleState {
        self.info().state
    }

    pub(crate) fn set_state(&self, state: BundleState) {
        self.info().state = state;
    }

    pub fn is_extension(&self) -> bool {
        self.info().extension
    }

    pub(crate) fn set_extension(&self, extension: bool) {
        self.info().extension = extension;
    }

    pub fn is_removal_pending(&self) -> bool {
        self.info().removal_pending
    }

    pub(crate) fn set_removal_pending(&self, pending: bool) {
        self.info().removal_pending = pending;
    }

    pub fn is_stale(&self) -> bool {
        self.info().stale
    }

    pub(crate) fn set_stale(&self) {
        self.info().stale = true;
    }

    pub fn modules(&self) -> Vec<ModuleId> {
        self.info().modules.clone()
    }

    pub fn current_module(&self) -> Option<ModuleId> {
        self.info().current_module()
    }

    pub(crate) fn add_module(&self, module: ModuleId) {
        self.info().modules.push(module);
    }

    pub(crate) fn take_activator(&self) -> Option<Box<dyn Activator>> {
        self.info().activator.take()
    }

    pub(crate) fn set_activator(&self, activator: Option<Box<dyn Activator>>) {
        self.info().activator = activator;
    }

    /// The opaque protection domain a security provider attached, if any.
    pub fn protection_domain(&self) -> Option<Arc<dyn std::any::Any + Send + Sync>> {
        self.info().protection_domain.clone()
    }

    /// Attach a protection domain. Called by security providers from
    /// `check_bundle`; refresh drops it and the provider attaches a fresh one.
    pub fn set_protection_domain(&self, domain: Arc<dyn std::any::Any + Send + Sync>) {
        self.info().protection_domain = Some(domain);
    }

    pub(crate) fn context(&self) -> Option<BundleContext> {
        self.info().context.clone()
    }

    pub(crate) fn set_context(&self, context: Option<BundleContext>) {
        self.info().context = context;
    }

    /// The remembered running intent, persisted in the archive. The system
    /// bundle is always active.
    pub fn persistent_state(&self) -> PersistentState {
        match &self.backing {
            BundleBacking::System => PersistentState::Active,
            BundleBacking::Regular(archive) => archive.persistent_state(),
        }
    }

    /// Persist the running intent. A cache write failure here is tolerated:
    /// the in-memory lifecycle must not fail because state could not be
    /// recorded.
    pub(crate) fn set_persistent_state(&self, state: PersistentState) {
        if let BundleBacking::Regular(archive) = &self.backing {
            if let Err(e) = archive.set_persistent_state(state) {
                warn!("unable to persist state of bundle {}: {e}", self.id);
            }
        }
    }

    pub fn start_level(&self) -> u32 {
        match &self.backing {
            BundleBacking::System => 0,
            BundleBacking::Regular(archive) => archive.start_level(),
        }
    }

    pub(crate) fn set_start_level(&self, level: u32) -> Result<(), FrameworkError> {
        match &self.backing {
            BundleBacking::System => Err(FrameworkError::Argument(
                "cannot set the start level of the system bundle".to_owned(),
            )),
            BundleBacking::Regular(archive) => {
                archive.set_start_level(level)?;
                Ok(())
            }
        }
    }

    pub fn last_modified(&self) -> i64 {
        match &self.backing {
            BundleBacking::System => 0,
            BundleBacking::Regular(archive) => archive.last_modified(),
        }
    }

    pub(crate) fn touch_last_modified(&self) {
        if let BundleBacking::Regular(archive) = &self.backing {
            let now = chrono::Utc::now().timestamp_millis();
            if let Err(e) = archive.set_last_modified(now) {
                warn!("unable to persist last-modified of bundle {}: {e}", self.id);
            }
        }
    }

    /// The manifest of the newest revision.
    pub fn manifest(&self) -> Option<BundleManifest> {
        match &self.backing {
            BundleBacking::System => None,
            BundleBacking::Regular(archive) => {
                Some(archive.current_revision().manifest().clone())
            }
        }
    }

    pub fn symbolic_name(&self) -> SymbolicName {
        match &self.backing {
            BundleBacking::System => SymbolicName::new(SYSTEM_BUNDLE_SYMBOLIC_NAME),
            BundleBacking::Regular(archive) => archive
                .current_revision()
                .manifest()
                .bundle
                .symbolic_name
                .clone(),
        }
    }

    pub fn version(&self) -> Version {
        match &self.backing {
            BundleBacking::System => {
                Version::parse(env!("CARGO_PKG_VERSION")).unwrap_or_default()
            }
            BundleBacking::Regular(archive) => {
                archive.current_revision().manifest().bundle.version.clone()
            }
        }
    }

    /// Raw headers of the newest revision's manifest.
    pub fn headers(&self) -> BTreeMap<String, String> {
        match &self.backing {
            BundleBacking::System => {
                let mut map = BTreeMap::new();
                map.insert(
                    "bundle.symbolic-name".to_owned(),
                    SYSTEM_BUNDLE_SYMBOLIC_NAME.to_owned(),
                );
                map.insert("bundle.version".to_owned(), self.version().to_string());
                map
            }
            BundleBacking::Regular(archive) => archive.current_revision().headers(),
        }
    }

    /// Headers with `%key` values resolved for the locale. Cached per
    /// locale; the cache is dropped when the bundle is modified.
    pub fn localized_headers(&self, locale: &str) -> BTreeMap<String, String> {
        {
            let mut cache = self.header_cache.lock().expect("header cache poisoned");
            if self.last_modified() > cache.timestamp {
                cache.by_locale.clear();
            } else if let Some(cached) = cache.by_locale.get(locale) {
                return cached.clone();
            }
        }

        let raw = self.headers();
        let localized = match &self.backing {
            BundleBacking::System => raw,
            BundleBacking::Regular(archive) => {
                let revision = archive.current_revision();
                let base = revision.manifest().localization_base().to_owned();
                localize_headers(&raw, &base, locale, |name| {
                    revision.content().entry(name).ok().flatten()
                })
            }
        };

        let mut cache = self.header_cache.lock().expect("header cache poisoned");
        cache.timestamp = chrono::Utc::now().timestamp_millis();
        cache
            .by_locale
            .insert(locale.to_owned(), localized.clone());
        localized
    }
}

impl std::fmt::Debug for Bundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bundle")
            .field("id", &self.id)
            .field("location", &self.location)
            .field("state", &self.state())
            .finish()
    }
}

/// The capability handle a bundle's activator works through. Invalidated
/// when the bundle stops; operations on an invalid context fail.
#[derive(Clone)]
pub struct BundleContext {
    bundle_id: BundleId,
    valid: Arc<AtomicBool>,
    inner: Weak<FrameworkInner>,
}

impl BundleContext {
    pub(crate) fn new(bundle_id: BundleId, inner: Weak<FrameworkInner>) -> Self {
        Self {
            bundle_id,
            valid: Arc::new(AtomicBool::new(true)),
            inner,
        }
    }

    pub fn bundle_id(&self) -> BundleId {
        self.bundle_id
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    fn framework(&self) -> Result<Arc<FrameworkInner>, FrameworkError> {
        if !self.is_valid() {
            return Err(FrameworkError::State(format!(
                "the context of bundle {} is no longer valid",
                self.bundle_id
            )));
        }
        self.inner
            .upgrade()
            .ok_or(FrameworkError::ShuttingDown)
    }

    pub fn property(&self, key: &str) -> Result<Option<String>, FrameworkError> {
        Ok(self.framework()?.property(key))
    }

    pub fn register_service(&self, name: &str, service: Service) -> Result<u64, FrameworkError> {
        let inner = self.framework()?;
        Ok(inner.registry().register(self.bundle_id, name, service))
    }

    pub fn get_service(&self, name: &str) -> Result<Option<Service>, FrameworkError> {
        let inner = self.framework()?;
        Ok(inner.registry().get_service(self.bundle_id, name))
    }

    pub fn add_bundle_listener(
        &self,
        listener: impl Fn(&crate::events::BundleEvent) + Send + Sync + 'static,
    ) -> Result<ListenerId, FrameworkError> {
        let inner = self.framework()?;
        Ok(inner.dispatcher().add_bundle_listener(self.bundle_id, listener))
    }

    pub fn add_framework_listener(
        &self,
        listener: impl Fn(&crate::events::FrameworkEvent) + Send + Sync + 'static,
    ) -> Result<ListenerId, FrameworkError> {
        let inner = self.framework()?;
        Ok(inner
            .dispatcher()
            .add_framework_listener(self.bundle_id, listener))
    }

    /// A file inside the bundle's private persistent data area.
    pub fn data_file(&self, relative: &str) -> Result<PathBuf, FrameworkError> {
        let inner = self.framework()?;
        let bundle = inner
            .bundle_by_id(self.bundle_id)
            .ok_or_else(|| FrameworkError::State("bundle is gone".to_owned()))?;
        let archive = bundle.archive().ok_or_else(|| {
            FrameworkError::Argument("the system bundle has no data area".to_owned())
        })?;
        Ok(archive.data_file(relative)?)
    }
}
