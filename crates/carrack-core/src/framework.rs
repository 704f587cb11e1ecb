//! The framework: owns all container state and drives the system bundle's
//! own lifecycle.
//!
//! `init()` opens the bundle cache and reloads every persisted bundle,
//! `start()` raises the start level on the dedicated worker, and `stop()`
//! hands shutdown to its own thread so the caller returns immediately;
//! `wait_for_stop` blocks on the shutdown gate.

use crate::activator::Activator;
use crate::bundle::{Bundle, BundleContext, BundleState};
use crate::config::FrameworkConfig;
use crate::events::{
    BundleEvent, BundleEventKind, EventDispatcher, FrameworkEvent, FrameworkEventKind, ListenerId,
};
use crate::lock::LockCoordinator;
use crate::module::{ExportedPackage, ModuleGraph};
use crate::registry::{InMemoryServiceRegistry, ServiceRegistry};
use crate::resolver::{BasicResolver, Resolver};
use crate::security::SecurityProvider;
use crate::startlevel::{self, StartLevelCommand};
use crate::{BundleId, FrameworkError, PersistentState};
use carrack_cache::{BundleCache, CacheLayout};
use carrack_manifest::PackageName;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::AtomicU32;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Default)]
pub(crate) struct InstalledBundles {
    pub(crate) by_location: HashMap<String, Arc<Bundle>>,
    pub(crate) by_id: BTreeMap<BundleId, Arc<Bundle>>,
}

enum GateState {
    /// No shutdown in sight; waiters return immediately.
    Inactive,
    /// The framework is live; waiters block.
    Armed,
    /// Shutdown finished with this event.
    Open(FrameworkEvent),
}

pub(crate) struct ShutdownGate {
    state: Mutex<GateState>,
    cv: Condvar,
}

impl ShutdownGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Inactive),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn arm(&self) {
        *self.state.lock().expect("shutdown gate poisoned") = GateState::Armed;
    }

    pub(crate) fn open(&self, event: FrameworkEvent) {
        let mut guard = self.state.lock().expect("shutdown gate poisoned");
        *guard = GateState::Open(event);
        self.cv.notify_all();
    }

    /// Wait until the gate opens or the timeout elapses. `None` waits with
    /// no limit. Always yields a stop event; a timed-out wait reports the
    /// stop it did not observe.
    pub(crate) fn wait(&self, timeout: Option<std::time::Duration>) -> FrameworkEvent {
        let mut guard = self.state.lock().expect("shutdown gate poisoned");
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        loop {
            match &*guard {
                GateState::Inactive => return FrameworkEvent::stopped(),
                GateState::Open(event) => return event.clone(),
                GateState::Armed => match deadline {
                    Some(deadline) => {
                        let now = std::time::Instant::now();
                        if now >= deadline {
                            return FrameworkEvent::stopped();
                        }
                        let (g, _) = self
                            .cv
                            .wait_timeout(guard, deadline - now)
                            .expect("shutdown gate poisoned");
                        guard = g;
                    }
                    None => {
                        guard = self.cv.wait(guard).expect("shutdown gate poisoned");
                    }
                },
            }
        }
    }
}

pub(crate) struct FrameworkInner {
    config: FrameworkConfig,
    /// Serializes init/start/stop of the framework itself.
    admin: Mutex<()>,
    /// Mutable twin of the immutable config map; start-level writes land here.
    overrides: Mutex<BTreeMap<String, String>>,
    cache: OnceLock<Arc<BundleCache>>,
    pub(crate) installed: Mutex<InstalledBundles>,
    pub(crate) uninstalled: Mutex<Vec<Arc<Bundle>>>,
    pub(crate) locks: LockCoordinator,
    next_id: Mutex<BundleId>,
    pub(crate) graph: Mutex<ModuleGraph>,
    pub(crate) resolver: Box<dyn Resolver>,
    registry: Box<dyn ServiceRegistry>,
    pub(crate) security: Option<Box<dyn SecurityProvider>>,
    dispatcher: EventDispatcher,
    pub(crate) system: Arc<Bundle>,
    system_activators: Mutex<Vec<Box<dyn Activator>>>,
    pub(crate) active_start_level: AtomicU32,
    start_level_tx: Mutex<Option<mpsc::Sender<StartLevelCommand>>>,
    start_level_worker: Mutex<Option<JoinHandle<()>>>,
    shutdown_thread: Mutex<Option<JoinHandle<()>>>,
    pub(crate) shutdown_gate: ShutdownGate,
    self_weak: Weak<FrameworkInner>,
}

impl FrameworkInner {
    pub(crate) fn config(&self) -> &FrameworkConfig {
        &self.config
    }

    pub(crate) fn property(&self, key: &str) -> Option<String> {
        let overrides = self.overrides.lock().expect("config overrides poisoned");
        overrides
            .get(key)
            .cloned()
            .or_else(|| self.config.get(key).map(str::to_owned))
    }

    pub(crate) fn set_override(&self, key: &str, value: String) {
        self.overrides
            .lock()
            .expect("config overrides poisoned")
            .insert(key.to_owned(), value);
    }

    pub(crate) fn registry(&self) -> &dyn ServiceRegistry {
        self.registry.as_ref()
    }

    pub(crate) fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub(crate) fn weak(&self) -> Weak<FrameworkInner> {
        Weak::clone(&self.self_weak)
    }

    pub(crate) fn cache(&self) -> Result<&Arc<BundleCache>, FrameworkError> {
        self.cache
            .get()
            .ok_or_else(|| FrameworkError::State("the framework is not initialized".to_owned()))
    }

    pub(crate) fn bundle_by_id(&self, id: BundleId) -> Option<Arc<Bundle>> {
        self.installed
            .lock()
            .expect("installed bundles poisoned")
            .by_id
            .get(&id)
            .cloned()
    }

    pub(crate) fn bundle_by_location(&self, location: &str) -> Option<Arc<Bundle>> {
        self.installed
            .lock()
            .expect("installed bundles poisoned")
            .by_location
            .get(location)
            .cloned()
    }

    pub(crate) fn bundles_snapshot(&self) -> Vec<Arc<Bundle>> {
        self.installed
            .lock()
            .expect("installed bundles poisoned")
            .by_id
            .values()
            .cloned()
            .collect()
    }

    /// Resolve a locked bundle id to its handle, looking through the
    /// installed map, the uninstalled list, and the refresh targets.
    pub(crate) fn lookup_anywhere(
        &self,
        id: BundleId,
        extra: Option<&[Arc<Bundle>]>,
    ) -> Option<Arc<Bundle>> {
        if let Some(bundle) = self.bundle_by_id(id) {
            return Some(bundle);
        }
        if let Some(bundle) = self
            .uninstalled
            .lock()
            .expect("uninstalled bundles poisoned")
            .iter()
            .find(|b| b.id() == id)
        {
            return Some(Arc::clone(bundle));
        }
        extra.and_then(|bundles| bundles.iter().find(|b| b.id() == id).cloned())
    }

    /// Allocate the next bundle id, persisting the counter before the id is
    /// handed out. A failed write is logged; the id is still valid for this
    /// process lifetime.
    pub(crate) fn next_bundle_id(&self) -> BundleId {
        let mut guard = self.next_id.lock().expect("next id poisoned");
        let id = *guard;
        *guard += 1;
        match self.cache.get() {
            Some(cache) => {
                if let Err(e) = cache.store_next_id(*guard) {
                    warn!("unable to persist next bundle identifier: {e}");
                }
            }
            None => warn!("no cache open; next bundle identifier not persisted"),
        }
        id
    }

    pub(crate) fn bump_next_id_floor(&self, floor: BundleId) {
        let mut guard = self.next_id.lock().expect("next id poisoned");
        if *guard < floor {
            *guard = floor;
        }
    }

    pub(crate) fn fire_bundle_event(&self, kind: BundleEventKind, bundle: &Bundle) {
        debug!("bundle event {kind:?} for bundle {}", bundle.id());
        self.dispatcher.fire_bundle_event(&BundleEvent {
            kind,
            bundle_id: bundle.id(),
            location: bundle.location().to_owned(),
        });
    }

    pub(crate) fn fire_framework_event(&self, event: FrameworkEvent) {
        debug!("framework event {:?}", event.kind);
        self.dispatcher.fire_framework_event(&event);
    }

    pub(crate) fn remember_uninstalled(&self, bundle: &Arc<Bundle>) {
        let mut list = self.uninstalled.lock().expect("uninstalled bundles poisoned");
        if !list.iter().any(|b| b.id() == bundle.id()) {
            list.push(Arc::clone(bundle));
        }
    }

    pub(crate) fn forget_uninstalled(&self, id: BundleId) {
        self.uninstalled
            .lock()
            .expect("uninstalled bundles poisoned")
            .retain(|b| b.id() != id);
    }

    pub(crate) fn send_start_level_command(&self, command: StartLevelCommand) {
        let undelivered = {
            let guard = self.start_level_tx.lock().expect("start level channel poisoned");
            match guard.as_ref() {
                Some(tx) => tx.send(command).err().map(|e| e.0),
                None => Some(command),
            }
        };
        // No worker (not initialized, or winding down); apply inline so the
        // caller's level change is never silently lost.
        if let Some(StartLevelCommand::SetLevel { level, done }) = undelivered {
            if let Some(inner) = self.self_weak.upgrade() {
                startlevel::apply_start_level(&inner, level);
            }
            if let Some(done) = done {
                let _ = done.send(());
            }
        }
    }
}

pub struct Framework {
    pub(crate) inner: Arc<FrameworkInner>,
}

impl Framework {
    /// Non-owning view used by worker threads. Wrapped in `ManuallyDrop` so
    /// the handle's `Drop` (which joins those same workers) never runs.
    pub(crate) fn borrowed(inner: &Arc<FrameworkInner>) -> std::mem::ManuallyDrop<Framework> {
        std::mem::ManuallyDrop::new(Framework {
            inner: Arc::clone(inner),
        })
    }

    /// Create a framework with the built-in resolver and service registry.
    pub fn new(config: FrameworkConfig) -> Self {
        Self::with_collaborators(
            config,
            Box::new(BasicResolver::new()),
            Box::new(InMemoryServiceRegistry::new()),
            None,
        )
    }

    /// Create a framework with externally supplied collaborators.
    pub fn with_collaborators(
        mut config: FrameworkConfig,
        resolver: Box<dyn Resolver>,
        registry: Box<dyn ServiceRegistry>,
        security: Option<Box<dyn SecurityProvider>>,
    ) -> Self {
        let system_activators = config.take_system_activators();
        let inner = Arc::new_cyclic(|weak| FrameworkInner {
            config,
            admin: Mutex::new(()),
            overrides: Mutex::new(BTreeMap::new()),
            cache: OnceLock::new(),
            installed: Mutex::new(InstalledBundles::default()),
            uninstalled: Mutex::new(Vec::new()),
            locks: LockCoordinator::new(),
            next_id: Mutex::new(1),
            graph: Mutex::new(ModuleGraph::new()),
            resolver,
            registry,
            security,
            dispatcher: EventDispatcher::new(),
            system: Arc::new(Bundle::new_system()),
            system_activators: Mutex::new(system_activators),
            active_start_level: AtomicU32::new(0),
            start_level_tx: Mutex::new(None),
            start_level_worker: Mutex::new(None),
            shutdown_thread: Mutex::new(None),
            shutdown_gate: ShutdownGate::new(),
            self_weak: Weak::clone(weak),
        });
        Self { inner }
    }

    /// Lifecycle state of the system bundle, which doubles as the state of
    /// the framework.
    pub fn state(&self) -> BundleState {
        self.inner.system.state()
    }

    pub fn property(&self, key: &str) -> Option<String> {
        self.inner.property(key)
    }

    /// Initialize the framework: open the cache, reload persisted bundles,
    /// resolve the system bundle, and run the system activators.
    pub fn init(&self) -> Result<(), FrameworkError> {
        let _admin = self.inner.admin.lock().expect("admin lock poisoned");
        self.init_locked()
    }

    fn init_locked(&self) -> Result<(), FrameworkError> {
        let state = self.state();
        if !matches!(state, BundleState::Installed | BundleState::Resolved) {
            return Ok(());
        }
        info!("initializing framework");

        let config = self.inner.config();
        if self.inner.cache.get().is_none() {
            let layout = CacheLayout::resolve(
                config.get(crate::config::keys::CACHE_DIR),
                config
                    .get(crate::config::keys::CACHE_PROFILE)
                    .or(Some("default")),
                config.get(crate::config::keys::CACHE_PROFILE_DIR),
            )?;
            let cache = Arc::new(BundleCache::open(layout, config.cache_buf_size())?);
            // First init only: flush a cache the configuration declared stale.
            if state == BundleState::Installed && config.storage_clean_on_first_init() {
                info!("flushing bundle cache (framework.storage.clean=onFirstInit)");
                cache.flush()?;
            }
            let _ = self.inner.cache.set(cache);
        }

        {
            let mut installed = self
                .inner
                .installed
                .lock()
                .expect("installed bundles poisoned");
            installed
                .by_location
                .insert(self.inner.system.location().to_owned(), Arc::clone(&self.inner.system));
            installed
                .by_id
                .insert(crate::bundle::SYSTEM_BUNDLE_ID, Arc::clone(&self.inner.system));
        }

        // Give the system bundle its module so extensions have something to
        // attach their exports to.
        if self.inner.system.current_module().is_none() {
            let module = {
                let mut graph = self.inner.graph.lock().expect("module graph poisoned");
                let id = graph.add_module(
                    0,
                    crate::module::ModuleDefinition {
                        bundle_id: crate::bundle::SYSTEM_BUNDLE_ID,
                        symbolic_name: self.inner.system.symbolic_name(),
                        version: self.inner.system.version(),
                        exports: Vec::new(),
                        imports: Vec::new(),
                        dynamic_imports: Vec::new(),
                        required_bundles: Vec::new(),
                        native_libraries: Vec::new(),
                    },
                );
                graph.set_wires(id, Vec::new(), Vec::new());
                id
            };
            self.inner.system.add_module(module);
        }
        self.inner.system.set_state(BundleState::Resolved);

        self.reload_cached_bundles()?;

        self.inner.shutdown_gate.arm();
        self.inner.system.set_state(BundleState::Starting);

        // Run the system activators against the system bundle context.
        let context = BundleContext::new(crate::bundle::SYSTEM_BUNDLE_ID, self.inner.weak());
        self.inner.system.set_context(Some(context.clone()));
        {
            let mut activators = self
                .inner
                .system_activators
                .lock()
                .expect("system activators poisoned");
            for activator in activators.iter_mut() {
                activator.start(&context).map_err(|source| {
                    error!("unable to start a system activator: {source}");
                    FrameworkError::ActivatorStart {
                        bundle: crate::bundle::SYSTEM_BUNDLE_ID,
                        source,
                    }
                })?;
            }
        }

        self.spawn_start_level_worker();
        Ok(())
    }

    fn reload_cached_bundles(&self) -> Result<(), FrameworkError> {
        let cache = Arc::clone(self.inner.cache()?);
        let mut max_seen = 0;
        for archive in cache.get_archives() {
            max_seen = max_seen.max(archive.id());
            if archive.persistent_state() == PersistentState::Uninstalled {
                // Left over from a crash between uninstall and refresh.
                if let Err(e) = cache.remove(&archive) {
                    warn!("unable to remove uninstalled archive {}: {e}", archive.id());
                }
                continue;
            }
            let location = archive.location();
            if let Err(e) = self.install_internal(Some(archive.id()), &location, None) {
                error!("unable to re-install {location}: {e}");
                self.inner.fire_framework_event(FrameworkEvent::error(
                    archive.id(),
                    format!("unable to re-install {location}: {e}"),
                ));
            }
        }
        self.inner.bump_next_id_floor(max_seen + 1);
        if let Some(persisted) = cache.load_next_id() {
            self.inner.bump_next_id_floor(persisted);
        }
        Ok(())
    }

    /// Start the framework: init if needed, then raise the start level to
    /// the configured target and declare the system bundle active.
    pub fn start(&self) -> Result<(), FrameworkError> {
        let _admin = self.inner.admin.lock().expect("admin lock poisoned");
        if matches!(self.state(), BundleState::Installed | BundleState::Resolved) {
            self.init_locked()?;
        }
        if self.state() != BundleState::Starting {
            return Ok(());
        }

        let target = self.inner.config().framework_start_level();
        self.set_start_level_and_wait_internal(target);

        self.inner.system.set_state(BundleState::Active);
        self.inner
            .fire_bundle_event(BundleEventKind::Started, &self.inner.system);
        self.inner.fire_framework_event(FrameworkEvent {
            kind: FrameworkEventKind::Started,
            bundle_id: Some(crate::bundle::SYSTEM_BUNDLE_ID),
            message: None,
        });
        info!("framework started at start level {target}");
        Ok(())
    }

    /// Start options are accepted for interface compatibility and ignored.
    pub fn start_with_options(&self, _options: u32) -> Result<(), FrameworkError> {
        self.start()
    }

    /// Stop the framework asynchronously. The shutdown worker lowers the
    /// start level to zero, refreshes pending bundles, stops the system
    /// activators, and opens the shutdown gate.
    pub fn stop(&self) -> Result<(), FrameworkError> {
        match self.state() {
            BundleState::Active => {}
            BundleState::Installed | BundleState::Resolved => return Ok(()),
            BundleState::Starting | BundleState::Stopping => {
                return Err(FrameworkError::InvalidTransition {
                    bundle: crate::bundle::SYSTEM_BUNDLE_ID,
                    reason: "the framework is already starting or stopping".to_owned(),
                })
            }
            BundleState::Uninstalled => {
                return Err(FrameworkError::State(
                    "the framework is uninstalled".to_owned(),
                ))
            }
        }

        self.inner.system.set_state(BundleState::Stopping);
        self.inner
            .fire_bundle_event(BundleEventKind::Stopping, &self.inner.system);

        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("carrack-shutdown".to_owned())
            .spawn(move || shutdown_sequence(&inner))
            .map_err(|e| FrameworkError::State(format!("unable to spawn shutdown worker: {e}")))?;
        *self
            .inner
            .shutdown_thread
            .lock()
            .expect("shutdown thread poisoned") = Some(handle);
        Ok(())
    }

    pub fn stop_with_options(&self, _options: u32) -> Result<(), FrameworkError> {
        self.stop()
    }

    /// Block until the framework has stopped or the timeout elapses.
    pub fn wait_for_stop(&self, timeout_ms: i64) -> Result<FrameworkEvent, FrameworkError> {
        if timeout_ms < 0 {
            return Err(FrameworkError::Argument(
                "timeout cannot be negative".to_owned(),
            ));
        }
        // Zero means no limit.
        let timeout = (timeout_ms > 0).then(|| std::time::Duration::from_millis(timeout_ms as u64));
        Ok(self.inner.shutdown_gate.wait(timeout))
    }

    /// Updating the system bundle means restarting the whole framework,
    /// which an embedded container cannot do on its own.
    pub fn update(&self) -> Result<(), FrameworkError> {
        Err(FrameworkError::State(
            "updating the system bundle requires a framework restart".to_owned(),
        ))
    }

    /// Stream form of [`update`](Self::update); the stream is ignored for
    /// the same reason the update is refused.
    pub fn update_from_stream(&self, _stream: &mut dyn std::io::Read) -> Result<(), FrameworkError> {
        self.update()
    }

    pub fn get_bundle(&self, id: BundleId) -> Option<Arc<Bundle>> {
        self.inner.bundle_by_id(id)
    }

    pub fn get_bundle_by_location(&self, location: &str) -> Option<Arc<Bundle>> {
        self.inner.bundle_by_location(location)
    }

    /// All installed bundles ordered by id, system bundle first.
    pub fn get_bundles(&self) -> Vec<Arc<Bundle>> {
        self.inner.bundles_snapshot()
    }

    pub fn add_bundle_listener(
        &self,
        listener: impl Fn(&BundleEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner
            .dispatcher()
            .add_bundle_listener(crate::bundle::SYSTEM_BUNDLE_ID, listener)
    }

    pub fn add_framework_listener(
        &self,
        listener: impl Fn(&FrameworkEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner
            .dispatcher()
            .add_framework_listener(crate::bundle::SYSTEM_BUNDLE_ID, listener)
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.inner.dispatcher().remove_listener(id);
    }

    /// Resolved exports of one package name across all bundles.
    pub fn get_exported_packages(&self, package: &PackageName) -> Vec<ExportedPackage> {
        self.inner
            .graph
            .lock()
            .expect("module graph poisoned")
            .exported_packages(None, Some(package))
    }

    /// Resolved exports offered by one bundle, across all its live revisions.
    pub fn get_exported_packages_of(&self, bundle: &Arc<Bundle>) -> Vec<ExportedPackage> {
        self.inner
            .graph
            .lock()
            .expect("module graph poisoned")
            .exported_packages(Some(bundle.id()), None)
    }

    /// Bundles wired to the given export.
    pub fn get_importing_bundles(&self, export: &ExportedPackage) -> Vec<Arc<Bundle>> {
        let ids = self
            .inner
            .graph
            .lock()
            .expect("module graph poisoned")
            .importers_of_export(export);
        ids.into_iter()
            .filter_map(|id| self.inner.bundle_by_id(id))
            .collect()
    }

    fn spawn_start_level_worker(&self) {
        let mut tx_guard = self
            .inner
            .start_level_tx
            .lock()
            .expect("start level channel poisoned");
        if tx_guard.is_some() {
            return;
        }
        let (tx, rx) = mpsc::channel();
        let weak = self.inner.weak();
        let handle = std::thread::Builder::new()
            .name("carrack-startlevel".to_owned())
            .spawn(move || startlevel::worker_loop(weak, rx));
        match handle {
            Ok(handle) => {
                *tx_guard = Some(tx);
                *self
                    .inner
                    .start_level_worker
                    .lock()
                    .expect("start level worker poisoned") = Some(handle);
            }
            Err(e) => warn!("unable to spawn start level worker: {e}"),
        }
    }
}

/// The shutdown worker body: drains bundles, refreshes leftovers, stops the
/// system activators, and opens the gate.
fn shutdown_sequence(inner: &Arc<FrameworkInner>) {
    info!("framework shutdown commencing");
    let framework = Framework::borrowed(inner);
    framework.set_start_level_and_wait_internal(0);

    // Purge old revisions of updated-but-not-refreshed bundles.
    for bundle in inner.bundles_snapshot() {
        let Some(archive) = bundle.archive() else {
            continue;
        };
        if archive.revision_count() > 1 {
            if let Err(e) = framework.purge_bundle(&bundle) {
                error!("unable to purge bundle {}: {e}", bundle.id());
                inner.fire_framework_event(FrameworkEvent::error(
                    bundle.id(),
                    format!("unable to purge bundle: {e}"),
                ));
            }
        }
    }

    // Garbage-collect bundles uninstalled but never refreshed.
    let leftovers: Vec<Arc<Bundle>> = {
        let mut list = inner.uninstalled.lock().expect("uninstalled bundles poisoned");
        std::mem::take(&mut *list)
    };
    for bundle in leftovers {
        if let Err(e) = framework.garbage_collect_bundle(&bundle) {
            error!("unable to remove {}: {e}", bundle.location());
        }
    }

    // Drop every module so nothing references revision content anymore,
    // and empty the installed map so a later init() reloads from the cache.
    {
        let mut graph = inner.graph.lock().expect("module graph poisoned");
        let ids: Vec<crate::module::ModuleId> = graph.iter().map(|(id, _)| id).collect();
        for id in ids {
            graph.remove_module(id);
        }
    }
    {
        let mut installed = inner.installed.lock().expect("installed bundles poisoned");
        installed.by_location.clear();
        installed.by_id.clear();
    }
    inner.system.info().modules.clear();

    // Stop system activators in registration order.
    let context = inner.system.context();
    if let Some(context) = context {
        let mut activators = inner
            .system_activators
            .lock()
            .expect("system activators poisoned");
        for activator in activators.iter_mut() {
            if let Err(e) = activator.stop(&context) {
                warn!("exception stopping a system activator: {e}");
            }
        }
        context.invalidate();
    }
    inner.system.set_context(None);

    inner.system.set_state(BundleState::Resolved);
    let event = FrameworkEvent::stopped();
    inner.fire_framework_event(event.clone());
    inner.shutdown_gate.open(event);
    info!("framework shutdown complete");
}

impl Drop for Framework {
    fn drop(&mut self) {
        // Wind down the worker threads; the queue survives until the worker
        // drains it.
        let tx = self
            .inner
            .start_level_tx
            .lock()
            .expect("start level channel poisoned")
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(StartLevelCommand::Shutdown);
        }
        let worker = self
            .inner
            .start_level_worker
            .lock()
            .expect("start level worker poisoned")
            .take();
        if let Some(handle) = worker {
            let _ = handle.join();
        }
        let shutdown = self
            .inner
            .shutdown_thread
            .lock()
            .expect("shutdown thread poisoned")
            .take();
        if let Some(handle) = shutdown {
            let _ = handle.join();
        }
    }
}
