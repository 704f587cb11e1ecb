//! The bundle lifecycle state machine: install, resolve, start, stop,
//! update, uninstall.
//!
//! Every mutating operation runs under the target bundle's reentrant lock.
//! Starting a bundle may resolve it first; updating appends a revision and
//! leaves the old one serving existing dependents until a refresh; both
//! record rollback obligations before touching the cache.

use crate::bundle::{Bundle, BundleContext, BundleState, SYSTEM_BUNDLE_ID};
use crate::events::{BundleEventKind, FrameworkEvent};
use crate::framework::Framework;
use crate::module::{ModuleDefinition, ModuleId};
use crate::{BundleId, FrameworkError, PersistentState};
use carrack_cache::BundleArchive;
use carrack_manifest::BundleManifest;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, info, warn};

impl Framework {
    /// Install a bundle from a location string.
    pub fn install(&self, location: &str) -> Result<Arc<Bundle>, FrameworkError> {
        self.install_internal(None, location, None)
    }

    /// Install a bundle whose content is supplied as a byte stream; the
    /// location is only an identifier.
    pub fn install_from_stream(
        &self,
        location: &str,
        stream: &mut dyn Read,
    ) -> Result<Arc<Bundle>, FrameworkError> {
        self.install_internal(None, location, Some(stream))
    }

    /// Shared install path. `existing_id` is set when reloading a cached
    /// bundle during `init()`.
    pub(crate) fn install_internal(
        &self,
        existing_id: Option<BundleId>,
        location: &str,
        stream: Option<&mut dyn Read>,
    ) -> Result<Arc<Bundle>, FrameworkError> {
        self.inner.locks.acquire_install_lock(location);
        let result = self.do_install(existing_id, location, stream);
        self.inner.locks.release_install_lock(location);

        match result {
            Ok((bundle, created)) => {
                if created {
                    self.inner
                        .fire_bundle_event(BundleEventKind::Installed, &bundle);
                }
                Ok(bundle)
            }
            Err(e) => Err(e),
        }
    }

    fn do_install(
        &self,
        existing_id: Option<BundleId>,
        location: &str,
        stream: Option<&mut dyn Read>,
    ) -> Result<(Arc<Bundle>, bool), FrameworkError> {
        if matches!(
            self.state(),
            BundleState::Stopping | BundleState::Uninstalled
        ) {
            return Err(FrameworkError::ShuttingDown);
        }

        // An already installed location returns the existing bundle.
        if let Some(bundle) = self.inner.bundle_by_location(location) {
            return Ok((bundle, false));
        }

        let cache = Arc::clone(self.inner.cache()?);
        let is_new = existing_id.is_none();
        let id = match existing_id {
            Some(id) => id,
            None => self.inner.next_bundle_id(),
        };

        if is_new {
            cache.create(id, location, self.initial_bundle_start_level(), stream)?;
        } else {
            // A multi-revision archive at reload means the last session
            // crashed before its refresh; purge the stale revisions now.
            match cache.get(id) {
                Ok(archive) if archive.revision_count() > 1 => {
                    if let Err(e) = archive.purge() {
                        warn!("could not purge bundle {id} at reload: {e}");
                    }
                }
                Ok(_) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let bundle = match self.build_bundle(id) {
            Ok(bundle) => bundle,
            Err(e) => {
                if is_new {
                    if let Ok(archive) = cache.get(id) {
                        if let Err(rm) = cache.remove(&archive) {
                            warn!("could not remove archive of failed install: {rm}");
                        }
                    }
                }
                return Err(e);
            }
        };

        if is_new {
            bundle.touch_last_modified();
        }

        {
            let mut installed = self
                .inner
                .installed
                .lock()
                .expect("installed bundles poisoned");
            installed
                .by_location
                .insert(location.to_owned(), Arc::clone(&bundle));
            installed.by_id.insert(id, Arc::clone(&bundle));
        }

        if bundle.is_extension() {
            // Extensions resolve against the system bundle immediately and
            // never pass through starting/active.
            self.inner.locks.acquire_bundle_lock(SYSTEM_BUNDLE_ID);
            bundle.set_state(BundleState::Resolved);
            self.inner.locks.release_bundle_lock(SYSTEM_BUNDLE_ID);
        }

        info!("installed bundle {id} from {location}");
        Ok((bundle, true))
    }

    /// Build the bundle object and its module for the newest revision.
    fn build_bundle(&self, id: BundleId) -> Result<Arc<Bundle>, FrameworkError> {
        let cache = self.inner.cache()?;
        let archive = cache.get(id)?;
        let manifest = archive.current_revision().manifest().clone();
        let is_extension = manifest.bundle.extension;

        let bundle = Arc::new(Bundle::new_regular(Arc::clone(&archive), is_extension));

        let module = match self.create_module(&archive, archive.revision_count() - 1, is_extension)
        {
            Ok(module) => module,
            Err(e) => {
                bundle.set_removal_pending(true);
                return Err(e);
            }
        };
        bundle.add_module(module);

        if let Some(security) = self.inner.security.as_ref() {
            if let Err(e) = security.check_bundle(&bundle) {
                bundle.set_removal_pending(true);
                return Err(e);
            }
        }

        if is_extension {
            self.attach_extension_exports(&manifest);
        }

        Ok(bundle)
    }

    /// Create the module for one revision: parse-level checks, identity
    /// uniqueness, execution environment, and native library presence.
    pub(crate) fn create_module(
        &self,
        archive: &Arc<BundleArchive>,
        revision_index: usize,
        strip_exports: bool,
    ) -> Result<ModuleId, FrameworkError> {
        let revision = archive.revision(revision_index).ok_or_else(|| {
            FrameworkError::State(format!(
                "bundle {} has no revision {revision_index}",
                archive.id()
            ))
        })?;
        let manifest = revision.manifest();
        let bundle_id = archive.id();

        // Identity uniqueness is a manifest format 2 guarantee.
        if manifest.manifest_version >= 2 {
            let name = &manifest.bundle.symbolic_name;
            let version = &manifest.bundle.version;
            for other in self.inner.bundles_snapshot() {
                if other.id() != bundle_id
                    && !other.is_system()
                    && other.symbolic_name() == *name
                    && other.version() == *version
                {
                    return Err(FrameworkError::DuplicateIdentity {
                        name: name.to_string(),
                        version: version.to_string(),
                    });
                }
            }
        }

        self.verify_execution_environment(manifest)?;

        for lib in &manifest.native.libraries {
            if revision.native_library_path(&lib.entry).is_none() {
                return Err(FrameworkError::MissingNativeLibrary(lib.entry.clone()));
            }
        }

        let definition = ModuleDefinition {
            bundle_id,
            symbolic_name: manifest.bundle.symbolic_name.clone(),
            version: manifest.bundle.version.clone(),
            // Extension exports are attached to the system module instead.
            exports: if strip_exports {
                Vec::new()
            } else {
                manifest.exports.packages.clone()
            },
            imports: manifest.imports.packages.clone(),
            dynamic_imports: manifest.imports.dynamic.clone(),
            required_bundles: manifest.requires.bundles.clone(),
            native_libraries: manifest.native.libraries.clone(),
        };

        let module = self
            .inner
            .graph
            .lock()
            .expect("module graph poisoned")
            .add_module(revision_index, definition);
        debug!("created module {bundle_id}.{revision_index}");
        Ok(module)
    }

    fn verify_execution_environment(
        &self,
        manifest: &BundleManifest,
    ) -> Result<(), FrameworkError> {
        let required = manifest.required_execution_environments();
        if required.is_empty() {
            return Ok(());
        }
        let provided = self
            .inner
            .property(crate::config::keys::EXECUTION_ENVIRONMENT)
            .map(|s| {
                s.split(',')
                    .map(|t| t.trim().to_owned())
                    .filter(|t| !t.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        // An unset framework environment accepts everything.
        if provided.is_empty() {
            return Ok(());
        }
        if required.iter().any(|r| provided.iter().any(|p| p == r)) {
            Ok(())
        } else {
            Err(FrameworkError::UnsupportedEnvironment(
                required.join(","),
            ))
        }
    }

    /// Merge an extension bundle's exports into the system module.
    fn attach_extension_exports(&self, manifest: &BundleManifest) {
        let Some(system_module) = self.inner.system.current_module() else {
            return;
        };
        let mut graph = self.inner.graph.lock().expect("module graph poisoned");
        if let Some(node) = graph.node_mut(system_module) {
            for package in &manifest.exports.packages {
                if !node.definition.exports.contains(package) {
                    node.definition.exports.push(package.clone());
                }
            }
        }
    }

    fn with_bundle_lock<T>(
        &self,
        bundle: &Arc<Bundle>,
        op: impl FnOnce() -> Result<T, FrameworkError>,
    ) -> Result<T, FrameworkError> {
        self.inner.locks.acquire_bundle_lock(bundle.id());
        let result = op();
        self.inner.locks.release_bundle_lock(bundle.id());
        result
    }

    /// Start a bundle, recording the persistent intent to run.
    pub fn start_bundle(&self, bundle: &Arc<Bundle>) -> Result<(), FrameworkError> {
        if bundle.is_system() {
            return self.start();
        }
        self.with_bundle_lock(bundle, || self.start_bundle_locked(bundle, true))
    }

    /// Transient start: no persistent state change.
    pub(crate) fn start_bundle_transient(&self, bundle: &Arc<Bundle>) -> Result<(), FrameworkError> {
        self.with_bundle_lock(bundle, || self.start_bundle_locked(bundle, false))
    }

    fn start_bundle_locked(
        &self,
        bundle: &Arc<Bundle>,
        record: bool,
    ) -> Result<(), FrameworkError> {
        if bundle.is_extension() {
            return Ok(());
        }

        if record {
            bundle.set_persistent_state(PersistentState::Active);
        }

        let level = bundle.start_level();
        let active_level = self
            .inner
            .active_start_level
            .load(std::sync::atomic::Ordering::SeqCst);
        if level > active_level {
            if !record {
                return Err(FrameworkError::InvalidTransition {
                    bundle: bundle.id(),
                    reason: format!(
                        "start level {level} is greater than the framework start level {active_level}"
                    ),
                });
            }
            // The persistent intent is recorded; the start-level controller
            // starts the bundle once the framework level reaches it.
            return Ok(());
        }

        match bundle.state() {
            BundleState::Uninstalled => {
                return Err(FrameworkError::State(
                    "cannot start an uninstalled bundle".to_owned(),
                ))
            }
            BundleState::Starting | BundleState::Stopping => {
                return Err(FrameworkError::InvalidTransition {
                    bundle: bundle.id(),
                    reason: "the bundle is already starting or stopping".to_owned(),
                })
            }
            BundleState::Active => return Ok(()),
            BundleState::Installed => {
                self.resolve_bundle_locked(bundle)?;
            }
            BundleState::Resolved => {}
        }

        bundle.set_state(BundleState::Starting);
        self.inner
            .fire_bundle_event(BundleEventKind::Starting, bundle);

        match self.activate(bundle) {
            Ok(()) => {
                bundle.set_state(BundleState::Active);
                self.inner
                    .fire_bundle_event(BundleEventKind::Started, bundle);
                Ok(())
            }
            Err(e) => {
                bundle.set_state(BundleState::Resolved);
                if let Some(context) = bundle.context() {
                    context.invalidate();
                }
                bundle.set_context(None);
                bundle.set_activator(None);
                self.inner.registry().unregister_services(bundle.id());
                self.inner.registry().unget_services(bundle.id());
                self.inner.dispatcher().remove_listeners_of(bundle.id());
                Err(e)
            }
        }
    }

    fn activate(&self, bundle: &Arc<Bundle>) -> Result<(), FrameworkError> {
        let context = BundleContext::new(bundle.id(), self.inner.weak());
        bundle.set_context(Some(context.clone()));

        let activator_name = bundle.manifest().and_then(|m| m.bundle.activator);
        let Some(name) = activator_name else {
            return Ok(());
        };
        let mut activator = self
            .inner
            .config()
            .activators()
            .create(&name)
            .ok_or(FrameworkError::ActivatorNotFound(name))?;

        let result = activator.start(&context);
        bundle.set_activator(Some(activator));
        result.map_err(|source| FrameworkError::ActivatorStart {
            bundle: bundle.id(),
            source,
        })
    }

    /// Stop a bundle, recording the persistent intent to stay stopped.
    pub fn stop_bundle(&self, bundle: &Arc<Bundle>) -> Result<(), FrameworkError> {
        if bundle.is_system() {
            return self.stop();
        }
        self.with_bundle_lock(bundle, || self.stop_bundle_locked(bundle, true))
    }

    /// Transient stop: no persistent state change.
    pub(crate) fn stop_bundle_transient(&self, bundle: &Arc<Bundle>) -> Result<(), FrameworkError> {
        self.with_bundle_lock(bundle, || self.stop_bundle_locked(bundle, false))
    }

    fn stop_bundle_locked(
        &self,
        bundle: &Arc<Bundle>,
        record: bool,
    ) -> Result<(), FrameworkError> {
        if record {
            bundle.set_persistent_state(PersistentState::Installed);
        }

        match bundle.state() {
            BundleState::Uninstalled => {
                return Err(FrameworkError::State(
                    "cannot stop an uninstalled bundle".to_owned(),
                ))
            }
            BundleState::Starting | BundleState::Stopping => {
                return Err(FrameworkError::InvalidTransition {
                    bundle: bundle.id(),
                    reason: "stopping a bundle that is starting or stopping is not supported"
                        .to_owned(),
                })
            }
            BundleState::Installed | BundleState::Resolved => return Ok(()),
            BundleState::Active => {}
        }

        bundle.set_state(BundleState::Stopping);
        self.inner
            .fire_bundle_event(BundleEventKind::Stopping, bundle);

        let mut stop_error = None;
        if let Some(mut activator) = bundle.take_activator() {
            if let Some(context) = bundle.context() {
                if let Err(source) = activator.stop(&context) {
                    warn!("error stopping bundle {}: {source}", bundle.id());
                    stop_error = Some(FrameworkError::ActivatorStop {
                        bundle: bundle.id(),
                        source,
                    });
                }
            }
        }

        // Cleanup runs regardless of the activator outcome.
        if let Some(context) = bundle.context() {
            context.invalidate();
        }
        bundle.set_context(None);
        bundle.set_activator(None);
        self.inner.registry().unregister_services(bundle.id());
        self.inner.registry().unget_services(bundle.id());
        self.inner.dispatcher().remove_listeners_of(bundle.id());

        bundle.set_state(BundleState::Resolved);
        self.inner
            .fire_bundle_event(BundleEventKind::Stopped, bundle);

        match stop_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Resolve a bundle's current module through the resolver. Must run
    /// under the bundle's lock.
    pub(crate) fn resolve_bundle_locked(&self, bundle: &Arc<Bundle>) -> Result<(), FrameworkError> {
        if bundle.is_extension() {
            return Ok(());
        }
        if bundle.state() != BundleState::Installed {
            return Ok(());
        }

        let module = bundle.current_module().ok_or_else(|| {
            FrameworkError::State(format!("bundle {} has no module", bundle.id()))
        })?;

        if let Some(manifest) = bundle.manifest() {
            self.verify_execution_environment(&manifest)?;
        }

        if let Some(security) = self.inner.security.as_ref() {
            let exports: Vec<carrack_manifest::PackageName> = {
                let graph = self.inner.graph.lock().expect("module graph poisoned");
                graph
                    .node(module)
                    .map(|n| n.definition.exports.clone())
                    .unwrap_or_default()
            };
            for package in &exports {
                if !security.implies_export(bundle, package) {
                    return Err(FrameworkError::Security(format!(
                        "export permission denied for package '{package}'"
                    )));
                }
            }
        }

        let resolution = {
            let graph = self.inner.graph.lock().expect("module graph poisoned");
            self.inner.resolver.resolve(&graph, module)?
        };
        {
            let mut graph = self.inner.graph.lock().expect("module graph poisoned");
            graph.set_wires(module, resolution.wires, resolution.required);
        }

        // The wired module must still be the bundle's current module in the
        // installed state; anything else is a stray resolve notification.
        if bundle.state() == BundleState::Installed && bundle.current_module() == Some(module) {
            bundle.set_state(BundleState::Resolved);
            self.inner
                .fire_bundle_event(BundleEventKind::Resolved, bundle);
        } else {
            warn!(
                "ignoring resolve of non-current module for bundle {}",
                bundle.id()
            );
        }
        Ok(())
    }

    /// Update a bundle's content from its update location.
    pub fn update_bundle(&self, bundle: &Arc<Bundle>) -> Result<(), FrameworkError> {
        self.update_bundle_internal(bundle, None)
    }

    /// Update a bundle's content from a supplied stream.
    pub fn update_bundle_from_stream(
        &self,
        bundle: &Arc<Bundle>,
        stream: &mut dyn Read,
    ) -> Result<(), FrameworkError> {
        self.update_bundle_internal(bundle, Some(stream))
    }

    fn update_bundle_internal(
        &self,
        bundle: &Arc<Bundle>,
        stream: Option<&mut dyn Read>,
    ) -> Result<(), FrameworkError> {
        if bundle.is_system() {
            return self.update();
        }
        self.with_bundle_lock(bundle, || self.update_bundle_locked(bundle, stream))
    }

    fn update_bundle_locked(
        &self,
        bundle: &Arc<Bundle>,
        stream: Option<&mut dyn Read>,
    ) -> Result<(), FrameworkError> {
        let old_state = bundle.state();
        if old_state == BundleState::Uninstalled {
            return Err(FrameworkError::State("the bundle is uninstalled".to_owned()));
        }

        let update_location = bundle
            .manifest()
            .and_then(|m| m.bundle.update_location)
            .unwrap_or_else(|| bundle.location().to_owned());

        // Stop without recording; the restart below restores the old state.
        self.stop_bundle_locked(bundle, false)?;

        let mut update_error = match self.revise_and_rebuild(bundle, &update_location, stream) {
            Ok(()) => None,
            Err(e) => {
                warn!("unable to update bundle {}: {e}", bundle.id());
                Some(e)
            }
        };

        if update_error.is_none() {
            bundle.touch_last_modified();
            if !bundle.is_extension() {
                bundle.set_state(BundleState::Installed);
            }
            self.inner
                .fire_bundle_event(BundleEventKind::Unresolved, bundle);
            bundle.set_removal_pending(true);
            self.inner
                .fire_bundle_event(BundleEventKind::Updated, bundle);

            let in_use = {
                let graph = self.inner.graph.lock().expect("module graph poisoned");
                graph.has_foreign_dependents(bundle.id())
            };
            if !in_use {
                // Nothing pins the old revisions; collect them right away.
                if let Err(e) = self.refresh_packages(Some(std::slice::from_ref(bundle))) {
                    warn!("unable to immediately purge bundle revisions: {e}");
                }
            }
        }

        if old_state == BundleState::Active {
            if let Err(e) = self.start_bundle_locked(bundle, false) {
                // A restart failure outranks the saved update failure.
                update_error = Some(e);
            }
        }

        match update_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn revise_and_rebuild(
        &self,
        bundle: &Arc<Bundle>,
        update_location: &str,
        stream: Option<&mut dyn Read>,
    ) -> Result<(), FrameworkError> {
        let archive = Arc::clone(bundle.archive().ok_or_else(|| {
            FrameworkError::State("the system bundle has no archive".to_owned())
        })?);
        archive.revise(update_location, stream)?;

        let revision_index = archive.revision_count() - 1;
        let was_extension = bundle.is_extension();
        let becomes_extension = archive
            .current_revision()
            .manifest()
            .bundle
            .extension;

        let built = self
            .create_module(&archive, revision_index, was_extension || becomes_extension)
            .and_then(|module| {
                if let Some(security) = self.inner.security.as_ref() {
                    security.check_bundle(bundle)?;
                }
                Ok(module)
            });

        let module = match built {
            Ok(module) => module,
            Err(e) => {
                match archive.rollback_revise() {
                    Ok(true) => {}
                    Ok(false) => warn!("nothing to roll back for bundle {}", bundle.id()),
                    Err(rollback) => warn!("unable to roll back revise: {rollback}"),
                }
                return Err(e);
            }
        };

        bundle.add_module(module);

        if !was_extension && becomes_extension {
            let manifest = archive.current_revision().manifest().clone();
            self.attach_extension_exports(&manifest);
            bundle.set_extension(true);
            bundle.set_state(BundleState::Resolved);
        } else if was_extension {
            bundle.set_state(BundleState::Installed);
        }
        Ok(())
    }

    /// Uninstall a bundle. The archive survives in the uninstalled list
    /// until the next refresh.
    pub fn uninstall_bundle(&self, bundle: &Arc<Bundle>) -> Result<(), FrameworkError> {
        if bundle.is_system() {
            return Err(FrameworkError::State(
                "cannot uninstall the system bundle".to_owned(),
            ));
        }
        self.with_bundle_lock(bundle, || self.uninstall_bundle_locked(bundle))
    }

    fn uninstall_bundle_locked(&self, bundle: &Arc<Bundle>) -> Result<(), FrameworkError> {
        if bundle.state() == BundleState::Uninstalled {
            return Err(FrameworkError::State(format!(
                "bundle {} is uninstalled",
                bundle.id()
            )));
        }

        // Extensions stay until the framework restarts.
        if bundle.is_extension() {
            bundle.set_persistent_state(PersistentState::Uninstalled);
            bundle.set_state(BundleState::Installed);
            return Ok(());
        }

        // Uninstall always succeeds; a failing activator stop becomes a
        // framework error event.
        if let Err(e) = self.stop_bundle_locked(bundle, true) {
            self.inner.fire_framework_event(FrameworkEvent::error(
                bundle.id(),
                format!("error stopping bundle during uninstall: {e}"),
            ));
        }

        {
            let mut installed = self
                .inner
                .installed
                .lock()
                .expect("installed bundles poisoned");
            installed.by_location.remove(bundle.location());
            installed.by_id.remove(&bundle.id());
        }

        bundle.set_persistent_state(PersistentState::Uninstalled);
        bundle.set_removal_pending(true);
        self.inner
            .graph
            .lock()
            .expect("module graph poisoned")
            .mark_stale(bundle.id());
        self.inner.remember_uninstalled(bundle);

        bundle.set_state(BundleState::Uninstalled);
        bundle.touch_last_modified();
        self.inner
            .fire_bundle_event(BundleEventKind::Uninstalled, bundle);

        let in_use = {
            let graph = self.inner.graph.lock().expect("module graph poisoned");
            graph.has_foreign_dependents(bundle.id())
        };
        if !in_use {
            if let Err(e) = self.refresh_packages(Some(std::slice::from_ref(bundle))) {
                warn!("unable to immediately garbage collect the bundle: {e}");
            }
        }
        Ok(())
    }
}
