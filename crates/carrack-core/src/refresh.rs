//! Dependency-aware refresh: stop, purge or remove, reinitialize, restart.
//!
//! A refresh gathers the transitive dependent closure of its targets, locks
//! the whole closure atomically, and walks each member through the
//! stop → purge/remove → reinitialize sequence before restarting what was
//! previously active. Splitting the phases (rather than mutating in place)
//! guarantees every reference to an old module is dropped before new ones
//! materialize, which is what lets native libraries rebind to the renamed
//! revision directories.

use crate::bundle::{Bundle, BundleState, SYSTEM_BUNDLE_ID};
use crate::events::{BundleEventKind, FrameworkEvent, FrameworkEventKind};
use crate::framework::Framework;
use crate::info::BundleInfo;
use crate::{BundleId, FrameworkError};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

impl Framework {
    /// Resolve the given bundles (or every unresolved bundle when `targets`
    /// is `None`). Returns false when any target failed to resolve.
    pub fn resolve_bundles(&self, targets: Option<&[Arc<Bundle>]>) -> bool {
        let locked = self.inner.locks.acquire_many(|| match targets {
            Some(t) => t.iter().map(|b| b.id()).collect(),
            None => self
                .inner
                .bundles_snapshot()
                .iter()
                .filter(|b| b.state() == BundleState::Installed)
                .map(|b| b.id())
                .collect(),
        });

        let bundles: Vec<Arc<Bundle>> = locked
            .iter()
            .filter_map(|&id| self.inner.lookup_anywhere(id, targets))
            .collect();

        let mut all_resolved = true;
        for bundle in &bundles {
            if let Err(e) = self.resolve_bundle_locked(bundle) {
                all_resolved = false;
                warn!("unable to resolve bundle {}: {e}", bundle.id());
            }
        }

        self.inner.locks.release_many(&locked);
        all_resolved
    }

    /// Refresh the given bundles (or, when `targets` is `None`, every
    /// bundle with old revisions plus every uninstalled bundle awaiting
    /// collection), together with their transitive dependents.
    pub fn refresh_packages(
        &self,
        targets: Option<&[Arc<Bundle>]>,
    ) -> Result<(), FrameworkError> {
        let locked = self
            .inner
            .locks
            .acquire_many(|| self.refresh_candidate_ids(targets));

        let bundles: Vec<Arc<Bundle>> = locked
            .iter()
            .filter_map(|&id| self.inner.lookup_anywhere(id, targets))
            .collect();

        // Refreshing an extension bundle, or the system bundle while any
        // extension sits installed, only takes effect across a framework
        // restart. Surface the requirement and keep going for the rest.
        let mut restart_required = bundles.iter().any(|b| b.is_extension());
        if !restart_required && bundles.iter().any(|b| b.is_system()) {
            restart_required = self
                .inner
                .bundles_snapshot()
                .iter()
                .any(|b| b.is_extension() && b.state() == BundleState::Installed);
        }
        if restart_required {
            warn!("refresh involves extension bundles; a framework restart is required");
            self.inner.fire_framework_event(FrameworkEvent::error(
                SYSTEM_BUNDLE_ID,
                "a framework restart is required to complete this refresh",
            ));
        }

        for bundle in &bundles {
            self.inner.forget_uninstalled(bundle.id());
        }

        let mut steps: Vec<RefreshStep> = bundles
            .iter()
            .filter(|b| !b.is_extension() && !b.is_system())
            .map(|b| RefreshStep::new(Arc::clone(b)))
            .collect();

        for step in &mut steps {
            step.stop(self);
            step.purge_or_remove(self);
            step.reinitialize(self);
        }
        for step in &mut steps {
            step.restart(self);
        }

        self.inner.locks.release_many(&locked);
        for step in &steps {
            if step.removed {
                self.inner.locks.forget(step.bundle.id());
            }
        }

        self.inner.fire_framework_event(FrameworkEvent {
            kind: FrameworkEventKind::PackagesRefreshed,
            bundle_id: None,
            message: None,
        });
        info!("refreshed {} bundle(s)", steps.len());
        Ok(())
    }

    /// The ids a refresh must lock: targets (or the pending set) plus every
    /// bundle transitively wired to them. Recomputed on each lock retry.
    fn refresh_candidate_ids(&self, targets: Option<&[Arc<Bundle>]>) -> Vec<BundleId> {
        let base: Vec<BundleId> = match targets {
            Some(t) => t.iter().map(|b| b.id()).collect(),
            None => {
                let mut ids: Vec<BundleId> = self
                    .inner
                    .uninstalled
                    .lock()
                    .expect("uninstalled bundles poisoned")
                    .iter()
                    .map(|b| b.id())
                    .collect();
                for bundle in self.inner.bundles_snapshot() {
                    if let Some(archive) = bundle.archive() {
                        if archive.revision_count() > 1 {
                            ids.push(bundle.id());
                        }
                    }
                }
                ids
            }
        };

        let graph = self.inner.graph.lock().expect("module graph poisoned");
        let mut closure: BTreeSet<BundleId> = base.into_iter().collect();
        let mut work: Vec<BundleId> = closure.iter().copied().collect();
        while let Some(id) = work.pop() {
            for dependent in graph.dependent_bundles(id) {
                if closure.insert(dependent) {
                    work.push(dependent);
                }
            }
        }
        closure.into_iter().collect()
    }

    /// Drop a bundle's modules and all its old revisions, keeping only the
    /// newest. Used by refresh and by the shutdown sweep.
    pub(crate) fn purge_bundle(&self, bundle: &Arc<Bundle>) -> Result<(), FrameworkError> {
        self.inner.locks.acquire_bundle_lock(bundle.id());
        let result = (|| {
            {
                let mut graph = self.inner.graph.lock().expect("module graph poisoned");
                for module in bundle.modules() {
                    graph.remove_module(module);
                }
            }
            let archive = bundle.archive().ok_or_else(|| {
                FrameworkError::State("the system bundle cannot be purged".to_owned())
            })?;
            archive.purge()?;
            Ok(())
        })();
        self.inner.locks.release_bundle_lock(bundle.id());
        result
    }

    /// Physically remove an uninstalled bundle: its modules from the graph
    /// and its archive from the cache. Callers already hold the refresh
    /// locks (or run during shutdown).
    pub(crate) fn garbage_collect_bundle(
        &self,
        bundle: &Arc<Bundle>,
    ) -> Result<(), FrameworkError> {
        {
            let mut graph = self.inner.graph.lock().expect("module graph poisoned");
            for module in bundle.modules() {
                graph.remove_module(module);
            }
        }
        let archive = bundle.archive().ok_or_else(|| {
            FrameworkError::State("the system bundle cannot be collected".to_owned())
        })?;
        self.inner.cache()?.remove(archive)?;
        Ok(())
    }

    /// Rebuild a refreshed bundle's transient state around the surviving
    /// revision. Lock bookkeeping is external, so it survives the reset.
    fn reinitialize_bundle(&self, bundle: &Arc<Bundle>) -> Result<(), FrameworkError> {
        let archive = Arc::clone(bundle.archive().ok_or_else(|| {
            FrameworkError::State("the system bundle cannot be reinitialized".to_owned())
        })?);

        {
            let mut info = bundle.info();
            let extension = info.extension;
            *info = BundleInfo::new(extension);
        }

        let module = self.create_module(
            &archive,
            archive.revision_count() - 1,
            bundle.is_extension(),
        )?;
        bundle.add_module(module);

        if let Some(security) = self.inner.security.as_ref() {
            security.check_bundle(bundle)?;
        }

        self.inner
            .fire_bundle_event(BundleEventKind::Unresolved, bundle);
        Ok(())
    }
}

/// One bundle's passage through a refresh.
struct RefreshStep {
    bundle: Arc<Bundle>,
    was_active: bool,
    removed: bool,
}

impl RefreshStep {
    fn new(bundle: Arc<Bundle>) -> Self {
        Self {
            bundle,
            was_active: false,
            removed: false,
        }
    }

    fn stop(&mut self, framework: &Framework) {
        if self.bundle.state() == BundleState::Active {
            self.was_active = true;
            if let Err(e) = framework.stop_bundle_transient(&self.bundle) {
                framework.inner.fire_framework_event(FrameworkEvent::error(
                    self.bundle.id(),
                    format!("error stopping bundle during refresh: {e}"),
                ));
            }
        }
    }

    fn purge_or_remove(&mut self, framework: &Framework) {
        self.bundle.set_stale();
        let result = if self.bundle.state() == BundleState::Uninstalled {
            self.removed = true;
            framework.garbage_collect_bundle(&self.bundle)
        } else {
            framework.purge_bundle(&self.bundle)
        };
        if let Err(e) = result {
            framework.inner.fire_framework_event(FrameworkEvent::error(
                self.bundle.id(),
                format!("error purging bundle during refresh: {e}"),
            ));
        }
    }

    fn reinitialize(&mut self, framework: &Framework) {
        if self.removed {
            return;
        }
        if let Err(e) = framework.reinitialize_bundle(&self.bundle) {
            framework.inner.fire_framework_event(FrameworkEvent::error(
                self.bundle.id(),
                format!("error reinitializing bundle during refresh: {e}"),
            ));
        }
    }

    fn restart(&mut self, framework: &Framework) {
        if self.removed || !self.was_active {
            return;
        }
        if let Err(e) = framework.start_bundle_transient(&self.bundle) {
            framework.inner.fire_framework_event(FrameworkEvent::error(
                self.bundle.id(),
                format!("error restarting bundle after refresh: {e}"),
            ));
        }
    }
}
