//! Start-level control.
//!
//! A bundle runs iff its start level is at or below the framework's active
//! level and its persistent state says active. Framework-wide level changes
//! are serialized on a dedicated worker thread; the synchronous form lets
//! `start()` and shutdown block until the walk completes. Per-bundle level
//! changes run on the caller's thread under the bundle lock.

use crate::bundle::{Bundle, BundleState};
use crate::config::keys;
use crate::events::{FrameworkEvent, FrameworkEventKind};
use crate::framework::{Framework, FrameworkInner};
use crate::{FrameworkError, PersistentState};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info};

pub(crate) enum StartLevelCommand {
    SetLevel {
        level: u32,
        done: Option<Sender<()>>,
    },
    Shutdown,
}

/// Body of the start-level worker thread.
pub(crate) fn worker_loop(inner: Weak<FrameworkInner>, rx: Receiver<StartLevelCommand>) {
    debug!("start level worker running");
    for command in rx {
        match command {
            StartLevelCommand::SetLevel { level, done } => {
                if let Some(inner) = inner.upgrade() {
                    apply_start_level(&inner, level);
                }
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            StartLevelCommand::Shutdown => break,
        }
    }
    debug!("start level worker exiting");
}

/// Walk every installed bundle, starting or stopping as the new level
/// dictates. Only the snapshot is taken under the installed-bundles lock;
/// per-bundle locking happens inside start/stop.
pub(crate) fn apply_start_level(inner: &Arc<FrameworkInner>, requested: u32) {
    let framework = Framework::borrowed(inner);

    let bundles: Vec<Arc<Bundle>> = {
        // Record the new level and snapshot atomically so the walk sees a
        // consistent ordering baseline.
        let _installed = inner.installed.lock().expect("installed bundles poisoned");
        let lowering = requested < inner.active_start_level.load(Ordering::SeqCst);
        inner.active_start_level.store(requested, Ordering::SeqCst);

        let mut bundles: Vec<Arc<Bundle>> = _installed.by_id.values().cloned().collect();
        bundles.sort_by_key(|b| (b.start_level(), b.id()));
        if lowering {
            bundles.reverse();
        }
        bundles
    };
    info!("moving framework start level to {requested}");

    for bundle in bundles {
        if bundle.is_system() || bundle.state() == BundleState::Uninstalled {
            continue;
        }
        let level = bundle.start_level();
        if bundle.persistent_state() == PersistentState::Active && level <= requested {
            if let Err(e) = framework.start_bundle_transient(&bundle) {
                error!("error starting {}: {e}", bundle.location());
                inner.fire_framework_event(FrameworkEvent::error(
                    bundle.id(),
                    format!("error starting bundle: {e}"),
                ));
            }
        } else if level > requested {
            if let Err(e) = framework.stop_bundle_transient(&bundle) {
                error!("error stopping {}: {e}", bundle.location());
                inner.fire_framework_event(FrameworkEvent::error(
                    bundle.id(),
                    format!("error stopping bundle: {e}"),
                ));
            }
        }
    }

    if inner.system.state() == BundleState::Active {
        inner.fire_framework_event(FrameworkEvent {
            kind: FrameworkEventKind::StartLevelChanged,
            bundle_id: Some(crate::bundle::SYSTEM_BUNDLE_ID),
            message: None,
        });
    }
}

impl Framework {
    /// The framework's active start level.
    pub fn start_level(&self) -> u32 {
        self.inner.active_start_level.load(Ordering::SeqCst)
    }

    /// Request a framework start-level change; the walk runs on the
    /// start-level worker.
    pub fn set_start_level(&self, level: u32) -> Result<(), FrameworkError> {
        if level == 0 {
            return Err(FrameworkError::Argument(
                "start level must be greater than zero".to_owned(),
            ));
        }
        self.inner
            .send_start_level_command(StartLevelCommand::SetLevel { level, done: None });
        Ok(())
    }

    /// Change the framework start level and block until the walk completes.
    pub fn set_start_level_and_wait(&self, level: u32) -> Result<(), FrameworkError> {
        if level == 0 {
            return Err(FrameworkError::Argument(
                "start level must be greater than zero".to_owned(),
            ));
        }
        self.set_start_level_and_wait_internal(level);
        Ok(())
    }

    /// Internal form that also accepts level zero, used by shutdown.
    pub(crate) fn set_start_level_and_wait_internal(&self, level: u32) {
        let (tx, rx) = std::sync::mpsc::channel();
        self.inner
            .send_start_level_command(StartLevelCommand::SetLevel {
                level,
                done: Some(tx),
            });
        let _ = rx.recv();
    }

    /// The start level assigned to newly installed bundles.
    pub fn initial_bundle_start_level(&self) -> u32 {
        self.inner
            .property(keys::BUNDLE_START_LEVEL)
            .and_then(|v| v.trim().parse::<u32>().ok())
            .filter(|&l| l > 0)
            .unwrap_or(crate::config::DEFAULT_BUNDLE_START_LEVEL)
    }

    pub fn set_initial_bundle_start_level(&self, level: u32) -> Result<(), FrameworkError> {
        if level == 0 {
            return Err(FrameworkError::Argument(
                "initial start level must be greater than zero".to_owned(),
            ));
        }
        self.inner
            .set_override(keys::BUNDLE_START_LEVEL, level.to_string());
        Ok(())
    }

    pub fn bundle_start_level(&self, bundle: &Arc<Bundle>) -> Result<u32, FrameworkError> {
        if bundle.state() == BundleState::Uninstalled {
            return Err(FrameworkError::Argument(
                "the bundle is uninstalled".to_owned(),
            ));
        }
        Ok(bundle.start_level())
    }

    /// Persist a bundle's start level and immediately start or stop it to
    /// match the framework's current level. Start/stop failures surface as
    /// framework error events, not as the caller's error.
    pub fn set_bundle_start_level(
        &self,
        bundle: &Arc<Bundle>,
        level: u32,
    ) -> Result<(), FrameworkError> {
        if bundle.is_system() {
            return Err(FrameworkError::Argument(
                "cannot set the start level of the system bundle".to_owned(),
            ));
        }
        if level == 0 {
            return Err(FrameworkError::Argument(
                "start level must be greater than zero".to_owned(),
            ));
        }

        self.inner.locks.acquire_bundle_lock(bundle.id());
        let result = (|| {
            if bundle.state() == BundleState::Uninstalled {
                return Err(FrameworkError::Argument(
                    "the bundle is uninstalled".to_owned(),
                ));
            }
            bundle.set_start_level(level)?;

            let active = self.start_level();
            let outcome = if bundle.persistent_state() == PersistentState::Active
                && level <= active
            {
                self.start_bundle_transient(bundle)
            } else if level > active {
                self.stop_bundle_transient(bundle)
            } else {
                Ok(())
            };
            if let Err(e) = outcome {
                self.inner.fire_framework_event(FrameworkEvent::error(
                    bundle.id(),
                    format!("error applying bundle start level: {e}"),
                ));
            }
            Ok(())
        })();
        self.inner.locks.release_bundle_lock(bundle.id());
        result
    }
}
