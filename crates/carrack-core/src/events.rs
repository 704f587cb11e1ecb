//! Lifecycle events and their synchronous dispatcher.
//!
//! Listener registration is owned by a bundle so the framework can drop a
//! bundle's listeners when it stops or is uninstalled. Dispatch snapshots
//! the listener list and invokes outside the table mutex; per-bundle event
//! ordering follows from lifecycle transitions completing under the
//! bundle's lock.

use crate::BundleId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleEventKind {
    Installed,
    Starting,
    Started,
    Stopping,
    Stopped,
    Updated,
    Unresolved,
    Resolved,
    Uninstalled,
}

#[derive(Debug, Clone)]
pub struct BundleEvent {
    pub kind: BundleEventKind,
    pub bundle_id: BundleId,
    pub location: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameworkEventKind {
    Started,
    Error,
    PackagesRefreshed,
    StartLevelChanged,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct FrameworkEvent {
    pub kind: FrameworkEventKind,
    pub bundle_id: Option<BundleId>,
    pub message: Option<String>,
}

impl FrameworkEvent {
    pub fn stopped() -> Self {
        Self {
            kind: FrameworkEventKind::Stopped,
            bundle_id: None,
            message: None,
        }
    }

    pub fn error(bundle_id: BundleId, message: impl Into<String>) -> Self {
        Self {
            kind: FrameworkEventKind::Error,
            bundle_id: Some(bundle_id),
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type BundleListener = Arc<dyn Fn(&BundleEvent) + Send + Sync>;
type FrameworkListener = Arc<dyn Fn(&FrameworkEvent) + Send + Sync>;

struct ListenerEntry<L> {
    id: ListenerId,
    owner: BundleId,
    listener: L,
}

#[derive(Default)]
struct DispatchTable {
    bundle: Vec<ListenerEntry<BundleListener>>,
    framework: Vec<ListenerEntry<FrameworkListener>>,
}

#[derive(Default)]
pub struct EventDispatcher {
    table: Mutex<DispatchTable>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bundle_listener(
        &self,
        owner: BundleId,
        listener: impl Fn(&BundleEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.table
            .lock()
            .expect("dispatch table poisoned")
            .bundle
            .push(ListenerEntry {
                id,
                owner,
                listener: Arc::new(listener),
            });
        id
    }

    pub fn add_framework_listener(
        &self,
        owner: BundleId,
        listener: impl Fn(&FrameworkEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.table
            .lock()
            .expect("dispatch table poisoned")
            .framework
            .push(ListenerEntry {
                id,
                owner,
                listener: Arc::new(listener),
            });
        id
    }

    pub fn remove_listener(&self, id: ListenerId) {
        let mut table = self.table.lock().expect("dispatch table poisoned");
        table.bundle.retain(|e| e.id != id);
        table.framework.retain(|e| e.id != id);
    }

    /// Drop every listener a bundle registered. Called when the bundle
    /// stops or is uninstalled.
    pub fn remove_listeners_of(&self, owner: BundleId) {
        let mut table = self.table.lock().expect("dispatch table poisoned");
        table.bundle.retain(|e| e.owner != owner);
        table.framework.retain(|e| e.owner != owner);
    }

    pub fn fire_bundle_event(&self, event: &BundleEvent) {
        let listeners: Vec<BundleListener> = {
            let table = self.table.lock().expect("dispatch table poisoned");
            table.bundle.iter().map(|e| Arc::clone(&e.listener)).collect()
        };
        for listener in listeners {
            listener(event);
        }
    }

    pub fn fire_framework_event(&self, event: &FrameworkEvent) {
        let listeners: Vec<FrameworkListener> = {
            let table = self.table.lock().expect("dispatch table poisoned");
            table
                .framework
                .iter()
                .map(|e| Arc::clone(&e.listener))
                .collect()
        };
        for listener in listeners {
            listener(event);
        }
    }
}
