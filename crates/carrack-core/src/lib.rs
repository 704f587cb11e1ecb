//! Bundle lifecycle, locking, refresh, and start-level engine for Carrack.
//!
//! This crate is the container core. A [`Framework`] owns a set of bundles
//! that share one process while keeping isolated package namespaces with
//! explicitly declared imports and exports. It installs, resolves, starts,
//! stops, updates, refreshes and uninstalls bundles, persists their state
//! across restarts through `carrack-cache`, and serializes framework-wide
//! start-level changes on a dedicated worker.
//!
//! External collaborators — the dependency resolver, the service registry,
//! security providers, and activators — are consumed through traits, with
//! workable in-process defaults so the framework runs stand-alone.

pub mod activator;
pub mod bundle;
pub mod config;
pub mod events;
pub mod framework;
pub mod info;
pub mod lifecycle;
pub mod lock;
pub mod module;
pub mod refresh;
pub mod registry;
pub mod resolver;
pub mod security;
pub mod startlevel;

mod error;

pub use activator::{Activator, ActivatorError, ActivatorRegistry};
pub use bundle::{Bundle, BundleContext, BundleState, SYSTEM_BUNDLE_ID};
pub use carrack_cache::PersistentState;
pub use config::FrameworkConfig;
pub use error::FrameworkError;
pub use events::{
    BundleEvent, BundleEventKind, EventDispatcher, FrameworkEvent, FrameworkEventKind, ListenerId,
};
pub use framework::Framework;
pub use module::{ExportedPackage, ModuleDefinition, ModuleGraph, ModuleId, Wire};
pub use registry::{InMemoryServiceRegistry, ServiceRegistry};
pub use resolver::{BasicResolver, Resolution, ResolveError, Resolver};
pub use security::SecurityProvider;

pub use carrack_manifest::{BundleManifest, PackageName, SymbolicName, Version};

/// Unique, monotonically assigned bundle identifier. Id 0 is reserved for
/// the system bundle.
pub type BundleId = u64;
