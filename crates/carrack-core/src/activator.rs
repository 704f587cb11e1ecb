//! Bundle activators and the factory registry that instantiates them.
//!
//! A manifest names its activator; the framework looks the name up in the
//! registry and calls the factory when the bundle starts. This replaces
//! reflective class loading with an explicit, type-checked registration
//! step performed by the embedding application.

use crate::bundle::BundleContext;
use std::collections::HashMap;
use std::sync::Mutex;

pub type ActivatorError = Box<dyn std::error::Error + Send + Sync>;

/// The capability set a bundle exposes to the framework: hooks invoked as
/// the bundle transitions into and out of the active state.
pub trait Activator: Send + Sync {
    fn start(&mut self, ctx: &BundleContext) -> Result<(), ActivatorError>;
    fn stop(&mut self, ctx: &BundleContext) -> Result<(), ActivatorError>;
}

type ActivatorFactory = Box<dyn Fn() -> Box<dyn Activator> + Send + Sync>;

/// Name → factory table consulted when a bundle with an `activator`
/// manifest field starts.
#[derive(Default)]
pub struct ActivatorRegistry {
    factories: Mutex<HashMap<String, ActivatorFactory>>,
}

impl ActivatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        factory: impl Fn() -> Box<dyn Activator> + Send + Sync + 'static,
    ) {
        self.factories
            .lock()
            .expect("activator registry poisoned")
            .insert(name.into(), Box::new(factory));
    }

    /// Instantiate the named activator, or `None` when no factory is
    /// registered under that name.
    pub fn create(&self, name: &str) -> Option<Box<dyn Activator>> {
        self.factories
            .lock()
            .expect("activator registry poisoned")
            .get(name)
            .map(|factory| factory())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories
            .lock()
            .expect("activator registry poisoned")
            .contains_key(name)
    }
}
