//! Service registry contract and the in-memory default.
//!
//! The real registry is an external collaborator; the engine only needs
//! enough of its contract to honor lifecycle cleanup: services a bundle
//! registered disappear when it stops, and services it was using are
//! released.

use crate::BundleId;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub type Service = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRegistration {
    pub id: u64,
    pub bundle_id: BundleId,
    pub name: String,
}

pub trait ServiceRegistry: Send + Sync {
    /// Register a service offered by a bundle; returns the registration id.
    fn register(&self, bundle_id: BundleId, name: &str, service: Service) -> u64;
    /// Look up a service and record the requesting bundle as a user.
    fn get_service(&self, bundle_id: BundleId, name: &str) -> Option<Service>;
    /// Registrations a bundle currently offers.
    fn registrations_of(&self, bundle_id: BundleId) -> Vec<ServiceRegistration>;
    /// Drop every service the bundle registered.
    fn unregister_services(&self, bundle_id: BundleId);
    /// Release every service the bundle was using.
    fn unget_services(&self, bundle_id: BundleId);
}

impl<T: ServiceRegistry + ?Sized> ServiceRegistry for Arc<T> {
    fn register(&self, bundle_id: BundleId, name: &str, service: Service) -> u64 {
        (**self).register(bundle_id, name, service)
    }
    fn get_service(&self, bundle_id: BundleId, name: &str) -> Option<Service> {
        (**self).get_service(bundle_id, name)
    }
    fn registrations_of(&self, bundle_id: BundleId) -> Vec<ServiceRegistration> {
        (**self).registrations_of(bundle_id)
    }
    fn unregister_services(&self, bundle_id: BundleId) {
        (**self).unregister_services(bundle_id)
    }
    fn unget_services(&self, bundle_id: BundleId) {
        (**self).unget_services(bundle_id)
    }
}

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    services: HashMap<u64, (ServiceRegistration, Service)>,
    /// bundle → registration ids of services it uses.
    in_use: HashMap<BundleId, Vec<u64>>,
}

#[derive(Default)]
pub struct InMemoryServiceRegistry {
    state: Mutex<RegistryState>,
}

impl InMemoryServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ServiceRegistry for InMemoryServiceRegistry {
    fn register(&self, bundle_id: BundleId, name: &str, service: Service) -> u64 {
        let mut state = self.state.lock().expect("registry state poisoned");
        let id = state.next_id;
        state.next_id += 1;
        let registration = ServiceRegistration {
            id,
            bundle_id,
            name: name.to_owned(),
        };
        state.services.insert(id, (registration, service));
        id
    }

    fn get_service(&self, bundle_id: BundleId, name: &str) -> Option<Service> {
        let mut state = self.state.lock().expect("registry state poisoned");
        let found = state
            .services
            .values()
            .filter(|(reg, _)| reg.name == name)
            .min_by_key(|(reg, _)| reg.id)
            .map(|(reg, svc)| (reg.id, Arc::clone(svc)));
        let (id, service) = found?;
        state.in_use.entry(bundle_id).or_default().push(id);
        Some(service)
    }

    fn registrations_of(&self, bundle_id: BundleId) -> Vec<ServiceRegistration> {
        let state = self.state.lock().expect("registry state poisoned");
        let mut regs: Vec<ServiceRegistration> = state
            .services
            .values()
            .filter(|(reg, _)| reg.bundle_id == bundle_id)
            .map(|(reg, _)| reg.clone())
            .collect();
        regs.sort_by_key(|r| r.id);
        regs
    }

    fn unregister_services(&self, bundle_id: BundleId) {
        let mut state = self.state.lock().expect("registry state poisoned");
        state
            .services
            .retain(|_, (reg, _)| reg.bundle_id != bundle_id);
    }

    fn unget_services(&self, bundle_id: BundleId) {
        let mut state = self.state.lock().expect("registry state poisoned");
        state.in_use.remove(&bundle_id);
    }
}
