//! Concurrent store of running services
//!
//! Two maps live behind one read/write lock: identifier to service, and public
//! port to identifier. A port entry exists from reservation until removal, so
//! a port cannot be handed to two services even while one is still binding.

use crate::error::ManagementError;
use crate::service::{Service, ServiceInfo};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Default)]
struct Inner {
    services: HashMap<String, Arc<Service>>,
    ports: HashMap<u16, String>,
}

/// Registry of services keyed by `stack/service`
#[derive(Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `port` for `identifier` before the service is bound.
    ///
    /// Fails if the port is held by any service (registered or still
    /// starting), or if the identifier is already in use.
    pub fn reserve(&self, identifier: &str, port: u16) -> Result<(), ManagementError> {
        let mut inner = self.inner.write();

        if let Some(owner) = inner.ports.get(&port) {
            return Err(ManagementError::PortConflict {
                port,
                identifier: owner.clone(),
            });
        }
        if inner.ports.values().any(|id| id == identifier) {
            return Err(ManagementError::AlreadyExists(identifier.to_string()));
        }

        inner.ports.insert(port, identifier.to_string());
        Ok(())
    }

    /// Drop a reservation that never became a running service
    pub fn release(&self, identifier: &str, port: u16) {
        let mut inner = self.inner.write();
        if inner.ports.get(&port).map(String::as_str) == Some(identifier)
            && !inner.services.contains_key(identifier)
        {
            inner.ports.remove(&port);
        }
    }

    /// Make a started service visible under its reserved port
    pub fn commit(&self, service: Arc<Service>) {
        let mut inner = self.inner.write();
        inner
            .ports
            .insert(service.listen_port(), service.identifier().to_string());
        inner
            .services
            .insert(service.identifier().to_string(), service);
    }

    /// Remove a service and free its port
    pub fn remove(&self, identifier: &str) -> Result<Arc<Service>, ManagementError> {
        let mut inner = self.inner.write();
        let service = inner
            .services
            .remove(identifier)
            .ok_or_else(|| ManagementError::NotFound(identifier.to_string()))?;
        inner.ports.remove(&service.listen_port());
        Ok(service)
    }

    pub fn get(&self, identifier: &str) -> Option<Arc<Service>> {
        self.inner.read().services.get(identifier).cloned()
    }

    /// Identifier owning `port`, including reservations in progress
    pub fn port_owner(&self, port: u16) -> Option<String> {
        self.inner.read().ports.get(&port).cloned()
    }

    /// Consistent view of every registered service's descriptor
    pub fn snapshot(&self) -> BTreeMap<String, ServiceInfo> {
        let inner = self.inner.read();
        inner
            .services
            .iter()
            .map(|(id, service)| (id.clone(), service.info()))
            .collect()
    }

    /// Apply `f` to every registered service while holding the read lock
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Service>)) {
        let inner = self.inner.read();
        for service in inner.services.values() {
            f(service);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
