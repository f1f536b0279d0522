//! Object cache and endpoint lookup boundaries
//!
//! The watch layer keeps the last known snapshot of every service; the
//! reconciler only ever reads it through [`ObjectCache`]. [`ServiceStore`] is
//! the in-memory implementation used by the binary and by tests.

use dashmap::DashMap;
use thiserror::Error;

use super::{Endpoint, EndpointSet, Service, ServiceKey};

/// Errors from a cache lookup. All of them are transient.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache unavailable: {0}")]
    Unavailable(String),
}

/// Keyed lookup of the last known service snapshot
///
/// `Ok(None)` is the canonical "deleted" signal and is handled exactly like
/// an explicit delete notification.
pub trait ObjectCache: Send + Sync {
    fn get_by_key(&self, key: &ServiceKey) -> Result<Option<Service>, CacheError>;
}

/// Endpoint data associated with a service key
pub trait EndpointSource: Send + Sync {
    /// Returns an empty set when nothing has been associated with the key yet
    fn resolve(&self, key: &ServiceKey) -> EndpointSet;
}

/// Endpoint source with nothing associated to any key
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEndpoints;

impl EndpointSource for NoEndpoints {
    fn resolve(&self, _key: &ServiceKey) -> EndpointSet {
        EndpointSet::new()
    }
}

/// In-memory service and endpoint store
#[derive(Debug, Default)]
pub struct ServiceStore {
    services: DashMap<ServiceKey, Service>,
    endpoints: DashMap<ServiceKey, EndpointSet>,
}

impl ServiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a service, returning the previous snapshot
    pub fn upsert(&self, key: ServiceKey, service: Service) -> Option<Service> {
        self.services.insert(key, service)
    }

    /// Remove a service. Endpoint data goes with it.
    pub fn remove(&self, key: &ServiceKey) -> Option<Service> {
        self.endpoints.remove(key);
        self.services.remove(key).map(|(_, s)| s)
    }

    /// Replace the endpoints associated with a key
    pub fn set_endpoints(&self, key: ServiceKey, endpoints: impl IntoIterator<Item = Endpoint>) {
        let set: EndpointSet = endpoints.into_iter().collect();
        if set.is_empty() {
            self.endpoints.remove(&key);
        } else {
            self.endpoints.insert(key, set);
        }
    }

    /// Every stored key, sorted
    pub fn keys(&self) -> Vec<ServiceKey> {
        let mut keys: Vec<ServiceKey> = self.services.iter().map(|r| r.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl ObjectCache for ServiceStore {
    fn get_by_key(&self, key: &ServiceKey) -> Result<Option<Service>, CacheError> {
        Ok(self.services.get(key).map(|r| r.clone()))
    }
}

impl EndpointSource for ServiceStore {
    fn resolve(&self, key: &ServiceKey) -> EndpointSet {
        self.endpoints
            .get(key)
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ServiceKey {
        ServiceKey::new("default", name).unwrap()
    }

    #[test]
    fn test_missing_key_is_absent_not_error() {
        let store = ServiceStore::new();
        assert_eq!(store.get_by_key(&key("web")), Ok(None));
    }

    #[test]
    fn test_upsert_and_lookup() {
        let store = ServiceStore::new();
        let svc = Service::new("default", "web").with_ip("10.0.0.1");

        assert!(store.upsert(key("web"), svc.clone()).is_none());
        assert_eq!(store.get_by_key(&key("web")), Ok(Some(svc)));
        assert_eq!(store.len(), 1);
        assert_eq!(store.keys(), vec![key("web")]);
    }

    #[test]
    fn test_endpoints_default_empty() {
        let store = ServiceStore::new();
        store.upsert(key("web"), Service::new("default", "web"));
        assert!(store.resolve(&key("web")).is_empty());

        store.set_endpoints(key("web"), vec![Endpoint::new("10.1.0.5", 8080)]);
        assert_eq!(store.resolve(&key("web")).len(), 1);
    }

    #[test]
    fn test_no_endpoints_source() {
        assert!(NoEndpoints.resolve(&key("web")).is_empty());
    }

    #[test]
    fn test_remove_drops_endpoints() {
        let store = ServiceStore::new();
        store.upsert(key("web"), Service::new("default", "web"));
        store.set_endpoints(key("web"), vec![Endpoint::new("10.1.0.5", 8080)]);

        assert!(store.remove(&key("web")).is_some());
        assert!(store.resolve(&key("web")).is_empty());
        assert!(store.is_empty());
    }
}
