//! Load-balancer service model
//!
//! Snapshots of Kubernetes `LoadBalancer` services as seen by the watch
//! layer, the endpoints backing them, and the desired state handed to the
//! announcer on every reconcile attempt.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod cache;

pub use cache::{CacheError, EndpointSource, NoEndpoints, ObjectCache, ServiceStore};

/// Errors deriving a [`ServiceKey`] from an object or a string
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Service name is empty")]
    EmptyName,

    #[error("Service namespace is empty")]
    EmptyNamespace,

    #[error("Malformed service key: '{0}'")]
    Malformed(String),
}

/// Stable identifier of a service: `namespace/name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceKey {
    namespace: String,
    name: String,
}

impl ServiceKey {
    pub fn new(namespace: &str, name: &str) -> Result<Self, KeyError> {
        if namespace.is_empty() {
            return Err(KeyError::EmptyNamespace);
        }
        if name.is_empty() {
            return Err(KeyError::EmptyName);
        }
        if namespace.contains('/') || name.contains('/') {
            return Err(KeyError::Malformed(format!("{}/{}", namespace, name)));
        }
        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ServiceKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((namespace, name)) => Self::new(namespace, name),
            None => Err(KeyError::Malformed(s.to_string())),
        }
    }
}

impl TryFrom<String> for ServiceKey {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ServiceKey> for String {
    fn from(key: ServiceKey) -> Self {
        key.to_string()
    }
}

/// A service port exposed by the load balancer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

/// Snapshot of a load-balancer service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub name: String,
    /// Externally reachable addresses assigned to the service
    #[serde(default, rename = "loadBalancerIPs")]
    pub load_balancer_ips: Vec<String>,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl Service {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            load_balancer_ips: Vec::new(),
            ports: Vec::new(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.load_balancer_ips.push(ip.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.ports.push(ServicePort {
            name: None,
            port,
            protocol: default_protocol(),
        });
        self
    }

    /// Derive the queue/cache key for this object
    pub fn key(&self) -> Result<ServiceKey, KeyError> {
        ServiceKey::new(&self.namespace, &self.name)
    }
}

/// A concrete backend address behind a service
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
    #[serde(default = "default_ready")]
    pub ready: bool,
}

fn default_ready() -> bool {
    true
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            ready: true,
        }
    }
}

/// Ordered endpoint set; ordering keeps desired state comparisons stable
pub type EndpointSet = BTreeSet<Endpoint>;

/// What the announcer should converge to for one key
///
/// `service` is `None` once the object is gone from the cache. An empty
/// `endpoints` set with a present service simply means endpoint data has not
/// been associated with the key yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DesiredState {
    pub key: ServiceKey,
    pub service: Option<Service>,
    pub endpoints: EndpointSet,
}

impl DesiredState {
    /// Desired state for a key that no longer exists
    pub fn absent(key: ServiceKey) -> Self {
        Self {
            key,
            service: None,
            endpoints: EndpointSet::new(),
        }
    }

    pub fn present(key: ServiceKey, service: Service, endpoints: EndpointSet) -> Self {
        Self {
            key,
            service: Some(service),
            endpoints,
        }
    }

    pub fn is_deletion(&self) -> bool {
        self.service.is_none()
    }
}
