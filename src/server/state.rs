use std::sync::Arc;

use crate::bgp::{RouteAnnouncer, SessionTracker};
use crate::config::{ConfigError, ManagerConfig};
use crate::manager::Manager;
use crate::service::ServiceStore;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<Manager>,
    pub store: Arc<ServiceStore>,
    pub sessions: Arc<SessionTracker>,
    pub announcer: Arc<RouteAnnouncer>,
}

impl AppState {
    /// Wire the in-memory backends together from configuration
    pub fn new(config: &ManagerConfig) -> Result<Self, ConfigError> {
        let sessions = Arc::new(SessionTracker::with_peers(config.peers()?));
        Ok(Self::with_sessions(config, sessions))
    }

    /// Same as [`AppState::new`] with a caller-provided tracker
    pub fn with_sessions(config: &ManagerConfig, sessions: Arc<SessionTracker>) -> Self {
        let store = Arc::new(ServiceStore::new());
        let announcer = Arc::new(RouteAnnouncer::new(sessions.clone()));
        let manager = Manager::from_config(config, store.clone(), announcer.clone(), sessions.clone())
            .with_endpoints(store.clone());

        Self {
            manager: Arc::new(manager),
            store,
            sessions,
            announcer,
        }
    }
}
