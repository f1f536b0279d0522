//! Route announcement boundary
//!
//! The reconciler hands every desired state to an [`Announcer`] and acts on
//! the returned [`SyncOutcome`]. [`RouteAnnouncer`] is the in-memory routing
//! backend: it keeps the table of advertised service prefixes and the peers
//! each one is announced through.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::session::SessionSource;
use crate::service::{DesiredState, ServiceKey};

/// Result of one `apply` call; drives the queue's retry policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason")]
pub enum SyncOutcome {
    Success,
    RetryableError(String),
    PermanentError(String),
}

impl SyncOutcome {
    pub fn retryable(reason: impl Into<String>) -> Self {
        SyncOutcome::RetryableError(reason.into())
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        SyncOutcome::PermanentError(reason.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SyncOutcome::Success)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncOutcome::RetryableError(_))
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOutcome::Success => write!(f, "success"),
            SyncOutcome::RetryableError(reason) => write!(f, "retryable error: {}", reason),
            SyncOutcome::PermanentError(reason) => write!(f, "permanent error: {}", reason),
        }
    }
}

/// Applies desired load-balancer state to the routing backend
///
/// Implementations must be idempotent, safe to call concurrently for
/// distinct keys, and must bound every internal wait.
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn apply(&self, desired: &DesiredState) -> SyncOutcome;
}

/// A service route as announced to upstream peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    pub key: ServiceKey,
    /// Host prefixes, `/32` for IPv4 and `/128` for IPv6
    pub prefixes: Vec<String>,
    /// Established peers the prefixes are announced through
    pub peers: Vec<IpAddr>,
    pub ready_endpoints: usize,
}

/// In-memory announcer gating advertisements on session health
pub struct RouteAnnouncer {
    sessions: Arc<dyn SessionSource>,
    routes: DashMap<ServiceKey, Advertisement>,
}

impl RouteAnnouncer {
    pub fn new(sessions: Arc<dyn SessionSource>) -> Self {
        Self {
            sessions,
            routes: DashMap::new(),
        }
    }

    /// Current route table, sorted by key
    pub fn advertised(&self) -> Vec<Advertisement> {
        let mut routes: Vec<Advertisement> = self.routes.iter().map(|r| r.clone()).collect();
        routes.sort_by(|a, b| a.key.cmp(&b.key));
        routes
    }

    pub fn advertisement(&self, key: &ServiceKey) -> Option<Advertisement> {
        self.routes.get(key).map(|r| r.clone())
    }

    fn withdraw(&self, key: &ServiceKey) {
        if let Some((_, ad)) = self.routes.remove(key) {
            info!(key = %key, prefixes = ?ad.prefixes, "Withdrew service routes");
        }
    }
}

/// Parse load-balancer addresses into host prefixes
fn host_prefixes(ips: &[String]) -> Result<Vec<String>, String> {
    let mut prefixes = Vec::with_capacity(ips.len());
    for raw in ips {
        let ip: IpAddr = raw
            .trim()
            .parse()
            .map_err(|_| format!("invalid load-balancer IP '{}'", raw))?;
        let prefix = match ip {
            IpAddr::V4(_) => format!("{}/32", ip),
            IpAddr::V6(_) => format!("{}/128", ip),
        };
        if !prefixes.contains(&prefix) {
            prefixes.push(prefix);
        }
    }
    prefixes.sort();
    Ok(prefixes)
}

#[async_trait]
impl Announcer for RouteAnnouncer {
    async fn apply(&self, desired: &DesiredState) -> SyncOutcome {
        let key = &desired.key;

        let Some(service) = &desired.service else {
            self.withdraw(key);
            return SyncOutcome::Success;
        };

        let prefixes = match host_prefixes(&service.load_balancer_ips) {
            Ok(prefixes) => prefixes,
            Err(reason) => {
                self.withdraw(key);
                return SyncOutcome::PermanentError(reason);
            }
        };

        if prefixes.is_empty() {
            debug!(key = %key, "No load-balancer IP assigned yet");
            self.withdraw(key);
            return SyncOutcome::Success;
        }

        // Session health is read at call time, never cached
        let peers: Vec<IpAddr> = self
            .sessions
            .established_peers()
            .iter()
            .map(|p| p.address)
            .collect();

        let ad = Advertisement {
            key: key.clone(),
            prefixes,
            peers,
            ready_endpoints: desired.endpoints.iter().filter(|e| e.ready).count(),
        };
        let no_peers = ad.peers.is_empty();

        let changed = self
            .routes
            .get(key)
            .map(|existing| *existing != ad)
            .unwrap_or(true);
        if changed {
            info!(
                key = %key,
                prefixes = ?ad.prefixes,
                peers = ad.peers.len(),
                "Updated service advertisement"
            );
            self.routes.insert(key.clone(), ad);
        }

        if no_peers {
            SyncOutcome::retryable("no established BGP sessions")
        } else {
            SyncOutcome::Success
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::session::{Peer, SessionState, SessionTracker};
    use crate::service::{Endpoint, EndpointSet, Service};

    fn key(name: &str) -> ServiceKey {
        ServiceKey::new("default", name).unwrap()
    }

    fn tracker(states: &[(&str, SessionState)]) -> Arc<SessionTracker> {
        Arc::new(SessionTracker::with_peers(
            states
                .iter()
                .map(|(addr, state)| Peer::new(addr.parse().unwrap(), 64500).with_state(*state))
                .collect(),
        ))
    }

    fn desired(name: &str, ip: &str) -> DesiredState {
        DesiredState::present(
            key(name),
            Service::new("default", name).with_ip(ip),
            EndpointSet::new(),
        )
    }

    #[tokio::test]
    async fn test_advertises_through_established_peers_only() {
        let sessions = tracker(&[
            ("192.168.1.1", SessionState::Established),
            ("192.168.1.2", SessionState::Idle),
        ]);
        let announcer = RouteAnnouncer::new(sessions);

        let outcome = announcer.apply(&desired("web", "10.0.0.10")).await;
        assert_eq!(outcome, SyncOutcome::Success);

        let ad = announcer.advertisement(&key("web")).unwrap();
        assert_eq!(ad.prefixes, vec!["10.0.0.10/32".to_string()]);
        assert_eq!(ad.peers, vec!["192.168.1.1".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let sessions = tracker(&[("192.168.1.1", SessionState::Established)]);
        let announcer = RouteAnnouncer::new(sessions);
        let state = desired("web", "10.0.0.10");

        announcer.apply(&state).await;
        let first = announcer.advertised();
        announcer.apply(&state).await;
        assert_eq!(announcer.advertised(), first);
        assert_eq!(first.len(), 1);
    }

    #[tokio::test]
    async fn test_absent_service_withdraws() {
        let sessions = tracker(&[("192.168.1.1", SessionState::Established)]);
        let announcer = RouteAnnouncer::new(sessions);

        announcer.apply(&desired("web", "10.0.0.10")).await;
        let outcome = announcer.apply(&DesiredState::absent(key("web"))).await;

        assert_eq!(outcome, SyncOutcome::Success);
        assert!(announcer.advertised().is_empty());

        // Withdrawing again is a no-op
        let outcome = announcer.apply(&DesiredState::absent(key("web"))).await;
        assert_eq!(outcome, SyncOutcome::Success);
    }

    #[tokio::test]
    async fn test_no_established_peer_is_retryable() {
        let sessions = tracker(&[("192.168.1.1", SessionState::OpenSent)]);
        let announcer = RouteAnnouncer::new(sessions.clone());

        let outcome = announcer.apply(&desired("web", "10.0.0.10")).await;
        assert!(outcome.is_retryable());
        assert!(announcer.advertisement(&key("web")).unwrap().peers.is_empty());

        sessions
            .update_state("192.168.1.1".parse().unwrap(), SessionState::OpenConfirm)
            .unwrap();
        sessions
            .update_state("192.168.1.1".parse().unwrap(), SessionState::Established)
            .unwrap();

        let outcome = announcer.apply(&desired("web", "10.0.0.10")).await;
        assert_eq!(outcome, SyncOutcome::Success);
        assert_eq!(announcer.advertisement(&key("web")).unwrap().peers.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_ip_is_permanent() {
        let sessions = tracker(&[("192.168.1.1", SessionState::Established)]);
        let announcer = RouteAnnouncer::new(sessions);

        let outcome = announcer.apply(&desired("web", "not-an-ip")).await;
        assert!(matches!(outcome, SyncOutcome::PermanentError(_)));
        assert!(announcer.advertised().is_empty());
    }

    #[tokio::test]
    async fn test_service_without_ip_has_nothing_to_announce() {
        let sessions = tracker(&[]);
        let announcer = RouteAnnouncer::new(sessions);
        let state = DesiredState::present(
            key("web"),
            Service::new("default", "web"),
            EndpointSet::new(),
        );

        assert_eq!(announcer.apply(&state).await, SyncOutcome::Success);
        assert!(announcer.advertised().is_empty());
    }

    #[tokio::test]
    async fn test_ipv6_and_ready_endpoints() {
        let sessions = tracker(&[("fd00::1", SessionState::Established)]);
        let announcer = RouteAnnouncer::new(sessions);

        let mut not_ready = Endpoint::new("10.1.0.6", 8080);
        not_ready.ready = false;
        let endpoints: EndpointSet = vec![Endpoint::new("10.1.0.5", 8080), not_ready]
            .into_iter()
            .collect();
        let state = DesiredState::present(
            key("web"),
            Service::new("default", "web").with_ip("fd00:10::5"),
            endpoints,
        );

        assert_eq!(announcer.apply(&state).await, SyncOutcome::Success);
        let ad = announcer.advertisement(&key("web")).unwrap();
        assert_eq!(ad.prefixes, vec!["fd00:10::5/128".to_string()]);
        assert_eq!(ad.ready_endpoints, 1);
    }

    #[test]
    fn test_host_prefixes_dedup_and_sort() {
        let ips = vec![
            "10.0.0.2".to_string(),
            "10.0.0.1".to_string(),
            "10.0.0.2".to_string(),
        ];
        assert_eq!(
            host_prefixes(&ips).unwrap(),
            vec!["10.0.0.1/32".to_string(), "10.0.0.2/32".to_string()]
        );
    }
}
