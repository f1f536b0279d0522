//! End-to-end reconcile scenarios
//!
//! A mock object cache and a channel-backed announcer stand in for the watch
//! layer and the route speaker; the manager runs its real worker loop.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

use bgplb::bgp::{Announcer, RouteAnnouncer, SessionState, SessionTracker, SyncOutcome};
use bgplb::config::{ManagerConfig, PeerConfig};
use bgplb::manager::{spawn_workers, Manager};
use bgplb::service::{CacheError, DesiredState, ObjectCache, Service, ServiceKey, ServiceStore};

const SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Cache returning whatever the test last stored for any key
struct MockCache {
    service: Mutex<Option<Service>>,
}

impl MockCache {
    fn new(service: Option<Service>) -> Arc<Self> {
        Arc::new(Self {
            service: Mutex::new(service),
        })
    }
}

impl ObjectCache for MockCache {
    fn get_by_key(&self, _key: &ServiceKey) -> Result<Option<Service>, CacheError> {
        Ok(self.service.lock().unwrap().clone())
    }
}

struct ChannelAnnouncer {
    tx: mpsc::UnboundedSender<DesiredState>,
}

#[async_trait]
impl Announcer for ChannelAnnouncer {
    async fn apply(&self, desired: &DesiredState) -> SyncOutcome {
        let _ = self.tx.send(desired.clone());
        SyncOutcome::Success
    }
}

fn channel_announcer() -> (Arc<ChannelAnnouncer>, mpsc::UnboundedReceiver<DesiredState>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelAnnouncer { tx }), rx)
}

fn test_service() -> Service {
    Service::new("default", "myservice").with_ip("10.0.0.10").with_port(80)
}

async fn expect_apply(rx: &mut mpsc::UnboundedReceiver<DesiredState>) -> DesiredState {
    timeout(SYNC_TIMEOUT, rx.recv())
        .await
        .expect("timeout occurred before announcer was called")
        .expect("announcer channel closed")
}

#[tokio::test]
async fn test_event_without_cached_service_withdraws() {
    let cache = MockCache::new(None);
    let (announcer, mut rx) = channel_announcer();
    let sessions = Arc::new(SessionTracker::with_peers(vec![]));
    let manager = Arc::new(Manager::new(cache, announcer, sessions));

    let pool = spawn_workers(Arc::clone(&manager), 1);
    manager.on_add_service(&test_service()).unwrap();

    let desired = expect_apply(&mut rx).await;
    assert_eq!(desired.key.to_string(), "default/myservice");
    assert_eq!(desired.service, None);
    assert!(desired.endpoints.is_empty());

    timeout(SYNC_TIMEOUT, pool.shutdown()).await.unwrap();
}

#[tokio::test]
async fn test_event_with_cached_service_applies_snapshot() {
    let cache = MockCache::new(Some(test_service()));
    let (announcer, mut rx) = channel_announcer();
    let sessions = Arc::new(SessionTracker::with_peers(vec![]));
    let manager = Arc::new(Manager::new(cache, announcer, sessions));

    let pool = spawn_workers(Arc::clone(&manager), 1);
    manager.on_add_service(&test_service()).unwrap();

    let desired = expect_apply(&mut rx).await;
    assert_eq!(desired.key.to_string(), "default/myservice");
    assert_eq!(desired.service, Some(test_service()));
    assert!(desired.endpoints.is_empty());

    timeout(SYNC_TIMEOUT, pool.shutdown()).await.unwrap();
}

#[tokio::test]
async fn test_delete_after_add_sees_current_cache() {
    let cache = MockCache::new(Some(test_service()));
    let (announcer, mut rx) = channel_announcer();
    let sessions = Arc::new(SessionTracker::with_peers(vec![]));
    let manager = Manager::new(cache.clone(), announcer, sessions);

    manager.on_add_service(&test_service()).unwrap();
    *cache.service.lock().unwrap() = None;
    manager.on_delete_service(&test_service()).unwrap();

    // Both notifications collapse; the worker only sees the deletion
    assert_eq!(manager.queue().len(), 1);
    assert!(manager.process_next_item().await);
    let desired = expect_apply(&mut rx).await;
    assert!(desired.is_deletion());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_route_announced_once_session_established() {
    let config = ManagerConfig {
        peers: vec![PeerConfig::new("192.168.1.1", 64500)],
        backoff: bgplb::queue::BackoffConfig {
            base_delay_ms: 10,
            max_delay_ms: 50,
        },
        ..ManagerConfig::default()
    };
    let sessions = Arc::new(SessionTracker::with_peers(config.peers().unwrap()));
    let store = Arc::new(ServiceStore::new());
    let announcer = Arc::new(RouteAnnouncer::new(sessions.clone()));
    let manager = Arc::new(
        Manager::from_config(&config, store.clone(), announcer.clone(), sessions.clone())
            .with_endpoints(store.clone()),
    );

    let key = test_service().key().unwrap();
    store.upsert(key.clone(), test_service());

    let pool = spawn_workers(Arc::clone(&manager), 2);
    manager.on_add_service(&test_service()).unwrap();

    // Recorded without peers and retried while no session is up
    timeout(SYNC_TIMEOUT, async {
        while manager.queue().num_requeues(&key) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    let ad = announcer.advertisement(&key).unwrap();
    assert_eq!(ad.prefixes, vec!["10.0.0.10/32".to_string()]);
    assert!(ad.peers.is_empty());

    sessions
        .update_state("192.168.1.1".parse().unwrap(), SessionState::Established)
        .unwrap();

    timeout(SYNC_TIMEOUT, async {
        loop {
            let announced = announcer
                .advertisement(&key)
                .map(|ad| !ad.peers.is_empty())
                .unwrap_or(false);
            if announced && manager.queue().num_requeues(&key) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // Deleting the service withdraws the route
    store.remove(&key);
    manager.on_delete_service(&test_service()).unwrap();
    timeout(SYNC_TIMEOUT, async {
        while announcer.advertisement(&key).is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    timeout(SYNC_TIMEOUT, pool.shutdown()).await.unwrap();
    assert!(manager.metrics().snapshot().retried >= 1);
}
