use std::net::IpAddr;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::bgp::{Advertisement, PeerStatus, SessionError, SessionState};
use crate::manager::ManagerError;
use crate::metrics::ReconcileSnapshot;
use crate::server::state::AppState;
use crate::service::{Endpoint, Service, ServiceKey};

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    pub services: usize,
    pub routes: usize,
    pub queue_depth: usize,
    pub peers: usize,
    pub established_peers: usize,
    pub reconcile: ReconcileSnapshot,
}

/// Reconciler and peering summary
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    use crate::bgp::SessionSource;

    let reconcile = state.manager.metrics().snapshot();
    let status = if reconcile.failing_keys.is_empty() {
        "ok"
    } else {
        "degraded"
    };

    Json(StatusResponse {
        status: status.to_string(),
        services: state.store.len(),
        routes: state.announcer.advertised().len(),
        queue_depth: state.manager.queue().len(),
        peers: state.sessions.len(),
        established_peers: state.sessions.established_peers().len(),
        reconcile,
    })
}

/// Peer session states, in configuration order
pub async fn list_peers(State(state): State<AppState>) -> Response {
    match state.manager.get_peer_statuses() {
        Ok(statuses) => Json::<Vec<PeerStatus>>(statuses).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdatePeerStateRequest {
    pub state: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdatePeerStateResponse {
    pub address: String,
    pub previous: String,
    pub state: String,
}

/// Session state report from the protocol engine
///
/// A peer entering or leaving `Established` changes where every service is
/// announced, so all known services are resynced.
pub async fn update_peer_state(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Json(request): Json<UpdatePeerStateRequest>,
) -> Response {
    let Ok(addr) = address.parse::<IpAddr>() else {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("'{}' is not an IP address", address),
        );
    };
    let next: SessionState = match request.state.parse() {
        Ok(s) => s,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };

    match state.sessions.update_state(addr, next) {
        Ok(previous) => {
            if previous.is_established() != next.is_established() {
                state.manager.resync(state.store.keys());
            }
            Json(UpdatePeerStateResponse {
                address: addr.to_string(),
                previous: previous.to_string(),
                state: next.to_string(),
            })
            .into_response()
        }
        Err(e @ SessionError::PeerNotFound(_)) => error_response(StatusCode::NOT_FOUND, e),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceResponse {
    pub key: ServiceKey,
    pub created: bool,
}

/// Watch feed: service added or updated
pub async fn upsert_service(
    State(state): State<AppState>,
    Json(service): Json<Service>,
) -> Response {
    let key = match service.key() {
        Ok(k) => k,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };

    let previous = state.store.upsert(key.clone(), service.clone());
    let result = match &previous {
        Some(old) => state.manager.on_update_service(old, &service),
        None => state.manager.on_add_service(&service),
    };
    if let Err(e) = result {
        return ingest_error(e);
    }

    let created = previous.is_none();
    let code = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    (code, Json(ServiceResponse { key, created })).into_response()
}

/// Watch feed: service deleted
pub async fn delete_service(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    let key = match ServiceKey::new(&namespace, &name) {
        Ok(k) => k,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };

    match state.store.remove(&key) {
        Some(service) => match state.manager.on_delete_service(&service) {
            Ok(()) => StatusCode::OK.into_response(),
            Err(e) => ingest_error(e),
        },
        None => error_response(StatusCode::NOT_FOUND, format!("service '{}' not found", key)),
    }
}

/// Endpoint feed: replace the endpoints backing a service
pub async fn set_endpoints(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(endpoints): Json<Vec<Endpoint>>,
) -> Response {
    let key = match ServiceKey::new(&namespace, &name) {
        Ok(k) => k,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };

    state.store.set_endpoints(key.clone(), endpoints);
    state.manager.on_endpoints_changed(&key);
    StatusCode::OK.into_response()
}

/// Announced route table
pub async fn list_routes(State(state): State<AppState>) -> Json<Vec<Advertisement>> {
    Json(state.announcer.advertised())
}

fn ingest_error(e: ManagerError) -> Response {
    warn!("Rejected watch event: {}", e);
    error_response(StatusCode::BAD_REQUEST, e)
}

/// Create the Axum router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/status", get(status))
        .route("/v1/peers", get(list_peers))
        .route("/v1/peers/{address}/state", put(update_peer_state))
        .route("/v1/services", put(upsert_service))
        .route(
            "/v1/namespaces/{namespace}/services/{name}",
            delete(delete_service),
        )
        .route(
            "/v1/namespaces/{namespace}/services/{name}/endpoints",
            put(set_endpoints),
        )
        .route("/v1/routes", get(list_routes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
