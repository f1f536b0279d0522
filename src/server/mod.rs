//! Operator HTTP API
//!
//! Read-only status views plus the feeds a watch layer and a protocol engine
//! use to push service, endpoint and session changes into the reconciler.

mod handlers;
mod state;

pub use handlers::{
    create_router, ErrorResponse, ServiceResponse, StatusResponse, UpdatePeerStateRequest,
    UpdatePeerStateResponse,
};
pub use state::AppState;
