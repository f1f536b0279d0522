//! # BGP routing side
//!
//! Everything between the reconciler and the wire-level protocol engine:
//!
//! - **Session tracking**: the configured peers and the FSM state the
//!   protocol engine last reported for each of them
//! - **Announcement**: turning a service's desired state into installed or
//!   withdrawn host routes, gated on `Established` sessions
//!
//! ```text
//!   protocol engine ──update_state──▶ SessionTracker ◀──list_peers── status API
//!                                          ▲
//!                                          │ established_peers (per call)
//!   reconciler ──apply(DesiredState)──▶ Announcer ──▶ route table
//! ```
//!
//! The engine itself (TCP sessions, OPEN/UPDATE/KEEPALIVE, timers) lives
//! outside this crate.

pub mod announcer;
pub mod session;

pub use announcer::{Advertisement, Announcer, RouteAnnouncer, SyncOutcome};
pub use session::{Peer, PeerStatus, SessionError, SessionSource, SessionState, SessionTracker};

/// Well-known BGP port, recorded for peers configured without one
pub const BGP_PORT: u16 = 179;
