//! Local control API: a loopback HTTP surface an operator (or the
//! cloud, over a local network push) uses to inspect and drive this
//! agent without going through the cloud control plane.
//!
//! Routes live under `/api/v1`, protected by a layered middleware
//! stack: rate limiting → anti-replay nonce → auth → audit logging.
//! `/api/v1/health` is unauthenticated so a process supervisor can
//! check liveness without a key.

pub mod endpoints;
pub mod error;
pub mod middleware;
pub mod router;
pub mod server;
pub mod types;
pub mod websocket;

pub use router::control_api_router;
pub use server::{start_control_api_server, ApiServer};
pub use types::ApiContext;
