//! Meeting gateway backend
//!
//! A small HTTP backend that fronts a Janus-style WebRTC signaling
//! gateway: clients log in, get an expiring session token, and use it to
//! create meetings and inspect participants. The heavy lifting is split
//! into a connection engine ([`connection`], [`server`]), a signaling
//! client with transaction correlation ([`signaling`]) and an expiring
//! session table ([`session`]).

pub mod config;
pub mod connection;
pub mod crypto;
pub mod queue;
pub mod router;
pub mod server;
pub mod session;
pub mod signaling;
pub mod users;
pub mod wire;

pub use config::Config;
pub use router::Router;
pub use server::GatewayServer;
pub use session::SessionTable;
pub use signaling::SignalingClient;
pub use users::{ConfigUserRepository, UserService};
