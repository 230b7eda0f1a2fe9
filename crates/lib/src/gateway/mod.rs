//! Gateway: HTTP + WebSocket surface.
//!
//! Single port serves RPC-style calls (`/api`, `/system`) answered with the
//! response envelope, and WebSocket streams of updates (`/events`) and log
//! records (`/log`).

pub mod protocol;
mod server;
pub mod system;

pub use protocol::{Envelope, ErrorEntry, StreamFrame};
pub use server::{autoload_sessions, router, run_gateway, GatewayState};
