//! Gateway: the host-process HTTP/WebSocket server the presentation process
//! talks to.
//!
//! - `POST /rpc` and `/ws` request frames dispatch to the plugin command
//!   bridge through the handlers registered in `methods.rs`.
//! - `/ws` also pushes bridge events (reload, install failures, updates).
//! - `GET /plugin/{*path}` serves static plugin assets from the plugins root.

pub mod broadcast;
pub mod methods;
pub mod server;
pub mod state;
pub mod ws;
