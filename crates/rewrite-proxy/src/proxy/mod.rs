//! Reverse proxy transport.
//!
//! # Module Structure
//!
//! - `server` - ProxyServer struct and accept loop
//! - `handler` - per-request flow through the script pipeline
//! - `forwarding` - origin request construction and error responses
//! - `client` - origin HTTP client creation
//! - `headers` - hop-by-hop handling and header helpers
//! - `tls` - listener TLS and certificate verification
//! - `network` - listener socket setup (SO_REUSEPORT)

mod client;
mod context;
mod forwarding;
mod handler;
pub mod headers;
mod network;
mod response_ext;
mod server;
mod tls;

pub use client::{create_http_client, HttpClient};
pub use context::ConnectionInfo;
pub use forwarding::{error_response, upstream_uri};
pub use network::create_reusable_listener;
pub use server::ProxyServer;
