use crate::proxy::client::HttpClient;
use crate::scripting::ScriptPool;
use hyper::Uri;
use std::net::SocketAddr;
use std::sync::Arc;

/// Shared state borrowed by every request handled on a connection.
pub struct RequestHandlerContext<'a> {
    pub http_client: &'a HttpClient,
    pub origin: &'a Uri,
    pub script_pool: &'a Arc<ScriptPool>,
    /// Ask the origin for uncompressed bodies.
    pub identity_encoding: bool,
}

/// Per-connection facts about the client.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionInfo {
    pub remote_addr: SocketAddr,
    pub tls: bool,
}
