//! ProxyServer struct and main accept loop.

use super::client::{create_http_client, HttpClient};
use super::context::{ConnectionInfo, RequestHandlerContext};
use super::handler::handle_request;
use super::network::create_reusable_listener;
use super::tls::create_tls_acceptor;
use crate::config::{Config, Protocol};
use crate::scripting::{ExecutorConfig, ScriptPool, ScriptPoolConfig, ScriptRegistry};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// The main proxy server struct.
pub struct ProxyServer {
    config: Arc<Config>,
    origin: Uri,
    http_client: HttpClient,
    script_pool: Arc<ScriptPool>,
}

impl ProxyServer {
    /// Build the origin client and the script pool. `config` must already be validated.
    pub fn new(config: Config, registry: ScriptRegistry) -> Result<Self, anyhow::Error> {
        let origin = config.origin.parse_uri().map_err(|e| anyhow::anyhow!(e))?;
        let http_client = create_http_client(&config.origin);

        let pool_config = ScriptPoolConfig::from(&config.scripts.pool);
        let executor_config = ExecutorConfig::from_scripts_config(&config.scripts);
        let script_pool = Arc::new(ScriptPool::new(
            pool_config,
            Arc::new(registry),
            executor_config,
        )?);
        info!(
            "Script pool initialized with {} workers",
            script_pool.worker_count()
        );

        Ok(Self {
            config: Arc::new(config),
            origin,
            http_client,
            script_pool,
        })
    }

    /// Bind the configured port and serve until the listener fails.
    pub async fn run(self) -> Result<(), anyhow::Error> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.listen.port));
        let listener = create_reusable_listener(addr)
            .map_err(|e| anyhow::anyhow!("Failed to bind {addr}: {e}"))?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<(), anyhow::Error> {
        let protocol = self.config.listen.protocol;
        let tls_acceptor = match (protocol, self.config.listen.tls.as_ref()) {
            (Protocol::Https, Some(tls)) => Some(create_tls_acceptor(tls)?),
            (Protocol::Https, None) => {
                anyhow::bail!("TLS configuration required for HTTPS listener")
            }
            (Protocol::Http, _) => None,
        };

        let local_addr = listener.local_addr()?;
        info!("Listening on {}://{}", protocol.as_str(), local_addr);
        info!("Proxying to {}", self.origin);
        info!(
            "Rewriting responses with {} scripts: {:?}",
            self.script_pool.registry().len(),
            self.script_pool.registry().names()
        );

        let server = Arc::new(self);

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };
            let server = Arc::clone(&server);
            let tls_acceptor = tls_acceptor.clone();

            tokio::spawn(async move {
                let conn = ConnectionInfo {
                    remote_addr,
                    tls: tls_acceptor.is_some(),
                };
                match tls_acceptor {
                    Some(acceptor) => {
                        Self::serve_tls(server, acceptor, stream, conn).await;
                    }
                    None => {
                        Self::serve_connection(server, TokioIo::new(stream), conn).await;
                    }
                }
            });
        }
    }

    async fn serve_tls(
        server: Arc<Self>,
        acceptor: TlsAcceptor,
        stream: tokio::net::TcpStream,
        conn: ConnectionInfo,
    ) {
        match acceptor.accept(stream).await {
            Ok(tls_stream) => {
                Self::serve_connection(server, TokioIo::new(tls_stream), conn).await;
            }
            Err(err) => {
                error!("TLS handshake failed from {}: {}", conn.remote_addr, err);
            }
        }
    }

    async fn serve_connection<I>(server: Arc<Self>, io: I, conn: ConnectionInfo)
    where
        I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    {
        let service = service_fn(move |req| {
            let server = Arc::clone(&server);
            async move { server.handle_request_internal(req, conn).await }
        });

        if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
            if err.is_incomplete_message() {
                debug!("Connection from {} closed early: {}", conn.remote_addr, err);
            } else {
                error!("Error serving connection from {}: {}", conn.remote_addr, err);
            }
        }
    }

    async fn handle_request_internal(
        &self,
        req: Request<Incoming>,
        conn: ConnectionInfo,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
        let ctx = RequestHandlerContext {
            http_client: &self.http_client,
            origin: &self.origin,
            script_pool: &self.script_pool,
            identity_encoding: self.config.origin.identity_encoding,
        };

        handle_request(&ctx, req, conn).await
    }
}
