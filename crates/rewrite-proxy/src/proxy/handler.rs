//! Per-request flow: forward, buffer, run scripts, rewrite.

use super::context::{ConnectionInfo, RequestHandlerContext};
use super::forwarding::{build_upstream_request, error_response};
use super::headers::strip_hop_by_hop;
use super::response_ext::ResponseExt;
use crate::metrics;
use crate::pipeline::{capture_body, rewrite, ReconciledResult, RequestInfo, TransactionSnapshot};

use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, StatusCode};
use std::convert::Infallible;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Proxy one request to the origin and return the (possibly rewritten)
/// response. Never fails; transport problems become JSON error responses.
pub async fn handle_request(
    ctx: &RequestHandlerContext<'_>,
    req: Request<Incoming>,
    conn: ConnectionInfo,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
    let start_time = Instant::now();
    let info = RequestInfo::from_request(&req, Some(conn.remote_addr), conn.tls);
    let method = info.method.clone();

    debug!("Received request: {} {}", method, info.uri);

    let upstream_req = match build_upstream_request(req, ctx.origin, &conn, ctx.identity_encoding)
    {
        Ok(upstream_req) => upstream_req,
        Err(e) => {
            warn!("Cannot build origin request for {}: {}", info.uri, e);
            metrics::record_request(method.as_str(), 400);
            return Ok(error_response(StatusCode::BAD_REQUEST, "Invalid request target").into_boxed());
        }
    };
    let forwarded_url = upstream_req.uri().clone();
    debug!("Forwarding to: {}", forwarded_url);

    let upstream_start = Instant::now();
    let upstream_response = match ctx.http_client.request(upstream_req).await {
        Ok(response) => response,
        Err(e) => {
            error!("Failed to forward request to {}: {}", forwarded_url, e);
            metrics::record_upstream_error("request");
            metrics::record_request(method.as_str(), 502);
            return Ok(error_response(StatusCode::BAD_GATEWAY, "Bad Gateway").into_boxed());
        }
    };

    let (mut parts, body) = match capture_body(upstream_response).await {
        Ok(captured) => captured,
        Err(e) => {
            error!("Failed to read origin response body from {}: {}", forwarded_url, e);
            metrics::record_upstream_error("body");
            metrics::record_request(method.as_str(), 502);
            return Ok(
                error_response(StatusCode::BAD_GATEWAY, "Failed to read upstream response")
                    .into_boxed(),
            );
        }
    };
    metrics::record_upstream_duration(
        method.as_str(),
        parts.status.as_u16(),
        upstream_start.elapsed().as_secs_f64() * 1000.0,
    );

    // Snapshot before stripping so scripts see the origin's framing headers.
    let snapshot = ctx
        .script_pool
        .has_scripts()
        .then(|| TransactionSnapshot::build(&info, &forwarded_url, &parts, &body));
    strip_hop_by_hop(&mut parts.headers);

    let result = if let Some(snapshot) = snapshot {
        match ctx.script_pool.execute(snapshot).await {
            Ok(run) => run.result,
            Err(e) => {
                warn!(
                    "Script pipeline unavailable for {} {}, passing response through: {}",
                    method, info.uri, e
                );
                metrics::record_pipeline_fallback(e.reason());
                ReconciledResult::default()
            }
        }
    } else {
        ReconciledResult::default()
    };

    let rewritten = rewritten_label(&result);
    let response = rewrite::apply(parts, body, &result, &method);
    let status = response.status().as_u16();

    debug!(
        "Responding {} to {} {} (rewritten: {}, length: {:?})",
        status,
        method,
        info.uri,
        rewritten,
        response.declared_length()
    );

    let duration_ms = start_time.elapsed().as_secs_f64() * 1000.0;
    metrics::record_proxy_duration(method.as_str(), duration_ms, rewritten);
    metrics::record_request(method.as_str(), status);

    Ok(response.into_boxed())
}

fn rewritten_label(result: &ReconciledResult) -> &'static str {
    if result.body_overridden() {
        "body"
    } else if !result.headers.is_empty() {
        "headers"
    } else {
        "none"
    }
}
