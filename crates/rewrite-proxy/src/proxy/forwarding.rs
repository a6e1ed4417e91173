//! Construction of the request sent to the origin.
//!
//! The origin URL may carry a path prefix and a query of its own; both are
//! combined with the client's request target.

use super::context::ConnectionInfo;
use super::headers::{strip_hop_by_hop, X_FORWARDED_FOR, X_FORWARDED_PROTO, VALUE_HTTP, VALUE_HTTPS};
use http_body_util::combinators::BoxBody;
use http_body_util::Full;
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderMap, HeaderValue, ACCEPT_ENCODING, CONTENT_TYPE, HOST};
use hyper::{Request, Response, StatusCode, Uri};

/// Helper function to create a JSON error response.
pub fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "error": message }).to_string();
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Join two path segments with exactly one slash between them.
pub fn join_paths(base: &str, path: &str) -> String {
    let joined = match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) if !base.is_empty() && !path.is_empty() => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    };
    if joined.starts_with('/') {
        joined
    } else {
        format!("/{joined}")
    }
}

/// Absolute origin URL for a client request target.
pub fn upstream_uri(origin: &Uri, request_uri: &Uri) -> Result<Uri, hyper::http::Error> {
    let path = join_paths(origin.path(), request_uri.path());
    let query = match (origin.query(), request_uri.query()) {
        (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => Some(format!("{a}&{b}")),
        (Some(a), _) if !a.is_empty() => Some(a.to_string()),
        (_, Some(b)) => Some(b.to_string()),
        _ => None,
    };
    let path_and_query = match query {
        Some(query) => format!("{path}?{query}"),
        None => path,
    };

    Uri::builder()
        .scheme(origin.scheme_str().unwrap_or("http"))
        .authority(origin.authority().map(|a| a.as_str()).unwrap_or_default())
        .path_and_query(path_and_query)
        .build()
}

/// Headers to send upstream for a client request.
///
/// `Host` is dropped so the client fills it in from the origin authority.
pub fn upstream_headers(
    headers: &HeaderMap,
    conn: &ConnectionInfo,
    identity_encoding: bool,
) -> HeaderMap {
    let mut out = headers.clone();
    strip_hop_by_hop(&mut out);
    out.remove(HOST);
    if identity_encoding {
        out.remove(ACCEPT_ENCODING);
    }

    let client_ip = conn.remote_addr.ip().to_string();
    let prior: Vec<&str> = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    let forwarded_for = if prior.is_empty() {
        client_ip
    } else {
        format!("{}, {}", prior.join(", "), client_ip)
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        out.insert(X_FORWARDED_FOR.clone(), value);
    }

    let proto = if conn.tls { &VALUE_HTTPS } else { &VALUE_HTTP };
    out.insert(X_FORWARDED_PROTO.clone(), proto.clone());
    out
}

/// Rebuild a client request for the origin. The body streams through
/// without buffering.
pub fn build_upstream_request<B>(
    req: Request<B>,
    origin: &Uri,
    conn: &ConnectionInfo,
    identity_encoding: bool,
) -> Result<Request<BoxBody<Bytes, hyper::Error>>, hyper::http::Error>
where
    B: Body<Data = Bytes, Error = hyper::Error> + Send + Sync + 'static,
{
    let (parts, body) = req.into_parts();
    let uri = upstream_uri(origin, &parts.uri)?;
    let headers = upstream_headers(&parts.headers, conn, identity_encoding);

    let mut upstream_req = Request::builder()
        .method(parts.method)
        .uri(uri)
        .body(BoxBody::new(body))?;
    *upstream_req.headers_mut() = headers;
    Ok(upstream_req)
}
