//! Application of a reconciled result to the upstream response.
//!
//! The response leaving the proxy always carries an exact `Content-Length`
//! for the body it delivers and never a `Transfer-Encoding`. Bodiless
//! responses (HEAD, 1xx, 204, 304) keep the length the origin declared.

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use hyper::http::response::Parts;
use hyper::{Method, Response, StatusCode};
use tracing::{debug, warn};

use super::ReconciledResult;
use crate::proxy::headers::{is_managed_header, HeadersExt};

/// Build the client-facing response from the upstream parts, the buffered
/// upstream body and the reconciled script output.
pub fn apply(
    mut parts: Parts,
    original_body: Bytes,
    result: &ReconciledResult,
    method: &Method,
) -> Response<Full<Bytes>> {
    for (name, value) in &result.headers {
        let header_name = match HeaderName::from_bytes(name.as_bytes()) {
            Ok(header_name) => header_name,
            Err(_) => {
                warn!("Skipping header override with invalid name `{}`", name);
                continue;
            }
        };
        if is_managed_header(&header_name) {
            debug!("Ignoring override of managed header `{}`", header_name);
            continue;
        }
        if !parts.set_header_value(&header_name, value) {
            warn!("Skipping header override `{}`: invalid value", header_name);
        }
    }

    parts.headers.remove(TRANSFER_ENCODING);

    if !carries_body(method, parts.status) {
        if result.body_overridden() {
            warn!(
                "Dropping body override: {} response to {} carries no body",
                parts.status.as_u16(),
                method
            );
        }
        return Response::from_parts(parts, Full::new(Bytes::new()));
    }

    let body = match result.body {
        Some(ref body) => Bytes::from(body.clone()),
        None => original_body,
    };
    parts
        .headers
        .insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    Response::from_parts(parts, Full::new(body))
}

fn carries_body(method: &Method, status: StatusCode) -> bool {
    !(*method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use std::collections::BTreeMap;

    fn upstream(status: u16, headers: &[(&str, &str)]) -> Parts {
        let mut builder = Response::builder().status(status);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn result(body: Option<&str>, headers: &[(&str, &str)]) -> ReconciledResult {
        ReconciledResult {
            body: body.map(str::to_string),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    async fn body_of(response: Response<Full<Bytes>>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn test_pass_through_sets_exact_length() {
        let parts = upstream(200, &[("transfer-encoding", "chunked"), ("x-orig", "a")]);
        let response = apply(
            parts,
            Bytes::from("hello"),
            &ReconciledResult::default(),
            &Method::GET,
        );

        assert_eq!(response.headers()["content-length"], "5");
        assert!(response.headers().get("transfer-encoding").is_none());
        assert_eq!(response.headers()["x-orig"], "a");
        assert_eq!(body_of(response).await, Bytes::from("hello"));
    }

    #[tokio::test]
    async fn test_body_override_updates_length() {
        let parts = upstream(200, &[("content-length", "5")]);
        let response = apply(
            parts,
            Bytes::from("hello"),
            &result(Some("goodbye!"), &[]),
            &Method::GET,
        );

        assert_eq!(response.headers()["content-length"], "8");
        assert_eq!(body_of(response).await, Bytes::from("goodbye!"));
    }

    #[tokio::test]
    async fn test_empty_body_override() {
        let parts = upstream(200, &[("content-length", "5")]);
        let response = apply(parts, Bytes::from("hello"), &result(Some(""), &[]), &Method::GET);

        assert_eq!(response.headers()["content-length"], "0");
        assert!(body_of(response).await.is_empty());
    }

    #[test]
    fn test_header_override_replaces_existing_values() {
        let parts = upstream(200, &[("set-cookie", "a=1"), ("set-cookie", "b=2")]);
        let response = apply(
            parts,
            Bytes::new(),
            &result(None, &[("set-cookie", "c=3"), ("x-new", "yes")]),
            &Method::GET,
        );

        let cookies: Vec<_> = response.headers().get_all("set-cookie").iter().collect();
        assert_eq!(cookies, vec!["c=3"]);
        assert_eq!(response.headers()["x-new"], "yes");
    }

    #[test]
    fn test_managed_header_overrides_are_ignored() {
        let parts = upstream(200, &[]);
        let response = apply(
            parts,
            Bytes::from("abc"),
            &result(None, &[("content-length", "999"), ("transfer-encoding", "chunked")]),
            &Method::GET,
        );

        assert_eq!(response.headers()["content-length"], "3");
        assert!(response.headers().get("transfer-encoding").is_none());
    }

    #[test]
    fn test_invalid_header_override_is_skipped() {
        let parts = upstream(200, &[]);
        let response = apply(
            parts,
            Bytes::new(),
            &result(None, &[("bad name", "v"), ("x-ok", "1")]),
            &Method::GET,
        );

        assert_eq!(response.headers()["x-ok"], "1");
        assert_eq!(response.headers().len(), 2);
    }

    #[tokio::test]
    async fn test_head_keeps_declared_length() {
        let parts = upstream(200, &[("content-length", "42")]);
        let response = apply(parts, Bytes::new(), &result(Some("ignored"), &[]), &Method::HEAD);

        assert_eq!(response.headers()["content-length"], "42");
        assert!(body_of(response).await.is_empty());
    }

    #[test]
    fn test_no_content_has_no_length() {
        let parts = upstream(204, &[]);
        let response = apply(parts, Bytes::new(), &ReconciledResult::default(), &Method::GET);
        assert!(response.headers().get("content-length").is_none());
    }
}
