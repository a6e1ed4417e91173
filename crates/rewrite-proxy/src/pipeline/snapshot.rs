//! Flattening of a request/response pair into the string maps scripts see.
//!
//! Field extraction policy:
//! - header keys are `Header_` followed by the canonical header name
//!   (`content-type` becomes `Header_Content-Type`);
//! - a header with several values is represented by its first value in
//!   wire order;
//! - header values and bodies that are not valid UTF-8 are decoded lossily;
//! - optional fields that are absent use the sentinels below instead of
//!   being left out;
//! - the query string is exposed raw as `Query`; it is not parsed into
//!   per-parameter fields;
//! - request bodies stream to the origin unread, so form bodies are never
//!   parsed and there is no form field;
//! - response trailers are discarded when the body is buffered and are not
//!   exposed;
//! - with identity encoding on, the origin is asked for an uncompressed body,
//!   so there is no separate "decompressed" flag. Otherwise `Body` is the
//!   encoded bytes decoded lossily.

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::header::{HeaderMap, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use hyper::http::response::Parts;
use hyper::{Method, Request, Response, Uri, Version};
use std::collections::BTreeMap;
use std::net::SocketAddr;

use crate::proxy::headers::canonical_header_key;

/// String-keyed, string-valued view of one side of a transaction.
pub type FieldMap = BTreeMap<String, String>;

pub const HEADER_PREFIX: &str = "Header_";

/// Value for text fields whose source is absent (no header, no query).
pub const ABSENT: &str = "";

/// Value for `ContentLength` when no length was declared.
pub const UNKNOWN_LENGTH: &str = "-1";

pub const TRUE: &str = "true";
pub const FALSE: &str = "false";

/// Request metadata captured before the request is forwarded.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub remote_addr: Option<SocketAddr>,
    pub tls: bool,
}

impl RequestInfo {
    pub fn from_request<B>(req: &Request<B>, remote_addr: Option<SocketAddr>, tls: bool) -> Self {
        Self {
            method: req.method().clone(),
            uri: req.uri().clone(),
            version: req.version(),
            headers: req.headers().clone(),
            remote_addr,
            tls,
        }
    }
}

/// Immutable snapshot of one transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionSnapshot {
    request: FieldMap,
    response: FieldMap,
}

impl TransactionSnapshot {
    /// Build both field maps. `forwarded_url` is the absolute URL the request
    /// was sent to at the origin; `body` is the fully buffered upstream body.
    pub fn build(
        request: &RequestInfo,
        forwarded_url: &Uri,
        response: &Parts,
        body: &[u8],
    ) -> Self {
        Self {
            request: request_fields(request, forwarded_url),
            response: response_fields(response, body),
        }
    }

    /// Assemble a snapshot from pre-built maps.
    pub fn from_maps(request: FieldMap, response: FieldMap) -> Self {
        Self { request, response }
    }

    pub fn request(&self) -> &FieldMap {
        &self.request
    }

    pub fn response(&self) -> &FieldMap {
        &self.response
    }
}

/// Drain the upstream body. The returned bytes are the only copy of the body
/// from here on and must be handed back to the rewriter.
pub async fn capture_body<B>(response: Response<B>) -> Result<(Parts, Bytes), B::Error>
where
    B: Body,
{
    let (parts, body) = response.into_parts();
    let collected = body.collect().await?;
    Ok((parts, collected.to_bytes()))
}

fn request_fields(request: &RequestInfo, forwarded_url: &Uri) -> FieldMap {
    let mut fields = FieldMap::new();
    let (proto, major, minor) = version_fields(request.version);

    fields.insert("Method".into(), request.method.as_str().to_string());
    fields.insert("URL".into(), forwarded_url.to_string());
    fields.insert(
        "RequestURI".into(),
        request
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| request.uri.to_string()),
    );
    fields.insert("Path".into(), request.uri.path().to_string());
    fields.insert(
        "Query".into(),
        request.uri.query().unwrap_or(ABSENT).to_string(),
    );
    fields.insert("Proto".into(), proto.to_string());
    fields.insert("ProtoMajor".into(), major.to_string());
    fields.insert("ProtoMinor".into(), minor.to_string());

    let host = first_value(&request.headers, HOST.as_str())
        .or_else(|| request.uri.authority().map(|a| a.as_str().to_string()))
        .unwrap_or_else(|| ABSENT.to_string());
    fields.insert("Host".into(), host);
    fields.insert(
        "RemoteAddr".into(),
        request
            .remote_addr
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| ABSENT.to_string()),
    );
    fields.insert(
        "TLSEnabled".into(),
        if request.tls { TRUE } else { FALSE }.to_string(),
    );
    fields.insert(
        "ContentLength".into(),
        declared_length(&request.headers),
    );
    fields.insert(
        "TransferEncoding".into(),
        first_value(&request.headers, TRANSFER_ENCODING.as_str())
            .unwrap_or_else(|| ABSENT.to_string()),
    );

    insert_headers(&mut fields, &request.headers);
    fields
}

fn response_fields(response: &Parts, body: &[u8]) -> FieldMap {
    let mut fields = FieldMap::new();
    let (proto, major, minor) = version_fields(response.version);
    let status = response.status;

    fields.insert(
        "Status".into(),
        match status.canonical_reason() {
            Some(reason) => format!("{} {reason}", status.as_u16()),
            None => status.as_u16().to_string(),
        },
    );
    fields.insert("StatusCode".into(), status.as_u16().to_string());
    fields.insert("Proto".into(), proto.to_string());
    fields.insert("ProtoMajor".into(), major.to_string());
    fields.insert("ProtoMinor".into(), minor.to_string());
    fields.insert(
        "ContentLength".into(),
        declared_length(&response.headers),
    );
    fields.insert(
        "TransferEncoding".into(),
        first_value(&response.headers, TRANSFER_ENCODING.as_str())
            .unwrap_or_else(|| ABSENT.to_string()),
    );
    fields.insert("Body".into(), String::from_utf8_lossy(body).into_owned());

    insert_headers(&mut fields, &response.headers);
    fields
}

fn insert_headers(fields: &mut FieldMap, headers: &HeaderMap) {
    for name in headers.keys() {
        if let Some(value) = first_value(headers, name.as_str()) {
            fields.insert(
                format!("{HEADER_PREFIX}{}", canonical_header_key(name.as_str())),
                value,
            );
        }
    }
}

/// First value of a header in wire order.
fn first_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
}

fn declared_length(headers: &HeaderMap) -> String {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(|len| len.to_string())
        .unwrap_or_else(|| UNKNOWN_LENGTH.to_string())
}

fn version_fields(version: Version) -> (&'static str, u8, u8) {
    if version == Version::HTTP_09 {
        ("HTTP/0.9", 0, 9)
    } else if version == Version::HTTP_10 {
        ("HTTP/1.0", 1, 0)
    } else if version == Version::HTTP_2 {
        ("HTTP/2.0", 2, 0)
    } else if version == Version::HTTP_3 {
        ("HTTP/3.0", 3, 0)
    } else {
        ("HTTP/1.1", 1, 1)
    }
}
