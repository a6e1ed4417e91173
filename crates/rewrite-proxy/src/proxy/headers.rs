//! Header helpers shared by forwarding, snapshotting and rewriting.
//!
//! Static header names avoid runtime `.parse().unwrap()` calls. The extension
//! trait methods accept references and handle cloning internally.

use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use hyper::http::response::Parts;
use hyper::Response;

pub static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

pub static VALUE_HTTP: HeaderValue = HeaderValue::from_static("http");
pub static VALUE_HTTPS: HeaderValue = HeaderValue::from_static("https");

/// Connection-scoped headers (RFC 9110 section 7.6.1) that a proxy must not forward.
static HOP_BY_HOP: [HeaderName; 9] = [
    CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION,
    TE,
    TRAILER,
    TRANSFER_ENCODING,
    UPGRADE,
];

/// Remove hop-by-hop headers, including any named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Headers whose value the proxy derives from the delivered body.
/// Script overrides for these are ignored.
pub fn is_managed_header(name: &HeaderName) -> bool {
    *name == CONTENT_LENGTH || *name == TRANSFER_ENCODING
}

/// Canonical MIME form of a header name: the first letter and every letter
/// after a hyphen upper-cased, everything else lower-cased.
pub fn canonical_header_key(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c.to_ascii_lowercase());
        }
        upper = c == '-';
    }
    out
}

/// Extension trait for setting headers from script-provided strings.
pub trait HeadersExt {
    /// Replace every value of `name` with `value`.
    /// Returns false if the value couldn't be converted to a valid header value.
    fn set_header_value(&mut self, name: &HeaderName, value: &str) -> bool;
}

impl<B> HeadersExt for Response<B> {
    fn set_header_value(&mut self, name: &HeaderName, value: &str) -> bool {
        self.headers_mut().set_header_value(name, value)
    }
}

impl HeadersExt for Parts {
    fn set_header_value(&mut self, name: &HeaderName, value: &str) -> bool {
        self.headers.set_header_value(name, value)
    }
}

impl HeadersExt for HeaderMap {
    fn set_header_value(&mut self, name: &HeaderName, value: &str) -> bool {
        match HeaderValue::from_str(value) {
            Ok(header_value) => {
                self.insert(name.clone(), header_value);
                true
            }
            Err(_) => false,
        }
    }
}
