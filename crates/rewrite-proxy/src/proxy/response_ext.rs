//! Conveniences on the responses the handler returns.

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::CONTENT_LENGTH;
use hyper::Response;
use std::convert::Infallible;

pub trait ResponseExt {
    /// Box the body so rewritten responses and error responses share one type.
    fn into_boxed(self) -> Response<BoxBody<Bytes, hyper::Error>>;

    /// Value of the `Content-Length` header, if present and numeric.
    fn declared_length(&self) -> Option<u64>;
}

impl ResponseExt for Response<Full<Bytes>> {
    fn into_boxed(self) -> Response<BoxBody<Bytes, hyper::Error>> {
        self.map(|b| BoxBody::new(b.map_err(|never: Infallible| match never {})))
    }

    fn declared_length(&self) -> Option<u64> {
        self.headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }
}
