//! Decoding of the value returned by a script's `modify` entry point.
//!
//! Accepted shapes:
//! - `()` means "no mutation";
//! - a map with an optional `body` (string) and an optional `headers`
//!   (map of header name to string value). Either key may also be `()`.
//!
//! Unknown keys are ignored. Anything else is an invalid result and the
//! script's contribution is dropped by the caller.

use hyper::header::{HeaderName, HeaderValue};
use rhai::{Dynamic, Map};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

const BODY_KEY: &str = "body";
const HEADERS_KEY: &str = "headers";

/// A validated mutation proposed by one script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationProposal {
    /// Replacement body, when the script set one
    pub body: Option<String>,
    /// Header overrides keyed by lowercase header name
    pub headers: BTreeMap<String, String>,
}

impl MutationProposal {
    pub fn is_empty(&self) -> bool {
        self.body.is_none() && self.headers.is_empty()
    }

    /// Decode a script result. `Ok(None)` means the script proposed nothing.
    pub fn from_dynamic(value: Dynamic) -> Result<Option<Self>, ProposalError> {
        if value.is_unit() {
            return Ok(None);
        }
        if !value.is::<Map>() {
            return Err(ProposalError::NotAMap(value.type_name().to_string()));
        }
        let type_name = value.type_name();
        let map = value
            .try_cast::<Map>()
            .ok_or_else(|| ProposalError::NotAMap(type_name.to_string()))?;

        let mut proposal = MutationProposal::default();
        for (key, value) in map {
            match key.as_str() {
                BODY_KEY => proposal.body = decode_body(value)?,
                HEADERS_KEY => proposal.headers = decode_headers(value)?,
                other => debug!("Ignoring unknown key `{}` in modify result", other),
            }
        }

        if proposal.is_empty() {
            Ok(None)
        } else {
            Ok(Some(proposal))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProposalError {
    #[error("modify must return a map or (), got {0}")]
    NotAMap(String),
    #[error("`body` must be a string, got {0}")]
    InvalidBody(String),
    #[error("`headers` must be a map, got {0}")]
    InvalidHeaders(String),
    #[error("`{0}` is not a valid header name")]
    InvalidHeaderName(String),
    #[error("header `{name}` must have a string value, got {type_name}")]
    NonStringHeaderValue { name: String, type_name: String },
    #[error("header `{0}` has a value that cannot be sent on the wire")]
    InvalidHeaderValue(String),
    #[error("header `{0}` is set more than once")]
    DuplicateHeader(String),
}

fn decode_body(value: Dynamic) -> Result<Option<String>, ProposalError> {
    if value.is_unit() {
        return Ok(None);
    }
    value
        .into_string()
        .map(Some)
        .map_err(|type_name| ProposalError::InvalidBody(type_name.to_string()))
}

fn decode_headers(value: Dynamic) -> Result<BTreeMap<String, String>, ProposalError> {
    if value.is_unit() {
        return Ok(BTreeMap::new());
    }
    let type_name = value.type_name();
    let map = value
        .try_cast::<Map>()
        .ok_or_else(|| ProposalError::InvalidHeaders(type_name.to_string()))?;

    let mut headers = BTreeMap::new();
    for (name, value) in map {
        let lowered = name.as_str().to_ascii_lowercase();
        if HeaderName::from_bytes(lowered.as_bytes()).is_err() {
            return Err(ProposalError::InvalidHeaderName(name.to_string()));
        }

        let type_name = value.type_name();
        let value = value
            .into_string()
            .map_err(|_| ProposalError::NonStringHeaderValue {
                name: name.to_string(),
                type_name: type_name.to_string(),
            })?;
        if HeaderValue::from_str(&value).is_err() {
            return Err(ProposalError::InvalidHeaderValue(name.to_string()));
        }

        if headers.insert(lowered.clone(), value).is_some() {
            return Err(ProposalError::DuplicateHeader(lowered));
        }
    }
    Ok(headers)
}
