//! Reverse proxy that rewrites origin responses through an ordered set of
//! sandboxed Rhai scripts.

pub mod config;
pub mod metrics;
pub mod pipeline;
pub mod proxy;
pub mod scripting;
