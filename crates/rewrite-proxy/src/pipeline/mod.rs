//! Per-transaction pipeline: snapshot the exchange, reconcile what the
//! scripts proposed, rewrite the response.

pub mod reconcile;
pub mod rewrite;
pub mod snapshot;

pub use reconcile::{ReconciledResult, Reconciler};
pub use snapshot::{capture_body, FieldMap, RequestInfo, TransactionSnapshot};
