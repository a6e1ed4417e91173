//! Sandboxed transformation scripts.
//!
//! Every script defines `fn modify(request, response)`. Both arguments are
//! maps of string to string (see `pipeline::snapshot` for the keys); the
//! return value is decoded into a [`MutationProposal`].

use std::time::Duration;
use thiserror::Error;

mod executor;
pub use executor::{
    ExecutorConfig, InvocationOutcome, InvocationReport, PipelineRun, ScriptExecutor,
};

mod proposal;
pub use proposal::{MutationProposal, ProposalError};

mod registry;
pub use registry::{RegistryError, ScriptEntry, ScriptRegistry};

mod rhai_engine;
pub use rhai_engine::{SandboxEngine, SandboxLimits};

mod rhai_validator;
pub use rhai_validator::{RhaiValidator, ValidationError};

// Script pool for running the pipeline off the async runtime
mod script_pool;
pub use script_pool::{PoolError, ScriptPool, ScriptPoolConfig};

/// Name of the function every script must define.
pub const ENTRY_POINT: &str = "modify";

/// Number of parameters the entry point takes (request, response).
pub const ENTRY_POINT_ARITY: usize = 2;

/// Why one script contributed nothing to a transaction.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("exceeded time budget of {0:?}")]
    TimedOut(Duration),
    #[error("interpreter panicked: {0}")]
    Panicked(String),
    #[error("invalid result: {0}")]
    InvalidProposal(#[from] ProposalError),
}
