//! Folding of per-script proposals into one outcome.
//!
//! Proposals are folded in registry order. For each header name the last
//! script that set it wins; the same goes for the body. A script that does
//! not set the body leaves any earlier override in place.

use std::collections::BTreeMap;

use crate::scripting::MutationProposal;

/// Net effect of every script on one transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciledResult {
    pub body: Option<String>,
    /// Lowercase header name to value
    pub headers: BTreeMap<String, String>,
}

impl ReconciledResult {
    pub fn body_overridden(&self) -> bool {
        self.body.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_none() && self.headers.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct Reconciler {
    result: ReconciledResult,
    folded: usize,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fold(&mut self, proposal: MutationProposal) {
        self.folded += 1;
        if let Some(body) = proposal.body {
            self.result.body = Some(body);
        }
        for (name, value) in proposal.headers {
            self.result.headers.insert(name.to_ascii_lowercase(), value);
        }
    }

    /// Number of proposals folded so far.
    pub fn folded(&self) -> usize {
        self.folded
    }

    pub fn finish(self) -> ReconciledResult {
        self.result
    }
}
