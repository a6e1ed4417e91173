//! Runs every registered script against one transaction snapshot.
//!
//! One executor is owned by one pool worker and is never shared. Scripts run
//! sequentially in registry order; a failure in one script is recorded and
//! the rest still run.

use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::proposal::MutationProposal;
use super::registry::{ScriptEntry, ScriptRegistry};
use super::rhai_engine::{SandboxEngine, SandboxLimits};
use super::ScriptError;
use crate::config::ScriptsConfig;
use crate::metrics;
use crate::pipeline::{ReconciledResult, Reconciler, TransactionSnapshot};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub limits: SandboxLimits,
    /// Time budget for one script invocation
    pub script_timeout: Duration,
}

impl ExecutorConfig {
    pub fn from_scripts_config(config: &ScriptsConfig) -> Self {
        Self {
            limits: SandboxLimits::from_config(config),
            script_timeout: Duration::from_millis(config.timeout_ms),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from_scripts_config(&ScriptsConfig::default())
    }
}

/// What a single invocation produced.
#[derive(Debug)]
pub enum InvocationOutcome {
    Proposal(MutationProposal),
    NoMutation,
    Failed(ScriptError),
}

impl InvocationOutcome {
    /// Label used for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            InvocationOutcome::Proposal(_) => "proposal",
            InvocationOutcome::NoMutation => "no_mutation",
            InvocationOutcome::Failed(ScriptError::TimedOut(_)) => "timed_out",
            InvocationOutcome::Failed(ScriptError::InvalidProposal(_)) => "invalid_result",
            InvocationOutcome::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationReport {
    pub script: String,
    pub outcome: &'static str,
    pub elapsed: Duration,
}

/// Result of running the whole registry against one snapshot.
#[derive(Debug, Clone, Default)]
pub struct PipelineRun {
    pub result: ReconciledResult,
    pub invocations: Vec<InvocationReport>,
}

pub struct ScriptExecutor {
    engine: SandboxEngine,
    script_timeout: Duration,
}

impl ScriptExecutor {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            engine: SandboxEngine::new(&config.limits),
            script_timeout: config.script_timeout,
        }
    }

    /// Invoke one script, converting every failure mode into an outcome.
    pub fn invoke(&self, entry: &ScriptEntry, snapshot: &TransactionSnapshot) -> InvocationOutcome {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.engine.invoke(
                entry.ast(),
                snapshot.request(),
                snapshot.response(),
                self.script_timeout,
            )
        }));

        match result {
            Err(payload) => {
                InvocationOutcome::Failed(ScriptError::Panicked(panic_message(&*payload)))
            }
            Ok(Err(err)) => InvocationOutcome::Failed(err),
            Ok(Ok(value)) => match MutationProposal::from_dynamic(value) {
                Ok(Some(proposal)) => InvocationOutcome::Proposal(proposal),
                Ok(None) => InvocationOutcome::NoMutation,
                Err(err) => InvocationOutcome::Failed(err.into()),
            },
        }
    }

    /// Run every script in registry order and reconcile their proposals.
    pub fn run(&self, registry: &ScriptRegistry, snapshot: &TransactionSnapshot) -> PipelineRun {
        let mut reconciler = Reconciler::new();
        let mut invocations = Vec::with_capacity(registry.len());

        for entry in registry.entries() {
            let start = Instant::now();
            let outcome = self.invoke(entry, snapshot);
            let elapsed = start.elapsed();
            let label = outcome.label();

            metrics::record_script_invocation(
                entry.name(),
                label,
                elapsed.as_secs_f64() * 1000.0,
            );

            match outcome {
                InvocationOutcome::Proposal(proposal) => {
                    debug!(
                        "Script {} proposed body={} headers={:?} in {:?}",
                        entry.name(),
                        proposal.body.is_some(),
                        proposal.headers.keys().collect::<Vec<_>>(),
                        elapsed
                    );
                    reconciler.fold(proposal);
                }
                InvocationOutcome::NoMutation => {
                    debug!("Script {} proposed no mutation in {:?}", entry.name(), elapsed);
                }
                InvocationOutcome::Failed(err) => {
                    warn!("Script {} failed, ignoring its result: {}", entry.name(), err);
                }
            }

            invocations.push(InvocationReport {
                script: entry.name().to_string(),
                outcome: label,
                elapsed,
            });
        }

        debug!(
            "Reconciled {} proposals from {} scripts",
            reconciler.folded(),
            registry.len()
        );

        PipelineRun {
            result: reconciler.finish(),
            invocations,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::FieldMap;
    use crate::scripting::RhaiValidator;

    fn snapshot() -> TransactionSnapshot {
        let request: FieldMap = [("Method", "GET"), ("URL", "http://origin/x")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let response: FieldMap = [("StatusCode", "200"), ("Body", "hello"), ("Header_X-Orig", "a")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        TransactionSnapshot::from_maps(request, response)
    }

    fn registry(sources: &[(&str, &str)]) -> ScriptRegistry {
        ScriptRegistry::from_sources(sources.iter().copied(), &RhaiValidator::default())
    }

    fn executor(timeout_ms: u64) -> ScriptExecutor {
        ScriptExecutor::new(&ExecutorConfig {
            limits: SandboxLimits::default(),
            script_timeout: Duration::from_millis(timeout_ms),
        })
    }

    #[test]
    fn test_scripts_see_original_snapshot() {
        let registry = registry(&[
            ("1.rhai", r#"fn modify(request, response) { #{ body: "first" } }"#),
            (
                "2.rhai",
                r#"fn modify(request, response) { #{ headers: #{ "x-saw": response["Body"] } } }"#,
            ),
        ]);

        let run = executor(1000).run(&registry, &snapshot());

        assert_eq!(run.result.body.as_deref(), Some("first"));
        assert_eq!(run.result.headers["x-saw"], "hello");
    }

    #[test]
    fn test_last_script_wins() {
        let registry = registry(&[
            (
                "a.rhai",
                r#"fn modify(request, response) { #{ body: "a", headers: #{ "x-k": "a" } } }"#,
            ),
            (
                "b.rhai",
                r#"fn modify(request, response) { #{ body: "b", headers: #{ "X-K": "b" } } }"#,
            ),
        ]);

        let run = executor(1000).run(&registry, &snapshot());
        assert_eq!(run.result.body.as_deref(), Some("b"));
        assert_eq!(run.result.headers["x-k"], "b");
    }

    #[test]
    fn test_failures_are_isolated() {
        let registry = registry(&[
            ("1-throws.rhai", r#"fn modify(request, response) { throw "nope"; }"#),
            ("2-bad-shape.rhai", r#"fn modify(request, response) { 42 }"#),
            (
                "3-loops.rhai",
                r#"fn modify(request, response) { let x = 0; loop { x += 1; } }"#,
            ),
            ("4-ok.rhai", r#"fn modify(request, response) { #{ headers: #{ "x-ok": "1" } } }"#),
        ]);

        let run = executor(50).run(&registry, &snapshot());

        assert_eq!(run.result.headers.len(), 1);
        assert_eq!(run.result.headers["x-ok"], "1");
        assert!(run.result.body.is_none());

        let outcomes: Vec<_> = run.invocations.iter().map(|r| r.outcome).collect();
        assert_eq!(outcomes, vec!["failed", "invalid_result", "timed_out", "proposal"]);
    }

    #[test]
    fn test_empty_registry_is_pass_through() {
        let run = executor(1000).run(&ScriptRegistry::default(), &snapshot());
        assert!(run.result.is_empty());
        assert!(run.invocations.is_empty());
    }

    #[test]
    fn test_no_mutation_outcome() {
        let registry = registry(&[("noop.rhai", "fn modify(request, response) { () }")]);
        let run = executor(1000).run(&registry, &snapshot());
        assert_eq!(run.invocations[0].outcome, "no_mutation");
        assert!(run.result.is_empty());
    }

    #[test]
    fn test_state_does_not_persist_between_transactions() {
        let registry = registry(&[(
            "counter.rhai",
            r#"
            fn modify(request, response) {
                response["Body"] += "!";
                #{ body: response["Body"] }
            }
            "#,
        )]);
        let executor = executor(1000);

        let first = executor.run(&registry, &snapshot());
        let second = executor.run(&registry, &snapshot());
        assert_eq!(first.result.body.as_deref(), Some("hello!"));
        assert_eq!(second.result.body.as_deref(), Some("hello!"));
    }

    #[test]
    fn test_same_snapshot_same_result() {
        let registry = registry(&[
            (
                "10-stamp.rhai",
                r#"
                fn modify(request, response) {
                    #{
                        body: response["Body"] + " via " + request["Method"],
                        headers: #{
                            "x-orig": response["Header_X-Orig"] + "2",
                            "x-path": request["URL"]
                        }
                    }
                }
                "#,
            ),
            ("20-fault.rhai", r#"fn modify(request, response) { throw "nope"; }"#),
            (
                "30-override.rhai",
                r#"fn modify(request, response) { #{ headers: #{ "x-orig": "final" } } }"#,
            ),
        ]);
        let executor = executor(1000);
        let snapshot = snapshot();

        let first = executor.run(&registry, &snapshot);
        let second = executor.run(&registry, &snapshot);

        assert_eq!(first.result, second.result);
        assert_eq!(first.result.body.as_deref(), Some("hello via GET"));
        assert_eq!(first.result.headers["x-orig"], "final");
        assert_eq!(first.result.headers["x-path"], "http://origin/x");

        let outcomes = |run: &PipelineRun| {
            run.invocations
                .iter()
                .map(|r| r.outcome)
                .collect::<Vec<_>>()
        };
        assert_eq!(outcomes(&first), outcomes(&second));
        assert_eq!(outcomes(&first), vec!["proposal", "failed", "proposal"]);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("kaput");
        assert_eq!(panic_message(&*payload), "kaput");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*payload), "owned");
        let payload: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*payload), "unknown panic");
    }
}
