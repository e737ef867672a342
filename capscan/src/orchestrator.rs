//! Ranked fallback over resolved candidates
//!
//! Resolution is always forced fresh here: a stale candidate set is the most
//! likely reason a previous dispatch failed. Candidates are then invoked one
//! at a time in ranked order until one succeeds.

use crate::candidate::ScoredEntry;
use crate::config::CapscanConfig;
use crate::error::CapabilityError;
use crate::host::HostValue;
use crate::invoker::{CandidateInvoker, InvocationOutcome, ShapeInvoker};
use crate::probe::ConfirmationProbe;
use crate::query::{CapabilityQuery, DomainArgs};
use crate::resolver::Resolver;
use std::rc::Rc;
use tracing::{debug, info, warn};

/// The candidate and shape that took effect.
#[derive(Debug, Clone)]
pub struct InvocationSuccess {
    pub candidate: ScoredEntry,
    pub shape: String,
    pub value: HostValue,
    /// Candidates invoked, including the successful one.
    pub tried: usize,
}

pub struct FallbackOrchestrator<I = ShapeInvoker> {
    resolver: Rc<Resolver>,
    invoker: I,
    max_reported_failures: usize,
}

impl FallbackOrchestrator<ShapeInvoker> {
    pub fn new(resolver: Rc<Resolver>, config: &CapscanConfig) -> Self {
        Self::with_invoker(
            resolver,
            ShapeInvoker::new(config.invoke.settle_timeout()),
            config,
        )
    }
}

impl<I: CandidateInvoker> FallbackOrchestrator<I> {
    pub fn with_invoker(resolver: Rc<Resolver>, invoker: I, config: &CapscanConfig) -> Self {
        Self {
            resolver,
            invoker,
            max_reported_failures: config.invoke.max_reported_failures,
        }
    }

    pub fn resolver(&self) -> &Rc<Resolver> {
        &self.resolver
    }

    pub fn invoker(&self) -> &I {
        &self.invoker
    }

    /// Resolve `query` afresh and invoke candidates until one succeeds.
    pub async fn resolve_and_invoke(
        &self,
        query: &CapabilityQuery,
        args: &DomainArgs,
        probe: Option<&dyn ConfirmationProbe>,
    ) -> Result<InvocationSuccess, CapabilityError> {
        let set = self.resolver.resolve(query, true)?;
        if set.is_empty() {
            warn!(query = %query.id(), diagnostics = %set.diagnostics, "no candidates found");
            return Err(CapabilityError::NoCandidatesFound {
                query: query.id().to_string(),
                diagnostics: set.diagnostics.to_string(),
            });
        }

        let mut failures = Vec::new();
        let mut tried = 0;
        for candidate in set.iter() {
            tried += 1;
            debug!(
                query = %query.id(),
                rank = tried,
                candidate = %candidate.summary(),
                "invoking candidate"
            );
            let report = self
                .invoker
                .invoke(candidate, query.call_shapes(), args, probe)
                .await;

            match report.outcome {
                InvocationOutcome::Success { shape, value } => {
                    info!(
                        query = %query.id(),
                        candidate = %candidate.summary(),
                        shape = %shape,
                        tried,
                        "capability invoked"
                    );
                    return Ok(InvocationSuccess {
                        candidate: candidate.summary(),
                        shape,
                        value,
                        tried,
                    });
                }
                outcome => {
                    if failures.len() < self.max_reported_failures {
                        let reason = outcome.failure_message().unwrap_or_default();
                        failures.push(format!("{}: {}", candidate.key, reason));
                    }
                }
            }
        }

        warn!(
            query = %query.id(),
            tried,
            diagnostics = %set.diagnostics,
            "all candidates exhausted"
        );
        Err(CapabilityError::AllCandidatesExhausted {
            query: query.id().to_string(),
            tried,
            failures,
            diagnostics: set.diagnostics.to_string(),
        })
    }
}
