//! Speculative invocation of one candidate
//!
//! Each applicable [`CallShape`] is tried in order with the candidate's
//! context as receiver. A synchronous throw moves on immediately. A return
//! is only a tentative success: with a confirmation probe the call counts
//! once the probe observes its side effect, and a probe deadline is treated
//! as that shape silently failing.
//!
//! A pending host call the attempt stops waiting for is abandoned, never
//! cancelled: it keeps running on a local task and its result is ignored.
//! Invocation therefore has to run inside a [`tokio::task::LocalSet`].

use crate::candidate::Candidate;
use crate::error::AttemptError;
use crate::host::{Completion, HostValue, LocalHostFuture};
use crate::probe::{await_confirmation, ConfirmationProbe, ProbeBaseline};
use crate::query::{shapes_for_key, CallShape, DomainArgs};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Result of invoking one candidate. Never coerced into `Success`.
#[derive(Debug, Clone)]
pub enum InvocationOutcome {
    Success { shape: String, value: HostValue },
    /// Every shape failed; carries the last failure.
    Rejected(AttemptError),
    /// The last shape returned but its effect was never observed.
    TimedOutWaitingForConfirmation { shape: String },
}

impl InvocationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, InvocationOutcome::Success { .. })
    }

    /// Short reason for a failed outcome.
    pub fn failure_message(&self) -> Option<String> {
        match self {
            InvocationOutcome::Success { .. } => None,
            InvocationOutcome::Rejected(error) => Some(error.to_string()),
            InvocationOutcome::TimedOutWaitingForConfirmation { shape } => {
                Some(format!("{}: timed out waiting for confirmation", shape))
            }
        }
    }
}

/// Wall-clock window of one shape attempt.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub shape: String,
    pub started: Instant,
    pub finished: Instant,
    pub error: Option<AttemptError>,
}

#[derive(Debug, Clone)]
pub struct InvocationReport {
    pub outcome: InvocationOutcome,
    pub attempts: Vec<AttemptRecord>,
}

/// Invokes a single candidate against a list of call shapes.
#[async_trait(?Send)]
pub trait CandidateInvoker {
    async fn invoke(
        &self,
        candidate: &Candidate,
        shapes: &[CallShape],
        args: &DomainArgs,
        probe: Option<&dyn ConfirmationProbe>,
    ) -> InvocationReport;
}

/// Default invoker: shapes strictly one after another.
#[derive(Debug, Clone)]
pub struct ShapeInvoker {
    /// Bound on awaiting an asynchronous return when no probe is given.
    settle_timeout: Duration,
}

impl ShapeInvoker {
    pub fn new(settle_timeout: Duration) -> Self {
        Self { settle_timeout }
    }

    async fn attempt(
        &self,
        candidate: &Candidate,
        shape: &CallShape,
        args: &DomainArgs,
        probe: Option<&dyn ConfirmationProbe>,
    ) -> Result<HostValue, AttemptError> {
        let baseline = probe.map(|p| p.baseline()).unwrap_or_default();
        let argv = shape.build_args(args, &candidate.callable);
        let completion = candidate
            .callable
            .call(&candidate.context, &argv)
            .map_err(|error| AttemptError::Threw {
                shape: shape.name().to_string(),
                error,
            })?;

        match (completion, probe) {
            (Completion::Ready(value), None) => {
                check(shape, &value)?;
                Ok(value)
            }
            (Completion::Ready(value), Some(probe)) => {
                check(shape, &value)?;
                confirm(shape, probe, &baseline).await?;
                Ok(value)
            }
            (Completion::Pending(mut future), None) => {
                let settled = tokio::select! {
                    result = &mut future => Some(result),
                    _ = tokio::time::sleep(self.settle_timeout) => None,
                };
                match settled {
                    Some(Ok(value)) => {
                        check(shape, &value)?;
                        Ok(value)
                    }
                    Some(Err(error)) => Err(AttemptError::Rejected {
                        shape: shape.name().to_string(),
                        error,
                    }),
                    None => {
                        abandon(&candidate.key, shape, future);
                        Err(AttemptError::SettleTimeout {
                            shape: shape.name().to_string(),
                            after_ms: self.settle_timeout.as_millis() as u64,
                        })
                    }
                }
            }
            (Completion::Pending(future), Some(probe)) => {
                race_confirmation(&candidate.key, shape, future, probe, &baseline).await
            }
        }
    }
}

impl Default for ShapeInvoker {
    fn default() -> Self {
        Self::new(Duration::from_millis(1500))
    }
}

#[async_trait(?Send)]
impl CandidateInvoker for ShapeInvoker {
    async fn invoke(
        &self,
        candidate: &Candidate,
        shapes: &[CallShape],
        args: &DomainArgs,
        probe: Option<&dyn ConfirmationProbe>,
    ) -> InvocationReport {
        let mut attempts = Vec::new();
        let mut last_error = AttemptError::NoShapes;

        for shape in shapes_for_key(shapes, &candidate.key) {
            let started = Instant::now();
            let result = self.attempt(candidate, shape, args, probe).await;
            let finished = Instant::now();

            match result {
                Ok(value) => {
                    debug!(key = %candidate.key, shape = shape.name(), "call shape succeeded");
                    attempts.push(AttemptRecord {
                        shape: shape.name().to_string(),
                        started,
                        finished,
                        error: None,
                    });
                    return InvocationReport {
                        outcome: InvocationOutcome::Success {
                            shape: shape.name().to_string(),
                            value,
                        },
                        attempts,
                    };
                }
                Err(error) => {
                    debug!(key = %candidate.key, shape = shape.name(), error = %error, "call shape failed");
                    attempts.push(AttemptRecord {
                        shape: shape.name().to_string(),
                        started,
                        finished,
                        error: Some(error.clone()),
                    });
                    last_error = error;
                }
            }
        }

        let outcome = match last_error {
            AttemptError::ConfirmationTimeout { shape, .. } => {
                InvocationOutcome::TimedOutWaitingForConfirmation { shape }
            }
            other => InvocationOutcome::Rejected(other),
        };
        InvocationReport { outcome, attempts }
    }
}

fn check(shape: &CallShape, value: &HostValue) -> Result<(), AttemptError> {
    shape
        .check_result(value)
        .map_err(|error| AttemptError::Rejected {
            shape: shape.name().to_string(),
            error,
        })
}

async fn confirm(
    shape: &CallShape,
    probe: &dyn ConfirmationProbe,
    baseline: &ProbeBaseline,
) -> Result<(), AttemptError> {
    if await_confirmation(probe, baseline).await {
        Ok(())
    } else {
        Err(confirmation_timeout(shape, probe))
    }
}

fn confirmation_timeout(shape: &CallShape, probe: &dyn ConfirmationProbe) -> AttemptError {
    AttemptError::ConfirmationTimeout {
        shape: shape.name().to_string(),
        after_ms: probe.policy().deadline.as_millis() as u64,
    }
}

/// Let a call nobody waits for any more run to completion on its own.
fn abandon(key: &str, shape: &CallShape, future: LocalHostFuture) {
    let key = key.to_string();
    let shape = shape.name().to_string();
    tokio::task::spawn_local(async move {
        match future.await {
            Ok(_) => debug!(key = %key, shape = %shape, "abandoned call settled"),
            Err(error) => debug!(key = %key, shape = %shape, error = %error, "abandoned call rejected"),
        }
    });
}

/// Poll for confirmation while the call's own return is still pending.
///
/// A rejection that arrives first fails the shape; a resolution is checked
/// and then confirmation is still awaited. If the probe decides first, the
/// pending return is abandoned.
async fn race_confirmation(
    key: &str,
    shape: &CallShape,
    mut future: LocalHostFuture,
    probe: &dyn ConfirmationProbe,
    baseline: &ProbeBaseline,
) -> Result<HostValue, AttemptError> {
    let confirmation = await_confirmation(probe, baseline);
    tokio::pin!(confirmation);
    let mut settled = false;
    let mut value = HostValue::Undefined;

    let confirmed = loop {
        tokio::select! {
            biased;
            result = &mut future, if !settled => {
                settled = true;
                match result {
                    Ok(resolved) => {
                        check(shape, &resolved)?;
                        value = resolved;
                    }
                    Err(error) => {
                        return Err(AttemptError::Rejected {
                            shape: shape.name().to_string(),
                            error,
                        });
                    }
                }
            }
            confirmed = &mut confirmation => break confirmed,
        }
    };

    if !settled {
        abandon(key, shape, future);
    }
    if confirmed {
        Ok(value)
    } else {
        Err(confirmation_timeout(shape, probe))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::DiscoveryPath;
    use crate::host::{ArrayRef, FunctionRef, HostError};
    use crate::probe::{ConfirmationStore, PollPolicy, StoreProbe};
    use crate::query::Destination;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct ArrayStore(ArrayRef);

    impl ConfirmationStore for ArrayStore {
        fn entries(&self, _destination: &Destination) -> Vec<HostValue> {
            self.0.items()
        }
    }

    fn candidate(callable: FunctionRef) -> Candidate {
        Candidate {
            key: callable.name().to_string(),
            callable,
            context: HostValue::Undefined,
            path: DiscoveryPath::BestKnownPath,
            score: 1,
        }
    }

    fn shapes() -> Vec<CallShape> {
        vec![
            CallShape::new("single", |a, _| vec![a.payload.clone()]),
            CallShape::new("with-destination", |a, _| {
                vec![a.destination.value(), a.payload.clone()]
            }),
        ]
    }

    fn args() -> DomainArgs {
        DomainArgs::new(HostValue::from("file"), Destination::new("c1"), 0)
    }

    #[tokio::test]
    async fn test_falls_through_throwing_shapes() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let log = calls.clone();
        let f = FunctionRef::new("addFile", 2, move |_, argv| {
            log.borrow_mut().push(argv.len());
            if argv.len() == 1 {
                Err(HostError::new("wrong arity"))
            } else {
                Ok(Completion::ready(true))
            }
        });
        let report = ShapeInvoker::default()
            .invoke(&candidate(f), &shapes(), &args(), None)
            .await;
        assert!(report.outcome.is_success());
        assert_eq!(*calls.borrow(), vec![1, 2]);
        assert_eq!(report.attempts.len(), 2);
    }

    #[tokio::test]
    async fn test_result_check_rejects_soft_failure() {
        let f = FunctionRef::new("send", 1, |_, _| {
            Ok(Completion::ready(HostValue::object([("ok", false)])))
        });
        let shape = CallShape::new("only", |a, _| vec![a.payload.clone()]).with_result_check(|v| {
            match v.get("ok").and_then(|ok| ok.as_bool()) {
                Some(false) => Err(HostError::new("ok=false")),
                _ => Ok(()),
            }
        });
        let report = ShapeInvoker::default()
            .invoke(&candidate(f), &[shape], &args(), None)
            .await;
        assert!(matches!(
            report.outcome,
            InvocationOutcome::Rejected(AttemptError::Rejected { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_rejection_fails_shape_before_deadline() {
        let f = FunctionRef::new("upload", 1, |_, _| {
            Ok(Completion::pending(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Err(HostError::new("denied"))
            }))
        });
        let store = ArrayStore(ArrayRef::new(vec![]));
        let probe = StoreProbe::new(
            store,
            Destination::new("c1"),
            PollPolicy::new(Duration::from_millis(100), Duration::from_millis(1000)),
            |_| true,
        );
        let started = Instant::now();
        let report = ShapeInvoker::default()
            .invoke(&candidate(f), &shapes()[..1], &args(), Some(&probe))
            .await;
        assert!(matches!(
            report.outcome,
            InvocationOutcome::Rejected(AttemptError::Rejected { .. })
        ));
        assert_eq!(started.elapsed(), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_without_probe_is_bounded() {
        let landed = Rc::new(RefCell::new(false));
        let flag = landed.clone();
        let f = FunctionRef::new("upload", 1, move |_, _| {
            let flag = flag.clone();
            Ok(Completion::pending(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                *flag.borrow_mut() = true;
                Ok(HostValue::Bool(true))
            }))
        });
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let report = ShapeInvoker::new(Duration::from_millis(300))
                    .invoke(&candidate(f), &shapes()[..1], &args(), None)
                    .await;
                assert!(matches!(
                    report.outcome,
                    InvocationOutcome::Rejected(AttemptError::SettleTimeout { after_ms: 300, .. })
                ));
                assert!(!*landed.borrow());

                // the call outlives the attempt that gave up on it
                tokio::time::sleep(Duration::from_millis(300)).await;
                assert!(*landed.borrow());
            })
            .await;
    }

    #[tokio::test]
    async fn test_no_shapes() {
        let f = FunctionRef::new("upload", 1, |_, _| Ok(Completion::ready(true)));
        let report = ShapeInvoker::default()
            .invoke(&candidate(f), &[], &args(), None)
            .await;
        assert!(matches!(
            report.outcome,
            InvocationOutcome::Rejected(AttemptError::NoShapes)
        ));
    }
}
