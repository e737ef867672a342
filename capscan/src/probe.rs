//! Confirmation probes
//!
//! Side-effect-only host calls give no trustworthy return value. A probe
//! watches an external store for the entry the call should have produced,
//! polling at a fixed interval until a hard deadline.

use crate::query::Destination;
use crate::host::HostValue;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub deadline: Duration,
}

impl PollPolicy {
    pub fn new(interval: Duration, deadline: Duration) -> Self {
        Self { interval, deadline }
    }
}

/// Store state captured right before an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProbeBaseline {
    pub entry_count: usize,
    /// Identities of entries that already existed.
    pub identities: HashSet<usize>,
}

impl ProbeBaseline {
    pub fn capture(entries: &[HostValue]) -> Self {
        Self {
            entry_count: entries.len(),
            identities: entries.iter().filter_map(HostValue::identity).collect(),
        }
    }

    /// Entries that were not there when the baseline was taken.
    ///
    /// Objects are told apart by identity. Primitives have none, so only
    /// those past the baseline count are considered new.
    pub fn fresh<'a>(&self, entries: &'a [HostValue]) -> Vec<&'a HostValue> {
        entries
            .iter()
            .enumerate()
            .filter(|(index, entry)| match entry.identity() {
                Some(id) => !self.identities.contains(&id),
                None => *index >= self.entry_count,
            })
            .map(|(_, entry)| entry)
            .collect()
    }
}

pub trait ConfirmationProbe {
    fn policy(&self) -> PollPolicy;

    /// Snapshot taken before each call shape is tried.
    fn baseline(&self) -> ProbeBaseline;

    /// Whether the intended side effect is now observable as a new entry.
    fn matches(&self, baseline: &ProbeBaseline) -> bool;
}

/// External store listing entries for a destination.
pub trait ConfirmationStore {
    fn entries(&self, destination: &Destination) -> Vec<HostValue>;
}

type EntryMatcher = Box<dyn Fn(&HostValue) -> bool>;

/// Probe over a [`ConfirmationStore`]: confirmed when an entry added since the
/// baseline satisfies the matcher, or (optionally) when the entry count grew.
pub struct StoreProbe<S> {
    store: S,
    destination: Destination,
    matcher: EntryMatcher,
    policy: PollPolicy,
    growth_confirms: bool,
}

impl<S: ConfirmationStore> StoreProbe<S> {
    pub fn new<F>(store: S, destination: Destination, policy: PollPolicy, matcher: F) -> Self
    where
        F: Fn(&HostValue) -> bool + 'static,
    {
        Self {
            store,
            destination,
            matcher: Box::new(matcher),
            policy,
            growth_confirms: false,
        }
    }

    /// Treat any new entry as confirmation.
    pub fn confirm_on_growth(mut self) -> Self {
        self.growth_confirms = true;
        self
    }
}

impl<S: ConfirmationStore> ConfirmationProbe for StoreProbe<S> {
    fn policy(&self) -> PollPolicy {
        self.policy
    }

    fn baseline(&self) -> ProbeBaseline {
        ProbeBaseline::capture(&self.store.entries(&self.destination))
    }

    fn matches(&self, baseline: &ProbeBaseline) -> bool {
        let entries = self.store.entries(&self.destination);
        if self.growth_confirms && entries.len() > baseline.entry_count {
            return true;
        }
        baseline
            .fresh(&entries)
            .into_iter()
            .any(|entry| (self.matcher)(entry))
    }
}

/// Poll `probe` until it matches (`true`) or its deadline passes (`false`).
///
/// The first check happens one interval after the call, never at time zero.
pub async fn await_confirmation(probe: &dyn ConfirmationProbe, baseline: &ProbeBaseline) -> bool {
    let policy = probe.policy();
    let started = Instant::now();
    loop {
        let elapsed = started.elapsed();
        if elapsed >= policy.deadline {
            return false;
        }
        let remaining = policy.deadline - elapsed;
        tokio::time::sleep(policy.interval.min(remaining)).await;
        if probe.matches(baseline) {
            return true;
        }
    }
}
