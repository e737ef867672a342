//! Candidates produced by resolution

use crate::host::{FunctionRef, HostValue};
use crate::query::QueryId;
use crate::registry::ModuleId;
use itertools::Itertools;
use serde::Serialize;
use std::fmt;

/// Which scan stage produced a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum DiscoveryPath {
    /// Hand-ordered known-shape probe; `rank` is its position in the list.
    KnownShape { label: String, rank: usize },
    /// The query's best-known property path.
    BestKnownPath,
    /// Walk of a module the host had already evaluated.
    Instantiated { module: ModuleId },
    /// Walk of a module evaluated by the scan after a source-text hit.
    Evaluated { module: ModuleId },
}

impl fmt::Display for DiscoveryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryPath::KnownShape { label, .. } => write!(f, "known-shape:{}", label),
            DiscoveryPath::BestKnownPath => write!(f, "best-known-path"),
            DiscoveryPath::Instantiated { module } => write!(f, "instantiated:{}", module),
            DiscoveryPath::Evaluated { module } => write!(f, "evaluated:{}", module),
        }
    }
}

/// One hypothesis for satisfying a capability query.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub callable: FunctionRef,
    /// Receiver bound as `this` when invoking.
    pub context: HostValue,
    pub key: String,
    pub path: DiscoveryPath,
    pub score: i64,
}

impl Candidate {
    pub fn identity(&self) -> usize {
        self.callable.identity()
    }

    pub fn summary(&self) -> ScoredEntry {
        ScoredEntry {
            key: self.key.clone(),
            path: self.path.to_string(),
            arity: self.callable.arity(),
            score: self.score,
        }
    }
}

/// Loggable view of a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScoredEntry {
    pub key: String,
    pub path: String,
    pub arity: usize,
    pub score: i64,
}

impl fmt::Display for ScoredEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}={}", self.key, self.arity, self.path, self.score)
    }
}

/// Counts gathered while building a candidate set. Advisory only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolutionDiagnostics {
    pub known_shape_hits: usize,
    pub best_known_path_hit: bool,
    pub instantiated_modules: usize,
    pub instantiated_matched: usize,
    pub pending_modules: usize,
    pub pending_with_hints: usize,
    pub evaluated: usize,
    pub evaluation_failures: usize,
    pub nodes_walked: usize,
    pub truncated_walks: usize,
    pub raw_candidates: usize,
    pub unique_candidates: usize,
    pub top: Vec<ScoredEntry>,
}

impl fmt::Display for ResolutionDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "known={} path={} instantiated={}/{} pending={}/{} evaluated={} (failed {}) nodes={} truncated={} candidates={}/{} top=[{}]",
            self.known_shape_hits,
            self.best_known_path_hit,
            self.instantiated_matched,
            self.instantiated_modules,
            self.pending_with_hints,
            self.pending_modules,
            self.evaluated,
            self.evaluation_failures,
            self.nodes_walked,
            self.truncated_walks,
            self.unique_candidates,
            self.raw_candidates,
            self.top.iter().join(", ")
        )
    }
}

/// Ranked, de-duplicated candidates for one query.
#[derive(Debug, Clone)]
pub struct CandidateSet {
    pub query: QueryId,
    candidates: Vec<Candidate>,
    pub diagnostics: ResolutionDiagnostics,
}

impl CandidateSet {
    pub fn new(query: QueryId, candidates: Vec<Candidate>, diagnostics: ResolutionDiagnostics) -> Self {
        Self {
            query,
            candidates,
            diagnostics,
        }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn first(&self) -> Option<&Candidate> {
        self.candidates.first()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Candidate> {
        self.candidates.iter()
    }

    pub fn as_slice(&self) -> &[Candidate] {
        &self.candidates
    }
}

impl<'a> IntoIterator for &'a CandidateSet {
    type Item = &'a Candidate;
    type IntoIter = std::slice::Iter<'a, Candidate>;

    fn into_iter(self) -> Self::IntoIter {
        self.candidates.iter()
    }
}
