//! Capability resolution
//!
//! Turns a [`CapabilityQuery`] into a ranked, de-duplicated [`CandidateSet`]:
//! direct hits from known shapes and the best-known path, then walks of the
//! scanner's instantiated and evaluated roots, every function edge scored.
//! Results are cached per query identity until a forced refresh.

use crate::candidate::{Candidate, CandidateSet, ResolutionDiagnostics};
use crate::config::{CapscanConfig, WalkConfig};
use crate::error::CapabilityError;
use crate::host::HostValue;
use crate::query::{CapabilityQuery, QueryId};
use crate::registry::ModuleRegistry;
use crate::scanner::{DirectHit, RegistryScanner, ScanRoot};
use crate::scoring::Scorer;
use crate::walker::walk;
use indexmap::map::Entry;
use indexmap::IndexMap;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, info};

pub struct Resolver {
    scanner: RegistryScanner,
    walk: WalkConfig,
    diagnostic_top_k: usize,
    cache: RefCell<HashMap<QueryId, Rc<CandidateSet>>>,
    resolving: Cell<bool>,
}

/// Clears the re-entrancy flag however `resolve` exits.
struct ResolvingGuard<'a>(&'a Cell<bool>);

impl Drop for ResolvingGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl Resolver {
    pub fn new(registry: Rc<dyn ModuleRegistry>, config: &CapscanConfig) -> Self {
        Self {
            scanner: RegistryScanner::new(registry, config.scan.clone()),
            walk: config.walk.clone(),
            diagnostic_top_k: config.scan.diagnostic_top_k,
            cache: RefCell::new(HashMap::new()),
            resolving: Cell::new(false),
        }
    }

    pub fn registry(&self) -> &Rc<dyn ModuleRegistry> {
        self.scanner.registry()
    }

    /// Resolve `query` to its ranked candidates.
    ///
    /// Returns the cached set unless `force_refresh` is set or the cached set
    /// is empty. Resolution itself never fails; an empty set is a valid
    /// answer that callers turn into `NoCandidatesFound`.
    pub fn resolve(
        &self,
        query: &CapabilityQuery,
        force_refresh: bool,
    ) -> Result<Rc<CandidateSet>, CapabilityError> {
        if self.resolving.get() {
            return Err(CapabilityError::ReentrantResolve(query.id().to_string()));
        }

        if !force_refresh {
            if let Some(cached) = self.cached(query.id()) {
                if !cached.is_empty() {
                    debug!(query = %query.id(), candidates = cached.len(), "using cached candidates");
                    return Ok(cached);
                }
            }
        }

        self.resolving.set(true);
        let _guard = ResolvingGuard(&self.resolving);

        let set = Rc::new(self.build(query));
        info!(
            query = %query.id(),
            candidates = set.len(),
            forced = force_refresh,
            diagnostics = %set.diagnostics,
            "capability resolved"
        );
        self.cache
            .borrow_mut()
            .insert(query.id().clone(), Rc::clone(&set));
        Ok(set)
    }

    pub fn cached(&self, id: &QueryId) -> Option<Rc<CandidateSet>> {
        self.cache.borrow().get(id).cloned()
    }

    pub fn invalidate(&self, id: &QueryId) {
        self.cache.borrow_mut().remove(id);
    }

    pub fn clear(&self) {
        self.cache.borrow_mut().clear();
    }

    fn build(&self, query: &CapabilityQuery) -> CandidateSet {
        let scorer = Scorer::new(query);
        let mut diagnostics = ResolutionDiagnostics::default();
        let mut raw: Vec<Candidate> = Vec::new();

        let known = self.scanner.known_shape_hits(query);
        diagnostics.known_shape_hits = known.len();
        for hit in known {
            raw.push(direct_candidate(hit, &scorer));
        }
        if let Some(hit) = self.scanner.best_known_path_hit(query) {
            diagnostics.best_known_path_hit = true;
            raw.push(direct_candidate(hit, &scorer));
        }

        let (instantiated, seen) = self.scanner.instantiated_roots(query);
        diagnostics.instantiated_modules = seen;
        diagnostics.instantiated_matched = instantiated.len();
        for root in &instantiated {
            self.collect(root, &scorer, &mut raw, &mut diagnostics);
        }

        let (evaluated, pending) = self.scanner.evaluated_roots(query);
        diagnostics.pending_modules = pending.pending_modules;
        diagnostics.pending_with_hints = pending.with_hints;
        diagnostics.evaluation_failures = pending.evaluation_failures;
        diagnostics.evaluated = evaluated.len();
        for root in &evaluated {
            self.collect(root, &scorer, &mut raw, &mut diagnostics);
        }

        diagnostics.raw_candidates = raw.len();
        let candidates = rank(raw);
        diagnostics.unique_candidates = candidates.len();
        diagnostics.top = candidates
            .iter()
            .take(self.diagnostic_top_k)
            .map(Candidate::summary)
            .collect();

        CandidateSet::new(query.id().clone(), candidates, diagnostics)
    }

    /// Walk one root, recording every function edge with positive evidence.
    fn collect(
        &self,
        root: &ScanRoot,
        scorer: &Scorer<'_>,
        raw: &mut Vec<Candidate>,
        diagnostics: &mut ResolutionDiagnostics,
    ) {
        let stats = walk(
            &root.value,
            |node, key, child| {
                if let HostValue::Function(callable) = child {
                    if scorer.evidence(key, callable) > 0 {
                        raw.push(Candidate {
                            callable: callable.clone(),
                            context: node.clone(),
                            key: key.to_string(),
                            path: root.path.clone(),
                            score: scorer.score(key, callable, &root.path),
                        });
                    }
                }
                true
            },
            self.walk.max_nodes,
            self.walk.max_depth,
        );
        diagnostics.nodes_walked += stats.nodes_visited;
        if stats.truncated {
            diagnostics.truncated_walks += 1;
            debug!(root = %root.path, nodes = stats.nodes_visited, "walk truncated by node budget");
        }
    }
}

fn direct_candidate(hit: DirectHit, scorer: &Scorer<'_>) -> Candidate {
    let score = scorer.score(&hit.key, &hit.callable, &hit.path);
    Candidate {
        callable: hit.callable,
        context: hit.context,
        key: hit.key,
        path: hit.path,
        score,
    }
}

/// De-duplicate by callable identity and sort by score, descending.
///
/// A duplicate keeps the position of the first sighting and the metadata of
/// the highest-scoring one. The sort is stable, so ties keep discovery order.
pub fn rank(raw: Vec<Candidate>) -> Vec<Candidate> {
    let mut unique: IndexMap<usize, Candidate> = IndexMap::new();
    for candidate in raw {
        match unique.entry(candidate.identity()) {
            Entry::Occupied(mut slot) => {
                if candidate.score > slot.get().score {
                    slot.insert(candidate);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(candidate);
            }
        }
    }
    let mut ranked: Vec<Candidate> = unique.into_values().collect();
    ranked.sort_by(|a, b| b.score.cmp(&a.score));
    ranked
}
