//! Registry scanning
//!
//! Produces the graph roots (and direct hits) that feed the walker + scorer
//! pipeline, cheapest and most reliable first:
//!
//! 1. known-shape probes through `find_by_props`, plus the best-known path;
//! 2. already-instantiated modules whose shallow keys match the query;
//! 3. unexecuted modules whose factory source mentions the query, ranked by
//!    hint density, of which only the top N are evaluated.
//!
//! Every lookup that fails or finds nothing is skipped, never fatal.

use crate::candidate::DiscoveryPath;
use crate::config::ScanConfig;
use crate::host::{FunctionRef, HostValue};
use crate::query::CapabilityQuery;
use crate::registry::{ModuleId, ModuleRegistry};
use std::cmp::Ordering;
use std::rc::Rc;
use tracing::debug;

/// Weight of a fragment or exact-name hit relative to a keyword hit.
const STRONG_HINT_WEIGHT: usize = 3;

/// A callable found by direct lookup, no walk needed.
#[derive(Debug, Clone)]
pub struct DirectHit {
    pub key: String,
    pub callable: FunctionRef,
    pub context: HostValue,
    pub path: DiscoveryPath,
}

/// A module to walk.
#[derive(Debug, Clone)]
pub struct ScanRoot {
    pub module: ModuleId,
    pub value: HostValue,
    pub path: DiscoveryPath,
}

/// Stage 3 ranking entry.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceHint {
    pub module: ModuleId,
    pub hits: usize,
    pub source_len: usize,
}

impl SourceHint {
    /// Weighted hits per KiB of source.
    pub fn density(&self) -> f64 {
        self.hits as f64 * 1024.0 / self.source_len.max(1) as f64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingScan {
    pub pending_modules: usize,
    pub with_hints: usize,
    pub evaluation_failures: usize,
}

pub struct RegistryScanner {
    registry: Rc<dyn ModuleRegistry>,
    config: ScanConfig,
}

impl RegistryScanner {
    pub fn new(registry: Rc<dyn ModuleRegistry>, config: ScanConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Rc<dyn ModuleRegistry> {
        &self.registry
    }

    /// Stage 1: hand-ordered known-shape probes.
    pub fn known_shape_hits(&self, query: &CapabilityQuery) -> Vec<DirectHit> {
        let mut hits = Vec::new();
        for (rank, shape) in query.known_shapes().iter().enumerate() {
            let props: Vec<&str> = shape.props.iter().map(String::as_str).collect();
            let module = match self.registry.find_by_props(&props) {
                Ok(Some(module)) => module,
                Ok(None) => continue,
                Err(e) => {
                    debug!(probe = %shape.label, error = %e, "known-shape probe failed");
                    continue;
                }
            };
            let Some(HostValue::Function(callable)) = module.get(&shape.member) else {
                continue;
            };
            hits.push(DirectHit {
                key: shape.member.clone(),
                callable,
                context: module,
                path: DiscoveryPath::KnownShape {
                    label: shape.label.clone(),
                    rank,
                },
            });
        }
        hits
    }

    /// Stage 1b: the query's best-known property path.
    pub fn best_known_path_hit(&self, query: &CapabilityQuery) -> Option<DirectHit> {
        let path = query.best_known_path()?;
        let anchor = path.anchor()?;
        let leaf = path.leaf()?;
        let module = match self.registry.find_by_props(&[anchor]) {
            Ok(Some(module)) => module,
            Ok(None) => return None,
            Err(e) => {
                debug!(path = %path, error = %e, "best-known path lookup failed");
                return None;
            }
        };
        // find_by_props may already have stepped into `default`
        let owner = module
            .get_path(path.parent())
            .or_else(|| module.get_path(strip_default(path.parent())))?;
        let callable = owner.get(leaf)?.as_function()?.clone();
        Some(DirectHit {
            key: leaf.to_string(),
            callable,
            context: owner,
            path: DiscoveryPath::BestKnownPath,
        })
    }

    /// Stage 2: instantiated modules passing the shallow key pre-filter.
    /// Returns the roots and the number of instantiated modules seen.
    pub fn instantiated_roots(&self, query: &CapabilityQuery) -> (Vec<ScanRoot>, usize) {
        let mut roots = Vec::new();
        let mut seen = 0;
        for id in self.registry.module_ids() {
            let Some(exports) = self.registry.exports(id) else {
                continue;
            };
            seen += 1;
            if shallow_match(&exports, query) {
                roots.push(ScanRoot {
                    module: id,
                    value: exports,
                    path: DiscoveryPath::Instantiated { module: id },
                });
            }
        }
        (roots, seen)
    }

    /// Stage 3 ranking: unexecuted modules with source hints, densest first.
    pub fn rank_pending(&self, query: &CapabilityQuery) -> (Vec<SourceHint>, usize) {
        let mut hints = Vec::new();
        let mut pending = 0;
        for id in self.registry.module_ids() {
            if self.registry.exports(id).is_some() {
                continue;
            }
            pending += 1;
            let Some(source) = self.registry.factory_source(id) else {
                continue;
            };
            let hits = count_hints(&source, query);
            if hits > 0 {
                hints.push(SourceHint {
                    module: id,
                    hits,
                    source_len: source.len(),
                });
            }
        }
        // stable: equal densities keep registry order
        hints.sort_by(|a, b| {
            b.density()
                .partial_cmp(&a.density())
                .unwrap_or(Ordering::Equal)
                .then(b.hits.cmp(&a.hits))
        });
        (hints, pending)
    }

    /// Stage 3: evaluate the top-N hinted modules.
    pub fn evaluated_roots(&self, query: &CapabilityQuery) -> (Vec<ScanRoot>, PendingScan) {
        let (hints, pending_modules) = self.rank_pending(query);
        let mut scan = PendingScan {
            pending_modules,
            with_hints: hints.len(),
            evaluation_failures: 0,
        };
        let mut roots = Vec::new();
        for hint in hints.into_iter().take(self.config.evaluate_top_n) {
            match self.registry.evaluate(hint.module) {
                Ok(value) if !value.is_nullish() => roots.push(ScanRoot {
                    module: hint.module,
                    value,
                    path: DiscoveryPath::Evaluated {
                        module: hint.module,
                    },
                }),
                Ok(_) => {}
                Err(e) => {
                    scan.evaluation_failures += 1;
                    debug!(module = hint.module, error = %e, "module evaluation failed");
                }
            }
        }
        (roots, scan)
    }
}

fn strip_default(path: &[String]) -> &[String] {
    match path.first() {
        Some(first) if first == "default" => &path[1..],
        _ => path,
    }
}

/// Does the module (or its `default` export) expose a matching key?
fn shallow_match(exports: &HostValue, query: &CapabilityQuery) -> bool {
    let default = exports.get("default");
    std::iter::once(exports.clone())
        .chain(default)
        .any(|v| v.keys().iter().any(|k| query.key_matches(k)))
}

/// Weighted hint count over unexecuted source text.
pub fn count_hints(source: &str, query: &CapabilityQuery) -> usize {
    let lower = source.to_lowercase();
    let keyword_hits: usize = query
        .keywords()
        .iter()
        .map(|kw| lower.matches(kw.as_str()).count())
        .sum();
    let fragment_hits: usize = query
        .source_fragments()
        .iter()
        .map(|f| source.matches(f.as_str()).count())
        .sum();
    let exact_hits = query
        .exact_name()
        .map(|name| source.matches(name).count())
        .unwrap_or(0);
    keyword_hits + STRONG_HINT_WEIGHT * (fragment_hits + exact_hits)
}
