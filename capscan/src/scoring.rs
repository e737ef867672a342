//! Candidate scoring
//!
//! Pure ranking of a discovered `(key, callable, path)` triple against a
//! query. Rules are additive and order-independent; the resolver breaks ties
//! by discovery order.

use crate::candidate::DiscoveryPath;
use crate::host::FunctionRef;
use crate::query::CapabilityQuery;

/// Key equals the query's canonical name.
pub const EXACT_NAME_BONUS: i64 = 100;
/// Per distinct query keyword found in the key.
pub const KEYWORD_BONUS: i64 = 15;
/// Printed source contains one of the query's literal fragments.
pub const SOURCE_FRAGMENT_BONUS: i64 = 60;
/// Arity within [`ARITY_RANGE`].
pub const ARITY_BONUS: i64 = 5;
pub const ARITY_RANGE: std::ops::RangeInclusive<usize> = 1..=5;
/// ALL_CAPS keys are constants, not actions.
pub const CONSTANT_PENALTY: i64 = 40;
/// Getter / config-looking keys without an action verb.
pub const READ_ONLY_PENALTY: i64 = 30;
/// Base boost for a known-shape probe hit, plus a per-rank step so hand
/// order is preserved among several hits.
pub const KNOWN_SHAPE_BONUS: i64 = 1000;
pub const KNOWN_SHAPE_RANK_STEP: i64 = 250;
const KNOWN_SHAPE_RANKED: usize = 4;
pub const BEST_KNOWN_PATH_BONUS: i64 = 400;

const READ_ONLY_PREFIXES: &[&str] = &["get", "is", "can", "has", "should"];
const READ_ONLY_SUFFIXES: &[&str] = &["config", "configs", "limit", "limits", "error", "errors"];
const ACTION_VERBS: &[&str] = &[
    "add", "attach", "create", "dispatch", "enqueue", "insert", "prompt", "push", "queue", "send",
    "start", "submit",
];

/// Split an identifier on `_`, `.`, `-`, whitespace and camelCase boundaries.
pub fn name_tokens(name: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for part in name.split(|c: char| c == '_' || c == '.' || c == '-' || c.is_whitespace()) {
        let mut current = String::new();
        let mut prev_was_lower = false;
        for c in part.chars() {
            if c.is_uppercase() && prev_was_lower && !current.is_empty() {
                tokens.push(current.to_lowercase());
                current.clear();
            }
            current.push(c);
            prev_was_lower = c.is_lowercase() || c.is_ascii_digit();
        }
        if !current.is_empty() {
            tokens.push(current.to_lowercase());
        }
    }
    tokens
}

/// `UPLOAD_LIMIT`, `MAX`: letters present and none lowercase.
pub fn is_constant_like(key: &str) -> bool {
    key.chars().any(|c| c.is_alphabetic()) && !key.chars().any(|c| c.is_lowercase())
}

/// `getUploads`, `uploadConfigLimit`, `isUploading` without an action verb.
pub fn is_read_only_like(key: &str) -> bool {
    let tokens = name_tokens(key);
    let (Some(first), Some(last)) = (tokens.first(), tokens.last()) else {
        return false;
    };
    let looks_read_only = READ_ONLY_PREFIXES.contains(&first.as_str())
        || READ_ONLY_SUFFIXES.contains(&last.as_str());
    looks_read_only && !tokens.iter().any(|t| ACTION_VERBS.contains(&t.as_str()))
}

/// Ranks candidates for one query.
pub struct Scorer<'q> {
    query: &'q CapabilityQuery,
}

impl<'q> Scorer<'q> {
    pub fn new(query: &'q CapabilityQuery) -> Self {
        Self { query }
    }

    pub fn score(&self, key: &str, callable: &FunctionRef, path: &DiscoveryPath) -> i64 {
        let mut score = self.evidence(key, callable);

        if ARITY_RANGE.contains(&callable.arity()) {
            score += ARITY_BONUS;
        }
        if is_constant_like(key) {
            score -= CONSTANT_PENALTY;
        }
        if is_read_only_like(key) {
            score -= READ_ONLY_PENALTY;
        }

        score + path_bonus(path)
    }

    /// Positive evidence only: name, keyword and source matches.
    ///
    /// Zero means nothing ties the callable to the query, which the resolver
    /// uses to keep unrelated functions out of the candidate set.
    pub fn evidence(&self, key: &str, callable: &FunctionRef) -> i64 {
        let mut score = 0;

        if let Some(exact) = self.query.exact_name() {
            if key == exact || callable.name() == exact {
                score += EXACT_NAME_BONUS;
            }
        }

        let lower = key.to_lowercase();
        let matched = self
            .query
            .keywords()
            .iter()
            .filter(|kw| lower.contains(kw.as_str()))
            .count() as i64;
        score += matched * KEYWORD_BONUS;

        let source = callable.source();
        if self
            .query
            .source_fragments()
            .iter()
            .any(|fragment| source.contains(fragment.as_str()))
        {
            score += SOURCE_FRAGMENT_BONUS;
        }

        score
    }
}

fn path_bonus(path: &DiscoveryPath) -> i64 {
    match path {
        DiscoveryPath::KnownShape { rank, .. } => {
            let steps = KNOWN_SHAPE_RANKED.saturating_sub((*rank).min(KNOWN_SHAPE_RANKED)) as i64;
            KNOWN_SHAPE_BONUS + KNOWN_SHAPE_RANK_STEP * steps
        }
        DiscoveryPath::BestKnownPath => BEST_KNOWN_PATH_BONUS,
        DiscoveryPath::Instantiated { .. } | DiscoveryPath::Evaluated { .. } => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{Completion, HostValue};

    fn func(name: &str, arity: usize, source: &str) -> FunctionRef {
        FunctionRef::with_source(name, arity, source, |_, _| {
            Ok(Completion::ready(HostValue::Undefined))
        })
    }

    fn query() -> CapabilityQuery {
        CapabilityQuery::builder("file-queue")
            .keywords(["upload", "prompt", "attach", "file"])
            .exact_name("promptToUpload")
            .source_fragment("uploadFiles")
            .build()
    }

    const WALK: DiscoveryPath = DiscoveryPath::Instantiated { module: 1 };

    #[test]
    fn test_name_tokens() {
        assert_eq!(name_tokens("uploadConfigLimit"), vec!["upload", "config", "limit"]);
        assert_eq!(name_tokens("UPLOAD_LIMIT"), vec!["upload", "limit"]);
        assert_eq!(name_tokens("promptToUpload"), vec!["prompt", "to", "upload"]);
    }

    #[test]
    fn test_exact_name_dominates_keywords() {
        let q = query();
        let scorer = Scorer::new(&q);
        let exact = scorer.score("promptToUpload", &func("promptToUpload", 3, ""), &WALK);
        let partial = scorer.score("uploadAttachFile", &func("", 3, ""), &WALK);
        assert!(exact > partial, "{} <= {}", exact, partial);
    }

    #[test]
    fn test_source_fragment_beats_naming() {
        let q = query();
        let scorer = Scorer::new(&q);
        let by_source = scorer.score("a", &func("a", 2, "function a(e){uploadFiles(e)}"), &WALK);
        let by_name = scorer.score("fileUpload", &func("fileUpload", 2, ""), &WALK);
        assert!(by_source > by_name);
    }

    #[test]
    fn test_penalties() {
        let q = query();
        let scorer = Scorer::new(&q);
        let constant = scorer.score("UPLOAD_FILE", &func("", 1, ""), &WALK);
        let getter = scorer.score("getUploads", &func("getUploads", 1, ""), &WALK);
        let action = scorer.score("addUploads", &func("addUploads", 1, ""), &WALK);
        assert!(constant < action);
        assert!(getter < action);
        assert!(!is_read_only_like("promptToUpload"));
        assert!(is_read_only_like("uploadConfigLimit"));
        assert!(is_constant_like("MAX_FILES"));
    }

    #[test]
    fn test_arity_bonus_bounds() {
        let q = query();
        let scorer = Scorer::new(&q);
        let zero = scorer.score("upload", &func("upload", 0, ""), &WALK);
        let three = scorer.score("upload", &func("upload", 3, ""), &WALK);
        let six = scorer.score("upload", &func("upload", 6, ""), &WALK);
        assert_eq!(three - zero, ARITY_BONUS);
        assert_eq!(zero, six);
    }

    #[test]
    fn test_known_shape_rank_is_ordered() {
        let q = query();
        let scorer = Scorer::new(&q);
        let f = func("x", 1, "");
        let first = scorer.score("x", &f, &DiscoveryPath::KnownShape { label: "a".into(), rank: 0 });
        let second = scorer.score("x", &f, &DiscoveryPath::KnownShape { label: "b".into(), rank: 1 });
        let path = scorer.score("x", &f, &DiscoveryPath::BestKnownPath);
        assert!(first > second && second > path);
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let q = query();
        let scorer = Scorer::new(&q);
        let f = func("promptToUpload", 3, "uploadFiles");
        assert_eq!(
            scorer.score("promptToUpload", &f, &WALK),
            scorer.score("promptToUpload", &f, &WALK)
        );
    }
}
