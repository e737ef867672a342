//! Bounded breadth-first traversal of the host graph
//!
//! The walk is synchronous and holds the (single) host thread while it runs,
//! so both the node count and the depth are hard-capped.

use crate::host::HostValue;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WalkStats {
    pub nodes_visited: usize,
    pub edges_visited: usize,
    /// The node budget ran out before the worklist drained.
    pub truncated: bool,
}

/// Walk `root` breadth-first.
///
/// `visit(node, key, child)` is called once per edge of every expanded node
/// and returns whether `child` should be expanded too. Only reference values
/// are expanded, each at most once (identity-keyed), and never deeper than
/// `max_depth` edges from the root.
pub fn walk<F>(root: &HostValue, mut visit: F, max_nodes: usize, max_depth: usize) -> WalkStats
where
    F: FnMut(&HostValue, &str, &HostValue) -> bool,
{
    let mut stats = WalkStats {
        nodes_visited: 0,
        edges_visited: 0,
        truncated: false,
    };
    let Some(root_id) = root.identity() else {
        return stats;
    };

    let mut seen: HashSet<usize> = HashSet::new();
    seen.insert(root_id);
    let mut worklist: VecDeque<(HostValue, usize)> = VecDeque::new();
    worklist.push_back((root.clone(), 0));

    while let Some((node, depth)) = worklist.pop_front() {
        if stats.nodes_visited >= max_nodes {
            stats.truncated = true;
            break;
        }
        stats.nodes_visited += 1;

        for (key, child) in node.entries() {
            stats.edges_visited += 1;
            let descend = visit(&node, &key, &child);
            if !descend || depth >= max_depth {
                continue;
            }
            if let Some(id) = child.identity() {
                if seen.insert(id) {
                    worklist.push_back((child, depth + 1));
                }
            }
        }
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{Completion, FunctionRef, ObjectRef};

    fn chain(len: usize) -> HostValue {
        let root = ObjectRef::new();
        let mut current = root.clone();
        for i in 0..len {
            let next = ObjectRef::new();
            current.set(format!("n{}", i), next.clone());
            current = next;
        }
        HostValue::Object(root)
    }

    #[test]
    fn test_cycles_are_expanded_once() {
        let a = ObjectRef::new();
        let b = ObjectRef::new();
        a.set("b", b.clone());
        b.set("a", a.clone());
        b.set("self", b.clone());

        let mut edges = Vec::new();
        let stats = walk(
            &HostValue::Object(a),
            |_, key, _| {
                edges.push(key.to_string());
                true
            },
            100,
            10,
        );
        assert_eq!(stats.nodes_visited, 2);
        assert_eq!(edges, vec!["b", "a", "self"]);
        assert!(!stats.truncated);
    }

    #[test]
    fn test_depth_cap() {
        let mut keys = Vec::new();
        walk(
            &chain(10),
            |_, key, _| {
                keys.push(key.to_string());
                true
            },
            100,
            2,
        );
        // root (depth 0) -> n0 (1) -> n1 (2); n2 is seen but not expanded
        assert_eq!(keys, vec!["n0", "n1", "n2"]);
    }

    #[test]
    fn test_node_budget_truncates() {
        let stats = walk(&chain(50), |_, _, _| true, 5, 100);
        assert_eq!(stats.nodes_visited, 5);
        assert!(stats.truncated);
    }

    #[test]
    fn test_visit_can_refuse_descent() {
        let inner = HostValue::object([(
            "deep",
            HostValue::from(FunctionRef::new("deep", 0, |_, _| {
                Ok(Completion::ready(HostValue::Undefined))
            })),
        )]);
        let root = HostValue::object([("skip", inner)]);
        let mut seen = 0;
        walk(
            &root,
            |_, _, _| {
                seen += 1;
                false
            },
            100,
            10,
        );
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_primitive_root_is_a_no_op() {
        let stats = walk(&HostValue::Number(5.0), |_, _, _| true, 10, 10);
        assert_eq!(stats.nodes_visited, 0);
    }
}
