use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use capscan::candidate::DiscoveryPath;
use capscan::{
    CapabilityError, CapabilityQuery, CapscanConfig, Completion, FunctionRef, HostError, HostValue,
    InMemoryRegistry, KnownShape, ModuleRegistry, Resolver,
};
use pretty_assertions::assert_eq;

fn func(name: &str, arity: usize) -> FunctionRef {
    FunctionRef::new(name, arity, |_, _| Ok(Completion::ready(true)))
}

fn upload_query() -> CapabilityQuery {
    CapabilityQuery::builder("file-queue")
        .keywords(["upload", "attach"])
        .exact_name("addFile")
        .known_shape(KnownShape::new("add-file", ["clearAll", "addFile"], "addFile"))
        .build()
}

#[test]
fn test_known_shape_hit_ranks_first() {
    let mut registry = InMemoryRegistry::new();
    registry.add_instantiated(
        1,
        HostValue::object([
            ("uploadAttachment", HostValue::from(func("uploadAttachment", 2))),
            ("attachUpload", HostValue::from(func("attachUpload", 2))),
        ]),
    );
    registry.add_instantiated(
        2,
        HostValue::object([
            ("clearAll", HostValue::from(func("clearAll", 0))),
            ("addFile", HostValue::from(func("queue", 1))),
        ]),
    );
    let resolver = Resolver::new(Rc::new(registry), &CapscanConfig::default());

    let set = resolver.resolve(&upload_query(), false).unwrap();
    let first = set.first().unwrap();
    assert_eq!(first.key, "addFile");
    assert!(matches!(first.path, DiscoveryPath::KnownShape { rank: 0, .. }));
    assert_eq!(set.diagnostics.known_shape_hits, 1);
    assert_eq!(set.len(), 3);
}

#[test]
fn test_candidates_are_unique_by_callable() {
    let shared = func("uploadFile", 2);
    let nested = HostValue::object([("inner", HostValue::object([("uploadFile", HostValue::from(shared.clone()))]))]);
    let mut registry = InMemoryRegistry::new();
    registry.add_instantiated(1, HostValue::object([("uploadFile", HostValue::from(shared.clone()))]));
    registry.add_instantiated(
        2,
        HostValue::object([("upload", nested.clone()), ("default", nested)]),
    );
    let resolver = Resolver::new(Rc::new(registry), &CapscanConfig::default());

    let set = resolver.resolve(&upload_query(), false).unwrap();
    let identities: HashSet<usize> = set.iter().map(|c| c.identity()).collect();
    assert_eq!(identities.len(), set.len());
    assert_eq!(set.len(), 1);
    assert!(set.diagnostics.raw_candidates > 1);
    assert!(set.first().unwrap().callable.ptr_eq(&shared));
}

#[test]
fn test_cache_identity_and_deterministic_rebuild() {
    let mut registry = InMemoryRegistry::new();
    registry.add_instantiated(
        1,
        HostValue::object([
            ("uploadA", HostValue::from(func("uploadA", 1))),
            ("uploadB", HostValue::from(func("uploadB", 1))),
            ("attachC", HostValue::from(func("attachC", 6))),
        ]),
    );
    let resolver = Resolver::new(Rc::new(registry), &CapscanConfig::default());
    let query = upload_query();

    let first = resolver.resolve(&query, false).unwrap();
    let again = resolver.resolve(&query, false).unwrap();
    assert!(Rc::ptr_eq(&first, &again));

    let forced = resolver.resolve(&query, true).unwrap();
    assert!(!Rc::ptr_eq(&first, &forced));
    let summary = |set: &capscan::CandidateSet| -> Vec<(String, i64)> {
        set.iter().map(|c| (c.key.clone(), c.score)).collect()
    };
    assert_eq!(summary(&first), summary(&forced));
    // equal scores keep discovery order
    assert_eq!(summary(&first)[0].0, "uploadA");
    assert_eq!(summary(&first)[1].0, "uploadB");
}

#[test]
fn test_action_outranks_numeric_config_constant() {
    let mut registry = InMemoryRegistry::new();
    registry.add_instantiated(1, HostValue::object([("addFile", HostValue::from(func("addFile", 3)))]));
    registry.add_instantiated(2, HostValue::object([("uploadConfigLimit", HostValue::Number(5.0))]));
    let query = CapabilityQuery::builder("file-queue")
        .keywords(["upload", "attach"])
        .exact_name("addFile")
        .build();
    let resolver = Resolver::new(Rc::new(registry), &CapscanConfig::default());

    let set = resolver.resolve(&query, false).unwrap();
    let keys: Vec<&str> = set.iter().map(|c| c.key.as_str()).collect();
    assert_eq!(keys, vec!["addFile"]);
    assert_eq!(set.diagnostics.instantiated_matched, 2);
}

#[test]
fn test_config_getter_ranks_below_action() {
    let mut registry = InMemoryRegistry::new();
    registry.add_instantiated(2, HostValue::object([("uploadConfigLimit", HostValue::from(func("uploadConfigLimit", 0)))]));
    registry.add_instantiated(1, HostValue::object([("addFile", HostValue::from(func("addFile", 3)))]));
    let query = CapabilityQuery::builder("file-queue")
        .keywords(["upload", "attach"])
        .exact_name("addFile")
        .build();
    let resolver = Resolver::new(Rc::new(registry), &CapscanConfig::default());

    let set = resolver.resolve(&query, false).unwrap();
    let keys: Vec<&str> = set.iter().map(|c| c.key.as_str()).collect();
    assert_eq!(keys, vec!["addFile", "uploadConfigLimit"]);
    assert!(set.as_slice()[1].score < 0);
}

#[test]
fn test_lazy_modules_evaluated_by_hint_density() {
    let registry = Rc::new({
        let mut registry = InMemoryRegistry::new();
        registry.add_lazy(1, "function(e){e.render=function(){}}", || {
            Ok(HostValue::object([("render", HostValue::from(func("render", 1)))]))
        });
        registry.add_lazy(2, "function(e){e.uploadFile=function(n,t){}}", || {
            Ok(HostValue::object([("uploadFile", HostValue::from(func("uploadFile", 2)))]))
        });
        registry.add_lazy(3, "function(e){e.attach=upload}", || Err(HostError::new("boom")));
        registry
    });
    let mut config = CapscanConfig::default();
    config.scan.evaluate_top_n = 2;
    let resolver = Resolver::new(registry.clone(), &config);

    let set = resolver.resolve(&upload_query(), false).unwrap();
    assert_eq!(set.len(), 1);
    assert_eq!(set.first().unwrap().path, DiscoveryPath::Evaluated { module: 2 });
    assert_eq!(registry.evaluation_count(1), 0);
    assert_eq!(registry.evaluation_count(2), 1);
    assert_eq!(set.diagnostics.evaluation_failures, 1);

    // evaluated modules count as instantiated on the next pass
    let again = resolver.resolve(&upload_query(), true).unwrap();
    assert_eq!(again.first().unwrap().path, DiscoveryPath::Instantiated { module: 2 });
    assert_eq!(registry.evaluation_count(2), 1);
    assert!(registry.exports(1).is_none());
}

#[test]
fn test_walk_budget_is_reported() {
    let root = capscan::ObjectRef::new();
    let mut current = root.clone();
    for i in 0..50 {
        let next = capscan::ObjectRef::new();
        current.set(format!("upload{}", i), next.clone());
        current = next;
    }
    current.set("uploadDeep", func("uploadDeep", 1));
    let mut registry = InMemoryRegistry::new();
    registry.add_instantiated(1, HostValue::Object(root));
    let mut config = CapscanConfig::default();
    config.walk.max_nodes = 10;
    config.walk.max_depth = 100;
    let resolver = Resolver::new(Rc::new(registry), &config);

    let set = resolver.resolve(&upload_query(), false).unwrap();
    assert!(set.is_empty());
    assert_eq!(set.diagnostics.truncated_walks, 1);
    assert_eq!(set.diagnostics.nodes_walked, 10);
}

#[test]
fn test_resolve_from_module_evaluation_is_rejected() {
    let slot: Rc<RefCell<Option<Rc<Resolver>>>> = Rc::new(RefCell::new(None));
    let observed: Rc<RefCell<Option<CapabilityError>>> = Rc::new(RefCell::new(None));
    let registry = Rc::new({
        let mut registry = InMemoryRegistry::new();
        let (slot, observed) = (slot.clone(), observed.clone());
        registry.add_lazy(1, "function(e){e.uploadFile=function(n){}}", move || {
            if let Some(resolver) = slot.borrow().as_ref() {
                *observed.borrow_mut() = resolver.resolve(&upload_query(), true).err();
            }
            Ok(HostValue::object([("uploadFile", HostValue::from(func("uploadFile", 1)))]))
        });
        registry
    });
    let resolver = Rc::new(Resolver::new(registry, &CapscanConfig::default()));
    *slot.borrow_mut() = Some(resolver.clone());

    let set = resolver.resolve(&upload_query(), false).unwrap();
    assert_eq!(set.first().unwrap().key, "uploadFile");
    assert!(matches!(
        observed.borrow().as_ref(),
        Some(CapabilityError::ReentrantResolve(id)) if id == "file-queue"
    ));

    // the guard is released once the outer call returns
    assert!(resolver.resolve(&upload_query(), true).is_ok());
    slot.borrow_mut().take();
}
