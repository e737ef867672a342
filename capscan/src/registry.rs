//! Host module registry
//!
//! The host keeps an enumerable collection of modules. Some have already been
//! evaluated and expose their exports; the rest are unexecuted factories whose
//! source text can be read without running them.

use crate::host::{Completion, HostError, HostResult, HostValue};
use indexmap::IndexMap;
use std::cell::{Cell, RefCell};

pub type ModuleId = u32;

/// Read access to the host's module registry.
pub trait ModuleRegistry {
    /// All known module ids, in registry order.
    fn module_ids(&self) -> Vec<ModuleId>;

    /// Exports of an already-evaluated module, `None` if never evaluated.
    fn exports(&self, id: ModuleId) -> Option<HostValue>;

    /// Printable source of the module factory. Reading it never runs it.
    fn factory_source(&self, id: ModuleId) -> Option<String>;

    /// Evaluate a module on demand. May have side effects on the host.
    fn evaluate(&self, id: ModuleId) -> HostResult<HostValue>;

    /// First evaluated module (or its `default` export) exposing every prop.
    fn find_by_props(&self, props: &[&str]) -> HostResult<Option<HostValue>> {
        if props.is_empty() {
            return Ok(None);
        }
        for id in self.module_ids() {
            let Some(exports) = self.exports(id) else {
                continue;
            };
            let default = exports.get("default");
            for candidate in std::iter::once(exports).chain(default) {
                if exposes_all(&candidate, props) {
                    return Ok(Some(candidate));
                }
            }
        }
        Ok(None)
    }

    /// First evaluated store (or `default` export) whose `getName()` returns
    /// `name`.
    fn find_by_store_name(&self, name: &str) -> HostResult<Option<HostValue>> {
        for id in self.module_ids() {
            let Some(exports) = self.exports(id) else {
                continue;
            };
            let default = exports.get("default");
            for candidate in std::iter::once(exports).chain(default) {
                if store_name(&candidate).as_deref() == Some(name) {
                    return Ok(Some(candidate));
                }
            }
        }
        Ok(None)
    }
}

fn store_name(value: &HostValue) -> Option<String> {
    if !value.has_function("getName") {
        return None;
    }
    match value.call_method("getName", &[]) {
        Ok(Completion::Ready(HostValue::Str(name))) => Some(name),
        _ => None,
    }
}

fn exposes_all(value: &HostValue, props: &[&str]) -> bool {
    if !matches!(value, HostValue::Object(_) | HostValue::Function(_)) {
        return false;
    }
    props
        .iter()
        .all(|p| value.get(p).map(|v| !v.is_nullish()).unwrap_or(false))
}

type Factory = Box<dyn Fn() -> HostResult<HostValue>>;

struct ModuleRecord {
    source: String,
    factory: Option<Factory>,
    exports: RefCell<Option<HostValue>>,
    evaluations: Cell<usize>,
}

/// Registry backed by in-process records. Used by fixtures and tests.
#[derive(Default)]
pub struct InMemoryRegistry {
    modules: IndexMap<ModuleId, ModuleRecord>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module that the host has already evaluated.
    pub fn add_instantiated(&mut self, id: ModuleId, exports: HostValue) -> &mut Self {
        self.modules.insert(
            id,
            ModuleRecord {
                source: String::new(),
                factory: None,
                exports: RefCell::new(Some(exports)),
                evaluations: Cell::new(0),
            },
        );
        self
    }

    /// Register a module that only runs when evaluated.
    pub fn add_lazy<F>(&mut self, id: ModuleId, source: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> HostResult<HostValue> + 'static,
    {
        self.modules.insert(
            id,
            ModuleRecord {
                source: source.into(),
                factory: Some(Box::new(factory)),
                exports: RefCell::new(None),
                evaluations: Cell::new(0),
            },
        );
        self
    }

    /// Number of times a module factory actually ran.
    pub fn evaluation_count(&self, id: ModuleId) -> usize {
        self.modules
            .get(&id)
            .map(|m| m.evaluations.get())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl ModuleRegistry for InMemoryRegistry {
    fn module_ids(&self) -> Vec<ModuleId> {
        self.modules.keys().copied().collect()
    }

    fn exports(&self, id: ModuleId) -> Option<HostValue> {
        self.modules.get(&id)?.exports.borrow().clone()
    }

    fn factory_source(&self, id: ModuleId) -> Option<String> {
        let record = self.modules.get(&id)?;
        if record.source.is_empty() {
            None
        } else {
            Some(record.source.clone())
        }
    }

    fn evaluate(&self, id: ModuleId) -> HostResult<HostValue> {
        let record = self
            .modules
            .get(&id)
            .ok_or_else(|| HostError::new(format!("module {} not found", id)))?;
        if let Some(exports) = record.exports.borrow().clone() {
            return Ok(exports);
        }
        let factory = record
            .factory
            .as_ref()
            .ok_or_else(|| HostError::new(format!("module {} has no factory", id)))?;
        record.evaluations.set(record.evaluations.get() + 1);
        let exports = factory()?;
        *record.exports.borrow_mut() = Some(exports.clone());
        Ok(exports)
    }
}
