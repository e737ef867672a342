//! Simulated hosts described in JSON
//!
//! A fixture lists modules (already evaluated, or lazy with factory source)
//! and named stores. Any JSON object carrying a `"$fn"` key becomes a host
//! function with a scripted behaviour:
//!
//! ```json
//! {
//!   "stores": { "uploads": [] },
//!   "modules": [
//!     { "id": 1, "exports": { "clearAll": { "$fn": "clearAll" },
//!                             "addFile": { "$fn": "addFile", "arity": 3,
//!                                          "behavior": { "append": "uploads" } } } },
//!     { "id": 2, "exports": { "getUploads": { "$fn": "getUploads", "arity": 2,
//!                                             "behavior": { "returns_store": "uploads" } },
//!                             "getUpload": { "$fn": "getUpload" } } },
//!     { "id": 3, "source": "function(e){e.uploadFiles=...}",
//!       "lazy_exports": { "uploadFiles": { "$fn": "uploadFiles", "arity": 2 } } }
//!   ]
//! }
//! ```

use crate::error::CapabilityError;
use crate::host::{ArrayRef, Completion, FunctionRef, HostError, HostResult, HostValue, ObjectRef};
use crate::registry::{InMemoryRegistry, ModuleId};
use serde::Deserialize;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;
use tokio::time::Instant;

const FUNCTION_MARKER: &str = "$fn";

#[derive(Debug, Clone, Deserialize)]
pub struct HostFixture {
    #[serde(default)]
    pub stores: BTreeMap<String, Vec<Value>>,
    #[serde(default)]
    pub modules: Vec<ModuleFixture>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModuleFixture {
    pub id: ModuleId,
    /// Exports of a module the host already evaluated.
    #[serde(default)]
    pub exports: Option<Value>,
    /// Factory source text of an unevaluated module.
    #[serde(default)]
    pub source: Option<String>,
    /// What evaluating the factory yields.
    #[serde(default)]
    pub lazy_exports: Option<Value>,
    /// Evaluating the factory throws this instead.
    #[serde(default)]
    pub factory_error: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Behavior {
    /// Return `true`.
    #[default]
    Accept,
    /// Throw synchronously.
    Throw,
    /// Return a pending value that rejects.
    RejectAsync,
    /// Return `{ ok: false }`.
    OkFalse,
    /// Push an entry built from the call's arguments into a store.
    Append(String),
    /// Return the store's backing array.
    ReturnsStore(String),
    /// Return this value, built once at load time.
    Returns(Value),
}

#[derive(Debug, Clone, Deserialize)]
struct FunctionFixture {
    #[serde(rename = "$fn")]
    name: String,
    #[serde(default)]
    arity: usize,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    behavior: Behavior,
    #[serde(default)]
    message: Option<String>,
    /// Delay before the behaviour takes effect; the call returns a pending
    /// value meanwhile.
    #[serde(default)]
    delay_ms: u64,
    /// Throw unless called with exactly this many arguments.
    #[serde(default)]
    expect_args: Option<usize>,
}

/// One call observed on a fixture function.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub function: String,
    pub arg_count: usize,
    pub at: Instant,
}

#[derive(Debug, Clone, Default)]
pub struct CallLog(Rc<RefCell<Vec<CallRecord>>>);

impl CallLog {
    fn record(&self, function: &str, arg_count: usize) {
        self.0.borrow_mut().push(CallRecord {
            function: function.to_string(),
            arg_count,
            at: Instant::now(),
        });
    }

    pub fn records(&self) -> Vec<CallRecord> {
        self.0.borrow().clone()
    }

    pub fn count(&self, function: &str) -> usize {
        self.0.borrow().iter().filter(|r| r.function == function).count()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }
}

/// A fixture turned into live host values.
pub struct LoadedFixture {
    pub registry: Rc<InMemoryRegistry>,
    pub stores: BTreeMap<String, ArrayRef>,
    pub calls: CallLog,
}

impl LoadedFixture {
    pub fn store(&self, name: &str) -> Option<&ArrayRef> {
        self.stores.get(name)
    }
}

#[derive(Debug, Clone)]
enum Effect {
    Accept,
    Throw(String),
    RejectAsync(String),
    OkFalse,
    Append(ArrayRef),
    ReturnsStore(ArrayRef),
    Returns(HostValue),
}

impl Effect {
    fn apply(&self, args: &[HostValue]) -> HostResult<HostValue> {
        match self {
            Effect::Accept => Ok(HostValue::Bool(true)),
            Effect::Throw(message) | Effect::RejectAsync(message) => Err(HostError::new(message.clone())),
            Effect::OkFalse => Ok(HostValue::object([("ok", false)])),
            Effect::Append(store) => {
                store.push(entry_from_args(args));
                Ok(HostValue::Undefined)
            }
            Effect::ReturnsStore(store) => Ok(HostValue::Array(store.clone())),
            Effect::Returns(value) => Ok(value.clone()),
        }
    }
}

/// Shallow merge of every object argument, including objects inside array
/// arguments.
fn entry_from_args(args: &[HostValue]) -> HostValue {
    let entry = ObjectRef::new();
    let absorb = |value: &HostValue| {
        if let HostValue::Object(object) = value {
            for (key, field) in object.entries() {
                entry.set(key, field);
            }
        }
    };
    for arg in args {
        match arg {
            HostValue::Array(items) => items.items().iter().for_each(&absorb),
            other => absorb(other),
        }
    }
    HostValue::Object(entry)
}

struct Builder<'a> {
    stores: &'a BTreeMap<String, ArrayRef>,
    calls: &'a CallLog,
}

impl Builder<'_> {
    fn value(&self, json: &Value) -> Result<HostValue, CapabilityError> {
        match json {
            Value::Object(map) if map.contains_key(FUNCTION_MARKER) => {
                let def: FunctionFixture = serde_json::from_value(json.clone())
                    .map_err(|e| CapabilityError::Fixture(e.to_string()))?;
                Ok(HostValue::Function(self.function(def)?))
            }
            Value::Object(map) => {
                let object = ObjectRef::new();
                for (key, field) in map {
                    object.set(key.clone(), self.value(field)?);
                }
                Ok(HostValue::Object(object))
            }
            Value::Array(items) => Ok(HostValue::array(
                items
                    .iter()
                    .map(|item| self.value(item))
                    .collect::<Result<Vec<_>, _>>()?,
            )),
            other => Ok(HostValue::from_json(other)),
        }
    }

    fn store(&self, name: &str) -> Result<ArrayRef, CapabilityError> {
        self.stores
            .get(name)
            .cloned()
            .ok_or_else(|| CapabilityError::Fixture(format!("unknown store '{}'", name)))
    }

    fn function(&self, def: FunctionFixture) -> Result<FunctionRef, CapabilityError> {
        let message = def
            .message
            .clone()
            .unwrap_or_else(|| format!("{} failed", def.name));
        let effect = match &def.behavior {
            Behavior::Accept => Effect::Accept,
            Behavior::Throw => Effect::Throw(message),
            Behavior::RejectAsync => Effect::RejectAsync(message),
            Behavior::OkFalse => Effect::OkFalse,
            Behavior::Append(store) => Effect::Append(self.store(store)?),
            Behavior::ReturnsStore(store) => Effect::ReturnsStore(self.store(store)?),
            Behavior::Returns(value) => Effect::Returns(self.value(value)?),
        };
        let delay = Duration::from_millis(def.delay_ms);
        let expect_args = def.expect_args;
        let calls = self.calls.clone();
        let name = def.name.clone();

        let body = move |_: &HostValue, args: &[HostValue]| -> HostResult<Completion> {
            calls.record(&name, args.len());
            if let Some(expected) = expect_args {
                if args.len() != expected {
                    return Err(HostError::new(format!(
                        "{} expects {} arguments, got {}",
                        name,
                        expected,
                        args.len()
                    )));
                }
            }
            match &effect {
                Effect::Throw(message) => Err(HostError::new(message.clone())),
                Effect::ReturnsStore(_) | Effect::Returns(_) => {
                    Ok(Completion::Ready(effect.apply(args)?))
                }
                _ if delay.is_zero() && !matches!(effect, Effect::RejectAsync(_)) => {
                    Ok(Completion::Ready(effect.apply(args)?))
                }
                _ => {
                    let effect = effect.clone();
                    let args = args.to_vec();
                    Ok(Completion::pending(async move {
                        tokio::time::sleep(delay).await;
                        effect.apply(&args)
                    }))
                }
            }
        };

        Ok(match def.source {
            Some(source) => FunctionRef::with_source(def.name, def.arity, source, body),
            None => FunctionRef::new(def.name, def.arity, body),
        })
    }
}

impl HostFixture {
    pub fn from_json_str(content: &str) -> Result<Self, CapabilityError> {
        serde_json::from_str(content).map_err(|e| CapabilityError::Fixture(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CapabilityError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CapabilityError::Fixture(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&content)
    }

    /// Build the registry, stores and call log.
    pub fn load(&self) -> Result<LoadedFixture, CapabilityError> {
        let calls = CallLog::default();
        let stores: BTreeMap<String, ArrayRef> = self
            .stores
            .iter()
            .map(|(name, entries)| {
                (
                    name.clone(),
                    ArrayRef::new(entries.iter().map(HostValue::from_json).collect()),
                )
            })
            .collect();
        let builder = Builder {
            stores: &stores,
            calls: &calls,
        };

        let mut registry = InMemoryRegistry::new();
        for module in &self.modules {
            match (&module.exports, &module.source) {
                (Some(exports), _) => {
                    registry.add_instantiated(module.id, builder.value(exports)?);
                }
                (None, Some(source)) => {
                    let outcome = match (&module.factory_error, &module.lazy_exports) {
                        (Some(message), _) => Err(HostError::new(message.clone())),
                        (None, Some(exports)) => Ok(builder.value(exports)?),
                        (None, None) => Ok(HostValue::Undefined),
                    };
                    registry.add_lazy(module.id, source.clone(), move || outcome.clone());
                }
                (None, None) => {
                    return Err(CapabilityError::Fixture(format!(
                        "module {} has neither exports nor source",
                        module.id
                    )))
                }
            }
        }

        Ok(LoadedFixture {
            registry: Rc::new(registry),
            stores,
            calls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModuleRegistry;

    const FIXTURE: &str = r#"{
        "stores": { "uploads": [{ "name": "old.png" }] },
        "modules": [
            { "id": 1, "exports": {
                "addFile": { "$fn": "addFile", "arity": 3, "expect_args": 3,
                             "behavior": { "append": "uploads" } },
                "clearAll": { "$fn": "clearAll" } } },
            { "id": 2, "source": "e.uploadFiles = function(){}",
              "lazy_exports": { "uploadFiles": { "$fn": "uploadFiles", "behavior": "throw", "message": "nope" } } },
            { "id": 3, "source": "upload", "factory_error": "factory threw" }
        ]
    }"#;

    #[test]
    fn test_load_builds_registry_and_stores() {
        let fixture = HostFixture::from_json_str(FIXTURE).unwrap().load().unwrap();
        assert_eq!(fixture.registry.module_ids(), vec![1, 2, 3]);
        assert!(fixture.registry.exports(2).is_none());
        assert!(fixture.registry.evaluate(3).is_err());

        let module = fixture.registry.exports(1).unwrap();
        let uploads = fixture.store("uploads").unwrap().clone();
        assert!(module.call_method("addFile", &[HostValue::from("c1")]).is_err());
        let file = HostValue::object([("name", "quote.png")]);
        module
            .call_method("addFile", &[HostValue::from("c1"), HostValue::Number(0.0), file])
            .unwrap();
        assert_eq!(uploads.len(), 2);
        assert_eq!(uploads.get(1).unwrap().get("name"), Some(HostValue::from("quote.png")));
        assert_eq!(fixture.calls.count("addFile"), 2);

        let lazy = fixture.registry.evaluate(2).unwrap();
        let err = lazy.call_method("uploadFiles", &[]).unwrap_err();
        assert_eq!(err.message, "nope");
    }

    #[test]
    fn test_unknown_store_is_rejected() {
        let fixture = HostFixture::from_json_str(
            r#"{ "modules": [ { "id": 1, "exports": { "f": { "$fn": "f", "behavior": { "append": "missing" } } } } ] }"#,
        )
        .unwrap();
        assert!(matches!(fixture.load(), Err(CapabilityError::Fixture(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_append_is_pending() {
        let fixture = HostFixture::from_json_str(
            r#"{ "stores": { "s": [] },
                 "modules": [ { "id": 1, "exports": {
                    "push": { "$fn": "push", "delay_ms": 300, "behavior": { "append": "s" } } } } ] }"#,
        )
        .unwrap()
        .load()
        .unwrap();
        let module = fixture.registry.exports(1).unwrap();
        let completion = module.call_method("push", &[HostValue::object([("a", 1.0)])]).unwrap();
        assert!(completion.is_pending());
        assert!(fixture.store("s").unwrap().is_empty());
        completion.settle().await.unwrap();
        assert_eq!(fixture.store("s").unwrap().len(), 1);
    }
}
