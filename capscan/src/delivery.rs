//! Message-send preset
//!
//! After a file is queued, an empty message is sent to the destination so the
//! pending attachment goes out with it. The send is confirmed by waiting for
//! a message carrying our nonce in the host's message store.

use crate::host::{Completion, HostError, HostValue};
use crate::probe::{ConfirmationStore, PollPolicy, StoreProbe};
use crate::query::{CallShape, CapabilityQuery, Destination, DomainArgs, KnownShape};
use crate::registry::ModuleRegistry;
use tracing::debug;

pub const SEND_MESSAGE_QUERY: &str = "send-message";

/// Empty message body; the queued attachment is the content.
pub fn message_content() -> HostValue {
    HostValue::object([
        ("content", HostValue::from("")),
        ("tts", HostValue::Bool(false)),
        ("invalidEmojis", HostValue::array(vec![])),
        ("validNonShortcutEmojis", HostValue::array(vec![])),
    ])
}

/// Millisecond timestamp, matched against the `nonce` of stored messages.
pub fn new_nonce() -> String {
    chrono::Utc::now().timestamp_millis().to_string()
}

/// Arguments for one send: content as payload, `{nonce}` as options.
pub fn send_args(destination: Destination, nonce: &str) -> DomainArgs {
    DomainArgs::new(message_content(), destination, 0)
        .with_options(HostValue::object([("nonce", nonce)]))
}

/// A returned object with `ok == false` is a soft failure.
pub fn reject_not_ok(value: &HostValue) -> Result<(), HostError> {
    match value.get("ok") {
        Some(HostValue::Bool(false)) if value.as_object().is_some() => {
            Err(HostError::new("sendMessage returned ok=false"))
        }
        _ => Ok(()),
    }
}

pub fn send_message_query() -> CapabilityQuery {
    CapabilityQuery::builder(SEND_MESSAGE_QUERY)
        .keyword("send")
        .exact_name("sendMessage")
        .known_shape(KnownShape::new("send-edit", ["sendMessage", "editMessage"], "sendMessage"))
        .known_shape(KnownShape::new(
            "send-receive",
            ["sendMessage", "receiveMessage"],
            "sendMessage",
        ))
        .known_shape(KnownShape::new("send", ["sendMessage"], "sendMessage"))
        .call_shape(
            CallShape::new("send(id, content, undefined, options)", |a, _| {
                vec![
                    a.destination.id_value(),
                    a.payload.clone(),
                    HostValue::Undefined,
                    a.options.clone(),
                ]
            })
            .only_for_keys_containing("send")
            .with_result_check(reject_not_ok),
        )
        .call_shape(
            CallShape::new("send(id, content, false, options)", |a, _| {
                vec![
                    a.destination.id_value(),
                    a.payload.clone(),
                    HostValue::Bool(false),
                    a.options.clone(),
                ]
            })
            .only_for_keys_containing("send")
            .with_result_check(reject_not_ok),
        )
        .build()
}

/// The host's message store.
#[derive(Debug, Clone)]
pub struct MessageStore {
    store: HostValue,
}

impl MessageStore {
    pub fn new(store: HostValue) -> Self {
        Self { store }
    }

    pub fn find(registry: &dyn ModuleRegistry) -> Option<Self> {
        registry
            .find_by_store_name("MessageStore")
            .ok()
            .flatten()
            .filter(|store| store.has_function("getMessages"))
            .or_else(|| registry.find_by_props(&["getMessages", "getMessage"]).ok().flatten())
            .map(Self::new)
    }
}

fn ready(result: Result<Completion, HostError>) -> Option<HostValue> {
    match result {
        Ok(Completion::Ready(value)) => Some(value),
        _ => None,
    }
}

/// Items of a message collection: an array, `_array`, `toArray()` or
/// `values()`.
pub fn collection_items(messages: &HostValue) -> Vec<HostValue> {
    if let Some(items) = messages.as_array() {
        return items.items();
    }
    if let Some(HostValue::Array(items)) = messages.get("_array") {
        return items.items();
    }
    for method in ["toArray", "values"] {
        if messages.has_function(method) {
            if let Some(HostValue::Array(items)) = ready(messages.call_method(method, &[])) {
                return items.items();
            }
        }
    }
    Vec::new()
}

impl ConfirmationStore for MessageStore {
    fn entries(&self, destination: &Destination) -> Vec<HostValue> {
        match self.store.call_method("getMessages", &[destination.id_value()]) {
            Ok(Completion::Ready(messages)) if !messages.is_nullish() => collection_items(&messages),
            Ok(_) => Vec::new(),
            Err(e) => {
                debug!(destination = %destination.id, error = %e, "getMessages threw");
                Vec::new()
            }
        }
    }
}

pub fn carries_nonce(message: &HostValue, nonce: &str) -> bool {
    match message.get("nonce") {
        Some(HostValue::Str(s)) => s == nonce,
        Some(n @ HostValue::Number(_)) => n.to_string() == nonce,
        _ => false,
    }
}

/// Probe confirming a message with `nonce` reached the destination.
pub fn nonce_probe(
    store: MessageStore,
    destination: Destination,
    nonce: &str,
    policy: PollPolicy,
) -> StoreProbe<MessageStore> {
    let nonce = nonce.to_string();
    StoreProbe::new(store, destination, policy, move |message| carries_nonce(message, &nonce))
}
