//! Capability queries and call shapes
//!
//! A [`CapabilityQuery`] describes *what* the caller needs (name hints, source
//! fragments, known module shapes) and carries the ordered list of
//! [`CallShape`]s used to guess *how* a matching callable wants its arguments.

use crate::host::{FunctionRef, HostResult, HostValue};
use std::fmt;
use std::rc::Rc;

/// Stable identity of a query; used as the candidate cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(String);

impl QueryId {
    pub fn new(id: impl Into<String>) -> Self {
        QueryId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A dotted property path such as `default.promptToUpload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyPath(Vec<String>);

impl PropertyPath {
    pub fn new<S: Into<String>>(segments: impl IntoIterator<Item = S>) -> Self {
        PropertyPath(segments.into_iter().map(Into::into).collect())
    }

    pub fn parse(dotted: &str) -> Self {
        PropertyPath(
            dotted
                .split('.')
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
        )
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Segment a module must expose for the path to apply to it.
    pub fn anchor(&self) -> Option<&str> {
        self.0
            .iter()
            .find(|s| s.as_str() != "default")
            .map(String::as_str)
    }

    /// Final key, i.e. the callable's property name.
    pub fn leaf(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// Path to the owning object of the leaf.
    pub fn parent(&self) -> &[String] {
        match self.0.split_last() {
            Some((_, rest)) => rest,
            None => &[],
        }
    }
}

impl fmt::Display for PropertyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// A previously observed module shape: a module exposing all of `props`
/// tends to carry the capability under `member`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownShape {
    pub label: String,
    pub props: Vec<String>,
    pub member: String,
}

impl KnownShape {
    pub fn new<S: Into<String>>(
        label: impl Into<String>,
        props: impl IntoIterator<Item = S>,
        member: impl Into<String>,
    ) -> Self {
        Self {
            label: label.into(),
            props: props.into_iter().map(Into::into).collect(),
            member: member.into(),
        }
    }
}

/// Where a capability call should land.
#[derive(Debug, Clone, PartialEq)]
pub struct Destination {
    /// Raw identifier, always available.
    pub id: String,
    /// Host object resolved for `id`, when the host could provide one.
    pub resolved: Option<HostValue>,
}

impl Destination {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resolved: None,
        }
    }

    pub fn with_resolved(mut self, resolved: HostValue) -> Self {
        if !resolved.is_nullish() {
            self.resolved = Some(resolved);
        }
        self
    }

    pub fn id_value(&self) -> HostValue {
        HostValue::Str(self.id.clone())
    }

    /// Resolved object if known, otherwise the identifier.
    pub fn value(&self) -> HostValue {
        self.resolved.clone().unwrap_or_else(|| self.id_value())
    }
}

/// Domain arguments handed unchanged to every call shape.
#[derive(Debug, Clone)]
pub struct DomainArgs {
    pub payload: HostValue,
    pub destination: Destination,
    pub type_tag: i64,
    /// Extra options record (e.g. a nonce), `undefined` when unused.
    pub options: HostValue,
}

impl DomainArgs {
    pub fn new(payload: HostValue, destination: Destination, type_tag: i64) -> Self {
        Self {
            payload,
            destination,
            type_tag,
            options: HostValue::Undefined,
        }
    }

    pub fn with_options(mut self, options: HostValue) -> Self {
        self.options = options;
        self
    }

    pub fn type_tag_value(&self) -> HostValue {
        HostValue::Number(self.type_tag as f64)
    }
}

type ShapeBuilder = dyn Fn(&DomainArgs, &FunctionRef) -> Vec<HostValue>;
type ResultCheck = dyn Fn(&HostValue) -> HostResult<()>;

/// One guess at a callable's argument convention.
#[derive(Clone)]
pub struct CallShape {
    name: String,
    key_hint: Option<String>,
    /// Never offered to keys outside the hint, not even as a fallback.
    strict: bool,
    build: Rc<ShapeBuilder>,
    check: Option<Rc<ResultCheck>>,
}

impl CallShape {
    pub fn new<F>(name: impl Into<String>, build: F) -> Self
    where
        F: Fn(&DomainArgs, &FunctionRef) -> Vec<HostValue> + 'static,
    {
        Self {
            name: name.into(),
            key_hint: None,
            strict: false,
            build: Rc::new(build),
            check: None,
        }
    }

    /// Restrict this shape to candidates whose key contains `hint`.
    pub fn for_keys_containing(mut self, hint: impl Into<String>) -> Self {
        self.key_hint = Some(hint.into().to_lowercase());
        self
    }

    /// Like [`CallShape::for_keys_containing`], without the fallback to
    /// unmatched keys.
    pub fn only_for_keys_containing(mut self, hint: impl Into<String>) -> Self {
        self = self.for_keys_containing(hint);
        self.strict = true;
        self
    }

    /// Reject returned values the host uses to signal soft failure.
    pub fn with_result_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&HostValue) -> HostResult<()> + 'static,
    {
        self.check = Some(Rc::new(check));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn applies_to(&self, key: &str) -> bool {
        match &self.key_hint {
            Some(hint) => key.to_lowercase().contains(hint.as_str()),
            None => true,
        }
    }

    pub fn build_args(&self, args: &DomainArgs, callable: &FunctionRef) -> Vec<HostValue> {
        (self.build)(args, callable)
    }

    pub fn check_result(&self, value: &HostValue) -> HostResult<()> {
        match &self.check {
            Some(check) => check(value),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for CallShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallShape")
            .field("name", &self.name)
            .field("key_hint", &self.key_hint)
            .field("strict", &self.strict)
            .finish()
    }
}

/// Shapes to try for a candidate found under `key`.
///
/// Shapes restricted to other keys are skipped. When nothing applies, every
/// non-strict shape is used so a renamed callable still gets its guesses.
pub fn shapes_for_key<'a>(shapes: &'a [CallShape], key: &str) -> Vec<&'a CallShape> {
    let applicable: Vec<&CallShape> = shapes.iter().filter(|s| s.applies_to(key)).collect();
    if applicable.is_empty() {
        shapes.iter().filter(|s| !s.strict).collect()
    } else {
        applicable
    }
}

/// Immutable description of a needed capability.
#[derive(Debug, Clone)]
pub struct CapabilityQuery {
    id: QueryId,
    keywords: Vec<String>,
    exact_name: Option<String>,
    source_fragments: Vec<String>,
    best_known_path: Option<PropertyPath>,
    known_shapes: Vec<KnownShape>,
    call_shapes: Vec<CallShape>,
}

impl CapabilityQuery {
    pub fn builder(id: impl Into<String>) -> CapabilityQueryBuilder {
        CapabilityQueryBuilder::new(id)
    }

    pub fn id(&self) -> &QueryId {
        &self.id
    }

    /// Lowercased, de-duplicated name hints.
    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn exact_name(&self) -> Option<&str> {
        self.exact_name.as_deref()
    }

    pub fn source_fragments(&self) -> &[String] {
        &self.source_fragments
    }

    pub fn best_known_path(&self) -> Option<&PropertyPath> {
        self.best_known_path.as_ref()
    }

    pub fn known_shapes(&self) -> &[KnownShape] {
        &self.known_shapes
    }

    pub fn call_shapes(&self) -> &[CallShape] {
        &self.call_shapes
    }

    /// Cheap name test used by pre-filters.
    pub fn key_matches(&self, key: &str) -> bool {
        if self.exact_name.as_deref() == Some(key) {
            return true;
        }
        let lower = key.to_lowercase();
        self.keywords.iter().any(|kw| lower.contains(kw.as_str()))
    }
}

pub struct CapabilityQueryBuilder {
    query: CapabilityQuery,
}

impl CapabilityQueryBuilder {
    fn new(id: impl Into<String>) -> Self {
        Self {
            query: CapabilityQuery {
                id: QueryId::new(id),
                keywords: vec![],
                exact_name: None,
                source_fragments: vec![],
                best_known_path: None,
                known_shapes: vec![],
                call_shapes: vec![],
            },
        }
    }

    pub fn keyword(mut self, keyword: impl Into<String>) -> Self {
        let keyword = keyword.into().trim().to_lowercase();
        if !keyword.is_empty() && !self.query.keywords.contains(&keyword) {
            self.query.keywords.push(keyword);
        }
        self
    }

    pub fn keywords<S: Into<String>>(self, keywords: impl IntoIterator<Item = S>) -> Self {
        keywords.into_iter().fold(self, |b, kw| b.keyword(kw))
    }

    pub fn exact_name(mut self, name: impl Into<String>) -> Self {
        self.query.exact_name = Some(name.into());
        self
    }

    pub fn source_fragment(mut self, fragment: impl Into<String>) -> Self {
        let fragment = fragment.into();
        if !fragment.is_empty() {
            self.query.source_fragments.push(fragment);
        }
        self
    }

    pub fn best_known_path(mut self, path: PropertyPath) -> Self {
        self.query.best_known_path = Some(path);
        self
    }

    pub fn known_shape(mut self, shape: KnownShape) -> Self {
        self.query.known_shapes.push(shape);
        self
    }

    pub fn call_shape(mut self, shape: CallShape) -> Self {
        self.query.call_shapes.push(shape);
        self
    }

    pub fn call_shapes(mut self, shapes: impl IntoIterator<Item = CallShape>) -> Self {
        self.query.call_shapes.extend(shapes);
        self
    }

    pub fn build(self) -> CapabilityQuery {
        self.query
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keywords_are_normalized() {
        let query = CapabilityQuery::builder("q")
            .keywords(["Upload", "upload", " attach "])
            .build();
        assert_eq!(query.keywords(), &["upload".to_string(), "attach".to_string()]);
        assert!(query.key_matches("promptToUpload"));
        assert!(!query.key_matches("clearAll"));
    }

    #[test]
    fn test_property_path_parts() {
        let path = PropertyPath::parse("default.promptToUpload");
        assert_eq!(path.anchor(), Some("promptToUpload"));
        assert_eq!(path.leaf(), Some("promptToUpload"));
        assert_eq!(path.parent(), &["default".to_string()]);
    }

    #[test]
    fn test_shape_key_filter_falls_back_to_all() {
        let shapes = vec![
            CallShape::new("prompt", |_, _| vec![]).for_keys_containing("prompt"),
            CallShape::new("add", |_, _| vec![]).for_keys_containing("add"),
        ];
        let names: Vec<&str> = shapes_for_key(&shapes, "addFile")
            .iter()
            .map(|s| s.name())
            .collect();
        assert_eq!(names, vec!["add"]);
        assert_eq!(shapes_for_key(&shapes, "enqueue").len(), 2);
    }

    #[test]
    fn test_strict_shapes_never_fall_back() {
        let shapes = vec![
            CallShape::new("send", |_, _| vec![]).only_for_keys_containing("send"),
            CallShape::new("send-legacy", |_, _| vec![]).only_for_keys_containing("send"),
        ];
        assert_eq!(shapes_for_key(&shapes, "sendMessage").len(), 2);
        assert!(shapes_for_key(&shapes, "deleteMessage").is_empty());
    }
}
