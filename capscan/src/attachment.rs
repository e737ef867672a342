//! File-queue preset
//!
//! Everything needed to put a rendered image into a destination's pending
//! attachment queue: payload validation, file naming, staging on disk, the
//! file-queue capability query with its call shapes, and the upload store
//! probe that confirms an entry actually appeared.

use crate::error::CapabilityError;
use crate::host::{Completion, HostValue};
use crate::probe::{ConfirmationStore, PollPolicy, StoreProbe};
use crate::query::{CallShape, CapabilityQuery, Destination, DomainArgs, KnownShape, PropertyPath};
use crate::registry::ModuleRegistry;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_MIME: &str = "image/png";
pub const FILE_QUEUE_QUERY: &str = "file-queue";

const PREVIEW_WORDS: usize = 6;
const PREVIEW_MAX_CHARS: usize = 48;
const USERNAME_MAX_CHARS: usize = 32;
/// Upload types read after the intended one.
const FALLBACK_TYPE_TAGS: [i64; 4] = [0, 1, 2, 3];

lazy_static! {
    static ref CUSTOM_EMOJI: Regex = Regex::new(r"<a?:\w+:\d+>").unwrap();
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
    static ref UNSAFE_NAME_CHARS: Regex = Regex::new(r"[^A-Za-z0-9_.\-]").unwrap();
}

/// A finished image as produced by the renderer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedImage {
    pub bytes: Vec<u8>,
    pub mime: String,
}

impl RenderedImage {
    pub fn new(bytes: Vec<u8>, mime: impl Into<String>) -> Self {
        Self {
            bytes,
            mime: mime.into(),
        }
    }

    /// Parse `data:<mime>;base64,<body>`.
    ///
    /// Only base64 bodies are accepted and the body must not be empty. A
    /// missing MIME type falls back to [`DEFAULT_MIME`].
    pub fn from_data_url(data_url: &str) -> Result<Self, CapabilityError> {
        let invalid = || CapabilityError::InvalidInput("Invalid rendered image.".to_string());

        let rest = data_url.strip_prefix("data:").ok_or_else(invalid)?;
        let (meta, body) = rest.split_once(',').ok_or_else(invalid)?;
        if !meta.contains(";base64") || body.is_empty() {
            return Err(invalid());
        }

        let mime = meta.split(';').next().unwrap_or_default().trim();
        let mime = if mime.is_empty() { DEFAULT_MIME } else { mime };
        let bytes = STANDARD.decode(body.trim()).map_err(|e| {
            CapabilityError::InvalidInput(format!("Invalid rendered image: {}", e))
        })?;
        if bytes.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(bytes, mime))
    }
}

/// Collapse whitespace and drop custom emoji markup.
pub fn normalize_text(text: &str) -> String {
    let stripped = CUSTOM_EMOJI.replace_all(text, "");
    WHITESPACE.replace_all(&stripped, " ").trim().to_string()
}

/// Username reduced to safe file-name characters, `unknown` when empty.
pub fn sanitize_username(username: &str) -> String {
    let cleaned: String = UNSAFE_NAME_CHARS
        .replace_all(username, "")
        .chars()
        .take(USERNAME_MAX_CHARS)
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

/// `{preview}-{username}.png`, where the preview is the first words of the
/// quoted content with unsafe characters replaced.
pub fn quote_file_name(content: &str, username: &str) -> String {
    let normalized = normalize_text(content);
    let preview = normalized
        .split(' ')
        .filter(|w| !w.is_empty())
        .take(PREVIEW_WORDS)
        .collect::<Vec<_>>()
        .join(" ");
    let preview = if preview.is_empty() { "quote".to_string() } else { preview };
    let safe: String = UNSAFE_NAME_CHARS
        .replace_all(&preview, "_")
        .chars()
        .take(PREVIEW_MAX_CHARS)
        .collect();
    format!("{}-{}.png", safe, sanitize_username(username))
}

/// An image written to the cache directory for the host to pick up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub path: PathBuf,
    /// Unique on-disk name, also visible in the `file://` URI.
    pub staged_name: String,
}

impl StagedFile {
    pub async fn stage(cache_dir: &Path, image: &RenderedImage) -> Result<Self, CapabilityError> {
        tokio::fs::create_dir_all(cache_dir).await.map_err(|e| {
            CapabilityError::Staging(format!("create {}: {}", cache_dir.display(), e))
        })?;

        let staged_name = format!(
            "{}-{}.png",
            chrono::Utc::now().timestamp_millis(),
            uuid::Uuid::new_v4().simple()
        );
        let path = cache_dir.join(&staged_name);
        tokio::fs::write(&path, &image.bytes)
            .await
            .map_err(|e| CapabilityError::Staging(format!("write {}: {}", path.display(), e)))?;

        debug!(path = %path.display(), bytes = image.bytes.len(), "staged rendered image");
        Ok(Self { path, staged_name })
    }

    pub fn uri(&self) -> String {
        format!("file://{}", self.path.display())
    }

    /// Record handed to upload calls.
    pub fn uploadable(&self, file_name: &str, mime: &str) -> HostValue {
        HostValue::object([
            ("uri", HostValue::from(self.uri())),
            ("type", HostValue::from(mime)),
            ("name", HostValue::from(file_name)),
            ("filename", HostValue::from(file_name)),
            ("fileName", HostValue::from(file_name)),
            ("mimeType", HostValue::from(mime)),
        ])
    }

    /// Remove the file now. A file that is already gone is not an error.
    pub async fn remove(&self) {
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %self.path.display(), error = %e, "failed to remove staged file");
            }
        }
    }

    /// Remove the file after `delay` on a detached task.
    pub fn schedule_cleanup(self, delay: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            self.remove().await;
        })
    }
}

/// Upload type of the regular message composer, 0 when the host has no
/// draft type table.
pub fn resolve_type_tag(registry: &dyn ModuleRegistry) -> i64 {
    registry
        .find_by_props(&["ChannelMessage", "SlashCommand"])
        .ok()
        .flatten()
        .and_then(|table| table.get("ChannelMessage"))
        .and_then(|v| v.as_f64())
        .filter(|v| v.is_finite())
        .map(|v| v as i64)
        .unwrap_or(0)
}

/// Destination with the host's channel object attached when one is found.
pub fn resolve_destination(registry: &dyn ModuleRegistry, id: &str) -> Destination {
    let destination = Destination::new(id);
    let store = registry
        .find_by_store_name("ChannelStore")
        .ok()
        .flatten()
        .filter(|store| store.has_function("getChannel"))
        .or_else(|| {
            registry
                .find_by_props(&["getChannel", "getDMFromUserId"])
                .ok()
                .flatten()
        })
        .or_else(|| registry.find_by_props(&["getChannel"]).ok().flatten());
    let Some(store) = store else {
        return destination;
    };
    match store.call_method("getChannel", &[HostValue::from(id)]) {
        Ok(Completion::Ready(channel)) => destination.with_resolved(channel),
        Ok(Completion::Pending(_)) => destination,
        Err(e) => {
            debug!(destination = id, error = %e, "getChannel threw");
            destination
        }
    }
}

fn single(args: &DomainArgs) -> HostValue {
    HostValue::array(vec![args.payload.clone()])
}

fn prompt_shapes() -> Vec<CallShape> {
    vec![
        CallShape::new("prompt(files, channel, type)", |a, _| {
            vec![single(a), a.destination.value(), a.type_tag_value()]
        }),
        CallShape::new("prompt(files, channel, 0)", |a, _| {
            vec![single(a), a.destination.value(), HostValue::Number(0.0)]
        }),
        CallShape::new("prompt(files, channel)", |a, _| {
            vec![single(a), a.destination.value()]
        }),
        CallShape::new("prompt(files, id, type)", |a, _| {
            vec![single(a), a.destination.id_value(), a.type_tag_value()]
        }),
        CallShape::new("prompt(files, id, 0)", |a, _| {
            vec![single(a), a.destination.id_value(), HostValue::Number(0.0)]
        }),
        CallShape::new("prompt(files, id)", |a, _| {
            vec![single(a), a.destination.id_value()]
        }),
    ]
    .into_iter()
    .map(|s| s.for_keys_containing("prompt"))
    .collect()
}

fn add_file_shapes() -> Vec<CallShape> {
    vec![
        CallShape::new("addFile(id, type, file)", |a, _| {
            vec![a.destination.id_value(), a.type_tag_value(), a.payload.clone()]
        }),
        CallShape::new("addFile(id, file, type)", |a, _| {
            vec![a.destination.id_value(), a.payload.clone(), a.type_tag_value()]
        }),
        CallShape::new("addFile(id, file)", |a, _| {
            vec![a.destination.id_value(), a.payload.clone()]
        }),
        CallShape::new("addFile(channel, type, file)", |a, _| {
            vec![a.destination.value(), a.type_tag_value(), a.payload.clone()]
        }),
        CallShape::new("addFile(channel, file, type)", |a, _| {
            vec![a.destination.value(), a.payload.clone(), a.type_tag_value()]
        }),
        CallShape::new("addFile(channel, file)", |a, _| {
            vec![a.destination.value(), a.payload.clone()]
        }),
        CallShape::new("addFile(file, id, type)", |a, _| {
            vec![a.payload.clone(), a.destination.id_value(), a.type_tag_value()]
        }),
        CallShape::new("addFile({channelId, draftType, file})", |a, _| {
            vec![HostValue::object([
                ("channelId", a.destination.id_value()),
                ("draftType", a.type_tag_value()),
                ("file", a.payload.clone()),
            ])]
        }),
        CallShape::new("addFile({channel, channelId, draftType, file})", |a, _| {
            vec![HostValue::object([
                ("channel", a.destination.value()),
                ("channelId", a.destination.id_value()),
                ("draftType", a.type_tag_value()),
                ("file", a.payload.clone()),
            ])]
        }),
        CallShape::new("addFile({channelId, draftType, files})", |a, _| {
            vec![HostValue::object([
                ("channelId", a.destination.id_value()),
                ("draftType", a.type_tag_value()),
                ("files", single(a)),
            ])]
        }),
    ]
    .into_iter()
    .map(|s| s.for_keys_containing("addfile"))
    .collect()
}

/// Positional form for the three-argument variant, record form otherwise.
fn instant_batch_shape() -> CallShape {
    CallShape::new("instantBatchUpload", |a, callable| {
        if callable.arity() == 3 {
            vec![a.destination.id_value(), single(a), HostValue::Bool(false)]
        } else {
            vec![HostValue::object([
                ("channelId", a.destination.id_value()),
                ("draftType", a.type_tag_value()),
                ("files", single(a)),
                ("isThumbnail", HostValue::Bool(false)),
                ("isClip", HostValue::Bool(false)),
            ])]
        }
    })
    .for_keys_containing("instantbatch")
}

/// Capability query for "queue a file as a pending attachment".
pub fn file_queue_query() -> CapabilityQuery {
    CapabilityQuery::builder(FILE_QUEUE_QUERY)
        .keywords(["upload", "prompt", "attach", "file"])
        .exact_name("promptToUpload")
        .source_fragment("uploadFiles")
        .source_fragment("draftType")
        .best_known_path(PropertyPath::parse("default.promptToUpload"))
        .known_shape(KnownShape::new("prompt-to-upload", ["promptToUpload"], "promptToUpload"))
        .known_shape(KnownShape::new(
            "upload-size-error",
            ["showUploadFileSizeExceededError", "promptToUpload"],
            "promptToUpload",
        ))
        .known_shape(KnownShape::new(
            "upload-dialog",
            ["showUploadDialog", "promptToUpload"],
            "promptToUpload",
        ))
        .known_shape(KnownShape::new("add-file", ["clearAll", "addFile"], "addFile"))
        .known_shape(KnownShape::new(
            "instant-batch",
            ["upload", "instantBatchUpload"],
            "instantBatchUpload",
        ))
        .call_shapes(prompt_shapes())
        .call_shapes(add_file_shapes())
        .call_shape(instant_batch_shape())
        .build()
}

/// The host's pending-upload store.
#[derive(Debug, Clone)]
pub struct UploadStore {
    store: HostValue,
    type_tag: i64,
}

impl UploadStore {
    pub fn new(store: HostValue, type_tag: i64) -> Self {
        Self { store, type_tag }
    }

    /// The store registered as `UploadAttachmentStore`, else any module
    /// shaped like it.
    pub fn find(registry: &dyn ModuleRegistry, type_tag: i64) -> Option<Self> {
        registry
            .find_by_store_name("UploadAttachmentStore")
            .ok()
            .flatten()
            .filter(|store| store.has_function("getUploads"))
            .or_else(|| registry.find_by_props(&["getUploads", "getUpload"]).ok().flatten())
            .map(|store| Self::new(store, type_tag))
    }

    fn read(&self, args: &[HostValue]) -> Vec<HostValue> {
        match self.store.call_method("getUploads", args) {
            Ok(Completion::Ready(HostValue::Array(uploads))) => uploads.items(),
            _ => Vec::new(),
        }
    }
}

impl ConfirmationStore for UploadStore {
    /// Uploads for the intended type, then every known type, then untyped,
    /// each entry once.
    fn entries(&self, destination: &Destination) -> Vec<HostValue> {
        let id = destination.id_value();
        let mut seen = HashSet::new();
        let mut collected = Vec::new();
        let tags = std::iter::once(self.type_tag).chain(FALLBACK_TYPE_TAGS);
        let batches = tags
            .map(|tag| self.read(&[id.clone(), HostValue::Number(tag as f64)]))
            .chain(std::iter::once(self.read(&[id.clone()])));
        for upload in batches.flatten() {
            if upload.is_nullish() {
                continue;
            }
            // primitives have no identity and are never de-duplicated
            let fresh = upload.identity().map(|key| seen.insert(key)).unwrap_or(true);
            if fresh {
                collected.push(upload);
            }
        }
        collected
    }
}

/// Does `upload` name the queued file?
pub fn upload_names_file(upload: &HostValue, file_name: &str, staged_name: &str) -> bool {
    if upload.as_object().is_none() {
        return false;
    }
    let is_name = |v: Option<HostValue>| v.as_ref().and_then(HostValue::as_str) == Some(file_name);
    if is_name(upload.get("filename")) || is_name(upload.get("name")) {
        return true;
    }
    let Some(item) = upload.get("item").filter(|i| i.as_object().is_some()) else {
        return false;
    };
    let uri = item
        .get("uri")
        .and_then(|u| u.as_str().map(str::to_string))
        .unwrap_or_default();
    is_name(item.get("fileName"))
        || is_name(item.get("filename"))
        || is_name(item.get("name"))
        || uri.contains(file_name)
        || (!staged_name.is_empty() && uri.contains(staged_name))
}

/// Probe confirming the file reached the destination's upload queue.
pub fn upload_probe(
    store: UploadStore,
    destination: Destination,
    file_name: &str,
    staged_name: &str,
    policy: PollPolicy,
) -> StoreProbe<UploadStore> {
    let file_name = file_name.to_string();
    let staged_name = staged_name.to_string();
    StoreProbe::new(store, destination, policy, move |upload| {
        upload_names_file(upload, &file_name, &staged_name)
    })
    .confirm_on_growth()
}
