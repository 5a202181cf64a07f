//! Attachment extraction and per-run deduplication.
//!
//! Tools surface files to the user in a few loose shapes: an `attachments`
//! array on the result, the result itself being an attachment (or a list of
//! them), or an inline base64 image.  This module normalises all of them into
//! [`Attachment`] records and keeps the first occurrence of each URL.

use std::collections::HashSet;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{AgentError, Result};

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// A file surfaced to the user by a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub name: String,
    pub url: String,
    pub mime_type: String,
    #[serde(default)]
    pub size: u64,
}

impl Attachment {
    /// Build an attachment with a fresh id.
    pub fn new(name: impl Into<String>, url: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            name: name.into(),
            url: url.into(),
            mime_type: mime_type.into(),
            size: 0,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Interpret a JSON object as an attachment.
    ///
    /// An object is attachment-shaped when it has string `url` and `name`
    /// fields.  Missing ids are generated; the MIME type is read from
    /// `mimeType`, `mime_type` or `type` in that order.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let url = obj.get("url")?.as_str()?;
        let name = obj.get("name")?.as_str()?;

        let id = obj
            .get("id")
            .and_then(|v| match v {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .unwrap_or_else(|| Uuid::now_v7().to_string());

        let mime_type = ["mimeType", "mime_type", "type"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(Value::as_str))
            .unwrap_or(DEFAULT_MIME_TYPE)
            .to_owned();

        let size = obj.get("size").and_then(Value::as_u64).unwrap_or(0);

        Some(Self {
            id,
            name: name.to_owned(),
            url: url.to_owned(),
            mime_type,
            size,
        })
    }
}

/// Attachments carried by a tool result, in encounter order.
///
/// Inline images are not included; see [`inline_image`].
pub fn extract_attachments(result: &Value) -> Vec<Attachment> {
    if let Some(list) = result.get("attachments").and_then(Value::as_array) {
        return list.iter().filter_map(Attachment::from_value).collect();
    }

    match result {
        Value::Array(items) => items.iter().filter_map(Attachment::from_value).collect(),
        Value::Object(_) => Attachment::from_value(result).into_iter().collect(),
        _ => Vec::new(),
    }
}

/// A decoded inline image payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// Detect and decode an inline base64 image in a tool result.
///
/// Recognised shapes are `{"type": "image", "data": .., "mimeType": ..}` and
/// objects carrying `imageBase64` / `image_base64`.  A `data:` URL prefix is
/// stripped and its media type used when no explicit one is given.
pub fn inline_image(result: &Value) -> Result<Option<InlineImage>> {
    let Some(obj) = result.as_object() else {
        return Ok(None);
    };

    let payload = if obj.get("type").and_then(Value::as_str) == Some("image") {
        obj.get("data").and_then(Value::as_str)
    } else {
        obj.get("imageBase64")
            .or_else(|| obj.get("image_base64"))
            .and_then(Value::as_str)
    };
    let Some(payload) = payload else {
        return Ok(None);
    };

    let explicit_mime = ["mimeType", "mime_type"]
        .iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_str));

    let (data_url_mime, encoded) = split_data_url(payload);
    let mime_type = explicit_mime
        .or(data_url_mime)
        .unwrap_or("image/png")
        .to_owned();

    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| AgentError::AttachmentStorage {
            reason: format!("invalid base64 image payload: {e}"),
        })?;

    Ok(Some(InlineImage { bytes, mime_type }))
}

/// Split `data:<mime>;base64,<payload>` into its media type and payload.
fn split_data_url(s: &str) -> (Option<&str>, &str) {
    let Some(rest) = s.strip_prefix("data:") else {
        return (None, s);
    };
    match rest.split_once(',') {
        Some((meta, payload)) => {
            let mime = meta.split(';').next().filter(|m| !m.is_empty());
            (mime, payload)
        }
        None => (None, s),
    }
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

/// Accumulates the attachments of one run, first URL wins.
#[derive(Debug, Default, Clone)]
pub struct AttachmentCollector {
    items: Vec<Attachment>,
    seen: HashSet<String>,
}

impl AttachmentCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an attachment.  Returns `false` if its URL was already collected.
    pub fn push(&mut self, attachment: Attachment) -> bool {
        if !self.seen.insert(attachment.url.clone()) {
            tracing::debug!(url = %attachment.url, name = %attachment.name, "duplicate attachment skipped");
            return false;
        }
        self.items.push(attachment);
        true
    }

    /// Add every attachment of `batch`, returning how many were new.
    pub fn extend(&mut self, batch: impl IntoIterator<Item = Attachment>) -> usize {
        batch.into_iter().filter(|a| self.push(a.clone())).count()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn as_slice(&self) -> &[Attachment] {
        &self.items
    }

    pub fn into_vec(self) -> Vec<Attachment> {
        self.items
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
