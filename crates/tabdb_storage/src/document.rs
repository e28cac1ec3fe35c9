//! Document model.
//!
//! A [`Document`] is a JSON object plus an optional attachments map. The
//! attachments are kept outside the JSON fields: their payloads are
//! reference-counted [`Bytes`], so cloning a document or deep-copying its
//! fields never copies attachment data.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{StorageError, StorageResult};

/// Field holding the tombstone flag.
pub const DELETED_FIELD: &str = "_deleted";
/// Field holding the backend-assigned revision.
pub const REVISION_FIELD: &str = "_rev";
/// Field holding the attachments map in the serialized form.
pub const ATTACHMENTS_FIELD: &str = "_attachments";

/// A binary attachment stored alongside a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// MIME type of the payload.
    pub content_type: String,
    /// Content digest as reported by the writer.
    pub digest: String,
    /// Payload length in bytes.
    pub length: usize,
    /// Payload, absent when only the metadata was loaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Bytes>,
}

impl Attachment {
    /// Creates an attachment holding `data`.
    pub fn new(content_type: impl Into<String>, digest: impl Into<String>, data: Bytes) -> Self {
        Self {
            content_type: content_type.into(),
            length: data.len(),
            digest: digest.into(),
            data: Some(data),
        }
    }
}

/// Attachments keyed by attachment id.
pub type Attachments = BTreeMap<String, Attachment>;

/// A stored document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(
        rename = "_attachments",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    attachments: Option<Attachments>,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl Document {
    /// Creates an empty document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a document from a JSON field map.
    #[must_use]
    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self {
            attachments: None,
            fields,
        }
    }

    /// Creates a document from a JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not an object or its
    /// `_attachments` entry is malformed.
    pub fn from_value(value: Value) -> StorageResult<Self> {
        if !value.is_object() {
            return Err(StorageError::corrupted("document must be a JSON object"));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Converts the document into a JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if the attachments cannot be serialized.
    pub fn into_value(self) -> StorageResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Sets a top-level field, builder style.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Returns a top-level field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Sets a top-level field and returns the old value.
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(field.into(), value.into())
    }

    /// Removes a top-level field.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    /// Returns the JSON fields.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Returns the JSON fields mutably.
    pub fn fields_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.fields
    }

    /// Returns the primary key stored at `primary_path`.
    pub fn primary(&self, primary_path: &str) -> Option<&str> {
        self.get_path(primary_path).and_then(Value::as_str)
    }

    /// Returns the primary key or a [`StorageError::MissingPrimaryKey`].
    ///
    /// # Errors
    ///
    /// Returns an error if there is no string at `primary_path`.
    pub fn require_primary(&self, primary_path: &str) -> StorageResult<&str> {
        self.primary(primary_path)
            .ok_or_else(|| StorageError::missing_primary_key(primary_path))
    }

    /// Returns true if the document is a tombstone.
    pub fn is_deleted(&self) -> bool {
        self.fields
            .get(DELETED_FIELD)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Sets the tombstone flag.
    pub fn set_deleted(&mut self, deleted: bool) {
        self.fields.insert(DELETED_FIELD.into(), Value::Bool(deleted));
    }

    /// Returns the revision, if any.
    pub fn revision(&self) -> Option<&str> {
        self.fields.get(REVISION_FIELD).and_then(Value::as_str)
    }

    /// Sets the revision.
    pub fn set_revision(&mut self, revision: impl Into<String>) {
        self.fields
            .insert(REVISION_FIELD.into(), Value::String(revision.into()));
    }

    /// Returns the attachments.
    pub fn attachments(&self) -> Option<&Attachments> {
        self.attachments.as_ref()
    }

    /// Replaces the attachments.
    pub fn set_attachments(&mut self, attachments: Option<Attachments>) {
        self.attachments = attachments;
    }

    /// Detaches and returns the attachments.
    pub fn take_attachments(&mut self) -> Option<Attachments> {
        self.attachments.take()
    }

    /// Looks up a value by dotted path (`"address.city"`, `"tags.0"`).
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.fields.get(first)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Writes a value at a dotted path, creating missing intermediate
    /// objects.
    ///
    /// Returns false if an intermediate value is neither an object nor an
    /// array that can hold the next segment.
    pub fn set_path(&mut self, path: &str, value: Value) -> bool {
        let segments: Vec<&str> = path.split('.').collect();
        let Some((last, parents)) = segments.split_last() else {
            return false;
        };
        if parents.is_empty() {
            self.fields.insert((*last).to_string(), value);
            return true;
        }

        let mut current = self
            .fields
            .entry(parents[0].to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        for segment in &parents[1..] {
            current = match current {
                Value::Object(map) => map
                    .entry((*segment).to_string())
                    .or_insert_with(|| Value::Object(Map::new())),
                Value::Array(items) => match segment.parse::<usize>() {
                    Ok(index) if index < items.len() => &mut items[index],
                    _ => return false,
                },
                _ => return false,
            };
        }

        match current {
            Value::Object(map) => {
                map.insert((*last).to_string(), value);
                true
            }
            Value::Array(items) => match last.parse::<usize>() {
                Ok(index) if index < items.len() => {
                    items[index] = value;
                    true
                }
                _ => false,
            },
            _ => false,
        }
    }

    /// Returns a copy of the JSON fields without the revision, used for
    /// content digests.
    pub(crate) fn content_without_revision(&self) -> Map<String, Value> {
        let mut fields = self.fields.clone();
        fields.remove(REVISION_FIELD);
        fields
    }
}
