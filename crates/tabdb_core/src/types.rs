//! Write results and change events.

use crate::config::InstanceKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tabdb_storage::{ConflictError, Document, WriteRow};

/// Outcome of a bulk write.
///
/// Every primary key of the input appears in exactly one of the two maps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteResult {
    /// Written documents, carrying their new revision.
    pub success: BTreeMap<String, Document>,
    /// Rejected rows.
    pub error: BTreeMap<String, ConflictError>,
}

impl WriteResult {
    /// Returns the number of rows reported.
    pub fn len(&self) -> usize {
        self.success.len() + self.error.len()
    }

    /// Returns true if no row was reported.
    pub fn is_empty(&self) -> bool {
        self.success.is_empty() && self.error.is_empty()
    }
}

/// Kind of a document change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    /// A document appeared.
    Insert,
    /// A live document was replaced.
    Update,
    /// A document was tombstoned.
    Delete,
}

/// A single document change.
///
/// `doc` is `None` only for [`ChangeOperation::Delete`]; `previous` is
/// `None` only for [`ChangeOperation::Insert`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Type of change.
    pub operation: ChangeOperation,
    /// The new document state.
    pub doc: Option<Document>,
    /// The state before the change.
    pub previous: Option<Document>,
    /// Primary key of the changed document.
    pub id: String,
}

impl ChangeEvent {
    /// Creates an insert event.
    pub fn insert(id: impl Into<String>, doc: Document) -> Self {
        Self {
            operation: ChangeOperation::Insert,
            doc: Some(doc),
            previous: None,
            id: id.into(),
        }
    }

    /// Creates an update event.
    pub fn update(id: impl Into<String>, doc: Document, previous: Document) -> Self {
        Self {
            operation: ChangeOperation::Update,
            doc: Some(doc),
            previous: Some(previous),
            id: id.into(),
        }
    }

    /// Creates a delete event.
    pub fn delete(id: impl Into<String>, previous: Document) -> Self {
        Self {
            operation: ChangeOperation::Delete,
            doc: None,
            previous: Some(previous),
            id: id.into(),
        }
    }

    /// Derives the event for a successfully written row.
    ///
    /// Returns `None` when a deleted document is written over nothing or
    /// over another tombstone: the write succeeds but nothing observable
    /// changed. The `previous` of a delete carries the revision the
    /// tombstone was written with.
    pub fn from_write(id: &str, row: &WriteRow, written: &Document) -> Option<Self> {
        let deleted = row.document.is_deleted();
        match &row.previous {
            _ if deleted && row.previous.as_ref().map_or(true, Document::is_deleted) => None,
            None => Some(Self::insert(id, written.clone())),
            Some(previous) if deleted => {
                let mut previous = previous.clone();
                if let Some(revision) = written.revision() {
                    previous.set_revision(revision);
                }
                Some(Self::delete(id, previous))
            }
            Some(previous) => Some(Self::update(id, written.clone(), previous.clone())),
        }
    }

    /// Returns the document whose revision identifies this event.
    pub fn subject(&self) -> Option<&Document> {
        match self.operation {
            ChangeOperation::Delete => self.previous.as_ref(),
            _ => self.doc.as_ref(),
        }
    }
}

/// A change event as published on an instance's change stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageChangeEvent {
    /// `<local|non-local>|<primary>|<revision>`.
    pub event_id: String,
    /// Primary key of the changed document.
    pub document_id: String,
    /// The change itself.
    pub change: ChangeEvent,
    /// When the write call started, in ms since the Unix epoch.
    pub start_time: u64,
    /// When the backend acknowledged, in ms since the Unix epoch.
    pub end_time: u64,
}

/// All change events of one bulk write, published as one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBulk {
    /// Random id of this bulk.
    pub id: String,
    /// Events in acknowledgement order.
    pub events: Vec<StorageChangeEvent>,
}

/// Builds the event id of a change to `primary` at `revision`.
pub fn event_key(kind: InstanceKind, primary: &str, revision: &str) -> String {
    format!("{}|{}|{}", kind.event_prefix(), primary, revision)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, rev: &str) -> Document {
        let mut doc = Document::new().with("id", id);
        doc.set_revision(rev);
        doc
    }

    fn tombstone(id: &str, rev: &str) -> Document {
        let mut doc = doc(id, rev);
        doc.set_deleted(true);
        doc
    }

    #[test]
    fn insert_event() {
        let row = WriteRow::insert(Document::new().with("id", "a"));
        let event = ChangeEvent::from_write("a", &row, &doc("a", "1-x")).unwrap();
        assert_eq!(event.operation, ChangeOperation::Insert);
        assert!(event.previous.is_none());
        assert_eq!(event.subject().unwrap().revision(), Some("1-x"));
    }

    #[test]
    fn update_event_keeps_both_states() {
        let row = WriteRow::update(doc("a", "1-x").with("name", "b"), doc("a", "1-x"));
        let event = ChangeEvent::from_write("a", &row, &doc("a", "2-y")).unwrap();
        assert_eq!(event.operation, ChangeOperation::Update);
        assert_eq!(event.doc.unwrap().revision(), Some("2-y"));
        assert_eq!(event.previous.unwrap().revision(), Some("1-x"));
    }

    #[test]
    fn delete_event_previous_carries_new_revision() {
        let row = WriteRow::delete(doc("a", "1-x"));
        let event = ChangeEvent::from_write("a", &row, &tombstone("a", "2-y")).unwrap();
        assert_eq!(event.operation, ChangeOperation::Delete);
        assert!(event.doc.is_none());
        assert_eq!(event.subject().unwrap().revision(), Some("2-y"));
    }

    #[test]
    fn tombstone_inserts_are_silent() {
        let fresh = WriteRow::insert(tombstone("a", ""));
        assert!(ChangeEvent::from_write("a", &fresh, &tombstone("a", "1-x")).is_none());

        let over_tombstone = WriteRow::update(tombstone("a", "2-x"), tombstone("a", "1-x"));
        assert!(ChangeEvent::from_write("a", &over_tombstone, &tombstone("a", "2-x")).is_none());
    }

    #[test]
    fn revive_after_delete_is_an_update() {
        let row = WriteRow::update(doc("a", "2-x"), tombstone("a", "2-x"));
        let event = ChangeEvent::from_write("a", &row, &doc("a", "3-y")).unwrap();
        assert_eq!(event.operation, ChangeOperation::Update);
    }

    #[test]
    fn event_key_format() {
        assert_eq!(event_key(InstanceKind::Collection, "a", "1-x"), "non-local|a|1-x");
        assert_eq!(event_key(InstanceKind::KeyObject, "k", "2-y"), "local|k|2-y");
    }

    #[test]
    fn operation_wire_names() {
        assert_eq!(
            serde_json::to_string(&ChangeOperation::Delete).unwrap(),
            "\"DELETE\""
        );
    }
}
