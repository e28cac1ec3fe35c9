//! Write rows and per-row conflicts.

use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::revision::ConflictReason;

/// HTTP-style status reported on every conflict.
pub const CONFLICT_STATUS: u16 = 409;

/// One document write with its optimistic-concurrency precondition.
///
/// `previous` must match the currently stored revision for the document's
/// primary key. A row without `previous` is an insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRow {
    /// The new document state.
    pub document: Document,
    /// The state the writer based its change on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Document>,
}

impl WriteRow {
    /// Creates an insert row.
    #[must_use]
    pub fn insert(document: Document) -> Self {
        Self {
            document,
            previous: None,
        }
    }

    /// Creates a row that replaces `previous`.
    #[must_use]
    pub fn update(document: Document, previous: Document) -> Self {
        Self {
            document,
            previous: Some(previous),
        }
    }

    /// Creates a row that tombstones `previous`.
    #[must_use]
    pub fn delete(previous: Document) -> Self {
        let mut document = previous.clone();
        document.set_deleted(true);
        Self::update(document, previous)
    }
}

/// A rejected write row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictError {
    /// Always true, kept for wire compatibility.
    pub is_error: bool,
    /// Always [`CONFLICT_STATUS`].
    pub status: u16,
    /// Primary key of the rejected row.
    pub document_id: String,
    /// The rejected row.
    pub write_row: WriteRow,
    /// Why the row was rejected.
    pub reason: ConflictReason,
}

impl ConflictError {
    /// Creates a conflict for `write_row`.
    pub fn new(document_id: impl Into<String>, write_row: WriteRow, reason: ConflictReason) -> Self {
        Self {
            is_error: true,
            status: CONFLICT_STATUS,
            document_id: document_id.into(),
            write_row,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn delete_row_keeps_previous() {
        let mut previous = Document::new().with("id", "a");
        previous.set_revision("1-aa");
        let row = WriteRow::delete(previous.clone());
        assert!(row.document.is_deleted());
        assert_eq!(row.previous, Some(previous));
    }

    #[test]
    fn conflict_wire_shape() {
        let row = WriteRow::insert(Document::new().with("id", "a"));
        let conflict = ConflictError::new("a", row, ConflictReason::AlreadyExists);
        let value = serde_json::to_value(&conflict).unwrap();
        assert_eq!(value["isError"], json!(true));
        assert_eq!(value["status"], json!(409));
        assert_eq!(value["documentId"], json!("a"));
        assert_eq!(value["reason"], json!("already-exists"));
        assert!(value["writeRow"].get("previous").is_none());
    }
}
