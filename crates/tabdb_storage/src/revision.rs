//! Revision tracking.
//!
//! Classifies a write row against the stored state and assigns the next
//! revision. Revisions have the form `<height>-<digest>`; the height grows by
//! one on every successful write to a primary key and the digest is derived
//! from the new content.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::document::Document;
use crate::error::StorageResult;
use crate::write::WriteRow;

/// Bytes of the SHA-256 digest kept in a revision.
const DIGEST_BYTES: usize = 16;

/// What a successful row does to the stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// No live document existed before.
    Insert,
    /// A live document was replaced.
    Update,
    /// A document was tombstoned.
    Delete,
}

/// Why a row was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictReason {
    /// An insert hit a live document.
    AlreadyExists,
    /// An update or delete named a document that is not stored.
    Missing,
    /// The declared previous revision is not the stored one.
    RevisionMismatch,
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictReason::AlreadyExists => write!(f, "document already exists"),
            ConflictReason::Missing => write!(f, "document does not exist"),
            ConflictReason::RevisionMismatch => write!(f, "revision mismatch"),
        }
    }
}

/// Classifies `row` against the currently `stored` document.
///
/// # Errors
///
/// Returns the conflict reason if the row's precondition does not hold.
pub fn classify(row: &WriteRow, stored: Option<&Document>) -> Result<WriteKind, ConflictReason> {
    match (&row.previous, stored) {
        (None, Some(stored)) if !stored.is_deleted() => Err(ConflictReason::AlreadyExists),
        (None, _) => Ok(WriteKind::Insert),
        (Some(_), None) => Err(ConflictReason::Missing),
        (Some(previous), Some(stored)) => {
            if previous.revision() != stored.revision() {
                Err(ConflictReason::RevisionMismatch)
            } else if row.document.is_deleted() {
                Ok(WriteKind::Delete)
            } else {
                Ok(WriteKind::Update)
            }
        }
    }
}

/// Parses the height of a revision string.
pub fn height(revision: &str) -> Option<u64> {
    revision.split_once('-')?.0.parse().ok()
}

/// Computes the revision for `document` replacing `stored`.
///
/// # Errors
///
/// Returns an error if the content cannot be encoded.
pub fn next_revision(stored: Option<&Document>, document: &Document) -> StorageResult<String> {
    let next_height = stored
        .and_then(Document::revision)
        .and_then(height)
        .unwrap_or(0)
        + 1;
    // serde_json maps are sorted, so this encoding is canonical
    let digest = content_digest(&document.content_without_revision())?;
    Ok(format!("{next_height}-{digest}"))
}

fn content_digest<T: Serialize + ?Sized>(content: &T) -> StorageResult<String> {
    let digest = Sha256::digest(serde_json::to_vec(content)?);
    Ok(hex::encode(&digest[..DIGEST_BYTES]))
}

/// Applies `row` on top of `stored` and returns the document to store.
///
/// The outer result fails only if the revision cannot be computed; the
/// inner one carries the conflict reason if the row's precondition does
/// not hold.
///
/// # Errors
///
/// Returns an error if the document content cannot be encoded.
pub fn apply(
    row: &WriteRow,
    stored: Option<&Document>,
) -> StorageResult<Result<(WriteKind, Document), ConflictReason>> {
    let kind = match classify(row, stored) {
        Ok(kind) => kind,
        Err(reason) => return Ok(Err(reason)),
    };
    let mut document = row.document.clone();
    document.set_revision(next_revision(stored, &row.document)?);
    Ok(Ok((kind, document)))
}
