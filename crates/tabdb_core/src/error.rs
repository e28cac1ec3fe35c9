//! Error types for TabDB core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in TabDB core operations.
///
/// Per-document write conflicts are not errors; they are reported in
/// [`WriteResult::error`](crate::WriteResult::error).
#[derive(Debug, Error)]
pub enum CoreError {
    /// The call itself is malformed (empty batch, duplicate ids). Never
    /// retried.
    #[error("invalid call: {message}")]
    Structural {
        /// What is wrong with the call.
        message: String,
    },

    /// An internal invariant was violated.
    #[error("impossible state: {message}")]
    ImpossibleState {
        /// Description of the violated invariant.
        message: String,
    },

    /// A forwarded operation failed on the leader.
    #[error("remote operation failed [{}]: {}", .payload.code, .payload.message)]
    RemoteDispatch {
        /// The error payload sent back by the leader.
        payload: RemoteErrorPayload,
    },

    /// A password is configured but no cipher was supplied.
    #[error("encryption plugin missing: a password is set but no cipher was configured")]
    PluginMissing,

    /// Encrypting or decrypting a field failed.
    #[error("encryption error: {message}")]
    Encryption {
        /// Description of the failure.
        message: String,
    },

    /// The instance was closed or removed.
    #[error("storage instance {database}/{collection} is closed")]
    InstanceClosed {
        /// Database name.
        database: String,
        /// Collection name.
        collection: String,
    },

    /// A remote request named an operation this instance does not know.
    #[error("unknown remote operation: {name}")]
    UnknownOperation {
        /// The requested operation name.
        name: String,
    },

    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] tabdb_storage::StorageError),

    /// Inter-context channel error.
    #[error("channel error: {0}")]
    Channel(#[from] tabdb_channel::ChannelError),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error body carried by a failed remote response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteErrorPayload {
    /// Stable error code, see [`CoreError::code`].
    pub code: String,
    /// Human readable message.
    pub message: String,
}

impl CoreError {
    /// Creates a structural error.
    pub fn structural(message: impl Into<String>) -> Self {
        Self::Structural {
            message: message.into(),
        }
    }

    /// Creates an impossible state error.
    pub fn impossible_state(message: impl Into<String>) -> Self {
        Self::ImpossibleState {
            message: message.into(),
        }
    }

    /// Creates an encryption error.
    pub fn encryption(message: impl Into<String>) -> Self {
        Self::Encryption {
            message: message.into(),
        }
    }

    /// Creates an instance closed error.
    pub fn instance_closed(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self::InstanceClosed {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Creates an unknown operation error.
    pub fn unknown_operation(name: impl Into<String>) -> Self {
        Self::UnknownOperation { name: name.into() }
    }

    /// Returns a short stable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Structural { .. } => "structural",
            CoreError::ImpossibleState { .. } => "impossible-state",
            CoreError::RemoteDispatch { .. } => "remote-dispatch",
            CoreError::PluginMissing => "plugin-missing",
            CoreError::Encryption { .. } => "encryption",
            CoreError::InstanceClosed { .. } => "instance-closed",
            CoreError::UnknownOperation { .. } => "unknown-operation",
            CoreError::Storage(e) => e.code(),
            CoreError::Channel(_) => "channel",
            CoreError::Serialization(_) => "serialization",
        }
    }

    /// Converts this error into the payload sent back to a forwarding
    /// context.
    pub fn to_payload(&self) -> RemoteErrorPayload {
        match self {
            CoreError::RemoteDispatch { payload } => payload.clone(),
            other => RemoteErrorPayload {
                code: other.code().to_string(),
                message: other.to_string(),
            },
        }
    }
}

impl From<RemoteErrorPayload> for CoreError {
    fn from(payload: RemoteErrorPayload) -> Self {
        Self::RemoteDispatch { payload }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(CoreError::structural("empty").code(), "structural");
        assert_eq!(CoreError::PluginMissing.code(), "plugin-missing");
        assert_eq!(
            CoreError::from(tabdb_storage::StorageError::Closed).code(),
            "closed"
        );
    }

    #[test]
    fn payload_keeps_remote_origin() {
        let local = CoreError::unknown_operation("explode");
        let payload = local.to_payload();
        assert_eq!(payload.code, "unknown-operation");
        assert!(payload.message.contains("explode"));

        let forwarded = CoreError::from(payload.clone());
        assert_eq!(forwarded.to_payload(), payload);
        assert_eq!(forwarded.code(), "remote-dispatch");
    }
}
