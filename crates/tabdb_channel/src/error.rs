//! Error types for channel operations.

use thiserror::Error;

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Errors that can occur on a broadcast channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The endpoint or elector was closed.
    #[error("channel '{name}' is closed")]
    Closed {
        /// Channel name.
        name: String,
    },

    /// A receiver fell behind and lost the oldest buffered envelopes.
    #[error("receiver of channel '{name}' lagged and skipped {skipped} messages")]
    Lagged {
        /// Channel name.
        name: String,
        /// Number of envelopes lost.
        skipped: u64,
    },

    /// A message could not be encoded or decoded.
    #[error("message codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl ChannelError {
    /// Creates a closed channel error.
    pub fn closed(name: impl Into<String>) -> Self {
        Self::Closed { name: name.into() }
    }

    /// Returns true for [`ChannelError::Lagged`].
    pub fn is_lagged(&self) -> bool {
        matches!(self, Self::Lagged { .. })
    }
}
