//! # Sync Error Types
//!
//! Error types for replication.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Connection     │  │  InvalidMessage         │ │
//! │  │  MissingNodeId  │  │  Timeout        │  │  SerializationFailed    │ │
//! │  │  InvalidUrl     │  │  AuthFailed     │  │  DeserializationFailed  │ │
//! │  │                 │  │  RemoteRejected │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐                              │
//! │  │    Database     │  │     Apply       │                              │
//! │  │                 │  │                 │                              │
//! │  │  DatabaseError  │  │  ApplyFailed    │                              │
//! │  │                 │  │  (per record)   │                              │
//! │  └─────────────────┘  └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Conflicts are not errors: they are resolved and audited.

use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all replication failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid node configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Missing node ID (required to identify this node to the primary).
    #[error("Node ID not configured")]
    MissingNodeId,

    /// Invalid primary URL.
    #[error("Invalid primary URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Could not reach the primary.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Attempt or request exceeded its deadline.
    #[error("Timed out after {0} seconds")]
    Timeout(u64),

    /// The primary refused this node's credentials.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// The primary answered with a non-success status.
    #[error("Primary rejected request with status {status}: {body}")]
    RemoteRejected { status: u16, body: String },

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Malformed message.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Failed to serialize message.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Failed to deserialize message.
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    // =========================================================================
    // Database Errors
    // =========================================================================
    /// Local storage failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    // =========================================================================
    // Apply Errors
    // =========================================================================
    /// A single change could not be applied.
    #[error("Failed to apply change: {0}")]
    ApplyFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal engine error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Background task join/channel failure.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<jukebox_db::DbError> for SyncError {
    fn from(err: jukebox_db::DbError) -> Self {
        SyncError::DatabaseError(err.to_string())
    }
}

impl From<jukebox_core::CoreError> for SyncError {
    fn from(err: jukebox_core::CoreError) -> Self {
        SyncError::Internal(err.to_string())
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::ConnectionFailed(format!("request timed out: {}", err))
        } else if err.is_decode() {
            SyncError::DeserializationFailed(err.to_string())
        } else if let Some(status) = err.status() {
            SyncError::RemoteRejected {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            SyncError::ConnectionFailed(err.to_string())
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(err: tokio::task::JoinError) -> Self {
        SyncError::ChannelError(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the next scheduled attempt may succeed on its own.
    ///
    /// ## Retryable Errors
    /// - Connection failures and timeouts
    /// - 5xx responses from the primary
    /// - Local database hiccups
    ///
    /// ## Non-Retryable Errors
    /// - Configuration and authentication problems
    /// - Protocol mismatches
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::ConnectionFailed(_) | SyncError::Timeout(_) | SyncError::DatabaseError(_) => {
                true
            }
            SyncError::RemoteRejected { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingNodeId
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if the primary refused our credentials.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, SyncError::AuthFailed(_))
    }

    /// Returns true if this error indicates a protocol mismatch.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidMessage(_)
                | SyncError::SerializationFailed(_)
                | SyncError::DeserializationFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::ConnectionFailed("network error".into()).is_retryable());
        assert!(SyncError::Timeout(30).is_retryable());
        assert!(SyncError::RemoteRejected { status: 503, body: String::new() }.is_retryable());

        assert!(!SyncError::RemoteRejected { status: 422, body: String::new() }.is_retryable());
        assert!(!SyncError::InvalidConfig("bad config".into()).is_retryable());
        assert!(!SyncError::AuthFailed("bad secret".into()).is_retryable());
    }

    #[test]
    fn test_categories() {
        assert!(SyncError::MissingNodeId.is_config_error());
        assert!(SyncError::AuthFailed("x".into()).is_auth_error());
        assert!(SyncError::DeserializationFailed("x".into()).is_protocol_error());
        assert!(!SyncError::Timeout(1).is_protocol_error());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::RemoteRejected {
            status: 500,
            body: "boom".into(),
        };
        assert!(err.to_string().contains("500"));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_db_error_converts() {
        let err: SyncError = jukebox_db::DbError::not_found("albums", "a-1").into();
        assert!(matches!(err, SyncError::DatabaseError(_)));
    }
}
