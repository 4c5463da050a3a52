//! Error types for the acquisition and timing pipeline.
//!
//! All errors implement `std::error::Error` and carry enough structured context
//! for a caller to decide whether to retry. Nothing in the pipeline escalates
//! these to a crash: the worst outcome is degraded functionality.
//!
//! ## Error Categories
//!
//! - **Layout Errors**: the session layout document has no usable sector list
//! - **Parse Errors**: a document could not be deserialized
//! - **Store Errors**: the remote session/lap store rejected or missed a call
//! - **File Errors**: local artifact writes failed
//! - **Connection Errors**: the telemetry source is not available
//! - **Config Errors**: configuration values failed validation
//! - **Queue Errors**: a bounded queue was full or its peer went away
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use laptrace::TelemetryError;
//!
//! let error = TelemetryError::connection_failed("simulator not running");
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T, E = TelemetryError> = std::result::Result<T, E>;

/// Reasons a session layout document is rejected.
///
/// Returned by [`SectorTimingEngine::update_layout`](crate::timing::SectorTimingEngine::update_layout).
/// The engine keeps its prior layout and timing state whenever one of these is returned.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum LayoutError {
    #[error("layout document is empty")]
    Empty,

    #[error("layout document could not be parsed: {details}")]
    Malformed { details: String },

    #[error("layout document has no sector list")]
    MissingSectors,

    #[error("sector {index} has start fraction {start} outside [0, 1]")]
    OutOfRange { index: usize, start: f64 },

    #[error("sector {index} starts at {start}, not after the previous sector at {previous}")]
    NotIncreasing { index: usize, start: f64, previous: f64 },
}

/// Errors surfaced by a [`SessionStore`](crate::session::SessionStore) implementation.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum StoreError {
    #[error("session store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("session store rejected {operation}: {reason}")]
    Rejected { operation: String, reason: String },

    #[error("{entity} not found in session store")]
    NotFound { entity: String },
}

impl StoreError {
    /// Helper constructor for an unreachable store.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        StoreError::Unavailable { reason: reason.into() }
    }

    /// Helper constructor for a rejected write.
    pub fn rejected(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        StoreError::Rejected { operation: operation.into(), reason: reason.into() }
    }

    /// Only an unreachable store is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. })
    }
}

/// Main error type for pipeline operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TelemetryError {
    #[error("Sector layout rejected: {0}")]
    Layout(#[from] LayoutError),

    #[error("Parse error in {context}: {details}")]
    Parse { context: String, details: String },

    #[error("Session store error during {operation}")]
    Store {
        operation: String,
        #[source]
        source: StoreError,
    },

    #[error("Artifact file error: {path}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Telemetry source unavailable: {reason}")]
    Connection {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Invalid configuration: {details}")]
    Config { details: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Queue '{queue}' is full (capacity {capacity})")]
    QueueFull { queue: &'static str, capacity: usize },

    #[error("Channel '{channel}' closed")]
    ChannelClosed { channel: &'static str },
}

impl TelemetryError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            TelemetryError::Store { source, .. } => source.is_retryable(),
            TelemetryError::Connection { .. } => true,
            TelemetryError::Timeout { .. } => true,
            TelemetryError::QueueFull { .. } => true,
            TelemetryError::File { .. } => true,
            TelemetryError::Layout(_) => false,
            TelemetryError::Parse { .. } => false,
            TelemetryError::Config { .. } => false,
            TelemetryError::ChannelClosed { .. } => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            TelemetryError::Layout(_) => vec![
                "Wait for the simulator to publish a complete session document",
                "Check that the track defines split-time sectors",
            ],
            TelemetryError::Parse { .. } => vec![
                "Check data format compatibility",
                "Verify source data integrity",
            ],
            TelemetryError::Store { .. } => vec![
                "Check network connectivity to the session store",
                "Laps are retained locally and retried on the next lap",
            ],
            TelemetryError::File { .. } => vec![
                "Check the artifact directory exists and is writable",
                "Ensure sufficient disk space",
            ],
            TelemetryError::Connection { .. } => vec![
                "Ensure the simulator is running and in a session",
                "Reconnection is attempted automatically with backoff",
            ],
            TelemetryError::Config { .. } => vec![
                "Review the configuration file against the documented defaults",
            ],
            TelemetryError::Timeout { .. } => vec![
                "Increase the timeout duration",
                "Check system performance",
            ],
            TelemetryError::QueueFull { .. } => vec![
                "Increase the work queue capacity",
                "Check that consumer workers are keeping up",
            ],
            TelemetryError::ChannelClosed { .. } => vec![
                "The pipeline is shutting down; restart it to resume capture",
            ],
        }
    }

    /// Helper constructor for file errors with path context.
    pub fn file_error(path: PathBuf, source: std::io::Error) -> Self {
        TelemetryError::File { path, source }
    }

    /// Helper constructor for connection errors.
    pub fn connection_failed(reason: impl Into<String>) -> Self {
        TelemetryError::Connection { reason: reason.into(), source: None }
    }

    /// Helper constructor for store errors with the failed operation name.
    pub fn store(operation: impl Into<String>, source: StoreError) -> Self {
        TelemetryError::Store { operation: operation.into(), source }
    }

    /// Helper constructor for configuration errors.
    pub fn config(details: impl Into<String>) -> Self {
        TelemetryError::Config { details: details.into() }
    }

    /// Helper constructor for parse errors.
    pub fn parse(context: impl Into<String>, details: impl Into<String>) -> Self {
        TelemetryError::Parse { context: context.into(), details: details.into() }
    }
}

impl From<std::io::Error> for TelemetryError {
    fn from(err: std::io::Error) -> Self {
        TelemetryError::File { path: PathBuf::from("<unknown>"), source: err }
    }
}

impl From<serde_json::Error> for TelemetryError {
    fn from(err: serde_json::Error) -> Self {
        TelemetryError::Parse { context: "JSON".to_string(), details: err.to_string() }
    }
}

impl From<serde_yaml_ng::Error> for TelemetryError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        TelemetryError::Parse { context: "YAML".to_string(), details: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn error_messages_keep_their_context(
            reason in ".*",
            operation in "[a-z_]+",
            index in 0usize..32,
            start in -10.0f64..10.0,
        ) {
            let connection = TelemetryError::connection_failed(reason.clone());
            prop_assert!(connection.to_string().contains(&reason));

            let store =
                TelemetryError::store(operation.clone(), StoreError::unavailable(reason.clone()));
            prop_assert!(store.to_string().contains(&operation));

            let layout: TelemetryError = LayoutError::OutOfRange { index, start }.into();
            prop_assert!(layout.to_string().contains(&index.to_string()));
        }
    }

    #[test]
    fn retry_classification_follows_taxonomy() {
        assert!(TelemetryError::connection_failed("down").is_retryable());
        let offline = TelemetryError::store("create_lap", StoreError::unavailable("offline"));
        assert!(offline.is_retryable());
        assert!(
            !TelemetryError::store("create_lap", StoreError::rejected("create_lap", "bad row"))
                .is_retryable()
        );
        assert!(!TelemetryError::from(LayoutError::MissingSectors).is_retryable());
        assert!(!TelemetryError::config("target_hz must be positive").is_retryable());
        assert!(TelemetryError::QueueFull { queue: "work", capacity: 8 }.is_retryable());
    }

    #[test]
    fn every_variant_has_suggestions() {
        let errors = vec![
            TelemetryError::from(LayoutError::Empty),
            TelemetryError::parse("layout", "bad"),
            TelemetryError::store("find_session", StoreError::unavailable("x")),
            TelemetryError::file_error(PathBuf::from("/tmp/x"), std::io::Error::other("x")),
            TelemetryError::connection_failed("x"),
            TelemetryError::config("x"),
            TelemetryError::Timeout { duration: Duration::from_secs(1) },
            TelemetryError::QueueFull { queue: "work", capacity: 1 },
            TelemetryError::ChannelClosed { channel: "persist" },
        ];
        for error in errors {
            assert!(!error.recovery_suggestions().is_empty(), "{error}");
        }
    }

    #[test]
    fn store_error_is_kept_as_source() {
        let error = TelemetryError::store("create_session", StoreError::unavailable("timeout"));
        let source = std::error::Error::source(&error).expect("source");
        assert!(source.to_string().contains("timeout"));
    }

    #[test]
    fn error_traits_validation() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<TelemetryError>();
        assert_send_sync_static::<LayoutError>();
        assert_send_sync_static::<StoreError>();
    }
}
