//! Error types for evload
//!
//! One variant per failure kind the pipeline distinguishes, so callers can
//! decide between fatal-for-the-run, per-file, and per-record handling.

use thiserror::Error;

/// Result type alias for evload operations
pub type Result<T> = std::result::Result<T, EtlError>;

/// Main error type for evload
#[derive(Error, Debug)]
pub enum EtlError {
    /// File system operations failed (read, write, create directory, etc.)
    #[error("File operation failed: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("Failed to process JSON data: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration is missing or invalid. Fatal before any work starts.
    #[error("Configuration error: {message}. {suggestion}")]
    ConfigInvalid { message: String, suggestion: String },

    /// Listing the source URI failed. Fatal for the whole run.
    #[error("Source listing failed for '{uri}': {reason}")]
    SourceUnavailable { uri: String, reason: String },

    /// A single file could not be opened. Per-file failure.
    #[error("Could not open '{path}': {reason}")]
    FileOpenFailed { path: String, reason: String },

    /// The document is unparseable outside any record context. Per-file failure.
    #[error("XML document is not well-formed: {reason}")]
    XmlNotWellFormed { reason: String },

    /// One ICSR inside an otherwise well-formed batch is unusable.
    /// The record is skipped and counted; the file may still complete.
    #[error("Invalid ICSR record #{ordinal}: {reason}")]
    InvalidRecord { ordinal: usize, reason: String },

    /// XSD validation rejected the document. Per-file failure.
    #[error("XSD validation failed: {}", .messages.join("; "))]
    XsdValidationFailed { messages: Vec<String> },

    /// The database catalog does not match the expected table definitions.
    #[error("Database schema mismatch: {details}")]
    SchemaMismatch { details: String },

    /// Database operation failed (connection drop, deadlock, constraint).
    /// The per-file transaction rolls back and the file is marked failed.
    #[error("Database operation failed: {operation} - {reason}")]
    Database { operation: String, reason: String },
}

impl EtlError {
    /// Create a configuration error with a suggestion for the user
    pub fn config(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a source-unavailable error
    pub fn source_unavailable(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    /// Create a per-file open error
    pub fn file_open(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::FileOpenFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a batch-level well-formedness error
    pub fn not_well_formed(reason: impl Into<String>) -> Self {
        Self::XmlNotWellFormed {
            reason: reason.into(),
        }
    }

    /// Create a per-record error
    pub fn invalid_record(ordinal: usize, reason: impl Into<String>) -> Self {
        Self::InvalidRecord {
            ordinal,
            reason: reason.into(),
        }
    }

    /// Create a database error
    pub fn database(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Database {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a schema-mismatch error
    pub fn schema_mismatch(details: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            details: details.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EtlError::config("database DSN missing", "set database.dsn in config.yaml");
        assert!(err.to_string().contains("database DSN missing"));
        assert!(err.to_string().contains("config.yaml"));

        let err = EtlError::invalid_record(3, "missing required field: safetyreportid");
        assert_eq!(
            err.to_string(),
            "Invalid ICSR record #3: missing required field: safetyreportid"
        );
    }

    #[test]
    fn test_io_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: EtlError = io_err.into();
        assert!(matches!(err, EtlError::Io(_)));
    }
}
