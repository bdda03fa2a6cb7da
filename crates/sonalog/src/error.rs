//! Error types for sonalog.
//!
//! This module defines all error types used throughout the sonalog crate,
//! providing detailed context for debugging and user-facing messages.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for sonalog operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Storage Errors ===
    /// Failed to open or create the database.
    #[error("failed to open database at {path}: {source}")]
    DatabaseOpen {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A database query failed.
    #[error("database query failed: {0}")]
    DatabaseQuery(#[from] rusqlite::Error),

    /// Failed to run database migrations.
    #[error("database migration failed: {message}")]
    DatabaseMigration {
        /// Description of what went wrong.
        message: String,
    },

    /// A write would exceed the storage quota.
    #[error("storage quota exceeded: {needed} bytes needed, {quota} bytes allowed")]
    QuotaExceeded {
        /// Bytes the store would hold after the write.
        needed: u64,
        /// Configured quota in bytes (0 when reported by the database itself).
        quota: u64,
    },

    /// Stored or imported data does not have the expected shape.
    #[error("malformed input in {context}: {message}")]
    MalformedInput {
        /// Where the bad data came from (bucket name, file, payload).
        context: String,
        /// Description of the problem.
        message: String,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === Location Errors ===
    /// The user or platform refused access to the device position.
    #[error("location permission denied: {message}")]
    PermissionDenied {
        /// Description of the refusal.
        message: String,
    },

    /// No position could be determined.
    #[error("location unavailable: {message}")]
    Unavailable {
        /// Description of what went wrong.
        message: String,
    },

    // === Family Channel Errors ===
    /// The family backend could not be reached or rejected a request.
    #[error("transport failure: {message}")]
    TransportFailure {
        /// Description of what went wrong.
        message: String,
    },

    /// An operation needed a family session but none is active.
    #[error("not joined to a family group")]
    NotJoined,

    /// A family code did not have the expected format.
    #[error("invalid family code '{code}': expected 6 letters or digits")]
    InvalidFamilyCode {
        /// The rejected code.
        code: String,
    },

    // === Domain Errors ===
    /// User-supplied data failed validation.
    #[error("invalid {field}: {message}")]
    Validation {
        /// Name of the offending field.
        field: &'static str,
        /// Description of the validation failure.
        message: String,
    },

    /// A record with the given id does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of record.
        kind: &'static str,
        /// The id that was looked up.
        id: String,
    },

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An operation timed out.
    #[error("operation timed out: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
    },

    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for sonalog operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                operation: err
                    .url()
                    .map_or_else(|| "HTTP request".to_string(), ToString::to_string),
            }
        } else {
            Self::TransportFailure {
                message: err.to_string(),
            }
        }
    }
}

impl Error {
    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create a malformed input error.
    #[must_use]
    pub fn malformed(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedInput {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Create a transport failure error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::TransportFailure {
            message: message.into(),
        }
    }

    /// Create a location permission error.
    #[must_use]
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            message: message.into(),
        }
    }

    /// Create a location unavailable error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Create a validation error for a named field.
    #[must_use]
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    /// Create a timeout error.
    #[must_use]
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Check if this error came from the family backend transport.
    #[must_use]
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, Self::TransportFailure { .. })
    }

    /// Check if this error is one of the location acquisition failures.
    #[must_use]
    pub fn is_location_error(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied { .. } | Self::Unavailable { .. } | Self::Timeout { .. }
        )
    }

    /// Check if this error is a storage quota failure.
    #[must_use]
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }

    /// Check if this error indicates malformed stored or imported data.
    #[must_use]
    pub fn is_malformed_input(&self) -> bool {
        matches!(self, Self::MalformedInput { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(Error::NotJoined.to_string(), "not joined to a family group");

        let err = Error::transport("connection refused");
        assert_eq!(err.to_string(), "transport failure: connection refused");
    }

    #[test]
    fn test_is_transport_failure() {
        assert!(Error::transport("down").is_transport_failure());
        assert!(!Error::NotJoined.is_transport_failure());
    }

    #[test]
    fn test_is_location_error() {
        assert!(Error::permission_denied("denied").is_location_error());
        assert!(Error::unavailable("no fix").is_location_error());
        assert!(Error::timeout("gpsd").is_location_error());
        assert!(!Error::internal("bug").is_location_error());
    }

    #[test]
    fn test_quota_exceeded_display() {
        let err = Error::QuotaExceeded {
            needed: 6_000_000,
            quota: 5_242_880,
        };
        assert!(err.is_quota_exceeded());
        let msg = err.to_string();
        assert!(msg.contains("6000000"));
        assert!(msg.contains("5242880"));
    }

    #[test]
    fn test_malformed_input_display() {
        let err = Error::malformed("bucket 'inventory'", "missing field `name`");
        assert!(err.is_malformed_input());
        let msg = err.to_string();
        assert!(msg.contains("inventory"));
        assert!(msg.contains("missing field"));
    }

    #[test]
    fn test_validation_error_display() {
        let err = Error::validation("quantity", "must be at least 1");
        assert_eq!(err.to_string(), "invalid quantity: must be at least 1");
    }

    #[test]
    fn test_not_found_display() {
        let err = Error::NotFound {
            kind: "item",
            id: "abc".to_string(),
        };
        assert_eq!(err.to_string(), "item not found: abc");
    }

    #[test]
    fn test_invalid_family_code_display() {
        let err = Error::InvalidFamilyCode {
            code: "ab".to_string(),
        };
        assert!(err.to_string().contains("'ab'"));
    }

    #[test]
    fn test_internal_error() {
        let err = Error::internal("something went wrong");
        assert_eq!(err.to_string(), "internal error: something went wrong");
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_from_rusqlite_error() {
        let result = rusqlite::Connection::open_with_flags(
            "/nonexistent/path/db.sqlite",
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        );
        if let Err(sqlite_err) = result {
            let err: Error = sqlite_err.into();
            assert!(matches!(err, Error::DatabaseQuery(_)));
        }
    }

    #[test]
    fn test_from_json_error() {
        let json_result: std::result::Result<i32, serde_json::Error> =
            serde_json::from_str("not valid json");
        if let Err(json_err) = json_result {
            let err: Error = json_err.into();
            assert!(matches!(err, Error::Json(_)));
        }
    }

    #[test]
    fn test_database_migration_error_display() {
        let err = Error::DatabaseMigration {
            message: "version mismatch".to_string(),
        };
        assert!(err.to_string().contains("version mismatch"));
    }

    #[test]
    fn test_config_validation_error_display() {
        let err = Error::ConfigValidation {
            message: "invalid interval".to_string(),
        };
        assert!(err.to_string().contains("invalid interval"));
    }

    #[test]
    fn test_directory_create_error_display() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err = Error::DirectoryCreate {
            path: PathBuf::from("/root/forbidden"),
            source: io_err,
        };
        assert!(err.to_string().contains("/root/forbidden"));
    }
}
