//! Error types for explora
//!
//! Every failure maps to a stable [`ErrorKind`] and code so that the
//! protocol layers can render a consistent response.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for explora operations
#[derive(Debug, Error)]
pub enum Error {
    // ==========================================================================
    // Collection Errors
    // ==========================================================================
    #[error("Collection '{name}' not found")]
    CollectionNotFound { name: String },

    #[error("Collection '{name}' is not available for this caller")]
    CollectionUnavailable { name: String },

    #[error("Index or template '{index}' backing the collection does not exist")]
    IndexNotFound { index: String },

    // ==========================================================================
    // Field Errors
    // ==========================================================================
    #[error("Field '{field}' not found in collection '{collection}'")]
    FieldNotFound { collection: String, field: String },

    // ==========================================================================
    // Request Errors
    // ==========================================================================
    #[error("Bad request: {message}")]
    BadRequest { message: String },

    #[error("Invalid parameter: {message}")]
    InvalidParameter { message: String },

    #[error("Invalid {kind} '{value}': {reason}")]
    InvalidIdentifier {
        kind: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("Query parse error: {message}")]
    ParseError { message: String },

    // ==========================================================================
    // Backend Errors
    // ==========================================================================
    #[error("Backend error: {message}")]
    Backend { message: String },

    #[error("Partitioned query failed: {message}")]
    Partition { message: String },

    // ==========================================================================
    // Descriptor Store Errors
    // ==========================================================================
    #[error("Failed to read '{path}': {source}")]
    StoreReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write '{path}': {source}")]
    StoreWriteError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML: {message}")]
    YamlParseError { message: String },

    // ==========================================================================
    // Configuration
    // ==========================================================================
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    // ==========================================================================
    // Catch-all
    // ==========================================================================
    #[error("{0}")]
    Other(String),
}

/// Result type alias for explora operations
pub type Result<T> = std::result::Result<T, Error>;

/// Stable failure classes surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    BadRequest,
    InvalidParameter,
    CollectionUnavailable,
    Internal,
}

impl Error {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Error::BadRequest {
            message: message.into(),
        }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Error::InvalidParameter {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CollectionNotFound { .. }
            | Error::IndexNotFound { .. }
            | Error::FieldNotFound { .. } => ErrorKind::NotFound,
            Error::CollectionUnavailable { .. } => ErrorKind::CollectionUnavailable,
            Error::BadRequest { .. }
            | Error::InvalidIdentifier { .. }
            | Error::ParseError { .. } => ErrorKind::BadRequest,
            Error::InvalidParameter { .. } => ErrorKind::InvalidParameter,
            Error::Backend { .. }
            | Error::Partition { .. }
            | Error::StoreReadError { .. }
            | Error::StoreWriteError { .. }
            | Error::YamlParseError { .. }
            | Error::Config { .. }
            | Error::Other(_) => ErrorKind::Internal,
        }
    }

    /// Stable code paired with the message
    pub fn code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::BadRequest => "BAD_REQUEST",
            ErrorKind::InvalidParameter => "INVALID_PARAMETER",
            ErrorKind::CollectionUnavailable => "COLLECTION_UNAVAILABLE",
            ErrorKind::Internal => "INTERNAL",
        }
    }

    /// Returns a user-friendly suggestion for fixing the error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::CollectionNotFound { .. } => {
                Some("Register the collection first, or check its name")
            }
            Error::IndexNotFound { .. } => {
                Some("Create the index (or alias) before registering the collection")
            }
            Error::FieldNotFound { .. } => Some("Describe the collection to list its fields"),
            Error::InvalidIdentifier { .. } => {
                Some("Use only letters, numbers, underscores, and hyphens")
            }
            Error::ParseError { .. } => Some("Filters use the form field:op:value"),
            _ => None,
        }
    }
}

// =============================================================================
// Conversions from external error types
// =============================================================================

impl From<exql::ParseError> for Error {
    fn from(err: exql::ParseError) -> Self {
        Error::ParseError {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::YamlParseError {
            message: err.to_string(),
        }
    }
}

impl From<crate::storage::BackendError> for Error {
    fn from(err: crate::storage::BackendError) -> Self {
        use crate::storage::BackendError;
        match err {
            BackendError::NonNumericField { field } => Error::InvalidParameter {
                message: format!("'{}' is not a numeric field", field),
            },
            BackendError::IndexNotFound { index } => Error::IndexNotFound { index },
            other => Error::Backend {
                message: other.to_string(),
            },
        }
    }
}

impl From<crate::validation::ValidationError> for Error {
    fn from(err: crate::validation::ValidationError) -> Self {
        use crate::validation::ValidationError;
        match err {
            ValidationError::InvalidIdentifier(value, reason) => Error::InvalidIdentifier {
                kind: "identifier",
                value,
                reason,
            },
            ValidationError::TooLong(value, _max) => Error::InvalidIdentifier {
                kind: "identifier",
                value,
                reason: "exceeds maximum length",
            },
            ValidationError::Empty => Error::InvalidIdentifier {
                kind: "identifier",
                value: String::new(),
                reason: "cannot be empty",
            },
            ValidationError::Reserved(name) => Error::InvalidIdentifier {
                kind: "identifier",
                value: name,
                reason: "is a reserved name",
            },
            ValidationError::InvalidPath(value, reason) => Error::InvalidIdentifier {
                kind: "field path",
                value,
                reason,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::CollectionNotFound {
            name: "vessels".to_string(),
        };
        assert_eq!(err.to_string(), "Collection 'vessels' not found");
    }

    #[test]
    fn test_error_kinds_are_distinct() {
        let missing = Error::CollectionNotFound { name: "a".into() };
        let hidden = Error::CollectionUnavailable { name: "a".into() };
        assert_eq!(missing.kind(), ErrorKind::NotFound);
        assert_eq!(hidden.kind(), ErrorKind::CollectionUnavailable);
        assert_ne!(missing.code(), hidden.code());
    }

    #[test]
    fn test_non_numeric_backend_error_is_invalid_parameter() {
        let err: Error = crate::storage::BackendError::NonNumericField {
            field: "name".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    }

    #[test]
    fn test_error_suggestion() {
        let err = Error::CollectionNotFound {
            name: "vessels".to_string(),
        };
        assert!(err.suggestion().is_some());
    }
}
