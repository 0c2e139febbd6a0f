//! Input validation for explora
//!
//! Validates collection names and dotted field paths before they are
//! used as cache keys, file names or backend field references.

use thiserror::Error;

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid identifier '{0}': {1}")]
    InvalidIdentifier(String, &'static str),

    #[error("Identifier '{0}' is too long (max {1} characters)")]
    TooLong(String, usize),

    #[error("Identifier cannot be empty")]
    Empty,

    #[error("Reserved name: '{0}'")]
    Reserved(String),

    #[error("Invalid field path '{0}': {1}")]
    InvalidPath(String, &'static str),
}

/// Maximum length for identifiers
pub const MAX_IDENTIFIER_LENGTH: usize = 255;

/// Reserved names that cannot be used as collection names
const RESERVED_NAMES: &[&str] = &[".", "..", "_all", "_search", "_mapping", "_describe"];

/// Validate a collection name
///
/// Rules:
/// - Must be 1-255 characters
/// - Only alphanumeric, underscore, and hyphen allowed
/// - Cannot start with a hyphen or underscore
/// - Cannot be a reserved name (case-insensitive)
pub fn validate_collection_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::Empty);
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(ValidationError::TooLong(name.to_string(), MAX_IDENTIFIER_LENGTH));
    }

    if RESERVED_NAMES.contains(&name.to_lowercase().as_str()) {
        return Err(ValidationError::Reserved(name.to_string()));
    }

    for (i, c) in name.chars().enumerate() {
        if !c.is_ascii_alphanumeric() && c != '_' && c != '-' {
            return Err(ValidationError::InvalidIdentifier(
                name.to_string(),
                "contains invalid characters (only alphanumeric, underscore, and hyphen allowed)",
            ));
        }
        // Cannot start with hyphen or underscore
        if i == 0 && (c == '-' || c == '_') {
            return Err(ValidationError::InvalidIdentifier(
                name.to_string(),
                "cannot start with hyphen or underscore",
            ));
        }
    }

    Ok(())
}

/// Validate a dotted field path such as `geo.centroid`
pub fn validate_field_path(path: &str) -> Result<(), ValidationError> {
    if path.is_empty() {
        return Err(ValidationError::Empty);
    }

    if path.len() > MAX_IDENTIFIER_LENGTH {
        return Err(ValidationError::TooLong(path.to_string(), MAX_IDENTIFIER_LENGTH));
    }

    if path.split('.').any(str::is_empty) {
        return Err(ValidationError::InvalidPath(
            path.to_string(),
            "contains an empty segment",
        ));
    }

    if path.chars().any(|c| c.is_whitespace() || c == ':' || c == ',') {
        return Err(ValidationError::InvalidPath(
            path.to_string(),
            "contains whitespace, ':' or ','",
        ));
    }

    Ok(())
}
