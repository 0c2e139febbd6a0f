//! Error types for EXQL parsing

use thiserror::Error;

/// Error that occurred during parsing
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Parse error: {message}{}", position_suffix(.position))]
pub struct ParseError {
    pub message: String,
    pub position: Option<usize>,
}

fn position_suffix(position: &Option<usize>) -> String {
    position
        .map(|pos| format!(" at position {}", pos))
        .unwrap_or_default()
}

impl ParseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            position: None,
        }
    }

    pub fn with_position(mut self, pos: usize) -> Self {
        self.position = Some(pos);
        self
    }

    /// Build an error from a nom failure, locating it inside `source`
    pub(crate) fn from_nom(source: &str, err: nom::Err<nom::error::Error<&str>>) -> Self {
        match err {
            nom::Err::Incomplete(_) => ParseError::new(format!("Incomplete input: '{}'", source)),
            nom::Err::Error(e) | nom::Err::Failure(e) => {
                let near: String = e.input.chars().take(20).collect();
                let err = if near.is_empty() {
                    ParseError::new(format!("Unexpected end of '{}'", source))
                } else {
                    ParseError::new(format!("Unexpected input near '{}' in '{}'", near, source))
                };
                err.with_position(source.len() - e.input.len())
            }
        }
    }
}
