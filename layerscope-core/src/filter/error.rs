//! Error types for filter compilation.

use thiserror::Error;

/// Errors that can occur while compiling a filter expression.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FilterError {
    /// Parse error with context
    #[error("Parse error: {message}")]
    ParseError { message: String },

    /// Malformed literal
    #[error("Invalid literal: {0}")]
    InvalidLiteral(String),

    /// Empty filter
    #[error("Empty filter expression")]
    EmptyFilter,

    /// Too many nested `not` operators or parentheses
    #[error("Filter nests deeper than {limit} levels")]
    TooDeep { limit: usize },
}

impl FilterError {
    /// Create a parse error with a message.
    pub fn parse_error(message: impl Into<String>) -> Self {
        FilterError::ParseError {
            message: message.into(),
        }
    }
}
