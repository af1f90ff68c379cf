//! Error types for record construction and line-protocol parsing.

use thiserror::Error;

/// Errors that can occur when building a record or parsing a buffered line.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// A record needs at least one field.
    #[error("Record '{0}' has no fields")]
    NoFields(String),

    /// A measurement, tag or field name is empty or contains a forbidden character.
    #[error("Invalid name '{0}': names must be non-empty and contain no backslash or newline")]
    InvalidName(String),

    /// A float field is NaN or infinite and cannot be written to the store.
    #[error("Field '{0}' is not a finite number")]
    NonFiniteField(String),

    /// A line does not have the `measurement fields timestamp` shape.
    #[error("Malformed line: {0}")]
    MalformedLine(String),

    /// A field value could not be parsed as an integer or float.
    #[error("Invalid field value '{value}' for field '{field}'")]
    InvalidFieldValue {
        /// The field the value belongs to.
        field: String,
        /// The raw value text.
        value: String,
    },

    /// The timestamp is not a valid nanosecond Unix timestamp.
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// Unknown sensor kind name.
    #[error("Unknown sensor kind: {0}")]
    UnknownSensorKind(String),
}
