//! Error types for decoding hub payloads.

use thiserror::Error;

/// Errors that can occur when decoding data pushed by a hub.
///
/// Platform-agnostic: BLE-specific failures live in railhub-core.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    /// Payload ended before a complete value could be read.
    #[error("Truncated payload: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
    /// Header byte names a value type the decoder does not know.
    #[error("Unknown value type {type_code} in header 0x{header:02x}")]
    UnknownType { header: u8, type_code: u8 },
    /// Value width is not valid for its type.
    #[error("Invalid size {size} for {kind} value")]
    InvalidSize { kind: &'static str, size: u8 },
    /// A decoded value did not have the shape the message requires.
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl ParseError {
    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData(message.into())
    }
}

/// Result type alias using railhub-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
