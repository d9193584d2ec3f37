/*!
Error types for the Spool core library.
*/

use thiserror::Error;

/// Result type used throughout the Spool core.
pub type Result<T> = std::result::Result<T, SpoolError>;

/// Errors that can occur while staging, scheduling or uploading payloads.
#[derive(Error, Debug)]
pub enum SpoolError {
    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Disk storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// The staging area would exceed its allowed size
    #[error("Storage capacity exceeded: {used} bytes used, {incoming} incoming, limit {limit}")]
    CapacityExceeded { used: u64, incoming: u64, limit: u64 },

    /// A storage key component is empty or escapes the storage root
    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    /// Compression/decompression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Payload encoding errors
    #[error("Encoding error: {0}")]
    Encode(String),

    /// The background transport refused or lost a task
    #[error("Transport error: {0}")]
    Transport(String),

    /// A request descriptor could not be decoded from task metadata
    #[error("Invalid request descriptor: {0}")]
    InvalidDescriptor(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
}

impl SpoolError {
    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Create a new encoding error
    pub fn encode<S: Into<String>>(msg: S) -> Self {
        Self::Encode(msg.into())
    }

    /// Create a new transport error
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a new invalid descriptor error
    pub fn invalid_descriptor<S: Into<String>>(msg: S) -> Self {
        Self::InvalidDescriptor(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }
}
