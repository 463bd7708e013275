//! INDI error types
//!
//! `IndiError` covers everything a caller can run into through the public API.
//! `DecodeError` and `ReadError` belong to the wire codec: a decode error poisons
//! one fragment only, an I/O error ends the stream.

use crate::protocol::{IndiState, LeafKind};
use std::time::Duration;

/// INDI client errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum IndiError {
    /// Connection to INDI server failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    /// TCP connect did not complete in time
    #[error("Connection timeout: failed to connect to {host}:{port} after {duration:?}")]
    ConnectionTimeout {
        host: String,
        port: u16,
        duration: Duration,
    },
    /// Not connected to server
    #[error("Not connected to INDI server")]
    NotConnected,
    /// Command channel to the writer task closed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
    /// Writing a command to the socket failed
    #[error("Write failed: {0}")]
    WriteFailed(String),
    /// Initial property burst did not complete
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    /// Property not found
    #[error("Property not found: {device}.{property}")]
    PropertyNotFound { device: String, property: String },
    /// Element not found inside a vector
    #[error("Element not found: {device}.{property}.{element}")]
    ElementNotFound {
        device: String,
        property: String,
        element: String,
    },
    /// Leaf kind does not match the vector's declared kind
    #[error("Property '{property}' holds {actual} items, not {expected}")]
    KindMismatch {
        property: String,
        expected: LeafKind,
        actual: LeafKind,
    },
    /// Attempted to write to a read-only property
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    /// Attempted to write a kind clients never send (lights)
    #[error("Not writable: {0}")]
    NotWritable(String),
    /// Number outside the limits announced by the device
    #[error("Value {value} out of range [{min}, {max}] for {device}.{property}.{element}")]
    ValueOutOfRange {
        device: String,
        property: String,
        element: String,
        value: f64,
        min: f64,
        max: f64,
    },
    /// Vector stayed busy past the caller's deadline
    #[error("Property timeout for {device}.{property} after {duration:?}{}", state_suffix(.last_state))]
    OperationTimeout {
        device: String,
        property: String,
        duration: Duration,
        last_state: Option<IndiState>,
    },
    /// Vector went to Alert
    #[error("Device alert on {device}.{property}: {}", .message.as_deref().unwrap_or("no message"))]
    DeviceAlert {
        device: String,
        property: String,
        message: Option<String>,
    },
    /// Caller cancelled a pending operation; `property` is empty for device waits
    #[error("Operation on {device}{} cancelled", property_suffix(.property))]
    Cancelled { device: String, property: String },
    /// Device was not announced in time
    #[error("Device {device} not announced within {duration:?}")]
    DeviceTimeout { device: String, duration: Duration },
    /// Two items with the same name inside one vector
    #[error("Duplicate element '{element}' in property '{property}'")]
    DuplicateElement { property: String, element: String },
    /// XML serialization failed
    #[error("Encode error: {0}")]
    Encode(String),
}

fn property_suffix(property: &str) -> String {
    if property.is_empty() {
        String::new()
    } else {
        format!(".{}", property)
    }
}

fn state_suffix(state: &Option<IndiState>) -> String {
    state
        .map(|s| format!(" (last state: {})", s))
        .unwrap_or_default()
}

impl From<quick_xml::Error> for IndiError {
    fn from(err: quick_xml::Error) -> Self {
        IndiError::Encode(err.to_string())
    }
}

/// Result type for INDI operations
pub type IndiResult<T> = Result<T, IndiError>;

/// A fragment could not be turned into a message.
///
/// The reader has already skipped the rest of the offending element when one of
/// these is returned, so the next read starts at the next fragment.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("XML syntax error: {0}")]
    Xml(String),
    #[error("Unknown element <{0}>")]
    UnknownElement(String),
    #[error("<{element}> is missing attribute '{attribute}'")]
    MissingAttribute { element: String, attribute: String },
    #[error("Invalid number '{text}' in element '{element}'")]
    InvalidNumber { element: String, text: String },
    #[error("Invalid {kind} value '{text}' in element '{element}'")]
    InvalidValue {
        kind: LeafKind,
        element: String,
        text: String,
    },
    #[error("Duplicate element '{element}' in vector '{vector}'")]
    DuplicateElement { vector: String, element: String },
    #[error("BLOB '{element}' size mismatch: expected {expected} bytes, decoded {actual}")]
    BlobSizeMismatch {
        element: String,
        expected: usize,
        actual: usize,
    },
    #[error("Invalid base64 in BLOB: {0}")]
    InvalidBase64(String),
}

/// Error from the frame reader.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// The underlying stream failed; nothing more can be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// One fragment was malformed and has been skipped.
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl ReadError {
    /// Whether the stream is unusable after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReadError::Io(_))
    }
}
