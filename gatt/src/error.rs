//! Errors reported by a [`Transport`](crate::Transport).

use std::fmt::Display;
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, Error>;

/// An error reported by the radio transport for one primitive.
#[derive(Debug, Clone)]
pub struct Error {
    data: ErrorData,
}

/// The kind of transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    /// The peer answered with an ATT error response.
    Att(AttError),
    /// The device is not connected.
    NotConnected,
    /// The connection could not be established.
    ConnectionFailed,
    /// The link layer supervision timer expired.
    ConnectionTimeout,
    /// The peripheral dropped the connection.
    PeripheralDisconnected,
    /// The transport does not support the requested primitive.
    OperationNotSupported,
    /// The transport cancelled the primitive.
    OperationCancelled,
    /// The request was malformed, for example an unknown attribute.
    InvalidParameters,
    /// The radio is off or otherwise unavailable.
    AdapterUnavailable,
    /// An unknown or other error.
    Other,
}

#[derive(Debug, Clone)]
enum ErrorData {
    Custom { kind: ErrorKind, message: Arc<str> },
    Simple(ErrorKind),
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.data {
            ErrorData::Custom { kind, message } => write!(f, "{kind}: {message}"),
            ErrorData::Simple(kind) => kind.fmt(f),
        }
    }
}

impl std::error::Error for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error {
            data: ErrorData::Simple(kind),
        }
    }
}

impl From<AttError> for Error {
    fn from(error: AttError) -> Self {
        ErrorKind::Att(error).into()
    }
}

impl Error {
    /// Creates an error of the given kind with a transport-specific message.
    pub fn new(kind: ErrorKind, message: impl Into<Arc<str>>) -> Self {
        Error {
            data: ErrorData::Custom {
                kind,
                message: message.into(),
            },
        }
    }

    /// Returns the transport-specific message, if one was attached.
    pub fn message(&self) -> Option<&str> {
        match &self.data {
            ErrorData::Custom { message, .. } => Some(message),
            ErrorData::Simple(_) => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match &self.data {
            ErrorData::Custom { kind, .. } => *kind,
            ErrorData::Simple(kind) => *kind,
        }
    }
}

/// An ATT protocol error code (Core Specification Vol 3, Part F, 3.4.1.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttError(pub u8);

impl AttError {
    pub const INVALID_HANDLE: AttError = AttError(0x01);
    pub const READ_NOT_PERMITTED: AttError = AttError(0x02);
    pub const WRITE_NOT_PERMITTED: AttError = AttError(0x03);
    pub const INVALID_PDU: AttError = AttError(0x04);
    pub const INSUFFICIENT_AUTHENTICATION: AttError = AttError(0x05);
    pub const REQUEST_NOT_SUPPORTED: AttError = AttError(0x06);
    pub const INVALID_OFFSET: AttError = AttError(0x07);
    pub const INSUFFICIENT_AUTHORIZATION: AttError = AttError(0x08);
    pub const PREPARE_QUEUE_FULL: AttError = AttError(0x09);
    pub const ATTRIBUTE_NOT_FOUND: AttError = AttError(0x0a);
    pub const ATTRIBUTE_NOT_LONG: AttError = AttError(0x0b);
    pub const INSUFFICIENT_ENCRYPTION_KEY_SIZE: AttError = AttError(0x0c);
    pub const INVALID_ATTRIBUTE_VALUE_LENGTH: AttError = AttError(0x0d);
    pub const UNLIKELY_ERROR: AttError = AttError(0x0e);
    pub const INSUFFICIENT_ENCRYPTION: AttError = AttError(0x0f);
    pub const UNSUPPORTED_GROUP_TYPE: AttError = AttError(0x10);
    pub const INSUFFICIENT_RESOURCES: AttError = AttError(0x11);
}

impl Display for AttError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            AttError::INVALID_HANDLE => f.write_str("invalid handle"),
            AttError::READ_NOT_PERMITTED => f.write_str("read not permitted"),
            AttError::WRITE_NOT_PERMITTED => f.write_str("write not permitted"),
            AttError::INVALID_PDU => f.write_str("invalid PDU"),
            AttError::INSUFFICIENT_AUTHENTICATION => f.write_str("insufficient authentication"),
            AttError::REQUEST_NOT_SUPPORTED => f.write_str("request not supported"),
            AttError::INVALID_OFFSET => f.write_str("invalid offset"),
            AttError::INSUFFICIENT_AUTHORIZATION => f.write_str("insufficient authorization"),
            AttError::PREPARE_QUEUE_FULL => f.write_str("prepare queue full"),
            AttError::ATTRIBUTE_NOT_FOUND => f.write_str("attribute not found"),
            AttError::ATTRIBUTE_NOT_LONG => f.write_str("attribute not long"),
            AttError::INSUFFICIENT_ENCRYPTION_KEY_SIZE => {
                f.write_str("insufficient encryption key size")
            }
            AttError::INVALID_ATTRIBUTE_VALUE_LENGTH => {
                f.write_str("invalid attribute value length")
            }
            AttError::UNLIKELY_ERROR => f.write_str("unlikely error"),
            AttError::INSUFFICIENT_ENCRYPTION => f.write_str("insufficient encryption"),
            AttError::UNSUPPORTED_GROUP_TYPE => f.write_str("unsupported group type"),
            AttError::INSUFFICIENT_RESOURCES => f.write_str("insufficient resources"),
            AttError(code @ 0x80..=0x9f) => write!(f, "application error ({code:#04x})"),
            AttError(code) => write!(f, "unknown ATT error ({code:#04x})"),
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Att(att_error) => att_error.fmt(f),
            ErrorKind::NotConnected => f.write_str("not connected"),
            ErrorKind::ConnectionFailed => f.write_str("connection failed"),
            ErrorKind::ConnectionTimeout => f.write_str("connection timeout"),
            ErrorKind::PeripheralDisconnected => f.write_str("peripheral disconnected"),
            ErrorKind::OperationNotSupported => f.write_str("operation not supported"),
            ErrorKind::OperationCancelled => f.write_str("operation cancelled"),
            ErrorKind::InvalidParameters => f.write_str("invalid parameters"),
            ErrorKind::AdapterUnavailable => f.write_str("adapter unavailable"),
            ErrorKind::Other => f.write_str("other error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn att_error_display() {
        assert_eq!(AttError::READ_NOT_PERMITTED.to_string(), "read not permitted");
        assert_eq!(AttError(0x81).to_string(), "application error (0x81)");
        assert_eq!(AttError(0x42).to_string(), "unknown ATT error (0x42)");
    }

    #[test]
    fn custom_error_keeps_kind_and_message() {
        let error = Error::new(ErrorKind::ConnectionFailed, "radio busy");
        assert_eq!(error.kind(), ErrorKind::ConnectionFailed);
        assert_eq!(error.message(), Some("radio busy"));
        assert_eq!(error.to_string(), "connection failed: radio busy");
    }

    #[test]
    fn simple_error_from_att() {
        let error = Error::from(AttError::WRITE_NOT_PERMITTED);
        assert_eq!(error.kind(), ErrorKind::Att(AttError::WRITE_NOT_PERMITTED));
        assert_eq!(error.message(), None);
    }
}
