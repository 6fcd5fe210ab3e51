//! Error types for this crate.

use std::fmt::Display;

use futures_channel::oneshot;

/// A convenience type alias for a `Result` with an `Error` type.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in this crate.
#[derive(Debug, Clone)]
pub struct Error {
    data: ErrorData,
}

/// The kind of error that occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    /// The operation was submitted while the session could not accept it.
    NotReady,
    /// The transport did not answer before the operation's deadline.
    Timeout,
    /// The link dropped while the operation was queued or in flight.
    LinkLost,
    /// The operation was discarded by a disconnect.
    SessionClosing,
    /// Service or characteristic discovery failed.
    Discovery,
    /// The transport rejected a read, write, notify or RSSI request.
    Operation,
    /// The transport failed to establish the link.
    Connect,
    /// The completion handle was dropped before it was resolved.
    Canceled,
    /// An event stream lagged.
    Lagged,
}

#[derive(Debug, Clone)]
enum ErrorData {
    Transport { kind: ErrorKind, error: gatt::Error },
    Simple(ErrorKind),
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.data {
            ErrorData::Transport { kind, error } => write!(f, "{kind}: {error}"),
            ErrorData::Simple(kind) => kind.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.data {
            ErrorData::Transport { error, .. } => Some(error),
            ErrorData::Simple(_) => None,
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error {
            data: ErrorData::Simple(kind),
        }
    }
}

impl From<oneshot::Canceled> for Error {
    fn from(_value: oneshot::Canceled) -> Self {
        ErrorKind::Canceled.into()
    }
}

impl From<async_broadcast::RecvError> for Error {
    fn from(_value: async_broadcast::RecvError) -> Self {
        ErrorKind::Lagged.into()
    }
}

impl Error {
    /// Wraps a transport error that caused an operation of the given kind to fail.
    pub fn transport(kind: ErrorKind, error: gatt::Error) -> Self {
        Error {
            data: ErrorData::Transport { kind, error },
        }
    }

    /// If this error was caused by the transport, returns a reference to the underlying
    /// `gatt::Error`.
    pub fn get_ref(&self) -> Option<&gatt::Error> {
        match &self.data {
            ErrorData::Transport { error, .. } => Some(error),
            ErrorData::Simple(_) => None,
        }
    }

    /// If this error was caused by the transport, returns the underlying `gatt::Error`.
    pub fn into_inner(self) -> Option<gatt::Error> {
        match self.data {
            ErrorData::Transport { error, .. } => Some(error),
            ErrorData::Simple(_) => None,
        }
    }

    /// Returns the kind of error.
    pub fn kind(&self) -> ErrorKind {
        match &self.data {
            ErrorData::Transport { kind, .. } => *kind,
            ErrorData::Simple(kind) => *kind,
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::NotReady => f.write_str("session not ready"),
            ErrorKind::Timeout => f.write_str("operation timed out"),
            ErrorKind::LinkLost => f.write_str("link lost"),
            ErrorKind::SessionClosing => f.write_str("session closing"),
            ErrorKind::Discovery => f.write_str("discovery failed"),
            ErrorKind::Operation => f.write_str("operation rejected"),
            ErrorKind::Connect => f.write_str("connect failed"),
            ErrorKind::Canceled => f.write_str("canceled"),
            ErrorKind::Lagged => f.write_str("lagged"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use gatt::error::AttError;

    use super::*;

    #[test]
    fn transport_errors_keep_their_source() {
        let error = Error::transport(
            ErrorKind::Operation,
            gatt::Error::from(AttError::READ_NOT_PERMITTED),
        );
        assert_eq!(error.kind(), ErrorKind::Operation);
        assert_eq!(error.to_string(), "operation rejected: read not permitted");
        assert!(error.source().is_some());
        assert_eq!(
            error.into_inner().map(|e| e.kind()),
            Some(gatt::ErrorKind::Att(AttError::READ_NOT_PERMITTED))
        );
    }

    #[test]
    fn simple_errors_have_no_source() {
        let error = Error::from(ErrorKind::LinkLost);
        assert!(error.get_ref().is_none());
        assert_eq!(error.to_string(), "link lost");
    }

    #[test]
    fn canceled_handle_maps_to_canceled() {
        let (sender, receiver) = oneshot::channel::<()>();
        drop(sender);
        let error = futures_lite::future::block_on(receiver).map_err(Error::from);
        assert_eq!(error.unwrap_err().kind(), ErrorKind::Canceled);
    }
}
