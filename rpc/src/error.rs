//! Errors carried end-to-end between vats.

use std::fmt;

use caprpc_protocol::Exception;
use caprpc_protocol::ExceptionType;
use caprpc_protocol::ProtocolError;

pub type Result<T> = std::result::Result<T, Error>;

/// The four error kinds the protocol can transmit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Generic failure.
    Failed,
    /// Transient lack of capacity; retrying later may succeed.
    Overloaded,
    /// The peer or the transport went away.
    Disconnected,
    /// The peer does not implement the requested method or message.
    Unimplemented,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Failed => "failed",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::Disconnected => "disconnected",
            ErrorKind::Unimplemented => "unimplemented",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {description}")]
pub struct Error {
    pub kind: ErrorKind,
    pub description: String,
}

impl Error {
    pub fn new(kind: ErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }

    pub fn failed(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::Failed, description)
    }

    pub fn overloaded(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::Overloaded, description)
    }

    pub fn disconnected(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::Disconnected, description)
    }

    pub fn unimplemented(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unimplemented, description)
    }

    pub fn to_exception(&self) -> Exception {
        let kind = match self.kind {
            ErrorKind::Failed => ExceptionType::Failed,
            ErrorKind::Overloaded => ExceptionType::Overloaded,
            ErrorKind::Disconnected => ExceptionType::Disconnected,
            ErrorKind::Unimplemented => ExceptionType::Unimplemented,
        };
        Exception::new(kind, self.description.clone())
    }
}

impl From<Exception> for Error {
    fn from(exception: Exception) -> Self {
        let kind = match exception.kind {
            ExceptionType::Failed => ErrorKind::Failed,
            ExceptionType::Overloaded => ErrorKind::Overloaded,
            ExceptionType::Disconnected => ErrorKind::Disconnected,
            ExceptionType::Unimplemented => ErrorKind::Unimplemented,
        };
        Self::new(kind, exception.reason)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Self::failed(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::disconnected(err.to_string())
    }
}
