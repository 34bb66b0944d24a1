// src/error.rs
use std::fmt;
use std::io;

use crate::http;

/// Central error taxonomy for the verso engine.
///
/// Handlers and the I/O layer report one of these kinds; the HTTP status a
/// client sees is derived only at the response boundary via
/// [`VersoError::http_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersoError {
    /// System resources are not sufficient to handle the request.
    Memory,
    /// Invalid input data.
    Input,
    /// Request requires access rights that are not available.
    Access,
    /// An entity required for the operation is missing.
    Missing,
    /// Unable to create a necessary entity because it exists.
    Exist,
    /// Filesystem internal error.
    Evfs,
    /// Temporary condition caused the operation to fail.
    Again,
    /// An unsupported feature is required to satisfy the request.
    Unsupported,
    /// Read error.
    Read,
    /// Write error.
    Write,
    /// The action was cancelled.
    Cancel,
    /// An asynchronous operation is now in progress; the handler has taken
    /// over transmission and no further response must be generated.
    Progress,
    /// Unable to resolve a domain.
    Resolve,
    /// Network operation failed; no response can be sent.
    Network,
    /// An upstream server returned an invalid response.
    Gateway,
    /// Invalid session.
    Session,
    /// An HTTP status decided while interpreting the request (parse errors,
    /// unsatisfiable ranges and the like).
    Status(u16),
    /// Unclassified error.
    Unknown,
}

impl VersoError {
    /// Maps the error to the HTTP status code sent to the client.
    /// `None` means no response is possible (the connection is torn down)
    /// or that the handler already transmitted one.
    pub fn http_status(self) -> Option<u16> {
        match self {
            VersoError::Status(code) => Some(code),
            VersoError::Memory | VersoError::Again => Some(http::SERVICE_UNAVAILABLE),
            VersoError::Access | VersoError::Session => Some(http::FORBIDDEN),
            VersoError::Input
            | VersoError::Exist
            | VersoError::Missing
            | VersoError::Read
            | VersoError::Write
            | VersoError::Resolve => Some(http::NOT_FOUND),
            VersoError::Unsupported => Some(http::NOT_IMPLEMENTED),
            VersoError::Gateway => Some(http::BAD_GATEWAY),
            VersoError::Cancel => Some(http::OK),
            VersoError::Evfs | VersoError::Unknown => Some(http::INTERNAL_SERVER_ERROR),
            VersoError::Progress | VersoError::Network => None,
        }
    }

    /// Whether the connection must be closed after the response is sent.
    pub fn forces_close(self) -> bool {
        matches!(self, VersoError::Gateway | VersoError::Cancel)
    }
}

impl fmt::Display for VersoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersoError::Memory => write!(f, "insufficient system resources"),
            VersoError::Input => write!(f, "invalid input data"),
            VersoError::Access => write!(f, "access denied"),
            VersoError::Missing => write!(f, "required entity is missing"),
            VersoError::Exist => write!(f, "entity already exists"),
            VersoError::Evfs => write!(f, "filesystem error"),
            VersoError::Again => write!(f, "temporary failure"),
            VersoError::Unsupported => write!(f, "unsupported feature"),
            VersoError::Read => write!(f, "read error"),
            VersoError::Write => write!(f, "write error"),
            VersoError::Cancel => write!(f, "action cancelled"),
            VersoError::Progress => write!(f, "operation in progress"),
            VersoError::Resolve => write!(f, "unable to resolve domain"),
            VersoError::Network => write!(f, "network operation failed"),
            VersoError::Gateway => write!(f, "invalid upstream response"),
            VersoError::Session => write!(f, "invalid session"),
            VersoError::Status(code) => write!(f, "http error {}", code),
            VersoError::Unknown => write!(f, "unknown error"),
        }
    }
}

impl std::error::Error for VersoError {}

impl From<io::Error> for VersoError {
    fn from(e: io::Error) -> Self {
        match e.raw_os_error() {
            Some(errno) => errno_error(errno),
            None => VersoError::Unknown,
        }
    }
}

/// Classifies a raw OS errno value into the error taxonomy.
pub fn errno_error(errno: i32) -> VersoError {
    match errno {
        libc::ENOMEM | libc::EMFILE | libc::ENFILE | libc::EDQUOT | libc::ENOBUFS => {
            VersoError::Memory
        }
        libc::EACCES | libc::EPERM => VersoError::Access,
        libc::EEXIST | libc::EADDRINUSE => VersoError::Exist,
        libc::ELOOP | libc::ENAMETOOLONG | libc::ENOENT | libc::ENOTDIR => VersoError::Missing,
        libc::EFAULT | libc::EINVAL | libc::EBADF | libc::ENOTSOCK => VersoError::Input,
        libc::ETIMEDOUT | libc::EINTR | libc::EAGAIN => VersoError::Again,
        libc::EIO | libc::ENOSPC | libc::EBUSY | libc::ENOTEMPTY => VersoError::Evfs,
        libc::EPIPE => VersoError::Write,
        libc::EAFNOSUPPORT | libc::EPROTONOSUPPORT | libc::EPROTOTYPE | libc::EXDEV => {
            VersoError::Unsupported
        }
        libc::EHOSTUNREACH
        | libc::ENETDOWN
        | libc::ENETUNREACH
        | libc::ECONNREFUSED
        | libc::ECONNRESET => VersoError::Network,
        libc::EINPROGRESS => VersoError::Progress,
        _ => VersoError::Unknown,
    }
}

pub type VersoResult<T> = Result<T, VersoError>;
