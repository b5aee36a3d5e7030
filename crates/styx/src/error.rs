//! Error representation of the library.

use std::{fmt, io};

/// Errno values the core emits on the wire in ".u" mode.
///
/// These are wire constants, pinned here so the protocol does not drift
/// with the host libc.
pub mod errno {
    /// Operation not permitted
    pub const EPERM: u32 = 1;
    /// No such file or directory
    pub const ENOENT: u32 = 2;
    /// I/O error
    pub const EIO: u32 = 5;
    /// Not a directory
    pub const ENOTDIR: u32 = 20;
    /// Invalid argument
    pub const EINVAL: u32 = 22;
}

/// Canonical message strings for the errno values above.
pub mod string {
    pub const EPERM: &str = "permission denied";
    pub const ENOENT: &str = "file not found";
    pub const EIO: &str = "i/o error";
    pub const ENOTDIR: &str = "not a directory";
    pub const EINVAL: &str = "invalid argument";

    /// Look up the canonical message for an errno, falling back to EIO's.
    pub fn of(errno: u32) -> &'static str {
        match errno {
            super::errno::EPERM => EPERM,
            super::errno::ENOENT => ENOENT,
            super::errno::ENOTDIR => ENOTDIR,
            super::errno::EINVAL => EINVAL,
            _ => EIO,
        }
    }
}

/// The error type used throughout the library.
///
/// The first two variants are fatal for their connection and are latched
/// there: every in-flight and subsequent request observes them. The rest
/// only concern the call that produced them.
#[derive(Debug)]
pub enum Error {
    /// Read/write failed or the connection closed underneath us.
    Transport(io::Error),
    /// Malformed frame or a reply that violates the protocol.
    Protocol(String),
    /// The peer answered with Rerror; carries the server's message and,
    /// on ".u" connections, its errno.
    Remote { ename: String, errno: u32 },
    /// The caller violated a precondition before anything hit the wire.
    Argument(String),
    /// A fid was used in a state the operation does not allow.
    State(String),
    /// The request was abandoned by a successful TFlush.
    Flushed,
}

impl Error {
    /// A `Remote` error with the canonical message for `errno`.
    pub fn no(errno: u32) -> Error {
        Error::Remote {
            ename: string::of(errno).to_owned(),
            errno,
        }
    }

    /// A `Remote` error with an explicit message.
    pub fn remote(ename: impl Into<String>, errno: u32) -> Error {
        Error::Remote {
            ename: ename.into(),
            errno,
        }
    }

    /// The errno this error travels with in an Rerror.
    pub fn errno(&self) -> u32 {
        match *self {
            Error::Remote { errno, .. } => errno,
            Error::Transport(_) | Error::Flushed => errno::EIO,
            Error::Protocol(_) | Error::Argument(_) | Error::State(_) => errno::EINVAL,
        }
    }

    /// Whether this error takes the whole connection down with it.
    pub fn is_fatal(&self) -> bool {
        matches!(*self, Error::Transport(_) | Error::Protocol(_))
    }
}

// Needed for failing every waiter on a connection with the one latched
// error. io::Error is not Clone, so the transport case is rebuilt from
// its kind and message.
impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::Transport(e) => Error::Transport(io::Error::new(e.kind(), e.to_string())),
            Error::Protocol(m) => Error::Protocol(m.clone()),
            Error::Remote { ename, errno } => Error::Remote {
                ename: ename.clone(),
                errno: *errno,
            },
            Error::Argument(m) => Error::Argument(m.clone()),
            Error::State(m) => Error::State(m.clone()),
            Error::Flushed => Error::Flushed,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport(e) => write!(f, "transport: {e}"),
            Error::Protocol(m) => write!(f, "protocol: {m}"),
            Error::Remote { ename, .. } => write!(f, "{ename}"),
            Error::Argument(m) => write!(f, "{m}"),
            Error::State(m) => write!(f, "{m}"),
            Error::Flushed => write!(f, "request flushed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Transport(e)
    }
}
