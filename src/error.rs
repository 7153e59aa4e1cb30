//! `postwire` error types.
use std::{
    backtrace::{Backtrace, BacktraceStatus},
    fmt, io,
};

use crate::{
    connection::{ParseError, StateError},
    connection::startup::AuthError,
    net::TimeoutError,
    protocol::{ProtocolError, backend::ErrorResponse},
};

/// A specialized [`Result`] type for `postwire` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Any failure raised by this library.
///
/// Carries the failure [`kind`][Error::kind], an optional operation context,
/// and the backtrace captured where the error entered the crate.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    fn new(kind: ErrorKind) -> Self {
        Self {
            context: String::new(),
            backtrace: Backtrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// Whether this error left the connection broken.
    ///
    /// Server errors and wrong-state usage errors leave the session usable;
    /// everything else is fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(self.kind, ErrorKind::Database(_) | ErrorKind::State(_))
    }

    pub(crate) fn ctx(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }
}

/// The failure classes of a session.
#[derive(Debug)]
pub enum ErrorKind {
    /// Malformed connection string or option value.
    Config(ParseError),
    /// Wire level protocol violation, the session is broken.
    Protocol(ProtocolError),
    /// Transport failure, the session is broken.
    Io(io::Error),
    /// `ErrorResponse` raised by the server, the session stays usable.
    Database(ErrorResponse),
    /// Authentication could not complete.
    Auth(AuthError),
    /// The connect budget ran out during DNS or TCP establishment.
    Timeout(TimeoutError),
    /// Operation attempted in the wrong connection state.
    State(StateError),
}

macro_rules! impl_from {
    ($($source:ty => $kind:ident,)*) => {$(
        impl From<$source> for Error {
            fn from(err: $source) -> Error {
                Error::new(ErrorKind::$kind(err))
            }
        }
    )*};
}

impl_from! {
    ParseError => Config,
    ProtocolError => Protocol,
    io::Error => Io,
    ErrorResponse => Database,
    AuthError => Auth,
    TimeoutError => Timeout,
    StateError => State,
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error::new(kind)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Config(e) => Some(e),
            ErrorKind::Protocol(e) => Some(e),
            ErrorKind::Io(e) => Some(e),
            ErrorKind::Database(e) => Some(e),
            ErrorKind::Auth(e) => Some(e),
            ErrorKind::Timeout(e) => Some(e),
            ErrorKind::State(e) => Some(e),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }
        self.kind.fmt(f)?;
        if matches!(self.backtrace.status(), BacktraceStatus::Captured) {
            write!(f, "\n\nstack backtrace:\n{}", self.backtrace)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("Error");
        dbg.field("kind", &self.kind);
        if !self.context.is_empty() {
            dbg.field("context", &self.context);
        }
        dbg.finish()
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Protocol(e) => write!(f, "protocol violation: {e}"),
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Database(e) => e.fmt(f),
            Self::Auth(e) => e.fmt(f),
            Self::Timeout(e) => e.fmt(f),
            Self::State(e) => e.fmt(f),
        }
    }
}
