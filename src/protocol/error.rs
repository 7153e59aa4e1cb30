use std::fmt;

/// Wire level violation of the frontend/backend protocol.
///
/// Any `ProtocolError` raised while reading or writing breaks the session.
pub enum ProtocolError {
    Unexpected {
        expect: Option<u8>,
        found: u8,
        phase: Option<&'static str>,
    },
    UnknownAuth {
        auth: u32,
    },
    MissingNul {
        msg: &'static str,
    },
    NonUtf8 {
        msg: &'static str,
    },
    Oversize {
        size: usize,
        limit: usize,
    },
    InvalidLength {
        len: i32,
    },
}

impl ProtocolError {
    pub(crate) fn unknown(found: u8) -> ProtocolError {
        Self::Unexpected { expect: None, found, phase: None }
    }

    pub(crate) fn unexpected(expect: u8, found: u8) -> ProtocolError {
        Self::Unexpected { expect: Some(expect), found, phase: None }
    }

    pub(crate) fn unexpected_phase(found: u8, phase: &'static str) -> ProtocolError {
        Self::Unexpected { expect: None, found, phase: Some(phase) }
    }

    pub(crate) fn unknown_auth(auth: u32) -> ProtocolError {
        Self::UnknownAuth { auth }
    }

    pub(crate) fn missing_nul(msg: &'static str) -> ProtocolError {
        Self::MissingNul { msg }
    }

    pub(crate) fn non_utf8(msg: &'static str) -> ProtocolError {
        Self::NonUtf8 { msg }
    }
}

/// Format a message type code, most are printable ascii.
struct Code(u8);

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_ascii_graphic() {
            write!(f, "'{}' (0x{:02x})", self.0 as char, self.0)
        } else {
            write!(f, "0x{:02x}", self.0)
        }
    }
}

impl std::error::Error for ProtocolError { }

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unexpected { expect, found, phase } => {
                match expect {
                    Some(e) => write!(f, "expected message {}, found {}", Code(*e), Code(*found))?,
                    None => write!(f, "unexpected message {}", Code(*found))?,
                }
                if let Some(phase) = phase {
                    write!(f, " in {phase}")?;
                }
                Ok(())
            }
            Self::UnknownAuth { auth } => write!(f, "unknown authentication request {auth}"),
            Self::MissingNul { msg } => write!(f, "string in {msg} is not nul terminated"),
            Self::NonUtf8 { msg } => write!(f, "non UTF-8 string in {msg}"),
            Self::Oversize { size, limit } => {
                write!(f, "message of {size} bytes exceeds the {limit} byte limit")
            }
            Self::InvalidLength { len } => write!(f, "invalid message length {len}"),
        }
    }
}

impl fmt::Debug for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
