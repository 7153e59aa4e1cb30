//! The authentication request sub-dialog.
use bytes::{Buf, Bytes};

use super::{BackendProtocol, ProtocolError};

/// Identifies the message as an authentication request.
#[derive(Debug)]
pub enum Authentication {
    /// Specifies that the authentication was successful.
    Ok,
    /// Specifies that Kerberos V5 authentication is required.
    KerberosV5,
    /// Specifies that a clear-text password is required.
    CleartextPassword,
    /// Specifies that an MD5-encrypted password is required.
    MD5Password {
        /// The salt to use when encrypting the password.
        salt: [u8; 4],
    },
    /// Specifies that GSSAPI authentication is required.
    GSS,
    /// GSSAPI or SSPI authentication data.
    GSSContinue {
        data: Bytes,
    },
    /// Specifies that SSPI authentication is required.
    SSPI,
    /// Specifies that SASL authentication is required.
    SASL {
        /// List of SASL authentication mechanisms, in the server's order of
        /// preference, each nul terminated, with a trailing nul terminator.
        mechanisms: Bytes,
    },
    /// Specifies that this message contains a SASL challenge.
    SASLContinue {
        /// SASL data, specific to the SASL mechanism being used.
        data: Bytes,
    },
    /// Specifies that SASL authentication has completed.
    SASLFinal {
        /// SASL outcome "additional data", specific to the SASL mechanism being used.
        data: Bytes,
    },
}

impl Authentication {
    pub const MSGTYPE: u8 = b'R';

    /// Name of the request kind, for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ok => "AuthenticationOk",
            Self::KerberosV5 => "AuthenticationKerberosV5",
            Self::CleartextPassword => "AuthenticationCleartextPassword",
            Self::MD5Password { .. } => "AuthenticationMD5Password",
            Self::GSS => "AuthenticationGSS",
            Self::GSSContinue { .. } => "AuthenticationGSSContinue",
            Self::SSPI => "AuthenticationSSPI",
            Self::SASL { .. } => "AuthenticationSASL",
            Self::SASLContinue { .. } => "AuthenticationSASLContinue",
            Self::SASLFinal { .. } => "AuthenticationSASLFinal",
        }
    }
}

impl BackendProtocol for Authentication {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        if Self::MSGTYPE != msgtype {
            return Err(ProtocolError::unexpected(Self::MSGTYPE, msgtype));
        }
        let auth = match body.get_u32() {
            0 => Authentication::Ok,
            2 => Authentication::KerberosV5,
            3 => Authentication::CleartextPassword,
            5 => Authentication::MD5Password { salt: body.get_u32().to_be_bytes() },
            7 => Authentication::GSS,
            8 => Authentication::GSSContinue { data: body },
            9 => Authentication::SSPI,
            10 => Authentication::SASL { mechanisms: body },
            11 => Authentication::SASLContinue { data: body },
            12 => Authentication::SASLFinal { data: body },
            auth => return Err(ProtocolError::unknown_auth(auth)),
        };
        Ok(auth)
    }
}

/// Integrated GSSAPI/SSPI authentication backend.
///
/// The session driver does not depend on a particular OS security API;
/// a provider is registered on the config and driven through this trait
/// during the authentication sub-dialog.
pub trait GssProvider {
    /// Begin a context against `host`, for the given kerberos service name.
    ///
    /// Returns the first token to send to the server.
    fn initialize(&mut self, host: &str, service: &str) -> Result<Vec<u8>, GssError>;

    /// Feed a server token into the context.
    ///
    /// Returns the next token to send, or `None` when the client side of the
    /// handshake is complete.
    fn step(&mut self, token: &[u8]) -> Result<Option<Vec<u8>>, GssError>;
}

/// Failure inside a [`GssProvider`].
pub struct GssError {
    message: String,
}

impl GssError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl std::error::Error for GssError { }

impl std::fmt::Display for GssError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "integrated authentication failed: {}", self.message)
    }
}

impl std::fmt::Debug for GssError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decode_md5_salt() {
        let mut body = Vec::new();
        body.extend_from_slice(&5u32.to_be_bytes());
        body.extend_from_slice(&[1, 2, 3, 4]);
        let auth = Authentication::decode(b'R', Bytes::copy_from_slice(&body)).unwrap();
        match auth {
            Authentication::MD5Password { salt } => assert_eq!(salt, [1, 2, 3, 4]),
            a => panic!("wrong variant {}", a.name()),
        }
    }

    #[test]
    fn unknown_auth_kind() {
        let body = Bytes::copy_from_slice(&999u32.to_be_bytes());
        assert!(Authentication::decode(b'R', body).is_err());
    }
}
