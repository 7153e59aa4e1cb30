//! Postgres Frontend Messages
//!
//! All struct fields here mirror the actual message sent to postgres.
use bytes::{BufMut, BytesMut};

use super::{CANCEL_REQUEST_CODE, PROTOCOL_VERSION, PgFormat, ProtocolError, SSL_REQUEST_CODE};
use crate::ext::{BufMutExt, nul_str_len};

/// write a frontend message to `buf`
///
/// The frame length must fit the protocol's signed 32-bit length field;
/// an oversized message is an encoder failure and breaks the session.
pub fn write<F: FrontendProtocol>(msg: F, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    // msgtype + length
    const PREFIX: usize = 1 + 4;

    let size = msg.size_hint();
    let Ok(len) = i32::try_from(size + 4) else {
        return Err(ProtocolError::Oversize { size, limit: i32::MAX as usize });
    };

    buf.reserve(PREFIX + size);
    let offset = buf.len();
    buf.put_u8(F::MSGTYPE);
    buf.put_i32(len);

    msg.encode(&mut *buf);

    assert_eq!(
        buf.len() - offset,
        PREFIX + size,
        "[BUG] Frontend Message body not equal to size hint"
    );
    Ok(())
}

/// A type which can be encoded into a postgres frontend message
///
/// For historical reasons, the very first messages sent by the client
/// ([`Startup`], [`SslRequest`], [`CancelRequest`]) have no initial
/// message-type byte and do not implement [`FrontendProtocol`].
pub trait FrontendProtocol {
    /// message type
    const MSGTYPE: u8;

    /// size of the main body in bytes
    ///
    /// note that this is *only* the size of the main body as oppose of actual postgres message
    fn size_hint(&self) -> usize;

    /// write the main body of the message
    ///
    /// writing less or past `size_hint` results in panic
    fn encode(self, buf: impl BufMut);
}

/// Postgres Startup frontend message
///
/// The startup message has no message-type byte, thus it does not implement
/// [`FrontendProtocol`].
#[derive(Debug)]
pub struct Startup<'a> {
    /// The database user name to connect as. Required; there is no default.
    pub user: &'a str,
    /// The database to connect to. Defaults to the user name.
    pub database: Option<&'a str>,
    /// Reported to the server and shown in `pg_stat_activity`.
    pub application_name: Option<&'a str>,
    /// Initial schema search path.
    pub search_path: Option<&'a str>,
    /// Disable ssl renegotiation, not understood by redshift.
    pub ssl_renegotiation_limit: Option<u32>,
}

impl Startup<'_> {
    pub fn write(self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let offset = buf.len();

        // Length of message contents in bytes, including self.
        // reserve 4 bytes for length
        buf.put_i32(0);

        // The most significant 16 bits are the major version number (3 for the protocol described here).
        // The least significant 16 bits are the minor version number (0 for the protocol described here).
        buf.put_i32(PROTOCOL_VERSION);

        // The protocol version number is followed by one or more pairs of
        // parameter name and value strings.

        buf.put_nul_str("user");
        buf.put_nul_str(self.user);

        if let Some(db) = self.database {
            buf.put_nul_str("database");
            buf.put_nul_str(db);
        }

        if let Some(name) = self.application_name {
            buf.put_nul_str("application_name");
            buf.put_nul_str(name);
        }

        if let Some(path) = self.search_path {
            buf.put_nul_str("search_path");
            buf.put_nul_str(path);
        }

        if let Some(limit) = self.ssl_renegotiation_limit {
            let mut b = itoa::Buffer::new();
            buf.put_nul_str("ssl_renegotiation_limit");
            buf.put_nul_str(b.format(limit));
        }

        // A zero byte is required as a terminator after the last name/value pair.
        buf.put_u8(b'\0');

        // write the length over the reserved bytes
        let written = buf.len() - offset;
        let Ok(len) = i32::try_from(written) else {
            return Err(ProtocolError::Oversize { size: written, limit: i32::MAX as usize });
        };
        (&mut buf[offset..]).put_i32(len);

        Ok(())
    }
}

/// The SSL negotiation preamble, sent before any startup packet.
#[derive(Debug)]
pub struct SslRequest;

impl SslRequest {
    pub fn write(self, buf: &mut BytesMut) {
        buf.put_i32(8);
        buf.put_i32(SSL_REQUEST_CODE);
    }
}

/// Out of band query cancellation, sent on its own connection with no
/// startup and no authentication.
#[derive(Debug)]
pub struct CancelRequest {
    /// The process ID of the target backend.
    pub process_id: u32,
    /// The secret key for the target backend.
    pub secret_key: u32,
}

impl CancelRequest {
    pub fn write(self, buf: &mut BytesMut) {
        buf.put_i32(16);
        buf.put_i32(CANCEL_REQUEST_CODE);
        buf.put_u32(self.process_id);
        buf.put_u32(self.secret_key);
    }
}

/// Identifies the message as a password response
#[derive(Debug)]
pub struct PasswordMessage<'a> {
    /// The password (encrypted, if requested)
    pub password: &'a str,
}

impl FrontendProtocol for PasswordMessage<'_> {
    const MSGTYPE: u8 = b'p';

    fn size_hint(&self) -> usize {
        nul_str_len(self.password)
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_str(self.password);
    }
}

/// A GSSAPI or SSPI token, sent in response to a continuation request.
///
/// Same message type as [`PasswordMessage`], but the token is raw bytes
/// with no nul terminator.
#[derive(Debug)]
pub struct GssResponse<'a> {
    pub token: &'a [u8],
}

impl FrontendProtocol for GssResponse<'_> {
    const MSGTYPE: u8 = b'p';

    fn size_hint(&self) -> usize {
        self.token.len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_slice(self.token);
    }
}

/// Identifies the message as a simple query
pub struct Query<'a> {
    /// the query string itself
    pub sql: &'a str,
}

impl FrontendProtocol for Query<'_> {
    const MSGTYPE: u8 = b'Q';

    fn size_hint(&self) -> usize {
        nul_str_len(self.sql)
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_str(self.sql);
    }
}

/// Identifies the message as a Parse command
pub struct Parse<'a, I> {
    /// prepared statement name (an empty string selects the unnamed prepared statement).
    pub prepare_name: &'a str,
    /// The query string to be parsed.
    pub sql: &'a str,
    /// The number of parameter data types specified (can be zero).
    ///
    /// Note that this is not an indication of the number of parameters that might appear in the query string,
    /// only the number that the frontend wants to prespecify types for.
    pub oids_len: u16,
    /// Specifies the object ID of the parameter data type.
    ///
    /// Placing a zero here is equivalent to leaving the type unspecified.
    pub oids: I,
}

impl<I> FrontendProtocol for Parse<'_, I>
where
    I: IntoIterator<Item = u32>,
{
    const MSGTYPE: u8 = b'P';

    fn size_hint(&self) -> usize {
        nul_str_len(self.prepare_name)
            + nul_str_len(self.sql)
            + 2
            + self.oids_len as usize * 4
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_str(self.prepare_name);
        buf.put_nul_str(self.sql);
        buf.put_u16(self.oids_len);
        for oid in self.oids {
            buf.put_u32(oid);
        }
    }
}

/// Identifies the message as a Bind command.
///
/// Parameter values arrive here already encoded; the core does not know
/// about host types.
pub struct Bind<'a, ParamFmts, Params, ResultFmts> {
    /// The name of the destination portal (an empty string selects the unnamed portal).
    pub portal_name: &'a str,
    /// The name of the source prepared statement (an empty string selects the unnamed prepared statement).
    pub stmt_name: &'a str,

    /// The number of parameter format codes that follow.
    ///
    /// This can be zero to indicate that there are no parameters or that the parameters
    /// all use the default format (text); or one, in which case the specified format code
    /// is applied to all parameters; or it can equal the actual number of parameters.
    pub param_formats_len: u16,

    /// The parameter [`PgFormat`].
    pub param_formats: ParamFmts,

    /// The number of parameter values that follow (possibly zero).
    ///
    /// This must match the number of parameters needed by the query.
    pub params_len: u16,

    /// Total encoded size of the parameter section, length prefixes included.
    ///
    /// `size_hint` cannot consume the `params` iterator, so the caller
    /// precomputes this.
    pub params_size_hint: usize,

    /// The parameter values; `None` is sent as the NULL special case (-1).
    pub params: Params,

    /// The number of result-column format codes that follow.
    ///
    /// This can be zero to indicate that there are no result columns or that the result
    /// columns should all use the default format (text); or one, in which case the
    /// specified format code is applied to all result columns (if any); or it can equal
    /// the actual number of result columns of the query.
    pub result_formats_len: u16,

    /// The result-columns [`PgFormat`].
    pub result_formats: ResultFmts,
}

impl<'a, ParamFmts, Params, ResultFmts> FrontendProtocol for Bind<'a, ParamFmts, Params, ResultFmts>
where
    ParamFmts: IntoIterator<Item = PgFormat>,
    Params: IntoIterator<Item = Option<&'a [u8]>>,
    ResultFmts: IntoIterator<Item = PgFormat>,
{
    const MSGTYPE: u8 = b'B';

    fn size_hint(&self) -> usize {
        nul_str_len(self.portal_name)
            + nul_str_len(self.stmt_name)
            + 2
            + self.param_formats_len as usize * 2
            + 2
            + self.params_size_hint
            + 2
            + self.result_formats_len as usize * 2
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_str(self.portal_name);
        buf.put_nul_str(self.stmt_name);

        buf.put_u16(self.param_formats_len);
        for format in self.param_formats {
            buf.put_u16(format.format_code());
        }

        buf.put_u16(self.params_len);
        for param in self.params {
            match param {
                // The length of the parameter value (this count does not include itself).
                // As a special case, -1 indicates a NULL parameter value.
                // No value bytes follow in the NULL case.
                None => buf.put_i32(-1),
                Some(value) => {
                    buf.put_i32(value.len() as i32);
                    buf.put_slice(value);
                }
            }
        }

        buf.put_u16(self.result_formats_len);
        for format in self.result_formats {
            buf.put_u16(format.format_code());
        }
    }
}

/// Identifies the message as a Describe command.
pub struct Describe<'a> {
    /// 'S' to describe a prepared statement; or 'P' to describe a portal.
    pub kind: u8,
    /// The name of the prepared statement or portal to describe
    /// (an empty string selects the unnamed prepared statement or portal).
    pub name: &'a str,
}

impl FrontendProtocol for Describe<'_> {
    const MSGTYPE: u8 = b'D';

    fn size_hint(&self) -> usize {
        1 + nul_str_len(self.name)
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(self.kind);
        buf.put_nul_str(self.name);
    }
}

/// Identifies the message as a Execute command
pub struct Execute<'a> {
    /// The name of the portal to execute (an empty string selects the unnamed portal).
    pub portal_name: &'a str,
    /// Maximum number of rows to return, if portal contains a query that returns rows
    /// (ignored otherwise). Zero denotes “no limit”.
    pub max_row: u32,
}

impl FrontendProtocol for Execute<'_> {
    const MSGTYPE: u8 = b'E';

    fn size_hint(&self) -> usize {
        nul_str_len(self.portal_name) + 4
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_str(self.portal_name);
        buf.put_u32(self.max_row);
    }
}

/// Identifies the message as a Close command
pub struct Close<'a> {
    /// 'S' to close a prepared statement; or 'P' to close a portal.
    pub variant: u8,
    /// The name of the prepared statement or portal to close
    /// (an empty string selects the unnamed prepared statement or portal).
    pub name: &'a str,
}

impl FrontendProtocol for Close<'_> {
    const MSGTYPE: u8 = b'C';

    fn size_hint(&self) -> usize {
        1 + nul_str_len(self.name)
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(self.variant);
        buf.put_nul_str(self.name);
    }
}

/// COPY data transfer, frontend to backend during copy-in.
///
/// Large payloads bypass this message and go straight to the stream, see
/// the connection copy surface.
pub struct CopyData<'a> {
    pub data: &'a [u8],
}

impl FrontendProtocol for CopyData<'_> {
    const MSGTYPE: u8 = b'd';

    fn size_hint(&self) -> usize {
        self.data.len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_slice(self.data);
    }
}

/// Identifies the message as a COPY failure indicator.
pub struct CopyFail<'a> {
    /// An error message to report as the cause of failure.
    pub message: &'a str,
}

impl FrontendProtocol for CopyFail<'_> {
    const MSGTYPE: u8 = b'f';

    fn size_hint(&self) -> usize {
        nul_str_len(self.message)
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_str(self.message);
    }
}

macro_rules! unit_msg {
    ($(
        $(#[$doc:meta])* struct $name:ident, $ty:literal;
    )*) => {$(
        $(#[$doc])*
        pub struct $name;

        impl FrontendProtocol for $name {
            const MSGTYPE: u8 = $ty;

            fn size_hint(&self) -> usize { 0 }

            fn encode(self, _: impl BufMut) { }
        }
    )*};
}

unit_msg! {
    /// Identifies the message as a Flush command
    struct Flush, b'H';

    /// Identifies the message as a Sync command
    struct Sync, b'S';

    /// Identifies the message as a COPY-complete indicator.
    struct CopyDone, b'c';

    /// Identifies the message as a termination
    struct Terminate, b'X';
}
