//! The startup sequence and its authentication sub-dialog.
use std::fmt;

use crate::{
    Result, verbose,
    protocol::{
        BackendProtocol, ProtocolError,
        authentication::{Authentication, GssError, GssProvider},
        backend,
        frontend,
    },
};

use super::{ConnState, Connection};

/// Drive the session from a fresh transport to ReadyForQuery.
///
/// Writes the startup packet, answers authentication requests, and records
/// the parameter statuses and cancellation key data the backend sends before
/// its first ReadyForQuery.
pub(crate) async fn startup(conn: &mut Connection) -> Result<()> {
    let config = conn.config.clone();

    // To begin a session, a frontend opens a connection to the server
    // and sends a startup message.
    frontend::Startup {
        user: &config.user,
        database: Some(config.effective_database()),
        application_name: config.application_name.as_deref(),
        search_path: config.search_path.as_deref(),
        // redshift closes the session when it sees this setting
        ssl_renegotiation_limit: match config.compat {
            super::CompatMode::None => Some(0),
            super::CompatMode::Redshift => None,
        },
    }
    .write(conn.io.write_buf_mut())?;

    let written = conn.io.write_buf_mut().len();
    if written > config.buffer_size {
        return Err(ProtocolError::Oversize { size: written, limit: config.buffer_size }.into());
    }

    conn.io.flush().await?;

    // The server then sends an appropriate authentication request message,
    // to which the frontend must reply with an appropriate authentication
    // response message (such as a password). For GSSAPI, SSPI and SASL,
    // multiple exchanges of packets may be needed.
    let mut gss: Option<Box<dyn GssProvider + Send>> = None;

    loop {
        let (msgtype, body) = conn.io.read_msg().await?;
        match msgtype {
            Authentication::MSGTYPE => {
                match Authentication::decode(msgtype, body)? {
                    Authentication::Ok => {}
                    Authentication::CleartextPassword => {
                        // The frontend must now send a PasswordMessage
                        // containing the password in clear-text form.
                        conn.io.send(frontend::PasswordMessage { password: &config.pass })?;
                        conn.io.flush().await?;
                    }
                    Authentication::MD5Password { salt } => {
                        let hashed = md5_password(&config.user, &config.pass, salt);
                        conn.io.send(frontend::PasswordMessage { password: &hashed })?;
                        conn.io.flush().await?;
                    }
                    auth @ (Authentication::GSS | Authentication::SSPI) => {
                        if !config.integrated_security {
                            return Err(AuthError::unsupported(auth.name()).into());
                        }
                        let Some(factory) = &config.gss else {
                            return Err(AuthError::no_provider().into());
                        };
                        let provider = gss.insert(factory());
                        let token = provider
                            .initialize(&config.host, &config.krbsrvname)
                            .map_err(AuthError::gss)?;
                        conn.io.send(frontend::GssResponse { token: &token })?;
                        conn.io.flush().await?;
                    }
                    Authentication::GSSContinue { data } => {
                        let Some(provider) = gss.as_mut() else {
                            return Err(ProtocolError::unexpected_phase(
                                Authentication::MSGTYPE,
                                "GSS continuation without a context",
                            )
                            .into());
                        };
                        // an empty reply means the client side is done
                        if let Some(token) = provider.step(&data).map_err(AuthError::gss)? {
                            if !token.is_empty() {
                                conn.io.send(frontend::GssResponse { token: &token })?;
                                conn.io.flush().await?;
                            }
                        }
                    }
                    auth => return Err(AuthError::unsupported(auth.name()).into()),
                }
            }
            // the server reports startup failures immediately and closes
            // the socket without a ReadyForQuery
            backend::ErrorResponse::MSGTYPE => {
                let err = backend::ErrorResponse::decode(msgtype, body)?;
                return Err(crate::Error::from(err).ctx("startup failed"));
            }
            backend::ParameterStatus::MSGTYPE => {
                let status = backend::ParameterStatus::decode(msgtype, body)?;
                conn.record_parameter(status);
            }
            backend::BackendKeyData::MSGTYPE => {
                let key = backend::BackendKeyData::decode(msgtype, body)?;
                conn.process_id = key.process_id;
                conn.secret_key = key.secret_key;
            }
            backend::NoticeResponse::MSGTYPE => {
                let notice = backend::NoticeResponse::decode(msgtype, body)?;
                conn.dispatch_notice(notice);
            }
            backend::NegotiateProtocolVersion::MSGTYPE => {
                let nego = backend::NegotiateProtocolVersion::decode(msgtype, body)?;
                tracing::warn!("server negotiated protocol minor version {}", nego.minor);
            }
            backend::ReadyForQuery::MSGTYPE => {
                let rfq = backend::ReadyForQuery::decode(msgtype, body)?;
                conn.apply_rfq(rfq.tx_status)?;
                break;
            }
            other => return Err(ProtocolError::unexpected_phase(other, "startup").into()),
        }
    }

    conn.set_state(ConnState::Ready);
    verbose!("startup complete, server version {}", conn.server_version);
    Ok(())
}

/// Salted double hash of the md5 authentication scheme:
/// `"md5" + md5(md5(password + user) + salt)`, lowercase hex.
pub(crate) fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    use std::fmt::Write;

    let inner = md5::compute(format!("{password}{user}").as_bytes());

    let mut outer_input = format!("{inner:x}").into_bytes();
    outer_input.extend_from_slice(&salt);
    let outer = md5::compute(&outer_input);

    let mut result = String::with_capacity(35);
    result.push_str("md5");
    write!(&mut result, "{outer:x}").unwrap();
    result
}

/// Authentication could not complete.
pub struct AuthError {
    kind: AuthErrorKind,
}

enum AuthErrorKind {
    /// The server requested a scheme this session cannot answer.
    Unsupported { name: &'static str },
    /// Integrated security enabled without a registered provider.
    NoProvider,
    /// The GSS/SSPI provider failed mid-handshake.
    Gss(GssError),
}

impl AuthError {
    fn unsupported(name: &'static str) -> Self {
        Self { kind: AuthErrorKind::Unsupported { name } }
    }

    fn no_provider() -> Self {
        Self { kind: AuthErrorKind::NoProvider }
    }

    fn gss(err: GssError) -> Self {
        Self { kind: AuthErrorKind::Gss(err) }
    }
}

impl std::error::Error for AuthError { }

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            AuthErrorKind::Unsupported { name } => {
                write!(f, "authentication method {name} is not supported")
            }
            AuthErrorKind::NoProvider => {
                write!(f, "integrated security requires a registered GSS provider")
            }
            AuthErrorKind::Gss(err) => err.fmt(f),
        }
    }
}

impl fmt::Debug for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
