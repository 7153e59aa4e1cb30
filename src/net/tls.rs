//! TLS upgrade of the raw socket, backed by rustls.
use std::{io, sync::Arc};

use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
    client::{
        WebPkiServerVerifier,
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    },
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::{Result, connection::Config};

/// Server certificate validation callback.
///
/// Invoked with the server certificate, the intermediate chain it presented,
/// and the outcome of the standard chain validation. Returning `true` accepts
/// the certificate despite the reported errors; returning `false` rejects it
/// even when validation succeeded.
pub type CertValidator = Arc<
    dyn Fn(&CertificateDer<'_>, &[CertificateDer<'_>], &CertificateErrors) -> bool + Send + Sync,
>;

/// Outcome of the built-in chain validation, handed to the callback.
#[derive(Debug, Default)]
pub struct CertificateErrors {
    /// The chain validation failure, `None` when the chain checked out
    /// against the configured root certificate.
    pub chain: Option<rustls::Error>,
}

impl CertificateErrors {
    /// The certificate validated cleanly.
    pub fn is_empty(&self) -> bool {
        self.chain.is_none()
    }
}

/// Run the TLS client handshake over an already-connected socket.
pub(crate) async fn handshake(
    tcp: TcpStream,
    config: &Config,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(io::Error::other)?;

    let builder = match &config.certificate_validator {
        Some(callback) => {
            // the callback still sees the outcome of a standard validation
            // attempt, so it can override specific failures
            let webpki = webpki_verifier(config, &provider)?;
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(CallbackVerifier {
                    callback: Arc::clone(callback),
                    webpki,
                    provider,
                }))
        }
        None => {
            let mut roots = RootCertStore::empty();
            if let Some(path) = &config.ssl_root_cert {
                for cert in read_certs(path)? {
                    roots.add(cert).map_err(io::Error::other)?;
                }
            }
            builder.with_root_certificates(roots)
        }
    };

    let client_config = match (&config.ssl_cert, &config.ssl_key) {
        (Some(cert_path), Some(key_path)) => {
            let certs = read_certs(cert_path)?;
            let key = read_key(key_path)?;
            builder.with_client_auth_cert(certs, key).map_err(io::Error::other)?
        }
        _ => builder.with_no_client_auth(),
    };

    let server_name = ServerName::try_from(config.host.to_string())
        .map_err(io::Error::other)?;

    let connector = TlsConnector::from(Arc::new(client_config));
    Ok(connector.connect(server_name, tcp).await?)
}

/// Standard verifier over the configured root certificate, when one exists.
///
/// Without roots there is nothing to validate against; the callback then
/// sees an `UnknownIssuer` chain error.
fn webpki_verifier(
    config: &Config,
    provider: &Arc<CryptoProvider>,
) -> Result<Option<Arc<WebPkiServerVerifier>>> {
    let Some(path) = &config.ssl_root_cert else {
        return Ok(None);
    };

    let mut roots = RootCertStore::empty();
    for cert in read_certs(path)? {
        roots.add(cert).map_err(io::Error::other)?;
    }

    let verifier = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::clone(provider))
        .build()
        .map_err(io::Error::other)?;
    Ok(Some(verifier))
}

fn read_certs(path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)?;
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<io::Result<Vec<_>>>()?;
    Ok(certs)
}

fn read_key(path: &std::path::Path) -> Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)?;
    match rustls_pemfile::private_key(&mut &pem[..])? {
        Some(key) => Ok(key),
        None => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no private key found in {}", path.display()),
        )
        .into()),
    }
}

/// Runs the standard chain validation first, then lets the user callback
/// decide with the certificate, its chain, and the validation outcome in
/// hand. Signature verification stays with the crypto provider.
struct CallbackVerifier {
    callback: CertValidator,
    webpki: Option<Arc<WebPkiServerVerifier>>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for CallbackVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let errors = CertificateErrors {
            chain: match &self.webpki {
                Some(verifier) => verifier
                    .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
                    .err(),
                None => Some(rustls::Error::InvalidCertificate(
                    rustls::CertificateError::UnknownIssuer,
                )),
            },
        };

        if (self.callback)(end_entity, intermediates, &errors) {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

impl std::fmt::Debug for CallbackVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackVerifier").finish_non_exhaustive()
    }
}
