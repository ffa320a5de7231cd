//! # Relay Transport
//!
//! Establishes the single duplex byte stream a [`RemoteConnection`] runs
//! over. Relay URLs take one of two forms:
//!
//! ```text
//! tls://relay.example.com:443/phonon    TLS over TCP (default port 443)
//! tcp://127.0.0.1:8080                  plain TCP, for local relays and tests
//! ```
//!
//! `https://` and `http://` are accepted as aliases. Any path is ignored:
//! the relay routes on the envelopes, not on the URL.
//!
//! TLS verification is on unless the caller explicitly sets
//! [`RemoteConfig::ignore_tls`](crate::config::RemoteConfig::ignore_tls).
//! Skipping it does not weaken card identity (that rests on the identify
//! challenge), but it does let anyone on the path read and drop traffic.
//!
//! [`RemoteConnection`]: crate::remote::RemoteConnection

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::config::{DEFAULT_TCP_PORT, DEFAULT_TLS_PORT};

/// Errors raised while reaching the relay.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid relay url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unable to reach relay at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tls: {0}")]
    Tls(String),
}

/// Any duplex byte stream a connection can run over.
pub trait RelayStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RelayStream for T {}

// ---------------------------------------------------------------------------
// Relay URL
// ---------------------------------------------------------------------------

/// A parsed relay address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayUrl {
    /// Whether to wrap the TCP stream in TLS.
    pub secure: bool,
    /// Host name or IP literal, without IPv6 brackets.
    pub host: String,
    pub port: u16,
}

impl RelayUrl {
    pub fn parse(url: &str) -> Result<Self, TransportError> {
        let invalid = |reason: &str| TransportError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = url.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        let (secure, default_port) = match scheme.to_ascii_lowercase().as_str() {
            "tls" | "https" => (true, DEFAULT_TLS_PORT),
            "tcp" | "http" => (false, DEFAULT_TCP_PORT),
            _ => return Err(invalid("scheme must be tls, https, tcp or http")),
        };

        let authority = rest.split('/').next().unwrap_or_default();
        if authority.is_empty() {
            return Err(invalid("missing host"));
        }

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 literal"))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p.parse().map_err(|_| invalid("bad port"))?,
                None if tail.is_empty() => default_port,
                None => return Err(invalid("unexpected text after IPv6 literal")),
            };
            (host, port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, p)) => (host, p.parse().map_err(|_| invalid("bad port"))?),
                None => (authority, default_port),
            }
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        Ok(Self {
            secure,
            host: host.to_string(),
            port,
        })
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

// ---------------------------------------------------------------------------
// Connect
// ---------------------------------------------------------------------------

/// Opens the duplex stream to the relay.
pub async fn connect(
    url: &RelayUrl,
    ignore_tls: bool,
) -> Result<Box<dyn RelayStream>, TransportError> {
    let addr = url.authority();
    let tcp = TcpStream::connect((url.host.as_str(), url.port))
        .await
        .map_err(|source| TransportError::Connect {
            addr: addr.clone(),
            source,
        })?;
    // Envelopes are small and latency-bound.
    tcp.set_nodelay(true)
        .map_err(|source| TransportError::Connect {
            addr: addr.clone(),
            source,
        })?;

    if !url.secure {
        debug!(%addr, "connected to relay over plain tcp");
        return Ok(Box::new(tcp));
    }

    let connector = TlsConnector::from(Arc::new(tls_client_config(ignore_tls)?));
    let server_name = ServerName::try_from(url.host.clone()).map_err(|e| {
        TransportError::InvalidUrl {
            url: addr.clone(),
            reason: e.to_string(),
        }
    })?;
    let tls = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    debug!(%addr, ignore_tls, "connected to relay over tls");
    Ok(Box::new(tls))
}

/// Client TLS settings: webpki roots, or no verification at all.
fn tls_client_config(ignore_tls: bool) -> Result<ClientConfig, TransportError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    let config = if ignore_tls {
        warn!("relay TLS certificate verification is disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
            .with_no_client_auth()
    } else {
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.into(),
        };
        builder.with_root_certificates(roots).with_no_client_auth()
    };

    Ok(config)
}

/// Accepts any relay certificate. Handshake signatures are still checked
/// so the session keys belong to whoever presented the certificate.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
