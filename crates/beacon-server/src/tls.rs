//! Transport security: the single TLS listener.
//!
//! ```text
//! TCP connection
//!   -> TLS handshake      (rustls; client cert required when mTLS is on)
//!   -> TlsInfo extracted   (peer certificate common name)
//!   -> attached to every request on the connection as an extension
//!   -> auth gate
//! ```
//!
//! Handshake failures never reach the router. There is no plaintext listener.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Extension;
use axum::middleware::AddExtension;
use axum_server::accept::{Accept, DefaultAcceptor};
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use futures::future::BoxFuture;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ServerConnection, WebPkiClientVerifier};
use rustls::{RootCertStore, ServerConfig};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tower::Layer;
use tracing::{debug, info};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::config::TlsSettings;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("cannot read {path}: {source}")]
    Read { path: String, source: io::Error },

    #[error("no certificates found in {0}")]
    NoCertificates(String),

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error("failed to parse PEM from {path}: {source}")]
    Pem { path: String, source: io::Error },

    #[error("invalid trust bundle: {0}")]
    TrustBundle(String),

    #[error("TLS config error: {0}")]
    Rustls(#[from] rustls::Error),
}

/// What the TLS layer learned about the peer of one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsInfo {
    /// Present only when a client certificate was presented and chained to
    /// the trust bundle.
    pub peer: Option<PeerCertificate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCertificate {
    pub common_name: Option<String>,
    pub subject: String,
}

impl TlsInfo {
    pub fn with_peer(common_name: impl Into<String>) -> Self {
        let common_name = common_name.into();
        Self {
            peer: Some(PeerCertificate {
                subject: format!("CN={common_name}"),
                common_name: Some(common_name),
            }),
        }
    }

    pub fn has_verified_peer(&self) -> bool {
        self.peer.is_some()
    }

    fn from_connection(conn: &ServerConnection) -> Self {
        let peer = conn
            .peer_certificates()
            .and_then(|chain| chain.first())
            .and_then(|leaf| match PeerCertificate::from_der(leaf) {
                Ok(peer) => Some(peer),
                Err(e) => {
                    debug!(error = %e, "verified peer certificate could not be parsed");
                    None
                }
            });
        Self { peer }
    }
}

impl PeerCertificate {
    pub fn from_der(der: &[u8]) -> Result<Self, x509_parser::nom::Err<x509_parser::error::X509Error>> {
        let (_, cert) = X509Certificate::from_der(der)?;
        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .map(str::to_owned);
        Ok(Self {
            common_name,
            subject: cert.subject().to_string(),
        })
    }
}

/// Whether the listener is currently accepting connections.
///
/// Set once the server reports it is bound, cleared when graceful shutdown
/// starts. The health route answers from this flag alone.
#[derive(Debug, Clone, Default)]
pub struct ListenerStatus {
    accepting: Arc<AtomicBool>,
}

impl ListenerStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_accepting(&self) {
        self.accepting.store(true, Ordering::SeqCst);
    }

    pub fn mark_stopped(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }
}

/// Builds the rustls server configuration from the configured PEM files.
pub fn build_server_config(settings: &TlsSettings) -> Result<ServerConfig, TlsError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let certs = load_certs(&settings.cert_path)?;
    let key = load_private_key(&settings.key_path)?;

    let builder = ServerConfig::builder_with_provider(provider.clone()).with_safe_default_protocol_versions()?;

    let mut config = if settings.mutual_tls {
        let verifier = client_verifier(&settings.ca_bundle_path, provider)?;
        builder.with_client_cert_verifier(verifier).with_single_cert(certs, key)?
    } else {
        builder.with_no_client_auth().with_single_cert(certs, key)?
    };
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    info!(
        cert = %settings.cert_path.display(),
        mutual_tls = settings.mutual_tls,
        "TLS server config built"
    );
    Ok(config)
}

fn client_verifier(
    ca_bundle: &Path,
    provider: Arc<CryptoProvider>,
) -> Result<Arc<dyn rustls::server::danger::ClientCertVerifier>, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_bundle)? {
        roots
            .add(cert)
            .map_err(|e| TlsError::TrustBundle(e.to_string()))?;
    }
    WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
        .build()
        .map_err(|e| TlsError::TrustBundle(e.to_string()))
}

/// Load all certificates from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem = read_file(path)?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Pem {
            path: path.display().to_string(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.display().to_string()));
    }
    Ok(certs)
}

/// Load the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let pem = read_file(path)?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|source| TlsError::Pem {
            path: path.display().to_string(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.display().to_string()))
}

fn read_file(path: &Path) -> Result<Vec<u8>, TlsError> {
    fs::read(path).map_err(|source| TlsError::Read {
        path: path.display().to_string(),
        source,
    })
}

/// Rustls acceptor that tags each accepted connection with its [`TlsInfo`].
#[derive(Clone)]
pub struct MtlsAcceptor {
    inner: RustlsAcceptor<DefaultAcceptor>,
}

impl MtlsAcceptor {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            inner: RustlsAcceptor::new(RustlsConfig::from_config(Arc::new(config))),
        }
    }
}

impl<I, S> Accept<I, S> for MtlsAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = TlsStream<I>;
    type Service = AddExtension<S, TlsInfo>;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let acceptor = self.inner.clone();
        Box::pin(async move {
            let (stream, service) = acceptor.accept(stream, service).await.inspect_err(|e| {
                info!(error = %e, "TLS handshake rejected");
            })?;
            let tls_info = TlsInfo::from_connection(stream.get_ref().1);
            debug!(
                peer_cn = tls_info.peer.as_ref().and_then(|p| p.common_name.as_deref()),
                "TLS connection accepted"
            );
            Ok((stream, Extension(tls_info).layer(service)))
        })
    }
}
