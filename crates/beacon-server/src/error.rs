use thiserror::Error;

use crate::config::ConfigError;
use crate::registry::RegistryError;
use crate::tls::TlsError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error("registry client setup failed: {0}")]
    Registry(#[from] RegistryError),

    #[error("token verifier setup failed: {0}")]
    TokenVerifier(#[source] reqwest::Error),

    #[error("cannot bind {addr}: {source}")]
    Bind { addr: String, source: std::io::Error },

    #[error("server stopped: {0}")]
    Serve(#[from] std::io::Error),

    #[error("server task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("metrics recorder: {0}")]
    Metrics(String),
}
