//! Environment-driven configuration.
//!
//! Everything is read once at startup into an immutable [`Config`] which is
//! then handed to the transport layer, token verifier and lifecycle manager.

use std::env;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::{Path, PathBuf};
use std::time::Duration;

use beacon_core::{RequiredMethods, RoleRequirement, RoutePolicy};
use jsonwebtoken::Algorithm;
use thiserror::Error;
use url::Url;

/// Configuration errors. All of them are fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid URL for {field}: {reason}")]
    InvalidUrl { field: String, reason: String },

    #[error("Failed to parse environment variable {name}: {reason}")]
    ParseError { name: String, reason: String },

    #[error("{what} not found at {path}")]
    MissingFile { what: &'static str, path: PathBuf },

    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: String, reason: String },
}

/// Server certificate, key and client trust bundle.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_bundle_path: PathBuf,
    pub mutual_tls: bool,
}

/// Bearer token verification settings.
#[derive(Debug, Clone)]
pub struct TokenSettings {
    pub jwks_url: Url,
    pub allowed_issuers: Vec<String>,
    pub algorithms: Vec<Algorithm>,
    pub fetch_timeout: Duration,
}

/// Discovery registry settings.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub enabled: bool,
    /// Base URL of the Eureka REST API, always ending in `/`.
    pub server_url: Url,
    pub instance_host: Option<String>,
    pub instance_ip: Option<IpAddr>,
    pub register_attempts: u32,
    pub retry_backoff: Duration,
    pub deregister_timeout: Duration,
    pub request_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub ca_bundle_path: Option<PathBuf>,
    pub accept_invalid_certs: bool,
}

/// One policy per protected counter route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePolicies {
    pub count: RoutePolicy,
    pub increment: RoutePolicy,
    pub reset: RoutePolicy,
    pub details: RoutePolicy,
    pub protected: RoutePolicy,
}

impl Default for RoutePolicies {
    fn default() -> Self {
        Self {
            count: RoutePolicy::new(RequiredMethods::AnyOf),
            increment: RoutePolicy::new(RequiredMethods::AnyOf),
            reset: RoutePolicy::new(RequiredMethods::AnyOf),
            details: RoutePolicy::new(RequiredMethods::AnyOf),
            protected: RoutePolicy::new(RequiredMethods::TokenOnly).with_scope(DEFAULT_PROTECTED_SCOPE),
        }
    }
}

const DEFAULT_PROTECTED_SCOPE: &str = "counter-app.read";

/// Service configuration with validation.
#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: String,
    pub environment: String,
    pub host: IpAddr,
    pub port: u16,
    /// Empty, or `/segment[/segment...]` without trailing slash.
    pub context_path: String,
    pub tls: TlsSettings,
    pub token: TokenSettings,
    pub registry: RegistrySettings,
    pub policies: RoutePolicies,
    pub shutdown_grace: Duration,
}

impl Config {
    /// Loads configuration from environment variables with validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let app_name = env::var("APP_NAME")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConfigError::MissingRequired("APP_NAME".to_string()))?;

        let issuer_default = env::var("JWT_ISSUER_URI")
            .unwrap_or_else(|_| "http://localhost:8281/realms/Linqra".to_string());
        let mut allowed_issuers = parse_list_env("JWT_ALLOWED_ISSUERS");
        if allowed_issuers.is_empty() {
            allowed_issuers.push(issuer_default);
        }

        let config = Self {
            environment: env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
            host: parse_env("HOST", IpAddr::V4(Ipv4Addr::UNSPECIFIED))?,
            port: parse_env("PORT", 5001)?,
            context_path: normalize_context_path(&env::var("CONTEXT_PATH").unwrap_or_default()),
            tls: TlsSettings {
                cert_path: path_env("TLS_CERT_PATH", "keys/certs/server-cert.pem"),
                key_path: path_env("TLS_KEY_PATH", "keys/certs/server-key.pem"),
                ca_bundle_path: path_env("TLS_CA_BUNDLE_PATH", "keys/certs/ca-bundle.pem"),
                mutual_tls: parse_env("MUTUAL_TLS_ENABLED", false)?,
            },
            token: TokenSettings {
                jwks_url: parse_url_env(
                    "JWT_JWK_SET_URI",
                    "http://localhost:8281/realms/Linqra/protocol/openid-connect/certs",
                )?,
                allowed_issuers,
                algorithms: parse_algorithms_env("JWT_ALGORITHMS")?,
                fetch_timeout: Duration::from_secs(parse_env("JWKS_FETCH_TIMEOUT_SECS", 10)?),
            },
            registry: RegistrySettings {
                enabled: parse_env("EUREKA_REGISTRATION_ENABLED", true)?,
                server_url: with_trailing_slash(parse_url_env(
                    "EUREKA_SERVER_URL",
                    "https://localhost:8761/eureka/eureka/",
                )?),
                instance_host: env::var("EUREKA_INSTANCE_HOST").ok().filter(|v| !v.trim().is_empty()),
                instance_ip: parse_optional_env("EUREKA_INSTANCE_IP")?,
                register_attempts: parse_env("EUREKA_REGISTER_ATTEMPTS", 3)?,
                retry_backoff: Duration::from_millis(parse_env("EUREKA_RETRY_BACKOFF_MS", 2_000)?),
                deregister_timeout: Duration::from_secs(parse_env("EUREKA_DEREGISTER_TIMEOUT_SECS", 5)?),
                request_timeout: Duration::from_secs(parse_env("EUREKA_REQUEST_TIMEOUT_SECS", 10)?),
                heartbeat_interval: Duration::from_secs(parse_env("EUREKA_HEARTBEAT_INTERVAL_SECS", 30)?),
                ca_bundle_path: env::var("EUREKA_CA_BUNDLE_PATH").ok().map(PathBuf::from),
                accept_invalid_certs: parse_env("EUREKA_ACCEPT_INVALID_CERTS", false)?,
            },
            policies: policies_from_env()?,
            shutdown_grace: Duration::from_secs(parse_env("SHUTDOWN_GRACE_SECS", 10)?),
            app_name,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app_name.is_empty() {
            return Err(ConfigError::MissingRequired("APP_NAME".to_string()));
        }
        require_file("server certificate", &self.tls.cert_path)?;
        require_file("server private key", &self.tls.key_path)?;
        if self.tls.mutual_tls {
            require_file("client CA bundle", &self.tls.ca_bundle_path)?;
        }
        if self.token.allowed_issuers.is_empty() {
            return Err(ConfigError::MissingRequired("JWT_ALLOWED_ISSUERS".to_string()));
        }
        if self.token.algorithms.is_empty() {
            return Err(ConfigError::MissingRequired("JWT_ALGORITHMS".to_string()));
        }
        if self.token.fetch_timeout.is_zero() {
            return Err(invalid("JWKS_FETCH_TIMEOUT_SECS", "timeout must be greater than 0"));
        }
        if self.registry.register_attempts == 0 {
            return Err(invalid("EUREKA_REGISTER_ATTEMPTS", "must be at least 1"));
        }
        if self.registry.deregister_timeout.is_zero() {
            return Err(invalid("EUREKA_DEREGISTER_TIMEOUT_SECS", "timeout must be greater than 0"));
        }
        if self.registry.request_timeout.is_zero() {
            return Err(invalid("EUREKA_REQUEST_TIMEOUT_SECS", "timeout must be greater than 0"));
        }
        if self.registry.heartbeat_interval.is_zero() {
            return Err(invalid("EUREKA_HEARTBEAT_INTERVAL_SECS", "interval must be greater than 0"));
        }
        if let Some(path) = &self.registry.ca_bundle_path {
            require_file("registry CA bundle", path)?;
        }
        Ok(())
    }

    /// Host name advertised to the registry.
    pub fn advertised_host(&self, ip: IpAddr) -> String {
        self.registry
            .instance_host
            .clone()
            .unwrap_or_else(|| ip.to_string())
    }

    /// Routable address of this host, preferring the configured override.
    pub fn advertised_ip(&self) -> IpAddr {
        self.registry.instance_ip.unwrap_or_else(detect_network_ip)
    }
}

/// Finds the address the host would use for outbound traffic.
///
/// Connecting a UDP socket sends nothing; it only asks the kernel for a route.
pub fn detect_network_ip() -> IpAddr {
    let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).and_then(|socket| {
        socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
        socket.local_addr()
    });
    match probe {
        Ok(addr) if !addr.ip().is_unspecified() => addr.ip(),
        Ok(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Err(e) => {
            tracing::warn!(error = %e, "network address detection failed, falling back to loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

fn policies_from_env() -> Result<RoutePolicies, ConfigError> {
    let defaults = RoutePolicies::default();
    let scope = env::var("PROTECTED_REQUIRED_SCOPE").unwrap_or_else(|_| DEFAULT_PROTECTED_SCOPE.to_string());

    let mut protected = RoutePolicy::new(parse_env("POLICY_PROTECTED", defaults.protected.required)?);
    if !scope.trim().is_empty() {
        protected = protected.with_scope(scope.trim());
    }
    if let Ok(role) = env::var("PROTECTED_REALM_ROLE") {
        protected = protected.with_role(RoleRequirement::Realm(role));
    }
    match (env::var("PROTECTED_CLIENT_ID"), env::var("PROTECTED_CLIENT_ROLE")) {
        (Ok(client), Ok(role)) => {
            protected = protected.with_role(RoleRequirement::Client { client, role });
        }
        (Ok(_), Err(_)) | (Err(_), Ok(_)) => {
            return Err(invalid(
                "PROTECTED_CLIENT_ID",
                "PROTECTED_CLIENT_ID and PROTECTED_CLIENT_ROLE must be set together",
            ));
        }
        (Err(_), Err(_)) => {}
    }

    Ok(RoutePolicies {
        count: RoutePolicy::new(parse_env("POLICY_COUNT", defaults.count.required)?),
        increment: RoutePolicy::new(parse_env("POLICY_INCREMENT", defaults.increment.required)?),
        reset: RoutePolicy::new(parse_env("POLICY_RESET", defaults.reset.required)?),
        details: RoutePolicy::new(parse_env("POLICY_DETAILS", defaults.details.required)?),
        protected,
    })
}

fn invalid(name: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

fn require_file(what: &'static str, path: &Path) -> Result<(), ConfigError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(ConfigError::MissingFile {
            what,
            path: path.to_path_buf(),
        })
    }
}

/// Parse an environment variable with a default value.
fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) => val.trim().parse().map_err(|e: T::Err| ConfigError::ParseError {
            name: name.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_optional_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) if !val.trim().is_empty() => val.trim().parse().map(Some).map_err(|e: T::Err| ConfigError::ParseError {
            name: name.to_string(),
            reason: e.to_string(),
        }),
        _ => Ok(None),
    }
}

/// Parse a URL environment variable with a default value.
fn parse_url_env(name: &str, default: &str) -> Result<Url, ConfigError> {
    let url_str = env::var(name).unwrap_or_else(|_| default.to_string());
    Url::parse(&url_str).map_err(|e| ConfigError::InvalidUrl {
        field: name.to_string(),
        reason: e.to_string(),
    })
}

/// Parse a comma-separated list environment variable.
fn parse_list_env(name: &str) -> Vec<String> {
    env::var(name)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn parse_algorithms_env(name: &str) -> Result<Vec<Algorithm>, ConfigError> {
    let raw = parse_list_env(name);
    if raw.is_empty() {
        return Ok(vec![Algorithm::RS256]);
    }
    raw.iter()
        .map(|alg| {
            alg.parse::<Algorithm>().map_err(|e| ConfigError::ParseError {
                name: name.to_string(),
                reason: format!("{alg}: {e}"),
            })
        })
        .collect()
}

fn path_env(name: &str, default: &str) -> PathBuf {
    PathBuf::from(env::var(name).unwrap_or_else(|_| default.to_string()))
}

/// `""`, `"/"` -> `""`; `"r/app/"` -> `"/r/app"`.
pub fn normalize_context_path(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}
