#![allow(dead_code)]

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use beacon_core::{ServiceInstance, TokenGrants};
use beacon_server::config::{Config, RegistrySettings, RoutePolicies, TlsSettings, TokenSettings};
use beacon_server::lifecycle::{LifecycleSettings, RegistrationManager};
use beacon_server::registry::{Registry, RegistryError};
use beacon_server::token::{TokenRejection, TokenVerifier, VerifiedToken};
use jsonwebtoken::Algorithm;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use url::Url;

pub const CLIENT_CN: &str = "client.counter-app.local";

/// Throwaway CA with one server and one client certificate, written to disk.
pub struct TestPki {
    pub dir: tempfile::TempDir,
    pub ca_pem: String,
    pub client_identity_pem: String,
}

impl TestPki {
    pub fn generate() -> Self {
        let dir = tempfile::tempdir().unwrap();

        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.distinguished_name.push(DnType::CommonName, "Beacon Test CA");
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let server_key = KeyPair::generate().unwrap();
        let mut server_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        server_params
            .subject_alt_names
            .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        server_params.distinguished_name.push(DnType::CommonName, "localhost");
        server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let server_cert = server_params.signed_by(&server_key, &ca_cert, &ca_key).unwrap();

        let client_key = KeyPair::generate().unwrap();
        let mut client_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        client_params.distinguished_name.push(DnType::CommonName, CLIENT_CN);
        client_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let client_cert = client_params.signed_by(&client_key, &ca_cert, &ca_key).unwrap();

        std::fs::write(dir.path().join("server-cert.pem"), server_cert.pem()).unwrap();
        std::fs::write(dir.path().join("server-key.pem"), server_key.serialize_pem()).unwrap();
        std::fs::write(dir.path().join("ca-bundle.pem"), ca_cert.pem()).unwrap();

        Self {
            ca_pem: ca_cert.pem(),
            client_identity_pem: format!("{}{}", client_cert.pem(), client_key.serialize_pem()),
            dir,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn tls_settings(&self, mutual_tls: bool) -> TlsSettings {
        TlsSettings {
            cert_path: self.path("server-cert.pem"),
            key_path: self.path("server-key.pem"),
            ca_bundle_path: self.path("ca-bundle.pem"),
            mutual_tls,
        }
    }
}

pub fn registry_settings(server_url: &str) -> RegistrySettings {
    RegistrySettings {
        enabled: true,
        server_url: Url::parse(server_url).unwrap(),
        instance_host: Some("localhost".to_string()),
        instance_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        register_attempts: 2,
        retry_backoff: Duration::from_millis(10),
        deregister_timeout: Duration::from_millis(300),
        request_timeout: Duration::from_secs(2),
        heartbeat_interval: Duration::from_secs(30),
        ca_bundle_path: None,
        accept_invalid_certs: false,
    }
}

pub fn test_config(pki: &TestPki, mutual_tls: bool, registry: RegistrySettings) -> Config {
    Config {
        app_name: "counter-app".to_string(),
        environment: "testing".to_string(),
        host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        context_path: String::new(),
        tls: pki.tls_settings(mutual_tls),
        token: TokenSettings {
            jwks_url: Url::parse("http://127.0.0.1:9/certs").unwrap(),
            allowed_issuers: vec!["https://issuer.test/realms/Linqra".to_string()],
            algorithms: vec![Algorithm::HS256],
            fetch_timeout: Duration::from_secs(1),
        },
        registry,
        policies: RoutePolicies::default(),
        shutdown_grace: Duration::from_secs(1),
    }
}

/// Address nothing listens on.
pub fn closed_port_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{port}/eureka/")
}

/// `good` carries `counter-app.read`, `noscope` carries nothing, anything
/// else has a bad signature.
pub struct StubVerifier;

#[async_trait]
impl TokenVerifier for StubVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedToken, TokenRejection> {
        let scopes: HashSet<String> = match token {
            "good" => ["counter-app.read".to_string()].into_iter().collect(),
            "noscope" => HashSet::new(),
            _ => return Err(TokenRejection::BadSignature),
        };
        Ok(VerifiedToken {
            subject: Some("user-1".to_string()),
            issuer: "https://issuer.test/realms/Linqra".to_string(),
            grants: TokenGrants {
                scopes,
                ..TokenGrants::default()
            },
        })
    }
}

/// Registry that accepts everything.
pub struct AcceptingRegistry;

#[async_trait]
impl Registry for AcceptingRegistry {
    async fn register(&self, _: &ServiceInstance) -> Result<(), RegistryError> {
        Ok(())
    }

    async fn heartbeat(&self, _: &ServiceInstance) -> Result<(), RegistryError> {
        Ok(())
    }

    async fn deregister(&self, _: &ServiceInstance) -> Result<(), RegistryError> {
        Ok(())
    }
}

pub fn idle_lifecycle() -> Arc<RegistrationManager> {
    let instance = ServiceInstance::new("counter-app", "localhost", IpAddr::V4(Ipv4Addr::LOCALHOST), 5001, "");
    Arc::new(RegistrationManager::new(
        Arc::new(AcceptingRegistry),
        instance,
        LifecycleSettings {
            enabled: false,
            register_attempts: 1,
            retry_backoff: Duration::from_millis(1),
            deregister_timeout: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(30),
        },
    ))
}
