//! Discovery registry client.
//!
//! The lifecycle manager talks to the registry through the [`Registry`]
//! trait; [`EurekaRegistry`] speaks the Eureka v2 REST dialect.

use std::fs;

use async_trait::async_trait;
use beacon_core::ServiceInstance;
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::RegistrySettings;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("registry answered {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("instance {0} is not known to the registry")]
    NotRegistered(String),

    #[error("cannot build registry url: {0}")]
    Url(#[from] url::ParseError),

    #[error("cannot load registry CA bundle: {0}")]
    TrustBundle(String),
}

#[async_trait]
pub trait Registry: Send + Sync {
    async fn register(&self, instance: &ServiceInstance) -> Result<(), RegistryError>;

    async fn heartbeat(&self, instance: &ServiceInstance) -> Result<(), RegistryError>;

    async fn deregister(&self, instance: &ServiceInstance) -> Result<(), RegistryError>;
}

/// Eureka REST client.
pub struct EurekaRegistry {
    base_url: Url,
    http_client: reqwest::Client,
}

impl EurekaRegistry {
    pub fn new(settings: &RegistrySettings) -> Result<Self, RegistryError> {
        let mut builder = reqwest::Client::builder().timeout(settings.request_timeout);

        if let Some(path) = &settings.ca_bundle_path {
            let pem = fs::read(path).map_err(|e| RegistryError::TrustBundle(format!("{}: {e}", path.display())))?;
            let certs = reqwest::Certificate::from_pem_bundle(&pem)
                .map_err(|e| RegistryError::TrustBundle(e.to_string()))?;
            for cert in certs {
                builder = builder.add_root_certificate(cert);
            }
        }
        if settings.accept_invalid_certs {
            warn!("registry certificate verification disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(Self {
            base_url: settings.server_url.clone(),
            http_client: builder.build()?,
        })
    }

    fn app_url(&self, app_name: &str) -> Result<Url, RegistryError> {
        Ok(self.base_url.join(&format!("apps/{}", app_name.to_uppercase()))?)
    }

    fn instance_url(&self, instance: &ServiceInstance) -> Result<Url, RegistryError> {
        Ok(self.base_url.join(&format!(
            "apps/{}/{}",
            instance.app_name.to_uppercase(),
            instance.instance_id
        ))?)
    }
}

#[async_trait]
impl Registry for EurekaRegistry {
    async fn register(&self, instance: &ServiceInstance) -> Result<(), RegistryError> {
        let url = self.app_url(&instance.app_name)?;
        debug!(url = %url, instance_id = %instance.instance_id, "POST registration");

        let response = self
            .http_client
            .post(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&EurekaRegistration::from(instance))
            .send()
            .await?;
        check_status(response).await
    }

    async fn heartbeat(&self, instance: &ServiceInstance) -> Result<(), RegistryError> {
        let url = self.instance_url(instance)?;
        let response = self.http_client.put(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(RegistryError::NotRegistered(instance.instance_id.clone()));
        }
        check_status(response).await
    }

    async fn deregister(&self, instance: &ServiceInstance) -> Result<(), RegistryError> {
        let url = self.instance_url(instance)?;
        info!(url = %url, "DELETE registration");
        let response = self
            .http_client
            .delete(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;
        check_status(response).await
    }
}

async fn check_status(response: reqwest::Response) -> Result<(), RegistryError> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(RegistryError::Status { status, body })
    }
}

/// `{"instance": {...}}` as Eureka expects it.
#[derive(Debug, Serialize)]
pub struct EurekaRegistration {
    pub instance: EurekaInstance,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EurekaInstance {
    pub instance_id: String,
    pub host_name: String,
    pub app: String,
    pub ip_addr: String,
    pub status: String,
    #[serde(rename = "overriddenstatus")]
    pub overridden_status: &'static str,
    pub port: EurekaPort,
    pub secure_port: EurekaPort,
    pub country_id: u8,
    pub data_center_info: DataCenterInfo,
    pub lease_info: LeaseInfo,
    pub home_page_url: String,
    pub status_page_url: String,
    pub health_check_url: String,
    pub secure_health_check_url: String,
    pub vip_address: String,
    pub secure_vip_address: String,
}

#[derive(Debug, Serialize)]
pub struct EurekaPort {
    #[serde(rename = "$")]
    pub port: u16,
    #[serde(rename = "@enabled")]
    pub enabled: &'static str,
}

#[derive(Debug, Serialize)]
pub struct DataCenterInfo {
    #[serde(rename = "@class")]
    pub class: &'static str,
    pub name: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseInfo {
    pub renewal_interval_in_secs: u32,
    pub duration_in_secs: u32,
}

impl From<&ServiceInstance> for EurekaRegistration {
    fn from(instance: &ServiceInstance) -> Self {
        let app = instance.app_name.to_uppercase();
        Self {
            instance: EurekaInstance {
                instance_id: instance.instance_id.clone(),
                host_name: instance.host_name.clone(),
                app,
                ip_addr: instance.ip_address.to_string(),
                // The registry should route to us as soon as it acknowledges.
                status: "UP".to_string(),
                overridden_status: "UNKNOWN",
                port: EurekaPort {
                    port: instance.port,
                    enabled: "false",
                },
                secure_port: EurekaPort {
                    port: instance.secure_port,
                    enabled: "true",
                },
                country_id: 1,
                data_center_info: DataCenterInfo {
                    class: "com.netflix.appinfo.InstanceInfo$DefaultDataCenterInfo",
                    name: "MyOwn",
                },
                lease_info: LeaseInfo {
                    renewal_interval_in_secs: 30,
                    duration_in_secs: 90,
                },
                home_page_url: instance.status_page_url.clone(),
                status_page_url: instance.status_page_url.clone(),
                health_check_url: instance.health_check_url.clone(),
                secure_health_check_url: instance.health_check_url.clone(),
                vip_address: instance.app_name.clone(),
                secure_vip_address: instance.app_name.clone(),
            },
        }
    }
}
