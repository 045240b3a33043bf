use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of this process as advertised to the discovery registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceStatus {
    Starting,
    Up,
    Down,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InstanceStatus::Starting => "STARTING",
            InstanceStatus::Up => "UP",
            InstanceStatus::Down => "DOWN",
        })
    }
}

/// Identity of the running process as known to the registry.
///
/// A fresh instance (and `instance_id`) is built on every process start;
/// nothing here is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// `<app_name>:<uuid>`
    pub instance_id: String,
    pub app_name: String,
    pub host_name: String,
    pub ip_address: IpAddr,
    pub port: u16,
    pub secure_port: u16,
    pub status_page_url: String,
    pub health_check_url: String,
    pub status: InstanceStatus,
}

impl ServiceInstance {
    /// Builds the instance for a TLS-only listener on `port`.
    ///
    /// `context_path` is either empty or starts with `/` and has no trailing slash.
    pub fn new(
        app_name: impl Into<String>,
        host_name: impl Into<String>,
        ip_address: IpAddr,
        port: u16,
        context_path: &str,
    ) -> Self {
        let app_name = app_name.into();
        let host_name = host_name.into();
        let base = format!("https://{host_name}:{port}{context_path}");
        Self {
            instance_id: format!("{app_name}:{}", Uuid::new_v4()),
            status_page_url: format!("{base}/"),
            health_check_url: format!("{base}/health"),
            app_name,
            host_name,
            ip_address,
            port,
            secure_port: port,
            status: InstanceStatus::Starting,
        }
    }

    pub fn set_status(&mut self, status: InstanceStatus) {
        self.status = status;
    }

    /// Loopback addresses are unreachable for the registry's health checks.
    pub fn is_externally_routable(&self) -> bool {
        !self.ip_address.is_loopback() && !self.ip_address.is_unspecified()
    }
}
