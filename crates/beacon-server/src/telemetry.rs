//! Logging and metrics setup, plus process resource sampling for `/health`.

use std::env;
use std::time::Instant;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, System};
use tracing::warn;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::ToSchema;

use crate::error::ServerError;
use crate::gate::AUTH_DECISIONS_METRIC;

/// Installs the global subscriber. `RUST_LOG` filters (default `info`),
/// `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Installs the Prometheus recorder and returns the handle `/metrics` renders from.
pub fn install_metrics() -> Result<PrometheusHandle, ServerError> {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder).map_err(|e| ServerError::Metrics(e.to_string()))?;
    metrics::describe_counter!(AUTH_DECISIONS_METRIC, "Auth gate decisions by route and outcome");
    Ok(handle)
}

/// Process resource usage reported alongside the health verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    /// Process CPU usage in percent since the previous sample.
    pub cpu: f32,
    /// Resident memory as a percentage of total system memory.
    pub memory: f32,
    /// Milliseconds the sample itself took.
    pub response_time: f32,
}

/// Samples this process's CPU and memory usage.
///
/// CPU usage is a delta between refreshes, so the first sample reports 0.
pub struct ProcessSampler {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl ProcessSampler {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid()
            .inspect_err(|e| warn!(error = %e, "process id unavailable, resource usage disabled"))
            .ok();
        Self {
            pid,
            system: Mutex::new(System::new()),
        }
    }

    pub fn sample(&self) -> ResourceUsage {
        let Some(pid) = self.pid else {
            return ResourceUsage::default();
        };
        let started = Instant::now();
        let mut system = self.system.lock();
        system.refresh_memory();
        system.refresh_process_specifics(pid, ProcessRefreshKind::new().with_cpu().with_memory());

        let (cpu, memory) = match system.process(pid) {
            Some(process) => {
                let total = system.total_memory();
                let memory = if total == 0 {
                    0.0
                } else {
                    process.memory() as f64 / total as f64 * 100.0
                };
                (process.cpu_usage(), memory as f32)
            }
            None => (0.0, 0.0),
        };

        ResourceUsage {
            cpu: round2(cpu),
            memory: round2(memory),
            response_time: round2(started.elapsed().as_secs_f32() * 1000.0),
        }
    }
}

impl Default for ProcessSampler {
    fn default() -> Self {
        Self::new()
    }
}

fn round2(value: f32) -> f32 {
    (value * 100.0).round() / 100.0
}
