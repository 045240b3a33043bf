//! Wires configuration, the TLS listener, the router and the lifecycle
//! manager into one running service.

use std::future::Future;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use axum_server::Handle;
use beacon_core::ServiceInstance;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::ServerError;
use crate::gate::AuthGate;
use crate::lifecycle::RegistrationManager;
use crate::registry::Registry;
use crate::routes::{self, AppState};
use crate::tls::{self, ListenerStatus, MtlsAcceptor};
use crate::token::TokenVerifier;

/// A bound, serving instance.
pub struct RunningServer {
    pub local_addr: SocketAddr,
    pub listener: ListenerStatus,
    pub lifecycle: Arc<RegistrationManager>,
    handle: Handle,
    task: JoinHandle<std::io::Result<()>>,
    shutdown_grace: Duration,
}

/// Binds the TLS listener and starts serving.
///
/// Returns once the listener accepts connections. Registration has not
/// started yet; that happens in [`RunningServer::run_until`].
pub async fn start(
    config: &Config,
    registry: Arc<dyn Registry>,
    verifier: Arc<dyn TokenVerifier>,
    metrics: Option<PrometheusHandle>,
) -> Result<RunningServer, ServerError> {
    let tls_config = tls::build_server_config(&config.tls)?;

    let bind_addr = SocketAddr::new(config.host, config.port);
    let std_listener = TcpListener::bind(bind_addr).map_err(|source| ServerError::Bind {
        addr: bind_addr.to_string(),
        source,
    })?;
    std_listener.set_nonblocking(true)?;
    let local_addr = std_listener.local_addr()?;

    let ip = config.advertised_ip();
    let instance = ServiceInstance::new(
        config.app_name.clone(),
        config.advertised_host(ip),
        ip,
        local_addr.port(),
        &config.context_path,
    );
    if config.registry.enabled && !instance.is_externally_routable() {
        warn!(ip = %ip, "advertised address is not routable from other hosts");
    }
    let lifecycle = Arc::new(RegistrationManager::new(registry, instance, (&config.registry).into()));

    let listener = ListenerStatus::new();
    let state = AppState::new(
        config.app_name.clone(),
        config.environment.clone(),
        listener.clone(),
        lifecycle.clone(),
        metrics,
    );
    let app = routes::router(state, AuthGate::new(verifier), &config.policies, &config.context_path);

    let handle = Handle::new();
    let task = tokio::spawn(
        axum_server::from_tcp(std_listener)
            .acceptor(MtlsAcceptor::new(tls_config))
            .handle(handle.clone())
            .serve(app.into_make_service()),
    );

    match handle.listening().await {
        Some(addr) => {
            listener.mark_accepting();
            info!(
                addr = %addr,
                mutual_tls = config.tls.mutual_tls,
                context_path = %config.context_path,
                "HTTPS listener accepting connections"
            );
        }
        None => {
            // The server exited before binding; surface its error.
            task.await??;
            return Err(ServerError::Serve(std::io::Error::other("listener stopped before accepting")));
        }
    }

    Ok(RunningServer {
        local_addr,
        listener,
        lifecycle,
        handle,
        task,
        shutdown_grace: config.shutdown_grace,
    })
}

impl RunningServer {
    /// Runs the registration lifecycle until `shutdown` resolves, then
    /// deregisters and drains the listener.
    ///
    /// Deregistration completes before the listener stops, so the registry
    /// stops routing here while requests can still be answered.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send,
    {
        let RunningServer {
            listener,
            lifecycle,
            handle,
            mut task,
            shutdown_grace,
            ..
        } = self;

        let early_exit = tokio::select! {
            _ = lifecycle.run(shutdown) => None,
            result = &mut task => Some(result),
        };

        listener.mark_stopped();

        if let Some(result) = early_exit {
            error!("listener exited unexpectedly");
            if let Err(e) = lifecycle.deregister().await {
                warn!(error = %e, "deregistration skipped");
            }
            result??;
            return Err(ServerError::Serve(std::io::Error::other("listener exited")));
        }

        info!(grace_secs = shutdown_grace.as_secs(), "draining connections");
        handle.graceful_shutdown(Some(shutdown_grace));
        task.await??;
        info!("server stopped");
        Ok(())
    }
}
