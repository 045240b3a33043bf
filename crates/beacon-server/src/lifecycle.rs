//! Registration lifecycle with the discovery registry.
//!
//! ```text
//! UNREGISTERED -> REGISTERING -> REGISTERED -> DEREGISTERING -> DEREGISTERED
//!                      |                             ^
//!                      +------- shutdown ------------+
//! ```
//!
//! The manager is driven by [`RegistrationManager::run`], which owns the
//! whole sequence and is cancelled only through the shutdown future it is
//! given. Registry trouble is logged and never stops the process from
//! serving.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use beacon_core::{InstanceStatus, LifecycleError, LifecycleState, ServiceInstance};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::RegistrySettings;
use crate::registry::{Registry, RegistryError};

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub enabled: bool,
    pub register_attempts: u32,
    pub retry_backoff: Duration,
    pub deregister_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl From<&RegistrySettings> for LifecycleSettings {
    fn from(settings: &RegistrySettings) -> Self {
        Self {
            enabled: settings.enabled,
            register_attempts: settings.register_attempts,
            retry_backoff: settings.retry_backoff,
            deregister_timeout: settings.deregister_timeout,
            heartbeat_interval: settings.heartbeat_interval,
        }
    }
}

pub struct RegistrationManager {
    registry: Arc<dyn Registry>,
    settings: LifecycleSettings,
    instance: RwLock<ServiceInstance>,
    state: watch::Sender<LifecycleState>,
}

impl RegistrationManager {
    pub fn new(registry: Arc<dyn Registry>, instance: ServiceInstance, settings: LifecycleSettings) -> Self {
        let (state, _) = watch::channel(LifecycleState::Unregistered);
        Self {
            registry,
            settings,
            instance: RwLock::new(instance),
            state,
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Snapshot of the instance as currently advertised.
    pub fn instance(&self) -> ServiceInstance {
        self.instance.read().clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Applies one edge of the state machine atomically.
    fn transition(&self, next: LifecycleState) -> Result<(), LifecycleError> {
        let mut outcome = Ok(());
        self.state.send_if_modified(|state| match state.transition(next) {
            Ok(new_state) => {
                *state = new_state;
                true
            }
            Err(e) => {
                outcome = Err(e);
                false
            }
        });
        if outcome.is_ok() {
            info!(state = %next, "registration state changed");
        }
        outcome
    }

    /// Registers with bounded retries.
    ///
    /// On exhaustion the state stays `REGISTERING`; the caller keeps serving.
    pub async fn register(&self) -> Result<(), LifecycleError> {
        self.transition(LifecycleState::Registering)?;
        let attempts = self.settings.register_attempts.max(1);
        let instance = self.instance();

        for attempt in 1..=attempts {
            match self.registry.register(&instance).await {
                Ok(()) => {
                    self.transition(LifecycleState::Registered)?;
                    self.instance.write().set_status(InstanceStatus::Up);
                    info!(
                        instance_id = %instance.instance_id,
                        attempt,
                        "registered with discovery registry"
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "registration attempt failed");
                    if attempt < attempts {
                        sleep(self.settings.retry_backoff).await;
                    }
                }
            }
        }

        error!(attempts, "registration attempts exhausted, serving without registry");
        Err(LifecycleError::RegistrationExhausted { attempts })
    }

    /// Renews the lease until cancelled. Failures are logged only.
    async fn renew_lease(&self) {
        let mut ticker = tokio::time::interval(self.settings.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately and the registration itself counts
        // as the first renewal.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let instance = self.instance();
            match self.registry.heartbeat(&instance).await {
                Ok(()) => debug!(instance_id = %instance.instance_id, "lease renewed"),
                Err(RegistryError::NotRegistered(id)) => {
                    warn!(instance_id = %id, "registry lost our lease, re-sending registration");
                    if let Err(e) = self.registry.register(&instance).await {
                        warn!(error = %e, "re-registration failed");
                    }
                }
                Err(e) => warn!(error = %e, "heartbeat failed"),
            }
        }
    }

    async fn register_and_renew(&self) {
        match self.register().await {
            Ok(()) => self.renew_lease().await,
            Err(e) => {
                error!(error = %e, "registration did not complete");
                std::future::pending::<()>().await;
            }
        }
    }

    /// Removes the registration, bounded by the deregistration timeout.
    ///
    /// Ends in `DEREGISTERED` with the instance `DOWN` whether or not the
    /// registry answered.
    pub async fn deregister(&self) -> Result<(), LifecycleError> {
        self.transition(LifecycleState::Deregistering)?;
        let instance = self.instance();

        match timeout(self.settings.deregister_timeout, self.registry.deregister(&instance)).await {
            Ok(Ok(())) => info!(instance_id = %instance.instance_id, "deregistered from discovery registry"),
            Ok(Err(e)) => warn!(error = %e, "deregistration failed"),
            Err(_) => warn!(
                timeout_ms = self.settings.deregister_timeout.as_millis() as u64,
                "deregistration timed out"
            ),
        }

        self.instance.write().set_status(InstanceStatus::Down);
        self.transition(LifecycleState::Deregistered)
    }

    /// Drives the whole lifecycle until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        if !self.settings.enabled {
            info!("registry registration disabled");
            shutdown.await;
            return;
        }

        tokio::select! {
            _ = shutdown => info!(state = %self.state(), "shutdown requested"),
            _ = self.register_and_renew() => {}
        }

        if self.state() == LifecycleState::Unregistered {
            return;
        }
        if let Err(e) = self.deregister().await {
            error!(error = %e, "deregistration skipped");
        }
    }
}
