//! Lifecycle supervisor.
//!
//! Drives the daemon from configuration to shutdown:
//!
//! 1. **Init**: validate configuration, bootstrap subsystems, derive the
//!    service identity, build the runtime environment.
//! 2. **ServicesCreated / Starting**: bind one handle per enabled role and
//!    start them planner first, publishing each role's readiness flag.
//! 3. **Running / Blocked**: publish global readiness, then wait for every
//!    service loop to exit.
//! 4. **Terminated**: release the handles and the environment.
//!
//! Any failure on the way moves to **FatalAbort** and is returned to the
//! caller; there is no degraded single-role mode.


use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::activator::activate_roles;
use crate::config::DaemonConfig;
use crate::environment::RuntimeEnvironment;
use crate::error::{BootstrapError, BootstrapResult};
use crate::identity::ServiceIdentity;
use crate::metrics::MetricsRegistry;
use crate::readiness::Readiness;
use crate::roles::EnabledRoles;
use crate::service::{ExecutionService, create_service_instance};
use crate::subsystems::SubsystemBootstrapper;
use crate::transport::{HttpTransport, ServiceHandle, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    Init,
    ServicesCreated,
    Starting,
    Running,
    Blocked,
    Terminated,
    FatalAbort,
}

type ServiceFactory = Box<dyn Fn(&Arc<RuntimeEnvironment>) -> Arc<dyn ExecutionService> + Send + Sync>;

pub struct Supervisor {
    config: DaemonConfig,
    metrics: Arc<MetricsRegistry>,
    readiness: Readiness,
    subsystems: SubsystemBootstrapper,
    transport: Arc<dyn Transport>,
    service_factory: ServiceFactory,
    state: watch::Sender<LifecycleState>,
}

impl Supervisor {
    /// A supervisor with the default subsystems, HTTP transport and local
    /// execution service.
    pub fn new(config: DaemonConfig) -> BootstrapResult<Self> {
        let metrics = Arc::new(MetricsRegistry::new());
        let readiness = Readiness::register(&metrics).map_err(BootstrapError::Readiness)?;
        let transport = Arc::new(HttpTransport::new(config.rpc_interface));
        let (state, _) = watch::channel(LifecycleState::Init);

        Ok(Self {
            config,
            metrics,
            readiness,
            subsystems: SubsystemBootstrapper::with_default_steps(),
            transport,
            service_factory: Box::new(create_service_instance),
            state,
        })
    }

    pub fn with_subsystems(mut self, subsystems: SubsystemBootstrapper) -> Self {
        self.subsystems = subsystems;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_service_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&Arc<RuntimeEnvironment>) -> Arc<dyn ExecutionService> + Send + Sync + 'static,
    {
        self.service_factory = Box::new(factory);
        self
    }

    /// Readiness flags, readable before, during and after `run`.
    pub fn readiness(&self) -> Readiness {
        self.readiness.clone()
    }

    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        self.metrics.clone()
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Follow lifecycle transitions from another task.
    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    fn transition(&self, next: LifecycleState) {
        let prev = self.state.send_replace(next);
        debug!(from = ?prev, to = ?next, "Lifecycle transition");
    }

    /// Run the daemon until every role service has stopped.
    ///
    /// `shutdown` resolving stops all services. Returns once they have all
    /// exited and resources are released, or at the first fatal error.
    pub async fn run<S>(mut self, shutdown: S) -> BootstrapResult<()>
    where
        S: Future<Output = ()> + Send,
    {
        let result = self.run_lifecycle(shutdown).await;

        if let Err(e) = &result {
            self.transition(LifecycleState::FatalAbort);
            error!(
                step = e.step(),
                "recordserviced did not start correctly, exiting. Error: {}", e
            );
        }

        result
    }

    async fn run_lifecycle<S>(&mut self, shutdown: S) -> BootstrapResult<()>
    where
        S: Future<Output = ()> + Send,
    {
        self.transition(LifecycleState::Init);

        let roles = self.config.validate()?;

        std::mem::take(&mut self.subsystems).run(&self.config.subsystems)?;

        let identity = ServiceIdentity::generate(&self.config.hostname, roles.primary_port());
        info!(service_id = %identity, "Generated service identity");

        let env = RuntimeEnvironment::init(
            identity,
            &self.config,
            self.metrics.clone(),
            self.readiness.clone(),
        )
        .await
        .map_err(BootstrapError::Environment)?;

        let result = self.run_services(&roles, &env, shutdown).await;
        env.shutdown().await;
        result
    }

    async fn run_services<S>(
        &self,
        roles: &EnabledRoles,
        env: &Arc<RuntimeEnvironment>,
        shutdown: S,
    ) -> BootstrapResult<()>
    where
        S: Future<Output = ()> + Send,
    {
        let service = (self.service_factory)(env);
        let handles = activate_roles(roles, self.transport.as_ref(), service, env)?;
        self.transition(LifecycleState::ServicesCreated);

        self.transition(LifecycleState::Starting);
        for handle in &handles {
            if let Err(cause) = handle.start().await {
                // Do not leave earlier roles listening while the process exits.
                stop_and_wait(&handles).await;
                return Err(BootstrapError::ServiceStart {
                    role: handle.role(),
                    cause,
                });
            }
            self.readiness.mark_role_ready(handle.role());
            info!(role = %handle.role(), port = handle.bound_port(), "RPC service started");
        }

        if let Err(e) = publish_server_ready(&self.readiness, roles) {
            stop_and_wait(&handles).await;
            return Err(e);
        }
        self.transition(LifecycleState::Running);
        info!("recordserviced has started");

        self.transition(LifecycleState::Blocked);
        let outcome = join_services(&handles, shutdown).await;

        drop(handles);
        self.transition(LifecycleState::Terminated);
        info!("All RPC services stopped");

        outcome
    }
}

/// Set the global flag once every enabled role flag is set.
fn publish_server_ready(readiness: &Readiness, roles: &EnabledRoles) -> BootstrapResult<()> {
    readiness
        .mark_server_ready(roles)
        .map_err(BootstrapError::Readiness)
}

async fn stop_and_wait(handles: &[Arc<dyn ServiceHandle>]) {
    stop_all(handles);
    for handle in handles {
        let _ = handle.wait().await;
    }
}

/// Wait for every service loop to exit.
///
/// `shutdown` or the first failing loop stops all services; the join still
/// waits for each one before returning.
async fn join_services<S>(handles: &[Arc<dyn ServiceHandle>], shutdown: S) -> BootstrapResult<()>
where
    S: Future<Output = ()> + Send,
{
    let mut joins = JoinSet::new();
    for handle in handles {
        let handle = handle.clone();
        let role = handle.role();
        joins.spawn(async move {
            // The inner task turns a panicking loop into an error for `role`.
            let result = match tokio::spawn(async move { handle.wait().await }).await {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("service wait task failed: {}", e)),
            };
            (role, result)
        });
    }

    tokio::pin!(shutdown);
    let mut stopping = false;
    let mut first_error: Option<BootstrapError> = None;

    loop {
        tokio::select! {
            _ = &mut shutdown, if !stopping => {
                info!("Shutdown requested, stopping RPC services");
                stopping = true;
                stop_all(handles);
            }
            joined = joins.join_next() => {
                let Some(joined) = joined else { break };

                let (role, result) = match joined {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!("Service join task failed: {}", e);
                        continue;
                    }
                };

                match result {
                    Ok(()) => info!(role = %role, "RPC service stopped"),
                    Err(cause) => {
                        error!(role = %role, "RPC service exited with error: {:#}", cause);
                        if !stopping {
                            stopping = true;
                            stop_all(handles);
                        }
                        if first_error.is_none() {
                            first_error = Some(BootstrapError::ServiceFailed { role, cause });
                        }
                    }
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn stop_all(handles: &[Arc<dyn ServiceHandle>]) {
    for handle in handles {
        handle.stop();
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
