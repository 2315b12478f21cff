// Core modules
mod activator;
pub mod api;
pub mod config;
pub mod environment;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod readiness;
pub mod roles;
pub mod service;
pub mod subsystems;
pub mod supervisor;
pub mod transport;

// Re-export key types and functions
pub use activator::activate_roles;
pub use config::{ConfigOverrides, DaemonConfig};
pub use environment::RuntimeEnvironment;
pub use error::{BootstrapError, BootstrapResult};
pub use identity::ServiceIdentity;
pub use readiness::Readiness;
pub use roles::{EnabledRoles, Role};
pub use service::{ExecutionService, create_service_instance};
pub use supervisor::{LifecycleState, Supervisor, shutdown_signal};

/// Convenience function to run the daemon with the default collaborators.
///
/// Blocks until SIGINT/SIGTERM has stopped every role service, or returns
/// the first fatal startup error.
pub async fn run(config: DaemonConfig) -> BootstrapResult<()> {
    Supervisor::new(config)?.run(shutdown_signal()).await
}
