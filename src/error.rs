//! Fatal startup and lifecycle errors.
//!
//! Every variant is fatal for the whole process: the supervisor surfaces it
//! synchronously and the binary exits non-zero. Restarting is left to an
//! external process supervisor.

use std::fmt;

use crate::roles::Role;

/// Exit status for a clean shutdown.
pub const EXIT_OK: u8 = 0;

/// Exit status for any fatal startup or lifecycle error.
pub const EXIT_FATAL: u8 = 1;

/// Errors that abort the daemon.
#[derive(Debug)]
pub enum BootstrapError {
    /// Neither the planner nor the worker port is configured.
    NoRoleEnabled,

    /// Configuration could not be loaded or failed validation.
    InvalidConfig(String),

    /// A native integration step failed to initialize.
    Subsystem {
        /// Name of the failing step
        step: String,
        cause: anyhow::Error,
    },

    /// The shared runtime environment could not be constructed.
    Environment(anyhow::Error),

    /// A role's RPC service could not be bound or started.
    ServiceStart { role: Role, cause: anyhow::Error },

    /// A running role's service loop exited with an error.
    ServiceFailed { role: Role, cause: anyhow::Error },

    /// Readiness gauges could not be registered or published.
    Readiness(anyhow::Error),
}

impl BootstrapError {
    /// The startup step the error originated from, for operator logs.
    pub fn step(&self) -> &str {
        match self {
            Self::NoRoleEnabled | Self::InvalidConfig(_) => "configuration",
            Self::Subsystem { step, .. } => step,
            Self::Environment(_) => "environment",
            Self::ServiceStart { .. } => "service-start",
            Self::ServiceFailed { .. } => "service-loop",
            Self::Readiness(_) => "readiness",
        }
    }

    pub fn exit_code(&self) -> u8 {
        EXIT_FATAL
    }
}

impl fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRoleEnabled => write!(
                f,
                "Cannot start recordserviced that is not running the planner or worker services"
            ),
            Self::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            Self::Subsystem { step, cause } => {
                write!(f, "Subsystem '{}' failed to initialize: {:#}", step, cause)
            }
            Self::Environment(cause) => {
                write!(f, "Runtime environment failed to initialize: {:#}", cause)
            }
            Self::ServiceStart { role, cause } => {
                write!(f, "The {} service failed to start: {:#}", role, cause)
            }
            Self::ServiceFailed { role, cause } => {
                write!(f, "The {} service exited with an error: {:#}", role, cause)
            }
            Self::Readiness(cause) => write!(f, "Failed to publish readiness: {:#}", cause),
        }
    }
}

impl std::error::Error for BootstrapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Subsystem { cause, .. }
            | Self::Environment(cause)
            | Self::ServiceStart { cause, .. }
            | Self::ServiceFailed { cause, .. }
            | Self::Readiness(cause) => Some(&**cause),
            Self::NoRoleEnabled | Self::InvalidConfig(_) => None,
        }
    }
}

/// Result type for lifecycle operations.
pub type BootstrapResult<T> = Result<T, BootstrapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subsystem_error_names_step_and_cause() {
        let err = BootstrapError::Subsystem {
            step: "storage-client".to_string(),
            cause: anyhow::anyhow!("conf dir missing"),
        };
        assert_eq!(err.step(), "storage-client");
        let msg = err.to_string();
        assert!(msg.contains("storage-client"));
        assert!(msg.contains("conf dir missing"));
    }

    #[test]
    fn test_all_errors_exit_non_zero() {
        let errors = [
            BootstrapError::NoRoleEnabled,
            BootstrapError::InvalidConfig("bad".into()),
            BootstrapError::Environment(anyhow::anyhow!("bind")),
            BootstrapError::ServiceStart {
                role: Role::Worker,
                cause: anyhow::anyhow!("address in use"),
            },
            BootstrapError::Readiness(anyhow::anyhow!("planner is not ready")),
        ];
        for err in errors {
            assert_ne!(err.exit_code(), EXIT_OK);
        }
    }

    #[test]
    fn test_readiness_error_names_its_own_step() {
        let err = BootstrapError::Readiness(anyhow::anyhow!("worker is not ready"));
        assert_eq!(err.step(), "readiness");
        assert!(err.to_string().contains("worker is not ready"));
    }

    #[test]
    fn test_source_is_preserved() {
        use std::error::Error;

        let err = BootstrapError::Environment(anyhow::anyhow!("webserver bind failed"));
        assert!(err.source().is_some());
        assert!(BootstrapError::NoRoleEnabled.source().is_none());
    }
}
