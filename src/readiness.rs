//! Per-role and global readiness flags for external health checks.

use anyhow::{Result, bail};
use serde::Serialize;

use crate::metrics::{FlagGauge, MetricsRegistry};
use crate::roles::{EnabledRoles, Role};

pub const RUNNING_PLANNER: &str = "recordservice.running-planner";
pub const RUNNING_WORKER: &str = "recordservice.running-worker";
pub const SERVER_READY: &str = "recordserviced.ready";

/// Readiness gauges, registered in the process metrics registry.
///
/// A role flag is set once its listener accepts connections. The global flag
/// is set only after every enabled role flag, and no flag is ever cleared.
#[derive(Debug, Clone)]
pub struct Readiness {
    planner: FlagGauge,
    worker: FlagGauge,
    server_ready: FlagGauge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReadinessSnapshot {
    pub planner: bool,
    pub worker: bool,
    pub server_ready: bool,
}

impl Readiness {
    pub fn register(metrics: &MetricsRegistry) -> Result<Self> {
        Ok(Self {
            planner: metrics.flag(RUNNING_PLANNER, "The planner service is accepting RPCs")?,
            worker: metrics.flag(RUNNING_WORKER, "The worker service is accepting RPCs")?,
            server_ready: metrics.flag(SERVER_READY, "All enabled services are accepting RPCs")?,
        })
    }

    fn gauge(&self, role: Role) -> &FlagGauge {
        match role {
            Role::Planner => &self.planner,
            Role::Worker => &self.worker,
        }
    }

    /// Publish that `role` is accepting connections.
    pub fn mark_role_ready(&self, role: Role) {
        if self.gauge(role).set() {
            tracing::debug!(role = %role, "Role readiness published");
        }
    }

    /// Publish global readiness once every role in `roles` is ready.
    pub fn mark_server_ready(&self, roles: &EnabledRoles) -> Result<()> {
        for (role, _) in roles.iter() {
            if !self.gauge(role).get() {
                bail!("cannot publish server readiness: {} is not ready", role);
            }
        }
        self.server_ready.set();
        Ok(())
    }

    pub fn is_role_ready(&self, role: Role) -> bool {
        self.gauge(role).get()
    }

    pub fn is_server_ready(&self) -> bool {
        self.server_ready.get()
    }

    pub fn snapshot(&self) -> ReadinessSnapshot {
        ReadinessSnapshot {
            planner: self.planner.get(),
            worker: self.worker.get(),
            server_ready: self.server_ready.get(),
        }
    }
}
