//! The two service roles a daemon can run, and the set of roles enabled for
//! this process.

use std::fmt;

use serde::Serialize;

/// A network-service role hosted by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Produces execution plans for workers to fulfil.
    Planner,
    /// Executes assigned tasks and returns results.
    Worker,
}

impl Role {
    /// Start order. Planner first; the roles are independent listeners, so
    /// this only keeps logs and readiness publication predictable.
    pub const ALL: [Role; 2] = [Role::Planner, Role::Worker];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Planner => "planner",
            Role::Worker => "worker",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The roles enabled for this process, each paired with its configured port.
///
/// Computed once from configuration and threaded explicitly through the
/// activator and the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnabledRoles {
    planner: Option<u16>,
    worker: Option<u16>,
}

impl EnabledRoles {
    /// Build the set from raw port values, where `0` disables a role.
    ///
    /// Returns `None` when neither role is enabled.
    pub fn from_ports(planner_port: u16, worker_port: u16) -> Option<Self> {
        let planner = (planner_port != 0).then_some(planner_port);
        let worker = (worker_port != 0).then_some(worker_port);

        if planner.is_none() && worker.is_none() {
            return None;
        }

        Some(Self { planner, worker })
    }

    pub fn contains(&self, role: Role) -> bool {
        self.port(role).is_some()
    }

    pub fn port(&self, role: Role) -> Option<u16> {
        match role {
            Role::Planner => self.planner,
            Role::Worker => self.worker,
        }
    }

    /// The port that names this process in the cluster: the planner port if
    /// the planner runs, otherwise the worker port.
    pub fn primary_port(&self) -> u16 {
        match (self.planner, self.worker) {
            (Some(port), _) | (None, Some(port)) => port,
            // Unreachable by construction; `from_ports` rejects the empty set.
            (None, None) => 0,
        }
    }

    /// Enabled roles with their ports, in start order.
    pub fn iter(&self) -> impl Iterator<Item = (Role, u16)> + '_ {
        Role::ALL
            .into_iter()
            .filter_map(|role| self.port(role).map(|port| (role, port)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_roles_is_rejected() {
        assert!(EnabledRoles::from_ports(0, 0).is_none());
    }

    #[test]
    fn test_single_role() {
        let roles = EnabledRoles::from_ports(0, 13050).unwrap();
        assert!(!roles.contains(Role::Planner));
        assert!(roles.contains(Role::Worker));
        assert_eq!(roles.iter().count(), 1);
        assert_eq!(roles.primary_port(), 13050);
    }

    #[test]
    fn test_both_roles_iterate_planner_first() {
        let roles = EnabledRoles::from_ports(12050, 13050).unwrap();
        let order: Vec<_> = roles.iter().collect();
        assert_eq!(order, vec![(Role::Planner, 12050), (Role::Worker, 13050)]);
        assert_eq!(roles.primary_port(), 12050);
    }

    #[test]
    fn test_role_display() {
        assert_eq!(Role::Planner.to_string(), "planner");
        assert_eq!(Role::Worker.to_string(), "worker");
    }
}
