//! Role activation: one service handle per enabled role, all backed by the
//! same execution service instance.

use std::sync::Arc;

use tracing::info;

use crate::environment::RuntimeEnvironment;
use crate::error::{BootstrapError, BootstrapResult};
use crate::roles::EnabledRoles;
use crate::service::ExecutionService;
use crate::transport::{ServiceHandle, Transport};

/// Bind a handle for every role in `roles`, planner first.
///
/// Handles are created but not started.
pub fn activate_roles(
    roles: &EnabledRoles,
    transport: &dyn Transport,
    service: Arc<dyn ExecutionService>,
    env: &Arc<RuntimeEnvironment>,
) -> BootstrapResult<Vec<Arc<dyn ServiceHandle>>> {
    roles
        .iter()
        .map(|(role, port)| {
            info!(role = %role, port, "Creating RPC service");
            transport
                .bind(role, port, service.clone(), env.clone())
                .map_err(|cause| BootstrapError::ServiceStart { role, cause })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::identity::ServiceIdentity;
    use crate::metrics::MetricsRegistry;
    use crate::readiness::Readiness;
    use crate::roles::Role;
    use crate::service::create_service_instance;
    use crate::transport::HttpTransport;
    use std::net::{IpAddr, Ipv4Addr};

    async fn test_env() -> Arc<RuntimeEnvironment> {
        let mut config = DaemonConfig::default();
        config.webserver.enabled = false;
        let metrics = Arc::new(MetricsRegistry::new());
        let readiness = Readiness::register(&metrics).unwrap();
        RuntimeEnvironment::init(
            ServiceIdentity::generate("node-1", 12050),
            &config,
            metrics,
            readiness,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_only_enabled_roles_are_created() {
        let env = test_env().await;
        let transport = HttpTransport::new(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let roles = EnabledRoles::from_ports(0, 13050).unwrap();

        let handles =
            activate_roles(&roles, &transport, create_service_instance(&env), &env).unwrap();

        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].role(), Role::Worker);
        assert!(!handles[0].is_running());
    }

    /// Records the service each role was bound with.
    struct RecordingTransport {
        inner: HttpTransport,
        bound: std::sync::Mutex<Vec<(Role, Arc<dyn ExecutionService>)>>,
    }

    impl Transport for RecordingTransport {
        fn bind(
            &self,
            role: Role,
            port: u16,
            service: Arc<dyn ExecutionService>,
            env: Arc<RuntimeEnvironment>,
        ) -> anyhow::Result<Arc<dyn ServiceHandle>> {
            self.bound.lock().unwrap().push((role, service.clone()));
            self.inner.bind(role, port, service, env)
        }
    }

    #[tokio::test]
    async fn test_both_roles_share_one_service() {
        let env = test_env().await;
        let transport = RecordingTransport {
            inner: HttpTransport::new(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            bound: std::sync::Mutex::new(Vec::new()),
        };
        let roles = EnabledRoles::from_ports(12050, 13050).unwrap();

        let handles =
            activate_roles(&roles, &transport, create_service_instance(&env), &env).unwrap();

        let order: Vec<_> = handles.iter().map(|h| h.role()).collect();
        assert_eq!(order, vec![Role::Planner, Role::Worker]);

        let bound = transport.bound.lock().unwrap();
        assert_eq!(bound.len(), 2);
        assert!(Arc::ptr_eq(&bound[0].1, &bound[1].1));
    }
}
