//! RPC transport seam.
//!
//! The lifecycle code only relies on binding a role to a port and on the
//! start / wait / stop contract of the resulting handle.

mod http;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::environment::RuntimeEnvironment;
use crate::roles::Role;
use crate::service::ExecutionService;

pub use http::{HttpServiceHandle, HttpTransport, create_role_router};

/// One role's RPC service.
#[async_trait]
pub trait ServiceHandle: Send + Sync {
    fn role(&self) -> Role;

    /// Port the listener is bound to, `0` until started.
    fn bound_port(&self) -> u16;

    fn is_running(&self) -> bool;

    /// Bind the listener and start accepting RPCs.
    async fn start(&self) -> Result<()>;

    /// Wait for the service loop to exit. Returns at once if never started.
    async fn wait(&self) -> Result<()>;

    /// Ask the service loop to stop accepting and drain.
    fn stop(&self);
}

/// Creates role services. Binding does not open a socket; `start` does.
pub trait Transport: Send + Sync {
    fn bind(
        &self,
        role: Role,
        port: u16,
        service: Arc<dyn ExecutionService>,
        env: Arc<RuntimeEnvironment>,
    ) -> Result<Arc<dyn ServiceHandle>>;
}
