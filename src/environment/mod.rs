//! Process-wide runtime environment shared by every role service.
//!
//! Holds the metrics registry, readiness gauges, thread instrumentation and
//! RPC tracing, and owns the diagnostic web endpoint. Built once, after the
//! service identity is known and before any role service exists.

pub mod rpc_trace;
pub mod threads;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::{DiagnosticState, create_diagnostic_router};
use crate::config::DaemonConfig;
use crate::identity::ServiceIdentity;
use crate::metrics::MetricsRegistry;
use crate::readiness::Readiness;
use crate::service::ServiceCounters;

pub use rpc_trace::{RpcMethodSummary, RpcTracer};
pub use threads::{TaskGuard, TaskInfo, ThreadRegistry};

/// Category under which the diagnostic endpoint task is instrumented.
const DIAGNOSTICS_CATEGORY: &str = "diagnostics";

struct DiagnosticServer {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<std::io::Result<()>>,
}

pub struct RuntimeEnvironment {
    identity: ServiceIdentity,
    started_at: DateTime<Utc>,
    metrics: Arc<MetricsRegistry>,
    readiness: Readiness,
    threads: Arc<ThreadRegistry>,
    rpc_trace: Arc<RpcTracer>,
    service_counters: ServiceCounters,
    webserver: Mutex<Option<DiagnosticServer>>,
}

impl RuntimeEnvironment {
    /// Build the environment for `identity`.
    ///
    /// Registers process metrics and, when enabled, binds the diagnostic
    /// endpoint. Any failure leaves nothing running.
    pub async fn init(
        identity: ServiceIdentity,
        config: &DaemonConfig,
        metrics: Arc<MetricsRegistry>,
        readiness: Readiness,
    ) -> Result<Arc<Self>> {
        let started_at = Utc::now();

        metrics
            .property("recordserviced.service-id", "Cluster-unique service id")?
            .set(identity.as_str());
        metrics
            .property("recordserviced.version", "Build version")?
            .set(env!("CARGO_PKG_VERSION"));
        metrics
            .property("recordserviced.start-time", "Process start time")?
            .set(started_at.to_rfc3339());
        metrics
            .property("recordserviced.hostname", "Advertised hostname")?
            .set(config.hostname.clone());

        let threads = Arc::new(ThreadRegistry::new(&metrics)?);
        let rpc_trace = Arc::new(RpcTracer::new(&metrics)?);
        let service_counters = ServiceCounters::register(&metrics)?;

        let env = Arc::new(Self {
            identity,
            started_at,
            metrics,
            readiness,
            threads,
            rpc_trace,
            service_counters,
            webserver: Mutex::new(None),
        });

        if config.webserver.enabled {
            let addr = SocketAddr::new(config.webserver.interface, config.webserver.port);
            let server = env.start_webserver(addr).await?;
            *env.webserver.lock().await = Some(server);
        } else {
            info!("Diagnostic webserver disabled");
        }

        Ok(env)
    }

    async fn start_webserver(&self, addr: SocketAddr) -> Result<DiagnosticServer> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind diagnostic webserver on {}", addr))?;
        let addr = listener.local_addr()?;

        let router = create_diagnostic_router(self.diagnostic_state());
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let task = self.threads.spawn(DIAGNOSTICS_CATEGORY, "webserver", async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.wait_for(|stop| *stop).await;
                })
                .await
        });

        info!("Diagnostic webserver listening on http://{}", addr);

        Ok(DiagnosticServer {
            addr,
            shutdown,
            task,
        })
    }

    fn diagnostic_state(&self) -> DiagnosticState {
        DiagnosticState {
            identity: self.identity.clone(),
            started_at: self.started_at,
            metrics: self.metrics.clone(),
            readiness: self.readiness.clone(),
            threads: self.threads.clone(),
            rpc_trace: self.rpc_trace.clone(),
        }
    }

    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    pub fn threads(&self) -> &Arc<ThreadRegistry> {
        &self.threads
    }

    pub fn rpc_trace(&self) -> &Arc<RpcTracer> {
        &self.rpc_trace
    }

    pub fn service_counters(&self) -> &ServiceCounters {
        &self.service_counters
    }

    /// Address the diagnostic endpoint is bound to, if it is running.
    pub async fn webserver_addr(&self) -> Option<SocketAddr> {
        self.webserver.lock().await.as_ref().map(|s| s.addr)
    }

    /// Stop the diagnostic endpoint. Called once all role services are gone.
    pub async fn shutdown(&self) {
        let Some(server) = self.webserver.lock().await.take() else {
            return;
        };

        let _ = server.shutdown.send(true);
        match server.task.await {
            Ok(Ok(())) => info!("Diagnostic webserver stopped"),
            Ok(Err(e)) => warn!("Diagnostic webserver exited with error: {}", e),
            Err(e) => warn!("Diagnostic webserver task failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_config(webserver_port: u16) -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.hostname = "node-1".to_string();
        config.webserver.interface = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config.webserver.port = webserver_port;
        config
    }

    async fn init_env(config: &DaemonConfig) -> Result<Arc<RuntimeEnvironment>> {
        let metrics = Arc::new(MetricsRegistry::new());
        let readiness = Readiness::register(&metrics)?;
        RuntimeEnvironment::init(
            ServiceIdentity::generate(&config.hostname, config.planner_port),
            config,
            metrics,
            readiness,
        )
        .await
    }

    #[tokio::test]
    async fn test_init_registers_process_metrics() {
        let mut config = test_config(0);
        config.webserver.enabled = false;

        let env = init_env(&config).await.unwrap();
        let snapshot = env.metrics().snapshot();

        assert_eq!(
            snapshot.properties.get("recordserviced.service-id").map(String::as_str),
            Some("recordserviced@node-1:12050")
        );
        assert!(snapshot.properties.contains_key("recordserviced.start-time"));
        assert!(env.webserver_addr().await.is_none());
    }

    #[tokio::test]
    async fn test_webserver_starts_and_stops() {
        let env = init_env(&test_config(0)).await.unwrap();

        let addr = env.webserver_addr().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(env.threads().live_count(), 1);

        env.shutdown().await;
        assert!(env.webserver_addr().await.is_none());
        assert_eq!(env.threads().live_count(), 0);
    }

    #[tokio::test]
    async fn test_webserver_bind_conflict_fails_init() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = match init_env(&test_config(port)).await {
            Ok(_) => panic!("init should fail when the webserver port is taken"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("diagnostic webserver"));
    }
}
