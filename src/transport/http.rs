//! JSON-over-HTTP transport for the planner and worker roles.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::{ServiceHandle, Transport};
use crate::environment::{RpcTracer, RuntimeEnvironment, ThreadRegistry};
use crate::roles::Role;
use crate::service::{ExecTaskRequest, ExecTaskResult, ExecutionService, PlanRequest, PlanResult};

/// Version reported by `GET /rpc/protocol_version`.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Instrumentation category for role service loops.
const RPC_CATEGORY: &str = "rpc";

type RpcError = (StatusCode, Json<Value>);

#[derive(Clone)]
struct RoleState {
    role: Role,
    service: Arc<dyn ExecutionService>,
    tracer: Arc<RpcTracer>,
}

impl RoleState {
    fn trace<T>(&self, method: &str, started: Instant, result: Result<T>) -> Result<Json<T>, RpcError> {
        self.tracer
            .record(self.role.as_str(), method, started.elapsed(), result.is_ok());
        result.map(Json).map_err(|e| {
            tracing::warn!(role = %self.role, method, "RPC failed: {:#}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": format!("{:#}", e) })),
            )
        })
    }
}

/// Routes served by one role's listener.
pub fn create_role_router(
    role: Role,
    service: Arc<dyn ExecutionService>,
    tracer: Arc<RpcTracer>,
) -> Router {
    let router = Router::new().route("/rpc/protocol_version", get(protocol_version));
    let router = match role {
        Role::Planner => router.route("/rpc/plan_request", post(plan_request)),
        Role::Worker => router.route("/rpc/exec_task", post(exec_task)),
    };

    router
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(RoleState {
            role,
            service,
            tracer,
        })
}

async fn protocol_version(State(state): State<RoleState>) -> Json<Value> {
    Json(serde_json::json!({
        "role": state.role,
        "version": PROTOCOL_VERSION,
    }))
}

async fn plan_request(
    State(state): State<RoleState>,
    Json(request): Json<PlanRequest>,
) -> Result<Json<PlanResult>, RpcError> {
    let started = Instant::now();
    let result = state.service.plan_request(request).await;
    state.trace("plan_request", started, result)
}

async fn exec_task(
    State(state): State<RoleState>,
    Json(request): Json<ExecTaskRequest>,
) -> Result<Json<ExecTaskResult>, RpcError> {
    let started = Instant::now();
    let result = state.service.exec_task(request).await;
    state.trace("exec_task", started, result)
}

/// Binds role listeners on a fixed interface.
pub struct HttpTransport {
    interface: IpAddr,
}

impl HttpTransport {
    pub fn new(interface: IpAddr) -> Self {
        Self { interface }
    }
}

impl Transport for HttpTransport {
    fn bind(
        &self,
        role: Role,
        port: u16,
        service: Arc<dyn ExecutionService>,
        env: Arc<RuntimeEnvironment>,
    ) -> Result<Arc<dyn ServiceHandle>> {
        let router = create_role_router(role, service, env.rpc_trace().clone());
        Ok(Arc::new(HttpServiceHandle::new(
            role,
            SocketAddr::new(self.interface, port),
            router,
            env.threads().clone(),
        )))
    }
}

pub struct HttpServiceHandle {
    role: Role,
    addr: SocketAddr,
    router: std::sync::Mutex<Option<Router>>,
    threads: Arc<ThreadRegistry>,
    bound_port: AtomicU16,
    running: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<std::io::Result<()>>>>,
}

impl HttpServiceHandle {
    pub fn new(role: Role, addr: SocketAddr, router: Router, threads: Arc<ThreadRegistry>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            role,
            addr,
            router: std::sync::Mutex::new(Some(router)),
            threads,
            bound_port: AtomicU16::new(0),
            running: Arc::new(AtomicBool::new(false)),
            shutdown,
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ServiceHandle for HttpServiceHandle {
    fn role(&self) -> Role {
        self.role
    }

    fn bound_port(&self) -> u16 {
        self.bound_port.load(Ordering::Acquire)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    async fn start(&self) -> Result<()> {
        let router = self
            .router
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| anyhow!("{} service already started", self.role))?;

        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("Failed to bind {} service on {}", self.role, self.addr))?;
        let addr = listener.local_addr()?;

        self.bound_port.store(addr.port(), Ordering::Release);
        self.running.store(true, Ordering::Release);

        let running = self.running.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        let task = self.threads.spawn(RPC_CATEGORY, self.role.as_str(), async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.wait_for(|stop| *stop).await;
                })
                .await;
            running.store(false, Ordering::Release);
            result
        });
        *self.task.lock().await = Some(task);

        info!(role = %self.role, "RPC service listening on {}", addr);
        Ok(())
    }

    async fn wait(&self) -> Result<()> {
        let Some(task) = self.task.lock().await.take() else {
            return Ok(());
        };

        task.await
            .with_context(|| format!("{} service task panicked", self.role))?
            .with_context(|| format!("{} service loop failed", self.role))
    }

    fn stop(&self) {
        // Stored even without a live receiver, so a stop before start holds.
        self.shutdown.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRegistry;
    use crate::service::TaskSpec;
    use axum::body::Body;
    use axum::http::{Request, header};
    use std::net::Ipv4Addr;
    use tower::ServiceExt;
    use uuid::Uuid;

    struct EchoService;

    #[async_trait]
    impl ExecutionService for EchoService {
        async fn plan_request(&self, request: PlanRequest) -> Result<PlanResult> {
            if request.request == "fail" {
                return Err(anyhow!("planner unavailable"));
            }
            Ok(PlanResult {
                request_id: Uuid::nil(),
                planned_by: "echo".to_string(),
                tasks: vec![TaskSpec {
                    task_id: Uuid::nil(),
                    task: request.request,
                    hosts: vec![],
                }],
            })
        }

        async fn exec_task(&self, request: ExecTaskRequest) -> Result<ExecTaskResult> {
            Ok(ExecTaskResult {
                handle: Uuid::nil(),
                task_id: request.task_id,
                executed_by: "echo".to_string(),
                accepted_at: chrono::Utc::now(),
            })
        }
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn loopback_handle(role: Role, port: u16) -> HttpServiceHandle {
        let metrics = MetricsRegistry::new();
        let tracer = Arc::new(RpcTracer::new(&metrics).unwrap());
        let router = create_role_router(role, Arc::new(EchoService), tracer);
        HttpServiceHandle::new(
            role,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            router,
            Arc::new(ThreadRegistry::new(&metrics).unwrap()),
        )
    }

    #[tokio::test]
    async fn test_planner_routes_plan_request_and_traces_it() {
        let tracer = Arc::new(RpcTracer::new(&MetricsRegistry::new()).unwrap());
        let router = create_role_router(Role::Planner, Arc::new(EchoService), tracer.clone());

        let response = router
            .oneshot(post_json("/rpc/plan_request", serde_json::json!({"request": "scan t1"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let summary = tracer.summary();
        assert_eq!(summary[0].service, "planner");
        assert_eq!(summary[0].method, "plan_request");
        assert_eq!(summary[0].errors, 0);
    }

    #[tokio::test]
    async fn test_failed_rpc_is_traced_as_error() {
        let tracer = Arc::new(RpcTracer::new(&MetricsRegistry::new()).unwrap());
        let router = create_role_router(Role::Planner, Arc::new(EchoService), tracer.clone());

        let response = router
            .oneshot(post_json("/rpc/plan_request", serde_json::json!({"request": "fail"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(tracer.summary()[0].errors, 1);
    }

    #[tokio::test]
    async fn test_worker_does_not_serve_planner_routes() {
        let tracer = Arc::new(RpcTracer::new(&MetricsRegistry::new()).unwrap());
        let router = create_role_router(Role::Worker, Arc::new(EchoService), tracer);

        let response = router
            .oneshot(post_json("/rpc/plan_request", serde_json::json!({"request": "scan t1"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_start_accepts_connections_until_stopped() {
        let handle = loopback_handle(Role::Worker, 0);
        assert!(!handle.is_running());

        handle.start().await.unwrap();
        assert!(handle.is_running());
        let port = handle.bound_port();
        assert_ne!(port, 0);

        tokio::net::TcpStream::connect((Ipv4Addr::LOCALHOST, port))
            .await
            .unwrap();

        handle.stop();
        handle.wait().await.unwrap();
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_start_fails_when_port_is_taken() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let handle = loopback_handle(Role::Planner, port);
        let err = handle.start().await.unwrap_err();
        assert!(err.to_string().contains("Failed to bind planner service"));
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_wait_without_start_returns() {
        let handle = loopback_handle(Role::Planner, 0);
        handle.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let handle = loopback_handle(Role::Worker, 0);
        handle.start().await.unwrap();
        assert!(handle.start().await.is_err());
        handle.stop();
        handle.wait().await.unwrap();
    }
}
