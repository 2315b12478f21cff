//! Execution service shared by the planner and worker roles.
//!
//! The daemon only needs a constructor and the two role entry points; the
//! query engine behind them lives elsewhere. `LocalExecutionService` is the
//! built-in implementation used when no engine is plugged in.

use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prometheus::IntCounter;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::environment::RuntimeEnvironment;
use crate::metrics::MetricsRegistry;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
    /// Request text, one statement per `;`.
    pub request: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: Uuid,
    pub task: String,
    /// Service ids of the daemons able to run the task.
    pub hosts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanResult {
    pub request_id: Uuid,
    pub planned_by: String,
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecTaskRequest {
    pub task_id: Uuid,
    pub task: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecTaskResult {
    pub handle: Uuid,
    pub task_id: Uuid,
    pub executed_by: String,
    pub accepted_at: DateTime<Utc>,
}

/// Handles both planner-role and worker-role calls.
#[async_trait]
pub trait ExecutionService: Send + Sync {
    async fn plan_request(&self, request: PlanRequest) -> Result<PlanResult>;

    async fn exec_task(&self, request: ExecTaskRequest) -> Result<ExecTaskResult>;
}

/// Construct the single service instance shared by every enabled role.
pub fn create_service_instance(env: &Arc<RuntimeEnvironment>) -> Arc<dyn ExecutionService> {
    Arc::new(LocalExecutionService::new(env))
}

/// Request counters of the execution service, registered by the
/// environment at startup.
#[derive(Clone)]
pub struct ServiceCounters {
    pub planned_requests: IntCounter,
    pub accepted_tasks: IntCounter,
}

impl ServiceCounters {
    pub fn register(metrics: &MetricsRegistry) -> Result<Self> {
        Ok(Self {
            planned_requests: metrics.counter(
                "recordservice.planner.requests",
                "Plan requests handled by this daemon",
            )?,
            accepted_tasks: metrics.counter(
                "recordservice.worker.tasks",
                "Tasks accepted by this daemon",
            )?,
        })
    }
}

/// Plans each statement as one task on this daemon and accepts every task.
pub struct LocalExecutionService {
    service_id: String,
    counters: ServiceCounters,
}

impl LocalExecutionService {
    pub fn new(env: &RuntimeEnvironment) -> Self {
        Self {
            service_id: env.identity().to_string(),
            counters: env.service_counters().clone(),
        }
    }
}

#[async_trait]
impl ExecutionService for LocalExecutionService {
    async fn plan_request(&self, request: PlanRequest) -> Result<PlanResult> {
        let tasks: Vec<TaskSpec> = request
            .request
            .split(';')
            .map(str::trim)
            .filter(|stmt| !stmt.is_empty())
            .map(|stmt| TaskSpec {
                task_id: Uuid::new_v4(),
                task: stmt.to_string(),
                hosts: vec![self.service_id.clone()],
            })
            .collect();

        if tasks.is_empty() {
            bail!("plan request contains no statements");
        }

        self.counters.planned_requests.inc();
        Ok(PlanResult {
            request_id: Uuid::new_v4(),
            planned_by: self.service_id.clone(),
            tasks,
        })
    }

    async fn exec_task(&self, request: ExecTaskRequest) -> Result<ExecTaskResult> {
        if request.task.trim().is_empty() {
            bail!("task {} has an empty body", request.task_id);
        }

        self.counters.accepted_tasks.inc();
        Ok(ExecTaskResult {
            handle: Uuid::new_v4(),
            task_id: request.task_id,
            executed_by: self.service_id.clone(),
            accepted_at: Utc::now(),
        })
    }
}
