use crate::artifacts::RawArtifact;
use crate::types::{AgentRole, TaskId};
use async_trait::async_trait;
use genforge_core::{GenforgeError, GenforgeResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Everything the agent-execution collaborator needs to run one task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub session_id: Uuid,
    pub task_id: TaskId,
    pub role: AgentRole,
    pub task_type: String,
    pub description: String,
    /// Request fields merged with outputs of completed dependencies,
    /// keyed by dependency task id.
    pub context: HashMap<String, serde_json::Value>,
    /// Zero-based attempt number (equals the task's retry count).
    pub attempt: u32,
    /// Cancelled when the owning session is cancelled. Executors should stop
    /// at their next await point once this fires.
    pub cancel: CancellationToken,
}

/// Output of a successful task execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub artifacts: Vec<RawArtifact>,
    pub raw_output: serde_json::Value,
}

impl ExecutionOutput {
    pub fn new(raw_output: serde_json::Value) -> Self {
        Self {
            artifacts: Vec::new(),
            raw_output,
        }
    }

    pub fn with_artifact(mut self, artifact: RawArtifact) -> Self {
        self.artifacts.push(artifact);
        self
    }
}

/// The external service that produces agent output for a task.
///
/// Implementations typically wrap an LLM-backed agent runtime. A returned error
/// is treated as a task execution failure and is subject to the task's retry
/// budget.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, role: AgentRole, ctx: &TaskContext) -> GenforgeResult<ExecutionOutput>;
}

/// Closed role → executor dispatch table, built once at startup.
#[derive(Clone, Default)]
pub struct ExecutorTable {
    analysis: Option<Arc<dyn AgentExecutor>>,
    design: Option<Arc<dyn AgentExecutor>>,
    planning: Option<Arc<dyn AgentExecutor>>,
    implementation: Option<Arc<dyn AgentExecutor>>,
    verification: Option<Arc<dyn AgentExecutor>>,
    operations: Option<Arc<dyn AgentExecutor>>,
}

impl ExecutorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table routing every role to the same executor.
    pub fn uniform(executor: Arc<dyn AgentExecutor>) -> Self {
        AgentRole::ALL
            .into_iter()
            .fold(Self::new(), |table, role| table.with(role, Arc::clone(&executor)))
    }

    /// Route `role` to `executor`, replacing any previous entry.
    pub fn with(mut self, role: AgentRole, executor: Arc<dyn AgentExecutor>) -> Self {
        *self.slot_mut(role) = Some(executor);
        self
    }

    pub fn supports(&self, role: AgentRole) -> bool {
        self.slot(role).is_some()
    }

    /// Resolve the executor bound to `role`.
    pub fn resolve(&self, role: AgentRole) -> GenforgeResult<Arc<dyn AgentExecutor>> {
        self.slot(role).clone().ok_or_else(|| {
            GenforgeError::Orchestrator(format!("no executor registered for role {role}"))
        })
    }

    fn slot(&self, role: AgentRole) -> &Option<Arc<dyn AgentExecutor>> {
        match role {
            AgentRole::Analysis => &self.analysis,
            AgentRole::Design => &self.design,
            AgentRole::Planning => &self.planning,
            AgentRole::Implementation => &self.implementation,
            AgentRole::Verification => &self.verification,
            AgentRole::Operations => &self.operations,
        }
    }

    fn slot_mut(&mut self, role: AgentRole) -> &mut Option<Arc<dyn AgentExecutor>> {
        match role {
            AgentRole::Analysis => &mut self.analysis,
            AgentRole::Design => &mut self.design,
            AgentRole::Planning => &mut self.planning,
            AgentRole::Implementation => &mut self.implementation,
            AgentRole::Verification => &mut self.verification,
            AgentRole::Operations => &mut self.operations,
        }
    }
}

impl std::fmt::Debug for ExecutorTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let roles: Vec<_> = AgentRole::ALL
            .into_iter()
            .filter(|role| self.supports(*role))
            .collect();
        f.debug_struct("ExecutorTable").field("roles", &roles).finish()
    }
}
