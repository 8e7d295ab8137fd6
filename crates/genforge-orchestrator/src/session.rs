use crate::agent_state::{AgentMetrics, AgentStateManager};
use crate::artifacts::{Artifact, Rejection};
use crate::events::{EventSink, OrchestrationEvent};
use crate::task_graph::{TaskGraph, TaskStatistics};
use crate::types::{AgentId, AgentRole, AgentState, AgentTask, SessionStatus, TaskId};
use chrono::{DateTime, Utc};
use genforge_core::{GenforgeError, GenforgeResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// Aggregate root for one generation request: tasks, agents, artifacts, and
/// the session-level status.
#[derive(Debug)]
pub struct OrchestrationSession {
    id: Uuid,
    status: SessionStatus,
    progress: u8,
    message: String,
    pub(crate) graph: TaskGraph,
    pub(crate) agents: AgentStateManager,
    artifacts: Vec<Artifact>,
    rejected: Vec<Rejection>,
    preview_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    sink: EventSink,
    status_tx: watch::Sender<SessionStatus>,
}

impl OrchestrationSession {
    /// Register `tasks`, validate the graph, and create one agent per role.
    ///
    /// A graph with missing dependencies or cycles is rejected with
    /// [`GenforgeError::GraphValidation`].
    pub fn new(id: Uuid, tasks: Vec<AgentTask>, sink: EventSink) -> GenforgeResult<Self> {
        let mut graph = TaskGraph::new();
        let roles: BTreeSet<AgentRole> = tasks.iter().map(|t| t.role).collect();
        for task in tasks {
            graph.add(task)?;
        }
        let errors = graph.validate();
        if !errors.is_empty() {
            return Err(GenforgeError::GraphValidation(errors));
        }

        let mut agents = AgentStateManager::new(id, sink.clone());
        for role in roles {
            agents.create(role)?;
        }

        let now = Utc::now();
        let (status_tx, _) = watch::channel(SessionStatus::Initializing);
        Ok(Self {
            id,
            status: SessionStatus::Initializing,
            progress: 0,
            message: "Session created".into(),
            graph,
            agents,
            artifacts: Vec::new(),
            rejected: Vec::new(),
            preview_url: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
            sink,
            status_tx,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn agents(&self) -> &AgentStateManager {
        &self.agents
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    pub fn rejected(&self) -> &[Rejection] {
        &self.rejected
    }

    pub fn preview_url(&self) -> Option<&str> {
        self.preview_url.as_deref()
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Receiver that observes every status change.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    /// Move to `next`, stamping `finished_at` on terminal states.
    pub fn transition_status(
        &mut self,
        next: SessionStatus,
        message: impl Into<String>,
    ) -> GenforgeResult<()> {
        if !self.status.can_transition_to(next) {
            if self.status.is_terminal() {
                return Err(GenforgeError::AlreadyTerminal(self.id));
            }
            return Err(GenforgeError::InvalidTransition(format!(
                "session {}: {} -> {next}",
                self.id, self.status
            )));
        }
        let from = self.status;
        self.status = next;
        self.message = message.into();
        self.updated_at = Utc::now();
        if next.is_terminal() {
            self.finished_at = Some(self.updated_at);
        }
        if next == SessionStatus::Completed {
            self.progress = 100;
        }
        info!(
            session_id = %self.id,
            from = %from,
            to = %next,
            progress = self.progress,
            message = %self.message,
            "Session status changed"
        );
        self.status_tx.send_replace(next);
        self.emit_status();
        Ok(())
    }

    /// Recompute progress from completed tasks. Never decreases.
    pub fn update_progress(&mut self, message: impl Into<String>) {
        let total = self.graph.len();
        let completed = self.graph.statistics().completed;
        let computed = if total == 0 {
            100
        } else {
            (completed * 100 / total) as u8
        };
        self.progress = self.progress.max(computed);
        self.message = message.into();
        self.updated_at = Utc::now();
        self.emit_status();
    }

    pub(crate) fn set_message(&mut self, message: impl Into<String>) {
        self.message = message.into();
        self.updated_at = Utc::now();
    }

    pub(crate) fn set_artifacts(&mut self, accepted: Vec<Artifact>, rejected: Vec<Rejection>) {
        self.artifacts = accepted;
        self.rejected = rejected;
        self.sink.emit(
            self.id,
            OrchestrationEvent::ArtifactsReady {
                count: self.artifacts.len(),
            },
        );
    }

    pub(crate) fn set_preview_url(&mut self, url: String) {
        self.sink
            .emit(self.id, OrchestrationEvent::PreviewReady { url: url.clone() });
        self.preview_url = Some(url);
    }

    /// Notify listeners of the current state of `task_id`.
    pub(crate) fn emit_task(&self, task_id: &str) {
        if let Some(task) = self.graph.get(task_id) {
            self.sink.emit(
                self.id,
                OrchestrationEvent::TaskStatus {
                    task_id: task.id.clone(),
                    role: task.role,
                    status: task.status,
                    retry_count: task.retry_count,
                    error: task.error.clone(),
                },
            );
        }
    }

    fn emit_status(&self) {
        self.sink.emit(
            self.id,
            OrchestrationEvent::SessionStatus {
                status: self.status,
                progress: self.progress,
                message: self.message.clone(),
            },
        );
    }

    /// Terminate executing agents, cancel open tasks, and mark the session
    /// Cancelled.
    pub fn cancel(&mut self, reason: &str) -> GenforgeResult<CancelSummary> {
        if self.status.is_terminal() {
            return Err(GenforgeError::AlreadyTerminal(self.id));
        }
        let terminated_agents = self.agents.terminate_executing();
        let cancelled_tasks = self.graph.cancel_open(reason);
        for task_id in &cancelled_tasks {
            self.emit_task(task_id);
        }
        self.transition_status(SessionStatus::Cancelled, reason)?;
        Ok(CancelSummary {
            terminated_agents,
            cancelled_tasks,
        })
    }

    /// Terminal and finished at least `grace` ago.
    pub fn is_expired(&self, now: DateTime<Utc>, grace: chrono::Duration) -> bool {
        self.status.is_terminal() && self.finished_at.is_some_and(|at| at + grace <= now)
    }

    pub fn status_report(&self) -> SessionStatusReport {
        SessionStatusReport {
            session_id: self.id,
            status: self.status,
            progress: self.progress,
            message: self.message.clone(),
            agents: self
                .agents
                .all()
                .map(|a| AgentStatusReport {
                    agent_id: a.id.clone(),
                    role: a.role,
                    state: a.state,
                    current_task: a.current_task.clone(),
                    last_activity: a.last_activity,
                    metrics: self.agents.metrics(&a.id),
                })
                .collect(),
            tasks: self.graph.statistics(),
            artifact_count: self.artifacts.len(),
            rejected_artifacts: self.rejected.clone(),
            preview_url: self.preview_url.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// What a cancellation touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CancelSummary {
    pub terminated_agents: Vec<AgentId>,
    pub cancelled_tasks: Vec<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatusReport {
    pub agent_id: AgentId,
    pub role: AgentRole,
    pub state: AgentState,
    pub current_task: Option<TaskId>,
    pub last_activity: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<AgentMetrics>,
}

/// Snapshot returned by `get_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatusReport {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub progress: u8,
    pub message: String,
    pub agents: Vec<AgentStatusReport>,
    pub tasks: TaskStatistics,
    pub artifact_count: usize,
    /// Outputs dropped by the artifact processor, with the reason.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected_artifacts: Vec<Rejection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Shared handle to a running session.
#[derive(Debug)]
pub struct SessionHandle {
    id: Uuid,
    pub(crate) state: Mutex<OrchestrationSession>,
    pub(crate) cancel: CancellationToken,
    status_rx: watch::Receiver<SessionStatus>,
    released: AtomicBool,
}

impl SessionHandle {
    pub fn new(session: OrchestrationSession) -> Self {
        let status_rx = session.subscribe();
        Self {
            id: session.id(),
            state: Mutex::new(session),
            cancel: CancellationToken::new(),
            status_rx,
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Latest status without taking the session lock.
    pub fn current_status(&self) -> SessionStatus {
        *self.status_rx.borrow()
    }

    /// Resolve once the session reaches a terminal status.
    pub async fn wait_terminal(&self) -> SessionStatus {
        let mut rx = self.status_rx.clone();
        // Err means the session was dropped; report its last status.
        let _ = rx.wait_for(|s| s.is_terminal()).await;
        *self.status_rx.borrow()
    }

    /// True exactly once; later callers get false.
    pub(crate) fn claim_release(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}
