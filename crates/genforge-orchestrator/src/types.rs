use crate::executor::ExecutionOutput;
use chrono::{DateTime, Utc};
use genforge_core::{GenforgeError, GenforgeResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

pub use genforge_core::AgentRole;

/// Identifier of a task, unique within its session.
pub type TaskId = String;

/// Identifier of an agent instance, unique within its session.
pub type AgentId = String;

/// Scheduling priority of a task. Ordering is `Low < Normal < High < Critical`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Status of a task in the session's dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether the task lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::{Cancelled, Completed, Failed, Pending, Running};
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Pending)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A unit of work bound to one agent role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: TaskId,
    pub role: AgentRole,
    /// Free-form label, e.g. `system_design`.
    pub task_type: String,
    pub description: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    /// Tasks that must be Completed before this one is schedulable.
    pub dependencies: BTreeSet<TaskId>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Request fields plus outputs of completed dependencies.
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    pub result: Option<ExecutionOutput>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest instant a retried task may be dispatched again.
    #[serde(default)]
    pub eligible_at: Option<DateTime<Utc>>,
}

impl AgentTask {
    /// Default retry budget for new tasks.
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    pub fn new(
        id: impl Into<TaskId>,
        role: AgentRole,
        task_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            role,
            task_type: task_type.into(),
            description: description.into(),
            priority: TaskPriority::Normal,
            status: TaskStatus::Pending,
            dependencies: BTreeSet::new(),
            retry_count: 0,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            context: HashMap::new(),
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            eligible_at: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Pending with every dependency in `completed_ids`.
    pub fn is_ready(&self, completed_ids: &HashSet<TaskId>) -> bool {
        self.status == TaskStatus::Pending
            && self.dependencies.iter().all(|dep| completed_ids.contains(dep))
    }

    /// Whether the retry budget allows another attempt after a failure.
    pub fn can_retry(&self) -> bool {
        self.status == TaskStatus::Failed && self.retry_count < self.max_retries
    }

    /// Completed, Cancelled, or Failed with the retry budget exhausted.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            TaskStatus::Completed | TaskStatus::Cancelled => true,
            TaskStatus::Failed => !self.can_retry(),
            TaskStatus::Pending | TaskStatus::Running => false,
        }
    }

    /// Whether the backoff window (if any) has elapsed at `now`.
    pub fn is_eligible_at(&self, now: DateTime<Utc>) -> bool {
        self.eligible_at.map_or(true, |at| at <= now)
    }

    pub(crate) fn transition(&mut self, next: TaskStatus) -> GenforgeResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(GenforgeError::InvalidTransition(format!(
                "task {}: {} -> {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }
}

/// Lifecycle state of an agent instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Idle,
    Initializing,
    Executing,
    Completed,
    Failed,
    Terminated,
}

impl AgentState {
    /// Every state, used for distribution statistics.
    pub const ALL: [AgentState; 6] = [
        AgentState::Idle,
        AgentState::Initializing,
        AgentState::Executing,
        AgentState::Completed,
        AgentState::Failed,
        AgentState::Terminated,
    ];

    /// Whether the agent lifecycle allows moving from `self` to `next`.
    ///
    /// Terminated is absorbing and reachable from every other state.
    pub fn can_transition_to(self, next: AgentState) -> bool {
        use AgentState::{Completed, Executing, Failed, Idle, Initializing, Terminated};
        match (self, next) {
            (Terminated, _) => false,
            (_, Terminated) => true,
            (Idle, Initializing) | (Initializing, Idle) => true,
            (Idle | Initializing | Completed | Failed, Executing) => true,
            (Executing, Completed) | (Executing, Failed) | (Initializing, Failed) => true,
            (Completed | Failed, Idle) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Idle => "idle",
            AgentState::Initializing => "initializing",
            AgentState::Executing => "executing",
            AgentState::Completed => "completed",
            AgentState::Failed => "failed",
            AgentState::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A role-bound execution slot within one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInstance {
    pub id: AgentId,
    pub role: AgentRole,
    pub state: AgentState,
    pub current_task: Option<TaskId>,
    pub completed_tasks: Vec<TaskId>,
    pub failed_tasks: Vec<TaskId>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl AgentInstance {
    pub fn new(id: impl Into<AgentId>, role: AgentRole) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            role,
            state: AgentState::Idle,
            current_task: None,
            completed_tasks: Vec::new(),
            failed_tasks: Vec::new(),
            created_at: now,
            last_activity: now,
        }
    }

    /// Idle or Completed agents may take a new task.
    pub fn is_available(&self) -> bool {
        matches!(self.state, AgentState::Idle | AgentState::Completed)
    }

    pub fn is_busy(&self) -> bool {
        self.state == AgentState::Executing
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

/// Status of an orchestration session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Initializing,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }

    /// Whether the session state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::{Cancelled, Completed, Failed, Initializing, Running};
        matches!(
            (self, next),
            (Initializing, Running)
                | (Initializing, Failed)
                | (Initializing, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
