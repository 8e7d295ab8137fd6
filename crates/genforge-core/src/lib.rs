//! Core types and error definitions for genforge.
//!
//! This crate provides the foundational types shared across all genforge crates:
//! the unified error enum and the closed set of agent roles a session can staff.
//!
//! # Main types
//!
//! - [`GenforgeError`]: Unified error enum for all genforge subsystems.
//! - [`GenforgeResult`]: Convenience alias for `Result<T, GenforgeError>`.
//! - [`AgentRole`]: Capability an agent instance is bound to.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// --- Error types ---

/// Top-level error type for genforge.
///
/// Variants follow the failure classes of the orchestration core: graph
/// validation is fatal at session creation, task execution failures are retried
/// and contained, agent availability errors are scheduler invariant violations,
/// and session lookups surface to callers.
#[derive(Debug, thiserror::Error)]
pub enum GenforgeError {
    /// The task graph has unresolved dependencies or cycles.
    #[error("Graph validation failed: {}", .0.join("; "))]
    GraphValidation(Vec<String>),

    /// A task id was registered twice in the same session.
    #[error("Duplicate task: {0}")]
    DuplicateTask(String),

    /// No topological order exists for the task graph.
    #[error("Dependency cycle: {0}")]
    Cycle(String),

    /// A task id is not known to the registry.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// The agent-execution collaborator failed a task.
    #[error("Task execution error: {0}")]
    TaskExecution(String),

    /// An assignment was attempted on a busy, terminated, or missing agent.
    #[error("Agent unavailable: {0}")]
    AgentUnavailable(String),

    /// A state transition that the lifecycle does not allow.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// No session with the given id is held in memory.
    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    /// The session already reached a terminal status.
    #[error("Session {0} is already in a terminal state")]
    AlreadyTerminal(Uuid),

    /// The generation request was rejected before any session state was built.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// An error reported by the sandbox/preview collaborator.
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// An error reported by the notification collaborator.
    #[error("Notification error: {0}")]
    Notification(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An unexpected internal orchestrator failure.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GenforgeError {
    /// Whether the error is contained to a single task rather than aborting
    /// the whole session.
    pub fn is_task_local(&self) -> bool {
        matches!(self, GenforgeError::TaskExecution(_))
    }
}

/// A convenience `Result` alias using [`GenforgeError`].
pub type GenforgeResult<T> = Result<T, GenforgeError>;

// --- Agent roles ---

/// Capability an agent instance is bound to. A session holds at most one
/// agent per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    /// Requirement analysis and product specification.
    Analysis,
    /// System architecture and design.
    Design,
    /// Project planning and task breakdown.
    Planning,
    /// Application code.
    Implementation,
    /// Tests and quality checks.
    Verification,
    /// Deployment and runtime configuration.
    Operations,
}

impl AgentRole {
    /// Every role, in pipeline order.
    pub const ALL: [AgentRole; 6] = [
        AgentRole::Analysis,
        AgentRole::Design,
        AgentRole::Planning,
        AgentRole::Implementation,
        AgentRole::Verification,
        AgentRole::Operations,
    ];

    /// Lowercase name used in ids and wire payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Analysis => "analysis",
            AgentRole::Design => "design",
            AgentRole::Planning => "planning",
            AgentRole::Implementation => "implementation",
            AgentRole::Verification => "verification",
            AgentRole::Operations => "operations",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = GenforgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        AgentRole::ALL
            .into_iter()
            .find(|role| role.as_str() == lowered)
            .ok_or_else(|| GenforgeError::InvalidRequest(format!("unknown agent role '{s}'")))
    }
}
