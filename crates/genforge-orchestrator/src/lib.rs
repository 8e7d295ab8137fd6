//! Dependency-aware multi-agent orchestration for application generation.
//!
//! A session owns a DAG of role-bound tasks and one agent per role. The
//! scheduling loop dispatches ready tasks concurrently (at most one per role),
//! retries failures with backoff, contains exhausted failures to their
//! dependents, then post-processes the produced artifacts and hands code to a
//! sandbox for preview.
//!
//! # Main types
//!
//! - [`OrchestratorService`]: Owns all sessions, background loops, and the observation surface.
//! - [`TaskGraph`]: Task registry with dependency validation, readiness, and topological order.
//! - [`AgentStateManager`]: Per-session agent lifecycle and bookkeeping.
//! - [`OrchestrationSession`]: Aggregate root tying tasks, agents, and artifacts together.
//! - [`ArtifactProcessor`]: Classification, validation, and scoring of generated files.
//! - [`AgentExecutor`] / [`SandboxService`] / [`Notifier`]: Collaborator seams.

/// Agent instance lifecycle and observers.
pub mod agent_state;
/// Artifact post-processing.
pub mod artifacts;
/// Service configuration and retry backoff.
pub mod config;
/// Per-session scheduling loop.
pub mod engine;
/// Notification events and the bounded delivery channel.
pub mod events;
/// Agent-execution collaborator and role dispatch table.
pub mod executor;
/// Generation requests and pipeline planning.
pub mod planner;
/// Sandbox collaborator.
pub mod sandbox;
/// Process-wide session ownership and lifecycle.
pub mod service;
/// Session aggregate and status reports.
pub mod session;
/// Dependency graph over a session's tasks.
pub mod task_graph;
/// Shared orchestration types (AgentTask, AgentInstance, statuses).
pub mod types;

pub use agent_state::{AgentMetrics, AgentObserver, AgentStateManager, AgentStatistics};
pub use artifacts::{
    Artifact, ArtifactKind, ArtifactMetadata, ArtifactProcessor, ArtifactStatistics, RawArtifact,
    Rejection,
};
pub use config::{ArtifactConfig, BackoffStrategy, OrchestratorConfig, RetryBackoff};
pub use engine::SessionRunner;
pub use events::{EventSink, Notifier, OrchestrationEvent, SessionEvent, TracingNotifier};
pub use executor::{AgentExecutor, ExecutionOutput, ExecutorTable, TaskContext};
pub use planner::{plan_tasks, AppType, GenerationRequest};
pub use sandbox::{SandboxId, SandboxService};
pub use service::{OrchestratorService, ServiceStatistics};
pub use session::{AgentStatusReport, OrchestrationSession, SessionHandle, SessionStatusReport};
pub use task_graph::{TaskGraph, TaskStatistics};
pub use types::{
    AgentId, AgentInstance, AgentRole, AgentState, AgentTask, SessionStatus, TaskId, TaskPriority,
    TaskStatus,
};
