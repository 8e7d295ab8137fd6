use crate::artifacts::{self, Artifact, ArtifactProcessor};
use crate::config::RetryBackoff;
use crate::executor::{AgentExecutor, ExecutionOutput, ExecutorTable, TaskContext};
use crate::sandbox::{SandboxId, SandboxService};
use crate::session::{OrchestrationSession, SessionHandle};
use crate::task_graph::TaskGraph;
use crate::types::{AgentId, AgentRole, SessionStatus, TaskId, TaskStatus};
use chrono::Utc;
use futures_util::future::join_all;
use genforge_core::{GenforgeError, GenforgeResult};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// One task bound to its agent and executor for the current batch.
struct Dispatch {
    task_id: TaskId,
    agent_id: AgentId,
    role: AgentRole,
    executor: Arc<dyn AgentExecutor>,
    ctx: TaskContext,
}

/// Next action of the scheduling loop.
enum Step {
    Dispatch(Vec<Dispatch>),
    /// Only retried tasks remain and their backoff has not elapsed.
    Wait(Duration),
    Finished,
    Stalled(String),
}

/// Drives one session from Running to a terminal status.
///
/// Each iteration dispatches at most one ready task per role, awaits the whole
/// batch, then applies results. After every task is terminal the runner
/// post-processes artifacts, hands code to the sandbox, and sets the final
/// status.
pub struct SessionRunner {
    handle: Arc<SessionHandle>,
    executors: ExecutorTable,
    processor: Arc<ArtifactProcessor>,
    backoff: RetryBackoff,
    sandbox: Option<Arc<dyn SandboxService>>,
    sandboxes: Arc<RwLock<HashMap<Uuid, SandboxId>>>,
}

impl SessionRunner {
    pub fn new(
        handle: Arc<SessionHandle>,
        executors: ExecutorTable,
        processor: Arc<ArtifactProcessor>,
        backoff: RetryBackoff,
    ) -> Self {
        Self {
            handle,
            executors,
            processor,
            backoff,
            sandbox: None,
            sandboxes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Hand code artifacts to `sandbox`, recording provisioned ids in `sandboxes`.
    pub fn with_sandbox(
        mut self,
        sandbox: Arc<dyn SandboxService>,
        sandboxes: Arc<RwLock<HashMap<Uuid, SandboxId>>>,
    ) -> Self {
        self.sandbox = Some(sandbox);
        self.sandboxes = sandboxes;
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run to completion. Internal invariant violations fail the session.
    pub async fn run(self) {
        let session_id = self.handle.id();
        let cancel = self.handle.cancellation_token();
        if let Err(e) = self.drive(&cancel).await {
            error!(session_id = %session_id, error = %e, "Orchestration aborted");
            let mut session = self.handle.state.lock().await;
            if !session.status().is_terminal() {
                if let Err(e) = session.transition_status(
                    SessionStatus::Failed,
                    format!("Internal orchestration error: {e}"),
                ) {
                    error!(session_id = %session_id, error = %e, "Could not mark session failed");
                }
            }
        }
    }

    async fn drive(&self, cancel: &CancellationToken) -> GenforgeResult<()> {
        let session_id = self.handle.id();
        {
            let mut session = self.handle.state.lock().await;
            if session.status().is_terminal() {
                return Ok(());
            }
            session.transition_status(SessionStatus::Running, "Orchestration started")?;
        }
        info!(session_id = %session_id, "Session loop started");

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let step = {
                let mut session = self.handle.state.lock().await;
                if session.status().is_terminal() {
                    return Ok(());
                }
                self.next_step(&mut session, cancel)?
            };

            match step {
                Step::Dispatch(batch) => {
                    let calls = batch
                        .iter()
                        .map(|d| d.executor.execute(d.role, &d.ctx));
                    let results = tokio::select! {
                        () = cancel.cancelled() => return Ok(()),
                        results = join_all(calls) => results,
                    };

                    let mut session = self.handle.state.lock().await;
                    if cancel.is_cancelled() || session.status().is_terminal() {
                        return Ok(());
                    }
                    for (dispatch, result) in batch.into_iter().zip(results) {
                        self.apply(&mut session, dispatch, result)?;
                    }
                }
                Step::Wait(delay) => {
                    tokio::select! {
                        () = cancel.cancelled() => return Ok(()),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Step::Stalled(diagnostic) => {
                    warn!(session_id = %session_id, diagnostic = %diagnostic, "Session stalled");
                    let mut session = self.handle.state.lock().await;
                    return session.transition_status(SessionStatus::Failed, diagnostic);
                }
                Step::Finished => break,
            }
        }

        self.finalize(cancel).await
    }

    /// Select the next batch: ready, eligible, at most one per role, and only
    /// for roles whose agent is available.
    fn next_step(
        &self,
        session: &mut OrchestrationSession,
        cancel: &CancellationToken,
    ) -> GenforgeResult<Step> {
        let session_id = session.id();
        let now = Utc::now();
        let completed = session.graph.completed_ids();
        let candidates: Vec<(TaskId, AgentRole)> = session
            .graph
            .ready(&completed)
            .into_iter()
            .filter(|t| t.is_eligible_at(now))
            .map(|t| (t.id.clone(), t.role))
            .collect();

        let mut roles_taken = HashSet::new();
        let mut batch = Vec::new();
        for (task_id, role) in candidates {
            if roles_taken.contains(&role) || !session.agents.role_available(role) {
                continue;
            }
            let Some(agent_id) = session.agents.get_by_role(role).map(|a| a.id.clone()) else {
                continue;
            };
            let executor = self.executors.resolve(role)?;
            let context = dependency_context(&session.graph, &task_id);

            let task = session.graph.get_mut(&task_id)?;
            session.agents.assign(&agent_id, task)?;
            let ctx = TaskContext {
                session_id,
                task_id: task.id.clone(),
                role,
                task_type: task.task_type.clone(),
                description: task.description.clone(),
                context,
                attempt: task.retry_count,
                cancel: cancel.clone(),
            };
            info!(
                session_id = %session_id,
                task_id = %task_id,
                role = %role,
                attempt = ctx.attempt,
                "Dispatching task"
            );
            session.emit_task(&task_id);
            roles_taken.insert(role);
            batch.push(Dispatch {
                task_id,
                agent_id,
                role,
                executor,
                ctx,
            });
        }

        if !batch.is_empty() {
            return Ok(Step::Dispatch(batch));
        }
        if session.graph.is_done() {
            return Ok(Step::Finished);
        }
        let next_eligible = session
            .graph
            .ready(&completed)
            .into_iter()
            .filter_map(|t| t.eligible_at)
            .filter(|at| *at > now)
            .min();
        if let Some(at) = next_eligible {
            let delay = (at - now).to_std().unwrap_or(Duration::ZERO);
            return Ok(Step::Wait(delay));
        }
        Ok(Step::Stalled(stall_diagnostic(&session.graph, &completed)))
    }

    fn apply(
        &self,
        session: &mut OrchestrationSession,
        dispatch: Dispatch,
        result: GenforgeResult<ExecutionOutput>,
    ) -> GenforgeResult<()> {
        let session_id = session.id();
        let Dispatch {
            task_id,
            agent_id,
            role,
            ..
        } = dispatch;

        match result {
            Ok(output) => {
                let task = session.graph.get_mut(&task_id)?;
                session.agents.complete(&agent_id, task, output)?;
                info!(session_id = %session_id, task_id = %task_id, role = %role, "Task completed");
                session.emit_task(&task_id);
                session.update_progress(format!("Task {task_id} completed"));
            }
            Err(e) => {
                let reason = e.to_string();
                let task = session.graph.get_mut(&task_id)?;
                session.agents.fail(&agent_id, task, &reason)?;
                session.agents.rearm(&agent_id)?;
                session.emit_task(&task_id);

                let (can_retry, retry_count) = session
                    .graph
                    .get(&task_id)
                    .map_or((false, 0), |t| (t.can_retry(), t.retry_count));
                if can_retry {
                    let delay = self.backoff.delay_for(retry_count + 1);
                    let eligible_at = Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                    session.graph.retry(&task_id, Some(eligible_at))?;
                    warn!(
                        session_id = %session_id,
                        task_id = %task_id,
                        role = %role,
                        error = %reason,
                        attempt = retry_count + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Task failed, retrying"
                    );
                    session.emit_task(&task_id);
                } else {
                    error!(
                        session_id = %session_id,
                        task_id = %task_id,
                        role = %role,
                        error = %reason,
                        "Task failed permanently"
                    );
                    for cancelled in session.graph.cancel_dependents(&task_id) {
                        session.emit_task(&cancelled);
                    }
                    session.set_message(format!("Task {task_id} failed: {reason}"));
                }
            }
        }
        Ok(())
    }

    /// Post-process artifacts, run the sandbox handoff, set the final status.
    async fn finalize(&self, cancel: &CancellationToken) -> GenforgeResult<()> {
        let session_id = self.handle.id();
        let for_sandbox = {
            let mut session = self.handle.state.lock().await;
            if session.status().is_terminal() {
                return Ok(());
            }
            let mut accepted = Vec::new();
            let mut rejected = Vec::new();
            for task in session.graph.tasks().filter(|t| t.status == TaskStatus::Completed) {
                if let Some(result) = &task.result {
                    let out = self
                        .processor
                        .process(session_id, &task.id, task.role, &result.artifacts);
                    accepted.extend(out.accepted);
                    rejected.extend(out.rejected);
                }
            }
            let has_code = artifacts::has_code(&accepted);
            session.set_artifacts(accepted, rejected);
            match &self.sandbox {
                Some(_) if has_code => Some(session.artifacts().to_vec()),
                _ => None,
            }
        };

        let mut note = None;
        if let (Some(sandbox), Some(artifacts)) = (&self.sandbox, for_sandbox) {
            let outcome = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                outcome = self.handoff(sandbox.as_ref(), session_id, &artifacts) => outcome,
            };
            match outcome {
                Ok(url) => {
                    info!(session_id = %session_id, url = %url, "Preview ready");
                    self.handle.state.lock().await.set_preview_url(url);
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Sandbox handoff failed");
                    note = Some(format!("preview unavailable: {e}"));
                }
            }
        }

        let mut session = self.handle.state.lock().await;
        if session.status().is_terminal() {
            return Ok(());
        }
        let stats = session.graph.statistics();
        let (status, message) = if stats.completed == stats.total {
            (
                SessionStatus::Completed,
                format!(
                    "Generated {} artifacts from {} tasks",
                    session.artifacts().len(),
                    stats.total
                ),
            )
        } else {
            let failed: Vec<String> = session
                .graph
                .tasks_with_status(TaskStatus::Failed)
                .iter()
                .map(|t| format!("{} ({})", t.id, t.error.as_deref().unwrap_or("unknown error")))
                .collect();
            (
                SessionStatus::Failed,
                format!(
                    "{} of {} tasks completed; failed: {}; cancelled: {}",
                    stats.completed,
                    stats.total,
                    failed.join(", "),
                    stats.cancelled
                ),
            )
        };
        let message = match note {
            Some(note) => format!("{message}; {note}"),
            None => message,
        };
        session.transition_status(status, message)
    }

    async fn handoff(
        &self,
        sandbox: &dyn SandboxService,
        session_id: Uuid,
        artifacts: &[Artifact],
    ) -> GenforgeResult<String> {
        let sandbox_id = sandbox.create(session_id).await?;
        {
            // Release takes this lock after claiming, so the flag and the
            // insert cannot interleave with it.
            let mut sandboxes = self.sandboxes.write().await;
            if self.handle.is_released() {
                drop(sandboxes);
                warn!(session_id = %session_id, sandbox_id = %sandbox_id, "Session released during provisioning");
                sandbox.cleanup(session_id, Some(&sandbox_id)).await?;
                return Err(GenforgeError::Sandbox(format!(
                    "session released before sandbox {sandbox_id} was recorded"
                )));
            }
            sandboxes.insert(session_id, sandbox_id.clone());
        }
        sandbox.write(&sandbox_id, artifacts).await?;
        sandbox.run(&sandbox_id).await
    }
}

/// The task's own context plus the raw output of each completed dependency,
/// keyed by dependency id.
fn dependency_context(graph: &TaskGraph, task_id: &str) -> HashMap<String, serde_json::Value> {
    let Some(task) = graph.get(task_id) else {
        return HashMap::new();
    };
    let mut context = task.context.clone();
    for dep in &task.dependencies {
        if let Some(result) = graph.get(dep).and_then(|d| d.result.as_ref()) {
            context.insert(dep.clone(), result.raw_output.clone());
        }
    }
    context
}

fn stall_diagnostic(graph: &TaskGraph, completed: &HashSet<TaskId>) -> String {
    let blocked: Vec<String> = graph
        .tasks_with_status(TaskStatus::Pending)
        .iter()
        .map(|t| {
            let unmet: Vec<&str> = t
                .dependencies
                .iter()
                .filter(|d| !completed.contains(*d))
                .map(String::as_str)
                .collect();
            if unmet.is_empty() {
                format!("{} (agent unavailable)", t.id)
            } else {
                format!("{} waiting on {}", t.id, unmet.join(", "))
            }
        })
        .collect();
    format!("Scheduling stalled: {}", blocked.join("; "))
}
