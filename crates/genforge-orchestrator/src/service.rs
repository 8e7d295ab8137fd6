use crate::agent_state::{AgentObserver, AgentStatistics};
use crate::artifacts::{self, Artifact, ArtifactProcessor, ArtifactStatistics};
use crate::config::OrchestratorConfig;
use crate::engine::SessionRunner;
use crate::events::{spawn_dispatcher, EventSink, Notifier, SessionEvent, TracingNotifier};
use crate::executor::ExecutorTable;
use crate::planner::{plan_tasks, GenerationRequest};
use crate::sandbox::{SandboxId, SandboxService};
use crate::session::{OrchestrationSession, SessionHandle, SessionStatusReport};
use crate::task_graph::TaskStatistics;
use crate::types::{AgentTask, SessionStatus};
use chrono::Utc;
use genforge_core::{GenforgeError, GenforgeResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Aggregate counts across every live session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatistics {
    pub total_sessions: usize,
    pub by_status: BTreeMap<String, usize>,
    pub active_sandboxes: usize,
    /// Task counts summed over sessions.
    pub tasks: TaskStatistics,
    /// Agent state distribution summed over sessions.
    pub agents: AgentStatistics,
    /// Accepted artifacts across sessions.
    pub artifacts: ArtifactStatistics,
    pub rejected_artifacts: usize,
}

/// State shared between the service and its cleanup loop.
struct Registry {
    sessions: RwLock<HashMap<Uuid, Arc<SessionHandle>>>,
    sandboxes: Arc<RwLock<HashMap<Uuid, SandboxId>>>,
    sandbox: OnceLock<Arc<dyn SandboxService>>,
    grace: chrono::Duration,
}

impl Registry {
    /// Release sandbox resources for `handle`, at most once per session.
    async fn release(&self, handle: &SessionHandle) {
        if !handle.claim_release() {
            return;
        }
        let session_id = handle.id();
        let sandbox_id = self.sandboxes.write().await.remove(&session_id);
        let Some(sandbox) = self.sandbox.get() else {
            return;
        };
        match sandbox.cleanup(session_id, sandbox_id.as_ref()).await {
            Ok(()) => debug!(session_id = %session_id, "Sandbox resources released"),
            Err(e) => warn!(session_id = %session_id, error = %e, "Sandbox cleanup failed"),
        }
    }

    async fn evict_expired(&self) -> Vec<Uuid> {
        let now = Utc::now();
        let mut expired = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (id, handle) in sessions.iter() {
                if handle.state.lock().await.is_expired(now, self.grace) {
                    expired.push(*id);
                }
            }
        }
        for id in &expired {
            let removed = self.sessions.write().await.remove(id);
            if let Some(handle) = removed {
                self.release(&handle).await;
                info!(session_id = %id, "Evicted expired session");
            }
        }
        expired
    }
}

/// Owns every session of the process and the background loops that serve them.
///
/// Construct once at startup, call [`start`](Self::start) to begin delivering
/// notifications and evicting expired sessions, and [`stop`](Self::stop) on
/// shutdown.
pub struct OrchestratorService {
    config: OrchestratorConfig,
    executors: ExecutorTable,
    processor: Arc<ArtifactProcessor>,
    notifier: Arc<dyn Notifier>,
    observers: Vec<Arc<dyn AgentObserver>>,
    registry: Arc<Registry>,
    sink: EventSink,
    receiver: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
    runners: Mutex<Vec<JoinHandle<()>>>,
}

impl OrchestratorService {
    pub fn new(config: OrchestratorConfig, executors: ExecutorTable) -> GenforgeResult<Self> {
        let processor = Arc::new(ArtifactProcessor::new(&config.artifacts)?);
        let (sink, receiver) = EventSink::channel(config.notification_buffer);
        let grace = chrono::Duration::from_std(config.cleanup_grace())
            .map_err(|e| GenforgeError::Config(format!("cleanup_grace_secs: {e}")))?;
        Ok(Self {
            registry: Arc::new(Registry {
                sessions: RwLock::new(HashMap::new()),
                sandboxes: Arc::new(RwLock::new(HashMap::new())),
                sandbox: OnceLock::new(),
                grace,
            }),
            config,
            executors,
            processor,
            notifier: Arc::new(TracingNotifier),
            observers: Vec::new(),
            sink,
            receiver: Mutex::new(Some(receiver)),
            shutdown: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
            runners: Mutex::new(Vec::new()),
        })
    }

    /// Use `sandbox` for previews of sessions created from now on. Only the
    /// first sandbox configured is kept.
    pub fn with_sandbox(self, sandbox: Arc<dyn SandboxService>) -> Self {
        if self.registry.sandbox.set(sandbox).is_err() {
            warn!("Sandbox already configured, ignoring replacement");
        }
        self
    }

    /// Register `observer` on the agents of every session created from now on.
    pub fn with_agent_observer(mut self, observer: Arc<dyn AgentObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Spawn the notification dispatcher and the eviction loop.
    pub async fn start(&self) -> GenforgeResult<()> {
        let receiver = self
            .receiver
            .lock()
            .await
            .take()
            .ok_or_else(|| GenforgeError::Orchestrator("service already started".into()))?;

        let dispatcher = spawn_dispatcher(receiver, Arc::clone(&self.notifier), self.shutdown.clone());

        let registry = Arc::clone(&self.registry);
        let shutdown = self.shutdown.clone();
        let period = self.config.cleanup_interval();
        let cleanup = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = registry.evict_expired().await;
                        if !evicted.is_empty() {
                            info!(count = evicted.len(), "Cleanup sweep finished");
                        }
                    }
                }
            }
            debug!("Cleanup loop stopped");
        });

        self.background.lock().await.extend([dispatcher, cleanup]);
        info!(
            cleanup_interval_secs = self.config.cleanup_interval_secs,
            grace_secs = self.config.cleanup_grace_secs,
            "Orchestrator service started"
        );
        Ok(())
    }

    /// Cancel sessions still in flight, wait for their runners, then stop the
    /// background loops. Buffered notifications are flushed first.
    pub async fn stop(&self) {
        let handles: Vec<_> = self.registry.sessions.read().await.values().cloned().collect();
        for handle in handles {
            if !handle.current_status().is_terminal() {
                if let Err(e) = self.cancel_handle(&handle, "Service stopped").await {
                    debug!(session_id = %handle.id(), error = %e, "Session finished before stop");
                }
            }
        }
        let runners: Vec<_> = self.runners.lock().await.drain(..).collect();
        for runner in runners {
            if let Err(e) = runner.await {
                warn!(error = %e, "Session runner ended abnormally");
            }
        }

        self.shutdown.cancel();
        let handles: Vec<_> = self.background.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Orchestrator service stopped");
    }

    /// Plan the standard pipeline for `request` and start a session for it.
    pub async fn create_session(&self, request: &GenerationRequest) -> GenforgeResult<Uuid> {
        let session_id = Uuid::new_v4();
        let tasks = plan_tasks(session_id, request, self.config.max_retries)?;
        self.launch(session_id, tasks).await
    }

    /// Start a session over an explicit task set.
    pub async fn create_session_with_tasks(&self, tasks: Vec<AgentTask>) -> GenforgeResult<Uuid> {
        self.launch(Uuid::new_v4(), tasks).await
    }

    async fn launch(&self, session_id: Uuid, tasks: Vec<AgentTask>) -> GenforgeResult<Uuid> {
        if let Some(task) = tasks.iter().find(|t| !self.executors.supports(t.role)) {
            return Err(GenforgeError::Orchestrator(format!(
                "no executor registered for role {} (task {})",
                task.role, task.id
            )));
        }
        let task_count = tasks.len();
        let mut session = OrchestrationSession::new(session_id, tasks, self.sink.clone())?;
        for observer in &self.observers {
            session.agents.add_observer(Arc::clone(observer));
        }
        let handle = Arc::new(SessionHandle::new(session));
        self.registry
            .sessions
            .write()
            .await
            .insert(session_id, Arc::clone(&handle));

        let mut runner = SessionRunner::new(
            handle,
            self.executors.clone(),
            Arc::clone(&self.processor),
            self.config.retry_backoff.clone(),
        );
        if let Some(sandbox) = self.registry.sandbox.get() {
            runner = runner.with_sandbox(Arc::clone(sandbox), Arc::clone(&self.registry.sandboxes));
        }
        {
            let mut runners = self.runners.lock().await;
            runners.retain(|r| !r.is_finished());
            runners.push(runner.spawn());
        }
        info!(session_id = %session_id, tasks = task_count, "Session created");
        Ok(session_id)
    }

    async fn handle(&self, session_id: Uuid) -> GenforgeResult<Arc<SessionHandle>> {
        self.registry
            .sessions
            .read()
            .await
            .get(&session_id)
            .cloned()
            .ok_or(GenforgeError::SessionNotFound(session_id))
    }

    pub async fn get_status(&self, session_id: Uuid) -> GenforgeResult<SessionStatusReport> {
        let handle = self.handle(session_id).await?;
        let report = handle.state.lock().await.status_report();
        Ok(report)
    }

    pub async fn get_artifacts(&self, session_id: Uuid) -> GenforgeResult<Vec<Artifact>> {
        let handle = self.handle(session_id).await?;
        let artifacts = handle.state.lock().await.artifacts().to_vec();
        Ok(artifacts)
    }

    /// Wait until the session reaches a terminal status and return its report.
    pub async fn wait(&self, session_id: Uuid) -> GenforgeResult<SessionStatusReport> {
        let handle = self.handle(session_id).await?;
        handle.wait_terminal().await;
        let report = handle.state.lock().await.status_report();
        Ok(report)
    }

    /// Cancel a session: executing agents are terminated, open tasks
    /// cancelled, in-flight executor calls signalled through the session's
    /// cancellation token, and sandbox resources released.
    pub async fn try_cancel(&self, session_id: Uuid) -> GenforgeResult<()> {
        let handle = self.handle(session_id).await?;
        self.cancel_handle(&handle, "Cancelled by user").await
    }

    async fn cancel_handle(&self, handle: &SessionHandle, reason: &str) -> GenforgeResult<()> {
        let session_id = handle.id();
        let summary = handle.state.lock().await.cancel(reason)?;
        handle.cancel.cancel();
        info!(
            session_id = %session_id,
            agents = summary.terminated_agents.len(),
            tasks = summary.cancelled_tasks.len(),
            "Session cancelled"
        );
        self.registry.release(handle).await;
        Ok(())
    }

    /// [`try_cancel`](Self::try_cancel) reporting only whether it took effect.
    pub async fn cancel(&self, session_id: Uuid) -> bool {
        match self.try_cancel(session_id).await {
            Ok(()) => true,
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "Cancel rejected");
                false
            }
        }
    }

    /// Remove terminal sessions older than the grace period.
    pub async fn evict_expired(&self) -> Vec<Uuid> {
        self.registry.evict_expired().await
    }

    pub async fn session_ids(&self) -> Vec<Uuid> {
        self.registry.sessions.read().await.keys().copied().collect()
    }

    /// Status distribution plus task, agent, and artifact statistics summed
    /// over every live session.
    pub async fn statistics(&self) -> ServiceStatistics {
        let handles: Vec<_> = self.registry.sessions.read().await.values().cloned().collect();
        let mut stats = ServiceStatistics {
            total_sessions: handles.len(),
            by_status: [
                SessionStatus::Initializing,
                SessionStatus::Running,
                SessionStatus::Completed,
                SessionStatus::Failed,
                SessionStatus::Cancelled,
            ]
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect(),
            ..ServiceStatistics::default()
        };
        for handle in &handles {
            let session = handle.state.lock().await;
            *stats
                .by_status
                .entry(session.status().as_str().to_string())
                .or_default() += 1;
            stats.tasks.merge(&session.graph().statistics());
            stats.agents.merge(&session.agents().statistics());
            stats.artifacts.merge(&artifacts::statistics(session.artifacts()));
            stats.rejected_artifacts += session.rejected().len();
        }
        stats.active_sandboxes = self.registry.sandboxes.read().await.len();
        stats
    }
}

impl Drop for OrchestratorService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
