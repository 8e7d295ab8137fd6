use crate::events::{EventSink, OrchestrationEvent};
use crate::executor::ExecutionOutput;
use crate::types::{AgentId, AgentInstance, AgentRole, AgentState, AgentTask, TaskId, TaskStatus};
use chrono::Utc;
use genforge_core::{GenforgeError, GenforgeResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Receives every agent state transition. Failures are logged and ignored.
pub trait AgentObserver: Send + Sync {
    fn on_transition(
        &self,
        agent: &AgentInstance,
        from: AgentState,
        to: AgentState,
    ) -> GenforgeResult<()>;
}

/// Per-agent counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub agent_id: AgentId,
    pub role: AgentRole,
    pub state: AgentState,
    pub current_task: Option<TaskId>,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    /// Completed over total, 0.0 when nothing has run.
    pub success_rate: f64,
    pub uptime_secs: i64,
}

/// State distribution across a session's agents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatistics {
    pub total: usize,
    pub available: usize,
    pub busy: usize,
    pub by_state: BTreeMap<String, usize>,
}

impl AgentStatistics {
    pub fn merge(&mut self, other: &Self) {
        self.total += other.total;
        self.available += other.available;
        self.busy += other.busy;
        for (state, count) in &other.by_state {
            *self.by_state.entry(state.clone()).or_default() += count;
        }
    }
}

/// Owns the agent instances of one session, at most one per role.
pub struct AgentStateManager {
    session_id: Uuid,
    agents: BTreeMap<AgentRole, AgentInstance>,
    sink: EventSink,
    observers: Vec<Arc<dyn AgentObserver>>,
}

impl AgentStateManager {
    pub fn new(session_id: Uuid, sink: EventSink) -> Self {
        Self {
            session_id,
            agents: BTreeMap::new(),
            sink,
            observers: Vec::new(),
        }
    }

    pub fn add_observer(&mut self, observer: Arc<dyn AgentObserver>) {
        self.observers.push(observer);
    }

    /// Create the agent for `role`. Its id is `{session_id}_{role}`.
    pub fn create(&mut self, role: AgentRole) -> GenforgeResult<AgentId> {
        if self.agents.contains_key(&role) {
            return Err(GenforgeError::Orchestrator(format!(
                "session {} already has a {role} agent",
                self.session_id
            )));
        }
        let id = format!("{}_{role}", self.session_id);
        self.agents.insert(role, AgentInstance::new(id.clone(), role));
        debug!(session_id = %self.session_id, agent_id = %id, "Agent created");
        Ok(id)
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentInstance> {
        self.agents.values().find(|a| a.id == agent_id)
    }

    pub fn get_by_role(&self, role: AgentRole) -> Option<&AgentInstance> {
        self.agents.get(&role)
    }

    pub fn all(&self) -> impl Iterator<Item = &AgentInstance> {
        self.agents.values()
    }

    pub fn available(&self) -> Vec<&AgentInstance> {
        self.agents.values().filter(|a| a.is_available()).collect()
    }

    pub fn busy(&self) -> Vec<&AgentInstance> {
        self.agents.values().filter(|a| a.is_busy()).collect()
    }

    /// Whether the agent bound to `role` exists and can take a task.
    pub fn role_available(&self, role: AgentRole) -> bool {
        self.agents.get(&role).is_some_and(AgentInstance::is_available)
    }

    /// Bind `task` to the agent: agent becomes Executing, task Running.
    pub fn assign(&mut self, agent_id: &str, task: &mut AgentTask) -> GenforgeResult<()> {
        let agent = self.find(agent_id)?;
        if !agent.is_available() {
            return Err(GenforgeError::AgentUnavailable(format!(
                "{agent_id} is {} (current task: {})",
                agent.state,
                agent.current_task.as_deref().unwrap_or("none")
            )));
        }
        if agent.role != task.role {
            return Err(GenforgeError::AgentUnavailable(format!(
                "{agent_id} has role {} but task {} needs {}",
                agent.role, task.id, task.role
            )));
        }

        task.transition(TaskStatus::Running)?;
        task.started_at = Some(Utc::now());

        let agent = self.find_mut(agent_id)?;
        agent.current_task = Some(task.id.clone());
        self.transition(agent_id, AgentState::Executing)
    }

    /// Record a successful result for the agent's current task.
    pub fn complete(
        &mut self,
        agent_id: &str,
        task: &mut AgentTask,
        output: ExecutionOutput,
    ) -> GenforgeResult<()> {
        self.check_current(agent_id, task)?;
        task.transition(TaskStatus::Completed)?;
        task.result = Some(output);
        task.error = None;
        task.completed_at = Some(Utc::now());

        let agent = self.find_mut(agent_id)?;
        agent.current_task = None;
        agent.completed_tasks.push(task.id.clone());
        self.transition(agent_id, AgentState::Completed)
    }

    /// Record a failure for the agent's current task.
    pub fn fail(&mut self, agent_id: &str, task: &mut AgentTask, error: &str) -> GenforgeResult<()> {
        self.check_current(agent_id, task)?;
        task.transition(TaskStatus::Failed)?;
        task.error = Some(error.to_string());
        task.completed_at = Some(Utc::now());

        let agent = self.find_mut(agent_id)?;
        agent.current_task = None;
        agent.failed_tasks.push(task.id.clone());
        self.transition(agent_id, AgentState::Failed)
    }

    /// Return a Failed or Completed agent to Idle.
    pub fn rearm(&mut self, agent_id: &str) -> GenforgeResult<()> {
        let state = self.find(agent_id)?.state;
        if matches!(state, AgentState::Failed | AgentState::Completed) {
            self.transition(agent_id, AgentState::Idle)?;
        }
        Ok(())
    }

    /// Validated state change requested from outside the task lifecycle.
    pub fn set_state(&mut self, agent_id: &str, state: AgentState) -> GenforgeResult<()> {
        self.transition(agent_id, state)
    }

    pub fn terminate(&mut self, agent_id: &str) -> GenforgeResult<()> {
        if self.find(agent_id)?.state == AgentState::Terminated {
            return Ok(());
        }
        self.transition(agent_id, AgentState::Terminated)?;
        let agent = self.find_mut(agent_id)?;
        agent.current_task = None;
        Ok(())
    }

    /// Terminate every Executing agent. Returns the ids that were terminated.
    pub fn terminate_executing(&mut self) -> Vec<AgentId> {
        let executing: Vec<AgentId> = self.busy().into_iter().map(|a| a.id.clone()).collect();
        executing
            .into_iter()
            .filter(|id| match self.terminate(id) {
                Ok(()) => true,
                Err(e) => {
                    warn!(session_id = %self.session_id, agent_id = %id, error = %e, "Terminate failed");
                    false
                }
            })
            .collect()
    }

    pub fn metrics(&self, agent_id: &str) -> Option<AgentMetrics> {
        let agent = self.get(agent_id)?;
        let completed = agent.completed_tasks.len();
        let failed = agent.failed_tasks.len();
        let total = completed + failed;
        Some(AgentMetrics {
            agent_id: agent.id.clone(),
            role: agent.role,
            state: agent.state,
            current_task: agent.current_task.clone(),
            total_tasks: total,
            completed_tasks: completed,
            failed_tasks: failed,
            success_rate: if total == 0 {
                0.0
            } else {
                completed as f64 / total as f64
            },
            uptime_secs: (Utc::now() - agent.created_at).num_seconds(),
        })
    }

    pub fn statistics(&self) -> AgentStatistics {
        let mut by_state: BTreeMap<String, usize> = AgentState::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        for agent in self.agents.values() {
            *by_state.entry(agent.state.as_str().to_string()).or_default() += 1;
        }
        AgentStatistics {
            total: self.agents.len(),
            available: self.available().len(),
            busy: self.busy().len(),
            by_state,
        }
    }

    fn check_current(&self, agent_id: &str, task: &AgentTask) -> GenforgeResult<()> {
        let agent = self.find(agent_id)?;
        match agent.current_task.as_deref() {
            Some(current) if current == task.id => Ok(()),
            Some(current) => Err(GenforgeError::InvalidTransition(format!(
                "{agent_id} is running {current}, not {}",
                task.id
            ))),
            None => Err(GenforgeError::InvalidTransition(format!(
                "{agent_id} has no current task"
            ))),
        }
    }

    fn transition(&mut self, agent_id: &str, to: AgentState) -> GenforgeResult<()> {
        let session_id = self.session_id;
        let agent = self.find_mut(agent_id)?;
        let from = agent.state;
        if !from.can_transition_to(to) {
            return Err(GenforgeError::InvalidTransition(format!(
                "agent {agent_id}: {from} -> {to}"
            )));
        }
        agent.state = to;
        agent.touch();
        debug!(session_id = %session_id, agent_id = %agent_id, from = %from, to = %to, "Agent transition");

        let agent = self.find(agent_id)?;
        for observer in &self.observers {
            if let Err(e) = observer.on_transition(agent, from, to) {
                warn!(session_id = %session_id, agent_id = %agent_id, error = %e, "Agent observer failed");
            }
        }
        self.sink.emit(
            session_id,
            OrchestrationEvent::AgentState {
                agent_id: agent.id.clone(),
                role: agent.role,
                from,
                to,
                task_id: agent.current_task.clone(),
            },
        );
        Ok(())
    }

    fn find(&self, agent_id: &str) -> GenforgeResult<&AgentInstance> {
        self.get(agent_id)
            .ok_or_else(|| GenforgeError::AgentUnavailable(format!("unknown agent {agent_id}")))
    }

    fn find_mut(&mut self, agent_id: &str) -> GenforgeResult<&mut AgentInstance> {
        self.agents
            .values_mut()
            .find(|a| a.id == agent_id)
            .ok_or_else(|| GenforgeError::AgentUnavailable(format!("unknown agent {agent_id}")))
    }
}

impl std::fmt::Debug for AgentStateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentStateManager")
            .field("session_id", &self.session_id)
            .field("agents", &self.agents)
            .field("observers", &self.observers.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn manager() -> AgentStateManager {
        AgentStateManager::new(Uuid::nil(), EventSink::disabled())
    }

    fn task(id: &str, role: AgentRole) -> AgentTask {
        AgentTask::new(id, role, "work", id)
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(AgentState, AgentState)>>,
    }

    impl AgentObserver for Recorder {
        fn on_transition(&self, _agent: &AgentInstance, from: AgentState, to: AgentState) -> GenforgeResult<()> {
            self.seen.lock().unwrap().push((from, to));
            Ok(())
        }
    }

    struct Broken;

    impl AgentObserver for Broken {
        fn on_transition(&self, _agent: &AgentInstance, _from: AgentState, _to: AgentState) -> GenforgeResult<()> {
            Err(GenforgeError::Notification("observer down".into()))
        }
    }

    #[test]
    fn test_one_agent_per_role() {
        let mut agents = manager();
        let id = agents.create(AgentRole::Design).unwrap();
        assert_eq!(id, format!("{}_design", Uuid::nil()));
        assert!(agents.create(AgentRole::Design).is_err());
        assert_eq!(agents.get_by_role(AgentRole::Design).unwrap().id, id);
        assert!(agents.get(&id).is_some());
    }

    #[test]
    fn test_assign_complete_cycle() {
        let mut agents = manager();
        let id = agents.create(AgentRole::Implementation).unwrap();
        let mut t = task("x", AgentRole::Implementation);

        agents.assign(&id, &mut t).unwrap();
        assert_eq!(t.status, TaskStatus::Running);
        assert!(t.started_at.is_some());
        let agent = agents.get(&id).unwrap();
        assert_eq!(agent.state, AgentState::Executing);
        assert_eq!(agent.current_task.as_deref(), Some("x"));

        agents.complete(&id, &mut t, ExecutionOutput::default()).unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
        let agent = agents.get(&id).unwrap();
        assert_eq!(agent.state, AgentState::Completed);
        assert!(agent.current_task.is_none());
        assert_eq!(agent.completed_tasks, vec!["x".to_string()]);

        // Completed agents accept the next task directly.
        let mut y = task("y", AgentRole::Implementation);
        agents.assign(&id, &mut y).unwrap();
        assert_eq!(agents.get(&id).unwrap().state, AgentState::Executing);
    }

    #[test]
    fn test_busy_agent_rejects_second_task() {
        let mut agents = manager();
        let id = agents.create(AgentRole::Implementation).unwrap();
        let mut x = task("x", AgentRole::Implementation);
        let mut y = task("y", AgentRole::Implementation);
        agents.assign(&id, &mut x).unwrap();

        assert!(!agents.role_available(AgentRole::Implementation));
        let err = agents.assign(&id, &mut y).unwrap_err();
        assert!(matches!(err, GenforgeError::AgentUnavailable(_)));
        assert_eq!(y.status, TaskStatus::Pending);
    }

    #[test]
    fn test_fail_requires_current_task_and_rearm() {
        let mut agents = manager();
        let id = agents.create(AgentRole::Verification).unwrap();
        let mut t = task("t", AgentRole::Verification);
        assert!(agents.fail(&id, &mut t, "boom").is_err());

        agents.assign(&id, &mut t).unwrap();
        agents.fail(&id, &mut t, "boom").unwrap();
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.error.as_deref(), Some("boom"));
        assert!(!agents.role_available(AgentRole::Verification));

        agents.rearm(&id).unwrap();
        assert_eq!(agents.get(&id).unwrap().state, AgentState::Idle);
        assert!(agents.role_available(AgentRole::Verification));
    }

    #[test]
    fn test_role_mismatch_rejected() {
        let mut agents = manager();
        let id = agents.create(AgentRole::Design).unwrap();
        let mut t = task("t", AgentRole::Operations);
        assert!(agents.assign(&id, &mut t).is_err());
    }

    #[test]
    fn test_terminate_is_absorbing() {
        let mut agents = manager();
        let busy = agents.create(AgentRole::Analysis).unwrap();
        let idle = agents.create(AgentRole::Design).unwrap();
        let mut t = task("t", AgentRole::Analysis);
        agents.assign(&busy, &mut t).unwrap();

        assert_eq!(agents.terminate_executing(), vec![busy.clone()]);
        assert_eq!(agents.get(&busy).unwrap().state, AgentState::Terminated);
        assert_eq!(agents.get(&idle).unwrap().state, AgentState::Idle);
        assert!(agents.set_state(&busy, AgentState::Idle).is_err());
        assert!(agents.terminate(&busy).is_ok());
    }

    #[test]
    fn test_observers_see_transitions_and_failures_are_swallowed() {
        let mut agents = manager();
        let recorder = Arc::new(Recorder::default());
        agents.add_observer(Arc::new(Broken));
        agents.add_observer(recorder.clone());

        let id = agents.create(AgentRole::Planning).unwrap();
        let mut t = task("p", AgentRole::Planning);
        agents.assign(&id, &mut t).unwrap();
        agents.complete(&id, &mut t, ExecutionOutput::default()).unwrap();

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (AgentState::Idle, AgentState::Executing),
                (AgentState::Executing, AgentState::Completed),
            ]
        );
    }

    #[test]
    fn test_metrics_and_statistics() {
        let mut agents = manager();
        let id = agents.create(AgentRole::Implementation).unwrap();
        agents.create(AgentRole::Operations).unwrap();

        let mut a = task("a", AgentRole::Implementation);
        agents.assign(&id, &mut a).unwrap();
        agents.complete(&id, &mut a, ExecutionOutput::default()).unwrap();
        let mut b = task("b", AgentRole::Implementation);
        agents.assign(&id, &mut b).unwrap();
        agents.fail(&id, &mut b, "x").unwrap();

        let m = agents.metrics(&id).unwrap();
        assert_eq!(m.total_tasks, 2);
        assert_eq!(m.completed_tasks, 1);
        assert!((m.success_rate - 0.5).abs() < 1e-9);

        let stats = agents.statistics();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.available, 1);
        assert_eq!(stats.by_state["failed"], 1);
        assert_eq!(stats.by_state["idle"], 1);
        assert_eq!(stats.by_state["terminated"], 0);
    }

    #[test]
    fn test_statistics_merge() {
        let mut first = manager();
        first.create(AgentRole::Analysis).unwrap();
        let mut second = manager();
        let id = second.create(AgentRole::Design).unwrap();
        second.terminate(&id).unwrap();

        let mut total = AgentStatistics::default();
        total.merge(&first.statistics());
        total.merge(&second.statistics());
        assert_eq!(total.total, 2);
        assert_eq!(total.available, 1);
        assert_eq!(total.by_state["idle"], 1);
        assert_eq!(total.by_state["terminated"], 1);
    }
}
