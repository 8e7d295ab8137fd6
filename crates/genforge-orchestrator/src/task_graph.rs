use crate::types::{AgentTask, TaskId, TaskPriority, TaskStatus};
use chrono::{DateTime, Utc};
use genforge_core::{GenforgeError, GenforgeResult};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque};
use tracing::{debug, info};

/// Task registry with forward and reverse dependency edges.
///
/// Forward edges live on each task's `dependencies`; reverse edges
/// (`dependents`) are maintained on insert so failure cascades and Kahn's
/// algorithm never scan the whole registry.
#[derive(Debug, Default)]
pub struct TaskGraph {
    tasks: HashMap<TaskId, AgentTask>,
    order: Vec<TaskId>,
    seq: HashMap<TaskId, usize>,
    dependents: HashMap<TaskId, BTreeSet<TaskId>>,
}

/// Per-status task counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatistics {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl TaskStatistics {
    pub fn merge(&mut self, other: &Self) {
        self.total += other.total;
        self.pending += other.pending;
        self.running += other.running;
        self.completed += other.completed;
        self.failed += other.failed;
        self.cancelled += other.cancelled;
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task and its edges.
    pub fn add(&mut self, task: AgentTask) -> GenforgeResult<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(GenforgeError::DuplicateTask(task.id));
        }
        let id = task.id.clone();
        for dep in &task.dependencies {
            self.dependents
                .entry(dep.clone())
                .or_default()
                .insert(id.clone());
        }
        debug!(task_id = %id, deps = ?task.dependencies, "Task registered");
        self.seq.insert(id.clone(), self.order.len());
        self.order.push(id.clone());
        self.tasks.insert(id, task);
        Ok(())
    }

    /// Human-readable problems that must be fixed before scheduling:
    /// unresolved dependency ids and dependency cycles.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for task in self.tasks() {
            let missing: Vec<&str> = task
                .dependencies
                .iter()
                .filter(|dep| !self.tasks.contains_key(*dep))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                errors.push(format!(
                    "Task {} has missing dependencies: {}",
                    task.id,
                    missing.join(", ")
                ));
            }
        }

        let mut colors: HashMap<&str, Color> = self
            .order
            .iter()
            .map(|id| (id.as_str(), Color::White))
            .collect();
        for id in &self.order {
            if colors.get(id.as_str()) == Some(&Color::White) {
                let mut path = Vec::new();
                if let Some(cycle) = self.find_cycle(id, &mut colors, &mut path) {
                    errors.push(format!(
                        "Circular dependency detected involving task {id}: {}",
                        cycle.join(" -> ")
                    ));
                }
            }
        }

        errors
    }

    /// Depth-first search with white/gray/black coloring. Returns the cycle
    /// path when a gray node is reached again.
    fn find_cycle<'a>(
        &'a self,
        id: &'a str,
        colors: &mut HashMap<&'a str, Color>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        colors.insert(id, Color::Gray);
        path.push(id);
        if let Some(task) = self.tasks.get(id) {
            for dep in &task.dependencies {
                match colors.get(dep.as_str()).copied() {
                    Some(Color::Gray) => {
                        let start = path.iter().position(|p| *p == dep.as_str()).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            path[start..].iter().map(|s| (*s).to_string()).collect();
                        cycle.push(dep.clone());
                        return Some(cycle);
                    }
                    Some(Color::White) => {
                        if let Some(cycle) = self.find_cycle(dep, colors, path) {
                            return Some(cycle);
                        }
                    }
                    // Black, or a missing dependency reported separately.
                    Some(Color::Black) | None => {}
                }
            }
        }
        path.pop();
        colors.insert(id, Color::Black);
        None
    }

    /// Pending tasks whose dependencies are all in `completed_ids`, highest
    /// priority first, ties in creation order.
    pub fn ready(&self, completed_ids: &HashSet<TaskId>) -> Vec<&AgentTask> {
        let mut ready: Vec<&AgentTask> = self
            .tasks
            .values()
            .filter(|t| t.is_ready(completed_ids))
            .collect();
        ready.sort_by_key(|t| (Reverse(t.priority), self.seq_of(&t.id)));
        ready
    }

    /// Kahn's algorithm. Priority breaks ties among zero in-degree candidates,
    /// then creation order.
    pub fn topological_order(&self) -> GenforgeResult<Vec<TaskId>> {
        let mut in_degree: HashMap<&str, usize> = self
            .tasks
            .values()
            .map(|t| (t.id.as_str(), t.dependencies.len()))
            .collect();

        let mut heap: BinaryHeap<(TaskPriority, Reverse<usize>, &str)> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| self.heap_entry(id))
            .collect();

        let mut result = Vec::with_capacity(self.tasks.len());
        while let Some((_, _, current)) = heap.pop() {
            result.push(current.to_string());
            for dependent in self.dependents.get(current).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        heap.push(self.heap_entry(dependent));
                    }
                }
            }
        }

        if result.len() != self.tasks.len() {
            let ordered: HashSet<&str> = result.iter().map(String::as_str).collect();
            let stuck: Vec<&str> = self
                .order
                .iter()
                .map(String::as_str)
                .filter(|id| !ordered.contains(id))
                .collect();
            return Err(GenforgeError::Cycle(format!(
                "cannot determine execution order, unresolved tasks: {}",
                stuck.join(", ")
            )));
        }
        Ok(result)
    }

    fn heap_entry<'a>(&'a self, id: &'a str) -> (TaskPriority, Reverse<usize>, &'a str) {
        let priority = self
            .tasks
            .get(id)
            .map_or(TaskPriority::Normal, |t| t.priority);
        (priority, Reverse(self.seq_of(id)), id)
    }

    fn seq_of(&self, id: &str) -> usize {
        self.seq.get(id).copied().unwrap_or(usize::MAX)
    }

    /// Reset a failed task to Pending for another attempt.
    pub fn retry(&mut self, id: &str, eligible_at: Option<DateTime<Utc>>) -> GenforgeResult<()> {
        let task = self.get_mut(id)?;
        if !task.can_retry() {
            return Err(GenforgeError::InvalidTransition(format!(
                "task {id} cannot be retried ({}/{} attempts used)",
                task.retry_count, task.max_retries
            )));
        }
        task.transition(TaskStatus::Pending)?;
        task.retry_count += 1;
        task.error = None;
        task.started_at = None;
        task.completed_at = None;
        task.eligible_at = eligible_at;
        info!(task_id = %id, attempt = task.retry_count, "Retrying task");
        Ok(())
    }

    /// Cancel every task transitively depending on `id`. Returns the ids that
    /// were cancelled, in discovery order.
    pub fn cancel_dependents(&mut self, id: &str) -> Vec<TaskId> {
        let mut cancelled = Vec::new();
        let mut seen: HashSet<TaskId> = HashSet::new();
        let mut queue: VecDeque<TaskId> = self
            .dependents
            .get(id)
            .into_iter()
            .flatten()
            .cloned()
            .collect();

        while let Some(next) = queue.pop_front() {
            if !seen.insert(next.clone()) {
                continue;
            }
            if let Some(task) = self.tasks.get_mut(&next) {
                if matches!(task.status, TaskStatus::Pending | TaskStatus::Running)
                    && task.transition(TaskStatus::Cancelled).is_ok()
                {
                    task.error = Some(format!("dependency {id} failed"));
                    task.completed_at = Some(Utc::now());
                    cancelled.push(next.clone());
                }
            }
            queue.extend(self.dependents.get(&next).into_iter().flatten().cloned());
        }

        if !cancelled.is_empty() {
            info!(task_id = %id, cancelled = ?cancelled, "Cancelled dependents of failed task");
        }
        cancelled
    }

    /// Cancel every Pending or Running task. Returns the cancelled ids.
    pub fn cancel_open(&mut self, reason: &str) -> Vec<TaskId> {
        let mut cancelled = Vec::new();
        for id in &self.order {
            if let Some(task) = self.tasks.get_mut(id) {
                if matches!(task.status, TaskStatus::Pending | TaskStatus::Running)
                    && task.transition(TaskStatus::Cancelled).is_ok()
                {
                    task.error = Some(reason.to_string());
                    task.completed_at = Some(Utc::now());
                    cancelled.push(id.clone());
                }
            }
        }
        cancelled
    }

    pub fn get(&self, id: &str) -> Option<&AgentTask> {
        self.tasks.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> GenforgeResult<&mut AgentTask> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| GenforgeError::TaskNotFound(id.to_string()))
    }

    /// All tasks in creation order.
    pub fn tasks(&self) -> impl Iterator<Item = &AgentTask> {
        self.order.iter().filter_map(|id| self.tasks.get(id))
    }

    pub fn tasks_with_status(&self, status: TaskStatus) -> Vec<&AgentTask> {
        self.tasks().filter(|t| t.status == status).collect()
    }

    pub fn completed_ids(&self) -> HashSet<TaskId> {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Every task is Completed, Cancelled, or Failed with no retries left.
    pub fn is_done(&self) -> bool {
        self.tasks.values().all(AgentTask::is_terminal)
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    pub fn statistics(&self) -> TaskStatistics {
        TaskStatistics {
            total: self.tasks.len(),
            pending: self.count(TaskStatus::Pending),
            running: self.count(TaskStatus::Running),
            completed: self.count(TaskStatus::Completed),
            failed: self.count(TaskStatus::Failed),
            cancelled: self.count(TaskStatus::Cancelled),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::AgentRole;

    fn task(id: &str, role: AgentRole, deps: &[&str]) -> AgentTask {
        AgentTask::new(id, role, "work", format!("Task {id}")).with_dependencies(deps.iter().copied())
    }

    fn ids(tasks: &[&AgentTask]) -> Vec<String> {
        tasks.iter().map(|t| t.id.clone()).collect()
    }

    fn set(items: &[&str]) -> HashSet<TaskId> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_empty_graph() {
        let graph = TaskGraph::new();
        assert!(graph.is_empty());
        assert!(graph.is_done());
        assert!(graph.validate().is_empty());
        assert!(graph.ready(&HashSet::new()).is_empty());
        assert!(graph.topological_order().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let mut graph = TaskGraph::new();
        graph.add(task("a", AgentRole::Analysis, &[])).unwrap();
        let err = graph.add(task("a", AgentRole::Design, &[])).unwrap_err();
        assert!(matches!(err, GenforgeError::DuplicateTask(id) if id == "a"));
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_ready_fan_out() {
        let mut graph = TaskGraph::new();
        graph.add(task("A", AgentRole::Analysis, &[])).unwrap();
        graph.add(task("B", AgentRole::Design, &["A"])).unwrap();
        graph.add(task("C", AgentRole::Planning, &["A"])).unwrap();

        assert_eq!(ids(&graph.ready(&HashSet::new())), vec!["A"]);

        graph.get_mut("A").unwrap().status = TaskStatus::Completed;
        assert_eq!(ids(&graph.ready(&set(&["A"]))), vec!["B", "C"]);
    }

    #[test]
    fn test_ready_priority_then_fifo() {
        let mut graph = TaskGraph::new();
        graph.add(task("low", AgentRole::Analysis, &[]).with_priority(TaskPriority::Low)).unwrap();
        graph.add(task("n1", AgentRole::Design, &[])).unwrap();
        graph.add(task("crit", AgentRole::Implementation, &[]).with_priority(TaskPriority::Critical)).unwrap();
        graph.add(task("n2", AgentRole::Planning, &[])).unwrap();

        assert_eq!(ids(&graph.ready(&HashSet::new())), vec!["crit", "n1", "n2", "low"]);
    }

    #[test]
    fn test_completed_task_never_ready() {
        let mut graph = TaskGraph::new();
        graph.add(task("A", AgentRole::Analysis, &[])).unwrap();
        graph.get_mut("A").unwrap().status = TaskStatus::Completed;
        assert!(graph.ready(&set(&["A"])).is_empty());
    }

    #[test]
    fn test_validate_missing_dependency() {
        let mut graph = TaskGraph::new();
        graph.add(task("b", AgentRole::Design, &["ghost"])).unwrap();
        let errors = graph.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("missing dependencies: ghost"));
    }

    #[test]
    fn test_validate_two_node_cycle() {
        let mut graph = TaskGraph::new();
        graph.add(task("D", AgentRole::Analysis, &["E"])).unwrap();
        graph.add(task("E", AgentRole::Design, &["D"])).unwrap();
        let errors = graph.validate();
        assert!(!errors.is_empty());
        assert!(errors.iter().any(|e| e.contains("Circular dependency")));
        assert!(graph.topological_order().is_err());
    }

    #[test]
    fn test_validate_self_loop_and_long_cycle() {
        let mut graph = TaskGraph::new();
        graph.add(task("self", AgentRole::Analysis, &["self"])).unwrap();
        graph.add(task("x", AgentRole::Design, &["z"])).unwrap();
        graph.add(task("y", AgentRole::Planning, &["x"])).unwrap();
        graph.add(task("z", AgentRole::Implementation, &["y"])).unwrap();
        let errors = graph.validate();
        assert_eq!(errors.iter().filter(|e| e.contains("Circular")).count(), 2);
        assert!(errors.iter().any(|e| e.contains("x -> z -> y -> x")));
    }

    #[test]
    fn test_validate_diamond_is_acyclic() {
        let mut graph = TaskGraph::new();
        graph.add(task("a", AgentRole::Analysis, &[])).unwrap();
        graph.add(task("b", AgentRole::Design, &["a"])).unwrap();
        graph.add(task("c", AgentRole::Planning, &["a"])).unwrap();
        graph.add(task("d", AgentRole::Implementation, &["b", "c"])).unwrap();
        assert!(graph.validate().is_empty());
    }

    #[test]
    fn test_topological_order_respects_dependencies() {
        let mut graph = TaskGraph::new();
        graph.add(task("review", AgentRole::Verification, &["code", "spec"])).unwrap();
        graph.add(task("code", AgentRole::Implementation, &["spec", "design"])).unwrap();
        graph.add(task("design", AgentRole::Design, &["spec"])).unwrap();
        graph.add(task("spec", AgentRole::Analysis, &[])).unwrap();
        graph.add(task("docs", AgentRole::Operations, &[]).with_priority(TaskPriority::Critical)).unwrap();

        let order = graph.topological_order().unwrap();
        let pos = |id: &str| order.iter().position(|t| t == id).unwrap();
        for t in graph.tasks() {
            for dep in &t.dependencies {
                assert!(pos(dep) < pos(&t.id), "{dep} must precede {}", t.id);
            }
        }
        // Critical root wins the first tie.
        assert_eq!(order[0], "docs");
    }

    #[test]
    fn test_retry_bound() {
        let mut graph = TaskGraph::new();
        graph.add(task("F", AgentRole::Implementation, &[]).with_max_retries(2)).unwrap();

        for expected in 1..=2 {
            let t = graph.get_mut("F").unwrap();
            t.status = TaskStatus::Failed;
            graph.retry("F", None).unwrap();
            let t = graph.get("F").unwrap();
            assert_eq!(t.status, TaskStatus::Pending);
            assert_eq!(t.retry_count, expected);
        }

        graph.get_mut("F").unwrap().status = TaskStatus::Failed;
        assert!(graph.retry("F", None).is_err());
        let t = graph.get("F").unwrap();
        assert_eq!(t.retry_count, 2);
        assert!(!t.can_retry());
        assert!(t.is_terminal());
    }

    #[test]
    fn test_cancel_dependents_is_transitive() {
        let mut graph = TaskGraph::new();
        graph.add(task("x", AgentRole::Analysis, &[])).unwrap();
        graph.add(task("y", AgentRole::Design, &["x"])).unwrap();
        graph.add(task("z", AgentRole::Planning, &["y"])).unwrap();
        graph.add(task("w", AgentRole::Implementation, &["x", "z"])).unwrap();
        graph.add(task("sibling", AgentRole::Operations, &[])).unwrap();

        graph.get_mut("x").unwrap().status = TaskStatus::Failed;
        let cancelled = graph.cancel_dependents("x");
        assert_eq!(cancelled.len(), 3);
        for id in ["y", "z", "w"] {
            assert_eq!(graph.get(id).unwrap().status, TaskStatus::Cancelled);
        }
        assert_eq!(graph.get("sibling").unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn test_cancel_open_and_statistics() {
        let mut graph = TaskGraph::new();
        graph.add(task("a", AgentRole::Analysis, &[])).unwrap();
        graph.add(task("b", AgentRole::Design, &[])).unwrap();
        graph.add(task("c", AgentRole::Planning, &[])).unwrap();
        graph.get_mut("a").unwrap().status = TaskStatus::Completed;
        graph.get_mut("b").unwrap().status = TaskStatus::Running;

        assert_eq!(graph.cancel_open("session cancelled"), vec!["b", "c"]);
        let stats = graph.statistics();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.cancelled, 2);
        assert!(graph.is_done());
    }

    #[test]
    fn test_statistics_merge() {
        let mut total = TaskStatistics::default();
        let one = TaskStatistics { total: 3, pending: 1, completed: 2, ..Default::default() };
        let two = TaskStatistics { total: 2, failed: 1, cancelled: 1, ..Default::default() };
        total.merge(&one);
        total.merge(&two);
        assert_eq!(total.total, 5);
        assert_eq!(total.pending, 1);
        assert_eq!(total.completed, 2);
        assert_eq!(total.failed, 1);
        assert_eq!(total.cancelled, 1);
    }
}
