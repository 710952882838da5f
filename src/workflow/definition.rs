//! Workflow definitions: phases, agent tasks, validation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::error::WorkflowError;
use crate::queue::handler::JobHandler;
use crate::queue::job::JobPriority;

/// How tasks within a phase are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Tasks run concurrently (bounded, dependency-ordered).
    Parallel,
    /// Tasks run one after another in declaration order.
    Sequential,
}

/// A unit of work assigned to an agent role within a workflow.
#[derive(Clone)]
pub struct AgentTask {
    /// Unique (within the workflow) task identifier.
    pub task_id: String,
    /// Agent role responsible for the task.
    pub agent_role: String,
    /// Task ids that must complete before this task starts.
    pub dependencies: Vec<String>,
    /// The injected unit of work.
    pub handler: Arc<dyn JobHandler>,
    /// Queue priority for the backing job.
    pub priority: JobPriority,
    /// Per-task timeout override (None = engine default).
    pub timeout: Option<Duration>,
    /// Per-task retry override (None = engine default).
    pub max_retries: Option<u32>,
    /// Metadata passed through to the handler.
    pub metadata: serde_json::Value,
}

impl AgentTask {
    pub fn new(
        task_id: impl Into<String>,
        agent_role: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            agent_role: agent_role.into(),
            dependencies: Vec::new(),
            handler,
            priority: JobPriority::Normal,
            timeout: None,
            max_retries: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

impl std::fmt::Debug for AgentTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentTask")
            .field("task_id", &self.task_id)
            .field("agent_role", &self.agent_role)
            .field("dependencies", &self.dependencies)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// An ordered stage of a workflow.
#[derive(Debug, Clone)]
pub struct Phase {
    pub name: String,
    pub mode: ExecutionMode,
    pub tasks: Vec<AgentTask>,
}

impl Phase {
    pub fn parallel(name: impl Into<String>, tasks: Vec<AgentTask>) -> Self {
        Self {
            name: name.into(),
            mode: ExecutionMode::Parallel,
            tasks,
        }
    }

    pub fn sequential(name: impl Into<String>, tasks: Vec<AgentTask>) -> Self {
        Self {
            name: name.into(),
            mode: ExecutionMode::Sequential,
            tasks,
        }
    }
}

/// A multi-phase plan of agent tasks.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub workflow_id: Uuid,
    pub name: String,
    pub phases: Vec<Phase>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, phases: Vec<Phase>) -> Self {
        Self {
            workflow_id: Uuid::new_v4(),
            name: name.into(),
            phases,
        }
    }

    pub fn with_workflow_id(mut self, workflow_id: Uuid) -> Self {
        self.workflow_id = workflow_id;
        self
    }

    /// Iterate over all tasks across phases in declaration order.
    pub fn tasks(&self) -> impl Iterator<Item = &AgentTask> {
        self.phases.iter().flat_map(|p| p.tasks.iter())
    }

    /// Total number of tasks in the definition.
    pub fn task_count(&self) -> usize {
        self.phases.iter().map(|p| p.tasks.len()).sum()
    }

    /// Check structural soundness: at least one task, unique task ids,
    /// dependencies that resolve to tasks declared no later than their
    /// dependent's phase, and no dependency cycles within a phase.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.task_count() == 0 {
            return Err(WorkflowError::InvalidDefinition {
                reason: "workflow has no tasks".to_string(),
            });
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for task in self.tasks() {
            if task.task_id.trim().is_empty() {
                return Err(WorkflowError::InvalidDefinition {
                    reason: "task_id must not be empty".to_string(),
                });
            }
            if !seen.insert(task.task_id.as_str()) {
                return Err(WorkflowError::InvalidDefinition {
                    reason: format!("duplicate task_id: {}", task.task_id),
                });
            }
        }

        // Dependencies must resolve within the current or an earlier phase.
        let mut available: HashSet<&str> = HashSet::new();
        for phase in &self.phases {
            let in_phase: HashSet<&str> = phase.tasks.iter().map(|t| t.task_id.as_str()).collect();
            for task in &phase.tasks {
                for dep in &task.dependencies {
                    if !available.contains(dep.as_str()) && !in_phase.contains(dep.as_str()) {
                        return Err(WorkflowError::InvalidDefinition {
                            reason: format!(
                                "task {} depends on unknown or later task {dep}",
                                task.task_id
                            ),
                        });
                    }
                }
            }

            // Same-phase dependencies must be resolvable in waves.
            let mut resolved: HashSet<&str> = HashSet::new();
            while resolved.len() < phase.tasks.len() {
                let ready: Vec<&str> = phase
                    .tasks
                    .iter()
                    .filter(|t| !resolved.contains(t.task_id.as_str()))
                    .filter(|t| {
                        t.dependencies.iter().all(|d| {
                            available.contains(d.as_str()) || resolved.contains(d.as_str())
                        })
                    })
                    .map(|t| t.task_id.as_str())
                    .collect();
                if ready.is_empty() {
                    return Err(WorkflowError::InvalidDefinition {
                        reason: format!("circular dependencies in phase {}", phase.name),
                    });
                }
                resolved.extend(ready);
            }

            available.extend(in_phase);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::handler::FnJobHandler;

    fn task(id: &str, deps: &[&str]) -> AgentTask {
        AgentTask::new(
            id,
            "agent",
            Arc::new(FnJobHandler::new(|_ctx| async {
                Ok(serde_json::Value::Null)
            })),
        )
        .with_dependencies(deps.iter().map(|d| d.to_string()).collect())
    }

    #[test]
    fn valid_definition_passes() {
        let def = WorkflowDefinition::new(
            "plan",
            vec![
                Phase::parallel("gather", vec![task("a", &[]), task("b", &[])]),
                Phase::sequential("write", vec![task("c", &["a", "b"]), task("d", &["c"])]),
            ],
        );
        assert!(def.validate().is_ok());
        assert_eq!(def.task_count(), 4);
    }

    #[test]
    fn empty_workflow_rejected() {
        let def = WorkflowDefinition::new("empty", vec![]);
        assert!(matches!(
            def.validate(),
            Err(WorkflowError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn duplicate_task_ids_rejected() {
        let def = WorkflowDefinition::new(
            "dup",
            vec![Phase::parallel("p", vec![task("a", &[]), task("a", &[])])],
        );
        assert!(def.validate().is_err());
    }

    #[test]
    fn unknown_dependency_rejected() {
        let def = WorkflowDefinition::new(
            "bad-dep",
            vec![Phase::parallel("p", vec![task("a", &["ghost"])])],
        );
        assert!(def.validate().is_err());
    }

    #[test]
    fn forward_phase_dependency_rejected() {
        let def = WorkflowDefinition::new(
            "forward",
            vec![
                Phase::parallel("first", vec![task("a", &["b"])]),
                Phase::parallel("second", vec![task("b", &[])]),
            ],
        );
        assert!(def.validate().is_err());
    }

    #[test]
    fn cycle_within_phase_rejected() {
        let def = WorkflowDefinition::new(
            "cycle",
            vec![Phase::parallel(
                "p",
                vec![task("a", &["b"]), task("b", &["a"])],
            )],
        );
        assert!(def.validate().is_err());
    }
}
