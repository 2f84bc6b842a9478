use crate::types::{Agent, AgentStatus, Task, TaskStatus};
use overseer_core::{OverseerError, OverseerResult};
use std::collections::HashMap;
use uuid::Uuid;

/// Authoritative in-memory store of agents and tasks.
///
/// Every entity gets a sequence number on insertion so that listings and the
/// FIFO pending queue follow creation order.
pub struct Registry {
    agents: HashMap<Uuid, Agent>,
    tasks: HashMap<Uuid, Task>,
    next_seq: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            agents: HashMap::new(),
            tasks: HashMap::new(),
            next_seq: 0,
        }
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Add an agent to the registry.
    pub fn add_agent(&mut self, mut agent: Agent) -> Uuid {
        agent.seq = self.bump_seq();
        let id = agent.id;
        self.agents.insert(id, agent);
        id
    }

    /// Add a task to the registry.
    pub fn add_task(&mut self, mut task: Task) -> Uuid {
        task.seq = self.bump_seq();
        let id = task.id;
        self.tasks.insert(id, task);
        id
    }

    pub fn agent(&self, id: Uuid) -> OverseerResult<&Agent> {
        self.agents.get(&id).ok_or(OverseerError::UnknownAgent(id))
    }

    pub fn agent_mut(&mut self, id: Uuid) -> OverseerResult<&mut Agent> {
        self.agents.get_mut(&id).ok_or(OverseerError::UnknownAgent(id))
    }

    pub fn task(&self, id: Uuid) -> OverseerResult<&Task> {
        self.tasks.get(&id).ok_or(OverseerError::UnknownTask(id))
    }

    pub fn task_mut(&mut self, id: Uuid) -> OverseerResult<&mut Task> {
        self.tasks.get_mut(&id).ok_or(OverseerError::UnknownTask(id))
    }

    pub fn contains_agent(&self, id: Uuid) -> bool {
        self.agents.contains_key(&id)
    }

    pub fn contains_task(&self, id: Uuid) -> bool {
        self.tasks.contains_key(&id)
    }

    /// Remove an agent. Callers release its task first.
    pub fn remove_agent(&mut self, id: Uuid) -> Option<Agent> {
        self.agents.remove(&id)
    }

    /// Remove a task. Callers release its agent first.
    pub fn remove_task(&mut self, id: Uuid) -> Option<Task> {
        self.tasks.remove(&id)
    }

    /// All agents in creation order.
    pub fn agents(&self) -> Vec<&Agent> {
        let mut agents: Vec<&Agent> = self.agents.values().collect();
        agents.sort_by_key(|a| a.seq);
        agents
    }

    /// All tasks in creation order.
    pub fn tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }

    /// Pending tasks not reserved for a specific agent, oldest first.
    pub fn pending_queue(&self) -> Vec<Uuid> {
        self.tasks()
            .into_iter()
            .filter(|t| t.status == TaskStatus::Pending && t.pinned_agent.is_none())
            .map(|t| t.id)
            .collect()
    }

    /// Idle agents in creation order.
    pub fn idle_agents(&self) -> Vec<Uuid> {
        self.agents()
            .into_iter()
            .filter(|a| a.status == AgentStatus::Idle)
            .map(|a| a.id)
            .collect()
    }

    /// Assignable tasks reserved for `agent_id`, oldest first.
    pub fn pinned_to(&self, agent_id: Uuid) -> Vec<Uuid> {
        self.tasks()
            .into_iter()
            .filter(|t| t.pinned_agent == Some(agent_id) && t.status.is_assignable())
            .map(|t| t.id)
            .collect()
    }

    /// Count of tasks in a given status.
    pub fn count_tasks(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Point agent and task at each other. Both must currently be unpaired.
    pub fn bind(&mut self, agent_id: Uuid, task_id: Uuid) -> OverseerResult<()> {
        let agent = self.agent(agent_id)?;
        if let Some(existing) = agent.assigned_task_id {
            return Err(OverseerError::Validation(format!(
                "agent {agent_id} already holds task {existing}"
            )));
        }
        let task = self.task(task_id)?;
        if let Some(existing) = task.assigned_agent_id {
            return Err(OverseerError::Validation(format!(
                "task {task_id} already assigned to agent {existing}"
            )));
        }
        self.agent_mut(agent_id)?.assigned_task_id = Some(task_id);
        self.task_mut(task_id)?.assigned_agent_id = Some(agent_id);
        Ok(())
    }

    /// Clear the pairing held by `agent_id`, returning the task it pointed at.
    pub fn unbind_agent(&mut self, agent_id: Uuid) -> Option<Uuid> {
        let task_id = self.agents.get_mut(&agent_id)?.assigned_task_id.take()?;
        if let Some(task) = self.tasks.get_mut(&task_id) {
            task.assigned_agent_id = None;
        }
        Some(task_id)
    }

    /// Check the pairing invariants, returning a description of the first violation.
    pub fn check_consistency(&self) -> Result<(), String> {
        for agent in self.agents.values() {
            match agent.assigned_task_id {
                Some(task_id) => {
                    let task = self
                        .tasks
                        .get(&task_id)
                        .ok_or_else(|| format!("agent {} points at missing task {task_id}", agent.id))?;
                    if task.assigned_agent_id != Some(agent.id) {
                        return Err(format!(
                            "agent {} points at task {task_id} which points at {:?}",
                            agent.id, task.assigned_agent_id
                        ));
                    }
                    if agent.status != AgentStatus::Busy {
                        return Err(format!("agent {} holds a task while {}", agent.id, agent.status));
                    }
                }
                None => {
                    if agent.status == AgentStatus::Busy {
                        return Err(format!("agent {} is busy without a task", agent.id));
                    }
                }
            }
        }
        for task in self.tasks.values() {
            match task.assigned_agent_id {
                Some(agent_id) => {
                    let agent = self
                        .agents
                        .get(&agent_id)
                        .ok_or_else(|| format!("task {} points at missing agent {agent_id}", task.id))?;
                    if agent.assigned_task_id != Some(task.id) {
                        return Err(format!(
                            "task {} points at agent {agent_id} which points at {:?}",
                            task.id, agent.assigned_task_id
                        ));
                    }
                    if task.status != TaskStatus::Processing {
                        return Err(format!("task {} has an agent while {}", task.id, task.status));
                    }
                }
                None => {
                    if task.status == TaskStatus::Processing {
                        return Err(format!("task {} is processing without an agent", task.id));
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
