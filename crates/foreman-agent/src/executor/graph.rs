use foreman_core::{ForemanError, Result, Task, TaskId, TaskStatus};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::{Direction, algo};
use std::collections::{BTreeSet, HashMap};

/// Dependency graph over every task in the store.
///
/// Edges point from a dependency to the task that depends on it. The graph is
/// acyclic at all times: every insertion is checked before it is applied.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    graph: DiGraph<TaskId, ()>,
    nodes: HashMap<TaskId, NodeIndex>,
}

impl TaskGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the graph from stored tasks.
    ///
    /// # Errors
    /// Returns `UnknownDependency` or `CycleDetected` if the stored tasks are inconsistent.
    pub fn from_tasks<'task>(tasks: impl IntoIterator<Item = &'task Task>) -> Result<Self> {
        let entries: Vec<(TaskId, BTreeSet<TaskId>)> = tasks
            .into_iter()
            .map(|task| (task.id.clone(), task.dependencies.clone()))
            .collect();
        let mut graph = Self::new();
        graph.add_tasks(&entries)?;
        Ok(graph)
    }

    /// Whether a task is present.
    pub fn contains(&self, task: &TaskId) -> bool {
        self.nodes.contains_key(task)
    }

    /// Add a single task with its dependencies.
    ///
    /// # Errors
    /// Returns `DuplicateTask`, `UnknownDependency` or `CycleDetected`; the graph is unchanged on error.
    pub fn add_task(&mut self, task: &TaskId, dependencies: &BTreeSet<TaskId>) -> Result<()> {
        self.add_tasks(&[(task.clone(), dependencies.clone())])
    }

    /// Add several tasks at once. Dependencies may point at existing tasks or at other
    /// tasks in the same batch.
    ///
    /// # Errors
    /// Returns `DuplicateTask`, `UnknownDependency` or `CycleDetected`; nothing from the
    /// batch is inserted on error.
    pub fn add_tasks(&mut self, entries: &[(TaskId, BTreeSet<TaskId>)]) -> Result<()> {
        let mut staged = self.clone();

        for (task, _) in entries {
            if staged.contains(task) {
                return Err(ForemanError::DuplicateTask(task.clone()));
            }
            let node = staged.graph.add_node(task.clone());
            staged.nodes.insert(task.clone(), node);
        }

        for (task, dependencies) in entries {
            for dependency in dependencies {
                if !staged.contains(dependency) {
                    return Err(ForemanError::UnknownDependency {
                        task: task.clone(),
                        dependency: dependency.clone(),
                    });
                }
                staged.insert_edge(task, dependency)?;
            }
        }

        *self = staged;
        Ok(())
    }

    /// Add a dependency edge between two existing tasks.
    ///
    /// # Errors
    /// Returns `UnknownTask` if either task is missing, `CycleDetected` if `dependency`
    /// already depends on `task`.
    pub fn add_dependency(&mut self, task: &TaskId, dependency: &TaskId) -> Result<()> {
        for id in [task, dependency] {
            if !self.contains(id) {
                return Err(ForemanError::UnknownTask(id.clone()));
            }
        }
        self.insert_edge(task, dependency)
    }

    /// Inserts `dependency -> task` after a reachability check.
    fn insert_edge(&mut self, task: &TaskId, dependency: &TaskId) -> Result<()> {
        let task_node = self.node(task)?;
        let dependency_node = self.node(dependency)?;

        if self.graph.contains_edge(dependency_node, task_node) {
            return Ok(());
        }

        // A path task ->* dependency means the dependency already waits on the task.
        if task_node == dependency_node
            || algo::has_path_connecting(&self.graph, task_node, dependency_node, None)
        {
            tracing::debug!("Rejected dependency {task} -> {dependency}: cycle");
            return Err(ForemanError::CycleDetected {
                task: task.clone(),
                dependency: dependency.clone(),
            });
        }

        self.graph.add_edge(dependency_node, task_node, ());
        Ok(())
    }

    fn node(&self, task: &TaskId) -> Result<NodeIndex> {
        self.nodes
            .get(task)
            .copied()
            .ok_or_else(|| ForemanError::UnknownTask(task.clone()))
    }

    /// Direct dependencies of a task.
    pub fn dependencies(&self, task: &TaskId) -> Vec<&TaskId> {
        self.neighbors(task, Direction::Incoming)
    }

    /// Tasks that directly depend on a task.
    pub fn dependents(&self, task: &TaskId) -> Vec<&TaskId> {
        self.neighbors(task, Direction::Outgoing)
    }

    fn neighbors(&self, task: &TaskId, direction: Direction) -> Vec<&TaskId> {
        self.nodes.get(task).map_or_else(Vec::new, |&node| {
            let mut ids: Vec<&TaskId> = self
                .graph
                .neighbors_directed(node, direction)
                .map(|neighbor| &self.graph[neighbor])
                .collect();
            ids.sort();
            ids
        })
    }

    /// Number of direct dependencies.
    pub fn dependency_count(&self, task: &TaskId) -> usize {
        self.nodes.get(task).map_or(0, |&node| {
            self.graph
                .neighbors_directed(node, Direction::Incoming)
                .count()
        })
    }

    /// Whether the two tasks are ordered by a dependency path in either direction.
    pub fn are_ordered(&self, first: &TaskId, second: &TaskId) -> bool {
        let (Some(&first_node), Some(&second_node)) = (self.nodes.get(first), self.nodes.get(second))
        else {
            return false;
        };
        first_node != second_node
            && (algo::has_path_connecting(&self.graph, first_node, second_node, None)
                || algo::has_path_connecting(&self.graph, second_node, first_node, None))
    }

    /// Tasks whose every dependency is `Done`, excluding tasks already `InProgress` or `Done`.
    ///
    /// The iterator is lazy and has no side effects; calling this again without a status
    /// change yields the same tasks in the same order.
    pub fn eligible_tasks<'graph, F>(
        &'graph self,
        status_of: F,
    ) -> impl Iterator<Item = &'graph TaskId> + 'graph
    where
        F: Fn(&TaskId) -> Option<TaskStatus> + 'graph,
    {
        self.graph.node_indices().filter_map(move |node| {
            let task = &self.graph[node];

            if matches!(
                status_of(task),
                Some(TaskStatus::InProgress | TaskStatus::Done) | None
            ) {
                return None;
            }

            let deps_satisfied = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .all(|dependency| status_of(&self.graph[dependency]) == Some(TaskStatus::Done));

            deps_satisfied.then_some(task)
        })
    }

    /// Successive layers of mutually independent tasks.
    ///
    /// Every task in layer `n` depends only on tasks in layers before `n`. Tasks within
    /// a layer are sorted by id.
    pub fn topological_batches(&self) -> Vec<Vec<TaskId>> {
        let mut remaining: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|node| {
                let incoming = self
                    .graph
                    .neighbors_directed(node, Direction::Incoming)
                    .count();
                (node, incoming)
            })
            .collect();

        let mut batches = Vec::new();
        let mut layer: Vec<NodeIndex> = remaining
            .iter()
            .filter(|&(_, &count)| count == 0)
            .map(|(&node, _)| node)
            .collect();

        while !layer.is_empty() {
            let mut next_layer = Vec::new();
            for &node in &layer {
                remaining.remove(&node);
                for dependent in self.graph.neighbors_directed(node, Direction::Outgoing) {
                    if let Some(count) = remaining.get_mut(&dependent) {
                        *count -= 1;
                        if *count == 0 {
                            next_layer.push(dependent);
                        }
                    }
                }
            }

            let mut ids: Vec<TaskId> = layer.iter().map(|&node| self.graph[node].clone()).collect();
            ids.sort();
            batches.push(ids);
            layer = next_layer;
        }

        batches
    }

    /// Detect cycles (never true for a graph built through this API)
    pub fn has_cycles(&self) -> bool {
        algo::is_cyclic_directed(&self.graph)
    }

    /// Get total task count
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }
}
