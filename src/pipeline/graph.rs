//! The pipeline dependency graph.
//!
//! Nodes are [`TaskNode`]s keyed by unique name; edges point from a
//! parent to the tasks that depend on it. The graph is kept acyclic at
//! insertion time so downstream traversal never has to re-validate.

use std::collections::{HashMap, HashSet};

use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::pipeline::node::TaskNode;
use crate::{Error, Result};

pub struct TaskGraph {
    graph: DiGraph<TaskNode, ()>,
    name_index: HashMap<String, NodeIndex>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            name_index: HashMap::new(),
        }
    }

    /// Add a task to the graph.
    ///
    /// Names are the identity of a node; adding a second task under an
    /// existing name is a configuration error, not an upsert.
    pub fn add_task(&mut self, task: TaskNode) -> Result<NodeIndex> {
        if self.name_index.contains_key(&task.name) {
            return Err(Error::Config(format!(
                "duplicate task name: {}",
                task.name
            )));
        }
        let name = task.name.clone();
        let index = self.graph.add_node(task);
        self.name_index.insert(name, index);
        Ok(index)
    }

    /// Declare that `parent` must complete before `child` can start.
    ///
    /// Validates both endpoints exist and that the edge keeps the graph
    /// acyclic; a rejected edge leaves the graph unchanged.
    pub fn add_parent(&mut self, parent: &str, child: &str) -> Result<()> {
        let parent_index = self.index_of(parent)?;
        let child_index = self.index_of(child)?;

        if self.graph.find_edge(parent_index, child_index).is_some() {
            return Ok(());
        }

        let edge = self.graph.add_edge(parent_index, child_index, ());
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(Error::Config(format!(
                "dependency from {} to {} would create a cycle",
                parent, child
            )));
        }
        Ok(())
    }

    fn index_of(&self, name: &str) -> Result<NodeIndex> {
        self.name_index
            .get(name)
            .copied()
            .ok_or_else(|| Error::Config(format!("task {} not found in graph", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.name_index.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&TaskNode> {
        self.name_index
            .get(name)
            .and_then(|&i| self.graph.node_weight(i))
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut TaskNode> {
        if let Some(&i) = self.name_index.get(name) {
            self.graph.node_weight_mut(i)
        } else {
            None
        }
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Names of the direct parents of `name`.
    pub fn parents(&self, name: &str) -> Vec<&str> {
        self.neighbors(name, Direction::Incoming)
    }

    /// Names of the direct children of `name`.
    pub fn children(&self, name: &str) -> Vec<&str> {
        self.neighbors(name, Direction::Outgoing)
    }

    fn neighbors(&self, name: &str, direction: Direction) -> Vec<&str> {
        if let Some(&index) = self.name_index.get(name) {
            self.graph
                .neighbors_directed(index, direction)
                .filter_map(|n| self.graph.node_weight(n))
                .map(|t| t.name.as_str())
                .collect()
        } else {
            Vec::new()
        }
    }

    /// All descendants of `name` (transitive children), excluding itself.
    pub fn descendants(&self, name: &str) -> Vec<&str> {
        let Some(&start) = self.name_index.get(name) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut stack = vec![start];
        while let Some(index) = stack.pop() {
            for child in self.graph.neighbors_directed(index, Direction::Outgoing) {
                if seen.insert(child) {
                    stack.push(child);
                }
            }
        }
        seen.into_iter()
            .filter_map(|i| self.graph.node_weight(i))
            .map(|t| t.name.as_str())
            .collect()
    }

    /// Tasks whose parents are all in `completed` and that are not
    /// themselves in it.
    pub fn ready_tasks<'a>(&'a self, completed: &HashSet<String>) -> Vec<&'a TaskNode> {
        self.graph
            .node_indices()
            .filter_map(|index| {
                let task = self.graph.node_weight(index)?;
                if completed.contains(&task.name) {
                    return None;
                }
                let parents_done = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .all(|p| {
                        self.graph
                            .node_weight(p)
                            .map(|t| completed.contains(&t.name))
                            .unwrap_or(false)
                    });
                parents_done.then_some(task)
            })
            .collect()
    }

    /// Tasks in dependency order, each after all of its parents.
    pub fn topological_order(&self) -> Result<Vec<&TaskNode>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let name = self
                .graph
                .node_weight(cycle.node_id())
                .map(|t| t.name.as_str())
                .unwrap_or("unknown");
            Error::Config(format!("cycle detected at task: {}", name))
        })?;
        Ok(sorted
            .into_iter()
            .filter_map(|i| self.graph.node_weight(i))
            .collect())
    }

    /// Assign each task its topological depth: roots get level 0, every
    /// other task 1 + the maximum level among its parents.
    pub fn assign_levels(&mut self) -> Result<()> {
        let order: Vec<NodeIndex> = toposort(&self.graph, None)
            .map_err(|_| Error::Config("cycle detected while assigning levels".to_string()))?;
        for index in order {
            let level = self
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .filter_map(|p| self.graph.node_weight(p))
                .map(|t| t.level + 1)
                .max()
                .unwrap_or(0);
            if let Some(task) = self.graph.node_weight_mut(index) {
                task.level = level;
            }
        }
        Ok(())
    }

    pub fn all_tasks(&self) -> impl Iterator<Item = &TaskNode> {
        self.graph.node_weights()
    }

    pub fn all_tasks_mut(&mut self) -> impl Iterator<Item = &mut TaskNode> {
        self.graph.node_weights_mut()
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.graph.node_weights().map(|t| t.name.as_str()).collect()
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.task_count())
            .field("edges", &self.edge_count())
            .finish()
    }
}
