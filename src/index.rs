//! Task/Module Index: `pid -> Task` and `name -> Module`, each a root of the
//! Tracenode Graph.

use std::collections::HashMap;

use crate::graph::{Graph, NodeId};

pub struct Task {
    pub pid: u32,
    pub task_name: String,
    pub node: NodeId,
    pub exiting: bool,
}

pub struct Module {
    pub name: String,
    pub node: NodeId,
}

/// Name used for kernel/idle allocations observed with `pid == 0`. The
/// engine accounts these rather than discarding them.
pub const SWAPPER_NAME: &str = "swapper";

#[derive(Default)]
pub struct TaskModuleIndex {
    tasks: HashMap<u32, Task>,
    modules: HashMap<String, Module>,
}

impl TaskModuleIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the root tracenode for `pid`, creating a Task if this is the
    /// first sighting. `comm`, when non-empty, refreshes the task name
    /// (last-write-wins).
    pub fn task_root(&mut self, graph: &mut Graph, pid: u32, comm: &str) -> NodeId {
        if let Some(task) = self.tasks.get_mut(&pid) {
            if !comm.is_empty() {
                task.task_name = comm.to_string();
            }
            return task.node;
        }
        let node = graph.new_root();
        let name = if comm.is_empty() {
            if pid == 0 {
                SWAPPER_NAME.to_string()
            } else {
                String::new()
            }
        } else {
            comm.to_string()
        };
        self.tasks.insert(
            pid,
            Task {
                pid,
                task_name: name,
                node,
                exiting: false,
            },
        );
        node
    }

    /// Returns the root tracenode for kernel module `name`, creating a
    /// Module if this is the first sighting. Once created, a module is
    /// never removed even after an unload event.
    pub fn module_root(&mut self, graph: &mut Graph, name: &str) -> NodeId {
        if let Some(m) = self.modules.get(name) {
            return m.node;
        }
        let node = graph.new_root();
        self.modules.insert(
            name.to_string(),
            Module {
                name: name.to_string(),
                node,
            },
        );
        node
    }

    pub fn mark_exiting(&mut self, pid: u32) {
        if let Some(task) = self.tasks.get_mut(&pid) {
            task.exiting = true;
        }
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.modules.values()
    }

    pub fn task_by_pid(&self, pid: u32) -> Option<&Task> {
        self.tasks.get(&pid)
    }

    pub fn module_by_name(&self, name: &str) -> Option<&Module> {
        self.modules.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sighting_creates_task_with_given_name() {
        let mut graph = Graph::new(64);
        let mut idx = TaskModuleIndex::new();
        let node = idx.task_root(&mut graph, 42, "myapp");
        assert_eq!(idx.task_by_pid(42).unwrap().task_name, "myapp");
        assert_eq!(idx.task_root(&mut graph, 42, ""), node);
    }

    #[test]
    fn pid_zero_defaults_to_swapper() {
        let mut graph = Graph::new(64);
        let mut idx = TaskModuleIndex::new();
        idx.task_root(&mut graph, 0, "");
        assert_eq!(idx.task_by_pid(0).unwrap().task_name, SWAPPER_NAME);
    }

    #[test]
    fn comm_is_last_write_wins() {
        let mut graph = Graph::new(64);
        let mut idx = TaskModuleIndex::new();
        idx.task_root(&mut graph, 7, "first");
        idx.task_root(&mut graph, 7, "renamed");
        assert_eq!(idx.task_by_pid(7).unwrap().task_name, "renamed");
    }

    #[test]
    fn module_survives_repeated_lookup_without_duplication() {
        let mut graph = Graph::new(64);
        let mut idx = TaskModuleIndex::new();
        let a = idx.module_root(&mut graph, "nvidia");
        let b = idx.module_root(&mut graph, "nvidia");
        assert_eq!(a, b);
        assert_eq!(idx.modules().count(), 1);
    }
}
