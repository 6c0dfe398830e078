//! Query Surface: read-only snapshots of the graph for a report or TUI to
//! render, named after the equivalent listing functions in the tool this
//! engine's data model descends from.

use crate::graph::Graph;
use crate::index::{Task, TaskModuleIndex};

#[derive(Debug, Clone, PartialEq)]
pub struct TaskSummary {
    pub pid: u32,
    pub task_name: String,
    pub pages_alloc: u64,
    pub pages_alloc_peak: u64,
    pub exiting: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModuleSummary {
    pub name: String,
    pub pages_alloc: u64,
    pub pages_alloc_peak: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TracenodeSummary {
    pub symbol: String,
    pub pages_alloc: u64,
    pub pages_alloc_peak: u64,
    pub has_children: bool,
}

fn by_pages_desc(a: u64, b: u64) -> std::cmp::Ordering {
    b.cmp(&a)
}

/// Every task currently known, sorted by resident page count descending.
/// When `top_only` is set, only tasks with at least one resident page are
/// returned (matching the "top" views' convention of hiding zero entries).
pub fn collect_tasks_sorted(graph: &Graph, index: &TaskModuleIndex, top_only: bool) -> Vec<TaskSummary> {
    let mut entries: Vec<TaskSummary> = index
        .tasks()
        .map(|t: &Task| TaskSummary {
            pid: t.pid,
            task_name: if t.task_name.is_empty() {
                "unknown".to_string()
            } else {
                t.task_name.clone()
            },
            pages_alloc: graph.pages_alloc(t.node),
            pages_alloc_peak: graph.pages_alloc_peak(t.node),
            exiting: t.exiting,
        })
        .filter(|s| !top_only || s.pages_alloc > 0)
        .collect();
    entries.sort_by(|a, b| by_pages_desc(a.pages_alloc, b.pages_alloc).then_with(|| a.pid.cmp(&b.pid)));
    entries
}

/// Every loaded module, sorted by resident page count descending.
pub fn collect_modules_sorted(graph: &Graph, index: &TaskModuleIndex, top_only: bool) -> Vec<ModuleSummary> {
    let mut entries: Vec<ModuleSummary> = index
        .modules()
        .map(|m| ModuleSummary {
            name: m.name.clone(),
            pages_alloc: graph.pages_alloc(m.node),
            pages_alloc_peak: graph.pages_alloc_peak(m.node),
        })
        .filter(|s| !top_only || s.pages_alloc > 0)
        .collect();
    entries.sort_by(|a, b| by_pages_desc(a.pages_alloc, b.pages_alloc).then_with(|| a.name.cmp(&b.name)));
    entries
}

/// Children of `node`, sorted by resident page count descending, for
/// drilling into a task or module's call tree one level at a time.
pub fn collect_tracenodes_sorted(graph: &Graph, node: crate::graph::NodeId, top_only: bool) -> Vec<TracenodeSummary> {
    graph
        .children_sorted(node)
        .into_iter()
        .map(|child| TracenodeSummary {
            symbol: graph.key_of(child).unwrap_or("?").to_string(),
            pages_alloc: graph.pages_alloc(child),
            pages_alloc_peak: graph.pages_alloc_peak(child),
            has_children: !graph.children_sorted(child).is_empty(),
        })
        .filter(|s| !top_only || s.pages_alloc > 0)
        .collect()
}

/// The resolved symbol a single tracenode is keyed by, or `None` for a root
/// (Task/Module) node which has no call-site key of its own.
pub fn get_tracenode_symbol(graph: &Graph, node: crate::graph::NodeId) -> Option<&str> {
    graph.key_of(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::index::TaskModuleIndex;

    #[test]
    fn tasks_are_sorted_by_pages_descending() {
        let mut graph = Graph::new(64);
        let mut index = TaskModuleIndex::new();
        let a = index.task_root(&mut graph, 1, "a");
        let b = index.task_root(&mut graph, 2, "b");
        graph.charge_root(a, 1);
        graph.charge_root(b, 5);

        let summary = collect_tasks_sorted(&graph, &index, false);
        assert_eq!(summary[0].pid, 2);
        assert_eq!(summary[1].pid, 1);
    }

    #[test]
    fn top_only_hides_zero_page_tasks() {
        let mut graph = Graph::new(64);
        let mut index = TaskModuleIndex::new();
        index.task_root(&mut graph, 1, "idle_task");
        let b = index.task_root(&mut graph, 2, "busy");
        graph.charge_root(b, 3);

        let summary = collect_tasks_sorted(&graph, &index, true);
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].pid, 2);
    }

    #[test]
    fn tracenode_children_expose_symbol_and_counts() {
        let mut graph = Graph::new(64);
        let mut index = TaskModuleIndex::new();
        let root = index.task_root(&mut graph, 1, "a");
        let backtrace = vec!["do_alloc".to_string()];
        graph.charge(root, &backtrace, 2);

        let children = collect_tracenodes_sorted(&graph, root, false);
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].symbol, "do_alloc");
        assert_eq!(children[0].pages_alloc, 2);
        assert!(!children[0].has_children);
    }
}
