//! The Tracenode Graph: an arena-backed forest of call-sites, charged and
//! uncharged as page allocations and frees are observed.

use std::collections::HashMap;

pub const DEFAULT_MAX_FRAMES: usize = 64;
pub const TRUNCATED_KEY: &str = "<truncated>";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

/// The counters attached to a tracenode. Present only once at least one
/// allocation has been charged there.
#[derive(Default)]
pub struct Record {
    pub pages_alloc: u64,
    pub pages_alloc_peak: u64,
    /// Opaque view-state owned by an external UI/report collaborator. The
    /// graph never reads or interprets it.
    pub blob: Option<Box<dyn std::any::Any>>,
}

struct TracenodeData {
    parent: Option<NodeId>,
    /// The resolved key this node is reached by from its parent. `None`
    /// for roots (Task/Module), which are keyed by pid/name instead.
    key: Option<String>,
    children: HashMap<String, NodeId>,
    record: Option<Record>,
}

/// Owns every tracenode ever created during a run. Nodes are never removed;
/// the whole arena is dropped at shutdown.
pub struct Graph {
    arena: Vec<TracenodeData>,
    max_frames: usize,
}

impl Graph {
    pub fn new(max_frames: usize) -> Self {
        Self {
            arena: Vec::new(),
            max_frames: max_frames.max(2),
        }
    }

    /// Creates a new root tracenode (the anchor for a Task or Module).
    pub fn new_root(&mut self) -> NodeId {
        let id = NodeId(self.arena.len());
        self.arena.push(TracenodeData {
            parent: None,
            key: None,
            children: HashMap::new(),
            record: None,
        });
        id
    }

    pub fn parent_of(&self, node: NodeId) -> Option<NodeId> {
        self.arena[node.0].parent
    }

    pub fn key_of(&self, node: NodeId) -> Option<&str> {
        self.arena[node.0].key.as_deref()
    }

    pub fn pages_alloc(&self, node: NodeId) -> u64 {
        self.arena[node.0]
            .record
            .as_ref()
            .map(|r| r.pages_alloc)
            .unwrap_or(0)
    }

    pub fn pages_alloc_peak(&self, node: NodeId) -> u64 {
        self.arena[node.0]
            .record
            .as_ref()
            .map(|r| r.pages_alloc_peak)
            .unwrap_or(0)
    }

    pub fn has_record(&self, node: NodeId) -> bool {
        self.arena[node.0].record.is_some()
    }

    pub fn blob(&self, node: NodeId) -> Option<&dyn std::any::Any> {
        self.arena[node.0]
            .record
            .as_ref()
            .and_then(|r| r.blob.as_deref())
    }

    pub fn set_blob(&mut self, node: NodeId, blob: Box<dyn std::any::Any>) {
        self.ensure_record(node).blob = Some(blob);
    }

    /// Children of `node` sorted by descending `pages_alloc`, ties broken by
    /// ascending key string.
    pub fn children_sorted(&self, node: NodeId) -> Vec<NodeId> {
        let mut entries: Vec<(&str, NodeId)> = self.arena[node.0]
            .children
            .iter()
            .map(|(k, v)| (k.as_str(), *v))
            .collect();
        entries.sort_by(|a, b| {
            let pa = self.pages_alloc(a.1);
            let pb = self.pages_alloc(b.1);
            pb.cmp(&pa).then_with(|| a.0.cmp(b.0))
        });
        entries.into_iter().map(|(_, id)| id).collect()
    }

    fn get_or_create_child(&mut self, parent: NodeId, key: &str) -> NodeId {
        if let Some(&id) = self.arena[parent.0].children.get(key) {
            return id;
        }
        let id = NodeId(self.arena.len());
        self.arena.push(TracenodeData {
            parent: Some(parent),
            key: Some(key.to_string()),
            children: HashMap::new(),
            record: None,
        });
        self.arena[parent.0].children.insert(key.to_string(), id);
        id
    }

    fn ensure_record(&mut self, node: NodeId) -> &mut Record {
        self.arena[node.0].record.get_or_insert_with(Record::default)
    }

    /// Converts a raw backtrace (innermost frame first, as captured at
    /// allocation time) into the root-to-leaf key sequence the graph is
    /// descended with, truncating to `max_frames` if needed.
    ///
    /// When truncation is needed, `"<truncated>"` is inserted as `root`'s
    /// direct child and the frames nearest the allocation site are kept
    /// below it; the frames nearest the root are the ones dropped.
    fn path_keys(&self, backtrace: &[String]) -> (Vec<String>, bool) {
        let root_to_leaf: Vec<String> = backtrace.iter().rev().cloned().collect();
        if root_to_leaf.len() > self.max_frames {
            let keep = self.max_frames - 1;
            let mut path = Vec::with_capacity(self.max_frames);
            path.push(TRUNCATED_KEY.to_string());
            path.extend_from_slice(&root_to_leaf[root_to_leaf.len() - keep..]);
            (path, true)
        } else {
            (root_to_leaf, false)
        }
    }

    /// Charges `pages` to the leaf reached by descending `root` along
    /// `backtrace`, creating intermediate tracenodes as needed, and adds
    /// `pages` to every ancestor up to and including `root`. Returns the
    /// leaf node and whether the backtrace was truncated.
    pub fn charge(&mut self, root: NodeId, backtrace: &[String], pages: u64) -> (NodeId, bool) {
        let (path, truncated) = self.path_keys(backtrace);
        let mut current = root;
        for key in &path {
            current = self.get_or_create_child(current, key);
        }
        self.add_along_path(current, pages as i64, true);
        (current, truncated)
    }

    /// Charges `pages` directly at `root` with no intervening frames (empty
    /// backtrace case).
    pub fn charge_root(&mut self, root: NodeId, pages: u64) {
        self.add_along_path(root, pages as i64, true);
    }

    /// Removes `pages` from `leaf` and every ancestor up to the root. Peak
    /// values are never decreased.
    pub fn uncharge(&mut self, leaf: NodeId, pages: u64) {
        self.add_along_path(leaf, -(pages as i64), false);
    }

    fn add_along_path(&mut self, leaf: NodeId, delta: i64, update_peak: bool) {
        let mut current = Some(leaf);
        while let Some(id) = current {
            let rec = self.ensure_record(id);
            if delta >= 0 {
                rec.pages_alloc += delta as u64;
                if update_peak && rec.pages_alloc > rec.pages_alloc_peak {
                    rec.pages_alloc_peak = rec.pages_alloc;
                }
            } else {
                rec.pages_alloc = rec.pages_alloc.saturating_sub((-delta) as u64);
            }
            current = self.arena[id.0].parent;
        }
    }
}
