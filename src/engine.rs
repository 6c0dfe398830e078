//! Engine: wires the Tracenode Graph, Task/Module Index, Page Map and
//! Backtrace Resolver together and turns typed trace events into graph
//! mutations.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backtrace::{BacktraceResolver, KallsymsSource, ModuleRange};
use crate::config::EngineConfig;
use crate::graph::{Graph, NodeId};
use crate::index::TaskModuleIndex;
use crate::metrics::Metrics;
use crate::pagemap::PageMap;
use crate::record::TracedEvent;

const PAGE_SIZE: u64 = 4096;

/// Module name core-kernel allocations are attributed to when no loaded
/// module's address range covers any frame of the backtrace.
pub const KERNEL_MODULE_NAME: &str = "[kernel.kallsyms]";

/// A pair of leaves a single allocation is charged to: one in the Task
/// forest, one in the Module forest.
struct Charged {
    task_leaf: NodeId,
    module_leaf: NodeId,
}

pub struct Engine {
    graph: Graph,
    index: TaskModuleIndex,
    pagemap: PageMap,
    slabs: HashMap<u64, (NodeId, NodeId, u64)>,
    resolver: BacktraceResolver<KallsymsSource>,
    metrics: Arc<Metrics>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig, metrics: Arc<Metrics>) -> Self {
        let source = KallsymsSource::load().unwrap_or_else(|e| {
            log::warn!("failed to load /proc/kallsyms, symbols will stay unresolved: {e}");
            KallsymsSource::empty()
        });
        Self {
            graph: Graph::new(config.max_frames),
            index: TaskModuleIndex::new(),
            pagemap: PageMap::new(),
            slabs: HashMap::new(),
            resolver: BacktraceResolver::new(source),
            metrics,
            config,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn index(&self) -> &TaskModuleIndex {
        &self.index
    }

    /// Whether the free path must resolve its own backtrace even when a
    /// Page Map hit already names the leaf to uncharge.
    pub fn need_page_free_always_backtrack(&self) -> bool {
        self.config.page_free_always_backtrack
    }

    fn resolve_all(&mut self, addresses: &[u64]) -> Vec<String> {
        addresses.iter().map(|a| self.resolver.resolve(*a)).collect()
    }

    /// Root of the module owning `backtrace`'s allocation site, or the
    /// core-kernel catch-all root if no loaded module's range covers any
    /// frame.
    fn module_root_for(&mut self, backtrace: &[u64]) -> NodeId {
        let name = self
            .resolver
            .owning_module(backtrace)
            .map(|n| n.to_string())
            .unwrap_or_else(|| KERNEL_MODULE_NAME.to_string());
        self.index.module_root(&mut self.graph, &name)
    }

    /// Charges `pages` to both the task root's call-path and the owning
    /// module root's call-path (same resolved `keys`), creating tracenodes
    /// in each forest as needed.
    fn charge_both(&mut self, task_root: NodeId, module_root: NodeId, keys: &[String], pages: u64) -> Charged {
        let task_leaf = if keys.is_empty() {
            self.graph.charge_root(task_root, pages);
            task_root
        } else {
            let (leaf, truncated) = self.graph.charge(task_root, keys, pages);
            if truncated {
                self.metrics.inc_truncated_backtraces();
            }
            leaf
        };
        let module_leaf = if keys.is_empty() {
            self.graph.charge_root(module_root, pages);
            module_root
        } else {
            let (leaf, _truncated) = self.graph.charge(module_root, keys, pages);
            leaf
        };
        Charged { task_leaf, module_leaf }
    }

    /// Applies one parsed event to the graph. Malformed inputs never reach
    /// here; the Record Parser has already filtered those out.
    pub fn handle(&mut self, event: TracedEvent) {
        self.metrics.record_trace();
        match event {
            TracedEvent::PageAlloc {
                pfn,
                order,
                gfp_flags: _,
                pid,
                comm,
                backtrace,
            } => self.handle_page_alloc(pfn, order, pid, &comm, &backtrace),
            TracedEvent::PageFree { pfn, order, pid: _ } => self.handle_page_free(pfn, order),
            TracedEvent::SlabAlloc {
                ptr,
                bytes,
                cache_name: _,
                pid,
                comm,
                backtrace,
            } => self.handle_slab_alloc(ptr, bytes, pid, &comm, &backtrace),
            TracedEvent::SlabFree { ptr } => self.handle_slab_free(ptr),
            TracedEvent::ModuleLoad { name, base, size } => {
                let node = self.index.module_root(&mut self.graph, &name);
                self.resolver.register_module(ModuleRange { name, base, size });
                let _ = node;
            }
            TracedEvent::ModuleUnload { name } => {
                self.resolver.unregister_module(&name);
                self.resolver.reload_symbols();
            }
        }
    }

    fn handle_page_alloc(&mut self, pfn: u64, order: u32, pid: u32, comm: &str, backtrace: &[u64]) {
        let pages = 1u64 << order;
        let task_root = self.index.task_root(&mut self.graph, pid, comm);
        let module_root = self.module_root_for(backtrace);
        let keys = self.resolve_all(backtrace);
        let charged = self.charge_both(task_root, module_root, &keys, pages);
        self.pagemap.insert(pfn, order, charged.task_leaf, charged.module_leaf);
        self.metrics.record_page_alloc(pages);
    }

    fn handle_page_free(&mut self, pfn: u64, order: u32) {
        let requested = 1u64 << order;
        let removed = self.pagemap.remove(pfn, order);
        for (_, owners) in &removed {
            self.graph.uncharge(owners.task_leaf, 1);
            self.graph.uncharge(owners.module_leaf, 1);
        }
        self.metrics.record_page_free(removed.len() as u64);
        let missing = requested - removed.len() as u64;
        if missing > 0 {
            self.metrics.inc_untracked_free(missing);
        }
    }

    fn handle_slab_alloc(&mut self, ptr: u64, bytes: u64, pid: u32, comm: &str, backtrace: &[u64]) {
        if !self.config.slab_tracking {
            return;
        }
        let pages = bytes.div_ceil(PAGE_SIZE).max(1);
        let task_root = self.index.task_root(&mut self.graph, pid, comm);
        let module_root = self.module_root_for(backtrace);
        let keys = self.resolve_all(backtrace);
        let charged = self.charge_both(task_root, module_root, &keys, pages);
        self.slabs.insert(ptr, (charged.task_leaf, charged.module_leaf, pages));
        self.metrics.record_page_alloc(pages);
    }

    fn handle_slab_free(&mut self, ptr: u64) {
        if !self.config.slab_tracking {
            return;
        }
        match self.slabs.remove(&ptr) {
            Some((task_leaf, module_leaf, pages)) => {
                self.graph.uncharge(task_leaf, pages);
                self.graph.uncharge(module_leaf, pages);
                self.metrics.record_page_free(pages);
            }
            None => self.metrics.inc_untracked_free(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn engine() -> Engine {
        Engine::new(EngineConfig::default(), Arc::new(Metrics::new()))
    }

    #[test]
    fn page_alloc_then_free_round_trips_counters() {
        let mut e = engine();
        e.handle(TracedEvent::PageAlloc {
            pfn: 0x1000,
            order: 0,
            gfp_flags: 0,
            pid: 42,
            comm: "A".to_string(),
            backtrace: vec![0xffff_1, 0xffff_2],
        });
        let task = e.index.task_by_pid(42).unwrap();
        assert_eq!(e.graph.pages_alloc(task.node), 1);

        e.handle(TracedEvent::PageFree {
            pfn: 0x1000,
            order: 0,
            pid: 42,
        });
        let task = e.index.task_by_pid(42).unwrap();
        assert_eq!(e.graph.pages_alloc(task.node), 0);
        assert_eq!(e.graph.pages_alloc_peak(task.node), 1);
    }

    #[test]
    fn partial_free_of_higher_order_block_leaves_remainder_charged() {
        let mut e = engine();
        e.handle(TracedEvent::PageAlloc {
            pfn: 0x2000,
            order: 2,
            gfp_flags: 0,
            pid: 7,
            comm: "X".to_string(),
            backtrace: vec![0xaaaa],
        });
        e.handle(TracedEvent::PageFree {
            pfn: 0x2002,
            order: 0,
            pid: 7,
        });
        let task = e.index.task_by_pid(7).unwrap();
        assert_eq!(e.graph.pages_alloc(task.node), 3);
    }

    #[test]
    fn free_of_unknown_pfn_counts_as_untracked() {
        let mut e = engine();
        e.handle(TracedEvent::PageFree {
            pfn: 0xdead,
            order: 0,
            pid: 1,
        });
        assert_eq!(e.metrics.pages_resident(), 0);
    }

    #[test]
    fn slab_tracking_disabled_by_default_ignores_slab_events() {
        let mut e = engine();
        e.handle(TracedEvent::SlabAlloc {
            ptr: 0x3000,
            bytes: 128,
            cache_name: "kmalloc-128".to_string(),
            pid: 1,
            comm: "A".to_string(),
            backtrace: vec![],
        });
        assert!(e.slabs.is_empty());
    }

    #[test]
    fn slab_tracking_when_enabled_rounds_bytes_up_to_pages() {
        let mut e = Engine::new(
            EngineConfig {
                slab_tracking: true,
                ..EngineConfig::default()
            },
            Arc::new(Metrics::new()),
        );
        e.handle(TracedEvent::SlabAlloc {
            ptr: 0x3000,
            bytes: 4097,
            cache_name: "kmalloc-4k".to_string(),
            pid: 1,
            comm: "A".to_string(),
            backtrace: vec![],
        });
        let task = e.index.task_by_pid(1).unwrap();
        assert_eq!(e.graph.pages_alloc(task.node), 2);

        e.handle(TracedEvent::SlabFree { ptr: 0x3000 });
        let task = e.index.task_by_pid(1).unwrap();
        assert_eq!(e.graph.pages_alloc(task.node), 0);
    }

    #[test]
    fn module_unload_keeps_accounting_but_drops_address_range() {
        let mut e = engine();
        e.handle(TracedEvent::ModuleLoad {
            name: "nvidia".to_string(),
            base: 0x1000,
            size: 0x1000,
        });
        e.handle(TracedEvent::PageAlloc {
            pfn: 0x9000,
            order: 0,
            gfp_flags: 0,
            pid: 0,
            comm: String::new(),
            backtrace: vec![],
        });
        e.handle(TracedEvent::ModuleUnload {
            name: "nvidia".to_string(),
        });
        assert!(e.index.module_by_name("nvidia").is_some());
    }

    #[test]
    fn page_alloc_inside_a_loaded_module_charges_that_module_root() {
        let mut e = engine();
        e.handle(TracedEvent::ModuleLoad {
            name: "nvidia".to_string(),
            base: 0x1000,
            size: 0x1000,
        });
        e.handle(TracedEvent::PageAlloc {
            pfn: 0x4000,
            order: 0,
            gfp_flags: 0,
            pid: 42,
            comm: "A".to_string(),
            backtrace: vec![0x1020],
        });
        let module = e.index.module_by_name("nvidia").unwrap();
        assert_eq!(e.graph.pages_alloc(module.node), 1);
        let kernel = e.index.module_by_name(KERNEL_MODULE_NAME);
        assert!(kernel.is_none());
    }

    #[test]
    fn page_alloc_outside_any_module_charges_kernel_kallsyms_root() {
        let mut e = engine();
        e.handle(TracedEvent::PageAlloc {
            pfn: 0x5000,
            order: 0,
            gfp_flags: 0,
            pid: 42,
            comm: "A".to_string(),
            backtrace: vec![0xffff_1],
        });
        let kernel = e.index.module_by_name(KERNEL_MODULE_NAME).unwrap();
        assert_eq!(e.graph.pages_alloc(kernel.node), 1);
    }

    #[test]
    fn task_and_module_forests_stay_in_sync_with_page_counters() {
        let mut e = engine();
        e.handle(TracedEvent::PageAlloc {
            pfn: 0x6000,
            order: 1,
            gfp_flags: 0,
            pid: 1,
            comm: "A".to_string(),
            backtrace: vec![0x1, 0x2],
        });
        e.handle(TracedEvent::PageFree {
            pfn: 0x6001,
            order: 0,
            pid: 1,
        });

        let task_total: u64 = e.index.tasks().map(|t| e.graph.pages_alloc(t.node)).sum();
        let module_total: u64 = e.index.modules().map(|m| e.graph.pages_alloc(m.node)).sum();
        let expected = e.metrics.page_alloc_counter.load(std::sync::atomic::Ordering::Relaxed)
            - e.metrics.page_free_counter.load(std::sync::atomic::Ordering::Relaxed)
            - e.metrics.untracked_free.load(std::sync::atomic::Ordering::Relaxed);
        assert_eq!(task_total, expected);
        assert_eq!(module_total, expected);
    }
}
