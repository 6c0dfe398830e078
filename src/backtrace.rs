//! Backtrace Resolver: turns a raw instruction address into a stable,
//! memoized symbolic key.

use std::collections::HashMap;
use std::fmt::Write as _;

/// A loaded kernel module's address range, used to attribute an address to
/// `"module:<name>+<offset>"` before falling back to kallsyms.
#[derive(Clone)]
pub struct ModuleRange {
    pub name: String,
    pub base: u64,
    pub size: u64,
}

/// The kernel-symbol table lookup is an external collaborator: a pure
/// function `address -> Option<symbol>`. The resolver depends on it through
/// this trait rather than owning the table format itself.
pub trait SymbolSource {
    fn lookup(&self, address: u64) -> Option<String>;
    fn reload(&mut self);
}

/// Reads `/proc/kallsyms`, matching the convention the kernel tracing tools
/// in this lineage use for resolving kernel addresses directly from procfs
/// rather than parsing a separate symbol file format.
pub struct KallsymsSource {
    // sorted (address, name) pairs; lookup finds the nearest symbol at or
    // below the address.
    symbols: Vec<(u64, String)>,
}

impl KallsymsSource {
    pub fn load() -> std::io::Result<Self> {
        let contents = std::fs::read_to_string("/proc/kallsyms")?;
        Ok(Self::from_str(&contents))
    }

    fn from_str(contents: &str) -> Self {
        let mut symbols: Vec<(u64, String)> = contents
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let addr = u64::from_str_radix(parts.next()?, 16).ok()?;
                let _kind = parts.next()?;
                let name = parts.next()?.to_string();
                Some((addr, name))
            })
            .collect();
        symbols.sort_by_key(|(addr, _)| *addr);
        Self { symbols }
    }

    pub fn empty() -> Self {
        Self { symbols: Vec::new() }
    }
}

impl SymbolSource for KallsymsSource {
    fn lookup(&self, address: u64) -> Option<String> {
        if self.symbols.is_empty() {
            return None;
        }
        match self.symbols.binary_search_by_key(&address, |(a, _)| *a) {
            Ok(idx) => Some(self.symbols[idx].1.clone()),
            Err(0) => None,
            Err(idx) => Some(self.symbols[idx - 1].1.clone()),
        }
    }

    fn reload(&mut self) {
        if let Ok(fresh) = KallsymsSource::load() {
            *self = fresh;
        }
    }
}

/// Memoized address -> key resolution. Entries already interned keep their
/// previously resolved key across a `reload_symbols()`, so the graph stays
/// stable even if the underlying symbol table changes shape.
pub struct BacktraceResolver<S: SymbolSource> {
    source: S,
    modules: Vec<ModuleRange>,
    cache: HashMap<u64, String>,
}

impl<S: SymbolSource> BacktraceResolver<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            modules: Vec::new(),
            cache: HashMap::new(),
        }
    }

    pub fn register_module(&mut self, range: ModuleRange) {
        self.modules.push(range);
    }

    pub fn unregister_module(&mut self, name: &str) {
        self.modules.retain(|m| m.name != name);
    }

    /// Name of the first loaded module whose address range contains any of
    /// `addresses`, scanned innermost-first (nearest the allocation site).
    /// `None` means the whole chain resolves to core kernel code.
    pub fn owning_module(&self, addresses: &[u64]) -> Option<&str> {
        addresses.iter().find_map(|addr| {
            self.modules
                .iter()
                .find(|m| *addr >= m.base && *addr < m.base + m.size)
                .map(|m| m.name.as_str())
        })
    }

    /// Resolves `address` to a stable key, memoizing the result.
    pub fn resolve(&mut self, address: u64) -> String {
        if let Some(key) = self.cache.get(&address) {
            return key.clone();
        }
        let key = self.resolve_uncached(address);
        self.cache.insert(address, key.clone());
        key
    }

    fn resolve_uncached(&self, address: u64) -> String {
        for module in &self.modules {
            if address >= module.base && address < module.base + module.size {
                let offset = address - module.base;
                let mut key = String::new();
                let _ = write!(key, "module:{}+{:#x}", module.name, offset);
                return key;
            }
        }
        if let Some(name) = self.source.lookup(address) {
            return name;
        }
        format!("{address:#x}")
    }

    /// Invalidates the symbol source (e.g. `/proc/kallsyms` was refreshed
    /// after a module load) without discarding already-resolved keys.
    pub fn reload_symbols(&mut self) {
        self.source.reload();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSource {
        table: Vec<(u64, String)>,
    }

    impl SymbolSource for FakeSource {
        fn lookup(&self, address: u64) -> Option<String> {
            self.table
                .iter()
                .rev()
                .find(|(a, _)| *a <= address)
                .map(|(_, n)| n.clone())
        }
        fn reload(&mut self) {}
    }

    #[test]
    fn resolves_known_symbol() {
        let source = FakeSource {
            table: vec![(0x1000, "do_alloc".to_string())],
        };
        let mut resolver = BacktraceResolver::new(source);
        assert_eq!(resolver.resolve(0x1010), "do_alloc");
    }

    #[test]
    fn unresolved_address_falls_back_to_hex() {
        let source = FakeSource { table: vec![] };
        let mut resolver = BacktraceResolver::new(source);
        assert_eq!(resolver.resolve(0xdead), "0xdead");
    }

    #[test]
    fn module_range_takes_precedence_over_symbol_table() {
        let source = FakeSource {
            table: vec![(0x1000, "should_not_match".to_string())],
        };
        let mut resolver = BacktraceResolver::new(source);
        resolver.register_module(ModuleRange {
            name: "nvidia".to_string(),
            base: 0x1000,
            size: 0x1000,
        });
        assert_eq!(resolver.resolve(0x1020), "module:nvidia+0x20");
    }

    #[test]
    fn owning_module_finds_innermost_matching_frame() {
        let source = FakeSource { table: vec![] };
        let mut resolver = BacktraceResolver::new(source);
        resolver.register_module(ModuleRange {
            name: "nvidia".to_string(),
            base: 0x1000,
            size: 0x1000,
        });
        assert_eq!(resolver.owning_module(&[0x1020, 0x9999]), Some("nvidia"));
        assert_eq!(resolver.owning_module(&[0x9999]), None);
    }

    #[test]
    fn resolution_is_memoized_across_reload() {
        let source = FakeSource {
            table: vec![(0x1000, "do_alloc".to_string())],
        };
        let mut resolver = BacktraceResolver::new(source);
        let first = resolver.resolve(0x1010);
        resolver.reload_symbols();
        let second = resolver.resolve(0x1010);
        assert_eq!(first, second);
    }
}
