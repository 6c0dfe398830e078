use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/pagetracer/pagetracer.toml";
const ENV_CONFIG_PATH: &str = "PAGETRACER_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `PAGETRACER_CONFIG` environment variable. If the file is missing or
    /// fails to parse, defaults are returned rather than failing startup.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = PathBuf::from(path);
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Size in bytes of each per-CPU ring buffer. Matches the original
    /// tracer's default of 4 MiB.
    #[serde(default = "default_ring_buf_bytes")]
    pub ring_buf_bytes: usize,
    /// Track `kmem:kmem_cache_alloc`/`kmem:kmem_cache_free` in addition to
    /// page allocations.
    #[serde(default = "default_slab_tracking")]
    pub slab_tracking: bool,
    /// Maximum backtrace depth kept per event before truncation.
    #[serde(default = "default_max_frames")]
    pub max_frames: usize,
    /// Force full leaf-path resolution on every uncharge, even when the
    /// Page Map hit already identifies the leaf.
    #[serde(default = "default_page_free_always_backtrack")]
    pub page_free_always_backtrack: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ring_buf_bytes: default_ring_buf_bytes(),
            slab_tracking: default_slab_tracking(),
            max_frames: default_max_frames(),
            page_free_always_backtrack: default_page_free_always_backtrack(),
        }
    }
}

fn default_ring_buf_bytes() -> usize {
    4 << 20
}
fn default_slab_tracking() -> bool {
    false
}
fn default_max_frames() -> usize {
    64
}
fn default_page_free_always_backtrack() -> bool {
    false
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReportConfig {
    /// "task_summary" or "module_summary".
    #[serde(default = "default_report_kind")]
    pub kind: String,
    #[serde(default = "default_output_path")]
    pub output_path: String,
    #[serde(default)]
    pub top_only: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            kind: default_report_kind(),
            output_path: default_output_path(),
            top_only: false,
        }
    }
}

fn default_report_kind() -> String {
    "task_summary".to_string()
}
fn default_output_path() -> String {
    "pagetracer.log".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_debug")]
    pub debug: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            debug: default_debug(),
        }
    }
}

fn default_debug() -> bool {
    false
}
