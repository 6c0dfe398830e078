use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use caps::{CapSet, Capability};
use clap::Parser;
use pagetracer::config::Config;
use pagetracer::engine::Engine;
use pagetracer::event_source::EventSource;
use pagetracer::metrics::Metrics;
use pagetracer::query;
use pagetracer::record::{self, RawRecord};

#[derive(Parser, Debug)]
#[command(name = "pagetracer")]
#[command(about = "Live kernel page/slab allocation tracer")]
struct Args {
    /// Path to config file (overrides PAGETRACER_CONFIG).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// "task_summary" or "module_summary".
    #[arg(long)]
    report: Option<String>,
    /// Track kmem_cache_alloc/free in addition to page allocations.
    #[arg(long)]
    slab: bool,
    /// Where to write the report.
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    /// Per-CPU ring buffer size in bytes.
    #[arg(long)]
    ring_buf_bytes: Option<usize>,
}

fn required_capabilities_present() -> anyhow::Result<bool> {
    let required = [Capability::CAP_PERFMON, Capability::CAP_SYS_ADMIN];
    for cap in &required {
        let has_cap = caps::has_cap(None, CapSet::Effective, *cap)
            .with_context(|| format!("failed to query capability {cap:?}"))?;
        if has_cap {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Matches the original tracer's `tune_glibc()`/`set_high_priority()`: a
/// long-running sampling process that should not be preempted by its own
/// allocator churn or by the scheduler under load.
fn tune_process() {
    unsafe {
        libc::mallopt(libc::M_TOP_PAD, 4096);
        libc::mallopt(libc::M_TRIM_THRESHOLD, 4096);
        if libc::setpriority(libc::PRIO_PROCESS, 0, -20) != 0 {
            log::warn!("failed to raise process priority: {}", std::io::Error::last_os_error());
        }
    }
}

fn apply_cli_overrides(mut config: Config, args: &Args) -> Config {
    if let Some(kind) = &args.report {
        config.report.kind = kind.clone();
    }
    if args.slab {
        config.engine.slab_tracking = true;
    }
    if let Some(output) = &args.output {
        config.report.output_path = output.to_string_lossy().to_string();
    }
    if let Some(bytes) = args.ring_buf_bytes {
        config.engine.ring_buf_bytes = bytes;
    }
    config
}

fn write_report(config: &Config, engine: &Engine, metrics: &Metrics) -> anyhow::Result<()> {
    let mut out = String::new();
    if config.report.kind == "module_summary" {
        for m in query::collect_modules_sorted(engine.graph(), engine.index(), config.report.top_only) {
            out.push_str(&format!("{:<32} {:>10} pages (peak {})\n", m.name, m.pages_alloc, m.pages_alloc_peak));
        }
    } else {
        for t in query::collect_tasks_sorted(engine.graph(), engine.index(), config.report.top_only) {
            out.push_str(&format!(
                "{:>7} {:<16} {:>10} pages (peak {})\n",
                t.pid, t.task_name, t.pages_alloc, t.pages_alloc_peak
            ));
        }
    }

    out.push_str(&format!(
        "\ntraces={} page_allocs={} page_frees={} dropped_events={} malformed_records={} untracked_frees={} truncated_backtraces={} events_per_sec={} uptime_s={}\n",
        metrics.trace_count.load(std::sync::atomic::Ordering::Relaxed),
        metrics.page_alloc_counter.load(std::sync::atomic::Ordering::Relaxed),
        metrics.page_free_counter.load(std::sync::atomic::Ordering::Relaxed),
        metrics.dropped_events.load(std::sync::atomic::Ordering::Relaxed),
        metrics.malformed_records.load(std::sync::atomic::Ordering::Relaxed),
        metrics.untracked_free.load(std::sync::atomic::Ordering::Relaxed),
        metrics.truncated_backtraces.load(std::sync::atomic::Ordering::Relaxed),
        metrics.events_per_sec(),
        metrics.uptime_seconds(),
    ));

    std::fs::write(&config.report.output_path, out)
        .with_context(|| format!("failed to write report to {}", config.report.output_path))
}

/// Strips the 8-byte ftrace common header (`common_type`, `common_flags`,
/// `common_preempt_count`, `common_pid`) that precedes every tracepoint's
/// own fields in `PERF_SAMPLE_RAW` data.
fn strip_common_header(raw: &[u8]) -> &[u8] {
    raw.get(8..).unwrap_or(&[])
}

/// Perf samples carry a pid/tid but not a `comm` string; look it up from
/// procfs, the same place the kernel's own `/proc/<pid>/comm` gets it from.
fn comm_for_pid(pid: u32) -> [u8; 16] {
    let mut buf = [0u8; 16];
    if let Ok(name) = std::fs::read_to_string(format!("/proc/{pid}/comm")) {
        let trimmed = name.trim().as_bytes();
        let n = trimmed.len().min(buf.len());
        buf[..n].copy_from_slice(&trimmed[..n]);
    }
    buf
}

async fn run(mut event_source: EventSource, mut engine: Engine, metrics: Arc<Metrics>, config: Config) -> anyhow::Result<()> {
    let mut rollup = tokio::time::interval(Duration::from_secs(1));
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            samples = tokio::time::timeout(Duration::from_millis(250), event_source.poll_once(&metrics)) => {
                if let Ok(samples) = samples {
                    for sample in samples {
                        let body = strip_common_header(&sample.raw);
                        let (payload, trailer) = record::split_body(sample.kind, body);
                        let raw = RawRecord {
                            kind: sample.kind,
                            pid: sample.pid,
                            comm: comm_for_pid(sample.pid),
                            payload,
                            callchain: &sample.callchain,
                            trailer,
                        };
                        match record::parse_record(&raw) {
                            Some(event) => engine.handle(event),
                            None => metrics.inc_malformed_records(),
                        }
                    }
                }
            }
            _ = rollup.tick() => {
                metrics.rollup();
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("received SIGINT, draining and exiting");
                break;
            }
            _ = sigterm.recv() => {
                log::info!("received SIGTERM, draining and exiting");
                break;
            }
        }
    }

    write_report(&config, &engine, &metrics)?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    if let Some(path) = &args.config {
        // SAFETY: single-threaded at this point in startup, before any
        // other code reads the environment.
        unsafe {
            std::env::set_var("PAGETRACER_CONFIG", path);
        }
    }

    if !required_capabilities_present()? {
        log::error!(
            "missing CAP_PERFMON/CAP_SYS_ADMIN. Grant it with `sudo setcap cap_perfmon,cap_sys_admin+ep $(command -v pagetracer)` and restart."
        );
        std::process::exit(libc::EPERM);
    }

    tune_process();

    let config = apply_cli_overrides(Config::load(), &args);
    let metrics = Arc::new(Metrics::new());
    let engine = Engine::new(config.engine.clone(), Arc::clone(&metrics));

    let num_cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    let event_source = match EventSource::open(num_cpus, config.engine.ring_buf_bytes) {
        Ok(source) => source,
        Err(e) => {
            log::error!("failed to initialize perf event source: {e}");
            std::process::exit(1);
        }
    };

    log::info!("tracing memory allocations across {num_cpus} cpus, press ^C to interrupt");
    run(event_source, engine, metrics, config).await
}

