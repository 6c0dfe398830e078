//! Event Source: opens one perf ring buffer per (CPU, tracepoint) pair
//! against the kernel's existing kmem tracepoints and yields demultiplexed
//! records. No custom eBPF program is loaded; `PERF_SAMPLE_CALLCHAIN` on the
//! tracepoint itself is enough to recover a backtrace, the same way the
//! non-eBPF tracer this crate descends from attaches via `perf_event_open(2)`
//! directly.

use std::fs;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use memmap2::MmapMut;
use tokio::io::unix::AsyncFd;

use crate::metrics::Metrics;
use crate::record::RecordKind;

const PERF_TYPE_TRACEPOINT: u32 = 2;
const PERF_SAMPLE_TID: u64 = 1 << 1;
const PERF_SAMPLE_RAW: u64 = 1 << 10;
const PERF_SAMPLE_CALLCHAIN: u64 = 1 << 3;
const PERF_RECORD_SAMPLE: u32 = 9;
const PERF_RECORD_LOST: u32 = 2;

const TRACEPOINTS: &[(&str, &str, RecordKind)] = &[
    ("kmem", "mm_page_alloc", RecordKind::PageAlloc),
    ("kmem", "mm_page_free", RecordKind::PageFree),
    ("kmem", "kmem_cache_alloc", RecordKind::SlabAlloc),
    ("kmem", "kmem_cache_free", RecordKind::SlabFree),
    ("module", "module_load", RecordKind::ModuleLoad),
    ("module", "module_free", RecordKind::ModuleUnload),
];

/// Mirrors `struct perf_event_attr` from `linux/perf_event.h`, trimmed to the
/// fields this tracer actually sets. Zeroed fields take the kernel default.
#[repr(C)]
#[derive(Copy, Clone)]
struct PerfEventAttr {
    ty: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events: u32,
    bp_type: u32,
    config1: u64,
    config2: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    __reserved_2: u16,
}

impl Default for PerfEventAttr {
    fn default() -> Self {
        // SAFETY: an all-zero perf_event_attr is valid; every field not set
        // explicitly below is left at its zero/default meaning.
        unsafe { std::mem::zeroed() }
    }
}

const PERF_EVENT_IOC_ENABLE: u64 = 0x2400;

fn tracepoint_config_id(category: &str, name: &str) -> io::Result<u64> {
    let path = format!("/sys/kernel/tracing/events/{category}/{name}/id");
    let raw = fs::read_to_string(&path)
        .or_else(|_| fs::read_to_string(format!("/sys/kernel/debug/tracing/events/{category}/{name}/id")))?;
    raw.trim()
        .parse::<u64>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn perf_event_open(attr: &PerfEventAttr, pid: i32, cpu: i32) -> io::Result<OwnedFd> {
    // SAFETY: `attr` is a valid, fully-initialized perf_event_attr; the
    // syscall either returns a valid fd or -1/errno.
    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const PerfEventAttr,
            pid,
            cpu,
            -1i32,
            0u64,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: a non-negative return from perf_event_open is an owned fd.
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

/// One mmap'd perf ring buffer: a single page of metadata followed by the
/// data region (`ring_buf_bytes`, rounded to a page-aligned power of two).
struct PerfRing {
    fd: OwnedFd,
    kind: RecordKind,
    map: MmapMut,
    data_size: usize,
}

/// Mirrors the head of `struct perf_event_mmap_page`.
#[repr(C)]
struct MmapPageHeader {
    version: u32,
    compat_version: u32,
    lock: u32,
    index: u32,
    offset: i64,
    time_enabled: u64,
    time_running: u64,
    capabilities: u64,
    pmc_width: u16,
    time_shift: u16,
    time_mult: u32,
    time_offset: u64,
    time_zero: u64,
    size: u32,
    __reserved: [u8; 948],
    data_head: u64,
    data_tail: u64,
}

impl PerfRing {
    fn open(category: &str, name: &str, kind: RecordKind, cpu: i32, ring_bytes: usize) -> io::Result<Self> {
        let config = tracepoint_config_id(category, name)?;
        let mut attr = PerfEventAttr {
            ty: PERF_TYPE_TRACEPOINT,
            size: std::mem::size_of::<PerfEventAttr>() as u32,
            config,
            sample_type: PERF_SAMPLE_TID | PERF_SAMPLE_RAW | PERF_SAMPLE_CALLCHAIN,
            wakeup_events: 1,
            sample_max_stack: 64,
            ..PerfEventAttr::default()
        };
        attr.sample_period = 1;
        let fd = perf_event_open(&attr, -1, cpu)?;

        let data_size = ring_bytes.next_power_of_two();
        let page_size = 4096;
        let map_len = page_size + data_size;
        // SAFETY: `fd` is a freshly opened perf_event fd; mmapping it with
        // PROT_READ|PROT_WRITE is exactly how the kernel's perf ABI requires
        // a consumer to map the ring buffer.
        let map = unsafe {
            memmap2::MmapOptions::new()
                .len(map_len)
                .map_mut(fd.as_raw_fd())
        }
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        // SAFETY: `fd` is a valid perf_event fd; enabling it is required
        // before any samples will be produced.
        unsafe {
            libc::ioctl(fd.as_raw_fd(), PERF_EVENT_IOC_ENABLE as _, 0);
        }

        Ok(Self {
            fd,
            kind,
            map,
            data_size,
        })
    }

    fn header(&self) -> &MmapPageHeader {
        // SAFETY: the first page of the mapping is the kernel-maintained
        // perf_event_mmap_page header.
        unsafe { &*(self.map.as_ptr() as *const MmapPageHeader) }
    }

    fn data_ptr(&self) -> *const u8 {
        unsafe { self.map.as_ptr().add(4096) }
    }

    /// Drains every record currently available, invoking `on_record` for
    /// samples and bumping `metrics.dropped_events` for lost-record markers.
    fn drain(&self, metrics: &Metrics, mut on_sample: impl FnMut(RecordKind, &[u8])) {
        let header = self.header();
        let head = unsafe { ptr::read_volatile(&header.data_head) };
        let mut tail = unsafe { ptr::read_volatile(&header.data_tail) };
        let data = self.data_ptr();
        let mask = (self.data_size - 1) as u64;

        while tail < head {
            let off = (tail & mask) as usize;
            // SAFETY: `off` is within the mapped data region by construction
            // of `mask`; the header fields are u32/u64 values the kernel
            // writes before advancing `data_head`.
            let ev_type = unsafe { ptr::read_unaligned(data.add(off) as *const u32) };
            let ev_size = unsafe { ptr::read_unaligned(data.add(off + 4) as *const u16) } as u64;
            if ev_size == 0 {
                break;
            }
            let body_off = off + 8;
            let body_len = (ev_size as usize).saturating_sub(8);
            if ev_type == PERF_RECORD_SAMPLE {
                // SAFETY: body is fully within the mapped region; `body_len`
                // was derived from the same record the kernel just wrote.
                let body = unsafe { std::slice::from_raw_parts(data.add(body_off), body_len) };
                on_sample(self.kind, body);
            } else if ev_type == PERF_RECORD_LOST {
                metrics.inc_dropped_events();
            }
            tail += ev_size;
        }
        unsafe { ptr::write_volatile(&self.header().data_tail as *const u64 as *mut u64, tail) };
    }
}

impl AsRawFd for PerfRing {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// One `PERF_RECORD_SAMPLE` body, decoded per the `sample_type` this tracer
/// requests: tid, raw data blob, then callchain.
pub struct DecodedSample {
    pub kind: RecordKind,
    pub pid: u32,
    pub raw: Vec<u8>,
    pub callchain: Vec<u64>,
}

fn decode_sample(kind: RecordKind, body: &[u8]) -> Option<DecodedSample> {
    let mut off = 0usize;
    let read_u32 = |buf: &[u8], off: &mut usize| -> Option<u32> {
        let v = buf.get(*off..*off + 4)?;
        *off += 4;
        Some(u32::from_ne_bytes(v.try_into().ok()?))
    };
    let read_u64 = |buf: &[u8], off: &mut usize| -> Option<u64> {
        let v = buf.get(*off..*off + 8)?;
        *off += 8;
        Some(u64::from_ne_bytes(v.try_into().ok()?))
    };

    // Field order follows PERF_RECORD_SAMPLE's fixed layout: PERF_SAMPLE_TID
    // (pid, tid) precedes PERF_SAMPLE_CALLCHAIN, which precedes
    // PERF_SAMPLE_RAW.
    let pid = read_u32(body, &mut off)?;
    let _tid = read_u32(body, &mut off)?;
    let nr = read_u64(body, &mut off)?;
    let mut callchain = Vec::with_capacity(nr as usize);
    for _ in 0..nr {
        callchain.push(read_u64(body, &mut off)?);
    }
    let raw_len = read_u32(body, &mut off)?;
    let raw = body.get(off..off + raw_len as usize)?.to_vec();

    Some(DecodedSample {
        kind,
        pid,
        raw,
        callchain,
    })
}

/// Owns every per-CPU, per-tracepoint ring buffer for the duration of a run.
pub struct EventSource {
    rings: Vec<AsyncFd<PerfRing>>,
    next: usize,
}

impl EventSource {
    /// Opens a ring buffer for every (cpu, tracepoint) combination. Requires
    /// `CAP_PERFMON` (or `CAP_SYS_ADMIN` on kernels that predate it).
    pub fn open(num_cpus: usize, ring_bytes: usize) -> io::Result<Self> {
        let mut rings = Vec::with_capacity(num_cpus * TRACEPOINTS.len());
        for cpu in 0..num_cpus as i32 {
            for (category, name, kind) in TRACEPOINTS {
                let ring = PerfRing::open(category, name, *kind, cpu, ring_bytes)?;
                rings.push(AsyncFd::new(ring)?);
            }
        }
        Ok(Self { rings, next: 0 })
    }

    /// Waits for the next ring with pending data, drains it, and returns the
    /// decoded samples found. Round-robins across rings so no single CPU's
    /// buffer can starve the others under sustained load.
    pub async fn poll_once(&mut self, metrics: &Metrics) -> Vec<DecodedSample> {
        let n = self.rings.len();
        if n == 0 {
            return Vec::new();
        }
        let idx = self.next;
        self.next = (self.next + 1) % n;
        let ring = &mut self.rings[idx];

        let mut ready = match ring.readable_mut().await {
            Ok(guard) => guard,
            Err(_) => return Vec::new(),
        };

        let mut samples = Vec::new();
        let _ = ready.try_io(|inner| {
            inner.get_mut().drain(metrics, |kind, body| {
                if let Some(sample) = decode_sample(kind, body) {
                    samples.push(sample);
                } else {
                    metrics.inc_malformed_records();
                }
            });
            Ok(())
        });
        ready.clear_ready();
        samples
    }
}
