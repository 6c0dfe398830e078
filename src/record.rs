//! Record Parser: converts a raw per-event byte record (already demultiplexed
//! and framed by the Event Source) into a typed [`TracedEvent`].

use std::ptr;

#[derive(Debug, Clone, PartialEq)]
pub enum TracedEvent {
    PageAlloc {
        pfn: u64,
        order: u32,
        gfp_flags: u32,
        pid: u32,
        comm: String,
        backtrace: Vec<u64>,
    },
    PageFree {
        pfn: u64,
        order: u32,
        pid: u32,
    },
    SlabAlloc {
        ptr: u64,
        bytes: u64,
        cache_name: String,
        pid: u32,
        comm: String,
        backtrace: Vec<u64>,
    },
    SlabFree {
        ptr: u64,
    },
    ModuleLoad {
        name: String,
        base: u64,
        size: u64,
    },
    ModuleUnload {
        name: String,
    },
}

#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RecordKind {
    PageAlloc = 0,
    PageFree = 1,
    SlabAlloc = 2,
    SlabFree = 3,
    ModuleLoad = 4,
    ModuleUnload = 5,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct PageAllocFixed {
    pfn: u64,
    order: u32,
    gfp_flags: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct PageFreeFixed {
    pfn: u64,
    order: u32,
    _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct SlabFixed {
    ptr: u64,
    bytes: u64,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct ModuleFixed {
    base: u64,
    size: u64,
}

/// A single demultiplexed trace-event record, as framed by the Event
/// Source. `payload` holds the tracepoint's fixed-size fields, `trailer`
/// holds any variable-length string field (cache or module name), and
/// `callchain` holds the raw instruction addresses captured at event time.
pub struct RawRecord<'a> {
    pub kind: RecordKind,
    pub pid: u32,
    pub comm: [u8; 16],
    pub payload: &'a [u8],
    pub callchain: &'a [u64],
    pub trailer: &'a str,
}

/// Parses one raw record. Returns `None` on a malformed (too-short)
/// payload; the caller is responsible for counting that as a data-quality
/// error and continuing (spec'd as non-fatal).
pub fn parse_record(raw: &RawRecord) -> Option<TracedEvent> {
    let comm = comm_to_string(&raw.comm);
    match raw.kind {
        RecordKind::PageAlloc => {
            let fixed: PageAllocFixed = read_fixed(raw.payload)?;
            Some(TracedEvent::PageAlloc {
                pfn: fixed.pfn,
                order: fixed.order,
                gfp_flags: fixed.gfp_flags,
                pid: raw.pid,
                comm,
                backtrace: raw.callchain.to_vec(),
            })
        }
        RecordKind::PageFree => {
            let fixed: PageFreeFixed = read_fixed(raw.payload)?;
            Some(TracedEvent::PageFree {
                pfn: fixed.pfn,
                order: fixed.order,
                pid: raw.pid,
            })
        }
        RecordKind::SlabAlloc => {
            let fixed: SlabFixed = read_fixed(raw.payload)?;
            Some(TracedEvent::SlabAlloc {
                ptr: fixed.ptr,
                bytes: fixed.bytes,
                cache_name: raw.trailer.to_string(),
                pid: raw.pid,
                comm,
                backtrace: raw.callchain.to_vec(),
            })
        }
        RecordKind::SlabFree => {
            let fixed: SlabFixed = read_fixed(raw.payload)?;
            Some(TracedEvent::SlabFree { ptr: fixed.ptr })
        }
        RecordKind::ModuleLoad => {
            let fixed: ModuleFixed = read_fixed(raw.payload)?;
            Some(TracedEvent::ModuleLoad {
                name: raw.trailer.to_string(),
                base: fixed.base,
                size: fixed.size,
            })
        }
        RecordKind::ModuleUnload => Some(TracedEvent::ModuleUnload {
            name: raw.trailer.to_string(),
        }),
    }
}

/// Reads a fixed-size, repr(C) payload struct out of a byte slice the way
/// the stream listener this tracer descends from reads its own wire
/// structs: an unaligned raw pointer cast, since the kernel gives no
/// alignment guarantee for a tracepoint's raw field bytes.
fn read_fixed<T: Copy>(bytes: &[u8]) -> Option<T> {
    if bytes.len() < std::mem::size_of::<T>() {
        return None;
    }
    // SAFETY: `bytes` has just been checked to hold at least `size_of::<T>()`
    // bytes, and `T` is a `#[repr(C)]` struct of plain integer fields.
    Some(unsafe { ptr::read_unaligned(bytes.as_ptr() as *const T) })
}

fn comm_to_string(comm: &[u8; 16]) -> String {
    let nul = comm.iter().position(|b| *b == 0).unwrap_or(comm.len());
    String::from_utf8_lossy(&comm[..nul]).trim().to_string()
}

/// Splits a demultiplexed record body into its fixed-size payload and, for
/// kinds that carry one, a trailing NUL-terminated name (cache or module
/// name). Mirrors how ftrace lays out a tracepoint's `__data_loc` string
/// fields after its fixed fields.
pub fn split_body(kind: RecordKind, body: &[u8]) -> (&[u8], &str) {
    let fixed_len = match kind {
        RecordKind::PageAlloc => std::mem::size_of::<PageAllocFixed>(),
        RecordKind::PageFree => std::mem::size_of::<PageFreeFixed>(),
        RecordKind::SlabAlloc | RecordKind::SlabFree => std::mem::size_of::<SlabFixed>(),
        RecordKind::ModuleLoad => std::mem::size_of::<ModuleFixed>(),
        RecordKind::ModuleUnload => 0,
    };
    let payload = match body.get(..fixed_len) {
        Some(p) => p,
        None => return (body, ""),
    };
    let rest = &body[fixed_len..];
    let nul = rest.iter().position(|b| *b == 0).unwrap_or(rest.len());
    let trailer = std::str::from_utf8(&rest[..nul]).unwrap_or("");
    (payload, trailer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comm(name: &str) -> [u8; 16] {
        let mut buf = [0u8; 16];
        let bytes = name.as_bytes();
        buf[..bytes.len()].copy_from_slice(bytes);
        buf
    }

    /// Reinterprets a `#[repr(C)]` fixed struct as raw bytes, mirroring how
    /// the real ring buffer presents it.
    fn as_bytes<T>(value: &T) -> &[u8] {
        unsafe { std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>()) }
    }

    #[test]
    fn parses_page_alloc() {
        let fixed = PageAllocFixed {
            pfn: 0x1000,
            order: 0,
            gfp_flags: 0x42,
        };
        let bytes = as_bytes(&fixed);
        let raw = RawRecord {
            kind: RecordKind::PageAlloc,
            pid: 42,
            comm: comm("myapp"),
            payload: bytes,
            callchain: &[0xaaaa, 0xbbbb],
            trailer: "",
        };
        let event = parse_record(&raw).unwrap();
        assert_eq!(
            event,
            TracedEvent::PageAlloc {
                pfn: 0x1000,
                order: 0,
                gfp_flags: 0x42,
                pid: 42,
                comm: "myapp".to_string(),
                backtrace: vec![0xaaaa, 0xbbbb],
            }
        );
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let raw = RawRecord {
            kind: RecordKind::PageAlloc,
            pid: 1,
            comm: comm("x"),
            payload: &[0u8; 2],
            callchain: &[],
            trailer: "",
        };
        assert!(parse_record(&raw).is_none());
    }

    #[test]
    fn parses_module_load_with_trailer_name() {
        let fixed = ModuleFixed {
            base: 0xffff_0000,
            size: 0x4000,
        };
        let bytes = as_bytes(&fixed);
        let raw = RawRecord {
            kind: RecordKind::ModuleLoad,
            pid: 0,
            comm: comm(""),
            payload: bytes,
            callchain: &[],
            trailer: "nvidia",
        };
        let event = parse_record(&raw).unwrap();
        assert_eq!(
            event,
            TracedEvent::ModuleLoad {
                name: "nvidia".to_string(),
                base: 0xffff_0000,
                size: 0x4000,
            }
        );
    }

    #[test]
    fn split_body_separates_fixed_fields_from_trailing_name() {
        let fixed = ModuleFixed {
            base: 0x1000,
            size: 0x2000,
        };
        let mut body = as_bytes(&fixed).to_vec();
        body.extend_from_slice(b"nvidia\0\0");
        let (payload, trailer) = split_body(RecordKind::ModuleLoad, &body);
        assert_eq!(payload.len(), std::mem::size_of::<ModuleFixed>());
        assert_eq!(trailer, "nvidia");
    }

    #[test]
    fn split_body_on_too_short_body_returns_whole_body_as_payload() {
        let (payload, trailer) = split_body(RecordKind::PageAlloc, &[1, 2]);
        assert_eq!(payload, &[1, 2]);
        assert_eq!(trailer, "");
    }
}
