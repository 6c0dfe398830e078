use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Global counters for the tracer.
///
/// Updated from the single-threaded event loop hot path; atomics are used
/// not for cross-thread safety (the engine is single-writer) but so Query
/// Surface / report collaborators can read them without a lock.
pub struct Metrics {
    pub trace_count: AtomicU64,
    pub page_alloc_counter: AtomicU64,
    pub page_free_counter: AtomicU64,
    pub dropped_events: AtomicU64,
    pub malformed_records: AtomicU64,
    pub untracked_free: AtomicU64,
    pub truncated_backtraces: AtomicU64,
    pub start_time: SystemTime,
    events_this_sec: AtomicU64,
    events_per_sec: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            trace_count: AtomicU64::new(0),
            page_alloc_counter: AtomicU64::new(0),
            page_free_counter: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
            malformed_records: AtomicU64::new(0),
            untracked_free: AtomicU64::new(0),
            truncated_backtraces: AtomicU64::new(0),
            start_time: SystemTime::now(),
            events_this_sec: AtomicU64::new(0),
            events_per_sec: AtomicU64::new(0),
        }
    }

    pub fn record_trace(&self) {
        self.trace_count.fetch_add(1, Ordering::Relaxed);
        self.events_this_sec.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_page_alloc(&self, pages: u64) {
        self.page_alloc_counter.fetch_add(pages, Ordering::Relaxed);
    }

    pub fn record_page_free(&self, pages: u64) {
        self.page_free_counter.fetch_add(pages, Ordering::Relaxed);
    }

    pub fn inc_dropped_events(&self) {
        self.dropped_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_malformed_records(&self) {
        self.malformed_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_untracked_free(&self, pages: u64) {
        self.untracked_free.fetch_add(pages, Ordering::Relaxed);
    }

    pub fn inc_truncated_backtraces(&self) {
        self.truncated_backtraces.fetch_add(1, Ordering::Relaxed);
    }

    /// Called periodically (once per poll-loop tick) to refresh the
    /// events-per-second rate.
    pub fn rollup(&self) {
        let per_sec = self.events_this_sec.swap(0, Ordering::Relaxed);
        self.events_per_sec.store(per_sec, Ordering::Relaxed);
    }

    pub fn events_per_sec(&self) -> u64 {
        self.events_per_sec.load(Ordering::Relaxed)
    }

    pub fn pages_resident(&self) -> u64 {
        self.page_alloc_counter
            .load(Ordering::Relaxed)
            .saturating_sub(self.page_free_counter.load(Ordering::Relaxed))
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_resident_tracks_alloc_minus_free() {
        let m = Metrics::new();
        m.record_page_alloc(4);
        m.record_page_free(1);
        assert_eq!(m.pages_resident(), 3);
    }

    #[test]
    fn rollup_resets_per_second_counter() {
        let m = Metrics::new();
        m.record_trace();
        m.record_trace();
        m.rollup();
        assert_eq!(m.events_per_sec(), 2);
        m.rollup();
        assert_eq!(m.events_per_sec(), 0);
    }

    #[test]
    fn untracked_free_accumulates_pages() {
        let m = Metrics::new();
        m.inc_untracked_free(1);
        m.inc_untracked_free(4);
        assert_eq!(m.untracked_free.load(Ordering::Relaxed), 5);
    }
}
