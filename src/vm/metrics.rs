use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    /// Total time spent in collections (in microseconds)
    pub gc_pause_total_us: AtomicU64,
    /// Number of collections performed
    pub gc_pause_count: AtomicU64,
    /// Number of times a thread had to block waiting for a monitor
    pub lock_contention_count: AtomicU64,
    /// Total time spent waiting for monitors (in microseconds)
    pub lock_contention_total_us: AtomicU64,
    /// Layouts completed on the locked slow path
    pub layout_full_path: AtomicU64,
    pub finalizers_run: AtomicU64,
    pub dispatch_cache_hits: AtomicU64,
    pub dispatch_cache_misses: AtomicU64,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_gc_pause(&self, duration: Duration) {
        self.gc_pause_total_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.gc_pause_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_contention(&self, duration: Duration) {
        self.lock_contention_count.fetch_add(1, Ordering::Relaxed);
        self.lock_contention_total_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_layout_full_path(&self) {
        self.layout_full_path.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_finalizer_run(&self) {
        self.finalizers_run.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch(&self, hit: bool) {
        let counter = if hit {
            &self.dispatch_cache_hits
        } else {
            &self.dispatch_cache_misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn layout_full_path_count(&self) -> u64 {
        self.layout_full_path.load(Ordering::Relaxed)
    }

    pub fn finalizers_run_count(&self) -> u64 {
        self.finalizers_run.load(Ordering::Relaxed)
    }
}

impl fmt::Display for RuntimeMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        writeln!(
            f,
            "gc pauses:        {} ({} us)",
            load(&self.gc_pause_count),
            load(&self.gc_pause_total_us)
        )?;
        writeln!(
            f,
            "lock contention:  {} ({} us)",
            load(&self.lock_contention_count),
            load(&self.lock_contention_total_us)
        )?;
        writeln!(f, "layout slow path: {}", load(&self.layout_full_path))?;
        writeln!(f, "finalizers run:   {}", load(&self.finalizers_run))?;
        write!(
            f,
            "dispatch cache:   {} hits, {} misses",
            load(&self.dispatch_cache_hits),
            load(&self.dispatch_cache_misses)
        )
    }
}
