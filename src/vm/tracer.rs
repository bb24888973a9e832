//! Buffered runtime tracer for the engine.
//!
//! Captures call boundaries, exceptions, collections, finalizers and handle
//! table traffic with minimal cost when disabled: every entry point checks a
//! plain flag before touching the writer.
//!
//! ## Environment Variables
//!
//! - `DOTNET_ENGINE_TRACE`: Enable tracing
//!   - `"1"`, `"true"`, or `"stdout"`: Write to stdout
//!   - `"stderr"`: Write to stderr
//!   - `<path>`: Write to file at path
//!
//! - `DOTNET_ENGINE_TRACE_FLUSH_INTERVAL`: Number of messages before auto-flush (default: 10000)
//!
//! - `DOTNET_ENGINE_TRACE_STATS`: Enable detailed statistics collection (`"1"` or `"true"`)
//!
//! ```ignore
//! vm_debug!(thread, "allocated {:?}", obj);
//! vm_trace_method_entry!(thread, &name, &signature);
//! vm_trace_gc!(thread, "collect", "{} freed", freed);
//! ```
use parking_lot::Mutex;
use std::{
    env,
    fs::File,
    io::{stderr, stdout, BufWriter, Write},
};

const BUFFER_SIZE: usize = 256 * 1024;
const AUTO_FLUSH_INTERVAL: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceLevel {
    Info,
    Debug,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceStats {
    pub total_messages: usize,
    pub method_calls: usize,
    pub method_returns: usize,
    pub gc_events: usize,
    pub exceptions: usize,
    pub finalizers: usize,
    pub handle_ops: usize,
}

struct TracerState {
    writer: Option<BufWriter<Box<dyn Write + Send>>>,
    message_count: usize,
    stats: TraceStats,
}

pub struct Tracer {
    enabled: bool,
    auto_flush_interval: usize,
    detailed_stats: bool,
    state: Mutex<TracerState>,
}

impl Tracer {
    pub fn new() -> Self {
        let (enabled, writer): (bool, Option<Box<dyn Write + Send>>) =
            match env::var("DOTNET_ENGINE_TRACE") {
                Ok(val) if val == "1" || val == "true" || val == "stdout" => {
                    (true, Some(Box::new(stdout())))
                }
                Ok(val) if val == "stderr" => (true, Some(Box::new(stderr()))),
                Ok(val) if !val.is_empty() => match File::create(&val) {
                    Ok(f) => (true, Some(Box::new(f))),
                    Err(e) => {
                        tracing::warn!("failed to create trace file {}: {}", val, e);
                        (false, None)
                    }
                },
                _ => (false, None),
            };

        let auto_flush_interval = env::var("DOTNET_ENGINE_TRACE_FLUSH_INTERVAL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(AUTO_FLUSH_INTERVAL);

        let detailed_stats = env::var("DOTNET_ENGINE_TRACE_STATS")
            .map(|v| v == "1" || v == "true")
            .unwrap_or(false);

        Self::build(enabled, writer, auto_flush_interval, detailed_stats)
    }

    /// A tracer writing to `writer` with statistics on, regardless of the environment.
    pub fn with_writer(writer: Box<dyn Write + Send>) -> Self {
        Self::build(true, Some(writer), AUTO_FLUSH_INTERVAL, true)
    }

    fn build(
        enabled: bool,
        writer: Option<Box<dyn Write + Send>>,
        auto_flush_interval: usize,
        detailed_stats: bool,
    ) -> Self {
        Self {
            enabled,
            auto_flush_interval: auto_flush_interval.max(1),
            detailed_stats,
            state: Mutex::new(TracerState {
                writer: writer.map(|w| BufWriter::with_capacity(BUFFER_SIZE, w)),
                message_count: 0,
                stats: TraceStats::default(),
            }),
        }
    }

    #[inline(always)]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn write_msg(&self, indent: usize, args: std::fmt::Arguments, count: impl FnOnce(&mut TraceStats)) {
        let mut state = self.state.lock();
        if self.detailed_stats {
            state.stats.total_messages += 1;
            count(&mut state.stats);
        }
        let interval = self.auto_flush_interval;
        let TracerState {
            writer,
            message_count,
            ..
        } = &mut *state;
        if let Some(writer) = writer {
            for _ in 0..indent {
                let _ = writer.write_all(b"  ");
            }
            let _ = writer.write_fmt(args);
            let _ = writer.write_all(b"\n");

            *message_count += 1;
            if *message_count >= interval {
                let _ = writer.flush();
                *message_count = 0;
            }
        }
    }

    pub fn msg(&self, level: TraceLevel, indent: usize, args: std::fmt::Arguments) {
        if !self.enabled {
            return;
        }
        match level {
            TraceLevel::Info => self.write_msg(indent, args, |_| {}),
            TraceLevel::Debug => self.write_msg(indent, format_args!("[debug] {}", args), |_| {}),
        }
    }

    pub fn flush(&self) {
        if self.enabled {
            let mut state = self.state.lock();
            if let Some(writer) = state.writer.as_mut() {
                let _ = writer.flush();
            }
            state.message_count = 0;
        }
    }

    pub fn trace_method_entry(&self, indent: usize, name: &str, signature: &str) {
        if !self.enabled {
            return;
        }
        let count = |s: &mut TraceStats| s.method_calls += 1;
        if signature.is_empty() {
            self.write_msg(indent, format_args!("→ CALL {}", name), count);
        } else {
            self.write_msg(indent, format_args!("→ CALL {} ({})", name, signature), count);
        }
    }

    pub fn trace_method_exit(&self, indent: usize, name: &str) {
        if !self.enabled {
            return;
        }
        self.write_msg(indent, format_args!("← RET  {}", name), |s| {
            s.method_returns += 1
        });
    }

    pub fn trace_exception(&self, indent: usize, exception: &str, location: &str) {
        if !self.enabled {
            return;
        }
        self.write_msg(
            indent,
            format_args!("⚠ EXC  {} at {}", exception, location),
            |s| s.exceptions += 1,
        );
    }

    pub fn trace_gc_event(&self, indent: usize, event: &str, details: &str) {
        if !self.enabled {
            return;
        }
        self.write_msg(indent, format_args!("♻ GC   {} ({})", event, details), |s| {
            s.gc_events += 1
        });
    }

    pub fn trace_finalizer(&self, indent: usize, type_name: &str, outcome: &str) {
        if !self.enabled {
            return;
        }
        self.write_msg(indent, format_args!("✝ FIN  {} {}", type_name, outcome), |s| {
            s.finalizers += 1
        });
    }

    pub fn trace_gc_handle(&self, indent: usize, op: &str, handle: usize, details: &str) {
        if !self.enabled {
            return;
        }
        self.write_msg(
            indent,
            format_args!("  HANDLE {} {:#x} {}", op, handle, details),
            |s| s.handle_ops += 1,
        );
    }

    pub fn get_stats(&self) -> TraceStats {
        self.state.lock().stats.clone()
    }

    pub fn print_stats(&self) {
        if !self.detailed_stats {
            return;
        }
        let stats = self.get_stats();
        eprintln!("\n=== Tracer Statistics ===");
        eprintln!("Total messages:      {:>12}", stats.total_messages);
        eprintln!("Method calls:        {:>12}", stats.method_calls);
        eprintln!("Method returns:      {:>12}", stats.method_returns);
        eprintln!("GC events:           {:>12}", stats.gc_events);
        eprintln!("Exceptions:          {:>12}", stats.exceptions);
        eprintln!("Finalizers:          {:>12}", stats.finalizers);
        eprintln!("Handle operations:   {:>12}", stats.handle_ops);
        eprintln!("========================\n");
    }

    /// Writes the collector's counters as a boxed block.
    pub fn dump_gc_stats(&self, heap_bytes: usize, pending_finalizers: usize, gc_handles: usize) {
        if !self.enabled {
            return;
        }
        let bar = "════════════════════════════════════════════════════════════";
        self.msg(TraceLevel::Info, 0, format_args!(""));
        self.msg(TraceLevel::Info, 0, format_args!("╔{}", bar));
        self.msg(TraceLevel::Info, 0, format_args!("║ GC STATISTICS"));
        self.msg(TraceLevel::Info, 0, format_args!("╠{}", bar));
        self.msg(TraceLevel::Info, 0, format_args!("║ Heap bytes:           {}", heap_bytes));
        self.msg(
            TraceLevel::Info,
            0,
            format_args!("║ Pending finalization: {}", pending_finalizers),
        );
        self.msg(TraceLevel::Info, 0, format_args!("║ GC handles:           {}", gc_handles));
        self.msg(TraceLevel::Info, 0, format_args!("╚{}", bar));
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        if self.detailed_stats && self.enabled {
            self.print_stats();
        }
        self.flush();
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}
