// Tracing macros. `$src` is anything exposing `tracer_enabled()`, `tracer()` and
// `indent()`: an `ExecThread` or a `Process`.

#[macro_export]
macro_rules! vm_msg {
    ($src:expr, $($format:tt)*) => {
        if $src.tracer_enabled() {
            $src.tracer().msg($crate::vm::tracer::TraceLevel::Info, $src.indent(), format_args!($($format)*))
        }
    }
}

#[macro_export]
macro_rules! vm_debug {
    ($src:expr, $($format:tt)*) => {
        if $src.tracer_enabled() {
            $src.tracer().msg($crate::vm::tracer::TraceLevel::Debug, $src.indent(), format_args!($($format)*))
        }
    }
}

#[macro_export]
macro_rules! vm_trace_method_entry {
    ($src:expr, $name:expr, $sig:expr) => {
        if $src.tracer_enabled() {
            $src.tracer().trace_method_entry($src.indent(), $name, $sig);
        }
    };
}

#[macro_export]
macro_rules! vm_trace_method_exit {
    ($src:expr, $name:expr) => {
        if $src.tracer_enabled() {
            $src.tracer().trace_method_exit($src.indent(), $name);
        }
    };
}

#[macro_export]
macro_rules! vm_trace_exception {
    ($src:expr, $exc:expr, $loc:expr) => {
        if $src.tracer_enabled() {
            $src.tracer().trace_exception($src.indent(), $exc, $loc);
        }
    };
}

#[macro_export]
macro_rules! vm_trace_gc {
    ($src:expr, $event:expr, $($format:tt)*) => {
        if $src.tracer_enabled() {
            $src.tracer()
                .trace_gc_event($src.indent(), $event, &format!($($format)*));
        }
    };
}

#[macro_export]
macro_rules! vm_trace_finalizer {
    ($src:expr, $ty:expr, $outcome:expr) => {
        if $src.tracer_enabled() {
            $src.tracer().trace_finalizer($src.indent(), $ty, $outcome);
        }
    };
}

#[macro_export]
macro_rules! vm_trace_gc_handle {
    ($src:expr, $op:expr, $handle:expr, $($format:tt)*) => {
        if $src.tracer_enabled() {
            $src.tracer()
                .trace_gc_handle($src.indent(), $op, $handle, &format!($($format)*));
        }
    };
}
