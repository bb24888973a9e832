//! Method invocation and object lifetime.
//!
//! An [`ExecThread`] is the entry point for everything here: calls packed for
//! the configured executor, allocation, the GC and monitor internalcalls. The
//! [`Process`] it belongs to holds the shared state.

#[macro_use]
mod macros;

pub mod call;
pub mod common;
pub mod config;
pub mod dispatch;
pub mod exceptions;
pub mod finalize;
pub mod gc;
pub mod gchandle;
pub mod heap;
pub mod interpreter;
pub mod intrinsics;
pub mod metrics;
pub mod monitor;
pub mod native;
pub mod pack;
pub mod process;
pub mod signature;
pub mod stack;
pub mod sync;
pub mod thread;
pub mod tracer;
pub mod unpack;

pub use interpreter::{Activation, Interpreter, ScriptedInterpreter};
pub use native::{FfiBackend, NativeBackend, NativeCall};
pub use process::{Executor, Process, ProcessState};
pub use thread::ExecThread;
