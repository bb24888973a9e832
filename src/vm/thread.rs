//! Engine threads and their binding to native threads.
use crate::{
    error::{Fault, Thrown},
    types::MethodId,
    value::{ObjectRef, Word},
    vm::{
        exceptions::{ExceptionKind, PendingException},
        gc::RootSet,
        stack::{EvaluationStack, FrameStack, Pc, INVALID_PC},
        tracer::Tracer,
        Process,
    },
};
use parking_lot::{Mutex, MutexGuard};
use std::{
    cell::Cell,
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread::ThreadId,
};

thread_local! {
    /// Engine thread the current native thread is executing as.
    static CURRENT_THREAD_ID: Cell<Option<u64>> = const { Cell::new(None) };
}

/// The engine thread bound to the calling native thread, if any.
pub fn current_thread_id() -> Option<u64> {
    CURRENT_THREAD_ID.get()
}

/// Binds the calling native thread to an engine thread until dropped, then
/// restores the previous binding.
#[must_use]
pub struct ContextGuard {
    previous: Option<u64>,
}

impl ContextGuard {
    pub fn enter(thread_id: u64) -> Self {
        Self {
            previous: CURRENT_THREAD_ID.replace(Some(thread_id)),
        }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CURRENT_THREAD_ID.set(self.previous);
    }
}

/// The parts of an engine thread a collection started on another thread has
/// to see: the evaluation stack and the pending exception object.
#[derive(Debug)]
pub struct ThreadRoots {
    stack: Mutex<EvaluationStack>,
    exception: AtomicUsize,
}

impl ThreadRoots {
    pub fn new(stack_words: usize) -> Self {
        Self {
            stack: Mutex::new(EvaluationStack::new(stack_words)),
            exception: AtomicUsize::new(0),
        }
    }

    pub fn stack(&self) -> MutexGuard<'_, EvaluationStack> {
        self.stack.lock()
    }

    fn publish_exception(&self, object: Option<ObjectRef>) {
        self.exception.store(ObjectRef::word_of(object), Ordering::Release);
    }

    fn exception_word(&self) -> Word {
        self.exception.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
struct ThreadRecord {
    native_id: ThreadId,
    is_finalizer: bool,
    roots: Arc<ThreadRoots>,
}

/// Registry of live engine threads. Id 0 is never handed out, so it can mean
/// "no owner" in monitor state.
#[derive(Debug)]
pub struct ThreadManager {
    threads: Mutex<HashMap<u64, ThreadRecord>>,
    next_thread_id: AtomicU64,
}

impl Default for ThreadManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadManager {
    pub fn new() -> Self {
        Self {
            threads: Mutex::new(HashMap::new()),
            next_thread_id: AtomicU64::new(1),
        }
    }

    pub fn register_thread(&self, is_finalizer: bool, roots: Arc<ThreadRoots>) -> u64 {
        let id = self.next_thread_id.fetch_add(1, Ordering::SeqCst);
        self.threads.lock().insert(
            id,
            ThreadRecord {
                native_id: std::thread::current().id(),
                is_finalizer,
                roots,
            },
        );
        id
    }

    pub fn unregister_thread(&self, id: u64) {
        self.threads.lock().remove(&id);
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn finalizer_threads(&self) -> usize {
        self.threads
            .lock()
            .values()
            .filter(|t| t.is_finalizer)
            .count()
    }

    /// Native thread that created the engine thread.
    pub fn native_id(&self, id: u64) -> Option<ThreadId> {
        self.threads.lock().get(&id).map(|t| t.native_id)
    }

    /// Runs `f` with the live stack words and pending exceptions of every
    /// registered thread added to `roots`. The stacks stay locked until `f`
    /// returns, so no thread can push a reference the collection misses.
    /// Stacks are locked in id order.
    pub fn with_stopped_stacks<R>(&self, roots: &mut RootSet, f: impl FnOnce(&RootSet) -> R) -> R {
        let mut records: Vec<(u64, Arc<ThreadRoots>)> = self
            .threads
            .lock()
            .iter()
            .map(|(id, record)| (*id, record.roots.clone()))
            .collect();
        records.sort_unstable_by_key(|(id, _)| *id);

        let stacks: Vec<MutexGuard<'_, EvaluationStack>> =
            records.iter().map(|(_, roots)| roots.stack()).collect();
        for (stack, (_, thread)) in stacks.iter().zip(&records) {
            roots.add_words(stack.live());
            roots.add_words(&[thread.exception_word()]);
        }
        let out = f(roots);
        drop(stacks);
        out
    }
}

/// A logical thread of execution: evaluation stack, frames, the current
/// interpreter position and the pending exception.
pub struct ExecThread {
    process: Arc<Process>,
    id: u64,
    roots: Arc<ThreadRoots>,
    pub(crate) frames: FrameStack,
    pub(crate) pc: Pc,
    pub(crate) method: Option<MethodId>,
    pub(crate) frame_base: usize,
    exception: Option<PendingException>,
    is_finalizer: bool,
}

impl ExecThread {
    pub(crate) fn new(process: Arc<Process>, is_finalizer: bool) -> Self {
        let config = process.config();
        let roots = Arc::new(ThreadRoots::new(config.stack_words));
        let frames = FrameStack::new(config.initial_frames, config.max_frames);
        let id = process.threads().register_thread(is_finalizer, roots.clone());
        vm_msg!(process, "engine thread {id} attached (finalizer: {is_finalizer})");
        Self {
            process,
            id,
            roots,
            frames,
            pc: INVALID_PC,
            method: None,
            frame_base: 0,
            exception: None,
            is_finalizer,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    pub fn is_finalizer(&self) -> bool {
        self.is_finalizer
    }

    /// Binds the calling native thread to this engine thread.
    pub fn bind(&self) -> ContextGuard {
        ContextGuard::enter(self.id)
    }

    /// Locks the evaluation stack. A collection on another thread waits while
    /// the guard is held, so drop it before allocating or calling out.
    pub fn stack(&self) -> MutexGuard<'_, EvaluationStack> {
        self.roots.stack()
    }

    pub fn frames(&self) -> &FrameStack {
        &self.frames
    }

    pub fn pc(&self) -> Pc {
        self.pc
    }

    pub fn current_method(&self) -> Option<MethodId> {
        self.method
    }

    pub fn frame_base(&self) -> usize {
        self.frame_base
    }

    pub fn exception(&self) -> Option<&PendingException> {
        self.exception.as_ref()
    }

    pub fn has_exception(&self) -> bool {
        self.exception.is_some()
    }

    pub fn take_exception(&mut self) -> Option<PendingException> {
        self.roots.publish_exception(None);
        self.exception.take()
    }

    pub fn clear_exception(&mut self) {
        self.roots.publish_exception(None);
        self.exception = None;
    }

    pub(crate) fn restore_exception(&mut self, exception: Option<PendingException>) {
        self.roots
            .publish_exception(exception.as_ref().and_then(|e| e.object));
        self.exception = exception;
    }

    fn location(&self) -> String {
        self.method
            .map_or_else(|| "<host>".to_string(), |m| self.process.catalog().method_name(m))
    }

    fn set_exception(&mut self, exception: PendingException) -> Thrown {
        vm_trace_exception!(self, &exception.to_string(), &self.location());
        self.roots.publish_exception(exception.object);
        self.exception = Some(exception);
        Thrown
    }

    /// Sets a `System.<Kind>` exception on the thread. The instance is created
    /// without running a constructor; if even that fails only the kind is kept.
    pub fn raise(&mut self, kind: ExceptionKind, message: Option<String>) -> Thrown {
        let object = kind
            .class_name()
            .and_then(|name| self.process.catalog().find_class("System", name))
            .and_then(|class| self.process.allocate_object(class).ok());
        self.set_exception(PendingException {
            kind,
            object,
            message,
        })
    }

    /// Managed `throw`: sets `object` as the pending exception.
    pub fn throw_object(&mut self, object: Option<ObjectRef>) -> Thrown {
        let Some(object) = object else {
            return self.raise(ExceptionKind::NullReference, None);
        };
        let kind = self
            .process
            .class_of(object)
            .map(|class| {
                let info = self.process.catalog().class(class);
                ExceptionKind::from_class_name(&info.namespace, &info.name)
            })
            .unwrap_or(ExceptionKind::Managed);
        self.set_exception(PendingException {
            kind,
            object: Some(object),
            message: None,
        })
    }

    /// Turns an internal fault into exactly one pending exception.
    pub(crate) fn signal(&mut self, fault: Fault) -> Thrown {
        match fault.kind() {
            Some(kind) => self.raise(kind, fault.message()),
            None if self.exception.is_some() => Thrown,
            None => self.raise(
                ExceptionKind::ExecutionEngine,
                Some("exception flagged but not set".into()),
            ),
        }
    }

    pub fn tracer_enabled(&self) -> bool {
        self.process.tracer_enabled()
    }

    pub fn tracer(&self) -> &Tracer {
        self.process.tracer()
    }

    pub fn indent(&self) -> usize {
        self.frames.depth()
    }
}

impl Drop for ExecThread {
    fn drop(&mut self) {
        self.process.threads().unregister_thread(self.id);
    }
}

impl std::fmt::Debug for ExecThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecThread")
            .field("id", &self.id)
            .field("pc", &self.pc)
            .field("method", &self.method)
            .field("depth", &self.frames.depth())
            .field("exception", &self.exception)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_guard_restores_binding() {
        assert_eq!(current_thread_id(), None);
        {
            let _outer = ContextGuard::enter(3);
            {
                let _inner = ContextGuard::enter(9);
                assert_eq!(current_thread_id(), Some(9));
            }
            assert_eq!(current_thread_id(), Some(3));
        }
        assert_eq!(current_thread_id(), None);
    }

    #[test]
    fn test_thread_ids_start_at_one() {
        let manager = ThreadManager::new();
        let a = manager.register_thread(false, Arc::new(ThreadRoots::new(4)));
        let b = manager.register_thread(true, Arc::new(ThreadRoots::new(4)));
        assert_eq!(a, 1);
        assert_eq!(manager.thread_count(), 2);
        assert_eq!(manager.finalizer_threads(), 1);
        assert_eq!(manager.native_id(b), Some(std::thread::current().id()));
        manager.unregister_thread(a);
        assert_eq!(manager.thread_count(), 1);
    }

    #[test]
    fn test_stopped_stacks_cover_every_thread() {
        let manager = ThreadManager::new();
        let first = Arc::new(ThreadRoots::new(4));
        let second = Arc::new(ThreadRoots::new(4));
        manager.register_thread(false, first.clone());
        manager.register_thread(false, second.clone());
        first.stack().push_words(&[11, 12]).unwrap();
        second.stack().push_words(&[21]).unwrap();
        second.publish_exception(ObjectRef::from_word(99));

        let mut roots = RootSet::new();
        let seen = manager.with_stopped_stacks(&mut roots, |roots| {
            // Held for the whole callback.
            assert!(first.stack.try_lock().is_none());
            roots.words.clone()
        });
        for word in [11, 12, 21, 99] {
            assert!(seen.contains(&word), "{word}");
        }
        assert!(first.stack.try_lock().is_some());
    }
}
