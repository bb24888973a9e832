//! The execution process: everything engine threads share.
use crate::{
    error::{EngineError, Fault},
    types::{Catalog, ClassId, MethodId},
    value::ObjectRef,
    vm::{
        config::{CallingConvention, EngineConfig},
        finalize::FinalizationContext,
        gc::{CollectStats, Collector, MarkSweepCollector, RootSet},
        gchandle::GCHandleTable,
        metrics::RuntimeMetrics,
        monitor::MonitorTable,
        signature::ClassifiedSignature,
        sync::SyncBlockManager,
        thread::{ExecThread, ThreadManager},
        tracer::Tracer,
        Interpreter, NativeBackend,
    },
};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::{
    sync::{Arc, OnceLock},
    time::Instant,
};

/// The downstream executor, fixed by the calling convention.
#[derive(Clone)]
pub enum Executor {
    Interpreter(Arc<dyn Interpreter>),
    Native(Arc<dyn NativeBackend>),
}

impl Executor {
    pub fn convention(&self) -> CallingConvention {
        match self {
            Executor::Interpreter(_) => CallingConvention::Interpreter,
            Executor::Native(_) => CallingConvention::Native,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Unloading,
    RunningFinalizers,
    Unloaded,
}

pub struct Process {
    pub(crate) catalog: Arc<Catalog>,
    pub(crate) collector: Arc<dyn Collector>,
    pub(crate) executor: Executor,
    pub(crate) config: EngineConfig,
    /// Serializes static layout.
    pub(crate) metadata_lock: RwLock<()>,
    pub(crate) finalization: Arc<FinalizationContext>,
    pub(crate) finalizer_thread: Mutex<Option<ExecThread>>,
    pub(crate) gc_handles: OnceLock<GCHandleTable>,
    pub(crate) monitor_table: OnceLock<MonitorTable>,
    pub(crate) sync_blocks: Arc<SyncBlockManager>,
    pub(crate) threads: ThreadManager,
    pub(crate) signatures: DashMap<MethodId, Arc<ClassifiedSignature>>,
    pub(crate) dispatch: DashMap<(MethodId, ClassId), MethodId>,
    pub(crate) metrics: RuntimeMetrics,
    tracer: Tracer,
    state: Mutex<ProcessState>,
}

impl Process {
    /// A process over the bundled mark/sweep collector.
    pub fn new(
        catalog: Catalog,
        executor: Executor,
        config: EngineConfig,
    ) -> Result<Arc<Self>, EngineError> {
        Self::with_collector(catalog, Arc::new(MarkSweepCollector::new()), executor, config)
    }

    pub fn with_collector(
        catalog: Catalog,
        collector: Arc<dyn Collector>,
        executor: Executor,
        config: EngineConfig,
    ) -> Result<Arc<Self>, EngineError> {
        Self::with_tracer(catalog, collector, executor, config, Tracer::new())
    }

    pub fn with_tracer(
        catalog: Catalog,
        collector: Arc<dyn Collector>,
        executor: Executor,
        config: EngineConfig,
        tracer: Tracer,
    ) -> Result<Arc<Self>, EngineError> {
        config.validate()?;
        if catalog.object_class().is_none() {
            return Err(EngineError::MissingBootstrapClass("System.Object".into()));
        }
        if executor.convention() != config.convention {
            return Err(EngineError::Config(format!(
                "{:?} executor configured for the {:?} calling convention",
                executor.convention(),
                config.convention
            )));
        }

        let sync_blocks = Arc::new(SyncBlockManager::new());
        let process = Arc::new_cyclic(|weak| Process {
            catalog: Arc::new(catalog),
            collector,
            executor,
            finalization: Arc::new(FinalizationContext::new(
                weak.clone(),
                sync_blocks.clone(),
                config.lock_mode,
            )),
            config,
            metadata_lock: RwLock::new(()),
            finalizer_thread: Mutex::new(None),
            gc_handles: OnceLock::new(),
            monitor_table: OnceLock::new(),
            sync_blocks,
            threads: ThreadManager::new(),
            signatures: DashMap::new(),
            dispatch: DashMap::new(),
            metrics: RuntimeMetrics::new(),
            tracer,
            state: Mutex::new(ProcessState::Running),
        });
        tracing::debug!(
            convention = ?process.config.convention,
            lock_mode = ?process.config.lock_mode,
            "process created"
        );
        Ok(process)
    }

    /// A new engine thread. The calling native thread is not bound to it; use
    /// [`ExecThread::bind`] for that.
    pub fn attach_thread(self: &Arc<Self>) -> ExecThread {
        ExecThread::new(self.clone(), false)
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn collector(&self) -> &Arc<dyn Collector> {
        &self.collector
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &RuntimeMetrics {
        &self.metrics
    }

    pub fn threads(&self) -> &ThreadManager {
        &self.threads
    }

    pub fn sync_blocks(&self) -> &SyncBlockManager {
        &self.sync_blocks
    }

    pub fn finalization(&self) -> &Arc<FinalizationContext> {
        &self.finalization
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock()
    }

    pub fn gc_handles(&self) -> &GCHandleTable {
        self.gc_handles.get_or_init(GCHandleTable::new)
    }

    pub fn has_finalizer_thread(&self) -> bool {
        self.finalizer_thread.lock().is_some()
    }

    /// Classified signature of `method`, computed on first use.
    pub fn signature(&self, method: MethodId) -> Result<Arc<ClassifiedSignature>, Fault> {
        if let Some(sig) = self.signatures.get(&method) {
            return Ok(sig.clone());
        }
        let sig = Arc::new(ClassifiedSignature::classify(
            &self.catalog,
            &self.catalog.method(method).signature,
        )?);
        self.signatures.insert(method, sig.clone());
        Ok(sig)
    }

    /// Class written into the object's header.
    pub fn class_of(&self, object: ObjectRef) -> Result<ClassId, Fault> {
        let block = self
            .collector
            .block(object.block())
            .ok_or(Fault::NullReference)?;
        block
            .header()
            .class()
            .ok_or_else(|| Fault::InvalidProgram(format!("{object:?} has no class")))
    }

    /// Collects from `roots` plus every strong GC handle and the stack and
    /// pending exception of every attached engine thread. Finalizers found
    /// unreachable are queued, not run.
    ///
    /// Every thread's stack is locked for the duration, so the caller must not
    /// hold its own stack guard.
    pub fn collect(&self, roots: &RootSet) -> CollectStats {
        let mut roots = roots.clone();
        if let Some(handles) = self.gc_handles.get() {
            handles.strong_roots(&mut roots);
        }
        let started = Instant::now();
        let stats = self
            .threads
            .with_stopped_stacks(&mut roots, |roots| self.collector.collect(roots));
        self.metrics.record_gc_pause(started.elapsed());
        vm_trace_gc!(
            self,
            "collect",
            "marked {} queued {} freed {} ({} bytes)",
            stats.marked,
            stats.queued,
            stats.freed,
            stats.freed_bytes
        );
        stats
    }

    /// Runs queued finalizers on the calling native thread.
    pub fn run_pending_finalizers(&self) -> usize {
        self.collector.run_finalizers()
    }

    /// Like [`Process::run_pending_finalizers`], but when another native
    /// thread is already draining the queue, waits until it is empty instead
    /// of returning at once.
    pub fn wait_for_pending_finalizers(&self) -> usize {
        self.collector.wait_for_finalizers()
    }

    /// Tears the process down: runs what is already queued, orphans every
    /// later finalization, releases the handle and monitor tables and drops
    /// the finalizer thread. Calling it again does nothing.
    pub fn destroy(&self) {
        {
            let mut state = self.state.lock();
            if *state != ProcessState::Running {
                return;
            }
            *state = ProcessState::Unloading;
        }

        *self.state.lock() = ProcessState::RunningFinalizers;
        let ran = self.collector.wait_for_finalizers();
        self.finalization.detach();

        if let Some(handles) = self.gc_handles.get() {
            handles.teardown(self.collector.as_ref());
        }
        if let Some(table) = self.monitor_table.get() {
            table.teardown(self.collector.as_ref());
        }
        let finalizer_thread = self.finalizer_thread.lock().take();
        drop(finalizer_thread);
        if self.tracer.is_enabled() {
            self.tracer.dump_gc_stats(
                self.collector.heap_size(),
                self.collector.pending_finalizers(),
                self.gc_handles.get().map_or(0, GCHandleTable::count),
            );
            self.tracer.flush();
        }

        *self.state.lock() = ProcessState::Unloaded;
        tracing::debug!(finalizers_run = ran, "process destroyed");
    }

    pub fn tracer_enabled(&self) -> bool {
        self.tracer.is_enabled()
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn indent(&self) -> usize {
        0
    }
}
