//! Internalcalls of `System.GC`, `System.Runtime.InteropServices.GCHandle`
//! and `System.Threading.Monitor`.
//!
//! Each one runs on the calling engine thread. Failures become a pending
//! exception on that thread and come back as [`Thrown`].
use crate::{
    error::{Fault, Thrown},
    value::ObjectRef,
    vm::{common::GCHandleType, gc::RootSet, ExecThread},
};
use std::time::Duration;

impl ExecThread {
    /// `GC.Collect`: a full collection over every attached thread's stack,
    /// then the finalizers it queued.
    pub fn collect(&mut self) -> usize {
        let process = self.process().clone();
        let stats = process.collect(&RootSet::new());
        let ran = process.run_pending_finalizers();
        vm_debug!(self, "collect: freed {} blocks, {ran} finalizers", stats.freed);
        ran
    }

    /// `GC.KeepAlive`: only has to keep `object` observable up to this point.
    pub fn keep_alive(&self, object: Option<ObjectRef>) {
        std::hint::black_box(object);
    }

    /// `GC._SuppressFinalize`
    pub fn suppress_finalize(&mut self, object: Option<ObjectRef>) -> Result<(), Thrown> {
        let Some(object) = object else {
            return Err(self.signal(Fault::NullReference));
        };
        self.process()
            .collector()
            .register_finalizer(object.block(), None);
        Ok(())
    }

    /// `GC._ReRegisterForFinalize`. Objects whose class has no `Finalize`
    /// stay unregistered.
    pub fn reregister_for_finalize(&mut self, object: Option<ObjectRef>) -> Result<(), Thrown> {
        let Some(object) = object else {
            return Err(self.signal(Fault::NullReference));
        };
        let process = self.process().clone();
        let class = match process.class_of(object) {
            Ok(class) => class,
            Err(fault) => return Err(self.signal(fault)),
        };
        let finalizable = process
            .catalog()
            .layout(class)
            .is_some_and(|layout| layout.has_finalizer);
        if finalizable {
            process
                .collector()
                .register_finalizer(object.block(), Some(process.finalizer()));
        }
        Ok(())
    }

    /// `GC._WaitForPendingFinalizers`: drains the queue on this native thread,
    /// or blocks until the thread already draining it is done.
    pub fn wait_for_pending_finalizers(&mut self) -> usize {
        self.process().wait_for_pending_finalizers()
    }

    /// `GC.GetTotalMemory`
    pub fn get_total_memory(&mut self, force_full_collection: bool) -> usize {
        if force_full_collection {
            self.collect();
        }
        self.process().collector().heap_size()
    }

    /// `GCHandle.InternalAlloc`. `kind` is the raw `GCHandleType` value.
    pub fn handle_alloc(&mut self, object: Option<ObjectRef>, kind: i32) -> Result<usize, Thrown> {
        let process = self.process().clone();
        let result = GCHandleType::try_from(kind).and_then(|kind| {
            process
                .gc_handles()
                .alloc(process.collector().as_ref(), object, kind)
        });
        match result {
            Ok(handle) => {
                vm_trace_gc_handle!(self, "alloc", handle, "{object:?}");
                Ok(handle)
            }
            Err(fault) => Err(self.signal(fault)),
        }
    }

    /// `GCHandle.InternalFree`. Freeing a stale handle is ignored.
    pub fn handle_free(&mut self, handle: usize) {
        let process = self.process().clone();
        let freed = process
            .gc_handles()
            .free(process.collector().as_ref(), handle);
        vm_trace_gc_handle!(self, "free", handle, "freed={freed}");
    }

    /// `GCHandle.InternalGet`
    pub fn handle_get(&self, handle: usize) -> Option<ObjectRef> {
        let process = self.process();
        process
            .gc_handles()
            .get(process.collector().as_ref(), handle)
    }

    /// `GCHandle.InternalSet`
    pub fn handle_set(&mut self, handle: usize, object: Option<ObjectRef>) -> Result<(), Thrown> {
        let process = self.process().clone();
        if !process
            .gc_handles()
            .set(process.collector().as_ref(), handle, object)
        {
            return Err(self.signal(Fault::InvalidProgram(format!(
                "GC handle {handle:#x} is not allocated"
            ))));
        }
        vm_trace_gc_handle!(self, "set", handle, "{object:?}");
        Ok(())
    }

    /// `GCHandle.InternalCheckDomain`: a bounds check only.
    pub fn handle_is_valid(&self, handle: usize) -> bool {
        self.process().gc_handles().validate(handle)
    }

    /// `Monitor.Enter`
    pub fn monitor_enter(&mut self, object: Option<ObjectRef>) -> Result<(), Thrown> {
        let result = self.process().monitor_enter(self.id(), object);
        result.map_err(|f| self.signal(f))
    }

    /// `Monitor.TryEnter`. A negative timeout waits forever.
    pub fn monitor_try_enter(
        &mut self,
        object: Option<ObjectRef>,
        timeout_ms: i32,
    ) -> Result<bool, Thrown> {
        let result = match u64::try_from(timeout_ms) {
            Ok(ms) => self
                .process()
                .monitor_try_enter(self.id(), object, Duration::from_millis(ms)),
            Err(_) => self
                .process()
                .monitor_enter(self.id(), object)
                .map(|()| true),
        };
        result.map_err(|f| self.signal(f))
    }

    /// `Monitor.Exit`. Exiting a monitor the thread does not hold raises
    /// `SynchronizationLockException` in managed code; here it is reported as
    /// `Ok(false)`.
    pub fn monitor_exit(&mut self, object: Option<ObjectRef>) -> Result<bool, Thrown> {
        let result = self.process().monitor_exit(self.id(), object);
        result.map_err(|f| self.signal(f))
    }
}
