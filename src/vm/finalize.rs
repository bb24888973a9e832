//! The collector's finalizer callback.
//!
//! Every finalizable block is registered with its process's
//! [`FinalizationContext`]. When the collector hands the block back, the
//! callback runs the object's `Finalize` on the process finalizer thread, bound
//! to the calling native thread for the duration, and then releases whatever
//! monitor the object still holds.
use crate::{
    types::MethodId,
    value::{ExecValue, ObjectRef},
    vm::{
        config::LockMode,
        gc::{Block, FinalizerData},
        monitor::reclaim_header_monitor,
        sync::SyncBlockManager,
        thread::ContextGuard,
        unpack::ResultSlot,
        ExecThread, Process,
    },
};
use parking_lot::RwLock;
use std::sync::{Arc, Weak};

/// Shared by every finalizer registration of one process. The back reference
/// is cleared when the process is destroyed; blocks finalized after that are
/// orphans.
#[derive(Debug)]
pub struct FinalizationContext {
    process: RwLock<Weak<Process>>,
    sync_blocks: Arc<SyncBlockManager>,
    lock_mode: LockMode,
}

impl FinalizationContext {
    pub fn new(process: Weak<Process>, sync_blocks: Arc<SyncBlockManager>, lock_mode: LockMode) -> Self {
        Self {
            process: RwLock::new(process),
            sync_blocks,
            lock_mode,
        }
    }

    pub fn process(&self) -> Option<Arc<Process>> {
        self.process.read().upgrade()
    }

    pub fn detach(&self) {
        *self.process.write() = Weak::new();
    }

    pub fn is_detached(&self) -> bool {
        self.process().is_none()
    }

    fn reclaim_orphan_monitor(&self, block: &Block) {
        if self.lock_mode == LockMode::Header {
            reclaim_header_monitor(&self.sync_blocks, block);
        }
    }
}

pub fn finalize_block(block: &Arc<Block>, data: &FinalizerData) {
    let Some(context) = data.downcast_ref::<FinalizationContext>() else {
        tracing::warn!(block = ?block.id(), "finalizer registered without a finalization context");
        return;
    };
    match context.process() {
        Some(process) => process.run_finalizer(block),
        None => {
            tracing::warn!(object = ?block.object(), "owning process is gone, skipping finalizer");
            context.reclaim_orphan_monitor(block);
        }
    }
}

impl Process {
    /// Runs `Finalize` for the object in `block` on the finalizer thread.
    pub(crate) fn run_finalizer(self: &Arc<Self>, block: &Arc<Block>) {
        let object = block.object();
        let class = block.header().class();
        let finalize = class
            .filter(|c| self.catalog.layout(*c).is_some_and(|l| l.has_finalizer))
            .and_then(|c| self.catalog.find_finalizer(c));

        // Creating the thread under this lock keeps it unique per process.
        let mut slot = self.finalizer_thread.lock();
        let thread = slot.get_or_insert_with(|| ExecThread::new(self.clone(), true));
        let _context = ContextGuard::enter(thread.id());

        if let Some(method) = finalize {
            let type_name = class.map_or_else(String::new, |c| self.catalog.class(c).full_name());
            self.collector.register_finalizer(block.id(), None);
            vm_trace_finalizer!(thread, &type_name, "running");
            run_one(thread, method, object, &type_name);
            self.metrics.record_finalizer_run();
        }

        self.reclaim_monitor(block);
    }
}

fn run_one(thread: &mut ExecThread, method: MethodId, object: ObjectRef, type_name: &str) {
    let args = [ExecValue::Object(Some(object))];
    if thread.call_v(method, ResultSlot::Discard, &args).is_err() {
        let exception = thread.take_exception();
        tracing::warn!(
            class = type_name,
            exception = ?exception.map(|e| e.to_string()),
            "finalizer threw, exception discarded"
        );
        vm_trace_finalizer!(thread, type_name, "threw");
    } else {
        vm_trace_finalizer!(thread, type_name, "done");
    }
}
