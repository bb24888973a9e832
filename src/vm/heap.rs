//! Object allocation: layout check, header class, finalizer registration.
use crate::{
    error::{Fault, Thrown},
    types::{ClassId, ClassLayout},
    value::{ObjectRef, Word},
    vm::{
        config::LockMode,
        finalize::finalize_block,
        gc::{AllocKind, Finalizer, FinalizerData},
        ExecThread, Process,
    },
};
use std::sync::Arc;

impl Process {
    /// Completes static layout of `class`. The unlocked check is the common
    /// path; only a miss takes the metadata write lock and checks again.
    pub fn ensure_layout(&self, class: ClassId) -> Result<&ClassLayout, Fault> {
        if let Some(layout) = self.catalog.layout(class) {
            return Ok(layout);
        }
        let _metadata = self.metadata_lock.write();
        if let Some(layout) = self.catalog.layout(class) {
            return Ok(layout);
        }
        self.metrics.record_layout_full_path();
        self.catalog.layout_class(class).map_err(|e| {
            Fault::TypeInitialization(format!("{}: {e}", self.catalog.class(class).full_name()))
        })
    }

    pub(crate) fn finalizer(&self) -> Finalizer {
        Finalizer {
            callback: finalize_block,
            data: self.finalization.clone() as FinalizerData,
        }
    }

    /// Allocates `size` bytes behind a header. Without a class the block is
    /// raw memory and never finalized.
    pub fn allocate(
        &self,
        class: Option<ClassId>,
        size: usize,
        kind: AllocKind,
    ) -> Result<ObjectRef, Fault> {
        let Some(class) = class else {
            return self
                .collector
                .alloc(size, kind)
                .map(|block| block.object())
                .ok_or(Fault::OutOfMemory);
        };

        let layout = self.ensure_layout(class)?;
        let kind = match kind {
            AllocKind::Typed(_) if self.config.lock_mode == LockMode::Thin => {
                tracing::debug!(
                    class = %self.catalog.class(class).full_name(),
                    "typed allocation is unavailable with thin locks, scanning conservatively"
                );
                AllocKind::Plain
            }
            kind => kind,
        };

        let block = self.collector.alloc(size, kind).ok_or(Fault::OutOfMemory)?;
        block.header().set_class(class);
        if layout.has_finalizer {
            self.collector
                .register_finalizer(block.id(), Some(self.finalizer()));
        }
        vm_trace_gc!(
            self,
            "alloc",
            "{} ({size} bytes) -> {:?}",
            self.catalog.class(class).full_name(),
            block.object()
        );
        Ok(block.object())
    }

    /// An instance of `class` at its laid-out size, scanned only when the
    /// class has reference fields.
    pub fn allocate_object(&self, class: ClassId) -> Result<ObjectRef, Fault> {
        let layout = self.ensure_layout(class)?;
        let kind = if layout.has_references {
            AllocKind::Plain
        } else {
            AllocKind::Atomic
        };
        self.allocate(Some(class), layout.instance_size, kind)
    }

    pub fn allocate_typed(&self, class: ClassId, size: usize) -> Result<ObjectRef, Fault> {
        let descriptor = Arc::clone(&self.ensure_layout(class)?.descriptor);
        self.allocate(Some(class), size, AllocKind::Typed(descriptor))
    }

    /// Byte offset of the instance field `name`, declared on `class` or an
    /// ancestor.
    pub fn field_offset(&self, class: ClassId, name: &str) -> Result<usize, Fault> {
        let mut current = Some(class);
        while let Some(c) = current {
            let info = self.catalog.class(c);
            if let Some(index) = info.fields.iter().position(|f| f.name == name) {
                return self.ensure_layout(c)?.field_offsets[index].ok_or_else(|| {
                    Fault::InvalidProgram(format!("{}::{name} is static", info.full_name()))
                });
            }
            current = info.parent;
        }
        Err(Fault::MissingMethod(format!(
            "no field {name} on {}",
            self.catalog.class(class).full_name()
        )))
    }

    /// Reads a word-sized instance field.
    pub fn load_field(&self, object: ObjectRef, name: &str) -> Result<Word, Fault> {
        let offset = self.field_offset(self.class_of(object)?, name)?;
        let block = self.collector.block(object.block()).ok_or(Fault::NullReference)?;
        Ok(block.read_word(offset))
    }

    pub fn store_field(&self, object: ObjectRef, name: &str, word: Word) -> Result<(), Fault> {
        let offset = self.field_offset(self.class_of(object)?, name)?;
        let block = self.collector.block(object.block()).ok_or(Fault::NullReference)?;
        if block.write_word(offset, word) {
            Ok(())
        } else {
            Err(Fault::InvalidProgram(format!("field {name} is narrower than a word")))
        }
    }
}

impl ExecThread {
    pub fn alloc_plain(&mut self, class: Option<ClassId>, size: usize) -> Result<ObjectRef, Thrown> {
        let result = self.process().allocate(class, size, AllocKind::Plain);
        result.map_err(|f| self.signal(f))
    }

    /// Memory the collector never scans for references.
    pub fn alloc_atomic(&mut self, class: Option<ClassId>, size: usize) -> Result<ObjectRef, Thrown> {
        let result = self.process().allocate(class, size, AllocKind::Atomic);
        result.map_err(|f| self.signal(f))
    }

    pub fn alloc_typed(&mut self, class: ClassId, size: usize) -> Result<ObjectRef, Thrown> {
        let result = self.process().allocate_typed(class, size);
        result.map_err(|f| self.signal(f))
    }

    pub fn alloc_object(&mut self, class: ClassId) -> Result<ObjectRef, Thrown> {
        let result = self.process().allocate_object(class);
        result.map_err(|f| self.signal(f))
    }

    /// Like [`alloc_object`](Self::alloc_object) with an explicit size, for
    /// classes with trailing variable data.
    pub fn alloc_object_with_size(&mut self, class: ClassId, size: usize) -> Result<ObjectRef, Thrown> {
        let process = self.process().clone();
        let result = process.ensure_layout(class).and_then(|layout| {
            let kind = if layout.has_references {
                AllocKind::Plain
            } else {
                AllocKind::Atomic
            };
            process.allocate(Some(class), size, kind)
        });
        result.map_err(|f| self.signal(f))
    }
}
