//! Virtual and interface method resolution.
use crate::{
    error::Fault,
    types::{ClassId, MethodId, ABSTRACT_SLOT},
    value::ObjectRef,
    vm::Process,
};

impl Process {
    /// The implementation of `method` that a call on `this` reaches.
    pub fn resolve_virtual(
        &self,
        method: MethodId,
        this: Option<ObjectRef>,
    ) -> Result<MethodId, Fault> {
        let this = this.ok_or(Fault::NullReference)?;
        let info = self.catalog.method(method);
        if !info.is_virtual {
            return Ok(method);
        }
        let class = self.class_of(this)?;

        if let Some(hit) = self.dispatch.get(&(method, class)) {
            self.metrics.record_dispatch(true);
            return Ok(*hit);
        }
        self.metrics.record_dispatch(false);

        let resolved = if self.catalog.class(info.owner).is_interface() {
            self.resolve_interface(method, class)?
        } else {
            self.resolve_vtable(method, class)?
        };
        if self.catalog.method(resolved).is_abstract {
            return Err(self.missing(method, class));
        }
        self.dispatch.insert((method, class), resolved);
        Ok(resolved)
    }

    fn missing(&self, method: MethodId, class: ClassId) -> Fault {
        Fault::MissingMethod(format!(
            "{} on {}",
            self.catalog.method_name(method),
            self.catalog.class(class).full_name()
        ))
    }

    fn resolve_vtable(&self, method: MethodId, class: ClassId) -> Result<MethodId, Fault> {
        let info = self.catalog.method(method);
        if !self.catalog.inherits_from(class, info.owner) {
            return Err(self.missing(method, class));
        }
        info.slot
            .and_then(|slot| self.catalog.class(class).vtable.get(slot as usize))
            .copied()
            .ok_or_else(|| self.missing(method, class))
    }

    fn resolve_interface(&self, method: MethodId, class: ClassId) -> Result<MethodId, Fault> {
        let info = self.catalog.method(method);
        let interface = info.owner;
        if !self.catalog.implements(class, interface) {
            return Err(self.missing(method, class));
        }
        let Some(interface_slot) = info.slot else {
            return Err(self.missing(method, class));
        };

        // The table may belong to an ancestor; vtables only ever extend their
        // parent's, so its slot is valid in the runtime class too.
        let mut current = Some(class);
        while let Some(c) = current {
            if let Some(table) = self.catalog.impl_table(c, interface) {
                let slot = table
                    .get(interface_slot as usize)
                    .copied()
                    .unwrap_or(ABSTRACT_SLOT);
                if slot == ABSTRACT_SLOT {
                    tracing::warn!(
                        method = %self.catalog.method_name(method),
                        class = %self.catalog.class(class).full_name(),
                        "interface method left abstract on a concrete class"
                    );
                    return Err(self.missing(method, class));
                }
                return self
                    .catalog
                    .class(class)
                    .vtable
                    .get(slot as usize)
                    .copied()
                    .ok_or_else(|| self.missing(method, class));
            }
            current = self.catalog.parent(c);
        }
        Err(self.missing(method, class))
    }
}
