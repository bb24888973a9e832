use super::{Catalog, ClassId, ClassKind, ElementType, Type};
use crate::{error::LayoutError, value::WORD_SIZE};
use std::sync::Arc;

/// Precise scanning descriptor: one bit per machine word of the instance,
/// set when that word holds an object reference.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GcDescriptor {
    words: usize,
    bitmap: Vec<u64>,
}

impl GcDescriptor {
    pub fn new(words: usize) -> Self {
        Self {
            words,
            bitmap: vec![0; words.div_ceil(64)],
        }
    }

    pub fn mark(&mut self, word: usize) {
        if word < self.words {
            self.bitmap[word / 64] |= 1 << (word % 64);
        }
    }

    pub fn is_reference(&self, word: usize) -> bool {
        word < self.words && self.bitmap[word / 64] & (1 << (word % 64)) != 0
    }

    pub fn words(&self) -> usize {
        self.words
    }

    pub fn references(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.words).filter(|w| self.is_reference(*w))
    }

    pub fn is_empty(&self) -> bool {
        self.bitmap.iter().all(|b| *b == 0)
    }
}

#[derive(Debug, Clone)]
pub struct ClassLayout {
    /// Bytes of user-visible instance memory (header excluded).
    pub instance_size: usize,
    pub alignment: usize,
    /// Offset of every declared instance field, `None` for statics.
    pub field_offsets: Vec<Option<usize>>,
    pub descriptor: Arc<GcDescriptor>,
    pub has_references: bool,
    /// Some class below the root overrides `Finalize`.
    pub has_finalizer: bool,
}

fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

impl Catalog {
    /// Unlocked fast check used before taking the metadata lock.
    pub fn is_laid_out(&self, class: ClassId) -> bool {
        self.class(class).layout.get().is_some()
    }

    pub fn layout(&self, class: ClassId) -> Option<&ClassLayout> {
        self.class(class).layout.get()
    }

    /// Completes the static layout of `class` and its ancestors. Callers
    /// serialize this behind the process metadata lock.
    pub fn layout_class(&self, class: ClassId) -> Result<&ClassLayout, LayoutError> {
        if let Some(layout) = self.layout(class) {
            return Ok(layout);
        }
        let computed = self.compute_layout(class, &mut Vec::new())?;
        let info = self.class(class);
        let _ = info.layout.set(computed);
        info.layout
            .get()
            .ok_or_else(|| LayoutError::Incomplete(info.full_name()))
    }

    /// Byte size of a value of `ty` when stored inline.
    pub fn size_of(&self, ty: &Type) -> Result<usize, LayoutError> {
        match ty {
            Type::Void => Ok(0),
            Type::Primitive(e) => Ok(e.size()),
            Type::ValueType(c) => match self.class(*c).kind {
                ClassKind::Enum(underlying) => Ok(underlying.size()),
                _ => match self.layout(*c) {
                    Some(layout) => Ok(layout.instance_size),
                    None => Ok(self.compute_layout(*c, &mut Vec::new())?.instance_size),
                },
            },
            Type::Class(_)
            | Type::ByRef(_)
            | Type::Pointer(_)
            | Type::Array(_)
            | Type::Generic(_) => Ok(WORD_SIZE),
        }
    }

    fn compute_layout(
        &self,
        class: ClassId,
        visiting: &mut Vec<ClassId>,
    ) -> Result<ClassLayout, LayoutError> {
        if let Some(layout) = self.layout(class) {
            return Ok(layout.clone());
        }
        let info = self.class(class);
        if visiting.contains(&class) {
            return Err(LayoutError::RecursiveValueType(info.full_name()));
        }
        visiting.push(class);

        let is_value = info.is_value_type();
        let (mut offset, mut alignment, mut refs) = match (is_value, info.parent) {
            (false, Some(parent)) => {
                let parent_layout = self
                    .compute_layout(parent, visiting)
                    .map_err(|e| LayoutError::ParentFailed(info.full_name(), Box::new(e)))?;
                let refs: Vec<usize> = parent_layout.descriptor.references().collect();
                (parent_layout.instance_size, parent_layout.alignment, refs)
            }
            _ => (0, 1, Vec::new()),
        };

        let mut field_offsets = Vec::with_capacity(info.fields.len());
        for field in &info.fields {
            if field.is_static {
                field_offsets.push(None);
                continue;
            }
            let (size, align, field_refs) = self.field_shape(&field.ty, visiting)?;
            offset = align_up(offset, align);
            alignment = alignment.max(align);
            for word in field_refs {
                refs.push(offset / WORD_SIZE + word);
            }
            field_offsets.push(Some(offset));
            offset += size;
        }
        visiting.pop();

        let instance_size = if is_value {
            align_up(offset.max(1), alignment)
        } else {
            align_up(offset, WORD_SIZE)
        };
        let mut descriptor = GcDescriptor::new(instance_size.div_ceil(WORD_SIZE));
        for word in &refs {
            descriptor.mark(*word);
        }
        let has_finalizer = self
            .find_finalizer(class)
            .is_some_and(|m| self.class(self.method(m).owner).parent.is_some());

        Ok(ClassLayout {
            instance_size,
            alignment,
            field_offsets,
            has_references: !refs.is_empty(),
            descriptor: Arc::new(descriptor),
            has_finalizer,
        })
    }

    /// Size, alignment and reference words of an inline field.
    fn field_shape(
        &self,
        ty: &Type,
        visiting: &mut Vec<ClassId>,
    ) -> Result<(usize, usize, Vec<usize>), LayoutError> {
        Ok(match ty {
            Type::Void => (0, 1, Vec::new()),
            Type::Primitive(ElementType::TypedByRef) => (
                ElementType::TypedByRef.size(),
                WORD_SIZE,
                Vec::new(),
            ),
            Type::Primitive(e) => (e.size(), e.size().min(WORD_SIZE), Vec::new()),
            Type::ValueType(c) => {
                if let ClassKind::Enum(underlying) = self.class(*c).kind {
                    (underlying.size(), underlying.size().min(WORD_SIZE), Vec::new())
                } else {
                    let layout = self.compute_layout(*c, visiting)?;
                    let refs = layout.descriptor.references().collect();
                    (layout.instance_size, layout.alignment, refs)
                }
            }
            Type::Class(_) | Type::Array(_) | Type::Generic(_) => (WORD_SIZE, WORD_SIZE, vec![0]),
            Type::ByRef(_) | Type::Pointer(_) => (WORD_SIZE, WORD_SIZE, Vec::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CatalogBuilder, MethodDef, MethodSignature};

    #[test]
    fn test_reference_fields_are_described() {
        let mut b = CatalogBuilder::new();
        let object = b.object_class().unwrap();
        let node = b.define_class("Demo", "Node", Some(object));
        b.add_field(node, "value", Type::i4());
        b.add_field(node, "next", Type::Class(node));
        let catalog = b.build().unwrap();

        let layout = catalog.layout_class(node).unwrap();
        assert!(layout.has_references);
        assert_eq!(layout.field_offsets, vec![Some(0), Some(WORD_SIZE)]);
        assert!(layout.descriptor.is_reference(1));
        assert!(!layout.descriptor.is_reference(0));
        assert_eq!(layout.instance_size, 2 * WORD_SIZE);
    }

    #[test]
    fn test_value_type_size_and_atomic_class() {
        let mut b = CatalogBuilder::new();
        let object = b.object_class().unwrap();
        let pair = b.define_value_type("Demo", "Pair");
        b.add_field(pair, "a", Type::Primitive(ElementType::I2));
        b.add_field(pair, "b", Type::i8());
        let holder = b.define_class("Demo", "Holder", Some(object));
        b.add_field(holder, "p", Type::ValueType(pair));
        let catalog = b.build().unwrap();

        assert_eq!(catalog.size_of(&Type::ValueType(pair)).unwrap(), 16);
        let layout = catalog.layout_class(holder).unwrap();
        assert!(!layout.has_references);
        assert_eq!(layout.instance_size, 16);
    }

    #[test]
    fn test_recursive_value_type_fails() {
        let mut b = CatalogBuilder::new();
        let bad = b.define_value_type("Demo", "Loop");
        b.add_field(bad, "inner", Type::ValueType(bad));
        let catalog = b.build().unwrap();

        assert!(matches!(
            catalog.layout_class(bad),
            Err(LayoutError::RecursiveValueType(_))
        ));
        assert!(!catalog.is_laid_out(bad));
    }

    #[test]
    fn test_finalizer_flag_ignores_root() {
        let mut b = CatalogBuilder::new();
        let object = b.object_class().unwrap();
        let plain = b.define_class("Demo", "Plain", Some(object));
        let fin = b.define_class("Demo", "WithFinalizer", Some(object));
        b.add_method(
            fin,
            MethodDef::new("Finalize", MethodSignature::instance(vec![], Type::Void)).virtual_(),
        );
        let derived = b.define_class("Demo", "Derived", Some(fin));
        let catalog = b.build().unwrap();

        assert!(!catalog.layout_class(plain).unwrap().has_finalizer);
        assert!(catalog.layout_class(fin).unwrap().has_finalizer);
        assert!(catalog.layout_class(derived).unwrap().has_finalizer);
    }
}
