use super::{ClassId, ClassLayout, ElementType, MethodId, MethodSignature, Type};
use crate::error::EngineError;
use std::{collections::HashMap, sync::OnceLock};

/// Interface table entry for a method the class leaves abstract.
pub const ABSTRACT_SLOT: u16 = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    Class,
    Interface,
    ValueType,
    Enum(ElementType),
    /// Synthetic types whose constructors allocate their own instances.
    Array,
    String,
}

#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub name: String,
    pub ty: Type,
    pub is_static: bool,
}

/// Maps each method of `interface` (by interface slot) to a vtable slot of the
/// implementing class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceImpl {
    pub interface: ClassId,
    pub slots: Vec<u16>,
}

#[derive(Debug)]
pub struct ClassInfo {
    pub id: ClassId,
    pub namespace: String,
    pub name: String,
    pub kind: ClassKind,
    pub parent: Option<ClassId>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodId>,
    /// Directly declared interfaces.
    pub interfaces: Vec<ClassId>,
    /// Implementation tables for every interface this class introduces,
    /// including the ones inherited through other interfaces.
    pub impls: Vec<InterfaceImpl>,
    pub vtable: Vec<MethodId>,
    pub(crate) layout: OnceLock<ClassLayout>,
}

impl ClassInfo {
    fn new(id: ClassId, namespace: &str, name: &str, kind: ClassKind, parent: Option<ClassId>) -> Self {
        Self {
            id,
            namespace: namespace.to_string(),
            name: name.to_string(),
            kind,
            parent,
            fields: Vec::new(),
            methods: Vec::new(),
            interfaces: Vec::new(),
            impls: Vec::new(),
            vtable: Vec::new(),
            layout: OnceLock::new(),
        }
    }

    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }

    pub fn is_interface(&self) -> bool {
        self.kind == ClassKind::Interface
    }

    pub fn is_value_type(&self) -> bool {
        matches!(self.kind, ClassKind::ValueType | ClassKind::Enum(_))
    }

    pub fn is_array_or_string(&self) -> bool {
        matches!(self.kind, ClassKind::Array | ClassKind::String)
    }
}

#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub id: MethodId,
    pub name: String,
    pub owner: ClassId,
    pub signature: MethodSignature,
    pub is_virtual: bool,
    pub is_abstract: bool,
    pub new_slot: bool,
    /// Vtable slot for class methods, interface slot for interface methods.
    pub slot: Option<u16>,
}

impl MethodInfo {
    pub fn is_static(&self) -> bool {
        !self.signature.has_this
    }

    pub fn is_ctor(&self) -> bool {
        self.name == ".ctor"
    }
}

/// Method declaration handed to [`CatalogBuilder::add_method`].
#[derive(Debug, Clone)]
pub struct MethodDef {
    name: String,
    signature: MethodSignature,
    is_virtual: bool,
    is_abstract: bool,
    new_slot: bool,
}

impl MethodDef {
    pub fn new(name: &str, signature: MethodSignature) -> Self {
        Self {
            name: name.to_string(),
            signature,
            is_virtual: false,
            is_abstract: false,
            new_slot: false,
        }
    }

    pub fn ctor(params: Vec<Type>) -> Self {
        Self::new(".ctor", MethodSignature::instance(params, Type::Void))
    }

    pub fn virtual_(mut self) -> Self {
        self.is_virtual = true;
        self
    }

    pub fn abstract_(mut self) -> Self {
        self.is_virtual = true;
        self.is_abstract = true;
        self
    }

    pub fn new_slot(mut self) -> Self {
        self.new_slot = true;
        self
    }
}

/// Assembles a [`Catalog`]: assigns vtable slots and builds the interface
/// implementation tables once every class is declared.
pub struct CatalogBuilder {
    classes: Vec<ClassInfo>,
    methods: Vec<MethodInfo>,
}

const SYSTEM_EXCEPTIONS: &[&str] = &[
    "NullReferenceException",
    "MissingMethodException",
    "StackOverflowException",
    "OutOfMemoryException",
    "TypeInitializationException",
    "TypeLoadException",
    "InvalidProgramException",
    "ExecutionEngineException",
];

impl CatalogBuilder {
    /// A builder with nothing in it, not even `System.Object`.
    pub fn empty() -> Self {
        Self {
            classes: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// A builder preloaded with the core library classes the engine relies on.
    pub fn new() -> Self {
        let mut b = Self::empty();
        let object = b.push_class("System", "Object", ClassKind::Class, None);
        b.add_method(object, MethodDef::ctor(vec![]));
        b.add_method(
            object,
            MethodDef::new("Finalize", MethodSignature::instance(vec![], Type::Void)).virtual_(),
        );
        b.push_class("System", "ValueType", ClassKind::Class, Some(object));
        b.push_class("System", "String", ClassKind::String, Some(object));
        b.push_class("System", "Array", ClassKind::Array, Some(object));
        let exception = b.push_class("System", "Exception", ClassKind::Class, Some(object));
        b.add_method(exception, MethodDef::ctor(vec![]));
        let system = b.push_class("System", "SystemException", ClassKind::Class, Some(exception));
        for name in SYSTEM_EXCEPTIONS {
            b.push_class("System", name, ClassKind::Class, Some(system));
        }
        b
    }

    fn push_class(
        &mut self,
        namespace: &str,
        name: &str,
        kind: ClassKind,
        parent: Option<ClassId>,
    ) -> ClassId {
        let id = ClassId(self.classes.len() as u32);
        self.classes
            .push(ClassInfo::new(id, namespace, name, kind, parent));
        id
    }

    pub fn find_class(&self, namespace: &str, name: &str) -> Option<ClassId> {
        self.classes
            .iter()
            .find(|c| c.namespace == namespace && c.name == name)
            .map(|c| c.id)
    }

    /// `System.Object`, absent on a builder created with [`CatalogBuilder::empty`].
    pub fn object_class(&self) -> Option<ClassId> {
        self.find_class("System", "Object")
    }

    pub fn define_class(&mut self, namespace: &str, name: &str, parent: Option<ClassId>) -> ClassId {
        self.push_class(namespace, name, ClassKind::Class, parent)
    }

    pub fn define_interface(&mut self, namespace: &str, name: &str) -> ClassId {
        self.push_class(namespace, name, ClassKind::Interface, None)
    }

    pub fn define_value_type(&mut self, namespace: &str, name: &str) -> ClassId {
        let parent = self.find_class("System", "ValueType");
        self.push_class(namespace, name, ClassKind::ValueType, parent)
    }

    pub fn define_enum(&mut self, namespace: &str, name: &str, underlying: ElementType) -> ClassId {
        let parent = self.find_class("System", "ValueType");
        self.push_class(namespace, name, ClassKind::Enum(underlying), parent)
    }

    pub fn add_field(&mut self, class: ClassId, name: &str, ty: Type) {
        self.classes[class.index()].fields.push(FieldInfo {
            name: name.to_string(),
            ty,
            is_static: false,
        });
    }

    pub fn add_static_field(&mut self, class: ClassId, name: &str, ty: Type) {
        self.classes[class.index()].fields.push(FieldInfo {
            name: name.to_string(),
            ty,
            is_static: true,
        });
    }

    pub fn add_interface(&mut self, class: ClassId, interface: ClassId) {
        self.classes[class.index()].interfaces.push(interface);
    }

    pub fn add_method(&mut self, class: ClassId, def: MethodDef) -> MethodId {
        let id = MethodId(self.methods.len() as u32);
        self.methods.push(MethodInfo {
            id,
            name: def.name,
            owner: class,
            signature: def.signature,
            is_virtual: def.is_virtual,
            is_abstract: def.is_abstract,
            new_slot: def.new_slot,
            slot: None,
        });
        self.classes[class.index()].methods.push(id);
        id
    }

    pub fn build(mut self) -> Result<Catalog, EngineError> {
        let order = self.parent_first_order()?;

        for &class in &order {
            self.assign_slots(class)?;
        }
        for &class in &order {
            let impls = self.interface_tables(class)?;
            self.classes[class.index()].impls = impls;
        }

        let by_name = self
            .classes
            .iter()
            .map(|c| ((c.namespace.clone(), c.name.clone()), c.id))
            .collect();
        Ok(Catalog {
            classes: self.classes,
            methods: self.methods,
            by_name,
        })
    }

    fn parent_first_order(&self) -> Result<Vec<ClassId>, EngineError> {
        let mut depths = Vec::with_capacity(self.classes.len());
        for class in &self.classes {
            let mut depth = 0usize;
            let mut current = class.parent;
            while let Some(parent) = current {
                let Some(info) = self.classes.get(parent.index()) else {
                    return Err(EngineError::InvalidMetadata(format!(
                        "{} has an unknown parent",
                        class.full_name()
                    )));
                };
                if info.is_interface() {
                    return Err(EngineError::InvalidMetadata(format!(
                        "{} extends interface {}",
                        class.full_name(),
                        info.full_name()
                    )));
                }
                depth += 1;
                if depth > self.classes.len() {
                    return Err(EngineError::InvalidMetadata(format!(
                        "{} has a cyclic parent chain",
                        class.full_name()
                    )));
                }
                current = info.parent;
            }
            depths.push((depth, class.id));
        }
        depths.sort();
        Ok(depths.into_iter().map(|(_, id)| id).collect())
    }

    fn assign_slots(&mut self, class: ClassId) -> Result<(), EngineError> {
        let info = &self.classes[class.index()];
        let is_interface = info.is_interface();
        let mut vtable = match info.parent {
            Some(parent) => self.classes[parent.index()].vtable.clone(),
            None => Vec::new(),
        };
        let mut next_interface_slot = 0u16;

        for method in info.methods.clone() {
            let m = &self.methods[method.index()];
            if !m.is_virtual {
                continue;
            }
            let slot = if is_interface {
                next_interface_slot += 1;
                next_interface_slot - 1
            } else {
                let overridden = if m.new_slot {
                    None
                } else {
                    vtable.iter().rposition(|existing: &MethodId| {
                        let e = &self.methods[existing.index()];
                        e.name == m.name && e.signature.same_shape(&m.signature)
                    })
                };
                match overridden {
                    Some(pos) => {
                        vtable[pos] = method;
                        pos as u16
                    }
                    None => {
                        vtable.push(method);
                        (vtable.len() - 1) as u16
                    }
                }
            };
            if slot == ABSTRACT_SLOT {
                return Err(EngineError::InvalidMetadata(format!(
                    "{} has too many virtual methods",
                    self.classes[class.index()].full_name()
                )));
            }
            self.methods[method.index()].slot = Some(slot);
        }

        self.classes[class.index()].vtable = vtable;
        Ok(())
    }

    /// Declared interfaces plus everything they inherit, without duplicates.
    fn flatten_interfaces(&self, class: ClassId) -> Result<Vec<ClassId>, EngineError> {
        let mut out = Vec::new();
        let mut pending: Vec<ClassId> = self.classes[class.index()].interfaces.clone();
        while let Some(iface) = pending.pop() {
            let Some(info) = self.classes.get(iface.index()) else {
                return Err(EngineError::InvalidMetadata(format!(
                    "{} implements an unknown interface",
                    self.classes[class.index()].full_name()
                )));
            };
            if !info.is_interface() {
                return Err(EngineError::InvalidMetadata(format!(
                    "{} is not an interface",
                    info.full_name()
                )));
            }
            if !out.contains(&iface) {
                out.push(iface);
                pending.extend(info.interfaces.iter().copied());
            }
        }
        Ok(out)
    }

    fn interface_tables(&self, class: ClassId) -> Result<Vec<InterfaceImpl>, EngineError> {
        let info = &self.classes[class.index()];
        if info.is_interface() {
            return Ok(Vec::new());
        }
        let mut impls = Vec::new();
        for iface in self.flatten_interfaces(class)? {
            let mut iface_methods: Vec<&MethodInfo> = self.classes[iface.index()]
                .methods
                .iter()
                .map(|m| &self.methods[m.index()])
                .filter(|m| m.is_virtual)
                .collect();
            iface_methods.sort_by_key(|m| m.slot);

            let slots = iface_methods
                .iter()
                .map(|im| {
                    info.vtable
                        .iter()
                        .rposition(|candidate| {
                            let c = &self.methods[candidate.index()];
                            !c.is_abstract && c.name == im.name && c.signature.same_shape(&im.signature)
                        })
                        .map_or(ABSTRACT_SLOT, |pos| pos as u16)
                })
                .collect();
            impls.push(InterfaceImpl {
                interface: iface,
                slots,
            });
        }
        Ok(impls)
    }
}

impl Default for CatalogBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only class and method metadata.
#[derive(Debug)]
pub struct Catalog {
    classes: Vec<ClassInfo>,
    methods: Vec<MethodInfo>,
    by_name: HashMap<(String, String), ClassId>,
}

impl Catalog {
    pub fn class(&self, id: ClassId) -> &ClassInfo {
        &self.classes[id.index()]
    }

    pub fn method(&self, id: MethodId) -> &MethodInfo {
        &self.methods[id.index()]
    }

    pub fn classes(&self) -> impl Iterator<Item = &ClassInfo> {
        self.classes.iter()
    }

    pub fn parent(&self, id: ClassId) -> Option<ClassId> {
        self.class(id).parent
    }

    pub fn find_class(&self, namespace: &str, name: &str) -> Option<ClassId> {
        self.by_name
            .get(&(namespace.to_string(), name.to_string()))
            .copied()
    }

    /// Looks up `Namespace.Name`; a name without a dot is in the global namespace.
    pub fn find_class_by_name(&self, full_name: &str) -> Option<ClassId> {
        match full_name.rsplit_once('.') {
            Some((namespace, name)) => self.find_class(namespace, name),
            None => self.find_class("", full_name),
        }
    }

    pub fn object_class(&self) -> Option<ClassId> {
        self.find_class("System", "Object")
    }

    pub fn enum_underlying(&self, class: ClassId) -> Option<ElementType> {
        match self.class(class).kind {
            ClassKind::Enum(underlying) => Some(underlying),
            _ => None,
        }
    }

    /// True when `class` is `base` or derives from it.
    pub fn inherits_from(&self, class: ClassId, base: ClassId) -> bool {
        let mut current = Some(class);
        while let Some(c) = current {
            if c == base {
                return true;
            }
            current = self.parent(c);
        }
        false
    }

    pub fn implements(&self, class: ClassId, interface: ClassId) -> bool {
        if class == interface {
            return true;
        }
        let mut current = Some(class);
        while let Some(c) = current {
            if self.impl_table(c, interface).is_some() {
                return true;
            }
            current = self.parent(c);
        }
        false
    }

    /// The implementation table `class` itself declares for `interface`.
    pub fn impl_table(&self, class: ClassId, interface: ClassId) -> Option<&[u16]> {
        self.class(class)
            .impls
            .iter()
            .find(|i| i.interface == interface)
            .map(|i| i.slots.as_slice())
    }

    /// Finds a method by name and exact signature, searching parents too.
    pub fn find_method(
        &self,
        class: ClassId,
        name: &str,
        signature: &MethodSignature,
    ) -> Option<MethodId> {
        let mut current = Some(class);
        while let Some(c) = current {
            let found = self.class(c).methods.iter().copied().find(|m| {
                let info = self.method(*m);
                info.name == name && info.signature == *signature
            });
            if found.is_some() {
                return found;
            }
            current = self.parent(c);
        }
        None
    }

    pub fn find_ctor(&self, class: ClassId, params: &[Type]) -> Option<MethodId> {
        self.class(class).methods.iter().copied().find(|m| {
            let info = self.method(*m);
            info.is_ctor() && info.signature.params == params
        })
    }

    /// Nearest `void Finalize()` from `class` up to the root.
    pub fn find_finalizer(&self, class: ClassId) -> Option<MethodId> {
        let mut current = Some(class);
        while let Some(c) = current {
            let found = self.class(c).methods.iter().copied().find(|m| {
                let info = self.method(*m);
                info.name == "Finalize"
                    && info.signature.has_this
                    && info.signature.params.is_empty()
                    && info.signature.ret.is_void()
            });
            if found.is_some() {
                return found;
            }
            current = self.parent(c);
        }
        None
    }

    pub fn method_name(&self, method: MethodId) -> String {
        let info = self.method(method);
        format!("{}::{}", self.class(info.owner).full_name(), info.name)
    }
}
