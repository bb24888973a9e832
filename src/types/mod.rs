//! Metadata model consumed by the execution core.
//!
//! Types are an explicit sum type rather than a tagged pointer; the catalog owns
//! every class and method and hands out small copyable ids.
use std::fmt;

pub mod catalog;
pub mod layout;

pub use catalog::{
    Catalog, CatalogBuilder, ClassInfo, ClassKind, FieldInfo, InterfaceImpl, MethodDef,
    MethodInfo, ABSTRACT_SLOT,
};
pub use layout::{ClassLayout, GcDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub(crate) u32);

impl ClassId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl MethodId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Primitive element types, including the native-sized ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Boolean,
    Char,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    R4,
    R8,
    /// Native-sized signed integer.
    I,
    /// Native-sized unsigned integer.
    U,
    /// Native floating point, the widest float the engine stores.
    R,
    TypedByRef,
}

impl ElementType {
    pub fn size(self) -> usize {
        match self {
            ElementType::Boolean | ElementType::I1 | ElementType::U1 => 1,
            ElementType::Char | ElementType::I2 | ElementType::U2 => 2,
            ElementType::I4 | ElementType::U4 | ElementType::R4 => 4,
            ElementType::I8 | ElementType::U8 | ElementType::R8 | ElementType::R => 8,
            ElementType::I | ElementType::U => std::mem::size_of::<usize>(),
            ElementType::TypedByRef => std::mem::size_of::<crate::value::TypedRef>(),
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, ElementType::R4 | ElementType::R8 | ElementType::R)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Void,
    Primitive(ElementType),
    Class(ClassId),
    ValueType(ClassId),
    ByRef(Box<Type>),
    Pointer(Box<Type>),
    Array(Box<Type>),
    Generic(u32),
}

impl Type {
    pub fn i4() -> Self {
        Type::Primitive(ElementType::I4)
    }

    pub fn i8() -> Self {
        Type::Primitive(ElementType::I8)
    }

    pub fn r8() -> Self {
        Type::Primitive(ElementType::R8)
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Primitive(e) => write!(f, "{e:?}"),
            Type::Class(c) => write!(f, "class#{}", c.0),
            Type::ValueType(c) => write!(f, "valuetype#{}", c.0),
            Type::ByRef(t) => write!(f, "{t}&"),
            Type::Pointer(t) => write!(f, "{t}*"),
            Type::Array(t) => write!(f, "{t}[]"),
            Type::Generic(i) => write!(f, "!{i}"),
        }
    }
}

/// A method signature. The implicit `this` is not part of `params`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSignature {
    pub has_this: bool,
    pub params: Vec<Type>,
    pub ret: Type,
}

impl MethodSignature {
    pub fn instance(params: Vec<Type>, ret: Type) -> Self {
        Self {
            has_this: true,
            params,
            ret,
        }
    }

    pub fn static_(params: Vec<Type>, ret: Type) -> Self {
        Self {
            has_this: false,
            params,
            ret,
        }
    }

    /// Same parameter list and return type, ignoring `has_this`.
    pub fn same_shape(&self, other: &MethodSignature) -> bool {
        self.params == other.params && self.ret == other.ret
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{p}")?;
        }
        write!(f, ") -> {}", self.ret)
    }
}
