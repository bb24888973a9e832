//! Argument sources for the packers.
//!
//! `VaList` mimics untyped C variadics: every read is reinterpreted to the kind the
//! signature asks for, with the usual promotions. `ExecValues` is the pre-boxed
//! array flavor.
use super::{ObjectRef, TypedRef};

/// Raw argument source walked in signature order.
pub trait ArgSource {
    /// Next integer argument after variadic promotion.
    fn next_int(&mut self) -> i64;
    fn next_long(&mut self) -> i64;
    /// Next floating point argument, promoted to double.
    fn next_float(&mut self) -> f64;
    fn next_object(&mut self) -> Option<ObjectRef>;
    fn next_ptr(&mut self) -> *mut u8;
    fn next_typed_ref(&mut self) -> TypedRef;
    /// Caller-owned payload of a value-type argument.
    fn next_struct(&mut self) -> Option<&[u8]>;
}

/// One variadic argument as a C caller would have pushed it.
#[derive(Debug, Clone, Copy)]
pub enum VaArg<'a> {
    Int(i32),
    UInt(u32),
    Long(i64),
    ULong(u64),
    Double(f64),
    Ptr(*mut u8),
    Object(Option<ObjectRef>),
    /// Pointer to a caller temporary holding a value type.
    Struct(&'a [u8]),
    /// Pointer to a caller temporary holding a typed reference.
    TypedRef(&'a TypedRef),
}

impl VaArg<'_> {
    fn bits(&self) -> i64 {
        match *self {
            VaArg::Int(v) => v as i64,
            VaArg::UInt(v) => v as i64,
            VaArg::Long(v) => v,
            VaArg::ULong(v) => v as i64,
            VaArg::Double(v) => v as i64,
            VaArg::Ptr(p) => p as usize as i64,
            VaArg::Object(o) => ObjectRef::word_of(o) as i64,
            VaArg::Struct(s) => s.as_ptr() as usize as i64,
            VaArg::TypedRef(t) => t as *const TypedRef as usize as i64,
        }
    }
}

pub struct VaList<'a> {
    args: &'a [VaArg<'a>],
    pos: usize,
}

impl<'a> VaList<'a> {
    pub fn new(args: &'a [VaArg<'a>]) -> Self {
        Self { args, pos: 0 }
    }

    fn next(&mut self) -> Option<VaArg<'a>> {
        let arg = self.args.get(self.pos).copied();
        self.pos += 1;
        if arg.is_none() {
            tracing::warn!(position = self.pos, "variadic argument list exhausted");
        }
        arg
    }

    pub fn consumed(&self) -> usize {
        self.pos.min(self.args.len())
    }
}

impl ArgSource for VaList<'_> {
    fn next_int(&mut self) -> i64 {
        self.next().map_or(0, |a| a.bits())
    }

    fn next_long(&mut self) -> i64 {
        self.next().map_or(0, |a| a.bits())
    }

    fn next_float(&mut self) -> f64 {
        match self.next() {
            Some(VaArg::Double(v)) => v,
            Some(other) => other.bits() as f64,
            None => 0.0,
        }
    }

    fn next_object(&mut self) -> Option<ObjectRef> {
        match self.next()? {
            VaArg::Object(o) => o,
            other => ObjectRef::from_word(other.bits() as usize),
        }
    }

    fn next_ptr(&mut self) -> *mut u8 {
        match self.next() {
            Some(VaArg::Ptr(p)) => p,
            Some(other) => other.bits() as usize as *mut u8,
            None => std::ptr::null_mut(),
        }
    }

    fn next_typed_ref(&mut self) -> TypedRef {
        match self.next() {
            Some(VaArg::TypedRef(t)) => *t,
            _ => TypedRef::default(),
        }
    }

    fn next_struct(&mut self) -> Option<&[u8]> {
        match self.next()? {
            VaArg::Struct(s) => Some(s),
            _ => None,
        }
    }
}

/// Pre-boxed argument or result value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ExecValue {
    #[default]
    Empty,
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    /// Stored at native float width.
    Float(f64),
    Ptr(*mut u8),
    Object(Option<ObjectRef>),
    TypedRef(TypedRef),
    /// Value-type payload.
    Struct(Vec<u8>),
}

impl ExecValue {
    /// Integer reinterpretation used when a value is read at another kind.
    pub(crate) fn bits(&self) -> i64 {
        match self {
            ExecValue::Empty | ExecValue::Struct(_) | ExecValue::TypedRef(_) => 0,
            ExecValue::Int32(v) => *v as i64,
            ExecValue::UInt32(v) => *v as i64,
            ExecValue::Int64(v) => *v,
            ExecValue::UInt64(v) => *v as i64,
            ExecValue::Float(v) => *v as i64,
            ExecValue::Ptr(p) => *p as usize as i64,
            ExecValue::Object(o) => ObjectRef::word_of(*o) as i64,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            ExecValue::Int32(v) => Some(*v),
            ExecValue::UInt32(v) => Some(*v as i32),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ExecValue::Int64(v) => Some(*v),
            ExecValue::UInt64(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ExecValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<ObjectRef> {
        match self {
            ExecValue::Object(o) => *o,
            _ => None,
        }
    }
}

pub struct ExecValues<'a> {
    values: &'a [ExecValue],
    pos: usize,
}

impl<'a> ExecValues<'a> {
    pub fn new(values: &'a [ExecValue]) -> Self {
        Self { values, pos: 0 }
    }

    fn next(&mut self) -> Option<&'a ExecValue> {
        let value = self.values.get(self.pos);
        self.pos += 1;
        if value.is_none() {
            tracing::warn!(position = self.pos, "argument array exhausted");
        }
        value
    }
}

impl ArgSource for ExecValues<'_> {
    fn next_int(&mut self) -> i64 {
        self.next().map_or(0, ExecValue::bits)
    }

    fn next_long(&mut self) -> i64 {
        self.next().map_or(0, ExecValue::bits)
    }

    fn next_float(&mut self) -> f64 {
        match self.next() {
            Some(ExecValue::Float(v)) => *v,
            Some(other) => other.bits() as f64,
            None => 0.0,
        }
    }

    fn next_object(&mut self) -> Option<ObjectRef> {
        match self.next()? {
            ExecValue::Object(o) => *o,
            other => ObjectRef::from_word(other.bits() as usize),
        }
    }

    fn next_ptr(&mut self) -> *mut u8 {
        match self.next() {
            Some(ExecValue::Ptr(p)) => *p,
            Some(ExecValue::Struct(bytes)) => bytes.as_ptr() as *mut u8,
            Some(other) => other.bits() as usize as *mut u8,
            None => std::ptr::null_mut(),
        }
    }

    fn next_typed_ref(&mut self) -> TypedRef {
        match self.next() {
            Some(ExecValue::TypedRef(t)) => *t,
            _ => TypedRef::default(),
        }
    }

    fn next_struct(&mut self) -> Option<&[u8]> {
        match self.next()? {
            ExecValue::Struct(bytes) => Some(bytes.as_slice()),
            _ => None,
        }
    }
}
