//! The native executor seam and the libffi backend.
use crate::{
    error::Fault,
    types::{ElementType, MethodId},
    value::WORD_SIZE,
    vm::signature::{ClassifiedSignature, ParamKind},
};
use dashmap::DashMap;
use libffi::middle::{Cif, CodePtr, Type};
use std::ffi::c_void;

/// One packed native call.
pub struct NativeCall<'a> {
    pub method: MethodId,
    pub sig: &'a ClassifiedSignature,
    pub thread_in_signature: bool,
    pub has_this: bool,
    /// One pointer per argument, pointing at the argument's value.
    pub args: &'a [*mut c_void],
    /// How the callee returns its result; a constructor that allocates its own
    /// instance returns the object here even when declared void.
    pub ret_kind: ParamKind,
    /// At least `ret_kind.native_size()` bytes.
    pub ret: &'a mut [u8],
}

pub trait NativeBackend: Send + Sync {
    /// Makes `method` callable. Idempotent.
    fn compile(&self, method: MethodId) -> Result<(), Fault>;

    /// Calls the compiled form of `call.method`.
    ///
    /// # Safety
    ///
    /// Every pointer in `call.args` must point at a live value of the kind the
    /// signature gives for that position, and the compiled code must have the
    /// matching native signature.
    unsafe fn invoke(&self, call: NativeCall<'_>) -> Result<(), Fault>;
}

/// Calls registered `extern "C"` functions through libffi.
///
/// Object handles and `this` travel as `usize`. Value types and typed
/// references travel as a pointer to the caller's copy; returning one adds a
/// trailing out-pointer parameter and a void return.
#[derive(Debug, Default)]
pub struct FfiBackend {
    entries: DashMap<MethodId, usize>,
}

impl FfiBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `method` to a native entry point.
    ///
    /// # Safety
    ///
    /// `entry` must be an `extern "C"` function taking, in order: the thread
    /// pointer (when the engine passes it), `this` as `usize` for instance
    /// methods, then the declared parameters as described on [`FfiBackend`].
    pub unsafe fn register(&self, method: MethodId, entry: *const c_void) {
        self.entries.insert(method, entry as usize);
    }

    pub fn is_registered(&self, method: MethodId) -> bool {
        self.entries.contains_key(&method)
    }
}

fn by_pointer(kind: ParamKind) -> bool {
    matches!(
        kind,
        ParamKind::ValueType { .. } | ParamKind::Primitive(ElementType::TypedByRef)
    )
}

fn ffi_type(kind: ParamKind) -> Type {
    match kind {
        ParamKind::Void => Type::void(),
        ParamKind::Primitive(e) => match e {
            ElementType::Boolean | ElementType::U1 => Type::u8(),
            ElementType::I1 => Type::i8(),
            ElementType::I2 => Type::i16(),
            ElementType::U2 | ElementType::Char => Type::u16(),
            ElementType::I4 => Type::i32(),
            ElementType::U4 => Type::u32(),
            ElementType::I8 => Type::i64(),
            ElementType::U8 => Type::u64(),
            ElementType::I => Type::isize(),
            ElementType::U => Type::usize(),
            ElementType::R4 => Type::f32(),
            ElementType::R8 | ElementType::R => Type::f64(),
            ElementType::TypedByRef => Type::pointer(),
        },
        ParamKind::ClassRef | ParamKind::Other => Type::usize(),
        ParamKind::ByRef | ParamKind::ValueType { .. } => Type::pointer(),
    }
}

#[repr(C, align(16))]
struct ReturnBuffer([u8; 16]);

impl ReturnBuffer {
    /// The result at its declared width. Integers narrower than a word come
    /// back widened to a full word.
    fn bytes(&self, kind: ParamKind) -> Vec<u8> {
        let size = kind.native_size().min(self.0.len());
        match kind {
            ParamKind::Primitive(e) if !e.is_float() && size < WORD_SIZE => {
                let mut word = [0u8; WORD_SIZE];
                word.copy_from_slice(&self.0[..WORD_SIZE]);
                let word = usize::from_ne_bytes(word);
                match size {
                    1 => vec![word as u8],
                    2 => (word as u16).to_ne_bytes().to_vec(),
                    _ => (word as u32).to_ne_bytes().to_vec(),
                }
            }
            _ => self.0[..size].to_vec(),
        }
    }
}

impl NativeBackend for FfiBackend {
    fn compile(&self, method: MethodId) -> Result<(), Fault> {
        if self.entries.contains_key(&method) {
            Ok(())
        } else {
            Err(Fault::MissingMethod(format!(
                "no native entry point for method #{}",
                method.index()
            )))
        }
    }

    unsafe fn invoke(&self, call: NativeCall<'_>) -> Result<(), Fault> {
        let entry = self
            .entries
            .get(&call.method)
            .map(|e| *e)
            .ok_or_else(|| Fault::MissingMethod(format!("method #{}", call.method.index())))?;

        let mut kinds = Vec::with_capacity(call.args.len());
        if call.thread_in_signature {
            kinds.push(ParamKind::ByRef);
        }
        if call.has_this {
            kinds.push(ParamKind::ClassRef);
        }
        kinds.extend_from_slice(&call.sig.params);
        if kinds.len() != call.args.len() {
            return Err(Fault::InvalidProgram(format!(
                "{} arguments packed for {} parameters",
                call.args.len(),
                kinds.len()
            )));
        }

        // By-pointer arguments pass the address they already hold, so the
        // argument vector points at a copy of that address.
        let mut indirect: Vec<*mut c_void> = call.args.to_vec();
        let mut argv: Vec<*mut c_void> = Vec::with_capacity(call.args.len() + 1);
        for (i, kind) in kinds.iter().enumerate() {
            if by_pointer(*kind) {
                argv.push(indirect.as_mut_ptr().add(i) as *mut c_void);
            } else {
                argv.push(call.args[i]);
            }
        }
        let mut types: Vec<Type> = kinds.iter().map(|k| ffi_type(*k)).collect();

        let mut out_ptr = call.ret.as_mut_ptr() as *mut c_void;
        let ret_type = if by_pointer(call.ret_kind) {
            if call.ret.len() < call.ret_kind.native_size() {
                return Err(Fault::InvalidProgram("return buffer too small".into()));
            }
            types.push(Type::pointer());
            argv.push(&mut out_ptr as *mut *mut c_void as *mut c_void);
            Type::void()
        } else {
            ffi_type(call.ret_kind)
        };

        let cif = Cif::new(types, ret_type);
        let code = CodePtr(entry as *mut c_void);
        let mut buffer = ReturnBuffer([0; 16]);
        libffi::raw::ffi_call(
            cif.as_raw_ptr(),
            Some(*code.as_fun()),
            buffer.0.as_mut_ptr() as *mut c_void,
            argv.as_mut_ptr(),
        );

        if !by_pointer(call.ret_kind) && call.ret_kind != ParamKind::Void {
            let bytes = buffer.bytes(call.ret_kind);
            let n = bytes.len().min(call.ret.len());
            call.ret[..n].copy_from_slice(&bytes[..n]);
        }
        Ok(())
    }
}
