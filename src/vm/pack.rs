//! Argument packing for both calling conventions.
//!
//! The interpreter packer writes words onto the calling thread's evaluation
//! stack; the native packer builds an array of pointers into its own scratch
//! buffer. Both read one logical value per parameter from an [`ArgSource`].
use crate::{
    error::Fault,
    types::ElementType,
    value::{store_bytes, ArgSource, ObjectRef, Word, WORD_SIZE},
    vm::{
        config::CallingConvention,
        signature::{ClassifiedSignature, ParamKind},
        ExecThread,
    },
};
use enum_dispatch::enum_dispatch;
use std::ffi::c_void;

/// Where the `this` argument comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThisArg {
    /// Read it from the argument source like any other parameter.
    FromSource,
    Explicit(ObjectRef),
    /// No `this` slot at all (constructors whose prologue allocates).
    Omitted,
}

#[enum_dispatch]
pub trait ArgumentPacker {
    fn pack(
        &mut self,
        thread: &mut ExecThread,
        sig: &ClassifiedSignature,
        is_ctor: bool,
        this: ThisArg,
        source: &mut dyn ArgSource,
    ) -> Result<(), Fault>;
}

#[enum_dispatch(ArgumentPacker)]
pub enum Packer {
    InterpreterPacker,
    NativePacker,
}

impl Packer {
    pub fn for_convention(convention: CallingConvention, thread_in_signature: bool) -> Self {
        match convention {
            CallingConvention::Interpreter => InterpreterPacker.into(),
            CallingConvention::Native => NativePacker::new(thread_in_signature).into(),
        }
    }
}

/// The caller's payload for a value-type parameter of `size` bytes. Anything
/// other than a payload at least that long is rejected.
fn value_payload(source: &mut dyn ArgSource, size: usize) -> Result<&[u8], Fault> {
    match source.next_struct() {
        Some(bytes) if bytes.len() >= size => Ok(bytes),
        Some(bytes) => Err(Fault::InvalidProgram(format!(
            "value-type payload holds {} bytes, expected {size}",
            bytes.len()
        ))),
        None => Err(Fault::InvalidProgram(
            "value-type argument passed without a payload".into(),
        )),
    }
}

/// Writes one parameter into `words`, which has exactly `kind.words()` slots.
pub(crate) fn write_words(
    kind: ParamKind,
    source: &mut dyn ArgSource,
    words: &mut [Word],
) -> Result<(), Fault> {
    match kind {
        ParamKind::Void => {}
        ParamKind::Primitive(e) => match e {
            ElementType::Boolean | ElementType::U1 => words[0] = source.next_int() as u8 as Word,
            ElementType::I1 => words[0] = source.next_int() as i8 as isize as Word,
            ElementType::I2 => words[0] = source.next_int() as i16 as isize as Word,
            ElementType::U2 | ElementType::Char => words[0] = source.next_int() as u16 as Word,
            ElementType::I4 => words[0] = source.next_int() as i32 as isize as Word,
            ElementType::U4 => words[0] = source.next_int() as u32 as Word,
            ElementType::I8 | ElementType::U8 => {
                store_bytes(words, &source.next_long().to_ne_bytes())
            }
            ElementType::I | ElementType::U => words[0] = source.next_long() as isize as Word,
            ElementType::R4 => {
                let narrowed = source.next_float() as f32;
                store_bytes(words, &(narrowed as f64).to_ne_bytes())
            }
            ElementType::R8 | ElementType::R => {
                store_bytes(words, &source.next_float().to_ne_bytes())
            }
            ElementType::TypedByRef => store_bytes(words, &source.next_typed_ref().to_bytes()),
        },
        ParamKind::ClassRef | ParamKind::Other => {
            words[0] = ObjectRef::word_of(source.next_object())
        }
        ParamKind::ByRef => words[0] = source.next_ptr() as Word,
        ParamKind::ValueType { size } => store_bytes(words, &value_payload(source, size)?[..size]),
    }
    Ok(())
}

/// Packs onto the evaluation stack. The new top is committed only once every
/// parameter fit; on overflow the partially written region is simply ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct InterpreterPacker;

impl ArgumentPacker for InterpreterPacker {
    fn pack(
        &mut self,
        thread: &mut ExecThread,
        sig: &ClassifiedSignature,
        is_ctor: bool,
        this: ThisArg,
        source: &mut dyn ArgSource,
    ) -> Result<(), Fault> {
        let mut stack = thread.stack();
        let mut top = stack.top();

        if sig.has_this && !is_ctor && this != ThisArg::Omitted {
            stack.check_space(top, 1)?;
            let object = match this {
                ThisArg::Explicit(object) => Some(object),
                _ => source.next_object(),
            };
            stack.slots_mut(top, 1)[0] = ObjectRef::word_of(object);
            top += 1;
        }

        for &param in &sig.params {
            let words = param.words();
            stack.check_space(top, words)?;
            write_words(param, source, stack.slots_mut(top, words))?;
            top += words;
        }

        stack.set_top(top);
        Ok(())
    }
}

/// Scratch storage for one native argument, wide enough for a typed reference.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, Default)]
struct ScratchSlot([u8; 16]);

impl ScratchSlot {
    fn store(&mut self, bytes: &[u8]) -> *mut c_void {
        self.0[..bytes.len()].copy_from_slice(bytes);
        self.0.as_mut_ptr() as *mut c_void
    }
}

/// Packs into an array of pointers, one per argument. Primitive values are copied
/// into scratch slots; value types forward the caller's pointer.
#[derive(Debug)]
pub struct NativePacker {
    thread_in_signature: bool,
    thread: Box<*mut c_void>,
    scratch: Vec<ScratchSlot>,
    args: Vec<*mut c_void>,
}

impl NativePacker {
    pub fn new(thread_in_signature: bool) -> Self {
        Self {
            thread_in_signature,
            thread: Box::new(std::ptr::null_mut()),
            scratch: Vec::new(),
            args: Vec::new(),
        }
    }

    pub fn args(&self) -> &[*mut c_void] {
        &self.args
    }

    pub fn args_mut(&mut self) -> &mut [*mut c_void] {
        &mut self.args
    }

    pub fn thread_in_signature(&self) -> bool {
        self.thread_in_signature
    }

    /// Points the leading thread argument at `thread`. Called again right
    /// before the native call so the pointer is the most recent borrow.
    pub fn bind_thread(&mut self, thread: *mut ExecThread) {
        *self.thread = thread as *mut c_void;
    }
}

fn native_bytes(
    kind: ParamKind,
    source: &mut dyn ArgSource,
    slot: &mut ScratchSlot,
) -> Result<*mut c_void, Fault> {
    let ptr = match kind {
        ParamKind::Void => std::ptr::null_mut(),
        ParamKind::Primitive(e) => match e {
            ElementType::Boolean | ElementType::U1 => slot.store(&[source.next_int() as u8]),
            ElementType::I1 => slot.store(&(source.next_int() as i8).to_ne_bytes()),
            ElementType::I2 => slot.store(&(source.next_int() as i16).to_ne_bytes()),
            ElementType::U2 | ElementType::Char => {
                slot.store(&(source.next_int() as u16).to_ne_bytes())
            }
            ElementType::I4 => slot.store(&(source.next_int() as i32).to_ne_bytes()),
            ElementType::U4 => slot.store(&(source.next_int() as u32).to_ne_bytes()),
            ElementType::I8 | ElementType::U8 => slot.store(&source.next_long().to_ne_bytes()),
            ElementType::I | ElementType::U => {
                slot.store(&(source.next_long() as isize).to_ne_bytes())
            }
            ElementType::R4 => slot.store(&(source.next_float() as f32).to_ne_bytes()),
            ElementType::R8 | ElementType::R => slot.store(&source.next_float().to_ne_bytes()),
            ElementType::TypedByRef => slot.store(&source.next_typed_ref().to_bytes()),
        },
        ParamKind::ClassRef | ParamKind::Other => {
            slot.store(&ObjectRef::word_of(source.next_object()).to_ne_bytes())
        }
        ParamKind::ByRef => slot.store(&(source.next_ptr() as usize).to_ne_bytes()),
        ParamKind::ValueType { size } => value_payload(source, size)?.as_ptr() as *mut c_void,
    };
    Ok(ptr)
}

impl ArgumentPacker for NativePacker {
    fn pack(
        &mut self,
        thread: &mut ExecThread,
        sig: &ClassifiedSignature,
        _is_ctor: bool,
        this: ThisArg,
        source: &mut dyn ArgSource,
    ) -> Result<(), Fault> {
        let has_this_slot = sig.has_this && this != ThisArg::Omitted;
        let count = usize::from(self.thread_in_signature)
            + usize::from(has_this_slot)
            + sig.params.len();

        // Pointers handed out below stay valid until the next pack: neither
        // buffer is resized after this point.
        self.scratch = vec![ScratchSlot::default(); count];
        self.args = Vec::new();
        self.args
            .try_reserve_exact(count)
            .map_err(|_| Fault::OutOfMemory)?;

        if self.thread_in_signature {
            self.bind_thread(thread);
            self.args.push(&mut *self.thread as *mut *mut c_void as *mut c_void);
        }

        let mut slots = self.scratch.iter_mut();
        if has_this_slot {
            let object = match this {
                ThisArg::Explicit(object) => Some(object),
                _ => source.next_object(),
            };
            let slot = slots.next().ok_or(Fault::OutOfMemory)?;
            let word = ObjectRef::word_of(object);
            self.args.push(slot.store(&word.to_ne_bytes()[..WORD_SIZE]));
        }
        for &param in &sig.params {
            let slot = slots.next().ok_or(Fault::OutOfMemory)?;
            self.args.push(native_bytes(param, source, slot)?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        types::CatalogBuilder,
        value::{load_bytes, ExecValue, ExecValues, TypedRef, VaArg, VaList},
        vm::{
            config::EngineConfig,
            unpack::{decode_native, decode_words, native_bytes_of},
            Executor, Process, ScriptedInterpreter,
        },
    };
    use std::sync::Arc;

    fn kinds() -> Vec<(ParamKind, ExecValue)> {
        vec![
            (ParamKind::Primitive(ElementType::I1), ExecValue::Int32(-7)),
            (ParamKind::Primitive(ElementType::U2), ExecValue::Int32(65535)),
            (ParamKind::Primitive(ElementType::I8), ExecValue::Int64(i64::MIN + 3)),
            (ParamKind::Primitive(ElementType::R8), ExecValue::Float(-0.125)),
        ]
    }

    #[test]
    fn test_write_words_narrows() {
        let mut words = [0; 1];
        let args = [VaArg::Int(0x1ff)];
        write_words(
            ParamKind::Primitive(ElementType::U1),
            &mut VaList::new(&args),
            &mut words,
        )
        .unwrap();
        assert_eq!(words[0], 0xff);

        let args = [VaArg::Int(-1)];
        write_words(
            ParamKind::Primitive(ElementType::I1),
            &mut VaList::new(&args),
            &mut words,
        )
        .unwrap();
        assert_eq!(words[0] as isize, -1);
    }

    #[test]
    fn test_value_type_payload_copied() {
        let payload: Vec<u8> = (1..=12).collect();
        let kind = ParamKind::ValueType { size: 12 };
        let mut words = vec![0; kind.words()];
        let values = [ExecValue::Struct(payload.clone())];
        write_words(kind, &mut ExecValues::new(&values), &mut words).unwrap();
        assert_eq!(load_bytes(&words, 12), payload);
    }

    #[test]
    fn test_value_type_without_payload_rejected() {
        let kind = ParamKind::ValueType { size: 12 };
        let mut words = vec![0; kind.words()];
        let mut target = [0u8; 12];
        let args = [VaArg::Ptr(target.as_mut_ptr())];
        assert!(matches!(
            write_words(kind, &mut VaList::new(&args), &mut words),
            Err(Fault::InvalidProgram(_))
        ));

        let mut slot = ScratchSlot::default();
        let values = [ExecValue::Struct(vec![1, 2, 3])];
        assert!(matches!(
            native_bytes(kind, &mut ExecValues::new(&values), &mut slot),
            Err(Fault::InvalidProgram(_))
        ));
    }

    #[test]
    fn test_native_slots_hold_declared_width() {
        for (kind, value) in kinds() {
            let mut slot = ScratchSlot::default();
            let values = [value.clone()];
            let ptr = native_bytes(kind, &mut ExecValues::new(&values), &mut slot).unwrap();
            let bytes = unsafe { std::slice::from_raw_parts(ptr as *const u8, kind.native_size()) };
            let decoded = crate::vm::unpack::decode_native(kind, bytes);
            assert_eq!(decoded, value, "{kind:?}");
        }
    }

    fn native_signed(v: isize) -> ExecValue {
        if WORD_SIZE == 8 {
            ExecValue::Int64(v as i64)
        } else {
            ExecValue::Int32(v as i32)
        }
    }

    fn native_unsigned(v: usize) -> ExecValue {
        if WORD_SIZE == 8 {
            ExecValue::UInt64(v as u64)
        } else {
            ExecValue::UInt32(v as u32)
        }
    }

    /// Boundary values for every element type, as the decoders report them.
    fn boundary_values() -> Vec<(ElementType, Vec<ExecValue>)> {
        let quiet_nan32 = f32::from_bits(0x7fd0_0abc);
        let quiet_nan64 = f64::from_bits(0x7ff8_0000_dead_beef);
        vec![
            (ElementType::Boolean, vec![ExecValue::Int32(0), ExecValue::Int32(1)]),
            (ElementType::Char, vec![ExecValue::Int32(0), ExecValue::Int32(0xffff)]),
            (
                ElementType::I1,
                vec![ExecValue::Int32(i8::MIN.into()), ExecValue::Int32(i8::MAX.into())],
            ),
            (ElementType::U1, vec![ExecValue::Int32(0), ExecValue::Int32(u8::MAX.into())]),
            (
                ElementType::I2,
                vec![ExecValue::Int32(i16::MIN.into()), ExecValue::Int32(i16::MAX.into())],
            ),
            (ElementType::U2, vec![ExecValue::Int32(0), ExecValue::Int32(u16::MAX.into())]),
            (
                ElementType::I4,
                vec![ExecValue::Int32(i32::MIN), ExecValue::Int32(i32::MAX)],
            ),
            (
                ElementType::U4,
                vec![ExecValue::UInt32(0), ExecValue::UInt32(u32::MAX)],
            ),
            (
                ElementType::I8,
                vec![ExecValue::Int64(i64::MIN), ExecValue::Int64(i64::MAX)],
            ),
            (
                ElementType::U8,
                vec![ExecValue::UInt64(0), ExecValue::UInt64(u64::MAX)],
            ),
            (
                ElementType::R4,
                vec![
                    ExecValue::Float(f32::MIN.into()),
                    ExecValue::Float(f32::MAX.into()),
                    ExecValue::Float(-0.0),
                    ExecValue::Float(quiet_nan32.into()),
                ],
            ),
            (
                ElementType::R8,
                vec![
                    ExecValue::Float(f64::MIN),
                    ExecValue::Float(f64::MAX),
                    ExecValue::Float(quiet_nan64),
                ],
            ),
            (ElementType::I, vec![native_signed(isize::MIN), native_signed(isize::MAX)]),
            (ElementType::U, vec![native_unsigned(0), native_unsigned(usize::MAX)]),
            (
                ElementType::R,
                vec![ExecValue::Float(f64::MIN_POSITIVE), ExecValue::Float(quiet_nan64)],
            ),
            (
                ElementType::TypedByRef,
                vec![ExecValue::TypedRef(TypedRef {
                    type_handle: usize::MAX,
                    value: 0x1000 as *mut u8,
                })],
            ),
        ]
    }

    /// Floats compare by bit pattern so NaN payloads and signed zeros count.
    fn assert_same(actual: &ExecValue, expected: &ExecValue, context: &str) {
        match (actual, expected) {
            (ExecValue::Float(a), ExecValue::Float(e)) => {
                assert_eq!(a.to_bits(), e.to_bits(), "{context}")
            }
            _ => assert_eq!(actual, expected, "{context}"),
        }
    }

    #[test]
    fn test_every_element_type_survives_both_conventions() {
        let mut b = CatalogBuilder::new();
        b.object_class().unwrap();
        let process = Process::new(
            b.build().unwrap(),
            Executor::Interpreter(Arc::new(ScriptedInterpreter::new())),
            EngineConfig::default(),
        )
        .unwrap();
        let mut thread = process.attach_thread();

        let table = boundary_values();
        assert_eq!(table.len(), 16);
        for (element, values) in table {
            let kind = ParamKind::Primitive(element);
            let sig = ClassifiedSignature {
                has_this: false,
                params: vec![kind],
                ret: ParamKind::Void,
            };
            for value in values {
                let context = format!("{element:?} {value:?}");
                let args = [value.clone()];

                let mut words = vec![0; kind.words()];
                write_words(kind, &mut ExecValues::new(&args), &mut words).unwrap();
                assert_same(&decode_words(kind, &words), &value, &context);

                InterpreterPacker
                    .pack(
                        &mut thread,
                        &sig,
                        false,
                        ThisArg::FromSource,
                        &mut ExecValues::new(&args),
                    )
                    .unwrap();
                let pushed = thread.stack().top();
                assert_eq!(pushed, kind.words(), "{context}");
                assert_eq!(thread.stack().slots(0, pushed), &words[..], "{context}");
                thread.stack().truncate(0);

                let mut slot = ScratchSlot::default();
                let ptr = native_bytes(kind, &mut ExecValues::new(&args), &mut slot).unwrap();
                let bytes =
                    unsafe { std::slice::from_raw_parts(ptr as *const u8, kind.native_size()) };
                assert_eq!(bytes, &native_bytes_of(kind, &value)[..], "{context}");
                assert_same(&decode_native(kind, bytes), &value, &context);
            }
        }
        drop(thread);
        process.destroy();
    }
}
