//! Result delivery: pops the callee's return words (interpreter) or reads the
//! native return buffer, then hands the value to the caller in the requested shape.
use crate::{
    error::Fault,
    types::ElementType,
    value::{load_bytes, ExecValue, ExecValues, ObjectRef, TypedRef, Word, WORD_SIZE},
    vm::{pack::write_words, signature::ParamKind, stack::EvaluationStack},
};

/// Where a call's result goes.
#[derive(Debug)]
pub enum ResultSlot<'a> {
    Discard,
    /// Raw bytes at the declared width of the return type.
    Direct(&'a mut [u8]),
    Boxed(&'a mut ExecValue),
}

impl ResultSlot<'_> {
    pub fn is_discard(&self) -> bool {
        matches!(self, ResultSlot::Discard)
    }
}

const TYPED_REF_SIZE: usize = std::mem::size_of::<TypedRef>();

fn fixed<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    let n = N.min(bytes.len());
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

fn native_int(value: i64, unsigned: bool) -> ExecValue {
    match (WORD_SIZE, unsigned) {
        (8, false) => ExecValue::Int64(value),
        (8, true) => ExecValue::UInt64(value as u64),
        (_, false) => ExecValue::Int32(value as i32),
        (_, true) => ExecValue::UInt32(value as u32),
    }
}

/// Decodes a value from its interpreter stack words.
pub fn decode_words(kind: ParamKind, words: &[Word]) -> ExecValue {
    let first = words.first().copied().unwrap_or(0);
    match kind {
        ParamKind::Void => ExecValue::Empty,
        ParamKind::Primitive(e) => match e {
            ElementType::Boolean | ElementType::U1 => ExecValue::Int32(first as u8 as i32),
            ElementType::I1 => ExecValue::Int32(first as i8 as i32),
            ElementType::I2 => ExecValue::Int32(first as i16 as i32),
            ElementType::U2 | ElementType::Char => ExecValue::Int32(first as u16 as i32),
            ElementType::I4 => ExecValue::Int32(first as i32),
            ElementType::U4 => ExecValue::UInt32(first as u32),
            ElementType::I8 => ExecValue::Int64(i64::from_ne_bytes(fixed(&load_bytes(words, 8)))),
            ElementType::U8 => {
                ExecValue::UInt64(u64::from_ne_bytes(fixed(&load_bytes(words, 8))))
            }
            ElementType::I => native_int(first as isize as i64, false),
            ElementType::U => native_int(first as i64, true),
            ElementType::R4 | ElementType::R8 | ElementType::R => {
                ExecValue::Float(f64::from_ne_bytes(fixed(&load_bytes(words, 8))))
            }
            ElementType::TypedByRef => {
                ExecValue::TypedRef(TypedRef::from_bytes(&load_bytes(words, TYPED_REF_SIZE)))
            }
        },
        ParamKind::ClassRef | ParamKind::Other => ExecValue::Object(ObjectRef::from_word(first)),
        ParamKind::ByRef => ExecValue::Ptr(first as *mut u8),
        ParamKind::ValueType { size } => ExecValue::Struct(load_bytes(words, size)),
    }
}

/// Decodes a value stored natively at its declared width.
pub fn decode_native(kind: ParamKind, bytes: &[u8]) -> ExecValue {
    let word = || usize::from_ne_bytes(fixed(bytes));
    match kind {
        ParamKind::Void => ExecValue::Empty,
        ParamKind::Primitive(e) => match e {
            ElementType::Boolean | ElementType::U1 => {
                ExecValue::Int32(bytes.first().copied().unwrap_or(0) as i32)
            }
            ElementType::I1 => ExecValue::Int32(bytes.first().copied().unwrap_or(0) as i8 as i32),
            ElementType::I2 => ExecValue::Int32(i16::from_ne_bytes(fixed(bytes)) as i32),
            ElementType::U2 | ElementType::Char => {
                ExecValue::Int32(u16::from_ne_bytes(fixed(bytes)) as i32)
            }
            ElementType::I4 => ExecValue::Int32(i32::from_ne_bytes(fixed(bytes))),
            ElementType::U4 => ExecValue::UInt32(u32::from_ne_bytes(fixed(bytes))),
            ElementType::I8 => ExecValue::Int64(i64::from_ne_bytes(fixed(bytes))),
            ElementType::U8 => ExecValue::UInt64(u64::from_ne_bytes(fixed(bytes))),
            ElementType::I => native_int(word() as isize as i64, false),
            ElementType::U => native_int(word() as i64, true),
            ElementType::R4 => ExecValue::Float(f32::from_ne_bytes(fixed(bytes)) as f64),
            ElementType::R8 | ElementType::R => ExecValue::Float(f64::from_ne_bytes(fixed(bytes))),
            ElementType::TypedByRef => {
                ExecValue::TypedRef(TypedRef::from_bytes(&fixed::<TYPED_REF_SIZE>(bytes)))
            }
        },
        ParamKind::ClassRef | ParamKind::Other => ExecValue::Object(ObjectRef::from_word(word())),
        ParamKind::ByRef => ExecValue::Ptr(word() as *mut u8),
        ParamKind::ValueType { size } => {
            let mut payload = bytes[..size.min(bytes.len())].to_vec();
            payload.resize(size, 0);
            ExecValue::Struct(payload)
        }
    }
}

/// Bytes of `value` at the declared width of `kind`.
pub fn native_bytes_of(kind: ParamKind, value: &ExecValue) -> Vec<u8> {
    let bits = value.bits();
    match kind {
        ParamKind::Void => Vec::new(),
        ParamKind::Primitive(e) => match e {
            ElementType::Boolean | ElementType::U1 | ElementType::I1 => vec![bits as u8],
            ElementType::I2 | ElementType::U2 | ElementType::Char => {
                (bits as u16).to_ne_bytes().to_vec()
            }
            ElementType::I4 | ElementType::U4 => (bits as u32).to_ne_bytes().to_vec(),
            ElementType::I8 | ElementType::U8 => bits.to_ne_bytes().to_vec(),
            ElementType::I | ElementType::U => (bits as usize).to_ne_bytes().to_vec(),
            ElementType::R4 => (value.as_f64().unwrap_or(bits as f64) as f32)
                .to_ne_bytes()
                .to_vec(),
            ElementType::R8 | ElementType::R => {
                value.as_f64().unwrap_or(bits as f64).to_ne_bytes().to_vec()
            }
            ElementType::TypedByRef => match value {
                ExecValue::TypedRef(t) => t.to_bytes().to_vec(),
                _ => TypedRef::default().to_bytes().to_vec(),
            },
        },
        ParamKind::ClassRef | ParamKind::Other | ParamKind::ByRef => {
            (bits as usize).to_ne_bytes().to_vec()
        }
        ParamKind::ValueType { size } => {
            let mut payload = match value {
                ExecValue::Struct(bytes) => bytes.clone(),
                _ => Vec::new(),
            };
            payload.resize(size, 0);
            payload
        }
    }
}

/// Interpreter stack words for `value`, as a callee leaves its return value.
pub fn encode_words(kind: ParamKind, value: &ExecValue) -> Result<Vec<Word>, Fault> {
    let mut words = vec![0; kind.words()];
    write_words(kind, &mut ExecValues::new(std::slice::from_ref(value)), &mut words)?;
    Ok(words)
}

fn deliver(kind: ParamKind, value: ExecValue, slot: ResultSlot<'_>) {
    match slot {
        ResultSlot::Discard => {}
        ResultSlot::Direct(out) => {
            let bytes = native_bytes_of(kind, &value);
            let n = bytes.len().min(out.len());
            out[..n].copy_from_slice(&bytes[..n]);
        }
        ResultSlot::Boxed(boxed) => *boxed = value,
    }
}

/// Pops the callee's result off the stack. A constructor always leaves exactly
/// one object word, whatever its declared return type.
pub fn unpack_interpreter(
    stack: &mut EvaluationStack,
    ret: ParamKind,
    is_ctor: bool,
    slot: ResultSlot<'_>,
) {
    let kind = if is_ctor { ParamKind::ClassRef } else { ret };
    let words = stack.pop_words(kind.words());
    deliver(kind, decode_words(kind, &words), slot);
}

/// Delivers a native return buffer.
pub fn unpack_native(kind: ParamKind, bytes: &[u8], slot: ResultSlot<'_>) {
    match slot {
        ResultSlot::Discard => {}
        ResultSlot::Direct(out) => {
            let n = kind.native_size().min(out.len()).min(bytes.len());
            out[..n].copy_from_slice(&bytes[..n]);
        }
        ResultSlot::Boxed(boxed) => *boxed = decode_native(kind, bytes),
    }
}

/// Delivers an already decoded value, used for constructor results.
pub fn deliver_value(kind: ParamKind, value: ExecValue, slot: ResultSlot<'_>) {
    deliver(kind, value, slot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_ints_widen_to_int32() {
        let word = (-5i32) as isize as Word;
        assert_eq!(
            decode_words(ParamKind::Primitive(ElementType::I1), &[word]),
            ExecValue::Int32(-5)
        );
        assert_eq!(
            decode_words(ParamKind::Primitive(ElementType::U1), &[0x1fb]),
            ExecValue::Int32(0xfb)
        );
        assert_eq!(
            decode_words(ParamKind::Primitive(ElementType::U4), &[u32::MAX as Word]),
            ExecValue::UInt32(u32::MAX)
        );
    }

    #[test]
    fn test_direct_result_exact_width() {
        let mut stack = EvaluationStack::new(8);
        stack
            .push_words(&encode_words(
                ParamKind::Primitive(ElementType::I2),
                &ExecValue::Int32(-2),
            )
            .unwrap())
            .unwrap();
        let mut out = [0xaau8; 4];
        unpack_interpreter(
            &mut stack,
            ParamKind::Primitive(ElementType::I2),
            false,
            ResultSlot::Direct(&mut out[..2]),
        );
        assert_eq!(out, [0xfe, 0xff, 0xaa, 0xaa]);
        assert_eq!(stack.top(), 0);
    }

    #[test]
    fn test_value_type_result() {
        let payload: Vec<u8> = (0..12).collect();
        let kind = ParamKind::ValueType { size: 12 };
        let mut stack = EvaluationStack::new(8);
        stack
            .push_words(&encode_words(kind, &ExecValue::Struct(payload.clone())).unwrap())
            .unwrap();
        let mut boxed = ExecValue::Empty;
        unpack_interpreter(&mut stack, kind, false, ResultSlot::Boxed(&mut boxed));
        assert_eq!(boxed, ExecValue::Struct(payload));
    }

    #[test]
    fn test_ctor_pops_one_object_word() {
        let mut stack = EvaluationStack::new(8);
        stack.push_words(&[1, 2, 77]).unwrap();
        let mut boxed = ExecValue::Empty;
        unpack_interpreter(&mut stack, ParamKind::Void, true, ResultSlot::Boxed(&mut boxed));
        assert_eq!(boxed, ExecValue::Object(ObjectRef::from_word(77)));
        assert_eq!(stack.top(), 2);
    }

    #[test]
    fn test_native_float_widths() {
        let bytes = 1.5f32.to_ne_bytes();
        assert_eq!(
            decode_native(ParamKind::Primitive(ElementType::R4), &bytes),
            ExecValue::Float(1.5)
        );
        assert_eq!(
            native_bytes_of(ParamKind::Primitive(ElementType::R4), &ExecValue::Float(1.5)),
            bytes.to_vec()
        );
    }
}
