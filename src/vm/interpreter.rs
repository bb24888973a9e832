//! The interpreter seam and the bundled scripted interpreter.
//!
//! `ScriptedInterpreter` runs host closures as method bodies. It still goes
//! through the real machinery: arguments arrive as words on the thread's
//! evaluation stack, the invoker's frame is popped by the return path, and
//! constructor entries run an allocation prologue before the body.
use crate::{
    error::{Fault, Thrown},
    types::MethodId,
    value::{ExecValue, ObjectRef},
    vm::{
        signature::{ClassifiedSignature, ParamKind},
        stack::Pc,
        unpack::{decode_words, encode_words},
        ExecThread, Process,
    },
};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

pub trait Interpreter: Send + Sync {
    /// Makes `method` executable and returns its entry point. Calling it again
    /// for the same method returns the same entry. On failure the exception is
    /// already set on `thread`.
    fn convert_method(&self, thread: &mut ExecThread, method: MethodId) -> Result<Pc, Thrown>;

    /// Distance of the constructor prologue before a method's entry point.
    fn ctor_offset(&self) -> Pc;

    /// Executes from `thread.pc()` until the frame pushed for this call
    /// returns. The return path pops that frame and leaves the result words on
    /// the stack at the frame base.
    fn run(&self, thread: &mut ExecThread) -> Result<(), Thrown>;
}

pub type MethodBody = Arc<dyn Fn(&mut Activation<'_>) -> Result<(), Thrown> + Send + Sync>;

const CTOR_OFFSET: Pc = 4;
const STRIDE: Pc = 16;

#[derive(Default)]
pub struct ScriptedInterpreter {
    bodies: DashMap<MethodId, MethodBody>,
    entries: DashMap<MethodId, Pc>,
    code: RwLock<Vec<MethodId>>,
}

impl ScriptedInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the body run for `method`.
    pub fn define(
        &self,
        method: MethodId,
        body: impl Fn(&mut Activation<'_>) -> Result<(), Thrown> + Send + Sync + 'static,
    ) {
        self.bodies.insert(method, Arc::new(body));
    }

    /// Methods translated so far.
    pub fn translated(&self) -> usize {
        self.code.read().len()
    }

    fn method_at(&self, pc: Pc) -> Option<MethodId> {
        self.code.read().get(pc / STRIDE).copied()
    }
}

impl Interpreter for ScriptedInterpreter {
    fn convert_method(&self, thread: &mut ExecThread, method: MethodId) -> Result<Pc, Thrown> {
        if let Some(entry) = self.entries.get(&method) {
            return Ok(*entry);
        }
        let process = thread.process().clone();
        let info = process.catalog().method(method);
        if info.is_abstract || (!self.bodies.contains_key(&method) && !info.is_ctor()) {
            return Err(thread.signal(Fault::MissingMethod(format!(
                "{} has no body",
                process.catalog().method_name(method)
            ))));
        }

        let mut code = self.code.write();
        if let Some(entry) = self.entries.get(&method) {
            return Ok(*entry);
        }
        let entry = code.len() * STRIDE + CTOR_OFFSET;
        code.push(method);
        self.entries.insert(method, entry);
        vm_debug!(thread, "translated {} at {entry}", process.catalog().method_name(method));
        Ok(entry)
    }

    fn ctor_offset(&self) -> Pc {
        CTOR_OFFSET
    }

    fn run(&self, thread: &mut ExecThread) -> Result<(), Thrown> {
        let pc = thread.pc;
        let Some(method) = self.method_at(pc).filter(|m| thread.method == Some(*m)) else {
            let fault = Fault::InvalidProgram(format!("no method at pc {pc}"));
            leave(thread);
            return Err(thread.signal(fault));
        };
        let process = thread.process().clone();
        let sig = match process.signature(method) {
            Ok(sig) => sig,
            Err(fault) => {
                leave(thread);
                return Err(thread.signal(fault));
            }
        };

        let prologue = pc % STRIDE == 0;
        let mut allocated = None;
        if prologue {
            let class = process.catalog().method(method).owner;
            if !process.catalog().class(class).is_array_or_string() {
                let base = thread.frame_base;
                let object = process.allocate_object(class).and_then(|object| {
                    thread
                        .stack()
                        .insert_word(base, object.to_word())
                        .map(|_| object)
                });
                match object {
                    Ok(object) => allocated = Some(object),
                    Err(fault) => {
                        leave(thread);
                        return Err(thread.signal(fault));
                    }
                }
            }
        }

        let has_this = sig.has_this && (!prologue || allocated.is_some());
        let frame_base = thread.frame_base;
        let this = has_this
            .then(|| ObjectRef::from_word(thread.stack().slots(frame_base, 1)[0]))
            .flatten();
        let body = self.bodies.get(&method).map(|b| b.clone());

        let mut activation = Activation {
            thread: &mut *thread,
            sig: sig.clone(),
            this,
            args_base: frame_base + usize::from(has_this),
            ret: ExecValue::Empty,
        };
        let outcome = match body {
            Some(body) => (*body)(&mut activation),
            None => Ok(()),
        };
        let ret = std::mem::take(&mut activation.ret);
        leave(thread);
        outcome?;

        let words = if prologue {
            vec![ObjectRef::word_of(allocated.or_else(|| ret.as_object()))]
        } else {
            encode_words(sig.ret, &ret).map_err(|fault| thread.signal(fault))?
        };
        let pushed = thread.stack().push_words(&words);
        pushed.map_err(|fault| thread.signal(fault))
    }
}

/// The return path: drops everything the call left above its frame base and
/// pops its frame.
fn leave(thread: &mut ExecThread) {
    let base = thread.frame_base;
    thread.stack().truncate(base);
    thread.frames.pop();
}

/// What a scripted body sees of its own call.
pub struct Activation<'t> {
    thread: &'t mut ExecThread,
    sig: Arc<ClassifiedSignature>,
    this: Option<ObjectRef>,
    args_base: usize,
    ret: ExecValue,
}

impl Activation<'_> {
    pub fn this(&self) -> Option<ObjectRef> {
        self.this
    }

    /// Declared parameter `index`, `this` excluded.
    pub fn arg(&self, index: usize) -> ExecValue {
        let Some(&kind) = self.sig.params.get(index) else {
            return ExecValue::Empty;
        };
        let offset: usize = self.sig.params[..index].iter().map(|p| p.words()).sum();
        decode_words(kind, self.thread.stack().slots(self.args_base + offset, kind.words()))
    }

    pub fn arg_i32(&self, index: usize) -> i32 {
        self.arg(index).bits() as i32
    }

    pub fn arg_i64(&self, index: usize) -> i64 {
        self.arg(index).bits()
    }

    pub fn arg_f64(&self, index: usize) -> f64 {
        match self.arg(index) {
            ExecValue::Float(v) => v,
            other => other.bits() as f64,
        }
    }

    pub fn arg_object(&self, index: usize) -> Option<ObjectRef> {
        self.arg(index).as_object()
    }

    pub fn ret(&mut self, value: ExecValue) {
        self.ret = value;
    }

    pub fn return_kind(&self) -> ParamKind {
        self.sig.ret
    }

    pub fn thread(&mut self) -> &mut ExecThread {
        self.thread
    }

    pub fn process(&self) -> Arc<Process> {
        self.thread.process().clone()
    }

    /// Managed `throw`.
    pub fn throw(&mut self, object: Option<ObjectRef>) -> Thrown {
        self.thread.throw_object(object)
    }

    /// Raises the exception an engine fault maps to.
    pub fn fault(&mut self, fault: Fault) -> Thrown {
        self.thread.signal(fault)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        types::{CatalogBuilder, MethodDef, MethodSignature, Type},
        vm::{config::EngineConfig, Executor},
    };

    #[test]
    fn test_conversion_is_idempotent() {
        let mut b = CatalogBuilder::new();
        let object = b.object_class().unwrap();
        let c = b.define_class("Demo", "C", Some(object));
        let m = b.add_method(c, MethodDef::new("M", MethodSignature::static_(vec![], Type::Void)));
        let missing = b.add_method(
            c,
            MethodDef::new("Missing", MethodSignature::static_(vec![], Type::Void)),
        );
        let interp = Arc::new(ScriptedInterpreter::new());
        interp.define(m, |_| Ok(()));
        let process = Process::new(
            b.build().unwrap(),
            Executor::Interpreter(interp.clone()),
            EngineConfig::default(),
        )
        .unwrap();
        let mut thread = process.attach_thread();

        let first = interp.convert_method(&mut thread, m).unwrap();
        assert_eq!(interp.convert_method(&mut thread, m), Ok(first));
        assert_eq!(first % STRIDE, CTOR_OFFSET);
        assert_eq!(interp.translated(), 1);

        assert!(interp.convert_method(&mut thread, missing).is_err());
        assert_eq!(
            thread.exception().map(|e| e.kind),
            Some(crate::vm::exceptions::ExceptionKind::MissingMethod)
        );
        drop(thread);
        process.destroy();
    }
}
