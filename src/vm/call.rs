//! Method invocation entry points.
//!
//! Every entry point comes in a variadic flavor taking [`VaArg`]s and a
//! pre-boxed flavor taking [`ExecValue`]s. Failures are reported as [`Thrown`]
//! with exactly one exception pending on the thread.
use crate::{
    error::{Fault, Thrown},
    types::{MethodId, MethodSignature, Type},
    value::{ArgSource, ExecValue, ExecValues, ObjectRef, VaArg, VaList},
    vm::{
        config::CallingConvention,
        native::{NativeBackend, NativeCall},
        pack::{ArgumentPacker, Packer, ThisArg},
        signature::{ClassifiedSignature, ParamKind},
        stack::CallFrame,
        unpack::{deliver_value, unpack_interpreter, unpack_native, ResultSlot},
        Executor, ExecThread, Interpreter,
    },
};

impl ExecThread {
    /// The shared invocation path. `construct` is set only when a new instance
    /// is being created; calling `.ctor` on an existing object is an ordinary
    /// instance call.
    fn invoke(
        &mut self,
        method: MethodId,
        construct: bool,
        this: ThisArg,
        source: &mut dyn ArgSource,
        result: ResultSlot<'_>,
    ) -> Result<(), Fault> {
        let process = self.process().clone();
        let sig = process.signature(method)?;
        if construct {
            process.ensure_layout(process.catalog().method(method).owner)?;
        }
        match process.executor() {
            Executor::Interpreter(interpreter) => {
                self.invoke_interpreted(interpreter.as_ref(), method, &sig, construct, this, source, result)
            }
            Executor::Native(backend) => {
                self.invoke_native(backend.as_ref(), method, &sig, construct, this, source, result)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn invoke_interpreted(
        &mut self,
        interpreter: &dyn Interpreter,
        method: MethodId,
        sig: &ClassifiedSignature,
        construct: bool,
        this: ThisArg,
        source: &mut dyn ArgSource,
        result: ResultSlot<'_>,
    ) -> Result<(), Fault> {
        self.clear_exception();
        let entry = interpreter
            .convert_method(self, method)
            .map_err(|Thrown| Fault::Thrown)?;

        let base = self.stack().top();
        let this = if construct { ThisArg::Omitted } else { this };
        let mut packer = Packer::for_convention(CallingConvention::Interpreter, false);
        if let Err(fault) = packer.pack(self, sig, construct, this, source) {
            self.stack().truncate(base);
            return Err(fault);
        }
        let pc = if construct {
            entry.checked_sub(interpreter.ctor_offset())
        } else {
            Some(entry)
        };
        let Some(pc) = pc else {
            self.stack().truncate(base);
            return Err(Fault::InvalidProgram(format!(
                "constructor entry {entry:#x} lies below the prologue offset"
            )));
        };

        let saved = (self.pc, self.method, self.frame_base);
        let frame = CallFrame {
            pc: self.pc,
            method: self.method,
            frame_base: self.frame_base,
            permissions: 0,
        };
        if let Err(fault) = self.frames.push(frame) {
            self.stack().truncate(base);
            return Err(fault);
        }
        self.pc = pc;
        self.method = Some(method);
        self.frame_base = base;

        let process = self.process().clone();
        vm_trace_method_entry!(
            self,
            &process.catalog().method_name(method),
            &process.catalog().method(method).signature.to_string()
        );
        let outcome = interpreter.run(self);
        vm_trace_method_exit!(self, &process.catalog().method_name(method));
        (self.pc, self.method, self.frame_base) = saved;

        match outcome {
            Ok(()) => {
                unpack_interpreter(&mut self.stack(), sig.ret, construct, result);
                self.stack().truncate(base);
                Ok(())
            }
            Err(Thrown) => {
                self.stack().truncate(base);
                Err(Fault::Thrown)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn invoke_native(
        &mut self,
        backend: &dyn NativeBackend,
        method: MethodId,
        sig: &ClassifiedSignature,
        construct: bool,
        this: ThisArg,
        source: &mut dyn ArgSource,
        result: ResultSlot<'_>,
    ) -> Result<(), Fault> {
        backend.compile(method)?;
        let process = self.process().clone();
        let owner = process.catalog().method(method).owner;

        // Ordinary constructors get their instance up front; array and string
        // constructors allocate their own and return it.
        let (this, ret_kind, instance) = if !construct {
            (this, sig.ret, None)
        } else if process.catalog().class(owner).is_array_or_string() {
            (ThisArg::Omitted, ParamKind::ClassRef, None)
        } else {
            let object = process.allocate_object(owner)?;
            (ThisArg::Explicit(object), sig.ret, Some(object))
        };

        let thread_in_signature = process.config().thread_in_signature;
        let Packer::NativePacker(mut packer) =
            Packer::for_convention(CallingConvention::Native, thread_in_signature)
        else {
            return Err(Fault::InvalidProgram("native packer expected".into()));
        };
        packer.pack(self, sig, construct, this, source)?;

        let mut ret = vec![0u8; ret_kind.native_size()];
        let previous = self.take_exception();
        vm_trace_method_entry!(
            self,
            &process.catalog().method_name(method),
            &process.catalog().method(method).signature.to_string()
        );
        packer.bind_thread(self as *mut ExecThread);
        let call = NativeCall {
            method,
            sig,
            thread_in_signature,
            has_this: sig.has_this && this != ThisArg::Omitted,
            args: packer.args(),
            ret_kind,
            ret: &mut ret,
        };
        let outcome = unsafe { backend.invoke(call) };
        vm_trace_method_exit!(self, &process.catalog().method_name(method));

        if self.has_exception() {
            return Err(Fault::Thrown);
        }
        self.restore_exception(previous);
        outcome?;

        match instance {
            Some(object) => deliver_value(ParamKind::ClassRef, ExecValue::Object(Some(object)), result),
            None => unpack_native(ret_kind, &ret, result),
        }
        Ok(())
    }

    fn invoke_virtual(
        &mut self,
        method: MethodId,
        source: &mut dyn ArgSource,
        result: ResultSlot<'_>,
    ) -> Result<(), Fault> {
        let process = self.process().clone();
        let receiver = source.next_object();
        if !process.catalog().method(method).signature.has_this {
            // a static target takes no `this`; the receiver is only checked
            receiver.ok_or(Fault::NullReference)?;
            return self.invoke(method, false, ThisArg::Omitted, source, result);
        }
        let target = process.resolve_virtual(method, receiver)?;
        let this = receiver.ok_or(Fault::NullReference)?;
        self.invoke(target, false, ThisArg::Explicit(this), source, result)
    }

    fn lookup(&self, type_name: &str, name: &str, signature: &MethodSignature) -> Result<MethodId, Fault> {
        let catalog = self.process().catalog();
        let class = catalog
            .find_class_by_name(type_name)
            .ok_or_else(|| Fault::TypeLoad(type_name.to_string()))?;
        catalog
            .find_method(class, name, signature)
            .ok_or_else(|| Fault::MissingMethod(format!("{type_name}::{name}{signature}")))
    }

    fn construct(&mut self, method: MethodId, source: &mut dyn ArgSource) -> Result<ObjectRef, Fault> {
        let process = self.process().clone();
        if !process.catalog().method(method).is_ctor() {
            return Err(Fault::InvalidProgram(format!(
                "{} is not a constructor",
                process.catalog().method_name(method)
            )));
        }
        let mut value = ExecValue::Empty;
        self.invoke(method, true, ThisArg::Omitted, source, ResultSlot::Boxed(&mut value))?;
        value.as_object().ok_or_else(|| {
            Fault::InvalidProgram(format!(
                "{} produced no object",
                process.catalog().method_name(method)
            ))
        })
    }

    fn find_ctor(&self, type_name: &str, params: &[Type]) -> Result<MethodId, Fault> {
        let process = self.process();
        let catalog = process.catalog();
        let class = catalog
            .find_class_by_name(type_name)
            .ok_or_else(|| Fault::TypeLoad(type_name.to_string()))?;
        process
            .ensure_layout(class)
            .map_err(|fault| Fault::TypeLoad(fault.to_string()))?;
        catalog
            .find_ctor(class, params)
            .ok_or_else(|| Fault::MissingMethod(format!("{type_name}::.ctor")))
    }

    /// Calls `method` directly. Instance methods take `this` as the first argument.
    pub fn call(&mut self, method: MethodId, result: ResultSlot<'_>, args: &[VaArg<'_>]) -> Result<(), Thrown> {
        let outcome = self.invoke(method, false, ThisArg::FromSource, &mut VaList::new(args), result);
        outcome.map_err(|f| self.signal(f))
    }

    pub fn call_v(&mut self, method: MethodId, result: ResultSlot<'_>, args: &[ExecValue]) -> Result<(), Thrown> {
        let outcome = self.invoke(method, false, ThisArg::FromSource, &mut ExecValues::new(args), result);
        outcome.map_err(|f| self.signal(f))
    }

    /// Dispatches on the runtime class of the first argument, which must not
    /// be null. For a static method that receiver is checked and then dropped.
    pub fn call_virtual(
        &mut self,
        method: MethodId,
        result: ResultSlot<'_>,
        args: &[VaArg<'_>],
    ) -> Result<(), Thrown> {
        let outcome = self.invoke_virtual(method, &mut VaList::new(args), result);
        outcome.map_err(|f| self.signal(f))
    }

    pub fn call_virtual_v(
        &mut self,
        method: MethodId,
        result: ResultSlot<'_>,
        args: &[ExecValue],
    ) -> Result<(), Thrown> {
        let outcome = self.invoke_virtual(method, &mut ExecValues::new(args), result);
        outcome.map_err(|f| self.signal(f))
    }

    /// Finds `type_name::name` with exactly `signature` and calls it.
    pub fn call_named(
        &mut self,
        type_name: &str,
        name: &str,
        signature: &MethodSignature,
        result: ResultSlot<'_>,
        args: &[VaArg<'_>],
    ) -> Result<(), Thrown> {
        let outcome = self
            .lookup(type_name, name, signature)
            .and_then(|m| self.invoke(m, false, ThisArg::FromSource, &mut VaList::new(args), result));
        outcome.map_err(|f| self.signal(f))
    }

    pub fn call_named_v(
        &mut self,
        type_name: &str,
        name: &str,
        signature: &MethodSignature,
        result: ResultSlot<'_>,
        args: &[ExecValue],
    ) -> Result<(), Thrown> {
        let outcome = self
            .lookup(type_name, name, signature)
            .and_then(|m| self.invoke(m, false, ThisArg::FromSource, &mut ExecValues::new(args), result));
        outcome.map_err(|f| self.signal(f))
    }

    pub fn call_named_virtual(
        &mut self,
        type_name: &str,
        name: &str,
        signature: &MethodSignature,
        result: ResultSlot<'_>,
        args: &[VaArg<'_>],
    ) -> Result<(), Thrown> {
        let outcome = self
            .lookup(type_name, name, signature)
            .and_then(|m| self.invoke_virtual(m, &mut VaList::new(args), result));
        outcome.map_err(|f| self.signal(f))
    }

    pub fn call_named_virtual_v(
        &mut self,
        type_name: &str,
        name: &str,
        signature: &MethodSignature,
        result: ResultSlot<'_>,
        args: &[ExecValue],
    ) -> Result<(), Thrown> {
        let outcome = self
            .lookup(type_name, name, signature)
            .and_then(|m| self.invoke_virtual(m, &mut ExecValues::new(args), result));
        outcome.map_err(|f| self.signal(f))
    }

    /// Allocates an instance of the constructor's class and runs `ctor` on it.
    pub fn call_ctor(&mut self, ctor: MethodId, args: &[VaArg<'_>]) -> Result<ObjectRef, Thrown> {
        let outcome = self.construct(ctor, &mut VaList::new(args));
        outcome.map_err(|f| self.signal(f))
    }

    pub fn call_ctor_v(&mut self, ctor: MethodId, args: &[ExecValue]) -> Result<ObjectRef, Thrown> {
        let outcome = self.construct(ctor, &mut ExecValues::new(args));
        outcome.map_err(|f| self.signal(f))
    }

    /// Creates a `type_name` through the constructor taking `params`.
    pub fn new_object(
        &mut self,
        type_name: &str,
        params: &[Type],
        args: &[VaArg<'_>],
    ) -> Result<ObjectRef, Thrown> {
        let outcome = self
            .find_ctor(type_name, params)
            .and_then(|ctor| self.construct(ctor, &mut VaList::new(args)));
        outcome.map_err(|f| self.signal(f))
    }

    pub fn new_object_v(
        &mut self,
        type_name: &str,
        params: &[Type],
        args: &[ExecValue],
    ) -> Result<ObjectRef, Thrown> {
        let outcome = self
            .find_ctor(type_name, params)
            .and_then(|ctor| self.construct(ctor, &mut ExecValues::new(args)));
        outcome.map_err(|f| self.signal(f))
    }
}
