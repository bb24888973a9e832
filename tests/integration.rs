use dotnet_engine::{
    error::{Fault, Thrown},
    types::{CatalogBuilder, ClassId, MethodDef, MethodId, MethodSignature, Type},
    value::{ExecValue, VaArg},
    vm::{
        config::{CallingConvention, EngineConfig},
        exceptions::ExceptionKind,
        stack::Pc,
        unpack::ResultSlot,
        ExecThread, Executor, FfiBackend, Interpreter, NativeBackend, Process,
        ScriptedInterpreter,
    },
};
use std::{
    ffi::c_void,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

/// A catalog with one class of static helpers and a small class hierarchy.
pub struct TestCatalog {
    pub builder: CatalogBuilder,
    pub object: ClassId,
    pub calc: ClassId,
}

impl TestCatalog {
    pub fn new() -> Self {
        let mut builder = CatalogBuilder::new();
        let object = builder.object_class().unwrap();
        let calc = builder.define_class("Demo", "Calc", Some(object));
        Self {
            builder,
            object,
            calc,
        }
    }

    pub fn static_method(&mut self, name: &str, params: Vec<Type>, ret: Type) -> MethodId {
        self.builder
            .add_method(self.calc, MethodDef::new(name, MethodSignature::static_(params, ret)))
    }

    pub fn interpreted(self, interp: ScriptedInterpreter) -> Arc<Process> {
        Process::new(
            self.builder.build().unwrap(),
            Executor::Interpreter(Arc::new(interp)),
            EngineConfig::default(),
        )
        .unwrap()
    }

    pub fn native(self, backend: FfiBackend) -> Arc<Process> {
        let backend: Arc<dyn NativeBackend> = Arc::new(backend);
        Process::new(
            self.builder.build().unwrap(),
            Executor::Native(backend),
            EngineConfig::default().with_convention(CallingConvention::Native),
        )
        .unwrap()
    }
}

fn mix_params() -> Vec<Type> {
    vec![Type::i4(), Type::i8(), Type::r8()]
}

fn pending(thread: &ExecThread) -> Option<ExceptionKind> {
    thread.exception().map(|e| e.kind)
}

#[test]
fn test_mixed_primitives_interpreter() {
    let mut catalog = TestCatalog::new();
    let mix = catalog.static_method("Mix", mix_params(), Type::r8());
    let interp = ScriptedInterpreter::new();
    interp.define(mix, |act| {
        let sum = act.arg_i32(0) as f64 + act.arg_i64(1) as f64 + act.arg_f64(2);
        act.ret(ExecValue::Float(sum));
        Ok(())
    });
    let process = catalog.interpreted(interp);
    let mut thread = process.attach_thread();

    let mut result = ExecValue::Empty;
    thread
        .call(
            mix,
            ResultSlot::Boxed(&mut result),
            &[VaArg::Int(-1), VaArg::Long(1 << 40), VaArg::Double(0.5)],
        )
        .unwrap();
    assert_eq!(result, ExecValue::Float(-1.0 + (1u64 << 40) as f64 + 0.5));

    let mut direct = [0u8; 8];
    thread
        .call_v(
            mix,
            ResultSlot::Direct(&mut direct),
            &[ExecValue::Int32(2), ExecValue::Int64(3), ExecValue::Float(0.25)],
        )
        .unwrap();
    assert_eq!(f64::from_ne_bytes(direct), 5.25);
    assert_eq!(thread.stack().top(), 0);
    assert_eq!(thread.frames().depth(), 0);
    drop(thread);
    process.destroy();
}

extern "C" fn native_mix(_thread: *mut ExecThread, a: i32, b: i64, c: f64) -> f64 {
    a as f64 + b as f64 + c
}

#[test]
fn test_mixed_primitives_native() {
    let mut catalog = TestCatalog::new();
    let mix = catalog.static_method("Mix", mix_params(), Type::r8());
    let backend = FfiBackend::new();
    unsafe { backend.register(mix, native_mix as *const c_void) };
    let process = catalog.native(backend);
    let mut thread = process.attach_thread();

    let mut result = ExecValue::Empty;
    thread
        .call(
            mix,
            ResultSlot::Boxed(&mut result),
            &[VaArg::Int(4), VaArg::Long(5), VaArg::Double(0.5)],
        )
        .unwrap();
    assert_eq!(result, ExecValue::Float(9.5));
    drop(thread);
    process.destroy();
}

#[test]
fn test_narrow_return_written_at_declared_width() {
    let mut catalog = TestCatalog::new();
    let i2 = Type::Primitive(dotnet_engine::types::ElementType::I2);
    let negate = catalog.static_method("Negate", vec![i2.clone()], i2);
    let interp = ScriptedInterpreter::new();
    interp.define(negate, |act| {
        let v = act.arg_i32(0);
        act.ret(ExecValue::Int32(-v));
        Ok(())
    });
    let process = catalog.interpreted(interp);
    let mut thread = process.attach_thread();

    let mut out = [0xAAu8; 4];
    thread
        .call(negate, ResultSlot::Direct(&mut out[..2]), &[VaArg::Int(300)])
        .unwrap();
    assert_eq!(i16::from_ne_bytes([out[0], out[1]]), -300);
    assert_eq!(&out[2..], &[0xAA, 0xAA]);

    let mut boxed = ExecValue::Empty;
    thread
        .call(negate, ResultSlot::Boxed(&mut boxed), &[VaArg::Int(7)])
        .unwrap();
    assert_eq!(boxed, ExecValue::Int32(-7));
    drop(thread);
    process.destroy();
}

fn point_bytes(x: i64, y: i64) -> Vec<u8> {
    let mut bytes = x.to_ne_bytes().to_vec();
    bytes.extend_from_slice(&y.to_ne_bytes());
    bytes
}

fn point_catalog() -> (TestCatalog, MethodId) {
    let mut catalog = TestCatalog::new();
    let point = catalog.builder.define_value_type("Demo", "Point");
    catalog.builder.add_field(point, "x", Type::i8());
    catalog.builder.add_field(point, "y", Type::i8());
    let flip = catalog.static_method(
        "Flip",
        vec![Type::ValueType(point)],
        Type::ValueType(point),
    );
    (catalog, flip)
}

#[test]
fn test_value_type_round_trip_interpreter() {
    let (catalog, flip) = point_catalog();
    let interp = ScriptedInterpreter::new();
    interp.define(flip, |act| {
        let ExecValue::Struct(bytes) = act.arg(0) else {
            return Err(act.fault(Fault::InvalidProgram("expected a struct".into())));
        };
        let mut flipped = bytes[8..].to_vec();
        flipped.extend_from_slice(&bytes[..8]);
        act.ret(ExecValue::Struct(flipped));
        Ok(())
    });
    let process = catalog.interpreted(interp);
    let mut thread = process.attach_thread();

    let input = point_bytes(1, 2);
    let mut out = [0u8; 16];
    thread
        .call(flip, ResultSlot::Direct(&mut out), &[VaArg::Struct(&input)])
        .unwrap();
    assert_eq!(out.to_vec(), point_bytes(2, 1));
    drop(thread);
    process.destroy();
}

extern "C" fn native_flip(_thread: *mut ExecThread, point: *const [i64; 2], out: *mut [i64; 2]) {
    unsafe {
        let [x, y] = point.read_unaligned();
        out.write_unaligned([y, x]);
    }
}

#[test]
fn test_value_type_round_trip_native() {
    let (catalog, flip) = point_catalog();
    let backend = FfiBackend::new();
    unsafe { backend.register(flip, native_flip as *const c_void) };
    let process = catalog.native(backend);
    let mut thread = process.attach_thread();

    let mut result = ExecValue::Empty;
    thread
        .call_v(
            flip,
            ResultSlot::Boxed(&mut result),
            &[ExecValue::Struct(point_bytes(10, -4))],
        )
        .unwrap();
    assert_eq!(result, ExecValue::Struct(point_bytes(-4, 10)));
    drop(thread);
    process.destroy();
}

#[test]
fn test_value_type_needs_a_payload_interpreter() {
    let (catalog, flip) = point_catalog();
    let entered = Arc::new(AtomicUsize::new(0));
    let counter = entered.clone();
    let interp = ScriptedInterpreter::new();
    interp.define(flip, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let process = catalog.interpreted(interp);
    let mut thread = process.attach_thread();

    let mut raw = point_bytes(1, 2);
    assert!(thread
        .call(flip, ResultSlot::Discard, &[VaArg::Ptr(raw.as_mut_ptr())])
        .is_err());
    assert_eq!(pending(&thread), Some(ExceptionKind::InvalidProgram));
    assert_eq!(thread.stack().top(), 0);

    let short = [0u8; 4];
    assert!(thread
        .call(flip, ResultSlot::Discard, &[VaArg::Struct(&short)])
        .is_err());
    assert_eq!(pending(&thread), Some(ExceptionKind::InvalidProgram));
    assert_eq!(thread.stack().top(), 0);
    assert_eq!(thread.frames().depth(), 0);
    assert_eq!(entered.load(Ordering::SeqCst), 0);
    drop(thread);
    process.destroy();
}

#[test]
fn test_value_type_needs_a_payload_native() {
    let (catalog, flip) = point_catalog();
    let backend = FfiBackend::new();
    unsafe { backend.register(flip, native_flip as *const c_void) };
    let process = catalog.native(backend);
    let mut thread = process.attach_thread();

    let mut result = ExecValue::Empty;
    assert!(thread
        .call_v(flip, ResultSlot::Boxed(&mut result), &[ExecValue::Int64(10)])
        .is_err());
    assert_eq!(pending(&thread), Some(ExceptionKind::InvalidProgram));
    assert_eq!(result, ExecValue::Empty);
    drop(thread);
    process.destroy();
}

/// Hands out entries closer to zero than its constructor prologue.
struct LowEntryInterpreter {
    runs: AtomicUsize,
}

impl Interpreter for LowEntryInterpreter {
    fn convert_method(&self, _: &mut ExecThread, _: MethodId) -> Result<Pc, Thrown> {
        Ok(2)
    }

    fn ctor_offset(&self) -> Pc {
        4
    }

    fn run(&self, _: &mut ExecThread) -> Result<(), Thrown> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn test_ctor_entry_below_prologue_is_invalid() {
    let (catalog, _, ctor) = counter_catalog();
    let interp = Arc::new(LowEntryInterpreter {
        runs: AtomicUsize::new(0),
    });
    let process = Process::new(
        catalog.builder.build().unwrap(),
        Executor::Interpreter(interp.clone()),
        EngineConfig::default(),
    )
    .unwrap();
    let mut thread = process.attach_thread();

    assert!(thread.call_ctor(ctor, &[VaArg::Long(1)]).is_err());
    assert_eq!(pending(&thread), Some(ExceptionKind::InvalidProgram));
    assert_eq!(interp.runs.load(Ordering::SeqCst), 0);
    assert_eq!(thread.stack().top(), 0);
    assert_eq!(thread.frames().depth(), 0);
    drop(thread);
    process.destroy();
}

struct Hierarchy {
    base: ClassId,
    leaf: ClassId,
    base_name: MethodId,
}

fn hierarchy(catalog: &mut TestCatalog, interp: &ScriptedInterpreter) -> Hierarchy {
    let name_sig = MethodSignature::instance(vec![], Type::i4());
    let b = &mut catalog.builder;
    let base = b.define_class("Demo", "Base", Some(catalog.object));
    let base_name = b.add_method(base, MethodDef::new("Name", name_sig.clone()).virtual_());
    let mid = b.define_class("Demo", "Mid", Some(base));
    let mid_name = b.add_method(mid, MethodDef::new("Name", name_sig).virtual_());
    let leaf = b.define_class("Demo", "Leaf", Some(mid));
    interp.define(base_name, |act| {
        act.ret(ExecValue::Int32(1));
        Ok(())
    });
    interp.define(mid_name, |act| {
        act.ret(ExecValue::Int32(2));
        Ok(())
    });
    Hierarchy {
        base,
        leaf,
        base_name,
    }
}

#[test]
fn test_virtual_call_reaches_nearest_override() {
    let mut catalog = TestCatalog::new();
    let interp = ScriptedInterpreter::new();
    let h = hierarchy(&mut catalog, &interp);
    let process = catalog.interpreted(interp);
    let mut thread = process.attach_thread();

    let leaf = thread.alloc_object(h.leaf).unwrap();
    let base = thread.alloc_object(h.base).unwrap();
    let name_of = |thread: &mut ExecThread, obj, virtual_call: bool| {
        let mut v = ExecValue::Empty;
        let args = [ExecValue::Object(Some(obj))];
        let outcome = if virtual_call {
            thread.call_virtual_v(h.base_name, ResultSlot::Boxed(&mut v), &args)
        } else {
            thread.call_v(h.base_name, ResultSlot::Boxed(&mut v), &args)
        };
        outcome.unwrap();
        v.as_i32().unwrap()
    };

    assert_eq!(name_of(&mut thread, leaf, true), 2);
    assert_eq!(name_of(&mut thread, base, true), 1);
    // A direct call skips dispatch.
    assert_eq!(name_of(&mut thread, leaf, false), 1);
    assert_eq!(name_of(&mut thread, leaf, true), 2);
    assert_eq!(
        process.metrics().dispatch_cache_hits.load(Ordering::Relaxed),
        1
    );
    drop(thread);
    process.destroy();
}

#[test]
fn test_named_virtual_call() {
    let mut catalog = TestCatalog::new();
    let interp = ScriptedInterpreter::new();
    let h = hierarchy(&mut catalog, &interp);
    let process = catalog.interpreted(interp);
    let mut thread = process.attach_thread();

    let leaf = thread.alloc_object(h.leaf).unwrap();
    let sig = MethodSignature::instance(vec![], Type::i4());
    let mut v = ExecValue::Empty;
    thread
        .call_named_virtual(
            "Demo.Base",
            "Name",
            &sig,
            ResultSlot::Boxed(&mut v),
            &[VaArg::Object(Some(leaf))],
        )
        .unwrap();
    assert_eq!(v, ExecValue::Int32(2));

    assert!(thread
        .call_named("Demo.Base", "Missing", &sig, ResultSlot::Discard, &[VaArg::Object(Some(leaf))])
        .is_err());
    assert_eq!(pending(&thread), Some(ExceptionKind::MissingMethod));

    assert!(thread
        .call_named_v("Demo.Nowhere", "Name", &sig, ResultSlot::Discard, &[])
        .is_err());
    assert_eq!(pending(&thread), Some(ExceptionKind::TypeLoad));
    drop(thread);
    process.destroy();
}

#[test]
fn test_interface_call_and_abstract_entry() {
    let mut catalog = TestCatalog::new();
    let sig = MethodSignature::instance(vec![], Type::i4());
    let b = &mut catalog.builder;
    let iface = b.define_interface("Demo", "IGreeter");
    let greet = b.add_method(iface, MethodDef::new("Greet", sig.clone()).abstract_());
    let wave = b.add_method(iface, MethodDef::new("Wave", sig.clone()).abstract_());
    let greeter = b.define_class("Demo", "Greeter", Some(catalog.object));
    b.add_interface(greeter, iface);
    let impl_greet = b.add_method(greeter, MethodDef::new("Greet", sig).virtual_());
    let interp = ScriptedInterpreter::new();
    interp.define(impl_greet, |act| {
        act.ret(ExecValue::Int32(42));
        Ok(())
    });
    let process = catalog.interpreted(interp);
    let mut thread = process.attach_thread();

    let obj = thread.alloc_object(greeter).unwrap();
    let mut v = ExecValue::Empty;
    thread
        .call_virtual(greet, ResultSlot::Boxed(&mut v), &[VaArg::Object(Some(obj))])
        .unwrap();
    assert_eq!(v, ExecValue::Int32(42));

    assert!(thread
        .call_virtual(wave, ResultSlot::Discard, &[VaArg::Object(Some(obj))])
        .is_err());
    assert_eq!(pending(&thread), Some(ExceptionKind::MissingMethod));
    drop(thread);
    process.destroy();
}

#[test]
fn test_null_receiver_never_reaches_body() {
    let mut catalog = TestCatalog::new();
    let sig = MethodSignature::instance(vec![], Type::Void);
    let b = &mut catalog.builder;
    let iface = b.define_interface("Demo", "IRunner");
    let run = b.add_method(iface, MethodDef::new("Run", sig.clone()).abstract_());
    let runner = b.define_class("Demo", "Runner", Some(catalog.object));
    b.add_interface(runner, iface);
    let impl_run = b.add_method(runner, MethodDef::new("Run", sig).virtual_());
    let entered = Arc::new(AtomicUsize::new(0));
    let counter = entered.clone();
    let interp = ScriptedInterpreter::new();
    interp.define(impl_run, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let process = catalog.interpreted(interp);
    let mut thread = process.attach_thread();

    assert!(thread
        .call_virtual(run, ResultSlot::Discard, &[VaArg::Object(None)])
        .is_err());
    assert_eq!(pending(&thread), Some(ExceptionKind::NullReference));
    assert_eq!(entered.load(Ordering::SeqCst), 0);
    assert_eq!(thread.stack().top(), 0);
    drop(thread);
    process.destroy();
}

#[test]
fn test_static_target_still_checks_receiver() {
    let mut catalog = TestCatalog::new();
    let helper = catalog.static_method("Helper", vec![Type::i4()], Type::i4());
    let entered = Arc::new(AtomicUsize::new(0));
    let counter = entered.clone();
    let interp = ScriptedInterpreter::new();
    interp.define(helper, move |act| {
        counter.fetch_add(1, Ordering::SeqCst);
        let doubled = act.arg_i32(0) * 2;
        act.ret(ExecValue::Int32(doubled));
        Ok(())
    });
    let object = catalog.object;
    let process = catalog.interpreted(interp);
    let mut thread = process.attach_thread();

    assert!(thread
        .call_virtual(helper, ResultSlot::Discard, &[VaArg::Object(None), VaArg::Int(3)])
        .is_err());
    assert_eq!(pending(&thread), Some(ExceptionKind::NullReference));
    assert_eq!(entered.load(Ordering::SeqCst), 0);
    assert_eq!(thread.stack().top(), 0);

    let receiver = process.allocate_object(object).unwrap();
    let mut result = ExecValue::Empty;
    thread
        .call_virtual(
            helper,
            ResultSlot::Boxed(&mut result),
            &[VaArg::Object(Some(receiver)), VaArg::Int(3)],
        )
        .unwrap();
    assert_eq!(result, ExecValue::Int32(6));
    assert_eq!(entered.load(Ordering::SeqCst), 1);
    drop(thread);
    process.destroy();
}

fn counter_catalog() -> (TestCatalog, ClassId, MethodId) {
    let mut catalog = TestCatalog::new();
    let counter = catalog
        .builder
        .define_class("Demo", "Counter", Some(catalog.object));
    catalog.builder.add_field(counter, "count", Type::i8());
    let ctor = catalog
        .builder
        .add_method(counter, MethodDef::ctor(vec![Type::i8()]));
    (catalog, counter, ctor)
}

#[test]
fn test_constructors_interpreter() {
    let (catalog, counter, ctor) = counter_catalog();
    let interp = ScriptedInterpreter::new();
    interp.define(ctor, |act| {
        let (this, start) = (act.this(), act.arg_i64(0));
        let Some(this) = this else {
            return Err(act.fault(Fault::NullReference));
        };
        let stored = act.process().store_field(this, "count", start as usize);
        stored.map_err(|f| act.fault(f))
    });
    let process = catalog.interpreted(interp);
    let mut thread = process.attach_thread();

    let a = thread.call_ctor(ctor, &[VaArg::Long(7)]).unwrap();
    assert_eq!(process.class_of(a), Ok(counter));
    assert_eq!(process.load_field(a, "count"), Ok(7));

    let b = thread
        .new_object_v("Demo.Counter", &[Type::i8()], &[ExecValue::Int64(11)])
        .unwrap();
    assert_ne!(a, b);
    assert_eq!(process.load_field(b, "count"), Ok(11));
    assert_eq!(thread.stack().top(), 0);

    assert!(thread.new_object("Demo.Counter", &[], &[]).is_err());
    assert_eq!(pending(&thread), Some(ExceptionKind::MissingMethod));
    assert!(thread.new_object("Demo.Absent", &[], &[]).is_err());
    assert_eq!(pending(&thread), Some(ExceptionKind::TypeLoad));
    drop(thread);
    process.destroy();
}

extern "C" fn native_counter_ctor(thread: *mut ExecThread, this: usize, start: i64) {
    let thread = unsafe { &mut *thread };
    let this = dotnet_engine::value::ObjectRef::from_word(this).unwrap();
    thread
        .process()
        .store_field(this, "count", start as usize)
        .unwrap();
}

#[test]
fn test_constructors_native() {
    let (catalog, _, ctor) = counter_catalog();
    let backend = FfiBackend::new();
    unsafe { backend.register(ctor, native_counter_ctor as *const c_void) };
    let process = catalog.native(backend);
    let mut thread = process.attach_thread();

    let obj = thread.call_ctor_v(ctor, &[ExecValue::Int64(-3)]).unwrap();
    assert_eq!(process.load_field(obj, "count"), Ok(-3i64 as usize));
    drop(thread);
    process.destroy();
}

extern "C" fn native_raise(thread: *mut ExecThread) {
    let thread = unsafe { &mut *thread };
    thread.raise(ExceptionKind::InvalidProgram, Some("raised natively".into()));
}

#[test]
fn test_native_raise_is_reported() {
    let mut catalog = TestCatalog::new();
    let raise = catalog.static_method("Raise", vec![], Type::Void);
    let backend = FfiBackend::new();
    unsafe { backend.register(raise, native_raise as *const c_void) };
    let process = catalog.native(backend);
    let mut thread = process.attach_thread();

    assert!(thread.call(raise, ResultSlot::Discard, &[]).is_err());
    let exception = thread.take_exception().unwrap();
    assert_eq!(exception.kind, ExceptionKind::InvalidProgram);
    assert_eq!(exception.message.as_deref(), Some("raised natively"));
    drop(thread);
    process.destroy();
}

#[test]
fn test_managed_throw_unwinds_frames() {
    let mut catalog = TestCatalog::new();
    let fail = catalog.static_method("Fail", vec![Type::i4()], Type::i4());
    let exception = catalog.builder.find_class("System", "Exception").unwrap();
    let interp = ScriptedInterpreter::new();
    interp.define(fail, move |act| {
        let thrown = act.process().allocate_object(exception);
        match thrown {
            Ok(object) => Err(act.throw(Some(object))),
            Err(fault) => Err(act.fault(fault)),
        }
    });
    let process = catalog.interpreted(interp);
    let mut thread = process.attach_thread();

    assert!(thread.call(fail, ResultSlot::Discard, &[VaArg::Int(1)]).is_err());
    let thrown = thread.exception().unwrap();
    assert_eq!(thrown.kind, ExceptionKind::Managed);
    assert_eq!(
        thrown.object.map(|o| process.class_of(o)),
        Some(Ok(exception))
    );
    assert_eq!(thread.stack().top(), 0);
    assert_eq!(thread.frames().depth(), 0);
    drop(thread);
    process.destroy();
}

#[test]
fn test_runaway_recursion_overflows() {
    let mut catalog = TestCatalog::new();
    let recurse = catalog.static_method("Recurse", vec![], Type::Void);
    let interp = ScriptedInterpreter::new();
    interp.define(recurse, move |act| {
        act.thread().call(recurse, ResultSlot::Discard, &[])
    });
    let config = EngineConfig {
        initial_frames: 2,
        max_frames: 16,
        ..EngineConfig::default()
    };
    let process = Process::new(
        catalog.builder.build().unwrap(),
        Executor::Interpreter(Arc::new(interp)),
        config,
    )
    .unwrap();
    let mut thread = process.attach_thread();

    assert!(thread.call(recurse, ResultSlot::Discard, &[]).is_err());
    assert_eq!(pending(&thread), Some(ExceptionKind::StackOverflow));
    assert_eq!(thread.frames().depth(), 0);
    assert!(thread.frames().overflow_allocations() > 0);
    drop(thread);
    process.destroy();
}
