//! The `demo` subcommand: a shape hierarchy driven through both dispatch paths
//! and one finalization cycle, under either calling convention.
use crate::{
    error::{EngineError, Fault, Thrown},
    types::{Catalog, CatalogBuilder, MethodDef, MethodId, MethodSignature, Type},
    value::{ExecValue, ObjectRef},
    vm::{
        config::{CallingConvention, EngineConfig},
        unpack::ResultSlot,
        Activation, ExecThread, Executor, FfiBackend, NativeBackend, Process, ScriptedInterpreter,
    },
};
use std::{
    ffi::c_void,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DemoError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("{0}")]
    Managed(String),
}

/// What the demo observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoReport {
    pub virtual_area: i64,
    pub interface_area: i64,
    pub finalized: usize,
}

struct Shapes {
    shape_ctor: MethodId,
    shape_area: MethodId,
    square_ctor: MethodId,
    square_area: MethodId,
    iface_area: MethodId,
    resource_ctor: MethodId,
    resource_finalize: MethodId,
}

fn build_catalog() -> Result<(Catalog, Shapes), EngineError> {
    let mut b = CatalogBuilder::new();
    let object = b
        .object_class()
        .ok_or_else(|| EngineError::MissingBootstrapClass("System.Object".into()))?;
    let area_sig = MethodSignature::instance(vec![], Type::i8());

    let ishape = b.define_interface("Demo", "IShape");
    let iface_area = b.add_method(ishape, MethodDef::new("Area", area_sig.clone()).abstract_());

    let shape = b.define_class("Demo", "Shape", Some(object));
    b.add_field(shape, "side", Type::i8());
    b.add_interface(shape, ishape);
    let shape_ctor = b.add_method(shape, MethodDef::ctor(vec![Type::i8()]));
    let shape_area = b.add_method(shape, MethodDef::new("Area", area_sig.clone()).virtual_());

    let square = b.define_class("Demo", "Square", Some(shape));
    let square_ctor = b.add_method(square, MethodDef::ctor(vec![Type::i8()]));
    let square_area = b.add_method(square, MethodDef::new("Area", area_sig).virtual_());

    let resource = b.define_class("Demo", "Resource", Some(object));
    let resource_ctor = b.add_method(resource, MethodDef::ctor(vec![]));
    let resource_finalize = b.add_method(
        resource,
        MethodDef::new("Finalize", MethodSignature::instance(vec![], Type::Void)).virtual_(),
    );

    let shapes = Shapes {
        shape_ctor,
        shape_area,
        square_ctor,
        square_area,
        iface_area,
        resource_ctor,
        resource_finalize,
    };
    Ok((b.build()?, shapes))
}

fn store_side(activation: &mut Activation<'_>) -> Result<(), Thrown> {
    let (Some(this), side) = (activation.this(), activation.arg_i64(0)) else {
        return Err(activation.fault(Fault::NullReference));
    };
    let stored = activation.process().store_field(this, "side", side as usize);
    stored.map_err(|f| activation.fault(f))
}

fn squared_side(activation: &mut Activation<'_>) -> Result<(), Thrown> {
    let this = activation.this().ok_or(Fault::NullReference);
    let side = this.and_then(|this| activation.process().load_field(this, "side"));
    match side {
        Ok(side) => {
            let side = side as i64;
            activation.ret(ExecValue::Int64(side * side));
            Ok(())
        }
        Err(fault) => Err(activation.fault(fault)),
    }
}

fn interpreter(shapes: &Shapes, finalized: Arc<AtomicUsize>) -> Executor {
    let interp = ScriptedInterpreter::new();
    interp.define(shapes.shape_ctor, store_side);
    interp.define(shapes.square_ctor, store_side);
    interp.define(shapes.shape_area, |act| {
        act.ret(ExecValue::Int64(0));
        Ok(())
    });
    interp.define(shapes.square_area, squared_side);
    interp.define(shapes.resource_finalize, move |_| {
        finalized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    Executor::Interpreter(Arc::new(interp))
}

static NATIVE_FINALIZED: AtomicUsize = AtomicUsize::new(0);

extern "C" fn native_store_side(thread: *mut ExecThread, this: usize, side: i64) {
    // SAFETY: the engine passes the thread that is making this call.
    let thread = unsafe { &mut *thread };
    let stored = ObjectRef::from_word(this)
        .ok_or(Fault::NullReference)
        .and_then(|this| thread.process().store_field(this, "side", side as usize));
    if let Err(fault) = stored {
        thread.signal(fault);
    }
}

extern "C" fn native_zero_area(_thread: *mut ExecThread, _this: usize) -> i64 {
    0
}

extern "C" fn native_square_area(thread: *mut ExecThread, this: usize) -> i64 {
    // SAFETY: as above.
    let thread = unsafe { &mut *thread };
    let side = ObjectRef::from_word(this)
        .ok_or(Fault::NullReference)
        .and_then(|this| thread.process().load_field(this, "side"));
    match side {
        Ok(side) => (side as i64) * (side as i64),
        Err(fault) => {
            thread.signal(fault);
            0
        }
    }
}

extern "C" fn native_resource_ctor(_thread: *mut ExecThread, _this: usize) {}

extern "C" fn native_finalize(_thread: *mut ExecThread, _this: usize) {
    NATIVE_FINALIZED.fetch_add(1, Ordering::SeqCst);
}

fn native(shapes: &Shapes) -> Executor {
    let backend = FfiBackend::new();
    let entries: [(MethodId, *const c_void); 6] = [
        (shapes.shape_ctor, native_store_side as *const c_void),
        (shapes.square_ctor, native_store_side as *const c_void),
        (shapes.shape_area, native_zero_area as *const c_void),
        (shapes.square_area, native_square_area as *const c_void),
        (shapes.resource_ctor, native_resource_ctor as *const c_void),
        (shapes.resource_finalize, native_finalize as *const c_void),
    ];
    for (method, entry) in entries {
        // SAFETY: every entry takes the thread, `this` and the declared
        // parameters in the widths the backend passes them.
        unsafe { backend.register(method, entry) };
    }
    Executor::Native(Arc::new(backend) as Arc<dyn NativeBackend>)
}

fn managed_error(thread: &mut ExecThread) -> DemoError {
    DemoError::Managed(
        thread
            .take_exception()
            .map_or_else(|| "unknown managed exception".to_string(), |e| e.to_string()),
    )
}

fn area(thread: &mut ExecThread, method: MethodId, object: ObjectRef) -> Result<i64, DemoError> {
    let mut value = ExecValue::Empty;
    thread
        .call_virtual_v(method, ResultSlot::Boxed(&mut value), &[ExecValue::Object(Some(object))])
        .map_err(|Thrown| managed_error(thread))?;
    Ok(value.as_i64().unwrap_or_default())
}

fn exercise(thread: &mut ExecThread, shapes: &Shapes) -> Result<(i64, i64), DemoError> {
    let square = thread
        .new_object_v("Demo.Square", &[Type::i8()], &[ExecValue::Int64(3)])
        .map_err(|Thrown| managed_error(thread))?;
    let virtual_area = area(thread, shapes.shape_area, square)?;
    let interface_area = area(thread, shapes.iface_area, square)?;
    println!("Shape::Area on a Square (virtual):    {virtual_area}");
    println!("IShape::Area on a Square (interface): {interface_area}");

    // Unrooted once this returns; the next collection finalizes it.
    let object = thread
        .call_ctor_v(shapes.resource_ctor, &[])
        .map_err(|Thrown| managed_error(thread))?;
    println!("allocated finalizable {object:?}");
    Ok((virtual_area, interface_area))
}

/// Runs the demo under `config` and prints what happened.
pub fn run(config: EngineConfig) -> Result<DemoReport, DemoError> {
    let (catalog, shapes) = build_catalog()?;

    let finalized = Arc::new(AtomicUsize::new(0));
    let executor = match config.convention {
        CallingConvention::Interpreter => interpreter(&shapes, finalized.clone()),
        CallingConvention::Native => {
            NATIVE_FINALIZED.store(0, Ordering::SeqCst);
            native(&shapes)
        }
    };
    println!(
        "convention: {:?}, lock mode: {:?}",
        config.convention, config.lock_mode
    );

    let process = Process::new(catalog, executor, config)?;
    let mut thread = process.attach_thread();
    let binding = thread.bind();

    let (virtual_area, interface_area) = exercise(&mut thread, &shapes)?;
    let ran = thread.collect();
    let finalized = match process.config().convention {
        CallingConvention::Interpreter => finalized.load(Ordering::SeqCst),
        CallingConvention::Native => NATIVE_FINALIZED.load(Ordering::SeqCst),
    };
    println!("finalizers run by collect: {ran} (Finalize bodies entered: {finalized})");
    println!("heap after collect: {} bytes", thread.get_total_memory(false));
    println!("{}", process.metrics());

    drop(binding);
    drop(thread);
    process.destroy();

    Ok(DemoReport {
        virtual_area,
        interface_area,
        finalized,
    })
}
