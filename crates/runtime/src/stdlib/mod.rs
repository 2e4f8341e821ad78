//! Standard library
//!
//! Each library is a global table whose fields are foreign closures,
//! installed at bytecode load. The table methods receive their owning
//! table as `self` (slot 0), which is how `math.rng.uniform()` and
//! friends resolve.

use buzz_core::heap::ObjRef;
use buzz_core::value::{Closure, ClosureRef, Table, TableKey, TypeTag, Value};

use crate::vm::{BuzzFn, Vm, VmError, VmErrorKind, VmState};

pub mod io;
pub mod math;
pub mod object;
pub mod string_ops;

/// Run a fallible native-function body, converting an error into the
/// VM's error state.
pub fn native(vm: &mut Vm, body: impl FnOnce(&mut Vm) -> Result<(), VmError>) -> VmState {
    if let Err(e) = body(vm) {
        vm.set_error(e);
    }
    vm.state()
}

/// Install `f` as a method named `name` on table `t`. The store goes
/// through the table-put semantics, so the closure is bound to `t`.
pub(crate) fn add_method(vm: &mut Vm, t: ObjRef, name: &str, f: BuzzFn) {
    let istr = vm.string_register(name, true);
    let fid = vm.register_function(f);
    let nil = vm.heap.new_obj(Value::Nil);
    let c = vm
        .heap
        .new_obj(Value::Closure(Closure::new(ClosureRef::Foreign(fid), vec![nil])));
    vm.table_bind(t, TableKey::String(istr), c);
}

/// Install a plain value field on table `t`.
pub(crate) fn add_field(vm: &mut Vm, t: ObjRef, name: &str, v: Value) {
    let istr = vm.string_register(name, true);
    let r = vm.heap.new_obj(v);
    vm.table_bind(t, TableKey::String(istr), r);
}

/// Create an empty table object (not pushed).
pub(crate) fn new_table(vm: &mut Vm) -> ObjRef {
    vm.heap.new_obj(Value::Table(Table::new()))
}

/// Read the integer `id` field of the method receiver (slot 0); shared
/// by the swarm and stigmergy method sets.
pub(crate) fn receiver_id(vm: &mut Vm) -> Result<u16, VmError> {
    vm.lload(0)?;
    let t = vm.stack_at(1)?;
    vm.pop()?;
    let key = TableKey::String(vm.string_register("id", true));
    let id = vm
        .table_get(t, &key)
        .ok_or_else(|| VmError::new(VmErrorKind::TypeMismatch, "receiver has no id field"))?;
    match vm.heap.get(id) {
        Value::Int(i) => Ok(*i as u16),
        other => Err(VmError::type_mismatch(TypeTag::Int, other.type_tag())),
    }
}

/// Pop argument `idx` as a float, accepting ints.
pub(crate) fn float_arg(vm: &mut Vm, idx: usize) -> Result<f32, VmError> {
    vm.lload(idx)?;
    let r = vm.stack_at(1)?;
    vm.pop()?;
    match vm.heap.get(r) {
        Value::Int(i) => Ok(*i as f32),
        Value::Float(f) => Ok(*f),
        other => Err(VmError::new(
            VmErrorKind::TypeMismatch,
            format!("expected number, got {}", other.type_tag().desc()),
        )),
    }
}

/// Pop argument `idx` as an integer.
pub(crate) fn int_arg(vm: &mut Vm, idx: usize) -> Result<i32, VmError> {
    vm.lload(idx)?;
    let r = vm.stack_at(1)?;
    vm.pop()?;
    match vm.heap.get(r) {
        Value::Int(i) => Ok(*i),
        other => Err(VmError::type_mismatch(TypeTag::Int, other.type_tag())),
    }
}

/// Argument `idx` as a raw handle.
pub(crate) fn arg(vm: &mut Vm, idx: usize) -> Result<ObjRef, VmError> {
    vm.lload(idx)?;
    let r = vm.stack_at(1)?;
    vm.pop()?;
    Ok(r)
}

/// Install the whole standard library.
pub(crate) fn register_all(vm: &mut Vm) {
    object::register(vm);
    math::register(vm);
    io::register(vm);
    string_ops::register(vm);
}
