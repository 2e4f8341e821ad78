//! Object methods
//!
//! The type-agnostic global functions: `type`, `clone`, `size`, and the
//! functional table traversals `foreach`, `map`, `reduce`. These are
//! globals rather than table methods, mirroring how scripts use them:
//! `foreach(t, function(k, v) { ... })`.

use buzz_core::heap::ObjRef;
use buzz_core::value::{Closure, ClosureRef, TableKey, TypeTag, Value};

use crate::stdlib::{self, native};
use crate::vm::{BuzzFn, Vm, VmError, VmState};

pub(crate) fn register(vm: &mut Vm) {
    register_global_fn(vm, "type", obj_type as BuzzFn);
    register_global_fn(vm, "clone", obj_clone as BuzzFn);
    register_global_fn(vm, "size", obj_size as BuzzFn);
    register_global_fn(vm, "foreach", obj_foreach as BuzzFn);
    register_global_fn(vm, "map", obj_map as BuzzFn);
    register_global_fn(vm, "reduce", obj_reduce as BuzzFn);
}

fn register_global_fn(vm: &mut Vm, name: &str, f: BuzzFn) {
    let fid = vm.register_function(f);
    let nil = vm.heap.new_obj(Value::Nil);
    let c = vm
        .heap
        .new_obj(Value::Closure(Closure::new(ClosureRef::Foreign(fid), vec![nil])));
    vm.set_global(name, c);
}

/// `type(v)`: the value's type name as a string.
fn obj_type(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(1)?;
        let r = stdlib::arg(vm, 1)?;
        let name = vm.heap.get(r).type_tag().desc();
        let istr = vm.string_register(name, false);
        vm.push_string(istr);
        vm.ret1()
    })
}

/// `clone(v)`: deep copy of tables and closures, identity for the rest.
fn obj_clone(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(1)?;
        let r = stdlib::arg(vm, 1)?;
        let copy = vm.heap.deep_clone(r);
        vm.push(copy);
        vm.ret1()
    })
}

/// `size(t)`: number of table entries.
fn obj_size(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(1)?;
        vm.lload(1)?;
        let t = vm.type_assert(1, TypeTag::Table)?;
        vm.pop()?;
        let size = match vm.heap.get(t) {
            Value::Table(table) => table.len(),
            _ => unreachable!("type asserted"),
        };
        vm.push_int(size as i32);
        vm.ret1()
    })
}

/// Snapshot a table's pairs so closures can mutate it while iterating.
fn table_pairs(vm: &mut Vm, idx: usize) -> Result<Vec<(TableKey, ObjRef)>, VmError> {
    vm.lload(idx)?;
    let t = vm.type_assert(1, TypeTag::Table)?;
    vm.pop()?;
    match vm.heap.get(t) {
        Value::Table(table) => Ok(table.iter().map(|(k, &v)| (k.clone(), v)).collect()),
        _ => unreachable!("type asserted"),
    }
}

fn closure_arg(vm: &mut Vm, idx: usize) -> Result<ObjRef, VmError> {
    vm.lload(idx)?;
    let c = vm.type_assert(1, TypeTag::Closure)?;
    vm.pop()?;
    Ok(c)
}

/// `foreach(t, closure)`: closure(key, value) per entry.
fn obj_foreach(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(2)?;
        let pairs = table_pairs(vm, 1)?;
        let c = closure_arg(vm, 2)?;
        // The closure must survive the collections its own calls trigger.
        vm.heap.pin(c);
        for (key, value) in pairs {
            vm.push(c);
            let k = key.to_value();
            let k = vm.heap.new_obj(k);
            vm.push(k);
            vm.push(value);
            if vm.closure_call(2) != VmState::Ready {
                vm.heap.unpin(c);
                return Ok(());
            }
            vm.pop()?;
        }
        vm.heap.unpin(c);
        vm.ret0()
    })
}

/// `map(t, closure)`: a new table of closure(key, value) results under
/// the same keys.
fn obj_map(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(2)?;
        let pairs = table_pairs(vm, 1)?;
        let c = closure_arg(vm, 2)?;
        let out = stdlib::new_table(vm);
        // Both must survive the collections the calls may trigger.
        vm.heap.pin(c);
        vm.heap.pin(out);
        for (key, value) in pairs {
            vm.push(c);
            let k = key.to_value();
            let k = vm.heap.new_obj(k);
            vm.push(k);
            vm.push(value);
            if vm.closure_call(2) != VmState::Ready {
                vm.heap.unpin(out);
                vm.heap.unpin(c);
                return Ok(());
            }
            let mapped = vm.stack_at(1)?;
            vm.pop()?;
            vm.table_bind(out, key, mapped);
        }
        vm.heap.unpin(out);
        vm.heap.unpin(c);
        vm.push(out);
        vm.ret1()
    })
}

/// `reduce(t, closure, accumulator)`: fold closure(key, value, accum).
fn obj_reduce(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(3)?;
        let pairs = table_pairs(vm, 1)?;
        let c = closure_arg(vm, 2)?;
        let mut accum = stdlib::arg(vm, 3)?;
        vm.heap.pin(c);
        for (key, value) in pairs {
            vm.push(c);
            let k = key.to_value();
            let k = vm.heap.new_obj(k);
            vm.push(k);
            vm.push(value);
            vm.push(accum);
            if vm.closure_call(3) != VmState::Ready {
                vm.heap.unpin(c);
                return Ok(());
            }
            accum = vm.stack_at(1)?;
            vm.pop()?;
        }
        vm.heap.unpin(c);
        vm.push(accum);
        vm.ret1()
    })
}
