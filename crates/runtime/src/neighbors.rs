//! Neighbor queries
//!
//! The host rebuilds the `neighbors` global each control step from the
//! range-and-bearing observations: `neighbors.data` maps a peer id to
//! `{distance, azimuth, elevation}`. Every operation here derives from
//! that table and persists nothing.
//!
//! `kin`/`nonkin` split the neighborhood by shared membership in the
//! active swarm, consulting the swarm-members table; `broadcast`,
//! `listen` and `ignore` are the topic-based messaging surface.

use buzz_core::heap::ObjRef;
use buzz_core::value::{TableKey, TypeTag, Value};

use crate::queues::OutMessage;
use crate::stdlib::{self, native};
use crate::vm::{BuzzFn, Vm, VmError, VmState};

/// Install the common neighbor-query methods on a fresh table.
fn make_table(vm: &mut Vm) -> ObjRef {
    let t = stdlib::new_table(vm);
    stdlib::add_method(vm, t, "get", nbr_get as BuzzFn);
    stdlib::add_method(vm, t, "kin", nbr_kin as BuzzFn);
    stdlib::add_method(vm, t, "nonkin", nbr_nonkin as BuzzFn);
    stdlib::add_method(vm, t, "foreach", nbr_foreach as BuzzFn);
    stdlib::add_method(vm, t, "map", nbr_map as BuzzFn);
    stdlib::add_method(vm, t, "reduce", nbr_reduce as BuzzFn);
    stdlib::add_method(vm, t, "filter", nbr_filter as BuzzFn);
    stdlib::add_method(vm, t, "count", nbr_count as BuzzFn);
    t
}

/// Rebuild the `neighbors` global with an empty data table.
pub(crate) fn reset(vm: &mut Vm) {
    let t = make_table(vm);
    stdlib::add_method(vm, t, "broadcast", nbr_broadcast as BuzzFn);
    stdlib::add_method(vm, t, "listen", nbr_listen as BuzzFn);
    stdlib::add_method(vm, t, "ignore", nbr_ignore as BuzzFn);
    vm.set_global("neighbors", t);
}

/// Record one observation in `neighbors.data`.
pub(crate) fn add(vm: &mut Vm, robot: u16, distance: f32, azimuth: f32, elevation: f32) {
    let Some(nbr) = vm.get_global("neighbors") else {
        return;
    };
    let data_key = TableKey::String(vm.string_register("data", true));
    let data = match vm.table_get(nbr, &data_key) {
        Some(d) => d,
        None => {
            let d = stdlib::new_table(vm);
            vm.table_bind(nbr, data_key.clone(), d);
            d
        }
    };
    let entry = stdlib::new_table(vm);
    stdlib::add_field(vm, entry, "distance", Value::Float(distance));
    stdlib::add_field(vm, entry, "azimuth", Value::Float(azimuth));
    stdlib::add_field(vm, entry, "elevation", Value::Float(elevation));
    vm.table_bind(data, TableKey::Int(robot as i32), entry);
}

/// Collect the receiver's `(peer id, entry)` pairs.
fn receiver_data(vm: &mut Vm) -> Result<Vec<(i32, ObjRef)>, VmError> {
    vm.lload(0)?;
    let t = vm.type_assert(1, TypeTag::Table)?;
    vm.pop()?;
    let data_key = TableKey::String(vm.string_register("data", true));
    let Some(data) = vm.table_get(t, &data_key) else {
        return Ok(Vec::new());
    };
    match vm.heap.get(data) {
        Value::Table(table) => Ok(table
            .iter()
            .filter_map(|(k, &v)| match k {
                TableKey::Int(rid) => Some((*rid, v)),
                _ => None,
            })
            .collect()),
        _ => Ok(Vec::new()),
    }
}

/// Build a derived neighbor table holding the given data pairs.
fn derived_table(vm: &mut Vm, pairs: &[(i32, ObjRef)]) -> ObjRef {
    let t = make_table(vm);
    let data = stdlib::new_table(vm);
    let data_key = TableKey::String(vm.string_register("data", true));
    vm.table_bind(t, data_key, data);
    for &(rid, entry) in pairs {
        vm.table_bind(data, TableKey::Int(rid), entry);
    }
    t
}

/// The swarm id to split kin from nonkin, honoring the optional
/// stack-position argument. Nil when no swarm context is active.
fn active_swarm(vm: &mut Vm) -> Result<Option<u16>, VmError> {
    if vm.swarmstack.is_empty() {
        return Ok(None);
    }
    let mut stackpos = 1usize;
    if vm.lnum() >= 1 {
        stackpos = stdlib::int_arg(vm, 1)?.max(1) as usize;
    }
    stackpos = stackpos.min(vm.swarmstack.len());
    Ok(Some(vm.swarmstack[vm.swarmstack.len() - stackpos]))
}

/// `neighbors.get(rid)`
fn nbr_get(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(1)?;
        let pairs = receiver_data(vm)?;
        let rid = stdlib::int_arg(vm, 1)?;
        match pairs.iter().find(|(r, _)| *r == rid) {
            Some(&(_, entry)) => vm.push(entry),
            None => {
                vm.push_nil();
            }
        };
        vm.ret1()
    })
}

/// `neighbors.kin()`: neighbors sharing the active swarm. Without a
/// swarm context every neighbor is kin.
fn nbr_kin(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        let pairs = receiver_data(vm)?;
        let kept: Vec<(i32, ObjRef)> = match active_swarm(vm)? {
            None => pairs,
            Some(swarm) => pairs
                .into_iter()
                .filter(|&(rid, _)| vm.swarm_members.is_member(rid as u16, swarm))
                .collect(),
        };
        let t = derived_table(vm, &kept);
        vm.push(t);
        vm.ret1()
    })
}

/// `neighbors.nonkin()`: neighbors not sharing the active swarm.
/// Without a swarm context the result is empty.
fn nbr_nonkin(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        let pairs = receiver_data(vm)?;
        let kept: Vec<(i32, ObjRef)> = match active_swarm(vm)? {
            None => Vec::new(),
            Some(swarm) => pairs
                .into_iter()
                .filter(|&(rid, _)| !vm.swarm_members.is_member(rid as u16, swarm))
                .collect(),
        };
        let t = derived_table(vm, &kept);
        vm.push(t);
        vm.ret1()
    })
}

/// `neighbors.foreach(closure)`: closure(rid, data) per neighbor.
fn nbr_foreach(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(1)?;
        let pairs = receiver_data(vm)?;
        vm.lload(1)?;
        let c = vm.type_assert(1, TypeTag::Closure)?;
        vm.pop()?;
        vm.heap.pin(c);
        for (rid, entry) in pairs {
            vm.push(c);
            vm.push_int(rid);
            vm.push(entry);
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

/// `neighbors.map(closure)`: a derived table of closure(rid, data)
/// results.
fn nbr_map(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(1)?;
        let pairs = receiver_data(vm)?;
        vm.lload(1)?;
        let c = vm.type_assert(1, TypeTag::Closure)?;
        vm.pop()?;
        // Results go straight into the (pinned) output table so they
        // survive the collections later calls may trigger.
        let out = derived_table(vm, &[]);
        vm.heap.pin(c);
        vm.heap.pin(out);
        let data_key = TableKey::String(vm.string_register("data", true));
        let data = vm.table_get(out, &data_key).expect("derived table has data");
        for (rid, entry) in pairs {
            vm.push(c);
            vm.push_int(rid);
            vm.push(entry);
            if vm.closure_call(2) != VmState::Ready {
                vm.heap.unpin(out);
                vm.heap.unpin(c);
                return Ok(());
            }
            let result = vm.stack_at(1)?;
            vm.pop()?;
            vm.table_bind(data, TableKey::Int(rid), result);
        }
        vm.heap.unpin(out);
        vm.heap.unpin(c);
        vm.push(out);
        vm.ret1()
    })
}

/// `neighbors.reduce(closure, accumulator)`: fold closure(rid, data,
/// accum) over the neighborhood.
fn nbr_reduce(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(2)?;
        let pairs = receiver_data(vm)?;
        vm.lload(1)?;
        let c = vm.type_assert(1, TypeTag::Closure)?;
        vm.pop()?;
        let mut accum = stdlib::arg(vm, 2)?;
        vm.heap.pin(c);
        for (rid, entry) in pairs {
            vm.push(c);
            vm.push_int(rid);
            vm.push(entry);
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

/// `neighbors.filter(closure)`: the neighbors for which closure(rid,
/// data) is truthy.
fn nbr_filter(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(1)?;
        let pairs = receiver_data(vm)?;
        vm.lload(1)?;
        let c = vm.type_assert(1, TypeTag::Closure)?;
        vm.pop()?;
        vm.heap.pin(c);
        let mut kept = Vec::new();
        for (rid, entry) in pairs {
            vm.push(c);
            vm.push_int(rid);
            vm.push(entry);
            if vm.closure_call(2) != VmState::Ready {
                vm.heap.unpin(c);
                return Ok(());
            }
            let verdict = vm.stack_at(1)?;
            let keep = vm.heap.get(verdict).is_truthy();
            vm.pop()?;
            if keep {
                kept.push((rid, entry));
            }
        }
        vm.heap.unpin(c);
        let t = derived_table(vm, &kept);
        vm.push(t);
        vm.ret1()
    })
}

fn nbr_count(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(0)?;
        let pairs = receiver_data(vm)?;
        vm.push_int(pairs.len() as i32);
        vm.ret1()
    })
}

/// `neighbors.broadcast(topic, value)`
fn nbr_broadcast(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(2)?;
        vm.lload(1)?;
        let t = vm.type_assert(1, TypeTag::String)?;
        vm.pop()?;
        let topic = match vm.heap.get(t) {
            Value::String(s) => s.clone(),
            _ => unreachable!("type asserted"),
        };
        let value = stdlib::arg(vm, 2)?;
        vm.outmsgs.append(OutMessage::Broadcast { topic, value });
        vm.ret0()
    })
}

/// `neighbors.listen(topic, closure)`
fn nbr_listen(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(2)?;
        vm.lload(1)?;
        let t = vm.type_assert(1, TypeTag::String)?;
        vm.pop()?;
        let sid = match vm.heap.get(t) {
            Value::String(s) => s.id,
            _ => unreachable!("type asserted"),
        };
        vm.lload(2)?;
        let c = vm.type_assert(1, TypeTag::Closure)?;
        vm.pop()?;
        vm.listeners.insert(sid, c);
        vm.ret0()
    })
}

/// `neighbors.ignore(topic)`
fn nbr_ignore(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(1)?;
        vm.lload(1)?;
        let t = vm.type_assert(1, TypeTag::String)?;
        vm.pop()?;
        let sid = match vm.heap.get(t) {
            Value::String(s) => s.id,
            _ => unreachable!("type asserted"),
        };
        vm.listeners.remove(&sid);
        vm.ret0()
    })
}
