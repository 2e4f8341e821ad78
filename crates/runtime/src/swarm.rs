//! Swarm runtime
//!
//! A swarm is a 16-bit-tagged subset of the robot population. Membership
//! is a purely local boolean per VM; joins and leaves are announced to
//! the neighborhood, and a periodic swarm-list heartbeat keeps the
//! remote picture fresh (see [`Vm::process_out_messages`]).
//!
//! [`SwarmMembers`] is this VM's view of who else is in what swarm,
//! built from those announcements, aged every step and evicted once
//! stale.

use std::collections::BTreeMap;

use buzz_core::heap::ObjRef;
use buzz_core::value::{TableKey, TypeTag, Value};

use crate::queues::OutMessage;
use crate::stdlib::{self, native};
use crate::vm::{BuzzFn, Vm, VmError, VmErrorKind, VmState};

#[derive(Debug, Default)]
struct MemberEntry {
    swarms: Vec<u16>,
    age: u16,
}

/// Which swarms each heard-from peer belongs to.
#[derive(Debug, Default)]
pub struct SwarmMembers {
    map: BTreeMap<u16, MemberEntry>,
}

impl SwarmMembers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Record that `robot` joined `swarm`.
    pub fn join(&mut self, robot: u16, swarm: u16) {
        let entry = self.map.entry(robot).or_default();
        entry.age = 0;
        if !entry.swarms.contains(&swarm) {
            entry.swarms.push(swarm);
        }
    }

    /// Record that `robot` left `swarm`; a peer with no memberships left
    /// is forgotten entirely.
    pub fn leave(&mut self, robot: u16, swarm: u16) {
        if let Some(entry) = self.map.get_mut(&robot) {
            entry.age = 0;
            entry.swarms.retain(|&s| s != swarm);
            if entry.swarms.is_empty() {
                self.map.remove(&robot);
            }
        }
    }

    /// Atomically replace everything known about `robot`.
    pub fn refresh(&mut self, robot: u16, swarms: Vec<u16>) {
        self.map.insert(robot, MemberEntry { swarms, age: 0 });
    }

    pub fn is_member(&self, robot: u16, swarm: u16) -> bool {
        self.map
            .get(&robot)
            .is_some_and(|e| e.swarms.contains(&swarm))
    }

    pub fn member_swarms(&self, robot: u16) -> Option<&[u16]> {
        self.map.get(&robot).map(|e| e.swarms.as_slice())
    }

    /// Age every entry, evicting those older than `max_age` steps.
    pub fn update(&mut self, max_age: u16) {
        for entry in self.map.values_mut() {
            entry.age = entry.age.saturating_add(1);
        }
        self.map.retain(|_, e| e.age <= max_age);
    }
}

/// Register the global `swarm` table.
pub(crate) fn register(vm: &mut Vm) {
    let t = stdlib::new_table(vm);
    stdlib::add_method(vm, t, "create", swarm_create as BuzzFn);
    stdlib::add_method(vm, t, "id", swarm_id as BuzzFn);
    stdlib::add_method(vm, t, "intersection", swarm_intersection as BuzzFn);
    stdlib::add_method(vm, t, "union", swarm_union as BuzzFn);
    stdlib::add_method(vm, t, "difference", swarm_difference as BuzzFn);
    vm.set_global("swarm", t);
}

/// Build the Buzz-side handle for swarm `id`.
fn make_swarm_table(vm: &mut Vm, id: u16) -> ObjRef {
    let t = stdlib::new_table(vm);
    stdlib::add_method(vm, t, "others", swarm_others as BuzzFn);
    stdlib::add_method(vm, t, "join", swarm_join as BuzzFn);
    stdlib::add_method(vm, t, "leave", swarm_leave as BuzzFn);
    stdlib::add_method(vm, t, "in", swarm_in as BuzzFn);
    stdlib::add_method(vm, t, "select", swarm_select as BuzzFn);
    stdlib::add_method(vm, t, "exec", swarm_exec as BuzzFn);
    stdlib::add_field(vm, t, "id", Value::Int(id as i32));
    t
}

fn unknown_swarm(id: u16) -> VmError {
    VmError::new(VmErrorKind::UnknownSwarm, format!("swarm id {}", id))
}

/// `swarm.create(id)`
fn swarm_create(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(1)?;
        let id = stdlib::int_arg(vm, 1)? as u16;
        vm.swarms.entry(id).or_insert(false);
        let t = make_swarm_table(vm, id);
        vm.push(t);
        vm.ret1()
    })
}

/// `swarm.id([stackpos])`: the active swarm id, read from the swarm
/// stack; nil outside a swarm context.
fn swarm_id(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        if vm.swarmstack.is_empty() {
            vm.push_nil();
            return vm.ret1();
        }
        let mut stackpos = 1usize;
        if vm.lnum() >= 1 {
            stackpos = stdlib::int_arg(vm, 1)?.max(1) as usize;
        }
        stackpos = stackpos.min(vm.swarmstack.len());
        let id = vm.swarmstack[vm.swarmstack.len() - stackpos];
        vm.push_int(id as i32);
        vm.ret1()
    })
}

/// Extract the swarm id of the swarm-table argument at `idx`.
fn swarm_arg(vm: &mut Vm, idx: usize) -> Result<u16, VmError> {
    let t = stdlib::arg(vm, idx)?;
    let key = TableKey::String(vm.string_register("id", true));
    let id = vm.table_get(t, &key).ok_or_else(|| {
        VmError::new(VmErrorKind::TypeMismatch, "expected a swarm table")
    })?;
    match vm.heap.get(id) {
        Value::Int(i) => Ok(*i as u16),
        other => Err(VmError::type_mismatch(TypeTag::Int, other.type_tag())),
    }
}

/// Create a swarm whose local membership is computed from two parents.
fn make_composite(
    vm: &mut Vm,
    combine: impl FnOnce(bool, bool) -> bool,
) -> Result<(), VmError> {
    vm.lnum_assert(3)?;
    let id = stdlib::int_arg(vm, 1)? as u16;
    let s1 = swarm_arg(vm, 2)?;
    let s2 = swarm_arg(vm, 3)?;
    let m1 = *vm.swarms.get(&s1).ok_or_else(|| unknown_swarm(s1))?;
    let m2 = *vm.swarms.get(&s2).ok_or_else(|| unknown_swarm(s2))?;
    let member = combine(m1, m2);
    vm.swarms.insert(id, member);
    if member {
        vm.outmsgs.append(OutMessage::SwarmJoin { id });
    }
    let t = make_swarm_table(vm, id);
    vm.push(t);
    vm.ret1()
}

/// `swarm.intersection(id, s1, s2)`
fn swarm_intersection(vm: &mut Vm) -> VmState {
    native(vm, |vm| make_composite(vm, |a, b| a && b))
}

/// `swarm.union(id, s1, s2)`
fn swarm_union(vm: &mut Vm) -> VmState {
    native(vm, |vm| make_composite(vm, |a, b| a || b))
}

/// `swarm.difference(id, s1, s2)`
fn swarm_difference(vm: &mut Vm) -> VmState {
    native(vm, |vm| make_composite(vm, |a, b| a && !b))
}

/// `s.others(id)`: a swarm containing exactly the robots not in `s`.
fn swarm_others(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(1)?;
        let id = stdlib::receiver_id(vm)?;
        let member = *vm.swarms.get(&id).ok_or_else(|| unknown_swarm(id))?;
        let id2 = stdlib::int_arg(vm, 1)? as u16;
        let v = !member;
        vm.swarms.insert(id2, v);
        if v {
            vm.outmsgs.append(OutMessage::SwarmJoin { id: id2 });
        }
        let t = make_swarm_table(vm, id2);
        vm.push(t);
        vm.ret1()
    })
}

fn swarm_join(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(0)?;
        let id = stdlib::receiver_id(vm)?;
        if !vm.swarms.contains_key(&id) {
            return Err(unknown_swarm(id));
        }
        vm.swarms.insert(id, true);
        vm.outmsgs.append(OutMessage::SwarmJoin { id });
        vm.ret0()
    })
}

fn swarm_leave(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(0)?;
        let id = stdlib::receiver_id(vm)?;
        if !vm.swarms.contains_key(&id) {
            return Err(unknown_swarm(id));
        }
        vm.swarms.insert(id, false);
        vm.outmsgs.append(OutMessage::SwarmLeave { id });
        vm.ret0()
    })
}

fn swarm_in(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(0)?;
        let id = stdlib::receiver_id(vm)?;
        let member = *vm.swarms.get(&id).ok_or_else(|| unknown_swarm(id))?;
        vm.push_int(member as i32);
        vm.ret1()
    })
}

/// `s.select(cond)`: set membership from a condition, announcing the
/// transition either way.
fn swarm_select(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(1)?;
        let id = stdlib::receiver_id(vm)?;
        let cond = stdlib::int_arg(vm, 1)? != 0;
        if !vm.swarms.contains_key(&id) {
            return Err(unknown_swarm(id));
        }
        vm.swarms.insert(id, cond);
        vm.outmsgs.append(if cond {
            OutMessage::SwarmJoin { id }
        } else {
            OutMessage::SwarmLeave { id }
        });
        vm.ret0()
    })
}

/// `s.exec(closure)`: run the closure only on members, inside a
/// swarm-tagged call frame so `swarm.id()` resolves during it.
fn swarm_exec(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(1)?;
        let id = stdlib::receiver_id(vm)?;
        let member = *vm.swarms.get(&id).ok_or_else(|| unknown_swarm(id))?;
        if !member {
            return vm.ret0();
        }
        vm.lload(1)?;
        let c = vm.type_assert(1, TypeTag::Closure)?;
        // Unwind this call first; the nil it leaves doubles as the
        // receiver of the swarm closure.
        vm.ret0()?;
        let depth = vm.stacks_depth();
        vm.swarmstack.push(id);
        vm.push(c);
        vm.push_int(0);
        vm.calls()?;
        while vm.stacks_depth() > depth && vm.state() == VmState::Ready {
            vm.step();
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_members_join_and_leave() {
        let mut m = SwarmMembers::new();
        m.join(3, 1);
        m.join(3, 2);
        assert!(m.is_member(3, 1));
        assert!(m.is_member(3, 2));
        m.leave(3, 1);
        assert!(!m.is_member(3, 1));
        assert!(m.is_member(3, 2));
        // Last membership gone: the peer is forgotten.
        m.leave(3, 2);
        assert!(m.is_empty());
    }

    #[test]
    fn test_members_refresh_replaces() {
        let mut m = SwarmMembers::new();
        m.join(5, 1);
        m.refresh(5, vec![2, 3]);
        assert!(!m.is_member(5, 1));
        assert!(m.is_member(5, 2));
        assert_eq!(m.member_swarms(5), Some(&[2, 3][..]));
    }

    #[test]
    fn test_members_aging_eviction() {
        let mut m = SwarmMembers::new();
        m.join(9, 1);
        for _ in 0..50 {
            m.update(50);
        }
        assert!(m.is_member(9, 1));
        m.update(50);
        assert!(m.is_empty());
    }

    #[test]
    fn test_join_resets_age() {
        let mut m = SwarmMembers::new();
        m.join(9, 1);
        for _ in 0..49 {
            m.update(50);
        }
        m.join(9, 1);
        for _ in 0..50 {
            m.update(50);
        }
        assert!(m.is_member(9, 1));
    }
}
