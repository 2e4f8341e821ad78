//! Virtual stigmergy
//!
//! A replicated key/value map identified by a 16-bit id. Each entry
//! carries a Lamport timestamp and the id of the robot that wrote it;
//! writes flood the swarm as `VStigPut` messages and reads announce
//! interest as `VStigQuery` messages, so the map converges without any
//! central coordination.
//!
//! Conflicts (same timestamp, different writers) are resolved
//! deterministically: a user-registered `onconflict` closure picks the
//! winner, or the higher robot id does. A robot whose own entry loses is
//! told through `onconflictlost`.

use buzz_core::heap::{Heap, ObjRef};
use buzz_core::msg::{ByteReader, CodecError};
use buzz_core::strings::StringInterner;
use buzz_core::value::{TableKey, TypeTag, Value};

use crate::queues::OutMessage;
use crate::stdlib::{self, native};
use crate::vm::{BuzzFn, Vm, VmError, VmErrorKind, VmState};

/// One replicated entry.
#[derive(Debug, Clone, Copy)]
pub struct VstigEntry {
    pub data: ObjRef,
    pub timestamp: u16,
    pub robot: u16,
}

/// One virtual-stigmergy instance.
#[derive(Debug, Default)]
pub struct Vstig {
    entries: std::collections::BTreeMap<TableKey, VstigEntry>,
    pub(crate) on_conflict: Option<ObjRef>,
    pub(crate) on_conflict_lost: Option<ObjRef>,
}

impl Vstig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn fetch(&self, key: &TableKey) -> Option<&VstigEntry> {
        self.entries.get(key)
    }

    pub fn store(&mut self, key: TableKey, entry: VstigEntry) {
        self.entries.insert(key, entry);
    }

    pub fn entries(&self) -> impl Iterator<Item = (&TableKey, &VstigEntry)> {
        self.entries.iter()
    }
}

/// Register the global `stigmergy` table.
pub(crate) fn register(vm: &mut Vm) {
    let t = vm.heap.new_obj(Value::Table(buzz_core::value::Table::new()));
    stdlib::add_method(vm, t, "create", vstig_create as BuzzFn);
    vm.set_global("stigmergy", t);
}

/// Turn argument `idx` into a stigmergy key.
fn key_arg(vm: &mut Vm, idx: usize) -> Result<TableKey, VmError> {
    vm.lload(idx)?;
    let k = vm.stack_at(1)?;
    vm.pop()?;
    TableKey::from_value(vm.heap.get(k)).ok_or_else(|| {
        VmError::new(
            VmErrorKind::TypeMismatch,
            format!(
                "a {} value can't be used as stigmergy key",
                vm.heap.get(k).type_tag().desc()
            ),
        )
    })
}

/// `stigmergy.create(id)`
fn vstig_create(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(1)?;
        vm.lload(1)?;
        let id = match vm.heap.get(vm.stack_at(1)?) {
            Value::Int(i) => *i as u16,
            other => return Err(VmError::type_mismatch(TypeTag::Int, other.type_tag())),
        };
        vm.pop()?;
        // A fresh create replaces any previous instance with this id.
        vm.vstigs.insert(id, Vstig::new());
        let t = vm.push_table();
        stdlib::add_method(vm, t, "size", vstig_size as BuzzFn);
        stdlib::add_method(vm, t, "put", vstig_put as BuzzFn);
        stdlib::add_method(vm, t, "get", vstig_get as BuzzFn);
        stdlib::add_method(vm, t, "onconflict", vstig_onconflict as BuzzFn);
        stdlib::add_method(vm, t, "onconflictlost", vstig_onconflictlost as BuzzFn);
        let id_key = TableKey::String(vm.string_register("id", true));
        let id_val = vm.heap.new_obj(Value::Int(id as i32));
        vm.table_bind(t, id_key, id_val);
        vm.ret1()
    })
}

fn vstig_size(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(0)?;
        let id = stdlib::receiver_id(vm)?;
        let size = vm.vstigs.get(&id).map_or(0, |vs| vs.len());
        vm.push_int(size as i32);
        vm.ret1()
    })
}

/// `put(key, value)`: insert with timestamp 1, or overwrite bumping the
/// timestamp; either way the new entry floods out.
fn vstig_put(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(2)?;
        let id = stdlib::receiver_id(vm)?;
        let key = key_arg(vm, 1)?;
        vm.lload(2)?;
        let data = vm.stack_at(1)?;
        vm.pop()?;
        let robot = vm.robot();
        if let Some(vs) = vm.vstigs.get_mut(&id) {
            let entry = match vs.fetch(&key) {
                Some(old) => VstigEntry {
                    data,
                    timestamp: old.timestamp.wrapping_add(1),
                    robot,
                },
                None => VstigEntry {
                    data,
                    timestamp: 1,
                    robot,
                },
            };
            vs.store(key.clone(), entry);
            append_vstig(vm, false, id, key, entry);
        }
        vm.ret0()
    })
}

/// `get(key)`: return the local value (or nil) and announce interest
/// with a query carrying what this robot knows.
fn vstig_get(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(1)?;
        let id = stdlib::receiver_id(vm)?;
        let key = key_arg(vm, 1)?;
        let local = vm.vstigs.get(&id).and_then(|vs| vs.fetch(&key).copied());
        match local {
            Some(entry) => {
                vm.push(entry.data);
                append_vstig(vm, true, id, key, entry);
            }
            None => {
                let nil = vm.push_nil();
                let entry = VstigEntry {
                    data: nil,
                    timestamp: 0,
                    robot: vm.robot(),
                };
                append_vstig(vm, true, id, key, entry);
            }
        }
        vm.ret1()
    })
}

fn vstig_onconflict(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(1)?;
        let id = stdlib::receiver_id(vm)?;
        vm.lload(1)?;
        let c = vm.type_assert(1, TypeTag::Closure)?;
        vm.pop()?;
        match vm.vstigs.get_mut(&id) {
            Some(vs) => vs.on_conflict = Some(c),
            None => tracing::warn!(id, "onconflict on unknown stigmergy"),
        }
        vm.ret0()
    })
}

fn vstig_onconflictlost(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(1)?;
        let id = stdlib::receiver_id(vm)?;
        vm.lload(1)?;
        let c = vm.type_assert(1, TypeTag::Closure)?;
        vm.pop()?;
        match vm.vstigs.get_mut(&id) {
            Some(vs) => vs.on_conflict_lost = Some(c),
            None => tracing::warn!(id, "onconflictlost on unknown stigmergy"),
        }
        vm.ret0()
    })
}

fn append_vstig(vm: &mut Vm, query: bool, id: u16, key: TableKey, entry: VstigEntry) {
    vm.outmsgs.append(OutMessage::VStig {
        query,
        id,
        key,
        data: entry.data,
        timestamp: entry.timestamp,
        robot: entry.robot,
    });
}

/// Decode the `key, value, timestamp, robot` tail of a stigmergy
/// message.
pub(crate) fn deserialize_entry(
    rd: &mut ByteReader<'_>,
    heap: &mut Heap,
    strings: &mut StringInterner,
) -> Result<(TableKey, VstigEntry), CodecError> {
    let k = buzz_core::msg::deserialize_value(rd, heap, strings)?;
    let key = TableKey::from_value(heap.get(k))
        .ok_or(CodecError::BadTypeTag(TypeTag::Table as u16))?;
    let data = buzz_core::msg::deserialize_value(rd, heap, strings)?;
    let timestamp = rd.read_u16()?;
    let robot = rd.read_u16()?;
    Ok((
        key,
        VstigEntry {
            data,
            timestamp,
            robot,
        },
    ))
}

/// Store `entry` into stigmergy `id`.
fn store(vm: &mut Vm, id: u16, key: &TableKey, entry: VstigEntry) {
    if let Some(vs) = vm.vstigs.get_mut(&id) {
        vs.store(key.clone(), entry);
    }
}

/// Incoming `VStigPut`.
pub(crate) fn process_put(vm: &mut Vm, id: u16, key: TableKey, remote: VstigEntry) {
    if !vm.vstigs.contains_key(&id) {
        return;
    }
    let local = vm.vstigs.get(&id).and_then(|vs| vs.fetch(&key).copied());
    match local {
        None => {
            store(vm, id, &key, remote);
            append_vstig(vm, false, id, key, remote);
        }
        Some(l) if l.timestamp < remote.timestamp => {
            store(vm, id, &key, remote);
            append_vstig(vm, false, id, key, remote);
        }
        Some(l) if l.timestamp == remote.timestamp && l.robot != remote.robot => {
            resolve_conflict(vm, id, key, l, remote);
        }
        // The local entry is newer (or the very same write); drop it.
        Some(_) => {}
    }
}

/// Incoming `VStigQuery`: absorb the query and answer or adopt as
/// appropriate.
pub(crate) fn process_query(vm: &mut Vm, id: u16, key: TableKey, remote: VstigEntry) {
    if !vm.vstigs.contains_key(&id) {
        // Unknown map: keep the query flooding.
        append_vstig(vm, true, id, key, remote);
        return;
    }
    let local = vm.vstigs.get(&id).and_then(|vs| vs.fetch(&key).copied());
    match local {
        None => {
            if matches!(vm.heap.get(remote.data), Value::Nil) {
                // Neither side knows anything; keep the question alive.
                append_vstig(vm, true, id, key, remote);
            } else {
                store(vm, id, &key, remote);
                append_vstig(vm, false, id, key, remote);
            }
        }
        Some(l) if l.timestamp < remote.timestamp => {
            store(vm, id, &key, remote);
            append_vstig(vm, false, id, key, remote);
        }
        Some(l) if l.timestamp > remote.timestamp => {
            // This robot knows better; answer with a put.
            append_vstig(vm, false, id, key, l);
        }
        Some(l) if l.robot != remote.robot => {
            resolve_conflict(vm, id, key, l, remote);
        }
        // Identical information; nothing to do.
        Some(_) => {}
    }
}

/// Same-timestamp different-writer resolution, shared by put and query
/// reception.
fn resolve_conflict(vm: &mut Vm, id: u16, key: TableKey, local: VstigEntry, remote: VstigEntry) {
    let winner = match on_conflict_call(vm, id, &key, local, remote) {
        Some(w) => w,
        None => {
            tracing::warn!(robot = vm.robot(), id, "error resolving stigmergy conflict");
            return;
        }
    };
    store(vm, id, &key, winner);
    if winner.robot != vm.robot() && local.robot == vm.robot() {
        on_conflict_lost_call(vm, id, &key, local);
    }
    append_vstig(vm, false, id, key, winner);
}

/// Build the `{robot, data, timestamp}` view of an entry.
fn entry_table(vm: &mut Vm, entry: &VstigEntry) -> ObjRef {
    let t = vm.heap.new_obj(Value::Table(buzz_core::value::Table::new()));
    let robot_key = TableKey::String(vm.string_register("robot", true));
    let data_key = TableKey::String(vm.string_register("data", true));
    let ts_key = TableKey::String(vm.string_register("timestamp", true));
    let robot = vm.heap.new_obj(Value::Int(entry.robot as i32));
    let ts = vm.heap.new_obj(Value::Int(entry.timestamp as i32));
    vm.table_bind(t, robot_key, robot);
    vm.table_bind(t, data_key, entry.data);
    vm.table_bind(t, ts_key, ts);
    t
}

/// Ask the registered conflict manager (or the default higher-id rule)
/// which entry wins. The winner keeps the local timestamp.
fn on_conflict_call(
    vm: &mut Vm,
    id: u16,
    key: &TableKey,
    local: VstigEntry,
    remote: VstigEntry,
) -> Option<VstigEntry> {
    let manager = vm.vstigs.get(&id).and_then(|vs| vs.on_conflict);
    let Some(closure) = manager else {
        // Default: the higher robot id wins.
        return Some(if local.robot > remote.robot {
            local
        } else {
            remote
        });
    };
    vm.push(closure);
    let k = key.to_value();
    let k = vm.heap.new_obj(k);
    vm.push(k);
    let loc = entry_table(vm, &local);
    vm.push(loc);
    let rem = entry_table(vm, &remote);
    vm.push(rem);
    if vm.closure_call(3) != VmState::Ready {
        return None;
    }
    let ret = vm.stack_at(1).ok()?;
    vm.pop().ok()?;
    if !matches!(vm.heap.get(ret), Value::Table(_)) {
        return None;
    }
    let robot_key = TableKey::String(vm.string_register("robot", true));
    let data_key = TableKey::String(vm.string_register("data", true));
    let robot = match vm.table_get(ret, &robot_key).map(|r| vm.heap.get(r).clone()) {
        Some(Value::Int(i)) => i as u16,
        _ => return None,
    };
    let data = vm.table_get(ret, &data_key)?;
    Some(VstigEntry {
        data,
        timestamp: local.timestamp,
        robot,
    })
}

fn on_conflict_lost_call(vm: &mut Vm, id: u16, key: &TableKey, old: VstigEntry) {
    let Some(closure) = vm.vstigs.get(&id).and_then(|vs| vs.on_conflict_lost) else {
        return;
    };
    vm.push(closure);
    let k = key.to_value();
    let k = vm.heap.new_obj(k);
    vm.push(k);
    let loc = entry_table(vm, &old);
    vm.push(loc);
    vm.closure_call(2);
    // The callback's return value, if any, is not used.
    let _ = vm.pop();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm_with_vstig(robot: u16, id: u16) -> Vm {
        let mut vm = Vm::new(robot);
        // Minimal bytecode: empty string table, nop, done.
        vm.set_bcode(vec![0, 0, 0, 1]);
        assert_eq!(vm.state(), VmState::Ready);
        vm.vstigs.insert(id, Vstig::new());
        vm
    }

    fn int_entry(vm: &mut Vm, v: i32, timestamp: u16, robot: u16) -> VstigEntry {
        VstigEntry {
            data: vm.heap.new_obj(Value::Int(v)),
            timestamp,
            robot,
        }
    }

    #[test]
    fn test_put_adopts_newer_remote() {
        let mut vm = vm_with_vstig(1, 7);
        let key = TableKey::Int(1);
        let old = int_entry(&mut vm, 10, 1, 1);
        vm.vstigs.get_mut(&7).unwrap().store(key.clone(), old);
        let remote = int_entry(&mut vm, 20, 2, 3);
        process_put(&mut vm, 7, key.clone(), remote);
        let stored = *vm.vstigs[&7].fetch(&key).unwrap();
        assert_eq!(stored.timestamp, 2);
        assert_eq!(stored.robot, 3);
        // Adopted entries relay onward.
        assert_eq!(vm.outmsgs.len(), 1);
    }

    #[test]
    fn test_put_ignores_older_remote() {
        let mut vm = vm_with_vstig(1, 7);
        let key = TableKey::Int(1);
        let newer = int_entry(&mut vm, 10, 5, 1);
        vm.vstigs.get_mut(&7).unwrap().store(key.clone(), newer);
        let remote = int_entry(&mut vm, 20, 2, 3);
        process_put(&mut vm, 7, key.clone(), remote);
        let stored = *vm.vstigs[&7].fetch(&key).unwrap();
        assert_eq!(stored.timestamp, 5);
        assert!(vm.outmsgs.is_empty());
    }

    #[test]
    fn test_conflict_higher_robot_wins_by_default() {
        // Robot 3 holds its own entry; robot 7's same-timestamp write
        // arrives. 7 > 3, so the remote wins.
        let mut vm = vm_with_vstig(3, 1);
        let key = TableKey::Int(0);
        let mine = int_entry(&mut vm, 100, 1, 3);
        vm.vstigs.get_mut(&1).unwrap().store(key.clone(), mine);
        let remote = int_entry(&mut vm, 100, 1, 7);
        process_put(&mut vm, 1, key.clone(), remote);
        let stored = *vm.vstigs[&1].fetch(&key).unwrap();
        assert_eq!(stored.robot, 7);
        assert_eq!(stored.timestamp, 1);
    }

    #[test]
    fn test_conflict_is_symmetric() {
        // The same two writes seen from the other side give the same
        // winner, which is what makes the map converge.
        let mut vm = vm_with_vstig(7, 1);
        let key = TableKey::Int(0);
        let mine = int_entry(&mut vm, 100, 1, 7);
        vm.vstigs.get_mut(&1).unwrap().store(key.clone(), mine);
        let remote = int_entry(&mut vm, 100, 1, 3);
        process_put(&mut vm, 1, key.clone(), remote);
        let stored = *vm.vstigs[&1].fetch(&key).unwrap();
        assert_eq!(stored.robot, 7);
    }

    #[test]
    fn test_query_answered_with_put_when_local_newer() {
        let mut vm = vm_with_vstig(1, 7);
        let key = TableKey::Int(1);
        let newer = int_entry(&mut vm, 10, 5, 1);
        vm.vstigs.get_mut(&7).unwrap().store(key.clone(), newer);
        let remote = int_entry(&mut vm, 20, 2, 3);
        process_query(&mut vm, 7, key, remote);
        let msgs: Vec<_> = vm.outmsgs.iter().collect();
        assert_eq!(msgs.len(), 1);
        match msgs[0] {
            OutMessage::VStig {
                query, timestamp, ..
            } => {
                assert!(!query, "answer must be a put");
                assert_eq!(*timestamp, 5);
            }
            other => panic!("expected vstig message, got {:?}", other),
        }
    }

    #[test]
    fn test_query_for_unknown_key_propagates() {
        let mut vm = vm_with_vstig(1, 7);
        let key = TableKey::Int(9);
        let nil = vm.heap.new_obj(Value::Nil);
        let remote = VstigEntry {
            data: nil,
            timestamp: 0,
            robot: 3,
        };
        process_query(&mut vm, 7, key, remote);
        let msgs: Vec<_> = vm.outmsgs.iter().collect();
        assert_eq!(msgs.len(), 1);
        assert!(matches!(msgs[0], OutMessage::VStig { query: true, .. }));
    }
}
