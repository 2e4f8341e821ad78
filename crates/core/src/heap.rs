//! Heap and garbage collector
//!
//! The heap exclusively owns every allocated value; scripts and the VM
//! hold [`ObjRef`] handles into it. Collection is mark-and-sweep with an
//! epoch marker: a pass bumps the epoch, marks everything reachable from
//! the roots the VM supplies, then sweeps slots whose marker lags behind.
//! Cycles terminate because an already-marked object is never revisited.
//!
//! A pass is triggered once the heap holds at least `max_objs`
//! allocations; the threshold starts at 1 and is reset to twice the live
//! count after every sweep.

use crate::strings::StringInterner;
use crate::value::Value;

const GC_INIT_MAX_OBJS: usize = 1;

/// Handle to a heap-allocated value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjRef(u32);

impl ObjRef {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
struct Slot {
    marker: u32,
    value: Option<Value>,
}

/// Arena of all live values of one VM.
#[derive(Debug)]
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    marker: u32,
    max_objs: usize,
    live: usize,
    /// Temporarily rooted handles. Runtime code that must keep a value
    /// alive across script execution without a stack slot pins it here.
    pins: Vec<ObjRef>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            marker: 0,
            max_objs: GC_INIT_MAX_OBJS,
            live: 0,
            pins: Vec::new(),
        }
    }

    /// Number of live allocations.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Allocate a value and return its handle.
    pub fn new_obj(&mut self, value: Value) -> ObjRef {
        self.live += 1;
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Slot {
                    marker: self.marker,
                    value: Some(value),
                };
                ObjRef(idx)
            }
            None => {
                let idx = self.slots.len() as u32;
                self.slots.push(Slot {
                    marker: self.marker,
                    value: Some(value),
                });
                ObjRef(idx)
            }
        }
    }

    /// Borrow the value behind a handle.
    ///
    /// Panics on a dangling handle: handles only dangle if the VM failed
    /// to root a reachable value, which is a VM bug, not a script error.
    pub fn get(&self, r: ObjRef) -> &Value {
        self.slots[r.index()]
            .value
            .as_ref()
            .expect("dangling heap handle")
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Value {
        self.slots[r.index()]
            .value
            .as_mut()
            .expect("dangling heap handle")
    }

    /// Root `r` until the matching [`Self::unpin`].
    pub fn pin(&mut self, r: ObjRef) {
        self.pins.push(r);
    }

    /// Drop the most recent pin of `r`.
    pub fn unpin(&mut self, r: ObjRef) {
        if let Some(pos) = self.pins.iter().rposition(|&p| p == r) {
            self.pins.remove(pos);
        }
    }

    /// Currently pinned handles; the collector marks these as roots.
    pub fn pins(&self) -> &[ObjRef] {
        &self.pins
    }

    /// Whether the allocation count has reached the collection threshold.
    pub fn gc_needed(&self) -> bool {
        self.live >= self.max_objs
    }

    /// Start a collection pass: bump the epoch and clear the interner's
    /// transient-reachability bits.
    pub fn gc_begin(&mut self, strings: &mut StringInterner) {
        self.marker = self.marker.wrapping_add(1);
        strings.gc_clear();
    }

    /// Mark everything reachable from `root`, including interned strings
    /// referenced by values and table keys.
    pub fn gc_mark(&mut self, root: ObjRef, strings: &mut StringInterner) {
        let mut work = vec![root];
        while let Some(r) = work.pop() {
            let slot = &mut self.slots[r.index()];
            if slot.marker == self.marker {
                continue;
            }
            slot.marker = self.marker;
            match slot.value.as_ref() {
                Some(Value::String(s)) => strings.gc_mark(s.id),
                Some(Value::Table(t)) => {
                    for (k, v) in t {
                        if let crate::value::TableKey::String(s) = k {
                            strings.gc_mark(s.id);
                        }
                        work.push(*v);
                    }
                }
                Some(Value::Closure(c)) => work.extend(c.actrec.borrow().iter().copied()),
                _ => {}
            }
        }
    }

    /// Sweep unmarked slots, prune unmarked transient strings, and reset
    /// the collection threshold to twice the surviving population.
    pub fn gc_sweep(&mut self, strings: &mut StringInterner) {
        for idx in 0..self.slots.len() {
            let slot = &mut self.slots[idx];
            if slot.value.is_some() && slot.marker != self.marker {
                slot.value = None;
                self.free.push(idx as u32);
                self.live -= 1;
            }
        }
        strings.gc_prune();
        self.max_objs = if self.live == 0 {
            GC_INIT_MAX_OBJS
        } else {
            2 * self.live
        };
        tracing::debug!(live = self.live, threshold = self.max_objs, "gc pass done");
    }

    /// Deep clone: tables and closure capture lists are copied
    /// recursively, primitives are copied, strings and userdata share.
    /// Shared substructure stays shared in the copy, which also makes
    /// cyclic tables clone in finite time.
    pub fn deep_clone(&mut self, r: ObjRef) -> ObjRef {
        let mut seen = std::collections::HashMap::new();
        self.clone_rec(r, &mut seen)
    }

    fn clone_rec(
        &mut self,
        r: ObjRef,
        seen: &mut std::collections::HashMap<ObjRef, ObjRef>,
    ) -> ObjRef {
        if let Some(&done) = seen.get(&r) {
            return done;
        }
        match self.get(r).clone() {
            v @ (Value::Nil
            | Value::Int(_)
            | Value::Float(_)
            | Value::String(_)
            | Value::UserData(_)) => {
                let n = self.new_obj(v);
                seen.insert(r, n);
                n
            }
            Value::Closure(c) => {
                let n = self.new_obj(Value::Nil);
                seen.insert(r, n);
                let caps: Vec<ObjRef> = c.actrec.borrow().clone();
                let actrec: Vec<ObjRef> =
                    caps.into_iter().map(|cap| self.clone_rec(cap, seen)).collect();
                *self.get_mut(n) = Value::Closure(crate::value::Closure::new(c.target, actrec));
                n
            }
            Value::Table(t) => {
                let n = self.new_obj(Value::Nil);
                seen.insert(r, n);
                let mut copy = crate::value::Table::new();
                for (k, v) in t {
                    copy.insert(k.clone(), self.clone_rec(v, seen));
                }
                *self.get_mut(n) = Value::Table(copy);
                n
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Table, TableKey, Value};

    fn collect(heap: &mut Heap, strings: &mut StringInterner, roots: &[ObjRef]) {
        heap.gc_begin(strings);
        for &r in roots {
            heap.gc_mark(r, strings);
        }
        heap.gc_sweep(strings);
    }

    #[test]
    fn test_unreachable_objects_are_swept() {
        let mut heap = Heap::new();
        let mut strings = StringInterner::new();
        let keep = heap.new_obj(Value::Int(1));
        let _drop = heap.new_obj(Value::Int(2));
        collect(&mut heap, &mut strings, &[keep]);
        assert_eq!(heap.len(), 1);
        assert!(matches!(heap.get(keep), Value::Int(1)));
    }

    #[test]
    fn test_table_members_are_roots() {
        let mut heap = Heap::new();
        let mut strings = StringInterner::new();
        let inner = heap.new_obj(Value::Int(42));
        let mut t = Table::new();
        t.insert(TableKey::Int(0), inner);
        let table = heap.new_obj(Value::Table(t));
        collect(&mut heap, &mut strings, &[table]);
        assert_eq!(heap.len(), 2);
        assert!(matches!(heap.get(inner), Value::Int(42)));
    }

    #[test]
    fn test_cyclic_tables_terminate() {
        let mut heap = Heap::new();
        let mut strings = StringInterner::new();
        let table = heap.new_obj(Value::Table(Table::new()));
        if let Value::Table(t) = heap.get_mut(table) {
            t.insert(TableKey::Int(0), table);
        }
        collect(&mut heap, &mut strings, &[table]);
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn test_pinned_object_survives_collection() {
        let mut heap = Heap::new();
        let mut strings = StringInterner::new();
        let r = heap.new_obj(Value::Int(8));
        heap.pin(r);
        let pinned: Vec<_> = heap.pins().to_vec();
        heap.gc_begin(&mut strings);
        for p in pinned {
            heap.gc_mark(p, &mut strings);
        }
        heap.gc_sweep(&mut strings);
        assert!(matches!(heap.get(r), Value::Int(8)));
        heap.unpin(r);
        collect(&mut heap, &mut strings, &[]);
        assert_eq!(heap.len(), 0);
    }

    #[test]
    fn test_transient_string_pruned_with_value() {
        let mut heap = Heap::new();
        let mut strings = StringInterner::new();
        let s = strings.register("transient", false);
        let id = s.id;
        let _obj = heap.new_obj(Value::String(s));
        collect(&mut heap, &mut strings, &[]);
        assert!(strings.get(id).is_none());
    }

    #[test]
    fn test_threshold_doubles_after_pass() {
        let mut heap = Heap::new();
        let mut strings = StringInterner::new();
        let roots: Vec<_> = (0..3).map(|i| heap.new_obj(Value::Int(i))).collect();
        collect(&mut heap, &mut strings, &roots);
        assert!(!heap.gc_needed());
        // Threshold is now 6; three more allocations reach it.
        for i in 0..3 {
            heap.new_obj(Value::Int(i));
        }
        assert!(heap.gc_needed());
    }

    #[test]
    fn test_deep_clone_copies_tables() {
        let mut heap = Heap::new();
        let inner = heap.new_obj(Value::Int(5));
        let mut t = Table::new();
        t.insert(TableKey::Int(0), inner);
        let table = heap.new_obj(Value::Table(t));
        let copy = heap.deep_clone(table);
        // Mutating the original does not affect the clone.
        if let Value::Table(t) = heap.get_mut(table) {
            t.remove(&TableKey::Int(0));
        }
        match heap.get(copy) {
            Value::Table(t) => assert_eq!(t.len(), 1),
            other => panic!("expected table, got {:?}", other),
        }
    }

    #[test]
    fn test_deep_clone_cyclic() {
        let mut heap = Heap::new();
        let table = heap.new_obj(Value::Table(Table::new()));
        if let Value::Table(t) = heap.get_mut(table) {
            t.insert(TableKey::Int(0), table);
        }
        let copy = heap.deep_clone(table);
        match heap.get(copy) {
            Value::Table(t) => assert_eq!(t.get(&TableKey::Int(0)), Some(&copy)),
            other => panic!("expected table, got {:?}", other),
        }
    }
}
