//! String interner
//!
//! Maps byte strings to 16-bit ids. Interning an equal string always
//! returns the same id. Entries come in two categories: *protected*
//! entries (registered by the compiler prologue or by the host with the
//! protect flag) survive garbage collection unconditionally; *transient*
//! entries survive only while some live value references them.
//!
//! The id space is 16 bits; occupancy past 48K entries logs a warning so
//! large programs see exhaustion coming.

use std::collections::HashMap;
use std::sync::Arc;

use crate::value::{IStr, StringId};

const ID_SPACE_WARN_THRESHOLD: usize = 48 * 1024;

#[derive(Debug)]
struct StrEntry {
    text: Arc<str>,
    protected: bool,
    marked: bool,
}

/// Owner of all interned strings of one VM.
#[derive(Debug, Default)]
pub struct StringInterner {
    entries: Vec<Option<StrEntry>>,
    lookup: HashMap<Arc<str>, StringId>,
    free: Vec<StringId>,
    warned: bool,
}

impl StringInterner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }

    /// Intern `s`, returning its id. Re-interning an equal string returns
    /// the same id; registering with `protect` upgrades an existing
    /// transient entry to protected.
    pub fn register(&mut self, s: &str, protect: bool) -> IStr {
        if let Some(&id) = self.lookup.get(s) {
            let entry = self.entries[id as usize]
                .as_mut()
                .expect("lookup points at live entry");
            if protect {
                entry.protected = true;
            }
            return IStr {
                id,
                text: entry.text.clone(),
            };
        }
        let text: Arc<str> = Arc::from(s);
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                let id = self.entries.len();
                assert!(id <= StringId::MAX as usize, "string id space exhausted");
                self.entries.push(None);
                id as StringId
            }
        };
        self.entries[id as usize] = Some(StrEntry {
            text: text.clone(),
            protected: protect,
            marked: false,
        });
        self.lookup.insert(text.clone(), id);
        if !self.warned && self.lookup.len() > ID_SPACE_WARN_THRESHOLD {
            self.warned = true;
            tracing::warn!(
                entries = self.lookup.len(),
                "string interner is approaching the 16-bit id space limit"
            );
        }
        IStr { id, text }
    }

    /// Id of an already-interned string, without interning it.
    pub fn find(&self, s: &str) -> Option<StringId> {
        self.lookup.get(s).copied()
    }

    /// Text for `id`, if the id is live.
    pub fn get(&self, id: StringId) -> Option<Arc<str>> {
        self.entries
            .get(id as usize)
            .and_then(|e| e.as_ref())
            .map(|e| e.text.clone())
    }

    /// Rebuild an [`IStr`] for a live id.
    pub fn get_istr(&self, id: StringId) -> Option<IStr> {
        self.get(id).map(|text| IStr { id, text })
    }

    /// Clear the transient-reachability bits at the start of a GC pass.
    pub fn gc_clear(&mut self) {
        for entry in self.entries.iter_mut().flatten() {
            entry.marked = false;
        }
    }

    /// Mark `id` as reachable during a GC pass.
    pub fn gc_mark(&mut self, id: StringId) {
        if let Some(Some(entry)) = self.entries.get_mut(id as usize) {
            entry.marked = true;
        }
    }

    /// Drop transient entries that were not marked since [`Self::gc_clear`].
    pub fn gc_prune(&mut self) {
        for id in 0..self.entries.len() {
            let dead = matches!(
                &self.entries[id],
                Some(e) if !e.protected && !e.marked
            );
            if dead {
                let entry = self.entries[id].take().expect("checked above");
                self.lookup.remove(&entry.text);
                self.free.push(id as StringId);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_strings_same_id() {
        let mut si = StringInterner::new();
        let a = si.register("hello", false);
        let b = si.register("hello", true);
        assert_eq!(a.id, b.id);
        assert_eq!(si.len(), 1);
    }

    #[test]
    fn test_distinct_strings_distinct_ids() {
        let mut si = StringInterner::new();
        let a = si.register("a", false);
        let b = si.register("b", false);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_protected_survives_gc() {
        let mut si = StringInterner::new();
        let p = si.register("keep", true);
        let t = si.register("drop", false);
        si.gc_clear();
        si.gc_prune();
        assert!(si.get(p.id).is_some());
        assert!(si.get(t.id).is_none());
    }

    #[test]
    fn test_marked_transient_survives_gc() {
        let mut si = StringInterner::new();
        let t = si.register("in-use", false);
        si.gc_clear();
        si.gc_mark(t.id);
        si.gc_prune();
        assert_eq!(si.get(t.id).as_deref(), Some("in-use"));
    }

    #[test]
    fn test_pruned_id_is_reusable() {
        let mut si = StringInterner::new();
        let t = si.register("gone", false);
        si.gc_clear();
        si.gc_prune();
        let n = si.register("new", false);
        assert_eq!(t.id, n.id);
        assert_eq!(si.get(n.id).as_deref(), Some("new"));
    }
}
