//! The Buzz virtual machine
//!
//! One VM per robot. The VM owns its heap, string interner, operand
//! stacks, local-symbol frames, global table, message queues and swarm
//! state; nothing is shared between VMs except the packets they exchange.
//!
//! Execution is strictly single-threaded and cooperative: [`Vm::step`]
//! runs one instruction and returns, [`Vm::execute_script`] loops until
//! the VM leaves the ready state. Errors never unwind: a failing
//! instruction moves the VM to [`VmState::Error`] with a formatted
//! message, and the host decides what to do next.
//!
//! # Call discipline
//!
//! A call site arranges the stack as `self, closure, arg1..argN, N`.
//! `callc`/`calls` pop the argument count, build a fresh local frame from
//! the closure captures followed by the arguments, push the return
//! address on the caller's operand stack, and open a new operand stack
//! for the callee. `ret0`/`ret1` unwind exactly that.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use rand_mt::Mt;

use buzz_core::debug::DebugInfo;
use buzz_core::heap::{Heap, ObjRef};
use buzz_core::msg::MessageType;
use buzz_core::strings::StringInterner;
use buzz_core::value::{
    values_cmp, values_eq, ActRec, Closure, ClosureRef, IStr, StringId, Table, TableKey, TypeTag,
    Value,
};
use buzz_core::Opcode;

use crate::neighbors;
use crate::queues::{InMsgQueue, OutMessage, OutMsgQueue};
use crate::stdlib;
use crate::swarm::{self, SwarmMembers};
use crate::vstig::{self, Vstig};

/// A host function callable from scripts through a foreign closure.
///
/// The function runs with a fresh local frame (slot 0 = self, slots 1..N
/// = arguments) and must finish through [`Vm::ret0`] or [`Vm::ret1`].
pub type BuzzFn = fn(&mut Vm) -> VmState;

/// VM execution states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// No bytecode loaded yet.
    NoCode,
    /// Ready to execute the next instruction.
    Ready,
    /// The program ran `done`.
    Done,
    /// An instruction failed; sticky until the host reloads bytecode.
    Error,
    /// Halted by the host; sticky like `Error`.
    Stopped,
}

impl VmState {
    pub fn desc(self) -> &'static str {
        match self {
            VmState::NoCode => "no code",
            VmState::Ready => "ready",
            VmState::Done => "done",
            VmState::Error => "error",
            VmState::Stopped => "stopped",
        }
    }
}

/// VM error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmErrorKind {
    UnknownInstr,
    StackUnderflow,
    WrongArgCount,
    PcOutOfRange,
    BadFunctionId,
    TypeMismatch,
    UnknownString,
    UnknownSwarm,
}

impl VmErrorKind {
    pub fn desc(self) -> &'static str {
        match self {
            VmErrorKind::UnknownInstr => "unknown instruction",
            VmErrorKind::StackUnderflow => "stack error",
            VmErrorKind::WrongArgCount => "wrong number of local variables",
            VmErrorKind::PcOutOfRange => "pc out of range",
            VmErrorKind::BadFunctionId => "function id out of range",
            VmErrorKind::TypeMismatch => "type mismatch",
            VmErrorKind::UnknownString => "unknown string id",
            VmErrorKind::UnknownSwarm => "unknown swarm id",
        }
    }
}

/// A VM error: a kind plus a human-readable message.
#[derive(Debug, Clone)]
pub struct VmError {
    pub kind: VmErrorKind,
    pub message: String,
}

impl VmError {
    pub fn new(kind: VmErrorKind, message: impl Into<String>) -> Self {
        VmError {
            kind,
            message: message.into(),
        }
    }

    pub fn bare(kind: VmErrorKind) -> Self {
        VmError {
            kind,
            message: String::new(),
        }
    }

    pub fn type_mismatch(expected: TypeTag, got: TypeTag) -> Self {
        VmError::new(
            VmErrorKind::TypeMismatch,
            format!("expected {}, got {}", expected.desc(), got.desc()),
        )
    }
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind.desc())
        } else {
            write!(f, "{}: {}", self.kind.desc(), self.message)
        }
    }
}

impl std::error::Error for VmError {}

/// Host-tunable VM parameters.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Maximum size of one radio packet, in bytes.
    pub radio_mtu: usize,
    /// Steps after which an unheard swarm member is evicted.
    pub swarm_member_max_age: u16,
    /// Steps between swarm-list broadcasts.
    pub swarm_broadcast_period: u16,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            radio_mtu: 100,
            swarm_member_max_age: 50,
            swarm_broadcast_period: 10,
        }
    }
}

/// One call frame of local symbols: slot 0 is `self`, then the closure
/// captures, then arguments and block locals.
///
/// Captured slots alias the closure's activation record, so writing one
/// is visible to every later call of the same closure. Arguments and
/// locals are per-call storage, which keeps recursion sound.
#[derive(Debug)]
pub(crate) struct LocalFrame {
    pub(crate) is_swarm: bool,
    captures: ActRec,
    locals: Vec<ObjRef>,
}

impl LocalFrame {
    fn base(&self) -> usize {
        self.captures.borrow().len()
    }

    fn len(&self) -> usize {
        self.base() + self.locals.len()
    }

    fn get(&self, idx: usize) -> Option<ObjRef> {
        let base = self.base();
        if idx < base {
            Some(self.captures.borrow()[idx])
        } else {
            self.locals.get(idx - base).copied()
        }
    }

    /// Every slot, captures first; used for lambda capture and GC roots.
    fn snapshot(&self) -> Vec<ObjRef> {
        let mut slots = self.captures.borrow().clone();
        slots.extend(self.locals.iter().copied());
        slots
    }
}

/// A Buzz virtual machine.
pub struct Vm {
    state: VmState,
    error: Option<VmError>,
    robot: u16,
    config: VmConfig,
    bcode: Vec<u8>,
    pc: usize,
    oldpc: usize,
    pub(crate) heap: Heap,
    pub(crate) strings: StringInterner,
    /// Stack of operand stacks; the last one is active.
    stacks: Vec<Vec<ObjRef>>,
    /// Stack of local-symbol frames; the last one is active.
    lsymts: Vec<LocalFrame>,
    gsyms: BTreeMap<StringId, ObjRef>,
    flist: Vec<BuzzFn>,
    pub(crate) swarms: BTreeMap<u16, bool>,
    pub(crate) swarmstack: Vec<u16>,
    pub(crate) swarm_members: SwarmMembers,
    swarmbroadcast: u16,
    pub(crate) inmsgs: InMsgQueue,
    pub(crate) outmsgs: OutMsgQueue,
    pub(crate) vstigs: BTreeMap<u16, Vstig>,
    pub(crate) listeners: BTreeMap<StringId, ObjRef>,
    pub(crate) rng: Mt,
    pub(crate) io: crate::stdlib::io::IoState,
    dbg: Option<DebugInfo>,
}

impl Vm {
    /// Create a VM for the given robot id, seeding the rng from the
    /// wall clock.
    pub fn new(robot: u16) -> Self {
        Self::with_config(robot, VmConfig::default())
    }

    pub fn with_config(robot: u16, config: VmConfig) -> Self {
        let clock_seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos().wrapping_add(d.as_secs() as u32))
            .unwrap_or(0);
        let swarmbroadcast = config.swarm_broadcast_period;
        Vm {
            state: VmState::NoCode,
            error: None,
            robot,
            config,
            bcode: Vec::new(),
            pc: 0,
            oldpc: 0,
            heap: Heap::new(),
            strings: StringInterner::new(),
            stacks: vec![Vec::new()],
            lsymts: Vec::new(),
            gsyms: BTreeMap::new(),
            flist: Vec::new(),
            swarms: BTreeMap::new(),
            swarmstack: Vec::new(),
            swarm_members: SwarmMembers::new(),
            swarmbroadcast,
            inmsgs: InMsgQueue::new(),
            outmsgs: OutMsgQueue::new(),
            vstigs: BTreeMap::new(),
            listeners: BTreeMap::new(),
            rng: Mt::new(clock_seed),
            io: crate::stdlib::io::IoState::default(),
            dbg: None,
        }
    }

    // ---- inspection ----

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn error(&self) -> Option<&VmError> {
        self.error.as_ref()
    }

    /// Formatted error message, including the source site when debug
    /// info is loaded.
    pub fn error_message(&self) -> String {
        match &self.error {
            None => "no error".to_string(),
            Some(e) => match self
                .dbg
                .as_ref()
                .and_then(|d| d.lookup_at_or_before(self.oldpc as u32))
            {
                Some(loc) => format!("{}: {}", loc, e),
                None => format!("at bytecode offset {}: {}", self.oldpc, e),
            },
        }
    }

    pub fn robot(&self) -> u16 {
        self.robot
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn strings(&self) -> &StringInterner {
        &self.strings
    }

    pub fn strings_mut(&mut self) -> &mut StringInterner {
        &mut self.strings
    }

    /// Host view of a virtual stigmergy, if it exists.
    pub fn stigmergy(&self, id: u16) -> Option<&Vstig> {
        self.vstigs.get(&id)
    }

    /// Local membership of a swarm, if the swarm is known.
    pub fn is_swarm_member(&self, id: u16) -> Option<bool> {
        self.swarms.get(&id).copied()
    }

    /// Host view of the swarm-members table.
    pub fn swarm_members(&self) -> &SwarmMembers {
        &self.swarm_members
    }

    /// Host view of the outbound message queues.
    pub fn out_queue(&self) -> &OutMsgQueue {
        &self.outmsgs
    }

    /// Halt the VM; sticky until bytecode is reloaded.
    pub fn stop(&mut self) {
        self.state = VmState::Stopped;
    }

    pub(crate) fn set_error(&mut self, e: VmError) {
        self.state = VmState::Error;
        self.error = Some(e);
    }

    pub fn load_debug_info(&mut self, dbg: DebugInfo) {
        self.dbg = Some(dbg);
    }

    // ---- values & stack ----

    pub fn value(&self, r: ObjRef) -> &Value {
        self.heap.get(r)
    }

    fn cur_stack(&mut self) -> &mut Vec<ObjRef> {
        self.stacks.last_mut().expect("at least one operand stack")
    }

    pub fn stack_size(&self) -> usize {
        self.stacks.last().expect("at least one operand stack").len()
    }

    /// Depth of the stack of operand stacks; callers saving it can tell
    /// when a closure they started has fully unwound.
    pub(crate) fn stacks_depth(&self) -> usize {
        self.stacks.len()
    }

    pub fn push(&mut self, r: ObjRef) {
        self.cur_stack().push(r);
    }

    pub fn pop(&mut self) -> Result<ObjRef, VmError> {
        self.cur_stack()
            .pop()
            .ok_or_else(|| VmError::new(VmErrorKind::StackUnderflow, "empty stack"))
    }

    /// Element `idx` positions from the top (1 = top).
    pub fn stack_at(&self, idx: usize) -> Result<ObjRef, VmError> {
        let stack = self.stacks.last().expect("at least one operand stack");
        if idx == 0 || idx > stack.len() {
            return Err(VmError::new(
                VmErrorKind::StackUnderflow,
                format!("expected {} stack elements, got {}", idx, stack.len()),
            ));
        }
        Ok(stack[stack.len() - idx])
    }

    pub fn stack_assert(&self, size: usize) -> Result<(), VmError> {
        if self.stack_size() < size {
            return Err(VmError::new(
                VmErrorKind::StackUnderflow,
                format!("expected {} stack elements, got {}", size, self.stack_size()),
            ));
        }
        Ok(())
    }

    /// Assert the element at `idx` has the given type and return it.
    pub fn type_assert(&self, idx: usize, tag: TypeTag) -> Result<ObjRef, VmError> {
        let r = self.stack_at(idx)?;
        let got = self.heap.get(r).type_tag();
        if got != tag {
            return Err(VmError::type_mismatch(tag, got));
        }
        Ok(r)
    }

    pub fn dup(&mut self) -> Result<(), VmError> {
        let top = self.stack_at(1)?;
        self.push(top);
        Ok(())
    }

    pub fn push_nil(&mut self) -> ObjRef {
        let r = self.heap.new_obj(Value::Nil);
        self.push(r);
        r
    }

    pub fn push_int(&mut self, v: i32) -> ObjRef {
        let r = self.heap.new_obj(Value::Int(v));
        self.push(r);
        r
    }

    pub fn push_float(&mut self, v: f32) -> ObjRef {
        let r = self.heap.new_obj(Value::Float(v));
        self.push(r);
        r
    }

    pub fn push_userdata(&mut self, v: usize) -> ObjRef {
        let r = self.heap.new_obj(Value::UserData(v));
        self.push(r);
        r
    }

    pub fn push_table(&mut self) -> ObjRef {
        let r = self.heap.new_obj(Value::Table(Table::new()));
        self.push(r);
        r
    }

    /// Intern a string (optionally protected) and return it; the VM-side
    /// equivalent of `buzzvm_string_register`.
    pub fn string_register(&mut self, s: &str, protect: bool) -> IStr {
        self.strings.register(s, protect)
    }

    pub fn push_string(&mut self, s: IStr) -> ObjRef {
        let r = self.heap.new_obj(Value::String(s));
        self.push(r);
        r
    }

    /// Push the interned string with id `sid`.
    pub fn pushs(&mut self, sid: StringId) -> Result<(), VmError> {
        let istr = self.strings.get_istr(sid).ok_or_else(|| {
            VmError::new(VmErrorKind::UnknownString, format!("string id {}", sid))
        })?;
        self.push_string(istr);
        Ok(())
    }

    /// Push a closure with an empty (nil-receiver) capture list; used for
    /// foreign functions and the function-registration prologue.
    fn push_closure_plain(&mut self, target: ClosureRef) -> ObjRef {
        let nil = self.heap.new_obj(Value::Nil);
        let r = self
            .heap
            .new_obj(Value::Closure(Closure::new(target, vec![nil])));
        self.push(r);
        r
    }

    pub fn push_native_closure(&mut self, addr: u32) -> ObjRef {
        self.push_closure_plain(ClosureRef::Native(addr))
    }

    pub fn push_foreign_closure(&mut self, id: u32) -> ObjRef {
        self.push_closure_plain(ClosureRef::Foreign(id))
    }

    /// Push a lambda closure capturing the current local frame.
    pub fn push_lambda(&mut self, addr: u32) -> ObjRef {
        let slots = match self.lsymts.last() {
            Some(frame) => frame.snapshot(),
            None => vec![self.heap.new_obj(Value::Nil)],
        };
        let r = self
            .heap
            .new_obj(Value::Closure(Closure::new(ClosureRef::Native(addr), slots)));
        self.push(r);
        r
    }

    // ---- locals ----

    /// Number of arguments passed to the current function.
    pub fn lnum(&self) -> usize {
        self.lsymts
            .last()
            .map_or(0, |f| f.len().saturating_sub(1))
    }

    pub fn lnum_assert(&self, num: usize) -> Result<(), VmError> {
        if self.lnum() != num {
            return Err(VmError::new(
                VmErrorKind::WrongArgCount,
                format!("expected {} parameters, got {}", num, self.lnum()),
            ));
        }
        Ok(())
    }

    /// Push local symbol `idx` (0 = self).
    pub fn lload(&mut self, idx: usize) -> Result<(), VmError> {
        let frame = self.lsymts.last().ok_or_else(|| {
            VmError::new(VmErrorKind::WrongArgCount, "no local symbols in scope")
        })?;
        let r = frame.get(idx).ok_or_else(|| {
            VmError::new(
                VmErrorKind::WrongArgCount,
                "not enough local symbols in stack (maybe you called a function \
                 with an insufficient number of parameters?)",
            )
        })?;
        self.push(r);
        Ok(())
    }

    /// Store the stack top into local symbol `idx`. Captured slots write
    /// through to the closure; local slots grow with nil as needed.
    pub fn lstore(&mut self, idx: usize) -> Result<(), VmError> {
        let v = self.pop()?;
        let mut nils = Vec::new();
        {
            let frame = self.lsymts.last().ok_or_else(|| {
                VmError::new(VmErrorKind::WrongArgCount, "no local symbols in scope")
            })?;
            let base = frame.base();
            if idx >= base {
                let needed = (idx - base + 1).saturating_sub(frame.locals.len());
                for _ in 0..needed {
                    nils.push(self.heap.new_obj(Value::Nil));
                }
            }
        }
        let frame = self.lsymts.last_mut().expect("checked above");
        let base = frame.base();
        if idx < base {
            frame.captures.borrow_mut()[idx] = v;
        } else {
            frame.locals.extend(nils);
            frame.locals[idx - base] = v;
        }
        Ok(())
    }

    // ---- globals ----

    /// Pop a string and push the global bound to it (nil if unbound).
    pub fn gload(&mut self) -> Result<(), VmError> {
        let s = self.type_assert(1, TypeTag::String)?;
        let sid = match self.heap.get(s) {
            Value::String(istr) => istr.id,
            _ => unreachable!("type asserted"),
        };
        self.pop()?;
        match self.gsyms.get(&sid) {
            Some(&r) => self.push(r),
            None => {
                self.push_nil();
            }
        }
        Ok(())
    }

    /// Pop a value and a string, binding the global to the value.
    pub fn gstore(&mut self) -> Result<(), VmError> {
        let s = self.type_assert(2, TypeTag::String)?;
        let sid = match self.heap.get(s) {
            Value::String(istr) => istr.id,
            _ => unreachable!("type asserted"),
        };
        let v = self.stack_at(1)?;
        self.pop()?;
        self.pop()?;
        self.gsyms.insert(sid, v);
        Ok(())
    }

    /// Host access to a global by name.
    pub fn get_global(&self, name: &str) -> Option<ObjRef> {
        let sid = self.strings.find(name)?;
        self.gsyms.get(&sid).copied()
    }

    pub fn set_global(&mut self, name: &str, r: ObjRef) {
        let istr = self.strings.register(name, true);
        self.gsyms.insert(istr.id, r);
    }

    // ---- tables ----

    /// Insert `value` under `key` in table `t` with the language's store
    /// semantics: nil erases the key, a closure is rebound so its slot-0
    /// capture is the owning table (method binding).
    pub fn table_bind(&mut self, t: ObjRef, key: TableKey, v: ObjRef) {
        let bound = match self.heap.get(v) {
            Value::Nil => {
                if let Value::Table(table) = self.heap.get_mut(t) {
                    table.remove(&key);
                }
                return;
            }
            Value::Closure(c) => {
                let target = c.target;
                let mut slots: Vec<ObjRef> = c.actrec.borrow().clone();
                if slots.is_empty() {
                    slots.push(t);
                } else {
                    slots[0] = t;
                }
                self.heap.new_obj(Value::Closure(Closure::new(target, slots)))
            }
            _ => v,
        };
        if let Value::Table(table) = self.heap.get_mut(t) {
            table.insert(key, bound);
        }
    }

    /// `tput`: stack is `table, key, value`; pops key and value.
    pub fn tput(&mut self) -> Result<(), VmError> {
        self.stack_assert(3)?;
        let t = self.type_assert(3, TypeTag::Table)?;
        let k = self.stack_at(2)?;
        let v = self.stack_at(1)?;
        self.pop()?;
        self.pop()?;
        self.pop()?;
        let key = TableKey::from_value(self.heap.get(k)).ok_or_else(|| {
            VmError::new(
                VmErrorKind::TypeMismatch,
                format!(
                    "a {} value can't be used as table key",
                    self.heap.get(k).type_tag().desc()
                ),
            )
        })?;
        self.table_bind(t, key, v);
        Ok(())
    }

    pub fn table_get(&self, t: ObjRef, key: &TableKey) -> Option<ObjRef> {
        match self.heap.get(t) {
            Value::Table(table) => table.get(key).copied(),
            _ => None,
        }
    }

    /// `tget`: stack is `table, key`; pops both, pushes the value or nil.
    pub fn tget(&mut self) -> Result<(), VmError> {
        self.stack_assert(2)?;
        let t = self.type_assert(2, TypeTag::Table)?;
        let k = self.stack_at(1)?;
        self.pop()?;
        self.pop()?;
        let key = TableKey::from_value(self.heap.get(k)).ok_or_else(|| {
            VmError::new(
                VmErrorKind::TypeMismatch,
                format!(
                    "a {} value can't be used as table key",
                    self.heap.get(k).type_tag().desc()
                ),
            )
        })?;
        match self.table_get(t, &key) {
            Some(v) => self.push(v),
            None => {
                self.push_nil();
            }
        }
        Ok(())
    }

    // ---- functions & calls ----

    /// Register a host function, deduplicating by pointer. The returned
    /// id is what a foreign closure's `ref` points at.
    pub fn register_function(&mut self, f: BuzzFn) -> u32 {
        if let Some(pos) = self.flist.iter().position(|&g| std::ptr::fn_addr_eq(g, f)) {
            return pos as u32;
        }
        self.flist.push(f);
        (self.flist.len() - 1) as u32
    }

    /// The common half of `callc`/`calls`.
    fn call(&mut self, is_swarm: bool) -> Result<(), VmError> {
        let argn_ref = self.type_assert(1, TypeTag::Int)?;
        let argn = match self.heap.get(argn_ref) {
            Value::Int(n) if *n >= 0 => *n as usize,
            Value::Int(n) => {
                return Err(VmError::new(
                    VmErrorKind::TypeMismatch,
                    format!("negative argument count {}", n),
                ))
            }
            _ => unreachable!("type asserted"),
        };
        self.pop()?;
        self.stack_assert(argn + 1)?;
        let c_ref = self.type_assert(argn + 1, TypeTag::Closure)?;
        let closure = match self.heap.get(c_ref) {
            Value::Closure(c) => c.clone(),
            _ => unreachable!("type asserted"),
        };
        if let ClosureRef::Foreign(id) = closure.target {
            if id as usize >= self.flist.len() {
                return Err(VmError::new(
                    VmErrorKind::BadFunctionId,
                    format!("function id {}", id),
                ));
            }
        }
        // New frame: the closure's shared captures, then the arguments
        // in push order as per-call locals.
        let stack_len = self.stack_size();
        let mut locals = Vec::with_capacity(argn);
        for i in (1..=argn).rev() {
            let stack = self.stacks.last().expect("at least one operand stack");
            locals.push(stack[stack_len - i]);
        }
        self.lsymts.push(LocalFrame {
            is_swarm,
            captures: closure.actrec.clone(),
            locals,
        });
        // Drop arguments, closure, and the unused self beneath it.
        for _ in 0..argn + 2 {
            self.pop()?;
        }
        // Return address, then a fresh operand stack for the callee.
        let ret = self.heap.new_obj(Value::Int(self.pc as i32));
        self.push(ret);
        self.stacks.push(Vec::new());
        match closure.target {
            ClosureRef::Native(addr) => {
                self.oldpc = self.pc;
                self.pc = addr as usize;
                Ok(())
            }
            ClosureRef::Foreign(id) => {
                let f = self.flist[id as usize];
                f(self);
                match &self.error {
                    Some(e) if self.state == VmState::Error => Err(e.clone()),
                    _ => Ok(()),
                }
            }
        }
    }

    pub fn callc(&mut self) -> Result<(), VmError> {
        self.call(false)
    }

    pub fn calls(&mut self) -> Result<(), VmError> {
        self.call(true)
    }

    fn ret_common(&mut self) -> Result<(), VmError> {
        let frame = self.lsymts.pop().ok_or_else(|| {
            VmError::new(VmErrorKind::StackUnderflow, "return with no call frame")
        })?;
        if frame.is_swarm {
            self.swarmstack.pop();
        }
        self.stacks.pop();
        if self.stacks.is_empty() {
            self.stacks.push(Vec::new());
            return Err(VmError::new(
                VmErrorKind::StackUnderflow,
                "return with no caller stack",
            ));
        }
        let ret = self.type_assert(1, TypeTag::Int)?;
        let addr = match self.heap.get(ret) {
            Value::Int(n) => *n as usize,
            _ => unreachable!("type asserted"),
        };
        self.oldpc = self.pc;
        self.pc = addr;
        self.pop()?;
        Ok(())
    }

    /// Return from a closure leaving nil for the caller.
    pub fn ret0(&mut self) -> Result<(), VmError> {
        self.ret_common()?;
        self.push_nil();
        Ok(())
    }

    /// Return from a closure transferring the top value to the caller.
    pub fn ret1(&mut self) -> Result<(), VmError> {
        let ret = self.stack_at(1)?;
        self.ret_common()?;
        self.push(ret);
        Ok(())
    }

    /// Call the closure sitting on the stack above `argc` arguments and
    /// run it to completion. The nil receiver is inserted here; callers
    /// push `closure, arg1..argN` only.
    pub fn closure_call(&mut self, argc: usize) -> VmState {
        let len = self.stack_size();
        if len < argc + 1 {
            self.set_error(VmError::new(
                VmErrorKind::StackUnderflow,
                "closure call with too few stack elements",
            ));
            return self.state;
        }
        let at = len - argc - 1;
        let nil = self.heap.new_obj(Value::Nil);
        self.cur_stack().insert(at, nil);
        self.push_int(argc as i32);
        let depth = self.stacks.len();
        if let Err(e) = self.callc() {
            self.set_error(e);
            return self.state;
        }
        while self.stacks.len() > depth {
            if self.step() != VmState::Ready {
                return self.state;
            }
        }
        self.state
    }

    /// Look up a global closure by name and call it with `argc`
    /// already-pushed arguments; the host entry point for `init`/`step`/
    /// `destroy` hooks.
    pub fn function_call(&mut self, fname: &str, argc: usize) -> VmState {
        if self.state == VmState::Done {
            self.state = VmState::Ready;
        }
        if self.state != VmState::Ready {
            return self.state;
        }
        let istr = self.strings.register(fname, false);
        self.push_string(istr);
        if let Err(e) = self.gload() {
            self.set_error(e);
            return self.state;
        }
        match self.heap.get(self.stack_at(1).expect("just pushed")) {
            Value::Closure(_) => {}
            Value::Nil => {
                self.set_error(VmError::new(
                    VmErrorKind::TypeMismatch,
                    format!("cannot find function '{}()'", fname),
                ));
                return self.state;
            }
            other => {
                let got = other.type_tag();
                self.set_error(VmError::new(
                    VmErrorKind::TypeMismatch,
                    format!(
                        "function '{}()': expected closure, got {}",
                        fname,
                        got.desc()
                    ),
                ));
                return self.state;
            }
        }
        // Move the closure below the arguments.
        if argc > 0 {
            let c = self.stack_at(1).expect("just pushed");
            let _ = self.cur_stack().pop();
            let at = self.stack_size() - argc;
            self.cur_stack().insert(at, c);
        }
        self.closure_call(argc)
    }

    // ---- garbage collection ----

    /// Run a GC pass if the heap crossed its threshold. Roots: globals,
    /// every operand stack, every local frame, the stigmergy state, the
    /// listeners, and the values still queued for transmission.
    pub fn gc(&mut self) {
        if !self.heap.gc_needed() {
            return;
        }
        self.heap.gc_begin(&mut self.strings);
        let mut roots: Vec<ObjRef> = Vec::new();
        roots.extend(self.heap.pins().iter().copied());
        roots.extend(self.gsyms.values().copied());
        for stack in &self.stacks {
            roots.extend(stack.iter().copied());
        }
        for frame in &self.lsymts {
            roots.extend(frame.snapshot());
        }
        for vs in self.vstigs.values() {
            for (key, entry) in vs.entries() {
                if let TableKey::String(s) = key {
                    self.strings.gc_mark(s.id);
                }
                roots.push(entry.data);
            }
            roots.extend(vs.on_conflict);
            roots.extend(vs.on_conflict_lost);
        }
        for (&sid, &listener) in &self.listeners {
            self.strings.gc_mark(sid);
            roots.push(listener);
        }
        for msg in self.outmsgs.iter() {
            match msg {
                OutMessage::Broadcast { topic, value } => {
                    self.strings.gc_mark(topic.id);
                    roots.push(*value);
                }
                OutMessage::VStig { key, data, .. } => {
                    if let TableKey::String(s) = key {
                        self.strings.gc_mark(s.id);
                    }
                    roots.push(*data);
                }
                OutMessage::SwarmList { .. }
                | OutMessage::SwarmJoin { .. }
                | OutMessage::SwarmLeave { .. } => {}
            }
        }
        for root in roots {
            self.heap.gc_mark(root, &mut self.strings);
        }
        self.heap.gc_sweep(&mut self.strings);
    }

    // ---- execution ----

    /// Load a bytecode buffer: intern the string table, run the
    /// registration prologue, then install the standard library and the
    /// `id` global. Leaves the VM ready at the start of the script body.
    pub fn set_bcode(&mut self, bcode: Vec<u8>) -> VmState {
        if bcode.len() < 2 {
            self.set_error(VmError::new(VmErrorKind::PcOutOfRange, "bytecode too short"));
            return self.state;
        }
        let count = u16::from_le_bytes([bcode[0], bcode[1]]) as usize;
        let mut i = 2;
        for _ in 0..count {
            let end = match bcode[i..].iter().position(|&b| b == 0) {
                Some(e) => e,
                None => {
                    self.set_error(VmError::new(
                        VmErrorKind::PcOutOfRange,
                        "unterminated string table",
                    ));
                    return self.state;
                }
            };
            match std::str::from_utf8(&bcode[i..i + end]) {
                Ok(s) => {
                    self.strings.register(s, true);
                }
                Err(_) => {
                    self.set_error(VmError::new(
                        VmErrorKind::UnknownString,
                        "string table entry is not valid UTF-8",
                    ));
                    return self.state;
                }
            }
            i += end + 1;
        }
        self.state = VmState::Ready;
        self.error = None;
        self.bcode = bcode;
        self.pc = i;
        self.oldpc = i;
        // Run the function-registration prologue up to its closing nop.
        while self.pc < self.bcode.len() && self.bcode[self.pc] != Opcode::Nop as u8 {
            if self.step() != VmState::Ready {
                return self.state;
            }
        }
        self.step();
        if self.state != VmState::Ready {
            return self.state;
        }
        neighbors::reset(self);
        // Robot id global.
        let id = self.heap.new_obj(Value::Int(self.robot as i32));
        self.set_global("id", id);
        // Standard library and swarm-coordination tables.
        stdlib::register_all(self);
        swarm::register(self);
        vstig::register(self);
        self.state
    }

    fn assert_pc(&self, pc: usize) -> Result<(), VmError> {
        if pc >= self.bcode.len() {
            return Err(VmError::new(
                VmErrorKind::PcOutOfRange,
                format!("pc {} out of range", pc),
            ));
        }
        Ok(())
    }

    fn inc_pc(&mut self) -> Result<(), VmError> {
        self.oldpc = self.pc;
        self.pc += 1;
        self.assert_pc(self.pc)
    }

    fn read_arg(&mut self) -> Result<[u8; 4], VmError> {
        // The argument must be followed by at least one more byte, or the
        // program counter would fall off the buffer.
        if self.pc + 4 >= self.bcode.len() {
            return Err(VmError::new(
                VmErrorKind::PcOutOfRange,
                "truncated instruction argument",
            ));
        }
        let arg: [u8; 4] = self.bcode[self.pc..self.pc + 4]
            .try_into()
            .expect("length checked");
        self.pc += 4;
        Ok(arg)
    }

    /// Execute one instruction.
    pub fn step(&mut self) -> VmState {
        if self.state != VmState::Ready {
            return self.state;
        }
        self.gc();
        if let Err(e) = self.exec_instr() {
            self.set_error(e);
        }
        self.state
    }

    /// Run until the VM leaves the ready state.
    pub fn execute_script(&mut self) -> VmState {
        while self.step() == VmState::Ready {}
        self.state
    }

    fn exec_instr(&mut self) -> Result<(), VmError> {
        self.assert_pc(self.pc)?;
        let instr = self.bcode[self.pc];
        let op = Opcode::from_byte(instr)
            .ok_or_else(|| VmError::new(VmErrorKind::UnknownInstr, format!("opcode {}", instr)))?;
        match op {
            Opcode::Nop => self.inc_pc(),
            Opcode::Done => {
                self.state = VmState::Done;
                Ok(())
            }
            Opcode::Pushnil => {
                self.inc_pc()?;
                self.push_nil();
                Ok(())
            }
            Opcode::Dup => {
                self.inc_pc()?;
                self.dup()
            }
            Opcode::Pop => {
                self.pop()?;
                self.inc_pc()
            }
            Opcode::Ret0 => {
                self.ret0()?;
                self.assert_pc(self.pc)
            }
            Opcode::Ret1 => {
                self.ret1()?;
                self.assert_pc(self.pc)
            }
            Opcode::Add => {
                self.binary_arith(op)?;
                self.inc_pc()
            }
            Opcode::Sub => {
                self.binary_arith(op)?;
                self.inc_pc()
            }
            Opcode::Mul => {
                self.binary_arith(op)?;
                self.inc_pc()
            }
            Opcode::Div => {
                self.binary_arith(op)?;
                self.inc_pc()
            }
            Opcode::Mod => {
                self.modulo()?;
                self.inc_pc()
            }
            Opcode::Pow => {
                self.power()?;
                self.inc_pc()
            }
            Opcode::Unm => {
                self.unary_minus()?;
                self.inc_pc()
            }
            Opcode::And | Opcode::Or => {
                self.binary_logic(op)?;
                self.inc_pc()
            }
            Opcode::Not => {
                let v = self.pop()?;
                let truthy = self.heap.get(v).is_truthy();
                self.push_int(if truthy { 0 } else { 1 });
                self.inc_pc()
            }
            Opcode::Eq | Opcode::Neq => {
                self.equality(op == Opcode::Eq)?;
                self.inc_pc()
            }
            Opcode::Gt | Opcode::Gte | Opcode::Lt | Opcode::Lte => {
                self.comparison(op)?;
                self.inc_pc()
            }
            Opcode::Gload => {
                self.inc_pc()?;
                self.gload()
            }
            Opcode::Gstore => {
                self.inc_pc()?;
                self.gstore()
            }
            Opcode::Pusht => {
                self.push_table();
                self.inc_pc()
            }
            Opcode::Tput => {
                self.tput()?;
                self.inc_pc()
            }
            Opcode::Tget => {
                self.tget()?;
                self.inc_pc()
            }
            Opcode::Callc => {
                self.inc_pc()?;
                self.callc()?;
                self.assert_pc(self.pc)
            }
            Opcode::Calls => {
                self.inc_pc()?;
                self.calls()?;
                self.assert_pc(self.pc)
            }
            Opcode::Pushf => {
                self.inc_pc()?;
                let arg = self.read_arg()?;
                self.push_float(f32::from_le_bytes(arg));
                Ok(())
            }
            Opcode::Pushi => {
                self.inc_pc()?;
                let arg = self.read_arg()?;
                self.push_int(i32::from_le_bytes(arg));
                Ok(())
            }
            Opcode::Pushs => {
                self.inc_pc()?;
                let arg = self.read_arg()?;
                self.pushs(u32::from_le_bytes(arg) as StringId)
            }
            Opcode::Pushcn => {
                self.inc_pc()?;
                let arg = self.read_arg()?;
                self.push_native_closure(u32::from_le_bytes(arg));
                Ok(())
            }
            Opcode::Pushcc => {
                self.inc_pc()?;
                let arg = self.read_arg()?;
                self.push_foreign_closure(u32::from_le_bytes(arg));
                Ok(())
            }
            Opcode::Pushl => {
                self.inc_pc()?;
                let arg = self.read_arg()?;
                self.push_lambda(u32::from_le_bytes(arg));
                Ok(())
            }
            Opcode::Lload => {
                self.inc_pc()?;
                let arg = self.read_arg()?;
                self.lload(u32::from_le_bytes(arg) as usize)
            }
            Opcode::Lstore => {
                self.inc_pc()?;
                let arg = self.read_arg()?;
                self.lstore(u32::from_le_bytes(arg) as usize)
            }
            Opcode::Jump => {
                self.inc_pc()?;
                let arg = self.read_arg()?;
                self.oldpc = self.pc;
                self.pc = u32::from_le_bytes(arg) as usize;
                self.assert_pc(self.pc)
            }
            Opcode::Jumpz | Opcode::Jumpnz => {
                self.inc_pc()?;
                let arg = self.read_arg()?;
                let v = self.pop()?;
                let truthy = self.heap.get(v).is_truthy();
                let jump = if op == Opcode::Jumpz { !truthy } else { truthy };
                if jump {
                    self.oldpc = self.pc;
                    self.pc = u32::from_le_bytes(arg) as usize;
                    self.assert_pc(self.pc)?;
                }
                Ok(())
            }
        }
    }

    /// Pop two numeric operands, promoting to float when either side is.
    fn numeric_operands(&mut self) -> Result<(Value, Value), VmError> {
        self.stack_assert(2)?;
        let rhs = self.stack_at(1)?;
        let lhs = self.stack_at(2)?;
        let (lv, rv) = (self.heap.get(lhs).clone(), self.heap.get(rhs).clone());
        for v in [&lv, &rv] {
            if !matches!(v, Value::Int(_) | Value::Float(_)) {
                return Err(VmError::new(
                    VmErrorKind::TypeMismatch,
                    format!("expected number, got {}", v.type_tag().desc()),
                ));
            }
        }
        self.pop()?;
        self.pop()?;
        Ok((lv, rv))
    }

    fn binary_arith(&mut self, op: Opcode) -> Result<(), VmError> {
        let (lv, rv) = self.numeric_operands()?;
        match (lv, rv) {
            (Value::Int(a), Value::Int(b)) => {
                let r = match op {
                    Opcode::Add => a.wrapping_add(b),
                    Opcode::Sub => a.wrapping_sub(b),
                    Opcode::Mul => a.wrapping_mul(b),
                    Opcode::Div => {
                        if b == 0 {
                            return Err(VmError::new(
                                VmErrorKind::TypeMismatch,
                                "division by zero",
                            ));
                        }
                        a.wrapping_div(b)
                    }
                    _ => unreachable!("arith op"),
                };
                self.push_int(r);
            }
            (lv, rv) => {
                let a = match lv {
                    Value::Int(i) => i as f32,
                    Value::Float(f) => f,
                    _ => unreachable!("checked numeric"),
                };
                let b = match rv {
                    Value::Int(i) => i as f32,
                    Value::Float(f) => f,
                    _ => unreachable!("checked numeric"),
                };
                let r = match op {
                    Opcode::Add => a + b,
                    Opcode::Sub => a - b,
                    Opcode::Mul => a * b,
                    Opcode::Div => a / b,
                    _ => unreachable!("arith op"),
                };
                self.push_float(r);
            }
        }
        Ok(())
    }

    /// `mod` is Euclidean for positive divisors: the result is shifted
    /// into [0, divisor).
    fn modulo(&mut self) -> Result<(), VmError> {
        let (lv, rv) = self.numeric_operands()?;
        match (lv, rv) {
            (Value::Int(a), Value::Int(b)) => {
                if b == 0 {
                    return Err(VmError::new(VmErrorKind::TypeMismatch, "modulo by zero"));
                }
                let mut r = a.wrapping_rem(b);
                if r < 0 {
                    r = r.wrapping_add(b);
                }
                self.push_int(r);
            }
            (lv, rv) => {
                let a = match lv {
                    Value::Int(i) => i as f32,
                    Value::Float(f) => f,
                    _ => unreachable!("checked numeric"),
                };
                let b = match rv {
                    Value::Int(i) => i as f32,
                    Value::Float(f) => f,
                    _ => unreachable!("checked numeric"),
                };
                let mut r = a % b;
                if r < 0.0 {
                    r += b;
                }
                self.push_float(r);
            }
        }
        Ok(())
    }

    fn power(&mut self) -> Result<(), VmError> {
        let (lv, rv) = self.numeric_operands()?;
        let a = match lv {
            Value::Int(i) => i as f32,
            Value::Float(f) => f,
            _ => unreachable!("checked numeric"),
        };
        let b = match rv {
            Value::Int(i) => i as f32,
            Value::Float(f) => f,
            _ => unreachable!("checked numeric"),
        };
        self.push_float(a.powf(b));
        Ok(())
    }

    fn unary_minus(&mut self) -> Result<(), VmError> {
        let v = self.pop()?;
        match self.heap.get(v).clone() {
            Value::Int(i) => {
                self.push_int(i.wrapping_neg());
                Ok(())
            }
            Value::Float(f) => {
                self.push_float(-f);
                Ok(())
            }
            other => Err(VmError::new(
                VmErrorKind::TypeMismatch,
                format!("expected number, got {}", other.type_tag().desc()),
            )),
        }
    }

    fn binary_logic(&mut self, op: Opcode) -> Result<(), VmError> {
        self.stack_assert(2)?;
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        let a = self.heap.get(lhs).is_truthy();
        let b = self.heap.get(rhs).is_truthy();
        let r = match op {
            Opcode::And => a && b,
            Opcode::Or => a || b,
            _ => unreachable!("logic op"),
        };
        self.push_int(r as i32);
        Ok(())
    }

    fn equality(&mut self, want_eq: bool) -> Result<(), VmError> {
        self.stack_assert(2)?;
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        // Handle identity holds for tables (and trivially for any value).
        let eq = lhs == rhs || values_eq(self.heap.get(lhs), self.heap.get(rhs));
        self.push_int((eq == want_eq) as i32);
        Ok(())
    }

    fn comparison(&mut self, op: Opcode) -> Result<(), VmError> {
        self.stack_assert(2)?;
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        let ord = values_cmp(self.heap.get(lhs), self.heap.get(rhs)).map_err(|e| {
            VmError::new(VmErrorKind::TypeMismatch, e.to_string())
        })?;
        let r = match op {
            Opcode::Gt => ord == std::cmp::Ordering::Greater,
            Opcode::Gte => ord != std::cmp::Ordering::Less,
            Opcode::Lt => ord == std::cmp::Ordering::Less,
            Opcode::Lte => ord != std::cmp::Ordering::Greater,
            _ => unreachable!("cmp op"),
        };
        self.push_int(r as i32);
        Ok(())
    }

    // ---- messaging ----

    /// Deliver one received radio packet into the input queues.
    pub fn receive_packet(&mut self, data: &[u8]) {
        self.inmsgs.receive_packet(data);
    }

    /// Assemble and return this step's outbound radio packet.
    pub fn send_packet(&mut self) -> Vec<u8> {
        self.outmsgs
            .assemble_packet(self.robot, self.config.radio_mtu, &self.heap)
    }

    /// Drain the input queues, dispatching each message, then age the
    /// swarm-members table.
    pub fn process_in_messages(&mut self) -> VmState {
        while self.state == VmState::Ready {
            let Some((rid, payload)) = self.inmsgs.extract() else {
                break;
            };
            self.dispatch_message(rid, &payload);
        }
        let max_age = self.config.swarm_member_max_age;
        self.swarm_members.update(max_age);
        self.state
    }

    fn dispatch_message(&mut self, rid: u16, payload: &[u8]) {
        let mut rd = buzz_core::msg::ByteReader::new(payload);
        let mtype = match rd.read_u8().ok().and_then(MessageType::from_u8) {
            Some(t) => t,
            None => {
                tracing::warn!(robot = self.robot, "malformed message received");
                return;
            }
        };
        match mtype {
            MessageType::Broadcast => {
                let topic =
                    match buzz_core::msg::deserialize_value(&mut rd, &mut self.heap, &mut self.strings)
                    {
                        Ok(t) => t,
                        Err(_) => {
                            tracing::warn!(robot = self.robot, "malformed broadcast received");
                            return;
                        }
                    };
                let sid = match self.heap.get(topic) {
                    Value::String(s) => s.id,
                    _ => {
                        tracing::warn!(robot = self.robot, "broadcast topic is not a string");
                        return;
                    }
                };
                let listener = match self.listeners.get(&sid) {
                    Some(&l) => l,
                    None => return,
                };
                let value =
                    match buzz_core::msg::deserialize_value(&mut rd, &mut self.heap, &mut self.strings)
                    {
                        Ok(v) => v,
                        Err(_) => {
                            tracing::warn!(robot = self.robot, "malformed broadcast received");
                            return;
                        }
                    };
                self.push(listener);
                self.push(topic);
                self.push(value);
                self.push_int(rid as i32);
                self.closure_call(3);
            }
            MessageType::VStigPut | MessageType::VStigQuery => {
                let id = match rd.read_u16() {
                    Ok(id) => id,
                    Err(_) => {
                        tracing::warn!(robot = self.robot, "malformed stigmergy message received");
                        return;
                    }
                };
                let decoded = vstig::deserialize_entry(&mut rd, &mut self.heap, &mut self.strings);
                let (key, entry) = match decoded {
                    Ok(x) => x,
                    Err(_) => {
                        tracing::warn!(robot = self.robot, "malformed stigmergy message received");
                        return;
                    }
                };
                if mtype == MessageType::VStigPut {
                    vstig::process_put(self, id, key, entry);
                } else {
                    vstig::process_query(self, id, key, entry);
                }
            }
            MessageType::SwarmList => {
                let mut ids = Vec::new();
                let ok = rd.read_u16().map(|n| {
                    for _ in 0..n {
                        match rd.read_u16() {
                            Ok(id) => ids.push(id),
                            Err(_) => return false,
                        }
                    }
                    true
                });
                match ok {
                    Ok(true) if !ids.is_empty() => self.swarm_members.refresh(rid, ids),
                    Ok(true) => {}
                    _ => tracing::warn!(robot = self.robot, "malformed swarm list received"),
                }
            }
            MessageType::SwarmJoin => match rd.read_u16() {
                Ok(sid) => self.swarm_members.join(rid, sid),
                Err(_) => tracing::warn!(robot = self.robot, "malformed swarm join received"),
            },
            MessageType::SwarmLeave => match rd.read_u16() {
                Ok(sid) => self.swarm_members.leave(rid, sid),
                Err(_) => tracing::warn!(robot = self.robot, "malformed swarm leave received"),
            },
        }
    }

    /// Per-step outbound housekeeping: enqueue the periodic swarm-list
    /// heartbeat when its countdown expires.
    pub fn process_out_messages(&mut self) {
        if self.swarmbroadcast > 0 {
            self.swarmbroadcast -= 1;
        }
        if self.swarmbroadcast == 0 && !self.swarms.is_empty() {
            self.swarmbroadcast = self.config.swarm_broadcast_period;
            let ids: Vec<u16> = self
                .swarms
                .iter()
                .filter(|&(_, &member)| member)
                .map(|(&id, _)| id)
                .collect();
            self.outmsgs.append(OutMessage::SwarmList { swarms: ids });
            tracing::debug!(robot = self.robot, "swarm list heartbeat queued");
        }
    }

    // ---- neighbors passthrough ----

    /// Rebuild the `neighbors` global for a new step.
    pub fn neighbors_reset(&mut self) {
        neighbors::reset(self);
    }

    /// Record one neighbor observation for this step.
    pub fn neighbors_add(&mut self, robot: u16, distance: f32, azimuth: f32, elevation: f32) {
        neighbors::add(self, robot, distance, azimuth, elevation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buzz_core::msg::{write_u16 as w16};

    /// Hand-assemble a bytecode buffer: empty string table + given code.
    fn bytecode(strings: &[&str], code: &[u8]) -> Vec<u8> {
        let mut b = Vec::new();
        w16(&mut b, strings.len() as u16);
        for s in strings {
            b.extend_from_slice(s.as_bytes());
            b.push(0);
        }
        // Registration prologue end marker.
        b.push(Opcode::Nop as u8);
        b.extend_from_slice(code);
        b
    }

    fn op(o: Opcode) -> u8 {
        o as u8
    }

    fn with_i32(o: Opcode, v: i32) -> Vec<u8> {
        let mut b = vec![o as u8];
        b.extend_from_slice(&v.to_le_bytes());
        b
    }

    fn with_f32(o: Opcode, v: f32) -> Vec<u8> {
        let mut b = vec![o as u8];
        b.extend_from_slice(&v.to_le_bytes());
        b
    }

    fn run(strings: &[&str], code: Vec<u8>) -> Vm {
        let mut vm = Vm::new(1);
        assert_eq!(vm.set_bcode(bytecode(strings, &code)), VmState::Ready);
        vm.execute_script();
        vm
    }

    fn top_value(vm: &Vm) -> Value {
        let r = vm.stack_at(1).expect("a result on the stack");
        vm.heap.get(r).clone()
    }

    #[test]
    fn test_push_pop_is_noop() {
        let mut code = with_i32(Opcode::Pushi, 5);
        code.push(op(Opcode::Pushnil));
        code.push(op(Opcode::Pop));
        code.push(op(Opcode::Done));
        let vm = run(&[], code);
        assert_eq!(vm.state(), VmState::Done);
        assert!(matches!(top_value(&vm), Value::Int(5)));
    }

    #[test]
    fn test_add_int_promotion() {
        let mut code = with_i32(Opcode::Pushi, 2);
        code.extend(with_f32(Opcode::Pushf, 2.5));
        code.push(op(Opcode::Add));
        code.push(op(Opcode::Done));
        let vm = run(&[], code);
        match top_value(&vm) {
            Value::Float(f) => assert_eq!(f, 4.5),
            other => panic!("expected float, got {:?}", other),
        }
    }

    #[test]
    fn test_sub_operand_order() {
        let mut code = with_i32(Opcode::Pushi, 10);
        code.extend(with_i32(Opcode::Pushi, 3));
        code.push(op(Opcode::Sub));
        code.push(op(Opcode::Done));
        let vm = run(&[], code);
        assert!(matches!(top_value(&vm), Value::Int(7)));
    }

    #[test]
    fn test_mod_is_euclidean_for_positive_divisor() {
        for (a, n, expected) in [(-7, 3, 2), (7, 3, 1), (-9, 3, 0)] {
            let mut code = with_i32(Opcode::Pushi, a);
            code.extend(with_i32(Opcode::Pushi, n));
            code.push(op(Opcode::Mod));
            code.push(op(Opcode::Done));
            let vm = run(&[], code);
            match top_value(&vm) {
                Value::Int(r) => assert_eq!(r, expected, "{} mod {}", a, n),
                other => panic!("expected int, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_pow_produces_float() {
        let mut code = with_i32(Opcode::Pushi, 2);
        code.extend(with_i32(Opcode::Pushi, 10));
        code.push(op(Opcode::Pow));
        code.push(op(Opcode::Done));
        let vm = run(&[], code);
        match top_value(&vm) {
            Value::Float(f) => assert_eq!(f, 1024.0),
            other => panic!("expected float, got {:?}", other),
        }
    }

    #[test]
    fn test_logic_truthiness() {
        // nil and 1 -> 0; 1 or nil -> 1.
        let mut code = vec![op(Opcode::Pushnil)];
        code.extend(with_i32(Opcode::Pushi, 1));
        code.push(op(Opcode::And));
        code.push(op(Opcode::Done));
        let vm = run(&[], code);
        assert!(matches!(top_value(&vm), Value::Int(0)));

        let mut code = with_i32(Opcode::Pushi, 1);
        code.push(op(Opcode::Pushnil));
        code.push(op(Opcode::Or));
        code.push(op(Opcode::Done));
        let vm = run(&[], code);
        assert!(matches!(top_value(&vm), Value::Int(1)));
    }

    #[test]
    fn test_string_number_comparison_errors() {
        let mut code = with_i32(Opcode::Pushs, 0);
        code.extend(with_i32(Opcode::Pushi, 42));
        code.push(op(Opcode::Lt));
        code.push(op(Opcode::Done));
        let vm = run(&["42"], code);
        assert_eq!(vm.state(), VmState::Error);
        assert_eq!(vm.error().unwrap().kind, VmErrorKind::TypeMismatch);
    }

    #[test]
    fn test_jumpz_pops_exactly_one() {
        // pushi 7, pushi 0, jumpz over a pushi 99; stack ends [7].
        let mut vm = Vm::new(1);
        let mut code = Vec::new();
        code.extend(with_i32(Opcode::Pushi, 7));
        code.extend(with_i32(Opcode::Pushi, 0));
        let hdr = 2 + 1; // string count + nop
        // jumpz target: the nop just past the skipped pushi 99.
        let target = (hdr + code.len() + 5 + 5) as u32;
        code.push(Opcode::Jumpz as u8);
        code.extend_from_slice(&target.to_le_bytes());
        code.extend(with_i32(Opcode::Pushi, 99));
        code.push(op(Opcode::Nop));
        code.push(op(Opcode::Done));
        assert_eq!(vm.set_bcode(bytecode(&[], &code)), VmState::Ready);
        vm.execute_script();
        assert_eq!(vm.state(), VmState::Done);
        assert_eq!(vm.stack_size(), 1);
        assert!(matches!(top_value(&vm), Value::Int(7)));
    }

    #[test]
    fn test_table_put_get_and_nil_erase() {
        let mut vm = Vm::new(1);
        assert_eq!(
            vm.set_bcode(bytecode(&["k"], &[op(Opcode::Done)])),
            VmState::Ready
        );
        let t = vm.heap.new_obj(Value::Table(Table::new()));
        let key = TableKey::Int(4);
        let v = vm.heap.new_obj(Value::Int(9));
        vm.table_bind(t, key.clone(), v);
        assert!(vm.table_get(t, &key).is_some());
        let nil = vm.heap.new_obj(Value::Nil);
        vm.table_bind(t, key.clone(), nil);
        assert!(vm.table_get(t, &key).is_none());
        match vm.heap.get(t) {
            Value::Table(tab) => assert!(tab.is_empty()),
            other => panic!("expected table, got {:?}", other),
        }
    }

    #[test]
    fn test_closure_stored_in_table_binds_self() {
        let mut vm = Vm::new(1);
        assert_eq!(
            vm.set_bcode(bytecode(&[], &[op(Opcode::Done)])),
            VmState::Ready
        );
        let t = vm.heap.new_obj(Value::Table(Table::new()));
        let nil = vm.heap.new_obj(Value::Nil);
        let c = vm
            .heap
            .new_obj(Value::Closure(Closure::new(ClosureRef::Native(0), vec![nil])));
        vm.table_bind(t, TableKey::Int(0), c);
        let bound = vm.table_get(t, &TableKey::Int(0)).expect("stored");
        match vm.heap.get(bound) {
            Value::Closure(c) => assert_eq!(c.actrec.borrow()[0], t),
            other => panic!("expected closure, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_instruction_errors() {
        let vm = run(&[], vec![200, op(Opcode::Done)]);
        assert_eq!(vm.state(), VmState::Error);
        assert_eq!(vm.error().unwrap().kind, VmErrorKind::UnknownInstr);
    }

    #[test]
    fn test_unknown_string_id_errors() {
        let vm = run(&[], {
            let mut c = with_i32(Opcode::Pushs, 4242);
            c.push(op(Opcode::Done));
            c
        });
        assert_eq!(vm.state(), VmState::Error);
        assert_eq!(vm.error().unwrap().kind, VmErrorKind::UnknownString);
    }

    #[test]
    fn test_error_state_is_sticky() {
        let mut vm = run(&[], vec![200]);
        assert_eq!(vm.state(), VmState::Error);
        assert_eq!(vm.step(), VmState::Error);
        assert_eq!(vm.execute_script(), VmState::Error);
    }

    #[test]
    fn test_foreign_function_call() {
        fn double(vm: &mut Vm) -> VmState {
            crate::stdlib::native(vm, |vm| {
                vm.lnum_assert(1)?;
                vm.lload(1)?;
                let v = vm.stack_at(1)?;
                match vm.heap.get(v).clone() {
                    Value::Int(i) => {
                        vm.push_int(i * 2);
                        vm.ret1()
                    }
                    other => Err(VmError::type_mismatch(TypeTag::Int, other.type_tag())),
                }
            })
        }
        let mut vm = Vm::new(1);
        assert_eq!(
            vm.set_bcode(bytecode(&[], &[op(Opcode::Done)])),
            VmState::Ready
        );
        let id = vm.register_function(double);
        vm.push_foreign_closure(id);
        vm.push_int(21);
        assert_eq!(vm.closure_call(1), VmState::Ready);
        assert!(matches!(top_value(&vm), Value::Int(42)));
    }

    #[test]
    fn test_function_registration_dedups() {
        fn f(vm: &mut Vm) -> VmState {
            vm.state()
        }
        let mut vm = Vm::new(1);
        assert_eq!(vm.register_function(f), vm.register_function(f));
    }

    #[test]
    fn test_gc_runs_during_execution_without_losing_stack() {
        // Enough pushes to trigger several GC passes (threshold starts
        // at 1); everything on the stack must survive.
        let mut code = Vec::new();
        for i in 0..50 {
            code.extend(with_i32(Opcode::Pushi, i));
        }
        code.push(op(Opcode::Done));
        let vm = run(&[], code);
        assert_eq!(vm.state(), VmState::Done);
        assert_eq!(vm.stack_size(), 50);
        assert!(matches!(top_value(&vm), Value::Int(49)));
    }
}
