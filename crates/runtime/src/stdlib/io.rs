//! `io` library
//!
//! File access for logging and configuration scripts. A successful
//! `fopen` returns a table carrying an opaque `handle` plus the file
//! `name`; the other functions take that table. I/O failures never move
//! the VM to the error state: they are reported through the `io.errno`
//! and `io.error_message` fields, refreshed after every call.

use std::io::{BufRead, BufReader, Write};

use buzz_core::heap::ObjRef;
use buzz_core::value::{ClosureRef, TableKey, TypeTag, Value};

use crate::stdlib::{self, native};
use crate::vm::{BuzzFn, Vm, VmError, VmErrorKind, VmState};

/// Open files of one VM, indexed by the userdata handle minus one.
#[derive(Debug, Default)]
pub(crate) struct IoState {
    files: Vec<Option<std::fs::File>>,
}

impl IoState {
    fn insert(&mut self, f: std::fs::File) -> usize {
        match self.files.iter().position(|slot| slot.is_none()) {
            Some(i) => {
                self.files[i] = Some(f);
                i + 1
            }
            None => {
                self.files.push(Some(f));
                self.files.len()
            }
        }
    }

    fn take(&mut self, handle: usize) -> Option<std::fs::File> {
        self.files.get_mut(handle.wrapping_sub(1))?.take()
    }

    fn get_mut(&mut self, handle: usize) -> Option<&mut std::fs::File> {
        self.files.get_mut(handle.wrapping_sub(1))?.as_mut()
    }
}

pub(crate) fn register(vm: &mut Vm) {
    let t = stdlib::new_table(vm);
    stdlib::add_method(vm, t, "fopen", io_fopen as BuzzFn);
    stdlib::add_method(vm, t, "fclose", io_fclose as BuzzFn);
    stdlib::add_method(vm, t, "fsize", io_fsize as BuzzFn);
    stdlib::add_method(vm, t, "fforeach", io_fforeach as BuzzFn);
    stdlib::add_method(vm, t, "fwrite", io_fwrite as BuzzFn);
    vm.set_global("io", t);
    update_error(vm, None);
}

/// Refresh `io.errno` and `io.error_message` after a call.
fn update_error(vm: &mut Vm, err: Option<&std::io::Error>) {
    let Some(t) = vm.get_global("io") else {
        return;
    };
    let (errno, message) = match err {
        Some(e) => (e.raw_os_error().unwrap_or(-1), e.to_string()),
        None => (0, "No error".to_string()),
    };
    stdlib::add_field(vm, t, "errno", Value::Int(errno));
    let istr = vm.string_register(&message, false);
    let key = TableKey::String(vm.string_register("error_message", true));
    let msg = vm.heap.new_obj(Value::String(istr));
    vm.table_bind(t, key, msg);
}

/// Pull the userdata handle out of a file table argument.
fn file_handle(vm: &mut Vm, idx: usize) -> Result<usize, VmError> {
    vm.lload(idx)?;
    let t = vm.type_assert(1, TypeTag::Table)?;
    vm.pop()?;
    let key = TableKey::String(vm.string_register("handle", true));
    let h = vm.table_get(t, &key).ok_or_else(|| {
        VmError::new(VmErrorKind::TypeMismatch, "expected an open file table")
    })?;
    match vm.heap.get(h) {
        Value::UserData(u) => Ok(*u),
        other => Err(VmError::type_mismatch(TypeTag::UserData, other.type_tag())),
    }
}

/// `io.fopen(path, mode)` with C-style modes `r`, `w`, `a` (plus `+`
/// variants). Returns nil on failure.
fn io_fopen(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(2)?;
        vm.lload(1)?;
        let path = match vm.heap.get(vm.type_assert(1, TypeTag::String)?) {
            Value::String(s) => s.text.to_string(),
            _ => unreachable!("type asserted"),
        };
        vm.pop()?;
        vm.lload(2)?;
        let mode = match vm.heap.get(vm.type_assert(1, TypeTag::String)?) {
            Value::String(s) => s.text.to_string(),
            _ => unreachable!("type asserted"),
        };
        vm.pop()?;
        let mut opts = std::fs::OpenOptions::new();
        match mode.trim_end_matches('b') {
            "r" => opts.read(true),
            "r+" => opts.read(true).write(true),
            "w" => opts.write(true).create(true).truncate(true),
            "w+" => opts.read(true).write(true).create(true).truncate(true),
            "a" => opts.append(true).create(true),
            "a+" => opts.read(true).append(true).create(true),
            _ => {
                return Err(VmError::new(
                    VmErrorKind::TypeMismatch,
                    format!("unknown file mode '{}'", mode),
                ))
            }
        };
        match opts.open(&path) {
            Ok(f) => {
                update_error(vm, None);
                let handle = vm.io.insert(f);
                let t = vm.push_table();
                stdlib::add_field(vm, t, "handle", Value::UserData(handle));
                let name = vm.string_register(&path, false);
                let name_key = TableKey::String(vm.string_register("name", true));
                let name_val = vm.heap.new_obj(Value::String(name));
                vm.table_bind(t, name_key, name_val);
            }
            Err(e) => {
                update_error(vm, Some(&e));
                vm.push_nil();
            }
        }
        vm.ret1()
    })
}

fn io_fclose(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(1)?;
        let handle = file_handle(vm, 1)?;
        // Dropping the file closes it.
        let closed = vm.io.take(handle).is_some();
        if closed {
            update_error(vm, None);
        } else {
            let e = std::io::Error::from(std::io::ErrorKind::NotFound);
            update_error(vm, Some(&e));
        }
        vm.ret0()
    })
}

fn io_fsize(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(1)?;
        let handle = file_handle(vm, 1)?;
        let size = match vm.io.get_mut(handle) {
            Some(f) => match f.metadata() {
                Ok(m) => {
                    update_error(vm, None);
                    m.len() as i32
                }
                Err(e) => {
                    update_error(vm, Some(&e));
                    -1
                }
            },
            None => {
                let e = std::io::Error::from(std::io::ErrorKind::NotFound);
                update_error(vm, Some(&e));
                -1
            }
        };
        vm.push_int(size);
        vm.ret1()
    })
}

/// `io.fforeach(f, closure)`: closure(line) per line, trailing newline
/// stripped.
fn io_fforeach(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(2)?;
        let handle = file_handle(vm, 1)?;
        vm.lload(2)?;
        let c = vm.type_assert(1, TypeTag::Closure)?;
        vm.pop()?;
        // Read everything up front so the closure may itself use io.
        let read: Result<Vec<String>, std::io::Error> = match vm.io.get_mut(handle) {
            Some(f) => {
                let mut lines = Vec::new();
                let mut reader = BufReader::new(f);
                loop {
                    let mut line = String::new();
                    match reader.read_line(&mut line) {
                        Ok(0) => break Ok(lines),
                        Ok(_) => {
                            if line.ends_with('\n') {
                                line.pop();
                                if line.ends_with('\r') {
                                    line.pop();
                                }
                            }
                            lines.push(line);
                        }
                        Err(e) => break Err(e),
                    }
                }
            }
            None => Err(std::io::Error::from(std::io::ErrorKind::NotFound)),
        };
        let lines = match read {
            Ok(lines) => lines,
            Err(e) => {
                update_error(vm, Some(&e));
                return vm.ret0();
            }
        };
        update_error(vm, None);
        vm.heap.pin(c);
        for line in lines {
            vm.push(c);
            let istr = vm.string_register(&line, false);
            vm.push_string(istr);
            if vm.closure_call(1) != VmState::Ready {
                vm.heap.unpin(c);
                return Ok(());
            }
            vm.pop()?;
        }
        vm.heap.unpin(c);
        vm.ret0()
    })
}

/// `io.fwrite(f, ...)`: write each value's text form, then a newline.
fn io_fwrite(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        if vm.lnum() < 2 {
            return Err(VmError::new(
                VmErrorKind::WrongArgCount,
                format!("expected at least 2 parameters, got {}", vm.lnum()),
            ));
        }
        let handle = file_handle(vm, 1)?;
        let mut text = String::new();
        for i in 2..=vm.lnum() {
            let r = stdlib::arg(vm, i)?;
            render(vm, r, &mut text);
        }
        text.push('\n');
        match vm.io.get_mut(handle) {
            Some(f) => {
                let result = f.write_all(text.as_bytes()).and_then(|_| f.flush());
                match result {
                    Ok(()) => update_error(vm, None),
                    Err(e) => update_error(vm, Some(&e)),
                }
            }
            None => {
                let e = std::io::Error::from(std::io::ErrorKind::NotFound);
                update_error(vm, Some(&e));
            }
        }
        vm.ret0()
    })
}

fn render(vm: &Vm, r: ObjRef, out: &mut String) {
    match vm.heap().get(r) {
        Value::Nil => out.push_str("[nil]"),
        Value::Int(i) => out.push_str(&format!("{}", i)),
        Value::Float(f) => out.push_str(&format!("{:.6}", f)),
        Value::String(s) => out.push_str(&s.text),
        Value::Table(t) => out.push_str(&format!("[table with {} elems]", t.len())),
        Value::Closure(c) => match c.target {
            ClosureRef::Native(a) => out.push_str(&format!("[n-closure @{}]", a)),
            ClosureRef::Foreign(a) => out.push_str(&format!("[c-closure @{}]", a)),
        },
        Value::UserData(u) => out.push_str(&format!("[userdata @{}]", u)),
    }
}
