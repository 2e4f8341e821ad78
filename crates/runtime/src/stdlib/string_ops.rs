//! `string` library
//!
//! Byte-indexed string helpers. Out-of-range indices in `sub` return
//! nil rather than erroring, and `toint`/`tofloat` return nil on
//! unparsable input, matching the language's forgiving conversion
//! behavior.

use buzz_core::value::{TypeTag, Value};

use crate::stdlib::{self, native};
use crate::vm::{BuzzFn, Vm, VmError, VmErrorKind, VmState};

pub(crate) fn register(vm: &mut Vm) {
    let t = stdlib::new_table(vm);
    stdlib::add_method(vm, t, "length", string_length as BuzzFn);
    stdlib::add_method(vm, t, "sub", string_sub as BuzzFn);
    stdlib::add_method(vm, t, "concat", string_concat as BuzzFn);
    stdlib::add_method(vm, t, "tostring", string_tostring as BuzzFn);
    stdlib::add_method(vm, t, "toint", string_toint as BuzzFn);
    stdlib::add_method(vm, t, "tofloat", string_tofloat as BuzzFn);
    vm.set_global("string", t);
}

/// Pop argument `idx` as string text.
fn str_arg(vm: &mut Vm, idx: usize) -> Result<std::sync::Arc<str>, VmError> {
    vm.lload(idx)?;
    let r = vm.type_assert(1, TypeTag::String)?;
    vm.pop()?;
    match vm.heap.get(r) {
        Value::String(s) => Ok(s.text.clone()),
        _ => unreachable!("type asserted"),
    }
}

fn string_length(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(1)?;
        let s = str_arg(vm, 1)?;
        vm.push_int(s.len() as i32);
        vm.ret1()
    })
}

/// `string.sub(s, n [, m])`: bytes n..m (m defaults to the end).
fn string_sub(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        if vm.lnum() != 2 && vm.lnum() != 3 {
            return Err(VmError::new(
                VmErrorKind::WrongArgCount,
                format!("expected 2 or 3 parameters, got {}", vm.lnum()),
            ));
        }
        let s = str_arg(vm, 1)?;
        let len = s.len() as i32;
        let n = stdlib::int_arg(vm, 2)?;
        if n < 0 || n >= len {
            vm.push_nil();
            return vm.ret1();
        }
        let mut m = len;
        if vm.lnum() == 3 {
            m = stdlib::int_arg(vm, 3)?;
            if m < n {
                vm.push_nil();
                return vm.ret1();
            }
            m = m.min(len);
        }
        // Indices are byte offsets; refuse to cut a UTF-8 sequence.
        let sub = match s.get(n as usize..m as usize) {
            Some(sub) => sub.to_string(),
            None => {
                vm.push_nil();
                return vm.ret1();
            }
        };
        let istr = vm.string_register(&sub, false);
        vm.push_string(istr);
        vm.ret1()
    })
}

fn string_concat(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        if vm.lnum() < 2 {
            return Err(VmError::new(
                VmErrorKind::WrongArgCount,
                format!("expected at least 2 parameters, got {}", vm.lnum()),
            ));
        }
        let mut out = String::new();
        for i in 1..=vm.lnum() {
            let s = str_arg(vm, i)?;
            out.push_str(&s);
        }
        let istr = vm.string_register(&out, false);
        vm.push_string(istr);
        vm.ret1()
    })
}

fn string_tostring(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(1)?;
        let r = stdlib::arg(vm, 1)?;
        let text = match vm.heap.get(r) {
            Value::Int(i) => format!("{}", i),
            Value::Float(f) => format!("{:.6}", f),
            _ => {
                vm.push_nil();
                return vm.ret1();
            }
        };
        let istr = vm.string_register(&text, false);
        vm.push_string(istr);
        vm.ret1()
    })
}

/// Longest numeric prefix of `s`, C-conversion style.
fn numeric_prefix(s: &str) -> &str {
    let s = s.trim_start();
    let mut end = 0;
    let bytes = s.as_bytes();
    if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
        end += 1;
    }
    let mut seen_digit = false;
    let mut seen_dot = false;
    while end < bytes.len() {
        match bytes[end] {
            b'0'..=b'9' => {
                seen_digit = true;
                end += 1;
            }
            b'.' if !seen_dot => {
                seen_dot = true;
                end += 1;
            }
            _ => break,
        }
    }
    if seen_digit { &s[..end] } else { "" }
}

fn string_toint(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(1)?;
        let s = str_arg(vm, 1)?;
        match numeric_prefix(&s).parse::<f64>() {
            Ok(v) => {
                vm.push_int(v as i32);
            }
            Err(_) => {
                vm.push_nil();
            }
        }
        vm.ret1()
    })
}

fn string_tofloat(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(1)?;
        let s = str_arg(vm, 1)?;
        match numeric_prefix(&s).parse::<f32>() {
            Ok(v) => {
                vm.push_float(v);
            }
            Err(_) => {
                vm.push_nil();
            }
        }
        vm.ret1()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_prefix() {
        assert_eq!(numeric_prefix("42abc"), "42");
        assert_eq!(numeric_prefix("  -3.5x"), "-3.5");
        assert_eq!(numeric_prefix("abc"), "");
        assert_eq!(numeric_prefix("+7"), "+7");
        assert_eq!(numeric_prefix("."), "");
    }
}
