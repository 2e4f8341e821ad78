//! `math` library
//!
//! Numeric helpers plus the `math.rng` table. Most functions accept ints
//! or floats and return floats; `abs`, `min` and `max` preserve the
//! argument type. The rng is a per-VM Mersenne-Twister, reseedable with
//! `setseed`.

use rand::Rng;
use rand_distr::{Distribution, Exp, Normal};
use rand_mt::Mt;

use buzz_core::value::{values_cmp, Value};

use crate::stdlib::{self, native};
use crate::vm::{BuzzFn, Vm, VmError, VmErrorKind, VmState};

pub(crate) fn register(vm: &mut Vm) {
    let t = stdlib::new_table(vm);
    stdlib::add_method(vm, t, "abs", math_abs as BuzzFn);
    stdlib::add_method(vm, t, "log", math_log as BuzzFn);
    stdlib::add_method(vm, t, "log2", math_log2 as BuzzFn);
    stdlib::add_method(vm, t, "log10", math_log10 as BuzzFn);
    stdlib::add_method(vm, t, "exp", math_exp as BuzzFn);
    stdlib::add_method(vm, t, "sqrt", math_sqrt as BuzzFn);
    stdlib::add_method(vm, t, "sin", math_sin as BuzzFn);
    stdlib::add_method(vm, t, "cos", math_cos as BuzzFn);
    stdlib::add_method(vm, t, "tan", math_tan as BuzzFn);
    stdlib::add_method(vm, t, "asin", math_asin as BuzzFn);
    stdlib::add_method(vm, t, "acos", math_acos as BuzzFn);
    stdlib::add_method(vm, t, "atan", math_atan as BuzzFn);
    stdlib::add_method(vm, t, "min", math_min as BuzzFn);
    stdlib::add_method(vm, t, "max", math_max as BuzzFn);
    stdlib::add_field(vm, t, "pi", Value::Float(std::f32::consts::PI));
    let rng = stdlib::new_table(vm);
    stdlib::add_method(vm, rng, "setseed", rng_setseed as BuzzFn);
    stdlib::add_method(vm, rng, "uniform", rng_uniform as BuzzFn);
    stdlib::add_method(vm, rng, "gaussian", rng_gaussian as BuzzFn);
    stdlib::add_method(vm, rng, "exponential", rng_exponential as BuzzFn);
    let rng_key = buzz_core::value::TableKey::String(vm.string_register("rng", true));
    vm.table_bind(t, rng_key, rng);
    vm.set_global("math", t);
}

/// One-float-argument function returning float.
fn unary(vm: &mut Vm, f: impl FnOnce(f32) -> f32) -> Result<(), VmError> {
    vm.lnum_assert(1)?;
    let x = stdlib::float_arg(vm, 1)?;
    vm.push_float(f(x));
    vm.ret1()
}

fn math_abs(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(1)?;
        let x = stdlib::arg(vm, 1)?;
        match vm.heap.get(x).clone() {
            Value::Int(i) => {
                vm.push_int(i.wrapping_abs());
            }
            Value::Float(f) => {
                vm.push_float(f.abs());
            }
            other => {
                return Err(VmError::new(
                    VmErrorKind::TypeMismatch,
                    format!("expected number, got {}", other.type_tag().desc()),
                ))
            }
        }
        vm.ret1()
    })
}

fn math_log(vm: &mut Vm) -> VmState {
    native(vm, |vm| unary(vm, f32::ln))
}

fn math_log2(vm: &mut Vm) -> VmState {
    native(vm, |vm| unary(vm, f32::log2))
}

fn math_log10(vm: &mut Vm) -> VmState {
    native(vm, |vm| unary(vm, f32::log10))
}

fn math_exp(vm: &mut Vm) -> VmState {
    native(vm, |vm| unary(vm, f32::exp))
}

fn math_sqrt(vm: &mut Vm) -> VmState {
    native(vm, |vm| unary(vm, f32::sqrt))
}

fn math_sin(vm: &mut Vm) -> VmState {
    native(vm, |vm| unary(vm, f32::sin))
}

fn math_cos(vm: &mut Vm) -> VmState {
    native(vm, |vm| unary(vm, f32::cos))
}

fn math_tan(vm: &mut Vm) -> VmState {
    native(vm, |vm| unary(vm, f32::tan))
}

fn math_asin(vm: &mut Vm) -> VmState {
    native(vm, |vm| unary(vm, f32::asin))
}

fn math_acos(vm: &mut Vm) -> VmState {
    native(vm, |vm| unary(vm, f32::acos))
}

/// `math.atan(y, x)`
fn math_atan(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(2)?;
        let y = stdlib::float_arg(vm, 1)?;
        let x = stdlib::float_arg(vm, 2)?;
        vm.push_float(y.atan2(x));
        vm.ret1()
    })
}

/// Two-argument extremum preserving the winning argument's type.
fn extremum(vm: &mut Vm, want_min: bool) -> Result<(), VmError> {
    vm.lnum_assert(2)?;
    let a = stdlib::arg(vm, 1)?;
    let b = stdlib::arg(vm, 2)?;
    let ord = values_cmp(vm.heap.get(a), vm.heap.get(b)).map_err(|e| {
        VmError::new(VmErrorKind::TypeMismatch, e.to_string())
    })?;
    let pick_a = if want_min {
        ord != std::cmp::Ordering::Greater
    } else {
        ord != std::cmp::Ordering::Less
    };
    vm.push(if pick_a { a } else { b });
    vm.ret1()
}

fn math_min(vm: &mut Vm) -> VmState {
    native(vm, |vm| extremum(vm, true))
}

fn math_max(vm: &mut Vm) -> VmState {
    native(vm, |vm| extremum(vm, false))
}

fn rng_setseed(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(1)?;
        let seed = stdlib::int_arg(vm, 1)?;
        vm.rng = Mt::new(seed as u32);
        vm.ret0()
    })
}

/// `math.rng.uniform()`, `uniform(max)`, `uniform(min, max)`; the
/// result type follows the argument types.
fn rng_uniform(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        match vm.lnum() {
            0 => {
                let v = vm.rng.gen_range(i32::MIN..=i32::MAX);
                vm.push_int(v);
            }
            1 => {
                vm.lload(1)?;
                let bound = vm.heap.get(vm.stack_at(1)?).clone();
                vm.pop()?;
                match bound {
                    Value::Int(max) => {
                        let (lo, hi) = if max >= 0 { (0, max) } else { (max, 0) };
                        let v = vm.rng.gen_range(lo..=hi);
                        vm.push_int(v);
                    }
                    Value::Float(max) => {
                        let (lo, hi) = if max >= 0.0 { (0.0, max) } else { (max, 0.0) };
                        let v = vm.rng.gen_range(lo..=hi);
                        vm.push_float(v);
                    }
                    other => {
                        return Err(VmError::new(
                            VmErrorKind::TypeMismatch,
                            format!("expected number, got {}", other.type_tag().desc()),
                        ))
                    }
                }
            }
            2 => {
                vm.lload(1)?;
                let min = vm.heap.get(vm.stack_at(1)?).clone();
                vm.pop()?;
                vm.lload(2)?;
                let max = vm.heap.get(vm.stack_at(1)?).clone();
                vm.pop()?;
                match (min, max) {
                    (Value::Int(a), Value::Int(b)) => {
                        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                        let v = vm.rng.gen_range(lo..=hi);
                        vm.push_int(v);
                    }
                    (min, max) => {
                        let a = match min {
                            Value::Int(i) => i as f32,
                            Value::Float(f) => f,
                            other => {
                                return Err(VmError::new(
                                    VmErrorKind::TypeMismatch,
                                    format!(
                                        "expected number, got {}",
                                        other.type_tag().desc()
                                    ),
                                ))
                            }
                        };
                        let b = match max {
                            Value::Int(i) => i as f32,
                            Value::Float(f) => f,
                            other => {
                                return Err(VmError::new(
                                    VmErrorKind::TypeMismatch,
                                    format!(
                                        "expected number, got {}",
                                        other.type_tag().desc()
                                    ),
                                ))
                            }
                        };
                        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                        let v = vm.rng.gen_range(lo..=hi);
                        vm.push_float(v);
                    }
                }
            }
            n => {
                return Err(VmError::new(
                    VmErrorKind::WrongArgCount,
                    format!("expected 0, 1, or 2 parameters, got {}", n),
                ))
            }
        }
        vm.ret1()
    })
}

/// `math.rng.gaussian([stddev [, mean]])`
fn rng_gaussian(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        let mut stddev = 1.0f32;
        let mut mean = 0.0f32;
        match vm.lnum() {
            0 => {}
            1 => stddev = stdlib::float_arg(vm, 1)?,
            2 => {
                stddev = stdlib::float_arg(vm, 1)?;
                mean = stdlib::float_arg(vm, 2)?;
            }
            n => {
                return Err(VmError::new(
                    VmErrorKind::WrongArgCount,
                    format!("expected 0, 1, or 2 parameters, got {}", n),
                ))
            }
        }
        let dist = Normal::new(mean, stddev).map_err(|e| {
            VmError::new(VmErrorKind::TypeMismatch, format!("gaussian: {}", e))
        })?;
        let v = dist.sample(&mut vm.rng);
        vm.push_float(v);
        vm.ret1()
    })
}

/// `math.rng.exponential(mean)`
fn rng_exponential(vm: &mut Vm) -> VmState {
    native(vm, |vm| {
        vm.lnum_assert(1)?;
        let mean = stdlib::float_arg(vm, 1)?;
        let dist = Exp::new(1.0 / mean).map_err(|e| {
            VmError::new(VmErrorKind::TypeMismatch, format!("exponential: {}", e))
        })?;
        let v = dist.sample(&mut vm.rng);
        vm.push_float(v);
        vm.ret1()
    })
}
