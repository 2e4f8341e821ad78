//! End-to-end language tests: compile a script, run it on a fresh VM,
//! inspect the globals it leaves behind.

use buzz_core::value::{TableKey, Value};
use buzz_runtime::{Vm, VmState};
use bzzc::CompilerConfig;

fn compile(source: &str) -> Vec<u8> {
    bzzc::compile_source(source, "test.bzz", &CompilerConfig::default())
        .expect("script compiles")
        .bcode
}

fn run_script(source: &str) -> Vm {
    let mut vm = Vm::new(1);
    assert_eq!(vm.set_bcode(compile(source)), VmState::Ready);
    let state = vm.execute_script();
    assert_eq!(state, VmState::Done, "vm error: {}", vm.error_message());
    vm
}

fn global(vm: &Vm, name: &str) -> Value {
    match vm.get_global(name) {
        Some(r) => vm.heap().get(r).clone(),
        None => Value::Nil,
    }
}

#[test]
fn test_arithmetic() {
    let vm = run_script("var a = 3\nvar b = 2.5\nresult = a * b");
    match global(&vm, "result") {
        Value::Float(f) => assert_eq!(f, 7.5),
        other => panic!("expected float, got {:?}", other),
    }
}

#[test]
fn test_table_methods() {
    let vm = run_script(
        "var t = { .a = 1, .b = 2 }\n\
         t.inc = function() { self.a = self.a + 10 }\n\
         t.inc()\n\
         result = t.a",
    );
    match global(&vm, "result") {
        Value::Int(11) => {}
        other => panic!("expected 11, got {:?}", other),
    }
}

#[test]
fn test_mod_semantics() {
    let vm = run_script("result = (-7) % 3");
    match global(&vm, "result") {
        Value::Int(2) => {}
        other => panic!("expected 2, got {:?}", other),
    }
}

#[test]
fn test_closure_capture() {
    let vm = run_script(
        "function make(x) { return function() { x = x + 1\nreturn x } }\n\
         var c = make(10)\n\
         result = c() + c()",
    );
    match global(&vm, "result") {
        Value::Int(23) => {}
        other => panic!("expected 23, got {:?}", other),
    }
}

#[test]
fn test_two_closures_are_independent() {
    let vm = run_script(
        "function make(x) { return function() { x = x + 1\nreturn x } }\n\
         var c1 = make(100)\n\
         var c2 = make(200)\n\
         result = c1() + c2()",
    );
    match global(&vm, "result") {
        Value::Int(302) => {}
        other => panic!("expected 302, got {:?}", other),
    }
}

#[test]
fn test_recursion() {
    let vm = run_script(
        "function fact(n) { if(n < 2) { return 1 }\nreturn n * fact(n - 1) }\n\
         result = fact(6)",
    );
    match global(&vm, "result") {
        Value::Int(720) => {}
        other => panic!("expected 720, got {:?}", other),
    }
}

#[test]
fn test_if_else() {
    let vm = run_script("if(3 > 2) { r = 1 } else { r = 2 }");
    assert!(matches!(global(&vm, "r"), Value::Int(1)));
    let vm = run_script("if(3 < 2) { r = 1 } else { r = 2 }");
    assert!(matches!(global(&vm, "r"), Value::Int(2)));
}

#[test]
fn test_while_loop() {
    let vm = run_script(
        "i = 0\n\
         total = 0\n\
         while(i < 5) {\n\
           total = total + i\n\
           i = i + 1\n\
         }",
    );
    assert!(matches!(global(&vm, "total"), Value::Int(10)));
}

#[test]
fn test_for_loop() {
    let vm = run_script(
        "total = 0\n\
         for(i = 1, i <= 4, i = i + 1) {\n\
           total = total + i\n\
         }",
    );
    assert!(matches!(global(&vm, "total"), Value::Int(10)));
}

#[test]
fn test_logic_and_not() {
    let vm = run_script("r = not (1 > 2) and (3 != 4)");
    assert!(matches!(global(&vm, "r"), Value::Int(1)));
}

#[test]
fn test_table_indexing() {
    let vm = run_script(
        "t = {}\n\
         t[3] = \"three\"\n\
         t[1.5] = \"one and a half\"\n\
         a = t[3]\n\
         b = t[1.5]\n\
         missing = t[9]",
    );
    match global(&vm, "a") {
        Value::String(s) => assert_eq!(&*s.text, "three"),
        other => panic!("expected string, got {:?}", other),
    }
    match global(&vm, "b") {
        Value::String(s) => assert_eq!(&*s.text, "one and a half"),
        other => panic!("expected string, got {:?}", other),
    }
    assert!(matches!(global(&vm, "missing"), Value::Nil));
}

#[test]
fn test_nil_erases_table_entry() {
    let vm = run_script(
        "t = { .a = 1, .b = 2 }\n\
         t.a = nil\n\
         n = size(t)",
    );
    assert!(matches!(global(&vm, "n"), Value::Int(1)));
}

#[test]
fn test_robot_id_global() {
    let source = "result = id";
    let mut vm = Vm::new(42);
    assert_eq!(vm.set_bcode(compile(source)), VmState::Ready);
    assert_eq!(vm.execute_script(), VmState::Done);
    assert!(matches!(global(&vm, "result"), Value::Int(42)));
}

#[test]
fn test_string_library() {
    let vm = run_script(
        "s = string.concat(\"foo\", \"bar\")\n\
         n = string.length(s)\n\
         sub = string.sub(s, 1, 4)\n\
         missing = string.sub(s, 99)\n\
         i = string.toint(\"42\")\n\
         f = string.tofloat(\"2.5\")\n\
         bad = string.toint(\"nope\")",
    );
    match global(&vm, "s") {
        Value::String(s) => assert_eq!(&*s.text, "foobar"),
        other => panic!("expected string, got {:?}", other),
    }
    assert!(matches!(global(&vm, "n"), Value::Int(6)));
    match global(&vm, "sub") {
        Value::String(s) => assert_eq!(&*s.text, "oob"),
        other => panic!("expected string, got {:?}", other),
    }
    assert!(matches!(global(&vm, "missing"), Value::Nil));
    assert!(matches!(global(&vm, "i"), Value::Int(42)));
    match global(&vm, "f") {
        Value::Float(f) => assert_eq!(f, 2.5),
        other => panic!("expected float, got {:?}", other),
    }
    assert!(matches!(global(&vm, "bad"), Value::Nil));
}

#[test]
fn test_math_library() {
    let vm = run_script(
        "a = math.abs(-4)\n\
         s = math.sqrt(16.0)\n\
         mn = math.min(3, 2.5)\n\
         mx = math.max(3, 2.5)\n\
         p = math.pi",
    );
    assert!(matches!(global(&vm, "a"), Value::Int(4)));
    match global(&vm, "s") {
        Value::Float(f) => assert_eq!(f, 4.0),
        other => panic!("expected float, got {:?}", other),
    }
    match global(&vm, "mn") {
        Value::Float(f) => assert_eq!(f, 2.5),
        other => panic!("expected float, got {:?}", other),
    }
    assert!(matches!(global(&vm, "mx"), Value::Int(3)));
    match global(&vm, "p") {
        Value::Float(f) => assert!((f - std::f32::consts::PI).abs() < 1e-6),
        other => panic!("expected float, got {:?}", other),
    }
}

#[test]
fn test_rng_is_deterministic_after_seed() {
    let vm1 = run_script("math.rng.setseed(7)\nr = math.rng.uniform(1000)");
    let vm2 = run_script("math.rng.setseed(7)\nr = math.rng.uniform(1000)");
    let (a, b) = (global(&vm1, "r"), global(&vm2, "r"));
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => {
            assert_eq!(x, y);
            assert!((0..=1000).contains(&x));
        }
        other => panic!("expected ints, got {:?}", other),
    }
}

#[test]
fn test_object_functions() {
    let vm = run_script(
        "t = { .a = 1, .b = 2, .c = 3 }\n\
         n = size(t)\n\
         ty = type(t)\n\
         sum = reduce(t, function(k, v, acc) { return acc + v }, 0)\n\
         doubled = map(t, function(k, v) { return v * 2 })\n\
         d = doubled.b",
    );
    assert!(matches!(global(&vm, "n"), Value::Int(3)));
    match global(&vm, "ty") {
        Value::String(s) => assert_eq!(&*s.text, "table"),
        other => panic!("expected string, got {:?}", other),
    }
    assert!(matches!(global(&vm, "sum"), Value::Int(6)));
    assert!(matches!(global(&vm, "d"), Value::Int(4)));
}

#[test]
fn test_clone_is_deep() {
    let vm = run_script(
        "t = { .inner = { .x = 1 } }\n\
         u = clone(t)\n\
         u.inner.x = 99\n\
         orig = t.inner.x\n\
         copy = u.inner.x",
    );
    assert!(matches!(global(&vm, "orig"), Value::Int(1)));
    assert!(matches!(global(&vm, "copy"), Value::Int(99)));
}

#[test]
fn test_string_number_comparison_is_error() {
    let mut vm = Vm::new(1);
    assert_eq!(vm.set_bcode(compile("r = \"5\" < 6")), VmState::Ready);
    assert_eq!(vm.execute_script(), VmState::Error);
}

#[test]
fn test_pow_always_float() {
    let vm = run_script("r = 2 ^ 10");
    match global(&vm, "r") {
        Value::Float(f) => assert_eq!(f, 1024.0),
        other => panic!("expected float, got {:?}", other),
    }
}

#[test]
fn test_io_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.txt");
    let source = format!(
        "f = io.fopen(\"{p}\", \"w\")\n\
         io.fwrite(f, \"alpha\")\n\
         io.fwrite(f, \"beta \", 42)\n\
         io.fclose(f)\n\
         g = io.fopen(\"{p}\", \"r\")\n\
         n = io.fsize(g)\n\
         lines = 0\n\
         last = nil\n\
         io.fforeach(g, function(line) {{\n\
           lines = lines + 1\n\
           last = line\n\
         }})\n\
         io.fclose(g)\n\
         e = io.errno",
        p = path.display()
    );
    let vm = run_script(&source);
    assert!(matches!(global(&vm, "lines"), Value::Int(2)));
    match global(&vm, "last") {
        Value::String(s) => assert_eq!(&*s.text, "beta 42"),
        other => panic!("expected string, got {:?}", other),
    }
    match global(&vm, "n") {
        Value::Int(n) => assert!(n > 0),
        other => panic!("expected int, got {:?}", other),
    }
    assert!(matches!(global(&vm, "e"), Value::Int(0)));
}

#[test]
fn test_fopen_failure_sets_errno_not_error_state() {
    let vm = run_script(
        "f = io.fopen(\"/definitely/not/a/path\", \"r\")\n\
         e = io.errno",
    );
    assert!(matches!(global(&vm, "f"), Value::Nil));
    match global(&vm, "e") {
        Value::Int(e) => assert_ne!(e, 0),
        other => panic!("expected int, got {:?}", other),
    }
}

#[test]
fn test_table_key_access_via_errno_field() {
    // io.errno must be reachable as a plain table field.
    let vm = run_script("e = io.errno");
    assert!(matches!(global(&vm, "e"), Value::Int(0)));
}

#[test]
fn test_undeclared_assignment_creates_global() {
    let vm = run_script("function f() { hidden = 7 }\nf()");
    assert!(matches!(global(&vm, "hidden"), Value::Int(7)));
}

#[test]
fn test_include_resolution_via_env_path() {
    let dir = tempfile::tempdir().unwrap();
    let lib = dir.path().join("lib.bzz");
    std::fs::write(&lib, "function helper() { return 5 }\n").unwrap();
    let main = dir.path().join("main.bzz");
    std::fs::write(&main, "include \"lib.bzz\"\nresult = helper()\n").unwrap();
    // Resolution falls back to BUZZ_INCLUDE_PATH directories.
    unsafe { std::env::set_var("BUZZ_INCLUDE_PATH", dir.path()) };
    let out = bzzc::compile_file(main.to_str().unwrap(), &CompilerConfig::default())
        .expect("compiles with include");
    let mut vm = Vm::new(1);
    assert_eq!(vm.set_bcode(out.bcode), VmState::Ready);
    assert_eq!(vm.execute_script(), VmState::Done);
    assert!(matches!(global(&vm, "result"), Value::Int(5)));
}

#[test]
fn test_debug_info_names_error_site() {
    let out = bzzc::compile_source(
        "x = 1\ny = \"s\" < 2\n",
        "bad.bzz",
        &CompilerConfig::default(),
    )
    .expect("compiles");
    let mut vm = Vm::new(1);
    vm.load_debug_info(out.debug);
    assert_eq!(vm.set_bcode(out.bcode), VmState::Ready);
    assert_eq!(vm.execute_script(), VmState::Error);
    let msg = vm.error_message();
    assert!(msg.contains("bad.bzz"), "message was: {}", msg);
}

#[test]
fn test_stack_state_after_call() {
    // A bare call statement leaves its return value; the script still
    // finishes cleanly.
    let vm = run_script("function f() { return 9 }\nf()\nr = 1");
    assert!(matches!(global(&vm, "r"), Value::Int(1)));
}

#[test]
fn test_gc_survives_heavy_allocation() {
    let vm = run_script(
        "t = {}\n\
         for(i = 0, i < 200, i = i + 1) {\n\
           t[i] = { .v = i }\n\
         }\n\
         n = size(t)\n\
         probe = t[150].v",
    );
    assert!(matches!(global(&vm, "n"), Value::Int(200)));
    assert!(matches!(global(&vm, "probe"), Value::Int(150)));
}

#[test]
fn test_table_keys_restricted() {
    let key = TableKey::from_value(&Value::Nil);
    assert!(key.is_none());
}
