//! End-to-end scenarios and invariant checks run against whole programs,
//! rather than unit-testing individual opcodes. Grounded in the teacher's
//! `tests/bc_test.rs`, which drives a tempdir for module-path tests the same
//! way; `Vm::with_output` is the local equivalent of that crate's
//! `Host`-swap-for-tests pattern.

use feline_vm::{Vm, VmOptions};
use std::cell::RefCell;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::rc::Rc;

/// Write sink shared with the test so it can inspect what a script printed
/// after the VM finishes running.
#[derive(Clone)]
struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn run_capturing(source: &str, base_dir: &Path, options: VmOptions) -> (Result<(), String>, String) {
    let function = feline_compiler::compile_str(source).expect("should compile");
    let buf = SharedBuf(Rc::new(RefCell::new(Vec::new())));
    let mut vm = Vm::new(base_dir.to_path_buf(), options).with_output(Box::new(buf.clone()));
    let result = vm.run(function, "script");
    let output = String::from_utf8(buf.0.borrow().clone()).expect("output should be utf8");
    (result, output)
}

fn run(source: &str) -> (Result<(), String>, String) {
    let dir = tempfile::tempdir().expect("tempdir");
    run_capturing(source, dir.path(), VmOptions::default())
}

#[test]
fn s1_closures_capture_by_reference() {
    let source = r#"
        function makeCounter() { var n = 0;
          function inc() { n = n + 1; return n; } return inc; }
        var c = makeCounter(); print c(); print c(); print c();
    "#;
    let (result, output) = run(source);
    assert!(result.is_ok(), "unexpected error: {result:?}");
    assert_eq!(output, "1\n2\n3\n");
}

#[test]
fn s2_exception_propagates_across_calls() {
    let source = r#"
        function a() { throw "oops"; }
        function b() { a(); }
        try { b(); } catch(e) { print e; }
    "#;
    let (result, output) = run(source);
    assert!(result.is_ok(), "unexpected error: {result:?}");
    assert_eq!(output, "oops\n");
}

#[test]
fn s3_inheritance_and_super_invocation() {
    let source = r#"
        class A { greet() { return "A"; } }
        class B : A { greet() { return super.greet() + "B"; } }
        print B().greet();
    "#;
    let (result, output) = run(source);
    assert!(result.is_ok(), "unexpected error: {result:?}");
    assert_eq!(output, "AB\n");
}

#[test]
fn s4_list_index_semantics() {
    let source = r#"
        var L = [10, 20, 30]; print L[-1]; print L[0]; try { print L[5]; } catch(e) { print "caught"; }
    "#;
    let (result, output) = run(source);
    assert!(result.is_ok(), "unexpected error: {result:?}");
    assert_eq!(output, "30\n10\ncaught\n");
}

#[test]
fn s5_module_import_is_cached() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("m.fn"), "var k = {}; export k as k;").expect("write module");

    let source = r#"
        import m as m; import m as m2; print m.k == m2.k;
    "#;
    let (result, output) = run_capturing(source, dir.path(), VmOptions::default());
    assert!(result.is_ok(), "unexpected error: {result:?}");
    assert_eq!(output, "true\n");
}

#[test]
fn s6_gc_stress_does_not_change_result() {
    let source = r#"
        var s = "";
        var i = 0;
        while (i < 10000) {
            s = s + "x";
            i = i + 1;
        }
        print len(s);
    "#;

    let dir_a = tempfile::tempdir().expect("tempdir");
    let (result_a, output_a) = run_capturing(source, dir_a.path(), VmOptions::default());
    assert!(result_a.is_ok(), "unexpected error: {result_a:?}");

    let dir_b = tempfile::tempdir().expect("tempdir");
    let (result_b, output_b) =
        run_capturing(source, dir_b.path(), VmOptions { trace: false, stress_gc: true });
    assert!(result_b.is_ok(), "unexpected error: {result_b:?}");

    assert_eq!(output_a, output_b);
    assert_eq!(output_a, "10000\n");
}

#[test]
fn invariant_equal_string_literals_share_identity() {
    let source = r#"
        var a = "hello";
        var b = "hello";
        print a == b;
    "#;
    let (result, output) = run(source);
    assert!(result.is_ok(), "unexpected error: {result:?}");
    assert_eq!(output, "true\n");
}

#[test]
fn invariant_instanceof_is_reflexive_and_transitive() {
    let source = r#"
        class Animal {}
        class Cat : Animal {}
        var c = Cat();
        print c instanceof Cat;
        print c instanceof Animal;
    "#;
    let (result, output) = run(source);
    assert!(result.is_ok(), "unexpected error: {result:?}");
    assert_eq!(output, "true\ntrue\n");
}

#[test]
fn uncaught_exception_reports_class_and_reason() {
    let source = r#"
        var L = [1, 2, 3];
        print L[10];
    "#;
    let (result, _output) = run(source);
    let message = result.expect_err("out-of-range index should raise");
    assert!(message.starts_with("IndexRangeException:"), "message was: {message}");
}
