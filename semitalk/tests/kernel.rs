//! End-to-end tests: kernel code running on a freshly bootstrapped machine.

use std::cell::RefCell;
use std::io::{self, Cursor, Write};
use std::path::Path;
use std::rc::Rc;

use semitalk::{Completion, EvalError, Machine, MemorySettings, Value, VmError, bootstrap, file_in};

#[derive(Clone, Default)]
struct SharedOutput(Rc<RefCell<Vec<u8>>>);

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SharedOutput {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

fn machine() -> Machine {
    bootstrap(MemorySettings::default()).unwrap()
}

fn machine_with_io(input: &str) -> (Machine, SharedOutput) {
    let mut m = machine();
    let output = SharedOutput::default();
    m.set_io(Box::new(Cursor::new(input.as_bytes().to_vec())), Box::new(output.clone()));
    (m, output)
}

fn run(m: &mut Machine, source: &str) -> Value {
    match m.evaluate(source) {
        Ok(Completion::Returned(v)) => v,
        Ok(Completion::ShutDown) => panic!("unexpected shutdown in {source}"),
        Err(e) => panic!("{source}: {e}"),
    }
}

fn print(m: &mut Machine, source: &str) -> String {
    let v = run(m, source);
    m.print_string(v).unwrap()
}

fn fatal(m: &mut Machine, source: &str) -> VmError {
    match m.evaluate(source) {
        Err(EvalError::Fatal(e)) => e,
        other => panic!("{source}: expected a fatal error, got {other:?}"),
    }
}

#[test]
fn test_arithmetic_is_left_to_right() {
    let mut m = machine();
    assert_eq!(run(&mut m, "3 + 4 * 2"), Value::SmallInt(14));
    assert_eq!(run(&mut m, "3 + (4 * 2)"), Value::SmallInt(11));
    assert_eq!(run(&mut m, "12 factorial"), Value::SmallInt(479_001_600));
    assert_eq!(run(&mut m, "(3 max: 9) - (3 min: 9)"), Value::SmallInt(6));
    assert_eq!(run(&mut m, "-7 abs"), Value::SmallInt(7));
}

#[test]
fn test_division_truncates() {
    let mut m = machine();
    assert_eq!(run(&mut m, "-7 // 2"), Value::SmallInt(-3));
    assert_eq!(run(&mut m, "-7 \\\\ 2"), Value::SmallInt(-1));
    assert_eq!(run(&mut m, "7 \\\\ -2"), Value::SmallInt(1));
}

#[test]
fn test_arithmetic_faults_are_fatal() {
    let mut m = machine();
    assert!(matches!(fatal(&mut m, "13 factorial"), VmError::IntegerOverflow { .. }));
    let mut m = machine();
    assert!(matches!(fatal(&mut m, "1 // 0"), VmError::DivisionByZero { .. }));
}

#[test]
fn test_print_strings() {
    let mut m = machine();
    assert_eq!(print(&mut m, "1234"), "1234");
    assert_eq!(print(&mut m, "0"), "0");
    assert_eq!(print(&mut m, "-15"), "-15");
    assert_eq!(print(&mut m, "-7"), "-7");
    assert_eq!(print(&mut m, "3 > 2"), "true");
    assert_eq!(print(&mut m, "nil"), "nil");
    assert_eq!(print(&mut m, "$a"), "$a");
    assert_eq!(print(&mut m, "#foo:bar:"), "#foo:bar:");
    assert_eq!(print(&mut m, "'it''s'"), "'it''s'");
    assert_eq!(print(&mut m, "#(1 $a 'b')"), "(1 $a 'b' )");
    assert_eq!(print(&mut m, "Object new"), "an Object");
    assert_eq!(print(&mut m, "Link new"), "a Link");
    assert_eq!(print(&mut m, "Object"), "Object");
}

#[test]
fn test_booleans_and_blocks() {
    let mut m = machine();
    assert_eq!(print(&mut m, "(3 < 4) & (4 < 3)"), "false");
    assert_eq!(print(&mut m, "(3 < 4) | (4 < 3)"), "true");
    assert_eq!(run(&mut m, "(2 < 1) ifTrue: [1] ifFalse: [2]"), Value::SmallInt(2));
    assert_eq!(run(&mut m, "[:a :b | a * b] value: 6 value: 7"), Value::SmallInt(42));
    assert_eq!(run(&mut m, "#(1 2 3 4) inject: 0 into: [:sum :each | sum + each]"), Value::SmallInt(10));
    assert_eq!(print(&mut m, "nil ifNil: ['was nil']"), "'was nil'");
    assert_eq!(run(&mut m, "| n | n := 0. 5 timesRepeat: [n := n + 2]. n"), Value::SmallInt(10));
}

#[test]
fn test_block_arity_mismatch_is_fatal() {
    let mut m = machine();
    assert!(matches!(fatal(&mut m, "[:a | a] value"), VmError::BlockArity { expected: 1, got: 0 }));
}

#[test]
fn test_strings_and_symbols() {
    let mut m = machine();
    assert_eq!(print(&mut m, "'abc' , 'def'"), "'abcdef'");
    assert_eq!(print(&mut m, "'abc' = 'abc'"), "true");
    assert_eq!(print(&mut m, "'abc' == 'abc'"), "false");
    assert_eq!(print(&mut m, "#abc == #abc"), "true");
    assert_eq!(print(&mut m, "'hello' includes: $l"), "true");
    assert_eq!(print(&mut m, "(String new: 2) at: 1 put: $o; at: 2 put: $k; yourself"), "'ok'");
    assert_eq!(run(&mut m, "($a value) - ($A value)"), Value::SmallInt(32));
    assert_eq!(print(&mut m, "$e isVowel"), "true");
}

#[test]
fn test_dictionaries() {
    let mut m = machine();
    let v = run(
        &mut m,
        "| d | d := Dictionary new.
         d at: #a put: 1; at: #b put: 2; at: #a put: 10.
         (d at: #a) + (d at: #b) + (d at: #zz ifAbsent: [100])",
    );
    assert_eq!(v, Value::SmallInt(112));
    assert_eq!(print(&mut m, "(Dictionary new at: #x put: 1; yourself) includesKey: #y"), "false");
}

#[test]
fn test_smalltalk_dictionary_holds_globals() {
    let mut m = machine();
    run(&mut m, "Smalltalk at: #Counter put: 5");
    assert_eq!(run(&mut m, "Counter := Counter + 1. Counter"), Value::SmallInt(6));
    assert_eq!(m.global_value("Counter").unwrap(), Some(Value::SmallInt(6)));
    assert_eq!(print(&mut m, "(Smalltalk at: #Object) == Object"), "true");
}

#[test]
fn test_methods_compiled_at_run_time() {
    let mut m = machine();
    let v = run(
        &mut m,
        "Object compile: 'firstOver: n in: aCollection aCollection do: [:e | e > n ifTrue: [^e]]. ^nil'",
    );
    assert_ne!(v, m.nil());
    assert_eq!(run(&mut m, "Object new firstOver: 2 in: #(1 2 3 4)"), Value::SmallInt(3));
    assert_eq!(run(&mut m, "Object new firstOver: 9 in: #(1 2 3 4)"), m.nil());
    // a broken method answers nil and installs nothing
    assert_eq!(run(&mut m, "Object compile: 'broken ^('"), m.nil());
}

#[test]
fn test_output_and_input_primitives() {
    let (mut m, output) = machine_with_io("first line\nsecond\n");
    run(&mut m, "'hello' displayNl. $x output. 42 printNl");
    assert_eq!(output.text(), "hello\nx42\n");
    assert_eq!(print(&mut m, "String input"), "'first line\n'");
    assert_eq!(run(&mut m, "String input size"), Value::SmallInt(7));
    assert!(matches!(fatal(&mut m, "String input"), VmError::EndOfInput));
}

#[test]
fn test_shutdown() {
    let mut m = machine();
    assert_eq!(m.evaluate("Smalltalk shutDown. 1 + 1").unwrap(), Completion::ShutDown);
    assert_eq!(run(&mut m, "1 + 1"), Value::SmallInt(2));
}

#[test]
fn test_file_in_fixture() {
    let mut m = machine();
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/shapes.st");
    let source = std::fs::read_to_string(path).unwrap();
    let report = file_in(&mut m, &source).unwrap();
    assert_eq!(report.classes_defined, 3);
    assert_eq!(report.methods_installed, 9);
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].contains("Square"), "{:?}", report.failures);

    assert_eq!(run(&mut m, "(Rectangle width: 3 height: 4) area"), Value::SmallInt(12));
    assert_eq!(print(&mut m, "(Square side: 5) describe"), "'square of area 25'");
    assert_eq!(print(&mut m, "Square superclass"), "Rectangle");
    assert_eq!(print(&mut m, "Square class"), "Square class");

    // filing in again keeps the classes and replaces the methods
    let report = file_in(&mut m, &source).unwrap();
    assert_eq!(report.classes_defined, 0);
    assert_eq!(run(&mut m, "(Rectangle width: 2 height: 2) area"), Value::SmallInt(4));
}

#[test]
fn test_ten_thousand_iterations_fit_the_default_semispace() {
    let mut m = machine();
    let v = run(&mut m, "| sum | sum := 0. 1 to: 10000 do: [:i | sum := sum + i]. sum");
    assert_eq!(v, Value::SmallInt(50_005_000));
    let v = run(&mut m, "| n | n := 0. [n < 10000] whileTrue: [n := n + 1]. n");
    assert_eq!(v, Value::SmallInt(10_000));
}

#[test]
fn test_runs_in_a_small_semispace() {
    let settings = MemorySettings {
        semispace_size: 256 * 1024,
        ..MemorySettings::default()
    };
    let mut m = bootstrap(settings).unwrap();
    let v = run(
        &mut m,
        "| head sum link |
         1 to: 200 do: [:i | head := Link new key: i; value: (String new: 100); next: head; yourself].
         sum := 0. link := head.
         [link notNil] whileTrue: [sum := sum + link key. link := link next].
         sum",
    );
    assert_eq!(v, Value::SmallInt(20_100));
    for _ in 0..50 {
        assert_eq!(print(&mut m, "#(1 2 3) printString size"), "8");
    }
    assert!(m.memory.stats().collections > 0);
}
