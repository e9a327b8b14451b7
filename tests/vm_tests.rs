// Integration tests for the Lox VM.
//
// Each test compiles and runs a complete program through the public API and
// checks what it printed, or which error it produced. Covers:
// - Expressions, precedence, and string concatenation
// - Variables, scoping, and assignment
// - Control flow and short-circuit operators
// - Functions, closures, and upvalue capture
// - Classes, inheritance, and super dispatch
// - Runtime error messages and stack traces

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use lox::errors::LoxError;
use lox::vm::Vm;

/// Print sink shared between the test and the VM.
#[derive(Clone, Default)]
struct SharedOutput(Rc<RefCell<Vec<u8>>>);

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn run(source: &str) -> (Result<(), LoxError>, String) {
    let output = SharedOutput::default();
    let mut vm = Vm::with_output(Box::new(output.clone()));
    let result = vm.interpret(source);
    let text = String::from_utf8(output.0.borrow().clone()).expect("output should be utf-8");
    (result, text)
}

fn run_ok(source: &str) -> String {
    let (result, output) = run(source);
    assert!(result.is_ok(), "unexpected error: {:?}\noutput so far: {}", result, output);
    output
}

fn run_runtime_error(source: &str) -> lox::errors::RuntimeError {
    let (result, _) = run(source);
    match result {
        Err(LoxError::Runtime(error)) => error,
        other => panic!("expected runtime error, got {:?}", other),
    }
}

// --- Expressions ----------------------------------------------------------

#[test]
fn arithmetic_precedence() {
    assert_eq!(run_ok("print 1 + 2 * 3;"), "7\n");
}

#[test]
fn grouping_and_unary() {
    assert_eq!(run_ok("print (1 + 2) * 3;"), "9\n");
    assert_eq!(run_ok("print -(3 - 1);"), "-2\n");
    assert_eq!(run_ok("print !true;"), "false\n");
    assert_eq!(run_ok("print !nil;"), "true\n");
}

#[test]
fn number_formatting() {
    assert_eq!(run_ok("print 0.5;"), "0.5\n");
    assert_eq!(run_ok("print 10 / 4;"), "2.5\n");
    assert_eq!(run_ok("print 100;"), "100\n");
}

#[test]
fn comparison_and_equality() {
    assert_eq!(run_ok("print 1 < 2;"), "true\n");
    assert_eq!(run_ok("print 2 <= 2;"), "true\n");
    assert_eq!(run_ok("print 3 > 4;"), "false\n");
    assert_eq!(run_ok("print 1 == 1;"), "true\n");
    assert_eq!(run_ok("print 1 == \"1\";"), "false\n");
    assert_eq!(run_ok("print nil == nil;"), "true\n");
    assert_eq!(run_ok("print \"a\" == \"a\";"), "true\n");
    assert_eq!(run_ok("print \"a\" != \"b\";"), "true\n");
}

#[test]
fn string_concatenation() {
    assert_eq!(run_ok("var a = \"hi\"; var b = \"!\"; print a + b;"), "hi!\n");
}

#[test]
fn concatenated_strings_are_interned() {
    // Equality on strings is identity, so a built string must reduce to the
    // same canonical object as the literal with those bytes.
    assert_eq!(run_ok("print \"he\" + \"llo\" == \"hello\";"), "true\n");
}

#[test]
fn add_type_mismatch() {
    let error = run_runtime_error("print 1 + \"a\";");
    assert_eq!(error.message, "Operands must be two numbers or two strings.");
}

#[test]
fn arithmetic_type_errors() {
    assert_eq!(run_runtime_error("print 1 * nil;").message, "Operands must be numbers.");
    assert_eq!(run_runtime_error("print -\"a\";").message, "Operand must be a number.");
}

#[test]
fn short_circuit_operators() {
    assert_eq!(run_ok("print nil and 1;"), "nil\n");
    assert_eq!(run_ok("print 1 and 2;"), "2\n");
    assert_eq!(run_ok("print nil or \"yes\";"), "yes\n");
    assert_eq!(run_ok("print false or false;"), "false\n");
    // The right operand must not run when short-circuited.
    assert_eq!(run_ok("fun boom() { print \"side\"; return true; } print false and boom();"), "false\n");
}

// --- Variables and scope --------------------------------------------------

#[test]
fn global_define_and_assign() {
    assert_eq!(run_ok("var a = 1; a = a + 1; print a;"), "2\n");
}

#[test]
fn undefined_variable_read() {
    let error = run_runtime_error("print a;");
    assert_eq!(error.message, "Undefined variable 'a'.");
    assert_eq!(error.trace, vec!["[line 1] in script"]);
}

#[test]
fn undefined_variable_assign() {
    let error = run_runtime_error("a = 1;");
    assert_eq!(error.message, "Undefined variable 'a'.");
}

#[test]
fn runtime_error_exit_code() {
    let (result, _) = run("print a;");
    match result {
        Err(error) => assert_eq!(error.exit_code(), 70),
        Ok(()) => panic!("expected an error"),
    }
}

#[test]
fn local_scoping_and_shadowing() {
    let source = r#"
        var a = "global";
        {
            var a = "outer";
            {
                var a = "inner";
                print a;
            }
            print a;
        }
        print a;
    "#;
    assert_eq!(run_ok(source), "inner\nouter\nglobal\n");
}

#[test]
fn assignment_is_an_expression() {
    assert_eq!(run_ok("var a = 1; var b = 2; a = b = 3; print a; print b;"), "3\n3\n");
}

// --- Control flow ---------------------------------------------------------

#[test]
fn if_else_branches() {
    assert_eq!(run_ok("if (true) print \"then\"; else print \"else\";"), "then\n");
    assert_eq!(run_ok("if (false) print \"then\"; else print \"else\";"), "else\n");
    assert_eq!(run_ok("if (nil) print \"then\";"), "");
}

#[test]
fn while_loop() {
    assert_eq!(run_ok("var i = 0; while (i < 3) { print i; i = i + 1; }"), "0\n1\n2\n");
}

#[test]
fn for_loop_builds_string() {
    let source = "var s = \"\"; for (var i = 0; i < 3; i = i + 1) s = s + \"x\"; print s;";
    assert_eq!(run_ok(source), "xxx\n");
}

#[test]
fn for_loop_without_clauses_runs_its_body() {
    // The language has no break; an undefined call is the simplest exit.
    let (result, output) = run("for (;;) { print \"once\"; stop(); }");
    assert_eq!(output, "once\n");
    match result {
        Err(LoxError::Runtime(error)) => {
            assert_eq!(error.message, "Undefined variable 'stop'.");
        }
        other => panic!("expected runtime error, got {:?}", other),
    }
}

// --- Functions and closures -----------------------------------------------

#[test]
fn function_values_print_by_name() {
    assert_eq!(run_ok("fun f() {} print f;"), "<fn f>\n");
    assert_eq!(run_ok("print clock;"), "<native fn>\n");
}

#[test]
fn fibonacci_recursion() {
    let source = "fun f(n){ if (n < 2) return n; return f(n-1)+f(n-2); } print f(10);";
    assert_eq!(run_ok(source), "55\n");
}

#[test]
fn counter_closure() {
    let source = r#"
        fun make(){ var i = 0; fun inc(){ i = i + 1; return i; } return inc; }
        var c = make();
        print c(); print c(); print c();
    "#;
    assert_eq!(run_ok(source), "1\n2\n3\n");
}

#[test]
fn closures_share_a_captured_variable() {
    let source = r#"
        fun pair() {
            var n = 0;
            fun get() { return n; }
            fun set(v) { n = v; }
            print get();
            set(42);
            print get();
        }
        pair();
    "#;
    assert_eq!(run_ok(source), "0\n42\n");
}

#[test]
fn upvalue_survives_scope_exit() {
    let source = r#"
        var get;
        {
            var secret = "hidden";
            fun f() { return secret; }
            get = f;
        }
        print get();
    "#;
    assert_eq!(run_ok(source), "hidden\n");
}

#[test]
fn independent_counters() {
    let source = r#"
        fun make(){ var i = 0; fun inc(){ i = i + 1; return i; } return inc; }
        var a = make();
        var b = make();
        print a(); print a(); print b();
    "#;
    assert_eq!(run_ok(source), "1\n2\n1\n");
}

#[test]
fn implicit_return_is_nil() {
    assert_eq!(run_ok("fun f() {} print f();"), "nil\n");
}

#[test]
fn arity_mismatch() {
    let error = run_runtime_error("fun f(a, b) {} f(1);");
    assert_eq!(error.message, "Expected 2 arguments but got 1.");
}

#[test]
fn calling_a_non_callable() {
    let error = run_runtime_error("var x = 1; x();");
    assert_eq!(error.message, "Can only call functions and classes.");
    let error = run_runtime_error("\"hello\"();");
    assert_eq!(error.message, "Can only call functions and classes.");
}

#[test]
fn unbounded_recursion_overflows() {
    let error = run_runtime_error("fun f() { f(); } f();");
    assert_eq!(error.message, "Stack overflow.");
}

#[test]
fn runtime_error_trace_names_frames() {
    let source = r#"
        fun inner() { return missing; }
        fun outer() { return inner(); }
        outer();
    "#;
    let error = run_runtime_error(source);
    assert_eq!(error.message, "Undefined variable 'missing'.");
    assert_eq!(error.trace[0], "[line 2] in inner()");
    assert_eq!(error.trace[1], "[line 3] in outer()");
    assert_eq!(error.trace[2], "[line 4] in script");
}

#[test]
fn native_clock_returns_a_number() {
    assert_eq!(run_ok("print clock() > 0;"), "true\n");
}

#[test]
fn vm_reusable_after_runtime_error() {
    let output = SharedOutput::default();
    let mut vm = Vm::with_output(Box::new(output.clone()));
    assert!(vm.interpret("print missing;").is_err());
    assert!(vm.interpret("print \"recovered\";").is_ok());
    let text = String::from_utf8(output.0.borrow().clone()).expect("utf-8");
    assert_eq!(text, "recovered\n");
}

#[test]
fn globals_persist_across_interpret_calls() {
    let output = SharedOutput::default();
    let mut vm = Vm::with_output(Box::new(output.clone()));
    assert!(vm.interpret("var answer = 42;").is_ok());
    assert!(vm.interpret("print answer;").is_ok());
    let text = String::from_utf8(output.0.borrow().clone()).expect("utf-8");
    assert_eq!(text, "42\n");
}

#[test]
fn stack_is_balanced_after_execution() {
    let output = SharedOutput::default();
    let mut vm = Vm::with_output(Box::new(output.clone()));
    let source = r#"
        var a = 1;
        { var b = a + 1; print b; }
        fun f(x) { return x * 2; }
        print f(21);
        if (a == 1) { a = a + 1; } else { a = 0; }
        while (a < 5) { a = a + 1; }
    "#;
    assert!(vm.interpret(source).is_ok());
    assert_eq!(vm.stack_len(), 0);
}

// --- Classes --------------------------------------------------------------

#[test]
fn classes_and_instances_print() {
    assert_eq!(run_ok("class Pie {} print Pie;"), "Pie\n");
    assert_eq!(run_ok("class Pie {} print Pie();"), "Pie instance\n");
}

#[test]
fn fields_set_and_get() {
    let source = r#"
        class Point {}
        var p = Point();
        p.x = 1;
        p.y = 2;
        print p.x + p.y;
    "#;
    assert_eq!(run_ok(source), "3\n");
}

#[test]
fn initializer_binds_fields() {
    assert_eq!(run_ok("class C { init(x){ this.x = x; } } print C(42).x;"), "42\n");
}

#[test]
fn methods_see_this() {
    let source = r#"
        class Counter {
            init() { this.n = 0; }
            bump() { this.n = this.n + 1; return this.n; }
        }
        var c = Counter();
        print c.bump();
        print c.bump();
    "#;
    assert_eq!(run_ok(source), "1\n2\n");
}

#[test]
fn bound_method_detaches_from_access() {
    let source = r#"
        class C {
            init(name) { this.name = name; }
            speak() { print this.name; }
        }
        var m = C("bound").speak;
        m();
    "#;
    assert_eq!(run_ok(source), "bound\n");
}

#[test]
fn invoke_and_bound_call_agree() {
    let source = r#"
        class C { m() { return 7; } }
        var c = C();
        print c.m();
        var f = c.m;
        print f();
    "#;
    assert_eq!(run_ok(source), "7\n7\n");
}

#[test]
fn field_shadows_method_on_invoke() {
    let source = r#"
        class C { m() { return "method"; } }
        var c = C();
        fun other() { return "field"; }
        c.m = other;
        print c.m();
    "#;
    assert_eq!(run_ok(source), "field\n");
}

#[test]
fn default_constructor_takes_no_arguments() {
    let error = run_runtime_error("class C {} C(1);");
    assert_eq!(error.message, "Expected 0 arguments but got 1.");
}

#[test]
fn initializer_arity_is_checked() {
    let error = run_runtime_error("class C { init(x) {} } C();");
    assert_eq!(error.message, "Expected 1 arguments but got 0.");
}

#[test]
fn initializer_returns_the_instance() {
    let source = r#"
        class C { init() { this.ok = true; } }
        var c = C();
        var d = c.init();
        print c == d;
    "#;
    assert_eq!(run_ok(source), "true\n");
}

#[test]
fn inheritance_and_super_dispatch() {
    let source = r#"
        class A { hi(){ print "A"; } }
        class B < A { hi(){ super.hi(); print "B"; } }
        B().hi();
    "#;
    assert_eq!(run_ok(source), "A\nB\n");
}

#[test]
fn inherited_methods_are_callable() {
    let source = r#"
        class A { greet() { return "hello"; } }
        class B < A {}
        print B().greet();
    "#;
    assert_eq!(run_ok(source), "hello\n");
}

#[test]
fn subclass_overrides_inherited_method() {
    let source = r#"
        class A { who() { return "A"; } }
        class B < A { who() { return "B"; } }
        print B().who();
        print A().who();
    "#;
    assert_eq!(run_ok(source), "B\nA\n");
}

#[test]
fn super_method_through_grandparent() {
    let source = r#"
        class A { m() { return "A"; } }
        class B < A {}
        class C < B { m() { return super.m() + "C"; } }
        print C().m();
    "#;
    assert_eq!(run_ok(source), "AC\n");
}

#[test]
fn super_as_a_value_binds_this() {
    let source = r#"
        class A { name() { return this.tag; } }
        class B < A {
            name() { return "not me"; }
            real() { var m = super.name; return m(); }
        }
        var b = B();
        b.tag = "receiver";
        print b.real();
    "#;
    assert_eq!(run_ok(source), "receiver\n");
}

#[test]
fn superclass_must_be_a_class() {
    let error = run_runtime_error("var NotAClass = 1; class C < NotAClass {}");
    assert_eq!(error.message, "Superclass must be a class.");
}

#[test]
fn undefined_property_read() {
    let error = run_runtime_error("class C {} print C().missing;");
    assert_eq!(error.message, "Undefined property 'missing'.");
}

#[test]
fn undefined_method_invoke() {
    let error = run_runtime_error("class C {} C().missing();");
    assert_eq!(error.message, "Undefined property 'missing'.");
}

#[test]
fn properties_require_an_instance() {
    let error = run_runtime_error("print (1).x;");
    assert_eq!(error.message, "Only instances have properties.");
    let error = run_runtime_error("var s = \"str\"; s.x = 1;");
    assert_eq!(error.message, "Only instances have fields.");
    let error = run_runtime_error("true.m();");
    assert_eq!(error.message, "Only instances have methods.");
}
