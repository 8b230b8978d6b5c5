// Integration tests for the Lumen interpreter.
//
// These tests compile and run complete Lumen programs through the public
// `Vm::interpret` entry point and inspect observable behavior: programs
// under test encode their own expectations as runtime guards
// (`if (wrong) { print "bad"; }`) so a clean, print-free run is the success
// signal, and compile/runtime-error paths are inspected directly via the
// returned `LumenError`s.
//
// Covers: arithmetic & precedence, closures & upvalues, classes/inheritance/
// super, initializer return rules, arrays & dicts, string interning, scope
// resolution, jump-size limits, arity checks, and the error taxonomy.

use lumen::heap::Heap;
use lumen::vm::{InterpretResult, Vm};
use pretty_assertions::assert_eq;

/// Runs `source` against a fresh `Vm` and panics if it didn't finish
/// cleanly.
fn run_ok(source: &str) {
    let mut vm = Vm::new();
    match vm.interpret(source) {
        InterpretResult::Ok => {}
        InterpretResult::CompileError(errors) => {
            panic!("unexpected compile error(s): {:?}", errors.iter().map(|e| &e.message).collect::<Vec<_>>())
        }
        InterpretResult::RuntimeError(e) => panic!("unexpected runtime error: {}", e.message),
    }
}

fn compile_error_messages(source: &str) -> Vec<String> {
    let mut heap = Heap::new();
    match lumen::compiler::compile(source, &mut heap) {
        Ok(_) => panic!("expected a compile error, but compilation succeeded"),
        Err(errors) => errors.into_iter().map(|e| e.message).collect(),
    }
}

fn runtime_error_message(source: &str) -> String {
    let mut vm = Vm::new();
    match vm.interpret(source) {
        InterpretResult::RuntimeError(e) => e.message,
        InterpretResult::Ok => panic!("expected a runtime error, but the program ran to completion"),
        InterpretResult::CompileError(errors) => {
            panic!("expected a runtime error, got compile error(s): {:?}", errors.iter().map(|e| &e.message).collect::<Vec<_>>())
        }
    }
}

// ---- S1: arithmetic & precedence ----

#[test]
fn s1_arithmetic_and_precedence() {
    run_ok(
        r#"
        if (1 + 2 * 3 != 7) { print "bad"; }
        if ((1 + 2) * 3 != 9) { print "bad"; }
        "#,
    );
}

#[test]
fn comparisons_and_equality() {
    run_ok(
        r#"
        if (!(1 < 2)) { print "bad"; }
        if (!(2 <= 2)) { print "bad"; }
        if (!(3 > 2)) { print "bad"; }
        if (!(3 >= 3)) { print "bad"; }
        if (1 == 2) { print "bad"; }
        if (!(1 != 2)) { print "bad"; }
        if (nil != nil) { print "bad"; }
        if (1 == "1") { print "bad"; }
        "#,
    );
}

// ---- S2: closure counter ----

#[test]
fn s2_closure_counter() {
    run_ok(
        r#"
        fun make() { var c = 0; fun inc() { c = c + 1; return c; } return inc; }
        var f = make();
        if (f() != 1) { print "bad"; }
        if (f() != 2) { print "bad"; }
        if (f() != 3) { print "bad"; }
        "#,
    );
}

#[test]
fn independent_closures_have_independent_upvalues() {
    // Testable property 3: two closures from different calls of the same
    // factory function don't share state.
    run_ok(
        r#"
        fun make() { var c = 0; fun inc() { c = c + 1; return c; } return inc; }
        var a = make();
        var b = make();
        a();
        a();
        if (a() != 3) { print "bad"; }
        if (b() != 1) { print "bad"; }
        "#,
    );
}

#[test]
fn two_references_to_same_closure_share_upvalues() {
    run_ok(
        r#"
        fun make() { var c = 0; fun inc() { c = c + 1; return c; } return inc; }
        var a = make();
        var b = a;
        a();
        if (b() != 2) { print "bad"; }
        "#,
    );
}

#[test]
fn closure_over_loop_variable_captures_fresh_binding_per_iteration() {
    run_ok(
        r#"
        var fns = [];
        for (var i = 0; i < 3; i = i + 1) {
            var captured = i;
            fun grab() { return captured; }
            push(fns, grab);
        }
        if (fns[0]() != 0) { print "bad"; }
        if (fns[1]() != 1) { print "bad"; }
        if (fns[2]() != 2) { print "bad"; }
        "#,
    );
}

// ---- S3: inheritance with super ----

#[test]
fn s3_inheritance_with_super() {
    run_ok(
        r#"
        class A { greet() { this.log = "A"; } }
        class B < A { greet() { super.greet(); this.log = this.log + "B"; } }
        var b = B();
        b.greet();
        if (b.log != "AB") { print "bad"; }
        "#,
    );
}

#[test]
fn super_always_resolves_to_immediate_superclass() {
    // Testable property 6: a grandchild overriding the method again
    // doesn't change what `super.m` in B resolves to.
    run_ok(
        r#"
        class A { name() { return "A"; } }
        class B < A { name() { return "B(" + super.name() + ")"; } }
        class C < B { name() { return "C(" + super.name() + ")"; } }
        if (C().name() != "C(B(A))") { print "bad"; }
        "#,
    );
}

#[test]
fn subclass_method_shadows_superclass_method() {
    run_ok(
        r#"
        class A { greet() { return "A"; } }
        class B < A { greet() { return "B"; } }
        if (B().greet() != "B") { print "bad"; }
        "#,
    );
}

#[test]
fn inherited_method_is_visible_when_not_overridden() {
    run_ok(
        r#"
        class A { greet() { return "hi"; } }
        class B < A { }
        if (B().greet() != "hi") { print "bad"; }
        "#,
    );
}

#[test]
fn class_cannot_inherit_from_itself() {
    let errors = compile_error_messages("class A < A {}");
    assert!(errors.iter().any(|m| m.contains("inherit from itself")));
}

#[test]
fn super_outside_subclass_is_a_compile_error() {
    let errors = compile_error_messages("class A { greet() { super.greet(); } }");
    assert!(errors.iter().any(|m| m.contains("no superclass")));
}

// ---- S4: initializer return rules ----

#[test]
fn s4_initializer_sets_fields_and_returns_this_implicitly() {
    run_ok(
        r#"
        class P { init(x) { this.x = x; } }
        if (P(7).x != 7) { print "bad"; }
        "#,
    );
}

#[test]
fn returning_a_value_from_initializer_is_a_compile_error() {
    let errors = compile_error_messages("class P { init(x) { this.x = x; return 3; } }");
    assert!(errors.iter().any(|m| m.contains("Can't return a value from an initializer")));
}

#[test]
fn bare_return_in_initializer_is_allowed() {
    run_ok(
        r#"
        class P { init(x) { if (x < 0) { return; } this.x = x; } }
        if (P(5).x != 5) { print "bad"; }
        "#,
    );
}

#[test]
fn constructing_with_wrong_arity_is_a_runtime_error() {
    let message = runtime_error_message("class P { init(x) { this.x = x; } } P();");
    assert!(message.contains("Expected 1 arguments but got 0"));
}

// ---- S5: arrays & dicts ----

#[test]
fn s5_array_and_dict_subscripts() {
    run_ok(
        r#"
        var a = [10, 20, 30];
        a[1] = 99;
        if (a[0] != 10) { print "bad"; }
        if (a[1] != 99) { print "bad"; }

        var d = {"k": 1};
        d["k"] = d["k"] + 1;
        if (d["k"] != 2) { print "bad"; }
        "#,
    );
}

#[test]
fn array_out_of_range_is_a_runtime_error() {
    let message = runtime_error_message("var a = [1, 2]; print a[5];");
    assert!(message.contains("out of range"));
}

#[test]
fn array_negative_index_is_a_runtime_error() {
    let message = runtime_error_message("var a = [1, 2]; print a[-1];");
    assert!(message.contains("out of range"));
}

#[test]
fn dict_missing_key_is_a_runtime_error() {
    let message = runtime_error_message(r#"var d = {"a": 1}; print d["b"];"#);
    assert!(message.contains("Key not found"));
}

#[test]
fn dict_literal_size_is_observable_via_len() {
    run_ok(
        r#"
        var d = {"a": 1, "b": 2, "c": 3};
        if (len(d) != 3) { print "bad"; }
        "#,
    );
}

#[test]
fn array_natives_push_and_pop() {
    run_ok(
        r#"
        var a = [1, 2];
        push(a, 3);
        if (len(a) != 3) { print "bad"; }
        if (a[2] != 3) { print "bad"; }
        if (pop(a) != 3) { print "bad"; }
        if (len(a) != 2) { print "bad"; }
        "#,
    );
}

// ---- S6: string interning & concatenation ----

#[test]
fn s6_string_interning_and_concatenation() {
    run_ok(
        r#"
        var a = "foo";
        var b = "fo" + "o";
        if (a != b) { print "bad"; }
        "#,
    );
}

#[test]
fn interning_holds_for_arbitrary_literal_pairs() {
    run_ok(
        r#"
        var x = "hello world";
        var y = "hello" + " " + "world";
        if (x != y) { print "bad"; }
        if (type_name(x) != type_name(y)) { print "bad"; }
        "#,
    );
}

// ---- scope resolution ----

#[test]
fn block_scoped_local_is_invisible_outside_its_block() {
    // `a` only exists as a local inside the block; outside it, the
    // compiler resolves the name as a late-bound global, which then
    // fails at runtime since no such global was ever defined.
    let message = runtime_error_message(
        r#"
        {
            var a = 1;
        }
        print a;
        "#,
    );
    assert!(message.contains("Undefined variable"));
}

#[test]
fn reading_own_initializer_is_a_compile_error() {
    let errors = compile_error_messages("{ var a = a; }");
    assert!(errors.iter().any(|m| m.contains("its own initializer")));
}

#[test]
fn duplicate_local_in_same_scope_is_a_compile_error() {
    let errors = compile_error_messages("{ var a = 1; var a = 2; }");
    assert!(errors.iter().any(|m| m.contains("Already a variable")));
}

#[test]
fn shadowing_across_nested_scopes_is_allowed() {
    run_ok(
        r#"
        var a = "outer";
        {
            var a = "inner";
            if (a != "inner") { print "bad"; }
        }
        if (a != "outer") { print "bad"; }
        "#,
    );
}

// ---- `this` binding ----

#[test]
fn this_refers_to_the_receiver_used_at_the_call_site() {
    run_ok(
        r#"
        class Counter {
            init() { this.n = 0; }
            bump() { this.n = this.n + 1; return this.n; }
        }
        var a = Counter();
        var b = Counter();
        a.bump();
        a.bump();
        if (a.n != 2) { print "bad"; }
        if (b.n != 0) { print "bad"; }

        var bound = a.bump;
        bound();
        if (a.n != 3) { print "bad"; }
        "#,
    );
}

#[test]
fn this_outside_a_class_is_a_compile_error() {
    let errors = compile_error_messages("fun f() { print this; }");
    assert!(errors.iter().any(|m| m.contains("outside of a class")));
}

// ---- jump bounds ----

#[test]
fn oversized_jump_is_a_compile_error() {
    // A run of statements inside one `if` branch forces the then-branch
    // jump to exceed the 16-bit offset limit.
    let mut body = String::new();
    for _ in 0..40_000 {
        body.push_str("nil;\n");
    }
    let source = format!("if (true) {{ {body} }}");
    let errors = compile_error_messages(&source);
    assert!(errors.iter().any(|m| m.contains("Too much code to jump over")));
}

// ---- arity ----

#[test]
fn calling_closure_with_wrong_arity_is_a_runtime_error() {
    let message = runtime_error_message("fun f(a, b) { return a + b; } f(1);");
    assert!(message.contains("Expected 2 arguments but got 1"));
}

#[test]
fn too_many_parameters_is_a_compile_error() {
    let params: Vec<String> = (0..256).map(|i| format!("p{i}")).collect();
    let source = format!("fun f({}) {{}}", params.join(", "));
    let errors = compile_error_messages(&source);
    assert!(errors.iter().any(|m| m.contains("more than 255 parameters")));
}

// ---- error taxonomy (spec section 7) ----

#[test]
fn unterminated_string_is_a_compile_error() {
    let errors = compile_error_messages("print \"oops;");
    assert!(errors.iter().any(|m| m.contains("Unterminated string")));
}

#[test]
fn unknown_character_is_a_compile_error() {
    let errors = compile_error_messages("var a = 1 $ 2;");
    assert!(errors.iter().any(|m| m.contains("Unexpected character")));
}

#[test]
fn return_at_top_level_is_a_compile_error() {
    let errors = compile_error_messages("return 1;");
    assert!(errors.iter().any(|m| m.contains("Can't return from top-level code")));
}

#[test]
fn calling_a_non_callable_is_a_runtime_error() {
    let message = runtime_error_message("var x = 1; x();");
    assert!(message.contains("Can only call functions and classes"));
}

#[test]
fn arithmetic_type_mismatch_is_a_runtime_error() {
    let message = runtime_error_message("print 1 + true;");
    assert!(message.contains("must be"));
}

#[test]
fn division_by_zero_is_a_runtime_error() {
    let message = runtime_error_message("print 1 / 0;");
    assert!(message.contains("Division by zero"));
}

#[test]
fn undefined_global_is_a_runtime_error_with_a_suggestion() {
    let mut vm = Vm::new();
    vm.interpret("var length = 5;");
    match vm.interpret("print lenght;") {
        InterpretResult::RuntimeError(e) => {
            assert!(e.message.contains("Undefined variable"));
            assert_eq!(e.suggestion.as_deref(), Some("length"));
        }
        _ => panic!("expected a runtime error"),
    }
}

#[test]
fn undefined_property_is_a_runtime_error() {
    let message = runtime_error_message(r#"class A {} var a = A(); print a.missing;"#);
    assert!(message.contains("Undefined property"));
}

#[test]
fn inheriting_from_a_non_class_is_a_runtime_error() {
    let message = runtime_error_message("var NotAClass = 1; class B < NotAClass {}");
    assert!(message.contains("Superclass must be a class"));
}

// ---- determinism ----

#[test]
fn same_program_produces_the_same_outcome_across_runs() {
    let source = r#"
        class Shape {
            init(name) { this.name = name; }
            describe() { return this.name; }
        }
        class Circle < Shape {
            init(r) { super.init("circle"); this.r = r; }
            area() { return this.r * this.r * 3; }
        }
        var c = Circle(4);
        if (c.describe() != "circle") { print "bad"; }
        if (c.area() != 48) { print "bad"; }
    "#;
    for _ in 0..5 {
        run_ok(source);
    }
}

// ---- natives ----

#[test]
fn len_reports_sizes_for_strings_arrays_and_dicts() {
    run_ok(
        r#"
        if (len("hello") != 5) { print "bad"; }
        if (len([1, 2, 3]) != 3) { print "bad"; }
        if (len({"a": 1}) != 1) { print "bad"; }
        "#,
    );
}

#[test]
fn clock_returns_an_int() {
    run_ok(r#"if (type_name(clock()) != "int") { print "bad"; }"#);
}
