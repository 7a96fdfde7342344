use flint::{Error, Session};
use pretty_assertions::assert_eq;

fn run(source: &str) -> String {
    let mut session = Session::new();
    session
        .interpret(source)
        .unwrap_or_else(|e| panic!("script failed: {e}\n{source}"));
    session.take_output()
}

fn run_err(source: &str) -> Error {
    let mut session = Session::new();
    match session.interpret(source) {
        Ok(()) => panic!("expected an error:\n{source}"),
        Err(error) => error,
    }
}

fn runtime_message(source: &str) -> String {
    match run_err(source) {
        Error::Runtime { message, .. } => message,
        other => panic!("expected runtime error, got {other:?}"),
    }
}

fn compile_message(source: &str) -> String {
    match run_err(source) {
        Error::Compile(message) => message,
        other => panic!("expected compile error, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Expressions and control flow
// ---------------------------------------------------------------------------

#[test]
fn for_loop_sums() {
    let out = run("var n = 0; for (var i = 1; i <= 10; i = i + 1) n = n + i; print n;");
    assert_eq!(out, "55\n");
}

#[test]
fn while_loop_with_break() {
    let out = run(
        "var i = 0;\n\
         while (true) { i = i + 1; if (i == 4) break; }\n\
         print i;",
    );
    assert_eq!(out, "4\n");
}

#[test]
fn break_inside_for_discards_loop_locals() {
    let out = run(
        "var hits = 0;\n\
         for (var i = 0; i < 10; i = i + 1) {\n\
             var doubled = i * 2;\n\
             if (doubled > 4) break;\n\
             hits = hits + 1;\n\
         }\n\
         print hits;",
    );
    assert_eq!(out, "3\n");
}

#[test]
fn short_circuit_keeps_operand_values() {
    assert_eq!(run("print nil or 5;"), "5\n");
    assert_eq!(run("print false and 5;"), "false\n");
    assert_eq!(run("print 1 and 2;"), "2\n");
    assert_eq!(run("print 1 or 2;"), "1\n");
}

#[test]
fn comparison_operators_lower_onto_less() {
    assert_eq!(run("print 2 > 1;"), "true\n");
    assert_eq!(run("print 1 >= 1;"), "true\n");
    assert_eq!(run("print 1 <= 0;"), "false\n");
    assert_eq!(run("print 1 != 2;"), "true\n");
}

#[test]
fn mixed_numeric_comparison_coerces() {
    assert_eq!(run("print 1 < 1.5;"), "true\n");
    assert_eq!(run("print 2.0 == 2;"), "false\n"); // no cross-type equality
    assert_eq!(run("print 1.0 + 0.0 == 1.0;"), "true\n");
}

#[test]
fn if_expression() {
    assert_eq!(run("var x = 3; print if (x > 2 : \"big\" : \"small\");"), "big\n");
    assert_eq!(run("print if (false : 1 : 2);"), "2\n");
}

#[test]
fn case_dispatches_on_first_match() {
    let source = |x: i64| {
        format!(
            "var x = {x};\n\
             case (x) {{\n\
                 when 1, 2: print \"small\";\n\
                 when 3: print \"three\";\n\
                 else: print \"other\";\n\
             }}"
        )
    };
    assert_eq!(run(&source(2)), "small\n");
    assert_eq!(run(&source(3)), "three\n");
    assert_eq!(run(&source(9)), "other\n");
}

#[test]
fn case_branches_do_not_fall_through() {
    let out = run(
        "case (1) {\n\
             when 1: print \"one\";\n\
             when 2: print \"two\";\n\
         }",
    );
    assert_eq!(out, "one\n");
}

#[test]
fn print_separators() {
    assert_eq!(run("print 1, 2;"), "12\n");
    assert_eq!(run("print 1,, 2;"), "1   2\n");
    assert_eq!(run("print;"), "\n");
}

// ---------------------------------------------------------------------------
// Functions, closures, upvalues
// ---------------------------------------------------------------------------

#[test]
fn closure_counter() {
    let out = run(
        "fun make() { var x = 0; fun inc() { x = x + 1; return x; } return inc; }\n\
         var f = make();\n\
         print f(); print f(); print f();",
    );
    assert_eq!(out, "1\n2\n3\n");
}

#[test]
fn sibling_closures_share_one_upvalue() {
    let out = run(
        "fun make() {\n\
             var x = 0;\n\
             fun bump() { x = x + 1; }\n\
             fun read() { return x; }\n\
             return [bump, read];\n\
         }\n\
         var pair = make();\n\
         pair[0](); pair[0]();\n\
         print pair[1]();",
    );
    assert_eq!(out, "2\n");
}

#[test]
fn upvalues_close_when_scope_ends() {
    let out = run(
        "var f = nil;\n\
         {\n\
             var captured = \"inside\";\n\
             fun get() { return captured; }\n\
             f = get;\n\
         }\n\
         print f();",
    );
    assert_eq!(out, "inside\n");
}

#[test]
fn arrow_bodies_return_their_expression() {
    assert_eq!(run("fun double(x) -> x * 2 print double(21);"), "42\n");
}

#[test]
fn lambdas_are_first_class() {
    let out = run(
        "fun apply(f, x) { return f(x); }\n\
         print apply(fun (n) -> n + 1, 41);",
    );
    assert_eq!(out, "42\n");
}

#[test]
fn recursion() {
    let out = run(
        "fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); }\n\
         print fib(10);",
    );
    assert_eq!(out, "55\n");
}

// ---------------------------------------------------------------------------
// Variadic calls and unpacking
// ---------------------------------------------------------------------------

#[test]
fn rest_parameter_collects_extra_arguments() {
    let source = "fun sum(..args) {\n\
                      var t = 0;\n\
                      for (var i = 0; i < length(args); i = i + 1) t = t + args[i];\n\
                      return t;\n\
                  }\n\
                  print sum(1, 2, 3);\n\
                  print sum(..[4, 5, 6]);";
    assert_eq!(run(source), "6\n15\n");
}

#[test]
fn unpack_mixes_with_plain_arguments() {
    let source = "fun list4(a, b, c, d) { return [a, b, c, d]; }\n\
                  print list4(1, ..[2, 3], 4);";
    assert_eq!(run(source), "[1, 2, 3, 4]\n");
}

#[test]
fn unpack_empty_list_is_allowed() {
    assert_eq!(run("fun zero() { return 7; } print zero(..[]);"), "7\n");
    assert_eq!(run("print [..[]];"), "[]\n");
}

#[test]
fn vlist_builds_from_unpacked_lists() {
    assert_eq!(run("print [0, ..[1, 2], 3];"), "[0, 1, 2, 3]\n");
}

#[test]
fn rest_parameter_minimum_arity() {
    let message = runtime_message("fun f(a, ..rest) { return a; } f();");
    assert_eq!(message, "Expected at least 1 arguments but got 0.");
}

#[test]
fn unpacking_a_non_list_fails() {
    let message = runtime_message("fun f(..xs) { return xs; } f(..3);");
    assert_eq!(message, "Item to unpack is not a list.");
}

// ---------------------------------------------------------------------------
// Lists, strings, indexing, slicing
// ---------------------------------------------------------------------------

#[test]
fn negative_indices_and_slices() {
    let out = run("var xs = [1, 2, 3, 4]; print xs[-1]; print xs[1:3];");
    assert_eq!(out, "4\n[2, 3]\n");
}

#[test]
fn slice_round_trip_preserves_list() {
    let out = run(
        "var xs = [1, 2, 3];\n\
         var copy = xs[0:length(xs)] + [];\n\
         print copy;\n\
         print length(copy);",
    );
    assert_eq!(out, "[1, 2, 3]\n3\n");
}

#[test]
fn open_ended_slices() {
    assert_eq!(run("print [1, 2, 3, 4][2:];"), "[3, 4]\n");
    assert_eq!(run("print [1, 2, 3, 4][:2];"), "[1, 2]\n");
    assert_eq!(run("print \"hello\"[1:4];"), "ell\n");
}

#[test]
fn slice_bounds_clamp() {
    assert_eq!(run("print [1, 2][0:99];"), "[1, 2]\n");
    assert_eq!(run("print [1, 2][-99:1];"), "[1]\n");
    assert_eq!(run("print [1, 2][1:0];"), "[]\n");
}

#[test]
fn string_indexing_yields_one_char_strings() {
    assert_eq!(run("print \"abc\"[1];"), "b\n");
    assert_eq!(run("print \"abc\"[-1];"), "c\n");
}

#[test]
fn list_element_assignment() {
    assert_eq!(run("var xs = [1, 2]; xs[0] = 9; print xs;"), "[9, 2]\n");
}

#[test]
fn index_out_of_range_faults() {
    assert_eq!(runtime_message("[1, 2][5];"), "List index out of range.");
    assert_eq!(runtime_message("\"ab\"[-3];"), "String index out of range.");
}

#[test]
fn list_concatenation_and_equality_by_identity() {
    assert_eq!(run("print [1] + [2];"), "[1, 2]\n");
    assert_eq!(run("var a = [1]; print a == a;"), "true\n");
    assert_eq!(run("print [1] == [1];"), "false\n");
}

#[test]
fn string_interning_makes_equal_strings_identical() {
    assert_eq!(run("print \"he\" + \"llo\" == \"hello\";"), "true\n");
}

// ---------------------------------------------------------------------------
// Classes
// ---------------------------------------------------------------------------

#[test]
fn super_calls_run_both_methods() {
    let out = run(
        "class A { speak() { print \"A\"; } }\n\
         class B < A { speak() { super.speak(); print \"B\"; } }\n\
         B().speak();",
    );
    assert_eq!(out, "A\nB\n");
}

#[test]
fn initializer_returns_the_instance() {
    let out = run(
        "class Point { init(x, y) { this.x = x; this.y = y; } }\n\
         var p = Point(3, 4);\n\
         print p.x + p.y;",
    );
    assert_eq!(out, "7\n");
}

#[test]
fn methods_bind_their_receiver() {
    let out = run(
        "class Greeter {\n\
             init(name) { this.name = name; }\n\
             greet() { print \"hi \" + this.name; }\n\
         }\n\
         var m = Greeter(\"ada\").greet;\n\
         m();",
    );
    assert_eq!(out, "hi ada\n");
}

#[test]
fn inherited_methods_are_copied_down() {
    let out = run(
        "class A { ping() { return \"pong\"; } }\n\
         class B < A { }\n\
         print B().ping();",
    );
    assert_eq!(out, "pong\n");
}

#[test]
fn fields_shadow_methods_when_called() {
    let out = run(
        "class Box { hit() { return \"method\"; } }\n\
         var b = Box();\n\
         b.hit = fun () -> \"field\";\n\
         print b.hit();",
    );
    assert_eq!(out, "field\n");
}

#[test]
fn instance_field_table_indexing() {
    let out = run(
        "class Bag { }\n\
         var b = Bag();\n\
         b[1] = \"one\";\n\
         b[\"two\"] = 2;\n\
         print b[1]; print b[\"two\"]; print b[\"missing\"];",
    );
    assert_eq!(out, "one\n2\nnil\n");
}

#[test]
fn class_arity_errors() {
    assert_eq!(
        runtime_message("class A { } A(1);"),
        "Expected 0 arguments but got 1."
    );
    assert_eq!(
        runtime_message("class A { init(x) { } } A();"),
        "Expected 1 arguments but got 0."
    );
}

#[test]
fn undefined_property_faults() {
    assert_eq!(
        runtime_message("class A { } A().missing;"),
        "Undefined property 'missing'."
    );
}

#[test]
fn superclass_must_be_a_class() {
    assert_eq!(
        runtime_message("var notAClass = 3; class B < notAClass { }"),
        "Superclass must be a class."
    );
}

// ---------------------------------------------------------------------------
// Iterators over instance fields
// ---------------------------------------------------------------------------

#[test]
fn iterator_walks_fields_in_insertion_order() {
    let out = run(
        "class Bag { }\n\
         var b = Bag();\n\
         b.first = 1; b.second = 2; b.third = 3;\n\
         var it = iterator(b);\n\
         while (next(it)) print it@, \"=\", it^;\n",
    );
    assert_eq!(out, "first=1\nsecond=2\nthird=3\n");
}

#[test]
fn iterator_value_assignment_writes_through() {
    let out = run(
        "class Bag { }\n\
         var b = Bag();\n\
         b.x = 1; b.y = 2;\n\
         var it = iterator(b);\n\
         while (next(it)) it^ = it^ * 10;\n\
         print b.x, \",\", b.y;",
    );
    assert_eq!(out, "10,20\n");
}

#[test]
fn invalid_iterator_access_faults() {
    assert_eq!(
        runtime_message("class Bag { } var it = iterator(Bag()); it@;"),
        "Iterator is not valid."
    );
}

// ---------------------------------------------------------------------------
// Dynamic variables and handlers
// ---------------------------------------------------------------------------

#[test]
fn dynvar_shadows_and_restores() {
    let out = run(
        "var depth = 1;\n\
         fun report() { print depth; }\n\
         dynvar(depth = 2 : report());\n\
         report();",
    );
    assert_eq!(out, "2\n1\n");
}

#[test]
fn dynvar_result_is_the_body_value() {
    assert_eq!(run("var x = 1; print dynvar(x = 5 : x * 2);"), "10\n");
}

#[test]
fn dynvar_can_bind_a_fresh_global() {
    let out = run(
        "fun read() { return fresh; }\n\
         print dynvar(fresh = 3 : read());",
    );
    assert_eq!(out, "3\n");
    // After the binding frame returned, the global is gone again.
    assert_eq!(
        runtime_message(
            "fun read() { return fresh; }\n\
             dynvar(fresh = 3 : read());\n\
             read();"
        ),
        "Undefined variable 'fresh'."
    );
}

#[test]
fn nested_dynvars_restore_in_order() {
    let out = run(
        "var v = \"outer\";\n\
         fun show() { print v; }\n\
         dynvar(v = \"a\" : dynvar(v = \"b\" : show()) + show());\n\
         show();",
    );
    // Inner binding, then restored middle binding, then the original.
    assert_eq!(out, "b\na\nouter\n");
}

#[test]
fn handler_recovers_from_runtime_errors() {
    let out = run(
        "fun rescue(message) { print \"caught: \" + message; return -1; }\n\
         print handle(1 / 0 : rescue);",
    );
    assert_eq!(out, "caught: Division by zero.\n-1\n");
}

#[test]
fn handler_is_skipped_on_success() {
    let out = run(
        "fun rescue(message) { return -1; }\n\
         print handle(40 + 2 : rescue);",
    );
    assert_eq!(out, "42\n");
}

#[test]
fn handler_catches_errors_from_nested_calls() {
    let out = run(
        "fun inner() { return missing_global; }\n\
         fun outer() { return inner(); }\n\
         fun rescue(message) { return message; }\n\
         print handle(outer() : rescue);",
    );
    assert_eq!(out, "Undefined variable 'missing_global'.\n");
}

#[test]
fn innermost_handler_wins() {
    let out = run(
        "fun inner_rescue(m) { return \"inner\"; }\n\
         fun outer_rescue(m) { return \"outer\"; }\n\
         print handle(handle(1 / 0 : inner_rescue) : outer_rescue);",
    );
    assert_eq!(out, "inner\n");
}

#[test]
fn unwinding_through_dynvar_restores_the_global() {
    let out = run(
        "var mode = \"normal\";\n\
         fun blow_up() { return 1 / 0; }\n\
         fun rescue(m) { return mode; }\n\
         print handle(dynvar(mode = \"shadowed\" : blow_up()) : rescue);",
    );
    // The dynvar frame unwound before the handler ran.
    assert_eq!(out, "normal\n");
}

#[test]
fn errors_without_handler_still_unwind() {
    let message = runtime_message("fun f() { return 1 / 0; } f();");
    assert_eq!(message, "Division by zero.");
}

// ---------------------------------------------------------------------------
// Natives
// ---------------------------------------------------------------------------

#[test]
fn length_works_on_strings_and_lists() {
    assert_eq!(run("print length(\"hello\");"), "5\n");
    assert_eq!(run("print length([1, 2, 3]);"), "3\n");
}

#[test]
fn list_mutation_natives() {
    let out = run(
        "var xs = [1, 3];\n\
         insert(xs, 1, 2);\n\
         append(xs, 4);\n\
         delete(xs, 0);\n\
         print xs;\n\
         print index(2, xs);",
    );
    assert_eq!(out, "[2, 3, 4]\n0\n");
}

#[test]
fn conversion_natives() {
    assert_eq!(run("print chr(65);"), "A\n");
    assert_eq!(run("print asc(\"A\");"), "65\n");
    assert_eq!(run("print hex(255);"), "ff\n");
    assert_eq!(run("print dec(42);"), "42\n");
    assert_eq!(run("print int(\"$ff\");"), "255\n");
    assert_eq!(run("print int(\"bogus\");"), "nil\n");
}

#[test]
fn type_reports_value_kinds() {
    assert_eq!(run("print type(1);"), "int\n");
    assert_eq!(run("print type(1.5);"), "real\n");
    assert_eq!(run("print type(\"s\");"), "string\n");
    assert_eq!(run("print type([1]);"), "list\n");
    assert_eq!(run("print type(nil);"), "nil\n");
    assert_eq!(run("class A { } print type(A), \"/\", type(A());"), "class/instance\n");
}

#[test]
fn slots_and_remove_reflect_fields() {
    let out = run(
        "class Bag { }\n\
         var b = Bag();\n\
         b.x = 1; b.y = 2;\n\
         print slots(b);\n\
         print remove(b, \"x\");\n\
         print slots(b);",
    );
    assert_eq!(out, "[x, y]\ntrue\n[y]\n");
}

#[test]
fn signature_arity_is_reported() {
    assert_eq!(
        runtime_message("length();"),
        "Expected 1 arguments but got 0."
    );
    assert_eq!(
        runtime_message("asc(\"x\", 0, 9);"),
        "Expected 1 to 2 arguments but got 3."
    );
}

#[test]
fn signature_types_are_reported_by_position() {
    assert_eq!(
        runtime_message("length(1);"),
        "Type mismatch at argument 1, expected a sequence."
    );
    assert_eq!(
        runtime_message("insert([1], \"no\", 2);"),
        "Type mismatch at argument 2, expected a number."
    );
}

#[test]
fn bit_natives() {
    assert_eq!(run("print bit_and(12, 10);"), "8\n");
    assert_eq!(run("print bit_or(12, 10);"), "14\n");
    assert_eq!(run("print bit_xor(12, 10);"), "6\n");
    assert_eq!(run("print bit_shift(1, 4);"), "16\n");
    assert_eq!(run("print bit_shift(16, -4);"), "1\n");
}

#[test]
fn random_is_deterministic_after_seeding() {
    let a = run("seed_rand(7); print random(), \",\", random();");
    let b = run("seed_rand(7); print random(), \",\", random();");
    assert_eq!(a, b);
}

#[test]
fn gc_native_reports_bytes_and_keeps_running() {
    let out = run(
        "var xs = [];\n\
         for (var i = 0; i < 100; i = i + 1) append(xs, \"item \" + dec(i));\n\
         var bytes = gc();\n\
         print bytes > 0;\n\
         print length(xs);",
    );
    assert_eq!(out, "true\n100\n");
}

// ---------------------------------------------------------------------------
// Printing and the REPL protocol
// ---------------------------------------------------------------------------

#[test]
fn top_level_expression_echo() {
    let mut session = Session::new();
    session.interpret("3 * 14").unwrap();
    assert_eq!(session.take_output(), "42\n");

    // Semicolon suppresses the echo, nil results stay silent.
    session.interpret("3 * 14;").unwrap();
    assert_eq!(session.take_output(), "");
    session.interpret("nil").unwrap();
    assert_eq!(session.take_output(), "");
}

#[test]
fn integer_print_round_trip() {
    for value in [0i64, 1, -1, 12345, -987654, 1 << 30, -(1 << 30)] {
        let mut session = Session::new();
        session.interpret(&format!("print {value};")).unwrap();
        let printed = session.take_output();
        assert_eq!(printed.trim_end().parse::<i64>().unwrap(), value);
    }
}

#[test]
fn reals_print_with_a_decimal_point() {
    assert_eq!(run("print 1.0;"), "1.0\n");
    assert_eq!(run("print 2.5 * 2;"), "5.0\n");
}

#[test]
fn globals_persist_across_inputs() {
    let mut session = Session::new();
    session.interpret("var total = 0;").unwrap();
    session.interpret("total = total + 40;").unwrap();
    session.interpret("total = total + 2;").unwrap();
    session.interpret("print total;").unwrap();
    assert_eq!(session.take_output(), "42\n");
}

#[test]
fn sessions_recover_after_errors() {
    let mut session = Session::new();
    assert!(session.interpret("var x = ;").is_err());
    assert!(session.interpret("1 / 0;").is_err());
    session.interpret("print \"still alive\";").unwrap();
    assert_eq!(session.take_output(), "still alive\n");
}

// ---------------------------------------------------------------------------
// Compile errors
// ---------------------------------------------------------------------------

#[test]
fn compile_error_format() {
    let message = compile_message("var x = ;");
    assert_eq!(message, "[line 1] Error at ';': Expect expression.");
}

#[test]
fn compile_error_at_end() {
    let message = compile_message("print 1");
    assert!(message.contains("Error at end"), "got: {message}");
}

#[test]
fn panic_mode_recovers_at_statement_boundaries() {
    let message = compile_message("var = 1;\nvar = 2;");
    let lines: Vec<&str> = message.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("[line 1]"));
    assert!(lines[1].starts_with("[line 2]"));
}

#[test]
fn reading_local_in_own_initializer_is_an_error() {
    let message = compile_message("{ var a = 1; { var a = a; } }");
    assert!(
        message.contains("Can't read local variable in its own initializer."),
        "got: {message}"
    );
}

#[test]
fn duplicate_locals_are_rejected() {
    let message = compile_message("{ var a = 1; var a = 2; }");
    assert!(message.contains("Duplicate variable name in scope."), "got: {message}");
}

#[test]
fn break_outside_loop_is_rejected() {
    let message = compile_message("break;");
    assert!(message.contains("Not in a loop."), "got: {message}");
}

#[test]
fn return_outside_function_is_rejected() {
    let message = compile_message("return 1;");
    assert!(message.contains("Can't return from top-level."), "got: {message}");
}

#[test]
fn initializer_cannot_return_a_value() {
    let message = compile_message("class A { init() { return 3; } }");
    assert!(message.contains("Can't return value from initializer."), "got: {message}");
}

#[test]
fn this_and_super_outside_class_are_rejected() {
    assert!(compile_message("print this;").contains("Invalid outside of a class."));
    assert!(compile_message("class A { f() { super.f(); } }")
        .contains("Invalid in a class with no superclass."));
}

#[test]
fn rest_parameter_must_be_last() {
    let message = compile_message("fun f(..rest, x) { }");
    assert!(message.contains("Rest parameter must be last."), "got: {message}");
}

#[test]
fn invalid_assignment_targets_are_rejected() {
    assert!(compile_message("1 + 2 = 3;").contains("Invalid assignment target."));
    assert!(compile_message("var xs = [1]; xs[0:1] = 2;").contains("Invalid assignment target."));
}

#[test]
fn case_statement_shape_is_validated() {
    assert!(compile_message("case (1) { print 1; }")
        .contains("Can't have statement before any branch."));
    assert!(compile_message("case (1) { when 1: }").contains("Can't have empty branch."));
    assert!(
        compile_message("case (1) { else: print 1; when 2: print 2; }")
            .contains("Can't have branch after 'else'.")
    );
}

#[test]
fn too_many_constants_is_a_compile_error() {
    // 300 distinct string constants overflow the one-byte pool index.
    let mut source = String::new();
    for i in 0..300 {
        source.push_str(&format!("var v{i} = \"value number {i}\";\n"));
    }
    let message = compile_message(&source);
    assert!(message.contains("Too many constants in function."), "got: {message}");
}

// ---------------------------------------------------------------------------
// Garbage collector integration
// ---------------------------------------------------------------------------

#[test]
fn stress_collection_preserves_program_behavior() {
    let mut session = Session::new();
    session.interpret("dbg_stress(true);").unwrap();
    session
        .interpret(
            "fun make(n) { fun get() { return n; } return get; }\n\
             var fs = [];\n\
             for (var i = 0; i < 20; i = i + 1) append(fs, make(i));\n\
             var total = 0;\n\
             for (var i = 0; i < 20; i = i + 1) total = total + fs[i]();\n\
             print total;",
        )
        .unwrap();
    assert_eq!(session.take_output(), "190\n");
}

#[test]
fn stress_collection_with_classes_and_strings() {
    let mut session = Session::new();
    session.interpret("dbg_stress(true);").unwrap();
    session
        .interpret(
            "class Node { init(v) { this.v = v; this.next = nil; } }\n\
             var head = Node(0);\n\
             var cur = head;\n\
             for (var i = 1; i < 10; i = i + 1) { cur.next = Node(i); cur = cur.next; }\n\
             var sum = 0;\n\
             cur = head;\n\
             while (cur != nil) { sum = sum + cur.v; cur = cur.next; }\n\
             print sum;",
        )
        .unwrap();
    assert_eq!(session.take_output(), "45\n");
}
