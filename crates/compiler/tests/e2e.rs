//! End-to-end scenarios: compile Poke source, run it in the VM, and
//! observe values and IO-space contents.

use poke_runtime::Vm;
use pokec::Compiler;

fn compiler() -> Compiler {
    Compiler::new(Vm::new(), None).expect("bootstrap")
}

fn eval_i64(c: &mut Compiler, src: &str) -> i64 {
    let val = c
        .compile_statement(src)
        .unwrap_or_else(|e| panic!("compiling {:?}: {}", src, e))
        .unwrap_or_else(|| panic!("{:?} produced no value", src));
    c.vm().heap.as_i64(val).expect("integral result")
}

#[test]
fn bootstrap_brings_the_standard_environment() {
    let mut c = compiler();
    assert!(c.bootstrapped_p());
    // Units and types from std.pk are usable right away.
    assert_eq!(eval_i64(&mut c, "(4#B)'magnitude;"), 4);
    assert_eq!(eval_i64(&mut c, "min(7, 3) as int<32>;"), 3);
    assert_eq!(eval_i64(&mut c, "E_div_by_zero;"), 1);
}

#[test]
fn statement_compilation_returns_the_last_value() {
    // var x = 1 + 2; x * 10; gives int<32> 30.
    let mut c = compiler();
    let val = c
        .compile_statement("var x = 1 + 2; x * 10;")
        .unwrap()
        .unwrap();
    assert_eq!(c.vm().heap.integral_parts(val), Some((30, 32, true)));
}

#[test]
fn expression_compilation_yields_a_program() {
    let mut c = compiler();
    let program = c.compile_expression("2 ** 8 - 1").unwrap();
    let val = c.vm_mut().run(&program).unwrap();
    assert_eq!(c.vm().heap.as_i64(val), Some(255));
}

#[test]
fn failed_compilations_do_not_touch_the_environment() {
    let mut c = compiler();
    c.set_quiet(true);
    assert!(c.compile_buffer("var good = 1;").is_ok());
    assert!(c.compile_buffer("var bad = \"x\" + 1;").is_err());
    // The failed attempt left no trace; good is still there and bad
    // is not.
    assert_eq!(eval_i64(&mut c, "good;"), 1);
    assert!(c.compile_statement("bad;").is_err());
}

#[test]
fn integral_struct_width_mismatch_is_rejected() {
    // The fields amount to 16 bits but the itype is 8 bits wide.
    let mut c = compiler();
    c.set_quiet(true);
    let err = c
        .compile_buffer("type X = struct int<8> { int<8> a; int<8> b; };")
        .unwrap_err();
    assert!(err.contains("16 bits"), "unexpected error: {}", err);
    assert!(err.contains("8 bits wide"), "unexpected error: {}", err);
}

#[test]
fn division_by_zero_is_caught_with_its_code() {
    let mut c = compiler();
    let code = eval_i64(
        &mut c,
        "var zero = 0; try { 1/zero; } catch if e : Exception { e.code; }",
    );
    assert_eq!(code, 1);
}

#[test]
fn literal_division_by_zero_fails_the_fold() {
    let mut c = compiler();
    c.set_quiet(true);
    let err = c.compile_statement("1/0;").unwrap_err();
    assert!(err.contains("division by zero"), "{}", err);
}

#[test]
fn uncaught_exceptions_terminate_with_error() {
    let mut c = compiler();
    c.set_quiet(true);
    let err = c
        .compile_statement("var zero = 0; 1/zero;")
        .unwrap_err();
    assert!(err.contains("unhandled exception"), "{}", err);
}

#[test]
fn mapped_struct_round_trips_through_memory() {
    let mut c = compiler();
    c.compile_buffer("type Point = struct { int<32> x; int<32> y; };")
        .unwrap();
    c.compile_buffer("var ios = open(\"*scratch*\");").unwrap();

    // Map, write through the mapping, and observe with a fresh map.
    c.compile_buffer("var p = Point @ 0#B; p.x = 7;").unwrap();
    assert_eq!(eval_i64(&mut c, "(Point @ 0#B).x;"), 7);
    assert_eq!(eval_i64(&mut c, "(Point @ 0#B).y;"), 0);

    // The mapping attributes agree.
    assert_eq!(eval_i64(&mut c, "p'mapped;"), 1);
    assert_eq!(eval_i64(&mut c, "p'ios;"), eval_i64(&mut c, "ios;"));
}

#[test]
fn packed_integers_read_back_per_spec() {
    let mut c = compiler();
    c.compile_buffer("var ios = open(\"*pack*\");").unwrap();
    // Seed the bytes AB CD EF 12.
    let id = c.vm().ios.cur().unwrap();
    c.vm_mut()
        .ios
        .dev_pwrite(id, &[0xab, 0xcd, 0xef, 0x12], 0)
        .unwrap();

    c.vm_mut().set_endian(poke_runtime::Endian::Msb);
    assert_eq!(eval_i64(&mut c, "(int<12> @ 4#b) & 0xfff;"), 0xbcd);
    c.vm_mut().set_endian(poke_runtime::Endian::Lsb);
    assert_eq!(eval_i64(&mut c, "(int<12> @ 0#b) & 0xfff;"), 0xdab);
}

#[test]
fn sizeof_matches_runtime_size() {
    let mut c = compiler();
    c.compile_buffer("type Point = struct { int<32> x; int<32> y; };")
        .unwrap();
    c.compile_buffer("var ios = open(\"*m*\");").unwrap();
    // Compile-time sizeof equals the run-time 'size of a value of
    // the type.
    assert_eq!(eval_i64(&mut c, "sizeof(Point) == 8#B;"), 1);
    assert_eq!(
        eval_i64(&mut c, "sizeof(Point) == (Point @ 0#B)'size;"),
        1
    );
    assert_eq!(eval_i64(&mut c, "sizeof(int<13>)'magnitude;"), 13);
}

#[test]
fn lexical_addresses_stay_stable_across_nesting() {
    let mut c = compiler();
    c.compile_buffer(
        "var a = 1; \
         fun f = (int<32> k) int<32>: { \
           var b = k + a; \
           { var cc = b * 2; return cc; } \
         }",
    )
    .unwrap();
    assert_eq!(eval_i64(&mut c, "f(20);"), 42);

    // For-in iterators bind in their own frame.
    assert_eq!(
        eval_i64(
            &mut c,
            "var total = 0; for (v in [1,2,3]) { total = total + v; } total;"
        ),
        6
    );

    // Selectors filter the iteration.
    assert_eq!(
        eval_i64(
            &mut c,
            "var n = 0; for (v in [1,2,3,4] where v % 2 == 0) n = n + v; n;"
        ),
        6
    );

    // Break and continue unwind the frames they cross.
    assert_eq!(
        eval_i64(
            &mut c,
            "var i = 0; var n = 0; \
             while (1) { \
               i++; \
               if (i > 5) break; \
               if (i % 2) continue; \
               n = n + i; \
             } n;"
        ),
        6
    );
}

#[test]
fn closures_capture_their_environment() {
    let mut c = compiler();
    c.compile_buffer(
        "fun make_adder = (int<32> n) (int<32>)int<32>: { \
           return lambda (int<32> x) int<32>: { return x + n; }; \
         } \
         var add3 = make_adder(3);",
    )
    .unwrap();
    assert_eq!(eval_i64(&mut c, "add3(39);"), 42);
}

#[test]
fn recursion_and_optional_arguments() {
    let mut c = compiler();
    c.compile_buffer(
        "fun fact = (int<64> n) int<64>: { \
           if (n <= 1) return 1; \
           return n * fact(n - 1); \
         }",
    )
    .unwrap();
    assert_eq!(eval_i64(&mut c, "fact(10) as int<32>;"), 3628800);

    c.compile_buffer(
        "fun scaled = (int<32> x, int<32> factor = 10) int<32>: { \
           return x * factor; \
         }",
    )
    .unwrap();
    assert_eq!(eval_i64(&mut c, "scaled(4);"), 40);
    assert_eq!(eval_i64(&mut c, "scaled(4, 2);"), 8);
    assert_eq!(eval_i64(&mut c, "scaled(4, :factor 3);"), 12);
}

#[test]
fn varargs_collect_into_an_array() {
    let mut c = compiler();
    c.compile_buffer(
        "fun count = (int<32> first, ...rest) int<32>: { \
           return first + rest'length as int<32>; \
         }",
    )
    .unwrap();
    assert_eq!(eval_i64(&mut c, "count(10);"), 10);
    assert_eq!(eval_i64(&mut c, "count(10, 1, 2, 3);"), 13);
}

#[test]
fn zero_argument_functions_autocall() {
    let mut c = compiler();
    c.compile_buffer("fun answer = int<32>: { return 42; }")
        .unwrap();
    // A bare reference to a zero-argument function is a call.
    assert_eq!(eval_i64(&mut c, "answer;"), 42);
    assert_eq!(eval_i64(&mut c, "answer + 1;"), 43);
}

#[test]
fn arrays_trimmers_and_membership() {
    let mut c = compiler();
    assert_eq!(eval_i64(&mut c, "[1,2,3]'length as int<32>;"), 3);
    assert_eq!(eval_i64(&mut c, "[1,2,3][1];"), 2);
    assert_eq!(eval_i64(&mut c, "([1,2,3,4][1:3])'length as int<32>;"), 2);
    assert_eq!(eval_i64(&mut c, "2 in [1,2,3];"), 1);
    assert_eq!(eval_i64(&mut c, "9 in [1,2,3];"), 0);
    assert_eq!(eval_i64(&mut c, "([1,2] + [3,4])'length as int<32>;"), 4);
}

#[test]
fn string_operations() {
    let mut c = compiler();
    let val = c
        .compile_statement("\"foo\" + \"bar\";")
        .unwrap()
        .unwrap();
    assert_eq!(c.vm().heap.as_str(val), Some("foobar"));
    assert_eq!(eval_i64(&mut c, "\"abc\"'length as int<32>;"), 3);
    assert_eq!(eval_i64(&mut c, "\"abc\"[1] as int<32>;"), 98);

    let val = c
        .compile_statement("format(\"x=%i32, s=%s\", 7, \"ok\");")
        .unwrap()
        .unwrap();
    assert_eq!(c.vm().heap.as_str(val), Some("x=7, s=ok"));
}

#[test]
fn isa_and_casts() {
    let mut c = compiler();
    assert_eq!(eval_i64(&mut c, "1 isa int<32>;"), 1);
    assert_eq!(eval_i64(&mut c, "1 isa uint<8>;"), 0);
    assert_eq!(eval_i64(&mut c, "(0xabc as uint<8>) as int<32>;"), 0xbc);
    assert_eq!(eval_i64(&mut c, "(2#B as offset<uint<64>,b>)'magnitude as int<32>;"), 16);
}

#[test]
fn offset_arithmetic_normalizes_units() {
    let mut c = compiler();
    // 4#8 + 4#12 = 80 bits = 20 units of 4.
    assert_eq!(eval_i64(&mut c, "(4#8 + 4#12)'unit as int<32>;"), 4);
    assert_eq!(eval_i64(&mut c, "(4#8 + 4#12)'magnitude as int<32>;"), 20);
    assert_eq!(eval_i64(&mut c, "(8#B / 2#B) as int<32>;"), 4);
    assert_eq!(eval_i64(&mut c, "(2 * 3#B)'magnitude as int<32>;"), 6);
}

#[test]
fn try_until_swallows_the_matching_exception() {
    let mut c = compiler();
    c.compile_buffer("var ios = open(\"*m*\");").unwrap();
    // Walk bytes until the space runs out.
    assert_eq!(
        eval_i64(
            &mut c,
            "var n = 0; var off = 0#B; \
             try { \
               while (1) { \
                 (uint<8> @ off); \
                 n = n + 1; \
                 off = off + 1#B; \
               } \
             } until E_eof; \
             n;"
        ),
        4096
    );
}

#[test]
fn integral_structs_recompose() {
    let mut c = compiler();
    c.compile_buffer("type Word = struct int<16> { uint<8> hi; uint<8> lo; };")
        .unwrap();
    c.compile_buffer("var ios = open(\"*w*\");").unwrap();
    let id = c.vm().ios.cur().unwrap();
    c.vm_mut().ios.dev_pwrite(id, &[0x12, 0x34], 0).unwrap();

    c.vm_mut().set_endian(poke_runtime::Endian::Msb);
    assert_eq!(eval_i64(&mut c, "(Word @ 0#B).hi as int<32>;"), 0x12);
    assert_eq!(eval_i64(&mut c, "(Word @ 0#B).lo as int<32>;"), 0x34);
    assert_eq!(
        eval_i64(&mut c, "(Word @ 0#B) as int<16> as int<32>;"),
        0x1234
    );
}

#[test]
fn io_intrinsics_drive_the_spaces() {
    let mut c = compiler();
    let id = eval_i64(&mut c, "var a = open(\"*a*\"); a;");
    let id2 = eval_i64(&mut c, "var b = open(\"*b*\"); b;");
    assert_ne!(id, id2);
    assert_eq!(eval_i64(&mut c, "get_ios();"), id2);
    c.compile_buffer("set_ios(a);").unwrap();
    assert_eq!(eval_i64(&mut c, "get_ios();"), id);
    assert_eq!(eval_i64(&mut c, "iosize(a)'magnitude as int<32>;"), 4096);
    c.compile_buffer("close(b);").unwrap();
    // Opening the same handler again is an error while it is open.
    c.set_quiet(true);
    assert!(c.compile_buffer("var again = open(\"*a*\");").is_err());
}

#[test]
fn struct_methods_are_callable() {
    let mut c = compiler();
    c.compile_buffer(
        "type Pair = struct { \
           int<32> x; \
           int<32> y; \
           method tag = int<32>: { return 99; } \
         };",
    )
    .unwrap();
    assert_eq!(eval_i64(&mut c, "Pair { x = 1, y = 2 }.tag;"), 99);
}
