//! Compiled-function behavior: byte-code equivalence with direct
//! evaluation, runtime domain traps, and re-entrancy across threads.

use pretty_assertions::assert_eq;
use scenic::{
    CollectMessages, FunctionId, MemoryStreams, ParserOptions, SceneData, VmContext, VmErrorKind, parse_scene,
};

fn compile_function(declaration: &str, name: &str) -> (SceneData, FunctionId) {
    let mut env = MemoryStreams::new();
    let mut messages = CollectMessages::new();
    let source = format!("{declaration}\nsphere {{ <0,0,0>, 1 }}");
    let scene = parse_scene("fn.pov", &source, &mut env, &mut messages, ParserOptions::default())
        .unwrap_or_else(|e| panic!("function failed to compile: {e}"));
    let id = scene.functions().find_by_name(name).expect("function installed");
    (scene, id)
}

/// Checks the compiled program against a Rust closure over a grid of
/// arguments, the compiled-function equivalence property.
fn assert_equivalent(declaration: &str, name: &str, reference: impl Fn(f64, f64, f64) -> f64) {
    let (scene, id) = compile_function(declaration, name);
    let mut context = VmContext::new();
    for ix in -3..=3 {
        for iy in -3..=3 {
            for iz in -3..=3 {
                let (x, y, z) = (f64::from(ix) * 0.7, f64::from(iy) * 1.3, f64::from(iz) * 0.4);
                let expected = reference(x, y, z);
                let actual = context.run_scalar(scene.functions(), id, &[x, y, z]).unwrap();
                assert!(
                    (actual - expected).abs() < 1e-9 || (actual.is_nan() && expected.is_nan()),
                    "{name}({x}, {y}, {z}): vm {actual} != direct {expected}"
                );
            }
        }
    }
}

#[test]
fn test_pythagoras_at_3_4() {
    let (scene, id) = compile_function("#declare f = function(x, y) { sqrt(x*x + y*y) };", "f");
    let mut context = VmContext::new();
    assert_eq!(context.run_scalar(scene.functions(), id, &[3.0, 4.0]).unwrap(), 5.0);
}

#[test]
fn test_division_by_zero_traps_at_runtime() {
    let (scene, id) = compile_function("#declare f = function(x) { 1/x };", "f");
    let mut context = VmContext::new();
    let err = context.run_scalar(scene.functions(), id, &[0.0]).unwrap_err();
    assert_eq!(err.kind, VmErrorKind::DivisionByZero);
    assert_eq!(err.function, "f");
    assert!(err.to_string().contains("fn.pov"));
    assert_eq!(context.run_scalar(scene.functions(), id, &[4.0]).unwrap(), 0.25);
}

#[test]
fn test_equivalence_arithmetic_mix() {
    assert_equivalent(
        "#declare g = function(x, y, z) { (x + 2*y) * (z - x/4) + y^3 };",
        "g",
        |x, y, z| (x + 2.0 * y) * (z - x / 4.0) + y.powi(3),
    );
}

#[test]
fn test_equivalence_trig_and_guards() {
    assert_equivalent(
        "#declare g = function(x, y, z) { sin(x)*cos(y) + atan2(y, 1 + z*z) };",
        "g",
        |x, y, z| x.sin() * y.cos() + y.atan2(1.0 + z * z),
    );
}

#[test]
fn test_equivalence_select_and_comparisons() {
    assert_equivalent(
        "#declare g = function(x, y, z) { select(x, -1, 0, 1) + (y < z) * 10 };",
        "g",
        |x, y, z| {
            let sel = if x < 0.0 {
                -1.0
            } else if x == 0.0 {
                0.0
            } else {
                1.0
            };
            sel + if y < z { 10.0 } else { 0.0 }
        },
    );
}

#[test]
fn test_equivalence_logic_without_short_circuit() {
    assert_equivalent(
        "#declare g = function(x, y, z) { (x > 0 & y > 0) | (z > 1) };",
        "g",
        |x, y, z| {
            let and = (x > 0.0) && (y > 0.0);
            f64::from(and || z > 1.0)
        },
    );
}

#[test]
fn test_equivalence_sum_prod() {
    assert_equivalent(
        "#declare g = function(x, y, z) { sum(i, 1, 10, i*x) + prod(i, 1, 4, 1 + abs(y)) };",
        "g",
        |x, y, _| {
            let sum: f64 = (1..=10).map(|i| f64::from(i) * x).sum();
            let prod: f64 = (1..=4).map(|_| 1.0 + y.abs()).product();
            sum + prod
        },
    );
}

#[test]
fn test_equivalence_small_power_expansions() {
    for exponent in 2..=8 {
        let declaration = format!("#declare g = function(x, y, z) {{ (x + y/8) ^ {exponent} }};");
        assert_equivalent(&declaration, "g", move |x, y, _| (x + y / 8.0).powi(exponent));
    }
}

#[test]
fn test_declared_constant_folds_at_definition() {
    // the constant is baked in: redefining it later must not change f
    let mut env = MemoryStreams::new();
    let mut messages = CollectMessages::new();
    let scene = parse_scene(
        "fn.pov",
        "#declare K = 10;\n\
         #declare f = function(x) { x + K };\n\
         #declare K = 99;\n\
         sphere { <0,0,0>, 1 }",
        &mut env,
        &mut messages,
        ParserOptions::default(),
    )
    .unwrap();
    let id = scene.functions().find_by_name("f").unwrap();
    let mut context = VmContext::new();
    assert_eq!(context.run_scalar(scene.functions(), id, &[1.0]).unwrap(), 11.0);
}

#[test]
fn test_log_of_non_positive_traps() {
    let (scene, id) = compile_function("#declare f = function(x) { ln(x) };", "f");
    let mut context = VmContext::new();
    let err = context.run_scalar(scene.functions(), id, &[-1.0]).unwrap_err();
    assert_eq!(err.kind, VmErrorKind::LogOfNonPositive);
}

#[test]
fn test_zero_pow_zero_traps() {
    let (scene, id) = compile_function("#declare f = function(x, y) { x ^ y };", "f");
    let mut context = VmContext::new();
    let err = context.run_scalar(scene.functions(), id, &[0.0, 0.0]).unwrap_err();
    assert_eq!(err.kind, VmErrorKind::ZeroPowZero);
}

#[test]
fn test_mod_by_zero_traps() {
    let (scene, id) = compile_function("#declare f = function(x, y) { mod(x, y) };", "f");
    let mut context = VmContext::new();
    let err = context.run_scalar(scene.functions(), id, &[5.0, 0.0]).unwrap_err();
    assert_eq!(err.kind, VmErrorKind::DivisionByZero);
    assert_eq!(context.run_scalar(scene.functions(), id, &[7.0, 4.0]).unwrap(), 3.0);
}

#[test]
fn test_constant_division_by_zero_fails_at_compile_time() {
    let mut env = MemoryStreams::new();
    let mut messages = CollectMessages::new();
    let err = parse_scene(
        "fn.pov",
        "#declare f = function(x) { x / 0 };",
        &mut env,
        &mut messages,
        ParserOptions::default(),
    )
    .unwrap_err();
    assert_eq!(err.kind, scenic::ErrorKind::Domain);
}

#[test]
fn test_zero_power_warns_and_folds() {
    let mut env = MemoryStreams::new();
    let mut messages = CollectMessages::new();
    let scene = parse_scene(
        "fn.pov",
        "#declare f = function(x) { x ^ 0 };\nsphere { <0,0,0>, 1 }",
        &mut env,
        &mut messages,
        ParserOptions::default(),
    )
    .unwrap();
    assert!(messages.contains("zero power"));
    let id = scene.functions().find_by_name("f").unwrap();
    assert_eq!(VmContext::new().run_scalar(scene.functions(), id, &[55.0]).unwrap(), 1.0);
}

#[test]
fn test_user_function_calls_user_function() {
    let (scene, id) = compile_function(
        "#declare half = function(x) { x / 2 };\n\
         #declare f = function(x, y, z) { half(x) + half(y) * half(z) };",
        "f",
    );
    let mut context = VmContext::new();
    let out = context.run_scalar(scene.functions(), id, &[2.0, 4.0, 6.0]).unwrap();
    assert_eq!(out, 1.0 + 2.0 * 3.0);
}

#[test]
fn test_vector_function_member_access() {
    let (scene, id) = compile_function(
        "#declare swap = function(x, y, z) { <z, x, y> };\n\
         #declare f = function(x, y, z) { swap(x, y, z).x + swap(x, y, z).z * 100 };",
        "f",
    );
    let mut context = VmContext::new();
    // swap(1,2,3) = <3,1,2>: .x = 3, .z = 2
    let out = context.run_scalar(scene.functions(), id, &[1.0, 2.0, 3.0]).unwrap();
    assert_eq!(out, 3.0 + 2.0 * 100.0);
}

#[test]
fn test_parse_time_evaluation_of_functions() {
    let mut env = MemoryStreams::new();
    let mut messages = CollectMessages::new();
    parse_scene(
        "fn.pov",
        "#declare f = function(x, y) { sqrt(x*x + y*y) };\n\
         #declare d = f(3, 4);\n\
         #debug str(d, 0, -1)",
        &mut env,
        &mut messages,
        ParserOptions::default(),
    )
    .unwrap();
    assert_eq!(messages.debug_output(), "5.0\n");
}

#[test]
fn test_recursion_is_rejected_by_default() {
    let mut env = MemoryStreams::new();
    let mut messages = CollectMessages::new();
    let err = parse_scene(
        "fn.pov",
        "#declare f = function(x) { f(x - 1) };",
        &mut env,
        &mut messages,
        ParserOptions::default(),
    )
    .unwrap_err();
    assert!(err.message.contains("ecursive"));
}

#[test]
fn test_demoted_recursion_hits_call_depth_guard() {
    let mut env = MemoryStreams::new();
    let mut messages = CollectMessages::new();
    let options = ParserOptions {
        demote_possible_errors: true,
        ..ParserOptions::default()
    };
    let scene = parse_scene(
        "fn.pov",
        "#declare f = function(x) { f(x - 1) };\nsphere { <0,0,0>, 1 }",
        &mut env,
        &mut messages,
        options,
    )
    .unwrap();
    let id = scene.functions().find_by_name("f").unwrap();
    let err = VmContext::new().run_scalar(scene.functions(), id, &[1.0]).unwrap_err();
    assert_eq!(err.kind, VmErrorKind::CallDepthExceeded);
}

#[test]
fn test_concurrent_evaluation_is_reentrant() {
    let (scene, id) = compile_function(
        "#declare f = function(x, y, z) { sum(i, 1, 50, sin(x * i) / i) + y * z };",
        "f",
    );
    let registry = scene.functions();

    // baseline, single-threaded
    let mut reference = Vec::new();
    {
        let mut context = VmContext::new();
        for i in 0..8 {
            let x = f64::from(i) * 0.37;
            reference.push(context.run_scalar(registry, id, &[x, 2.0, 3.0]).unwrap());
        }
    }

    // the same evaluations race on independent contexts
    std::thread::scope(|scope| {
        for _ in 0..4 {
            let reference = &reference;
            scope.spawn(move || {
                let mut context = VmContext::new();
                for round in 0..50 {
                    let i = round % 8;
                    let x = f64::from(i) * 0.37;
                    let out = context.run_scalar(registry, id, &[x, 2.0, 3.0]).unwrap();
                    assert_eq!(out, reference[i as usize], "results depend only on arguments");
                }
            });
        }
    });
}

#[test]
fn test_compiled_function_serializes() {
    // the compiled artifact round-trips through the wire format
    let (scene, id) = compile_function("#declare f = function(x) { x * x + 1 };", "f");
    let code = scene.functions().get(id);
    let bytes = postcard::to_allocvec(code).expect("function code serializes");
    let restored: scenic::function::FunctionCode = postcard::from_bytes(&bytes).expect("function code deserializes");
    assert_eq!(restored.name, "f");
    assert_eq!(restored.program, code.program);
}
