use criterion::{Bencher, Criterion, black_box, criterion_group, criterion_main};
use scenic::{NoMessages, MemoryStreams, ParserOptions, VmContext, parse_scene};

/// Compiles the scene once, then measures repeated VM evaluation of the
/// named function over a small grid of arguments.
fn run_function(bench: &mut Bencher, scene_source: &str, function_name: &str) {
    let mut env = MemoryStreams::new();
    let mut messages = NoMessages;
    let scene = parse_scene("bench.pov", scene_source, &mut env, &mut messages, ParserOptions::default())
        .expect("benchmark scene parses");
    let id = scene
        .functions()
        .find_by_name(function_name)
        .expect("benchmark function exists");
    let registry = scene.functions();
    let mut context = VmContext::new();

    bench.iter(|| {
        let mut total = 0.0;
        for i in 0..64 {
            let x = f64::from(i) * 0.17;
            total += context.run_scalar(registry, id, &[x, 1.5, -0.5]).unwrap();
        }
        black_box(total);
    });
}

const PYTHAGORAS: &str = "
#declare dist = function(x, y, z) { sqrt(x*x + y*y + z*z) };
sphere { <0,0,0>, 1 }
";

const NESTED_CALLS: &str = "
#declare sq = function(x, y, z) { x*x };
#declare poly = function(x, y, z) { sq(x,0,0) + 3*sq(y,0,0) - sq(x+y,0,0)/2 + x^5 };
sphere { <0,0,0>, 1 }
";

const REDUCTION: &str = "
#declare series = function(x, y, z) { sum(i, 1, 32, 1/(i*i) + x) };
sphere { <0,0,0>, 1 }
";

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("vm_pythagoras", |b| run_function(b, PYTHAGORAS, "dist"));
    c.bench_function("vm_nested_calls", |b| run_function(b, NESTED_CALLS, "poly"));
    c.bench_function("vm_reduction_32", |b| run_function(b, REDUCTION, "series"));
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
