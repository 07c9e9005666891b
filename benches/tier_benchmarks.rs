//! Tier benchmarks for quickjit
//!
//! Run with: cargo bench
//!
//! Each workload runs once per tier configuration:
//! - interpreter only
//! - interpreter and baseline
//! - the full pipeline up to the top optimizing level

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use quickjit::{EngineConfig, Runtime};

const WORKLOADS: &[(&str, &str, &str)] = &[
    (
        "int_loop",
        "function sum(n) { var s = 0; for (var i = 0; i < n; i++) { s = s + (i & 7); } return s; }",
        "sum(2000)",
    ),
    (
        "property_access",
        "function P(x, y) { this.x = x; this.y = y; }
         function dot(n) { var s = 0; for (var i = 0; i < n; i++) { var p = new P(i, 2); s = s + p.x * p.y; } return s; }",
        "dot(500)",
    ),
    (
        "calls",
        "function sq(x) { return x * x; }
         function hyp(n) { var s = 0; for (var i = 0; i < n; i++) { s = s + sq(i) + sq(i + 1); } return s; }",
        "hyp(500)",
    ),
    (
        "fib",
        "function fib(n) { return n <= 1 ? n : fib(n - 1) + fib(n - 2); }",
        "fib(15)",
    ),
];

fn tiers() -> Vec<(&'static str, EngineConfig)> {
    vec![
        ("interpreter", EngineConfig::interpreter_only()),
        (
            "baseline",
            EngineConfig {
                optimize_threshold: 1_000_000_000,
                top_tier_threshold: 1_000_000_000,
                ..EngineConfig::default()
            },
        ),
        ("optimizing", EngineConfig::default()),
    ]
}

/// Benchmark: steady-state execution per tier
fn bench_steady_state(c: &mut Criterion) {
    for &(name, setup, call) in WORKLOADS {
        let mut group = c.benchmark_group(name);
        for (tier, config) in tiers() {
            group.bench_with_input(BenchmarkId::new("steady", tier), &config, |b, config| {
                let mut runtime = Runtime::with_config(config.clone());
                runtime.eval(setup).unwrap();
                // warm up until the hot functions settle in their final tier
                for _ in 0..50 {
                    runtime.eval(call).unwrap();
                }
                b.iter(|| runtime.eval(black_box(call)).unwrap())
            });
        }
        group.finish();
    }
}

/// Benchmark: a fresh runtime including all tier-up work
fn bench_cold(c: &mut Criterion) {
    let mut group = c.benchmark_group("cold");
    let (_, setup, call) = WORKLOADS[0];
    for (tier, config) in tiers() {
        group.bench_with_input(BenchmarkId::new("int_loop", tier), &config, |b, config| {
            b.iter(|| {
                let mut runtime = Runtime::with_config(config.clone());
                runtime.eval(setup).unwrap();
                black_box(runtime.eval(call).unwrap())
            })
        });
    }
    group.finish();
}

/// Benchmark: compiling one function at each optimizing level
fn bench_compilation(c: &mut Criterion) {
    let mut group = c.benchmark_group("compilation");
    let (_, setup, call) = WORKLOADS[2];
    for level in [quickjit::OptimizationLevel::Mid, quickjit::OptimizationLevel::Top] {
        group.bench_function(level.as_str(), |b| {
            let mut runtime = Runtime::with_config(EngineConfig::interpreter_only());
            runtime.eval(setup).unwrap();
            runtime.eval(call).unwrap();
            b.iter(|| runtime.dump_ir(black_box("hyp"), level).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_steady_state, bench_cold, bench_compilation);
criterion_main!(benches);
