//! Shared test helpers for integration tests

use quickjit::{EngineConfig, Runtime, Value};

/// Run JavaScript code and return the result
#[allow(dead_code)]
pub fn run_js(code: &str) -> quickjit::Result<Value> {
    let mut runtime = Runtime::new();
    runtime.eval(code)
}

/// Run JavaScript and get its display string
#[allow(dead_code)]
pub fn run_js_string(code: &str) -> String {
    let mut runtime = Runtime::new();
    match runtime.eval(code) {
        Ok(value) => runtime.agent().to_display_string(&value),
        Err(e) => format!("Error: {}", e),
    }
}

/// A runtime that never leaves the interpreter
#[allow(dead_code)]
pub fn interpreter() -> Runtime {
    Runtime::with_config(EngineConfig::interpreter_only())
}

/// A runtime whose thresholds make functions tier up after a few calls
#[allow(dead_code)]
pub fn eager() -> Runtime {
    Runtime::with_config(EngineConfig {
        baseline_threshold: 2,
        optimize_threshold: 4,
        top_tier_threshold: 8,
        deopt_cooldown: 2,
        ..EngineConfig::default()
    })
}

/// Define `setup`, warm `name` with `warmup`, then force it to the given
/// optimizing level with a directive (`OptimizeMaglevOnNextCall` or
/// `OptimizeFunctionOnNextCall`)
#[allow(dead_code)]
pub fn optimized(setup: &str, name: &str, warmup: &str, directive: &str) -> Runtime {
    let mut runtime = Runtime::with_config(EngineConfig {
        deopt_cooldown: 2,
        ..EngineConfig::default()
    });
    runtime.eval(setup).unwrap();
    runtime
        .eval(&format!("%PrepareFunctionForOptimization({0}); {1}", name, warmup))
        .unwrap();
    runtime.eval(&format!("%{}({});", directive, name)).unwrap();
    runtime
}
