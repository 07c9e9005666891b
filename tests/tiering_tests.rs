//! Tier transitions and tier transparency

mod common;
use common::{eager, interpreter};
use quickjit::{CompileMode, EngineConfig, OptimizationStatus, Runtime, Value};

/// Functions paired with the calls they are checked on. The first call
/// also serves as warm-up, later calls may break the speculation.
const CASES: &[(&str, &str, &[&str])] = &[
    (
        "sum",
        "function sum(n) { var s = 0; for (var i = 0; i < n; i++) { s += i; } return s; }",
        &["sum(10)", "sum(100)", "sum(100000)", "sum(2.5)"],
    ),
    (
        "mix",
        "function mix(a, b) { return a * b + (a - b) / 2; }",
        &["mix(3, 4)", "mix(1.5, 2)", "mix('3', 2)", "mix(-4, 4)"],
    ),
    (
        "pick",
        "function pick(o) { return o.k > 2 ? o.k : -o.k; }",
        &["pick({k: 3})", "pick({k: 1})", "pick({j: 0, k: 5})", "pick({k: -7})"],
    ),
    (
        "greet",
        "function greet(s, n) { return s + n; }",
        &["greet('a', 1)", "greet('b', 'c')", "greet(1, 2)"],
    ),
    (
        "at",
        "function at(a, i) { var v = a[i]; return (v === undefined ? 0 : v) + a.length; }",
        &["at([1, 2, 3], 1)", "at([1, 2, 3], 5)", "at([1.5, 2], 0)", "at([1, 2], -1)"],
    ),
    (
        "bits",
        "function bits(x) { return (x << 3) ^ (x >>> 1); }",
        &["bits(5)", "bits(-1)", "bits(1.5)", "bits(4294967296)"],
    ),
    (
        "div",
        "function div(a, b) { return a / b; }",
        &["div(6, 3)", "div(7, 2)", "div(1, 0)", "div(0, -1)"],
    ),
    (
        "count",
        "function count(n) { var c = 0; while (n > 1) { n = n % 2 == 0 ? n / 2 : 3 * n + 1; c++; } return c; }",
        &["count(6)", "count(27)", "count(97)"],
    ),
];

fn run_case(mut runtime: Runtime, setup: &str, name: &str, calls: &[&str], directive: Option<&str>) -> Vec<Value> {
    runtime.eval(setup).unwrap();
    runtime.eval(calls[0]).unwrap();
    runtime.eval(calls[0]).unwrap();
    if let Some(directive) = directive {
        runtime
            .eval(&format!("%PrepareFunctionForOptimization({0}); %{1}({0});", name, directive))
            .unwrap();
    }
    calls.iter().map(|call| runtime.eval(call).unwrap()).collect()
}

mod transparency {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_every_tier_agrees_with_the_interpreter() {
        for &(name, setup, calls) in CASES {
            let expected = run_case(interpreter(), setup, name, calls, None);

            let mut baseline = Runtime::new();
            baseline.eval(setup).unwrap();
            baseline.eval(&format!("%CompileBaseline({});", name)).unwrap();
            let at_baseline: Vec<Value> = calls.iter().map(|call| baseline.eval(call).unwrap()).collect();
            assert_eq!(at_baseline, expected, "baseline {}", name);

            let mid = run_case(Runtime::new(), setup, name, calls, Some("OptimizeMaglevOnNextCall"));
            assert_eq!(mid, expected, "mid {}", name);

            let top = run_case(Runtime::new(), setup, name, calls, Some("OptimizeFunctionOnNextCall"));
            assert_eq!(top, expected, "top {}", name);
        }
    }

    #[test]
    fn test_natural_tier_up_agrees_with_the_interpreter() {
        let setup = "function poly(x) { return x * x - 3 * x + 2; }
                     var acc = 0;
                     for (var i = 0; i < 300; i++) { acc = acc + poly(i % 17); }
                     acc";
        let mut reference = interpreter();
        let mut runtime = eager();
        assert_eq!(runtime.eval(setup).unwrap(), reference.eval(setup).unwrap());
        assert_eq!(runtime.tier_of("poly"), Some("optimized-top"));
        let call = "poly(0.5) + poly(-3)";
        assert_eq!(runtime.eval(call).unwrap(), reference.eval(call).unwrap());
    }

    #[test]
    fn test_getter_side_effects_are_not_skipped() {
        let source = "var reads = 0;
                      var o = { get v() { reads = reads + 1; return 2; } };
                      function twice(o) { return o.v + o.v; }
                      for (var i = 0; i < 50; i++) twice(o);
                      reads";
        assert_eq!(eager().eval(source).unwrap(), Value::Number(100.0));
    }
}

mod transitions {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_interpreter_only_never_tiers_up() {
        let mut runtime = interpreter();
        runtime
            .eval("function f(x) { return x + 1; } for (var i = 0; i < 1000; i++) f(i); %OptimizeFunctionOnNextCall(f); f(1);")
            .unwrap();
        assert_eq!(runtime.tier_of("f"), Some("interpreted"));
        let stats = runtime.tiering_stats();
        assert_eq!((stats.baseline_compiles, stats.mid_compiles, stats.top_compiles), (0, 0, 0));
    }

    #[test]
    fn test_status_tracks_the_tiers() {
        let mut runtime = eager();
        runtime.eval("function f(x) { return x * 3; }").unwrap();
        let status = |runtime: &mut Runtime| {
            let bits = runtime.eval("%GetOptimizationStatus(f)").unwrap().as_number().unwrap();
            OptimizationStatus::from_bits_truncate(bits as u32)
        };
        assert!(status(&mut runtime).contains(OptimizationStatus::INTERPRETED));
        runtime.eval("f(1); f(2);").unwrap();
        assert!(status(&mut runtime).contains(OptimizationStatus::BASELINE));
        runtime.eval("for (var i = 0; i < 4; i++) f(i);").unwrap();
        assert!(status(&mut runtime).contains(OptimizationStatus::OPTIMIZED | OptimizationStatus::MID_TIER));
        runtime.eval("for (var i = 0; i < 8; i++) f(i);").unwrap();
        assert!(status(&mut runtime).contains(OptimizationStatus::OPTIMIZED | OptimizationStatus::TOP_TIER));
    }

    #[test]
    fn test_hot_loop_counts_toward_hotness() {
        let mut runtime = eager();
        runtime
            .eval("function spin(n) { var s = 0; for (var i = 0; i < n; i++) { s = s + i; } return s; } spin(500);")
            .unwrap();
        assert_ne!(runtime.tier_of("spin"), Some("interpreted"));
        assert_eq!(runtime.eval("spin(10)").unwrap(), Value::Number(45.0));
    }

    #[test]
    fn test_deopt_cooldown_delays_reoptimization() {
        let mut runtime = Runtime::with_config(EngineConfig {
            baseline_threshold: 1,
            optimize_threshold: 2,
            top_tier_threshold: 1000,
            deopt_cooldown: 20,
            ..EngineConfig::default()
        });
        runtime
            .eval("function inc(x) { return x + 1; } for (var i = 0; i < 10; i++) inc(i);")
            .unwrap();
        assert_eq!(runtime.tier_of("inc"), Some("optimized-mid"));
        assert_eq!(runtime.eval("inc(0.5)").unwrap(), Value::Number(1.5));
        assert_eq!(runtime.deopt_count("inc"), Some(1));
        runtime.eval("for (var i = 0; i < 10; i++) inc(i);").unwrap();
        assert!(!runtime.tier_of("inc").unwrap().starts_with("optimized"));
        runtime.eval("for (var i = 0; i < 30; i++) inc(i + 0.5);").unwrap();
        assert_eq!(runtime.tier_of("inc"), Some("optimized-mid"));
        assert_eq!(runtime.eval("inc(2.25)").unwrap(), Value::Number(3.25));
        assert_eq!(runtime.deopt_count("inc"), Some(1));
    }
}

mod concurrent {
    use super::*;
    use pretty_assertions::assert_eq;

    fn concurrent() -> Runtime {
        Runtime::with_config(EngineConfig {
            compile_mode: CompileMode::Concurrent,
            baseline_threshold: 2,
            optimize_threshold: 4,
            top_tier_threshold: 8,
            ..EngineConfig::default()
        })
    }

    #[test]
    fn test_results_match_while_jobs_are_in_flight() {
        let mut runtime = concurrent();
        let source = "function tri(n) { return n * (n + 1) / 2; }
                      var s = 0;
                      for (var i = 0; i < 200; i++) s = s + tri(i);
                      s";
        let expected = interpreter().eval(source).unwrap();
        assert_eq!(runtime.eval(source).unwrap(), expected);
        runtime.finalize_background_jobs();
        assert!(runtime.tier_of("tri").unwrap().starts_with("optimized"));
        assert_eq!(runtime.eval("tri(10)").unwrap(), Value::Number(55.0));
    }

    #[test]
    fn test_finalize_directive_installs_pending_code() {
        let mut runtime = concurrent();
        runtime
            .eval("function sq(x) { return x * x; } for (var i = 0; i < 6; i++) sq(i);")
            .unwrap();
        assert_eq!(runtime.tier_of("sq"), Some("compiling-mid"));
        runtime.eval("%FinalizeOptimization();").unwrap();
        assert_eq!(runtime.tiering_stats().installed_jobs, 1);
        assert_eq!(runtime.eval("%GetTier(sq)").unwrap(), Value::string("optimized-mid"));
    }
}

mod config {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_config_file_drives_thresholds() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"baseline_threshold": 1, "optimize_threshold": 1000, "top_tier_threshold": 1000}}"#).unwrap();
        let config = EngineConfig::from_file(file.path()).unwrap();
        let mut runtime = Runtime::with_config(config);
        runtime.eval("function f() { return 1; } f();").unwrap();
        assert_eq!(runtime.tier_of("f"), Some("baseline"));
    }

    #[test]
    fn test_invalid_config_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"polymorphism_capacity": 1}}"#).unwrap();
        assert!(EngineConfig::from_file(file.path()).is_err());
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(EngineConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_directives_need_natives_syntax() {
        let mut runtime = Runtime::with_config(EngineConfig {
            allow_natives_syntax: false,
            ..EngineConfig::default()
        });
        assert!(runtime.eval("function f() {} %GetTier(f)").is_err());
    }
}
