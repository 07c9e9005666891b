//! Deoptimization: guard failures, de-inlining, scalar replacement and
//! dependency invalidation

mod common;
use common::{eager, interpreter, optimized};
use quickjit::{DeoptReason, EngineConfig, Runtime, Value};

mod guards {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_shape_change_after_long_monomorphic_run() {
        let mut runtime = Runtime::new();
        let result = runtime
            .eval(
                "function getX(o) { return o.x; }
                 var s = 0;
                 for (var i = 0; i < 10000; i++) { s = s + getX({x: i}); }
                 s",
            )
            .unwrap();
        assert_eq!(result, Value::Number(49995000.0));
        assert!(runtime.tier_of("getX").unwrap().starts_with("optimized"));

        assert_eq!(runtime.eval("getX({y: 1, x: 42})").unwrap(), Value::Number(42.0));
        let events = runtime.deopt_events();
        assert!(events
            .iter()
            .any(|e| e.function == "getX" && e.reason == DeoptReason::WrongShape));
        assert_eq!(runtime.eval("getX({x: 5}) + getX({y: 0, x: 6})").unwrap(), Value::Number(11.0));
    }

    #[test]
    fn test_int32_overflow_gives_the_double_result() {
        let mut runtime = optimized(
            "function add(a, b) { return a + b; }",
            "add",
            "for (var i = 0; i < 10; i++) add(i, i);",
            "OptimizeFunctionOnNextCall",
        );
        assert_eq!(runtime.eval("add(1, 2)").unwrap(), Value::Number(3.0));
        assert_eq!(runtime.tier_of("add"), Some("optimized-top"));
        assert_eq!(runtime.eval("add(2147483647, 2147483647)").unwrap(), Value::Number(4294967294.0));
        assert_eq!(runtime.deopt_events()[0].reason, DeoptReason::Overflow);
        assert_eq!(runtime.eval("add(-2147483648, -1)").unwrap(), Value::Number(-2147483649.0));
    }

    #[test]
    fn test_non_number_argument_deopts() {
        let mut runtime = optimized(
            "function scale(x) { return x * 2; }",
            "scale",
            "scale(1); scale(2);",
            "OptimizeMaglevOnNextCall",
        );
        assert_eq!(runtime.eval("scale(21)").unwrap(), Value::Number(42.0));
        assert_eq!(runtime.eval("scale('4')").unwrap(), Value::Number(8.0));
        assert_eq!(runtime.eval("scale({})").unwrap().as_number().map(f64::is_nan), Some(true));
        assert_eq!(runtime.deopt_count("scale"), Some(1));
    }

    #[test]
    fn test_out_of_bounds_read_deopts() {
        let mut runtime = optimized(
            "function first(a, i) { return a[i]; }",
            "first",
            "first([1, 2], 0); first([3, 4], 1);",
            "OptimizeMaglevOnNextCall",
        );
        assert_eq!(runtime.eval("first([7, 8], 1)").unwrap(), Value::Number(8.0));
        assert_eq!(runtime.eval("first([7, 8], 2)").unwrap(), Value::Undefined);
        assert_eq!(runtime.deopt_events()[0].reason, DeoptReason::OutOfBounds);
    }

    #[test]
    fn test_unexecuted_branch_deopts_on_first_use() {
        let mut runtime = optimized(
            "function sign(o) { if (o.v < 0) { return o.label; } return 'positive'; }",
            "sign",
            "sign({v: 1, label: 'negative'}); sign({v: 2, label: 'negative'});",
            "OptimizeMaglevOnNextCall",
        );
        assert_eq!(runtime.eval("sign({v: 3, label: 'negative'})").unwrap(), Value::string("positive"));
        assert_eq!(runtime.eval("sign({v: -3, label: 'negative'})").unwrap(), Value::string("negative"));
        assert_eq!(runtime.deopt_events()[0].reason, DeoptReason::InsufficientFeedback);
    }

    #[test]
    fn test_loop_phi_widens_after_deopt() {
        let source = "function halve(n) { var x = n; var steps = 0; while (x > 1) { x = x / 2; steps++; } return x + steps; }";
        let mut runtime = optimized(source, "halve", "halve(8); halve(16);", "OptimizeFunctionOnNextCall");
        let mut reference = interpreter();
        reference.eval(source).unwrap();
        for call in ["halve(64)", "halve(10)", "halve(7.5)"] {
            assert_eq!(runtime.eval(call).unwrap(), reference.eval(call).unwrap(), "{}", call);
        }
    }
}

mod lifecycle {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_forced_deopt_then_rerun_matches_interpreter() {
        let mut runtime = optimized(
            "function f(x) { return x * x + 1; }",
            "f",
            "f(1); f(2);",
            "OptimizeFunctionOnNextCall",
        );
        assert_eq!(runtime.eval("f(3)").unwrap(), Value::Number(10.0));
        runtime.eval("%DeoptimizeFunction(f);").unwrap();
        assert!(!runtime.tier_of("f").unwrap().starts_with("optimized"));
        assert_eq!(runtime.eval("f(3)").unwrap(), Value::Number(10.0));
        assert_eq!(runtime.eval("%DeoptCount(f)").unwrap(), Value::Number(1.0));
    }

    #[test]
    fn test_deopt_loops_converge() {
        let mut runtime = Runtime::with_config(EngineConfig {
            baseline_threshold: 1,
            optimize_threshold: 2,
            top_tier_threshold: 4,
            deopt_cooldown: 1,
            max_deopts: 3,
            ..EngineConfig::default()
        });
        // alternating between int and string inputs breaks every speculation
        let result = runtime
            .eval(
                "function id2(x) { return x + x; }
                 var out = 0;
                 for (var i = 0; i < 400; i++) { out = out + (i % 2 == 0 ? id2(i) : id2('1').length); }
                 out",
            )
            .unwrap();
        assert_eq!(result, Value::Number(80000.0));
        assert!(runtime.deopt_count("id2").unwrap() <= 3);
        let before = runtime.deopt_events().len();
        runtime.eval("for (var i = 0; i < 100; i++) { id2(i); id2('x'); }").unwrap();
        assert_eq!(runtime.deopt_events().len(), before);
    }

    #[test]
    fn test_deopt_events_serialize() {
        let mut runtime = optimized(
            "function add(a, b) { return a + b; }",
            "add",
            "add(1, 2); add(3, 4);",
            "OptimizeMaglevOnNextCall",
        );
        runtime.eval("add(1, 2); add(0.5, 1);").unwrap();
        let event = &runtime.deopt_events()[0];
        let json = serde_json::to_value(event).unwrap();
        assert_eq!(json["function"], "add");
        assert_eq!(json["level"], "mid");
        assert_eq!(json["lazy"], false);
    }
}

mod inlining {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_deopt_in_inlined_callee_rebuilds_both_frames() {
        let mut runtime = optimized(
            "function inner(a) { return a + 1; }
             function outer(a) { return inner(a) * 2; }",
            "outer",
            "outer(1); outer(2);",
            "OptimizeFunctionOnNextCall",
        );
        assert_eq!(runtime.eval("outer(3)").unwrap(), Value::Number(8.0));
        assert_eq!(runtime.eval("outer(2147483647)").unwrap(), Value::Number(4294967296.0));
        let event = &runtime.deopt_events()[0];
        assert_eq!(event.reason, DeoptReason::Overflow);
        assert_eq!(event.function, "inner");
        assert_eq!(event.frames, 2);
    }

    #[test]
    fn test_three_level_chain_keeps_per_frame_locals() {
        let mut runtime = optimized(
            "function f1(a) { var t = a * 3; %DeoptimizeNow(); return t + 1; }
             function f2(a) { var u = a + 10; return f1(u) + u; }
             function f3(a) { var w = a - 1; return f2(w) + w; }",
            "f3",
            "f3(1); f3(2);",
            "OptimizeFunctionOnNextCall",
        );
        // w = 4, u = 14, t = 42
        assert_eq!(runtime.eval("f3(5)").unwrap(), Value::Number(61.0));
        let event = &runtime.deopt_events()[0];
        assert_eq!(event.reason, DeoptReason::ForcedByDirective);
        assert_eq!(event.function, "f1");
        assert_eq!(event.frames, 3);
    }

    #[test]
    fn test_inlined_exception_unwinds_like_the_interpreter() {
        let source = "function check(x) { if (x > 100) throw new RangeError('too big'); return x; }
                      function wrap(x) { return check(x) + 1; }";
        let mut runtime = optimized(source, "wrap", "wrap(1); wrap(2);", "OptimizeFunctionOnNextCall");
        assert_eq!(runtime.eval("wrap(5)").unwrap(), Value::Number(6.0));
        let caught = "var m; try { wrap(500); } catch (e) { m = e.name + ': ' + e.message; } m";
        assert_eq!(runtime.eval(caught).unwrap(), Value::string("RangeError: too big"));
    }

    #[test]
    fn test_inlining_budget_is_respected() {
        let mut runtime = Runtime::with_config(EngineConfig {
            max_inlined_bytecode_size: 1,
            ..EngineConfig::default()
        });
        runtime
            .eval(
                "function inner(a) { return a + 1; }
                 function outer(a) { return inner(a) * 2; }
                 outer(1); outer(2);",
            )
            .unwrap();
        let ir = runtime.dump_ir("outer", quickjit::OptimizationLevel::Top).unwrap();
        assert!(ir.contains("Call"));
    }
}

mod escape_analysis {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_nested_constructors_materialize_on_deopt() {
        let mut runtime = optimized(
            "function Inner(v) { this.v = v; %DeoptimizeNow(); }
             function Middle(v) { this.inner = new Inner(v + 1); }
             function Outer(v) { this.middle = new Middle(v + 1); }
             function make(v) { var o = new Outer(v); return o.middle.inner.v; }",
            "make",
            "make(1); make(2);",
            "OptimizeFunctionOnNextCall",
        );
        assert_eq!(runtime.eval("make(1)").unwrap(), Value::Number(3.0));
        let event = &runtime.deopt_events()[0];
        assert_eq!(event.reason, DeoptReason::ForcedByDirective);
        assert_eq!(event.function, "Inner");
        assert_eq!(event.frames, 4);
        assert_eq!(event.materialized, 3);
    }

    #[test]
    fn test_materialized_object_is_the_one_returned() {
        let mut runtime = optimized(
            "function Pair(a, b) { this.a = a; this.b = b; }
             function build(a, b) { var p = new Pair(a, b); %DeoptimizeNow(); return p; }",
            "build",
            "build(1, 2); build(3, 4);",
            "OptimizeFunctionOnNextCall",
        );
        let result = runtime.eval("var p = build(5, 6); p.a * 10 + p.b").unwrap();
        assert_eq!(result, Value::Number(56.0));
        assert_eq!(runtime.deopt_events()[0].reason, DeoptReason::ForcedByDirective);
    }

    #[test]
    fn test_scalar_replaced_loop_keeps_semantics() {
        let source = "function Vec(x, y) { this.x = x; this.y = y; }
                      function len2(x, y) { var v = new Vec(x, y); return v.x * v.x + v.y * v.y; }
                      var s = 0; for (var i = 0; i < 200; i++) s = s + len2(i, 1);
                      s + len2(0.5, 0.5)";
        let expected = interpreter().eval(source).unwrap();
        let mut runtime = eager();
        assert_eq!(runtime.eval(source).unwrap(), expected);
    }
}

mod dependencies {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_prototype_change_invalidates_constant_load() {
        let mut runtime = optimized(
            "function P() {} P.prototype.k = 2;
             function getK(o) { return o.k; }
             var p = new P();",
            "getK",
            "getK(p); getK(p);",
            "OptimizeMaglevOnNextCall",
        );
        assert_eq!(runtime.eval("getK(p)").unwrap(), Value::Number(2.0));
        assert_eq!(runtime.tier_of("getK"), Some("optimized-mid"));
        runtime.eval("P.prototype.k = 5;").unwrap();
        assert_eq!(runtime.eval("getK(p)").unwrap(), Value::Number(5.0));
        assert!(!runtime.tier_of("getK").unwrap().starts_with("optimized"));
    }

    #[test]
    fn test_invalidation_reaches_live_frames() {
        let mut runtime = optimized(
            "var k = 3;
             function poke() { k = 7; }
             function f(flag) { var before = k; if (flag) poke(); return before * 10 + k; }",
            "f",
            "f(false); f(false);",
            "OptimizeMaglevOnNextCall",
        );
        assert_eq!(runtime.eval("f(false)").unwrap(), Value::Number(33.0));
        assert_eq!(runtime.eval("f(true)").unwrap(), Value::Number(37.0));
        assert_eq!(runtime.eval("f(false)").unwrap(), Value::Number(77.0));
    }

    #[test]
    fn test_shared_feedback_serves_sibling_closures() {
        let mut runtime = Runtime::new();
        runtime
            .eval(
                "function make() { return function (o) { return o.x; }; }
                 var a = make(); var b = make();
                 a({x: 1}); a({y: 2, x: 3});
                 %OptimizeMaglevOnNextCall(b);",
            )
            .unwrap();
        assert_eq!(runtime.eval("b({x: 4}) + b({y: 5, x: 6})").unwrap(), Value::Number(10.0));
        assert_eq!(runtime.tier_of("b"), Some("optimized-mid"));
        assert!(runtime.deopt_events().is_empty());
        assert_eq!(runtime.eval("b({z: 0, x: 9})").unwrap(), Value::Number(9.0));
        assert_eq!(runtime.deopt_events().len(), 1);
        assert_eq!(runtime.tier_of("a"), Some("interpreted"));
    }
}
