//! Debugger attach, generators across tiers, workers and collection

mod common;
use common::{eager, interpreter};
use quickjit::debugger::ExecutionRecorder;
use quickjit::runtime::native_fn;
use quickjit::{DeoptReason, EngineConfig, Message, Runtime, SharedRegion, Value, WorkerPool};
use std::cell::Cell;
use std::rc::Rc;

mod debugger {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Registers `attach()`, which enters debugging mode the first time it
    /// runs after `armed` is set
    fn with_attach(runtime: &mut Runtime, recorder: &ExecutionRecorder) -> Rc<Cell<bool>> {
        let armed = Rc::new(Cell::new(false));
        let trigger = armed.clone();
        let hook = recorder.clone();
        runtime.register_native(
            "attach",
            native_fn(move |agent, _this, _args| {
                if trigger.replace(false) {
                    agent.enter_debugging_mode(Box::new(hook.clone()));
                }
                Ok(Value::Undefined)
            }),
        );
        armed
    }

    #[test]
    fn test_attach_during_optimized_recursion() {
        let mut runtime = Runtime::new();
        let recorder = ExecutionRecorder::new();
        let armed = with_attach(&mut runtime, &recorder);
        runtime
            .eval(
                "function fact(n) { if (n <= 1) { attach(); return 1; } return n * fact(n - 1); }
                 fact(3); fact(4);
                 %OptimizeFunctionOnNextCall(fact);",
            )
            .unwrap();
        armed.set(true);
        assert_eq!(runtime.eval("fact(5)").unwrap(), Value::Number(120.0));
        assert!(runtime.is_debugging());

        let events = runtime.deopt_events();
        assert_eq!(events.len(), 5);
        assert!(events
            .iter()
            .all(|e| e.reason == DeoptReason::DebuggerAttached && e.lazy && e.function == "fact"));
        assert_eq!(runtime.tier_of("fact"), Some("interpreted"));

        let start = recorder.history().len();
        assert_eq!(runtime.eval("fact(3)").unwrap(), Value::Number(6.0));
        let mut seen: Vec<f64> = recorder.history()[start..]
            .iter()
            .filter(|view| view.function == "fact")
            .filter_map(|view| view.local("n").and_then(Value::as_number))
            .collect();
        seen.dedup();
        assert_eq!(seen, vec![3.0, 2.0, 1.0]);
    }

    #[test]
    fn test_nothing_tiers_up_while_debugging() {
        let mut runtime = eager();
        let recorder = ExecutionRecorder::new();
        runtime.enter_debugging_mode(recorder.clone());
        runtime
            .eval("function f(x) { return x + 1; } for (var i = 0; i < 100; i++) f(i); %OptimizeFunctionOnNextCall(f); f(0);")
            .unwrap();
        assert_eq!(runtime.tier_of("f"), Some("interpreted"));
        assert!(recorder.stats().statements > 100);

        assert!(runtime.leave_debugging_mode().is_some());
        runtime.eval("for (var i = 0; i < 100; i++) f(i);").unwrap();
        assert!(runtime.tier_of("f").unwrap().starts_with("optimized"));
    }

    #[test]
    fn test_breakpoints_and_debugger_statements() {
        let mut runtime = Runtime::new();
        let recorder = ExecutionRecorder::new();
        recorder.add_breakpoint(3);
        runtime.enter_debugging_mode(recorder.clone());
        runtime
            .eval("var total = 0;\nfor (var i = 0; i < 4; i++) {\n  total = total + i;\n}\ndebugger;\ntotal")
            .unwrap();
        assert_eq!(recorder.breakpoint(3).map(|b| b.hit_count), Some(4));
        let stats = recorder.stats();
        assert_eq!(stats.breakpoint_hits, 4);
        assert_eq!(stats.debugger_statements, 1);
        assert!(recorder.remove_breakpoint(3));
    }

    #[test]
    fn test_variable_changes_are_tracked() {
        let mut runtime = Runtime::new();
        let recorder = ExecutionRecorder::new();
        runtime.enter_debugging_mode(recorder.clone());
        runtime
            .eval("function step() {\n  var x = 1;\n  x = x * 5;\n  x = x + 2;\n  return x;\n}\nstep()")
            .unwrap();
        let values: Vec<Value> = recorder.find_variable_changes("x").into_iter().map(|(_, v)| v).collect();
        assert_eq!(
            values,
            vec![Value::Undefined, Value::Number(1.0), Value::Number(5.0), Value::Number(7.0)]
        );
    }
}

mod generators {
    use super::*;
    use pretty_assertions::assert_eq;

    const SOURCE: &str = "function* range(n) { for (var i = 0; i < n; i++) yield i * i; }
                          function total(n) {
                              var g = range(n);
                              var s = 0;
                              var r = g.next();
                              while (!r.done) { s = s + r.value; r = g.next(); }
                              return s;
                          }";

    #[test]
    fn test_generators_agree_across_tiers() {
        let mut reference = interpreter();
        let mut runtime = eager();
        reference.eval(SOURCE).unwrap();
        runtime.eval(SOURCE).unwrap();
        for n in [0, 1, 5, 40] {
            let call = format!("var t = 0; for (var k = 0; k < 20; k++) t = t + total({}); t", n);
            assert_eq!(runtime.eval(&call).unwrap(), reference.eval(&call).unwrap(), "n = {}", n);
        }
        assert_ne!(runtime.tier_of("total"), Some("interpreted"));
    }

    #[test]
    fn test_suspended_baseline_generator_downgrades_on_resume() {
        let mut runtime = Runtime::new();
        runtime
            .eval(
                "function* count(n) { for (var i = 0; i < n; i++) yield i; }
                 %CompileBaseline(count);
                 var g = count(3);
                 g.next();",
            )
            .unwrap();
        assert_eq!(runtime.tiering_stats().deferred_downgrades, 0);
        runtime.enter_debugging_mode(ExecutionRecorder::new());
        assert_eq!(runtime.eval("g.next().value").unwrap(), Value::Number(1.0));
        assert_eq!(runtime.tiering_stats().deferred_downgrades, 1);
        assert_eq!(runtime.eval("g.next().value + (g.next().done ? 10 : 0)").unwrap(), Value::Number(12.0));
    }
}

mod workers {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_workers_tier_up_independently() {
        let config = EngineConfig {
            baseline_threshold: 2,
            optimize_threshold: 4,
            top_tier_threshold: 8,
            ..EngineConfig::default()
        };
        let mut pool = WorkerPool::new(config, 2);
        let source = "function sq(x) { return x * x; }
                      var s = 0;
                      for (var i = 0; i < workerData.n; i++) s = s + sq(i);
                      postMessage({ label: workerData.label, sum: s });
                      s";
        for (label, n) in [("a", 10.0), ("b", 100.0)] {
            let data = Message::Record(vec![
                ("label".into(), Message::String(label.into())),
                ("n".into(), Message::Number(n)),
            ]);
            pool.spawn(source, Some(data)).unwrap();
        }
        let reports = pool.join_all();
        assert!(pool.is_empty());
        assert_eq!(reports[0].result, Ok(Message::Number(285.0)));
        assert_eq!(reports[1].result, Ok(Message::Number(328350.0)));
        assert_eq!(
            reports[1].messages,
            vec![Message::Record(vec![
                ("label".into(), Message::String("b".into())),
                ("sum".into(), Message::Number(328350.0)),
            ])]
        );
        assert!(reports[1].tiering.mid_compiles + reports[1].tiering.top_compiles >= 1);
    }

    #[test]
    fn test_shared_region_accumulates_across_workers() {
        let region = SharedRegion::new(2);
        let mut pool = WorkerPool::new(EngineConfig::default(), 4).with_shared_region(region.clone());
        for _ in 0..4 {
            pool.spawn("for (var i = 0; i < 250; i++) sharedAdd(0, 1); sharedStore(1, sharedLength()); 0", None)
                .unwrap();
        }
        let reports = pool.join_all();
        assert!(reports.iter().all(|report| report.result.is_ok()));
        assert_eq!(region.snapshot(), vec![1000.0, 2.0]);
    }

    #[test]
    fn test_worker_errors_are_reported() {
        let mut pool = WorkerPool::new(EngineConfig::default(), 1);
        pool.spawn("null.x", None).unwrap();
        let report = pool.join_all().remove(0);
        assert!(report.result.unwrap_err().contains("TypeError"));
    }
}

mod gc {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_dead_closures_do_not_accumulate() {
        let mut runtime = Runtime::new();
        runtime
            .eval(
                "function make() { return function (x) { return x + 1; }; }
                 var s = 0;
                 for (var i = 0; i < 200; i++) s = s + make()(i);",
            )
            .unwrap();
        let stats = runtime.collect_garbage();
        assert!(stats.live < 10, "{:?}", stats);
        assert_eq!(runtime.eval("s").unwrap(), Value::Number(20100.0));
    }

    #[test]
    fn test_collection_keeps_optimized_callers_working() {
        let mut runtime = eager();
        runtime
            .eval(
                "function helper(x) { return x * 2; }
                 function caller(x) { return helper(x) + 1; }
                 for (var i = 0; i < 50; i++) caller(i);",
            )
            .unwrap();
        runtime.collect_garbage();
        assert_eq!(runtime.eval("caller(20)").unwrap(), Value::Number(41.0));
    }
}
