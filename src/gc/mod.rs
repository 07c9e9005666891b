//! Collection of dead function records
//!
//! Heap objects are reference counted, so objects themselves need no
//! tracing. What the engine must reclaim explicitly is its side tables:
//! the function table holds only weak references to closures, and once a
//! closure is gone its record, feedback, baseline code and optimized code
//! are unreachable from script.
//!
//! A record survives while any activation still runs it. Optimized code
//! names other functions by [`FunctionId`](crate::runtime::FunctionId)
//! and never keeps them alive.

use crate::runtime::{Agent, FunctionId};
use rustc_hash::FxHashSet as HashSet;
use serde::Serialize;

/// Result of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcStats {
    /// Records examined
    pub scanned: usize,
    /// Records dropped
    pub freed: usize,
    /// Optimized code objects unlinked with their record
    pub code_discarded: usize,
    /// Records still live after the sweep
    pub live: usize,
}

/// Drop every record whose closure is gone and which no activation uses
pub fn sweep(agent: &mut Agent) -> GcStats {
    let running: HashSet<FunctionId> = agent.activations.iter().map(|activation| activation.function).collect();
    let dead: Vec<FunctionId> = agent
        .functions
        .iter()
        .filter(|record| !record.is_alive() && !running.contains(&record.id))
        .map(|record| record.id)
        .collect();

    let mut stats = GcStats {
        scanned: agent.functions.len(),
        ..GcStats::default()
    };
    for id in dead {
        let Some(record) = agent.functions.remove(id) else {
            continue;
        };
        if let Some(code) = record.optimized {
            // lets any pending job or stale reference see the code as gone
            code.validity.invalidate(crate::deopt::DeoptReason::DependencyInvalidated);
            stats.code_discarded += 1;
        }
        stats.freed += 1;
    }
    stats.live = agent.functions.len();
    if stats.freed > 0 {
        tracing::debug!(
            freed = stats.freed,
            live = stats.live,
            code_discarded = stats.code_discarded,
            "swept function records"
        );
    }
    stats
}

#[cfg(test)]
mod tests {
    use crate::runtime::{Runtime, Value};

    #[test]
    fn test_unreachable_closures_are_swept() {
        let mut runtime = Runtime::new();
        runtime
            .eval("function make() { return function (x) { return x + 1; }; } var f = make(); f(1);")
            .unwrap();
        let before = runtime.collect_garbage();
        runtime.eval("f = null;").unwrap();
        let after = runtime.collect_garbage();
        assert_eq!(after.live + 1, before.live);
    }

    #[test]
    fn test_sweep_keeps_reachable_functions() {
        let mut runtime = Runtime::new();
        runtime.eval("function keep(x) { return x * 2; } keep(2);").unwrap();
        let stats = runtime.collect_garbage();
        assert_eq!(stats.freed, 0);
        assert_eq!(runtime.eval("keep(21)").unwrap(), Value::Number(42.0));
    }

    #[test]
    fn test_optimized_code_goes_with_its_record() {
        let mut runtime = Runtime::new();
        runtime
            .eval(
                "function make() { return function (x) { return x + 1; }; }
                 var g = make(); g(1); g(2); %OptimizeMaglevOnNextCall(g); g(3);",
            )
            .unwrap();
        runtime.set_global("g", Value::Null);
        let stats = runtime.collect_garbage();
        assert_eq!(stats.freed, 1);
        assert_eq!(stats.code_discarded, 1);
    }
}
