//! `%Name(args)` test directives
//!
//! Directives only steer tiering. Passing something other than a script
//! function is not an error; the directive does nothing and reports an
//! empty status.

use super::{Agent, Completion, FunctionId, Value};
use crate::bytecode::Intrinsic;
use crate::deopt::DeoptReason;
use crate::tiering::{self, OptimizationLevel, OptimizationStatus};

fn target(args: &[Value]) -> Option<FunctionId> {
    args.first()?.as_object()?.borrow().function_id()
}

fn mark(agent: &mut Agent, id: FunctionId, level: OptimizationLevel) {
    if let Some(record) = agent.functions.get_mut(id) {
        if record.can_optimize() {
            record.marked = Some(level);
            tracing::debug!(function = %record.shared.name, level = level.as_str(), "marked for optimization");
        }
    }
}

/// Run a directive
pub fn call(agent: &mut Agent, intrinsic: Intrinsic, args: &[Value]) -> Completion<Value> {
    let function = target(args);
    let value = match intrinsic {
        Intrinsic::PrepareFunctionForOptimization => {
            if let Some(record) = function.and_then(|id| agent.functions.get_mut(id)) {
                record.prepared = true;
            }
            Value::Undefined
        }
        Intrinsic::OptimizeFunctionOnNextCall => {
            if let Some(id) = function {
                mark(agent, id, OptimizationLevel::Top);
            }
            Value::Undefined
        }
        Intrinsic::OptimizeMaglevOnNextCall => {
            if let Some(id) = function {
                mark(agent, id, OptimizationLevel::Mid);
            }
            Value::Undefined
        }
        Intrinsic::CompileBaseline => {
            if let Some(id) = function {
                tiering::compile_baseline(agent, id);
            }
            Value::Undefined
        }
        Intrinsic::DeoptimizeFunction => {
            if let Some(id) = function {
                tiering::deoptimize_function(agent, id, DeoptReason::ForcedByDirective);
            }
            Value::Undefined
        }
        // optimized code lowers this to a deopt exit; lower tiers have nothing to leave
        Intrinsic::DeoptimizeNow => Value::Undefined,
        Intrinsic::NeverOptimizeFunction => {
            if let Some(id) = function {
                if let Some(record) = agent.functions.get_mut(id) {
                    record.never_optimize = true;
                    record.marked = None;
                }
                tiering::deoptimize_function(agent, id, DeoptReason::ForcedByDirective);
            }
            Value::Undefined
        }
        Intrinsic::GetOptimizationStatus => {
            let bits = function.map_or(OptimizationStatus::empty(), |id| tiering::status(agent, id));
            Value::Number(bits.bits() as f64)
        }
        Intrinsic::GetTier => match function.and_then(|id| agent.functions.get(id)) {
            Some(record) => Value::string(tiering::tier_name(record)),
            None => Value::Undefined,
        },
        Intrinsic::ActiveTier => match agent.activations.last() {
            Some(activation) => Value::string(activation.kind.tier_name()),
            None => Value::string("interpreted"),
        },
        Intrinsic::FinalizeOptimization => {
            tiering::finalize_background_jobs(agent);
            Value::Undefined
        }
        Intrinsic::DeoptCount => {
            let count = function
                .and_then(|id| agent.functions.get(id))
                .map_or(0, |record| record.deopt_count);
            Value::Number(count as f64)
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use crate::runtime::{Runtime, Value};

    #[test]
    fn test_directives_on_non_functions_are_inert() {
        let mut runtime = Runtime::new();
        assert_eq!(runtime.eval("%GetOptimizationStatus(1)").unwrap(), Value::Number(0.0));
        assert_eq!(runtime.eval("%DeoptCount({})").unwrap(), Value::Number(0.0));
        assert_eq!(runtime.eval("%OptimizeFunctionOnNextCall(null)").unwrap(), Value::Undefined);
    }

    #[test]
    fn test_get_tier_reports_the_record() {
        let mut runtime = Runtime::new();
        runtime.eval("function f(x) { return x; } f(1);").unwrap();
        assert_eq!(runtime.eval("%GetTier(f)").unwrap(), Value::string("interpreted"));
        runtime.eval("%CompileBaseline(f);").unwrap();
        assert_eq!(runtime.eval("%GetTier(f)").unwrap(), Value::string("baseline"));
    }

    #[test]
    fn test_directives_after_blocks_and_conditions() {
        let mut runtime = Runtime::new();
        runtime
            .eval("function f(x) { return x; }\n%PrepareFunctionForOptimization(f);\nf(1);\n%CompileBaseline(f)")
            .unwrap();
        assert_eq!(runtime.tier_of("f"), Some("baseline"));
        let result = runtime
            .eval("function g(c) { if (c) %DeoptimizeNow(); return 1; } g(true) + g(false)")
            .unwrap();
        assert_eq!(result, Value::Number(2.0));
        assert_eq!(runtime.eval("var a = 7; (a) %3").unwrap(), Value::Number(1.0));
    }

    #[test]
    fn test_active_tier_follows_the_calling_frame() {
        let mut runtime = Runtime::new();
        runtime
            .eval("function t() { return %ActiveTier(); } t(); %OptimizeMaglevOnNextCall(t);")
            .unwrap();
        assert_eq!(runtime.eval("t()").unwrap(), Value::string("optimized-mid"));
        assert_eq!(runtime.eval("%ActiveTier()").unwrap(), Value::string("interpreted"));
    }
}
