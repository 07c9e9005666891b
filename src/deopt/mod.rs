//! Deoptimization
//!
//! Optimized code leaves through a typed [`ControlTransfer`] rather than
//! an exception. The transfer names a deopt point of the code's graph; the
//! point describes, for every logical frame (inlined callees included,
//! innermost first), which registers hold the locals, the operand stack
//! and the receiver, plus the field values of any allocation that escape
//! analysis removed. [`deoptimize`] turns that into interpreter frames.

use crate::interpreter::Frame;
use crate::jit::{DeoptId, InstalledCode, RegValue, StateValue};
use crate::runtime::{Agent, FunctionId, Object, ObjectKind, ObjectRef, Value};
use crate::tiering::{OptimizationLevel, TierState};
use rustc_hash::FxHashMap as HashMap;
use serde::Serialize;
use std::cell::RefCell;
use std::rc::Rc;

/// Why optimized code was abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DeoptReason {
    WrongShape,
    NotInt32,
    LostPrecision,
    NotANumber,
    Overflow,
    MinusZero,
    DivisionByZero,
    NotAnArray,
    OutOfBounds,
    WrongCallTarget,
    /// Code reached a site that had never executed when it was compiled
    InsufficientFeedback,
    /// `%DeoptimizeNow()` or `%DeoptimizeFunction(f)`
    ForcedByDirective,
    DependencyInvalidated,
    DebuggerAttached,
}

impl DeoptReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DeoptReason::WrongShape => "wrong shape",
            DeoptReason::NotInt32 => "not an int32",
            DeoptReason::LostPrecision => "lost precision",
            DeoptReason::NotANumber => "not a number",
            DeoptReason::Overflow => "overflow",
            DeoptReason::MinusZero => "minus zero",
            DeoptReason::DivisionByZero => "division by zero",
            DeoptReason::NotAnArray => "not an array",
            DeoptReason::OutOfBounds => "out of bounds",
            DeoptReason::WrongCallTarget => "wrong call target",
            DeoptReason::InsufficientFeedback => "insufficient feedback",
            DeoptReason::ForcedByDirective => "forced by directive",
            DeoptReason::DependencyInvalidated => "dependency invalidated",
            DeoptReason::DebuggerAttached => "debugger attached",
        }
    }
}

impl std::fmt::Display for DeoptReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How optimized code hands control back to the runtime
#[derive(Debug)]
pub enum ControlTransfer {
    Deoptimize {
        point: DeoptId,
        reason: DeoptReason,
        /// Taken after an effectful operation rather than before a guard
        lazy: bool,
        /// The register file at the moment of the transfer
        registers: Vec<RegValue>,
    },
}

/// A completed deoptimization, as retained in the agent's log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeoptEvent {
    pub function: String,
    pub function_id: u32,
    pub reason: DeoptReason,
    /// Offset the innermost reconstructed frame resumes at
    pub bytecode_offset: usize,
    /// Number of interpreter frames reconstructed
    pub frames: usize,
    /// Objects materialized from scalar-replaced allocations
    pub materialized: usize,
    pub level: OptimizationLevel,
    pub lazy: bool,
}

impl DeoptEvent {
    #[cfg(test)]
    pub fn for_test(reason: DeoptReason, bytecode_offset: usize) -> Self {
        Self {
            function: "test".to_string(),
            function_id: 0,
            reason,
            bytecode_offset,
            frames: 1,
            materialized: 0,
            level: OptimizationLevel::Mid,
            lazy: false,
        }
    }
}

/// Unlink invalid or abandoned code from its function and apply the
/// re-optimization policy. Safe to call more than once for the same code.
pub fn discard_optimized_code(agent: &mut Agent, id: FunctionId, code: &Rc<InstalledCode>, reason: DeoptReason) {
    code.validity.invalidate(reason);
    let debugging = agent.debugging();
    let (cooldown, max_deopts) = (agent.config.deopt_cooldown, agent.config.max_deopts);
    let Some(record) = agent.functions.get_mut(id) else {
        return;
    };
    let linked = record
        .optimized
        .as_ref()
        .is_some_and(|installed| Rc::ptr_eq(installed, code));
    if !linked {
        return;
    }
    record.optimized = None;
    agent.tiering.stats.deopts += 1;
    // Debugger attaches say nothing about the code's speculation
    if reason != DeoptReason::DebuggerAttached {
        record.deopt_count += 1;
    }
    record.tier = if record.shared.baseline.borrow().is_some() && !debugging {
        TierState::Baseline
    } else {
        TierState::Interpreted
    };
    record.cooldown = cooldown;
    record.hotness = 0;
    if record.deopt_count >= max_deopts && !record.optimization_disabled {
        record.optimization_disabled = true;
        tracing::info!(
            function = %record.shared.name,
            deopts = record.deopt_count,
            "too many deoptimizations; optimization disabled"
        );
    }
}

/// Rebuild interpreter frames for a transfer out of `code`, innermost
/// first, and unlink the code from its function.
pub fn deoptimize(agent: &mut Agent, id: FunctionId, code: &Rc<InstalledCode>, transfer: ControlTransfer) -> Vec<Frame> {
    let ControlTransfer::Deoptimize {
        point,
        reason,
        lazy,
        registers,
    } = transfer;
    let graph = &code.graph.graph;
    let point = graph.deopt_point(point);
    let mut materializer = Materializer {
        registers: &registers,
        objects: &point.virtual_objects,
        memo: HashMap::default(),
    };

    let mut frames = Vec::with_capacity(point.frames.len());
    for state in &point.frames {
        let Some(shared) = code.link.frames.get(state.function).cloned() else {
            continue;
        };
        let function = code.link.function_ids.get(state.function).copied().unwrap_or(id);
        let locals = state.locals.iter().map(|value| materializer.value(agent, value)).collect();
        let stack = state.stack.iter().map(|value| materializer.value(agent, value)).collect();
        let this = materializer.value(agent, &state.this);
        frames.push(Frame {
            function,
            shared,
            pc: state.pc,
            locals,
            stack,
            this,
            handlers: Vec::new(),
            construct: state.construct,
        });
    }
    let materialized = materializer.memo.len();

    if let Some(activation) = agent.activations.last_mut() {
        activation.deopt_requested = None;
    }
    discard_optimized_code(agent, id, code, reason);

    let event = DeoptEvent {
        function: frames.first().map(|f| f.shared.name.clone()).unwrap_or_default(),
        function_id: id.0,
        reason,
        bytecode_offset: frames.first().map_or(0, |f| f.pc),
        frames: frames.len(),
        materialized,
        level: code.level,
        lazy,
    };
    tracing::info!(
        function = %event.function,
        reason = reason.as_str(),
        offset = event.bytecode_offset,
        frames = event.frames,
        materialized,
        lazy,
        "deoptimized"
    );
    agent.log_deopt(event);
    frames
}

/// Turns state values into heap values, allocating each scalar-replaced
/// object exactly once per deoptimization
struct Materializer<'a> {
    registers: &'a [RegValue],
    objects: &'a [crate::jit::VirtualObject],
    memo: HashMap<u32, ObjectRef>,
}

impl Materializer<'_> {
    fn value(&mut self, agent: &mut Agent, value: &StateValue) -> Value {
        match *value {
            StateValue::Node(node) => self
                .registers
                .get(node.index())
                .map(RegValue::to_value)
                .unwrap_or_default(),
            StateValue::Virtual(index) => Value::Object(self.object(agent, index)),
        }
    }

    fn object(&mut self, agent: &mut Agent, index: u32) -> ObjectRef {
        if let Some(object) = self.memo.get(&index) {
            return object.clone();
        }
        let Some(description) = self.objects.get(index as usize) else {
            return agent.create_plain_object();
        };
        let object = Rc::new(RefCell::new(Object::new(description.shape, ObjectKind::Ordinary)));
        self.memo.insert(index, object.clone());
        let fields: Vec<Value> = description.fields.iter().map(|field| self.value(agent, field)).collect();
        object.borrow_mut().slots = fields;
        object
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::runtime::Runtime;

    fn optimized_runtime() -> Runtime {
        Runtime::with_config(EngineConfig {
            deopt_cooldown: 2,
            ..EngineConfig::default()
        })
    }

    #[test]
    fn test_wrong_shape_deopts_and_resumes() {
        let mut runtime = optimized_runtime();
        runtime
            .eval(
                "function getX(o) { return o.x; }
                 %PrepareFunctionForOptimization(getX);
                 getX({x: 1}); getX({x: 2});
                 %OptimizeMaglevOnNextCall(getX);
                 getX({x: 3});",
            )
            .unwrap();
        assert_eq!(runtime.tier_of("getX"), Some("optimized-mid"));
        assert_eq!(runtime.eval("getX({y: 0, x: 7})").unwrap(), Value::Number(7.0));
        let events = runtime.deopt_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, DeoptReason::WrongShape);
        assert!(!events[0].lazy);
        assert_eq!(runtime.deopt_count("getX"), Some(1));
        assert_eq!(runtime.tier_of("getX"), Some("interpreted"));
    }

    #[test]
    fn test_overflow_produces_double_result() {
        let mut runtime = optimized_runtime();
        runtime
            .eval(
                "function add(a, b) { return a + b; }
                 %PrepareFunctionForOptimization(add);
                 add(1, 2); add(3, 4);
                 %OptimizeFunctionOnNextCall(add);
                 add(5, 6);",
            )
            .unwrap();
        assert_eq!(runtime.eval("add(2147483647, 1)").unwrap(), Value::Number(2147483648.0));
        assert_eq!(runtime.deopt_events()[0].reason, DeoptReason::Overflow);
    }

    #[test]
    fn test_forced_deopt_keeps_locals() {
        let mut runtime = optimized_runtime();
        runtime
            .eval(
                "function f(a) { var b = a * 2; %DeoptimizeNow(); return b + %ActiveTier().length; }
                 %PrepareFunctionForOptimization(f);
                 f(1); f(2);
                 %OptimizeFunctionOnNextCall(f);",
            )
            .unwrap();
        // "interpreted".length == 11
        assert_eq!(runtime.eval("f(10)").unwrap(), Value::Number(31.0));
        let event = &runtime.deopt_events()[0];
        assert_eq!(event.reason, DeoptReason::ForcedByDirective);
        assert_eq!(event.frames, 1);
    }

    #[test]
    fn test_repeated_deopts_pin_the_function() {
        let mut runtime = Runtime::with_config(EngineConfig {
            max_deopts: 2,
            deopt_cooldown: 0,
            ..EngineConfig::default()
        });
        runtime.eval("function f(x) { return x + 1; }").unwrap();
        for _ in 0..3 {
            runtime
                .eval(
                    "%PrepareFunctionForOptimization(f); f(1); f(2);
                     %OptimizeMaglevOnNextCall(f); f(3);
                     %DeoptimizeFunction(f);",
                )
                .unwrap();
        }
        assert_eq!(runtime.deopt_count("f"), Some(2));
        let status = runtime.eval("%GetOptimizationStatus(f) & 2").unwrap();
        assert_eq!(status, Value::Number(2.0));
    }

    #[test]
    fn test_debugger_attaches_do_not_pin_the_function() {
        let mut runtime = Runtime::with_config(EngineConfig {
            max_deopts: 2,
            deopt_cooldown: 0,
            ..EngineConfig::default()
        });
        runtime.eval("function f(x) { return x + 1; }").unwrap();
        for _ in 0..3 {
            runtime
                .eval(
                    "%PrepareFunctionForOptimization(f); f(1); f(2);
                     %OptimizeMaglevOnNextCall(f); f(3);",
                )
                .unwrap();
            assert_eq!(runtime.tier_of("f"), Some("optimized-mid"));
            runtime.enter_debugging_mode(crate::debugger::ExecutionRecorder::new());
            assert_eq!(runtime.tier_of("f"), Some("interpreted"));
            assert!(runtime.leave_debugging_mode().is_some());
        }
        assert_eq!(runtime.deopt_count("f"), Some(0));
        assert_eq!(runtime.eval("%GetOptimizationStatus(f) & 2").unwrap(), Value::Number(0.0));
        runtime
            .eval("%PrepareFunctionForOptimization(f); %OptimizeMaglevOnNextCall(f); f(4);")
            .unwrap();
        assert_eq!(runtime.tier_of("f"), Some("optimized-mid"));
    }
}
