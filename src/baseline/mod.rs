//! Baseline tier
//!
//! Template compilation of bytecode into a vector of pre-bound closures,
//! one per instruction. Baseline code uses the interpreter's frame layout
//! and its feedback-recording helpers, so it keeps collecting feedback
//! while it runs and a frame can drop back to the interpreter at any
//! statement boundary. Named loads get a polymorphic inline cache and the
//! common int32 arithmetic and comparison cases get fast paths.

use crate::bytecode::{BinaryOp, CompareOp, Instruction};
use crate::feedback::{Observation, OperandHint};
use crate::interpreter::{self, Exit, Frame, FrameExit};
use crate::runtime::{as_int32, Agent, Completion, FrameKind, Name, PropertyKind, ShapeId, SharedFunctionInfo, Value};
use std::cell::RefCell;

type BaselineOp = Box<dyn Fn(&mut Agent, &mut Frame) -> Completion<Option<Exit>>>;

/// Baseline code for one function literal
pub struct BaselineCode {
    ops: Vec<BaselineOp>,
    statement_starts: Vec<bool>,
}

impl BaselineCode {
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl std::fmt::Debug for BaselineCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaselineCode").field("ops", &self.ops.len()).finish()
    }
}

/// Compile a function's bytecode
pub fn compile(shared: &SharedFunctionInfo) -> BaselineCode {
    let chunk = &shared.chunk;
    BaselineCode {
        ops: chunk.code.iter().map(|&instruction| compile_instruction(instruction)).collect(),
        statement_starts: chunk.statement_starts.clone(),
    }
}

/// Run baseline code from `frame.pc` until the frame exits or must switch tiers
pub(crate) fn run(agent: &mut Agent, frame: &mut Frame, code: &BaselineCode) -> Completion<Exit> {
    loop {
        let pc = frame.pc;
        let Some(op) = code.ops.get(pc) else {
            return Ok(Exit::Done(FrameExit::Return(Value::Undefined)));
        };
        if code.statement_starts.get(pc).copied().unwrap_or(false)
            && (agent.debugging() || frame.shared.baseline.borrow().is_none())
        {
            return Ok(Exit::Switch(FrameKind::Interpreted));
        }
        frame.pc = pc + 1;
        if let Some(exit) = op(agent, frame)? {
            return Ok(exit);
        }
    }
}

fn compile_instruction(instruction: Instruction) -> BaselineOp {
    match instruction {
        Instruction::GetLocal(slot) => Box::new(move |_, frame| {
            let value = frame.local(slot);
            frame.push(value);
            Ok(None)
        }),
        Instruction::SetLocal(slot) => Box::new(move |_, frame| {
            let value = frame.pop();
            frame.set_local(slot, value);
            Ok(None)
        }),
        Instruction::LoadInt(n) => {
            let value = Value::Number(n as f64);
            Box::new(move |_, frame| {
                frame.push(value.clone());
                Ok(None)
            })
        }
        Instruction::GetNamed { name, slot } => {
            let cache = RefCell::new(InlineCacheState::new());
            Box::new(move |agent, frame| {
                let receiver = frame.pop();
                let value = cached_load(agent, &frame.shared, &cache, slot, &receiver, name)?;
                frame.push(value);
                Ok(None)
            })
        }
        Instruction::Binary { op: op @ (BinaryOp::Add | BinaryOp::Sub), slot } => Box::new(move |agent, frame| {
            let rhs = frame.pop();
            let lhs = frame.pop();
            let fast = match (&lhs, &rhs) {
                (Value::Number(a), Value::Number(b)) => match (as_int32(*a), as_int32(*b)) {
                    (Some(a), Some(b)) if op == BinaryOp::Add => a.checked_add(b),
                    (Some(a), Some(b)) => a.checked_sub(b),
                    _ => None,
                },
                _ => None,
            };
            let result = match fast {
                Some(result) => {
                    interpreter::record(&frame.shared, slot, Observation::Operands(OperandHint::SignedSmall));
                    Value::Number(result as f64)
                }
                None => interpreter::binary(agent, &frame.shared, slot, op, &lhs, &rhs),
            };
            frame.push(result);
            Ok(None)
        }),
        Instruction::Compare { op: CompareOp::Lt, slot } => Box::new(move |agent, frame| {
            let rhs = frame.pop();
            let lhs = frame.pop();
            let result = match (&lhs, &rhs) {
                (Value::Number(a), Value::Number(b)) => {
                    let hint = OperandHint::of_all(&[&lhs, &rhs]);
                    interpreter::record(&frame.shared, slot, Observation::Operands(hint));
                    a < b
                }
                _ => interpreter::compare(agent, &frame.shared, slot, CompareOp::Lt, &lhs, &rhs),
            };
            frame.push(Value::Boolean(result));
            Ok(None)
        }),
        other => Box::new(move |agent, frame| interpreter::step(agent, frame, other)),
    }
}

// ==================== Inline Cache ====================

/// Inline cache entry for a named load
#[derive(Debug, Clone)]
pub struct InlineCacheEntry {
    /// Receiver shape
    pub shape: ShapeId,
    /// Own data slot holding the property
    pub slot: u32,
    /// Number of hits
    pub hits: u64,
}

/// Inline cache state for a single load site
#[derive(Debug, Clone)]
pub enum InlineCacheState {
    Uninitialized,
    Monomorphic(InlineCacheEntry),
    Polymorphic(Vec<InlineCacheEntry>),
    /// Too many shapes observed; always take the generic path
    Megamorphic,
}

impl InlineCacheState {
    pub fn new() -> Self {
        Self::Uninitialized
    }

    /// Slot of the property for receivers of `shape`, if cached
    pub fn lookup(&mut self, shape: ShapeId) -> Option<u32> {
        let entry = match self {
            Self::Monomorphic(entry) if entry.shape == shape => entry,
            Self::Polymorphic(entries) => entries.iter_mut().find(|e| e.shape == shape)?,
            _ => return None,
        };
        entry.hits += 1;
        Some(entry.slot)
    }

    /// Record that receivers of `shape` keep the property at `slot`. Past
    /// `capacity` distinct shapes the site goes megamorphic.
    pub fn update(&mut self, shape: ShapeId, slot: u32, capacity: usize) {
        let entry = InlineCacheEntry { shape, slot, hits: 0 };
        match self {
            Self::Uninitialized => *self = Self::Monomorphic(entry),
            Self::Monomorphic(existing) => {
                if existing.shape != shape {
                    let old = existing.clone();
                    *self = Self::Polymorphic(vec![old, entry]);
                }
            }
            Self::Polymorphic(entries) => {
                if !entries.iter().any(|e| e.shape == shape) {
                    if entries.len() >= capacity {
                        *self = Self::Megamorphic;
                    } else {
                        entries.push(entry);
                    }
                }
            }
            Self::Megamorphic => {}
        }
    }
}

impl Default for InlineCacheState {
    fn default() -> Self {
        Self::new()
    }
}

fn cached_load(
    agent: &mut Agent,
    shared: &SharedFunctionInfo,
    cache: &RefCell<InlineCacheState>,
    slot: u32,
    receiver: &Value,
    name: Name,
) -> Completion<Value> {
    if let Value::Object(object) = receiver {
        let object = object.borrow();
        if let Some(index) = cache.borrow_mut().lookup(object.shape) {
            interpreter::record(shared, slot, Observation::Shape(Some(object.shape)));
            return Ok(object.slots.get(index as usize).cloned().unwrap_or_default());
        }
    }
    let value = interpreter::get_named(agent, shared, slot, receiver, name)?;
    if let Value::Object(object) = receiver {
        let shape = object.borrow().shape;
        if let Some((index, PropertyKind::Data)) = agent.shapes.lookup(shape, name) {
            cache.borrow_mut().update(shape, index, agent.config.polymorphism_capacity);
        }
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    #[test]
    fn test_inline_cache_transitions() {
        let mut cache = InlineCacheState::new();
        assert_eq!(cache.lookup(ShapeId(1)), None);
        cache.update(ShapeId(1), 0, 4);
        assert_eq!(cache.lookup(ShapeId(1)), Some(0));
        for shape in 2..=4 {
            cache.update(ShapeId(shape), 1, 4);
        }
        assert!(matches!(cache, InlineCacheState::Polymorphic(ref e) if e.len() == 4));
        cache.update(ShapeId(9), 2, 4);
        assert!(matches!(cache, InlineCacheState::Megamorphic));
        assert_eq!(cache.lookup(ShapeId(1)), None);
    }

    #[test]
    fn test_inline_cache_capacity_is_configurable() {
        let mut cache = InlineCacheState::new();
        for shape in 1..=2 {
            cache.update(ShapeId(shape), 0, 2);
        }
        assert!(matches!(cache, InlineCacheState::Polymorphic(ref e) if e.len() == 2));
        cache.update(ShapeId(3), 0, 2);
        assert!(matches!(cache, InlineCacheState::Megamorphic));

        let mut wide = InlineCacheState::new();
        for shape in 1..=6 {
            wide.update(ShapeId(shape), 0, 6);
        }
        assert!(matches!(wide, InlineCacheState::Polymorphic(ref e) if e.len() == 6));
        assert_eq!(wide.lookup(ShapeId(6)), Some(0));
    }

    #[test]
    fn test_baseline_loads_past_a_narrow_cache() {
        let config = crate::config::EngineConfig {
            polymorphism_capacity: 2,
            ..crate::config::EngineConfig::default()
        };
        let mut runtime = Runtime::with_config(config);
        runtime.eval("function getX(o) { return o.x; } %CompileBaseline(getX);").unwrap();
        let result = runtime
            .eval("getX({x: 1}) + getX({a: 0, x: 2}) + getX({b: 0, x: 3}) + getX({x: 4})")
            .unwrap();
        assert_eq!(result, Value::Number(10.0));
        assert_eq!(runtime.tier_of("getX"), Some("baseline"));
    }

    #[test]
    fn test_baseline_matches_interpreter() {
        let source = "function mix(o, n) { var s = 0; for (var i = 0; i < n; i++) { s = s + o.x - i; } return s < 0 ? -s : s + ''; }";
        let mut interpreted = Runtime::with_config(crate::config::EngineConfig::interpreter_only());
        interpreted.eval(source).unwrap();
        let mut baseline = Runtime::new();
        baseline.eval(source).unwrap();
        baseline.eval("%CompileBaseline(mix);").unwrap();
        assert_eq!(baseline.tier_of("mix"), Some("baseline"));
        for call in ["mix({x: 3}, 10)", "mix({y: 1, x: 2.5}, 4)", "mix({x: 2147483647}, 3)"] {
            assert_eq!(interpreted.eval(call).unwrap(), baseline.eval(call).unwrap(), "{}", call);
        }
    }

    #[test]
    fn test_debugging_forces_interpreter_at_next_statement() {
        let mut runtime = Runtime::new();
        runtime.eval("function f() { var a = 1; var b = 2; return a + b; }").unwrap();
        runtime.eval("%CompileBaseline(f);").unwrap();
        runtime.enter_debugging_mode(crate::debugger::ExecutionRecorder::new());
        assert_eq!(runtime.eval("f()").unwrap(), Value::Number(3.0));
        assert_eq!(runtime.tier_of("f"), Some("interpreted"));
    }
}
