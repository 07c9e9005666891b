//! Bytecode interpreter
//!
//! The lowest tier. Every instruction with a feedback slot records what it
//! observed before performing the generic operation, so the optimizing
//! compiler can later speculate on it. The helpers that do this are
//! shared with the baseline tier, which keeps recording feedback while it
//! runs.
//!
//! A frame can leave the interpreter for baseline code at a loop back-edge
//! (on-stack replacement) and come back at any statement boundary, since
//! both tiers use the same [`Frame`] layout.

mod frame;

pub use frame::{Frame, Handler};

use crate::baseline;
use crate::bytecode::{BinaryOp, CompareOp, Instruction};
use crate::debugger;
use crate::error::Error;
use crate::feedback::{ElementHint, Observation, OperandHint};
use crate::runtime::{
    array_index, intrinsics, Abrupt, Activation, Agent, Completion, FrameKind, FunctionId, Name, ShapeId,
    SharedFunctionInfo, UnaryOp, Value,
};
use crate::tiering;
use std::rc::Rc;

/// How a frame left its code
#[derive(Debug, Clone, PartialEq)]
pub enum FrameExit {
    Return(Value),
    /// A generator suspended with this value
    Yield(Value),
}

/// Result of running a frame in one tier
#[derive(Debug)]
pub(crate) enum Exit {
    Done(FrameExit),
    /// Continue the same frame in another tier
    Switch(FrameKind),
}

/// Run a fresh (non-generator) frame to completion.
///
/// The caller owns the frame's [`Activation`].
pub fn run_frame(agent: &mut Agent, mut frame: Frame, kind: FrameKind) -> Completion<Value> {
    let mut kind = kind;
    match execute(agent, &mut frame, &mut kind)? {
        FrameExit::Return(value) => Ok(construct_result(frame.construct, &frame.this, value)),
        FrameExit::Yield(_) => Err(Abrupt::Fatal(Error::internal("yield outside of a generator"))),
    }
}

/// A constructor returning a non-object yields its receiver
pub(crate) fn construct_result(construct: bool, this: &Value, value: Value) -> Value {
    if construct && !matches!(value, Value::Object(_)) {
        this.clone()
    } else {
        value
    }
}

/// Run a frame in the interpreter or baseline tier, switching between them
/// as needed and dispatching exceptions to the frame's handlers.
pub fn execute(agent: &mut Agent, frame: &mut Frame, kind: &mut FrameKind) -> Completion<FrameExit> {
    loop {
        let result = match *kind {
            FrameKind::Baseline => match frame.shared.baseline_code() {
                Some(code) if !agent.debugging() => baseline::run(agent, frame, &code),
                _ => Ok(Exit::Switch(FrameKind::Interpreted)),
            },
            _ => interpret(agent, frame),
        };
        match result {
            Ok(Exit::Done(exit)) => return Ok(exit),
            Ok(Exit::Switch(next)) => {
                tracing::trace!(
                    function = %frame.shared.name,
                    offset = frame.pc,
                    from = kind.tier_name(),
                    to = next.tier_name(),
                    "frame switched tiers"
                );
                *kind = next;
                agent.set_current_frame_kind(next);
            }
            Err(Abrupt::Throw(exception)) => {
                if frame.handlers.is_empty() {
                    return Err(Abrupt::Throw(exception));
                }
                frame.unwind(exception);
            }
            Err(fatal) => return Err(fatal),
        }
    }
}

fn interpret(agent: &mut Agent, frame: &mut Frame) -> Completion<Exit> {
    let chunk = frame.shared.chunk.clone();
    loop {
        let pc = frame.pc;
        let Some(&instruction) = chunk.code.get(pc) else {
            return Ok(Exit::Done(FrameExit::Return(Value::Undefined)));
        };
        if agent.debugging() && chunk.is_statement_start(pc) {
            debugger::notify_statement(agent, frame);
        }
        frame.pc = pc + 1;
        if let Some(exit) = step(agent, frame, instruction)? {
            return Ok(exit);
        }
    }
}

/// Execute one instruction whose offset the caller has already stepped past
pub(crate) fn step(agent: &mut Agent, frame: &mut Frame, instruction: Instruction) -> Completion<Option<Exit>> {
    match instruction {
        Instruction::Pop => {
            frame.pop();
        }
        Instruction::Dup => {
            let top = frame.peek(0);
            frame.push(top);
        }
        Instruction::Dup2 => {
            let (a, b) = (frame.peek(1), frame.peek(0));
            frame.push(a);
            frame.push(b);
        }

        Instruction::LoadUndefined => frame.push(Value::Undefined),
        Instruction::LoadNull => frame.push(Value::Null),
        Instruction::LoadTrue => frame.push(Value::Boolean(true)),
        Instruction::LoadFalse => frame.push(Value::Boolean(false)),
        Instruction::LoadInt(n) => frame.push(Value::Number(n as f64)),
        Instruction::LoadConst(index) => {
            let constant = frame.shared.constants.get(index as usize).cloned().unwrap_or_default();
            frame.push(constant);
        }
        Instruction::LoadThis => {
            let this = frame.this.clone();
            frame.push(this);
        }

        Instruction::GetLocal(slot) => {
            let value = frame.local(slot);
            frame.push(value);
        }
        Instruction::SetLocal(slot) => {
            let value = frame.pop();
            frame.set_local(slot, value);
        }
        Instruction::GetGlobal(name) => {
            let value = get_global(agent, name)?;
            frame.push(value);
        }
        Instruction::SetGlobal(name) => {
            let value = frame.pop();
            agent.globals.store(name, value);
        }

        Instruction::GetNamed { name, slot } => {
            let receiver = frame.pop();
            let value = get_named(agent, &frame.shared, slot, &receiver, name)?;
            frame.push(value);
        }
        Instruction::SetNamed { name, slot } => {
            let value = frame.pop();
            let target = frame.pop();
            set_named(agent, &frame.shared, slot, &target, name, value.clone())?;
            frame.push(value);
        }
        Instruction::GetKeyed { slot } => {
            let key = frame.pop();
            let receiver = frame.pop();
            let value = get_keyed(agent, &frame.shared, slot, &receiver, &key)?;
            frame.push(value);
        }
        Instruction::SetKeyed { slot } => {
            let value = frame.pop();
            let key = frame.pop();
            let target = frame.pop();
            set_keyed(agent, &frame.shared, slot, &target, &key, value.clone())?;
            frame.push(value);
        }

        Instruction::CreateObject => {
            let object = agent.create_plain_object();
            frame.push(Value::Object(object));
        }
        Instruction::DefineField(name) => {
            let value = frame.pop();
            if let Value::Object(object) = frame.peek(0) {
                agent.define_own_property(&object, name, value);
            }
        }
        Instruction::DefineGetter(name) => {
            let getter = frame.pop();
            if let Value::Object(object) = frame.peek(0) {
                agent.define_getter(&object, name, getter);
            }
        }
        Instruction::CreateArray(count) => {
            let elements = frame.pop_n(count as usize);
            let array = agent.create_array(elements);
            frame.push(Value::Object(array));
        }
        Instruction::MakeClosure(index) => {
            let closure = make_closure(agent, &frame.shared, index)?;
            frame.push(closure);
        }
        Instruction::GetTemplateObject(site) => {
            let strings = template_object(agent, &frame.shared, site);
            frame.push(strings);
        }

        Instruction::Binary { op, slot } => {
            let rhs = frame.pop();
            let lhs = frame.pop();
            let result = binary(agent, &frame.shared, slot, op, &lhs, &rhs);
            frame.push(result);
        }
        Instruction::Compare { op, slot } => {
            let rhs = frame.pop();
            let lhs = frame.pop();
            let result = compare(agent, &frame.shared, slot, op, &lhs, &rhs);
            frame.push(Value::Boolean(result));
        }
        Instruction::Negate { slot } => unary_step(agent, frame, UnaryOp::Negate, slot),
        Instruction::BitNot { slot } => unary_step(agent, frame, UnaryOp::BitNot, slot),
        Instruction::ToNumeric { slot } => unary_step(agent, frame, UnaryOp::ToNumeric, slot),
        Instruction::Increment { slot } => unary_step(agent, frame, UnaryOp::Increment, slot),
        Instruction::Decrement { slot } => unary_step(agent, frame, UnaryOp::Decrement, slot),
        Instruction::Not => {
            let value = frame.pop();
            frame.push(Value::Boolean(!value.to_boolean()));
        }
        Instruction::TypeOf => {
            let value = frame.pop();
            frame.push(agent.type_of(&value));
        }

        Instruction::Jump(target) => frame.pc = target as usize,
        Instruction::JumpIfFalse(target) => {
            if !frame.pop().to_boolean() {
                frame.pc = target as usize;
            }
        }
        Instruction::JumpIfTrue(target) => {
            if frame.pop().to_boolean() {
                frame.pc = target as usize;
            }
        }
        Instruction::JumpIfFalseOrPop(target) => {
            if frame.peek(0).to_boolean() {
                frame.pop();
            } else {
                frame.pc = target as usize;
            }
        }
        Instruction::JumpIfTrueOrPop(target) => {
            if frame.peek(0).to_boolean() {
                frame.pc = target as usize;
            } else {
                frame.pop();
            }
        }
        Instruction::Loop(target) => {
            frame.pc = target as usize;
            if tiering::on_back_edge(agent, frame.function) && agent.current_frame_kind() == FrameKind::Interpreted {
                tracing::debug!(function = %frame.shared.name, offset = target, "on-stack replacement into baseline");
                return Ok(Some(Exit::Switch(FrameKind::Baseline)));
            }
        }

        Instruction::Call { argc, slot } => {
            let args = frame.pop_n(argc as usize);
            let callee = frame.pop();
            let this = frame.pop();
            let result = call(agent, &frame.shared, slot, &callee, this, &args)?;
            frame.push(result);
        }
        Instruction::New { argc, slot } => {
            let args = frame.pop_n(argc as usize);
            let callee = frame.pop();
            let result = construct(agent, &frame.shared, slot, &callee, &args)?;
            frame.push(result);
        }
        Instruction::CallIntrinsic { intrinsic, argc } => {
            let args = frame.pop_n(argc as usize);
            let result = intrinsics::call(agent, intrinsic, &args)?;
            frame.push(result);
        }
        Instruction::Return => {
            let value = frame.pop();
            return Ok(Some(Exit::Done(FrameExit::Return(value))));
        }

        Instruction::Throw => {
            let exception = frame.pop();
            return Err(Abrupt::Throw(exception));
        }
        Instruction::PushHandler(target) => {
            let stack_depth = frame.stack.len();
            frame.handlers.push(Handler { target, stack_depth });
        }
        Instruction::PopHandler => {
            frame.handlers.pop();
        }

        Instruction::Yield => {
            let value = frame.pop();
            return Ok(Some(Exit::Done(FrameExit::Yield(value))));
        }
        Instruction::Debugger => {
            if agent.debugging() {
                debugger::notify_debugger_statement(agent, frame);
            }
        }
    }
    Ok(None)
}

fn unary_step(agent: &mut Agent, frame: &mut Frame, op: UnaryOp, slot: u32) {
    let operand = frame.pop();
    let result = unary(agent, &frame.shared, slot, op, &operand);
    frame.push(result);
}

/// Resume the frames produced by a deoptimization, innermost first.
///
/// The outermost frame belongs to the activation the caller already
/// pushed; each inner frame gets its own activation. A frame's result is
/// pushed onto the operand stack of the frame that called it.
pub fn resume_frames(agent: &mut Agent, frames: Vec<Frame>) -> Completion<Value> {
    let count = frames.len();
    agent.set_current_frame_kind(FrameKind::Interpreted);
    for frame in frames.iter().rev().skip(1) {
        agent.activations.push(Activation::new(frame.function, FrameKind::Interpreted));
    }

    let mut pending: Option<Completion<Value>> = None;
    for (index, mut frame) in frames.into_iter().enumerate() {
        let outermost = index + 1 == count;
        match pending.take() {
            Some(Ok(value)) => frame.push(value),
            Some(Err(Abrupt::Throw(exception))) if !frame.handlers.is_empty() => {
                frame.unwind(exception);
            }
            Some(Err(abrupt)) => {
                if !outermost {
                    agent.activations.pop();
                }
                pending = Some(Err(abrupt));
                continue;
            }
            None => {}
        }
        let result = run_frame(agent, frame, FrameKind::Interpreted);
        if !outermost {
            agent.activations.pop();
        }
        pending = Some(result);
    }
    pending.unwrap_or(Ok(Value::Undefined))
}

// ==================== Feedback-Recording Operations ====================

pub(crate) fn record(shared: &SharedFunctionInfo, slot: u32, observation: Observation) {
    shared.feedback.borrow_mut().record(slot, observation);
}

/// Shape of an object receiver; `None` for primitives
pub(crate) fn receiver_shape(value: &Value) -> Option<ShapeId> {
    match value {
        Value::Object(object) => Some(object.borrow().shape),
        _ => None,
    }
}

fn element_hint(receiver: &Value, key: &Value) -> ElementHint {
    let (Value::Object(object), Value::Number(_)) = (receiver, key) else {
        return ElementHint::Any;
    };
    match (object.borrow().elements(), array_index(key)) {
        (Some(elements), Some(index)) if index < elements.len() && key.is_int32() => ElementHint::ArrayInt32Index,
        _ => ElementHint::Any,
    }
}

pub(crate) fn get_global(agent: &mut Agent, name: Name) -> Completion<Value> {
    match agent.globals.get(name) {
        Some(value) => Ok(value.clone()),
        None => {
            let message = format!("{} is not defined", agent.interner.resolve(name));
            Err(agent.reference_error(message))
        }
    }
}

pub(crate) fn get_named(
    agent: &mut Agent,
    shared: &SharedFunctionInfo,
    slot: u32,
    receiver: &Value,
    name: Name,
) -> Completion<Value> {
    record(shared, slot, Observation::Shape(receiver_shape(receiver)));
    agent.get_property(receiver, name)
}

pub(crate) fn set_named(
    agent: &mut Agent,
    shared: &SharedFunctionInfo,
    slot: u32,
    target: &Value,
    name: Name,
    value: Value,
) -> Completion<()> {
    record(shared, slot, Observation::Shape(receiver_shape(target)));
    agent.set_property(target, name, value)
}

pub(crate) fn get_keyed(
    agent: &mut Agent,
    shared: &SharedFunctionInfo,
    slot: u32,
    receiver: &Value,
    key: &Value,
) -> Completion<Value> {
    record(shared, slot, Observation::Shape(receiver_shape(receiver)));
    record(shared, slot, Observation::Element(element_hint(receiver, key)));
    agent.get_keyed(receiver, key)
}

pub(crate) fn set_keyed(
    agent: &mut Agent,
    shared: &SharedFunctionInfo,
    slot: u32,
    target: &Value,
    key: &Value,
    value: Value,
) -> Completion<()> {
    record(shared, slot, Observation::Shape(receiver_shape(target)));
    record(shared, slot, Observation::Element(element_hint(target, key)));
    agent.set_keyed(target, key, value)
}

pub(crate) fn binary(
    agent: &Agent,
    shared: &SharedFunctionInfo,
    slot: u32,
    op: BinaryOp,
    lhs: &Value,
    rhs: &Value,
) -> Value {
    let result = agent.binary(op, lhs, rhs);
    record(shared, slot, Observation::Operands(OperandHint::of_all(&[lhs, rhs, &result])));
    result
}

pub(crate) fn compare(
    agent: &Agent,
    shared: &SharedFunctionInfo,
    slot: u32,
    op: CompareOp,
    lhs: &Value,
    rhs: &Value,
) -> bool {
    record(shared, slot, Observation::Operands(OperandHint::of_all(&[lhs, rhs])));
    agent.compare(op, lhs, rhs)
}

pub(crate) fn unary(agent: &Agent, shared: &SharedFunctionInfo, slot: u32, op: UnaryOp, operand: &Value) -> Value {
    let result = agent.unary(op, operand);
    record(shared, slot, Observation::Operands(OperandHint::of_all(&[operand, &result])));
    result
}

/// Script function target of a call, if any
fn call_target(callee: &Value) -> Option<FunctionId> {
    match callee {
        Value::Object(object) => object.borrow().function_id(),
        _ => None,
    }
}

pub(crate) fn call(
    agent: &mut Agent,
    shared: &SharedFunctionInfo,
    slot: u32,
    callee: &Value,
    this: Value,
    args: &[Value],
) -> Completion<Value> {
    record(shared, slot, Observation::CallTarget(call_target(callee)));
    agent.call(callee, this, args)
}

pub(crate) fn construct(
    agent: &mut Agent,
    shared: &SharedFunctionInfo,
    slot: u32,
    callee: &Value,
    args: &[Value],
) -> Completion<Value> {
    record(shared, slot, Observation::CallTarget(call_target(callee)));
    agent.construct(callee, args)
}

pub(crate) fn make_closure(agent: &mut Agent, shared: &SharedFunctionInfo, index: u32) -> Completion<Value> {
    match shared.children.get(index as usize) {
        Some(child) => Ok(Value::Object(agent.create_closure(Rc::clone(child)))),
        None => Err(Abrupt::Fatal(Error::internal(format!(
            "function literal #{} missing from {}",
            index, shared.name
        )))),
    }
}

/// The memoized strings array of a tagged template site
pub(crate) fn template_object(agent: &mut Agent, shared: &SharedFunctionInfo, site: u32) -> Value {
    if let Some(strings) = agent.templates.get(shared.id, site) {
        return Value::Object(strings);
    }
    let Some(template) = shared.chunk.template_sites.get(site as usize) else {
        return Value::Undefined;
    };
    let cooked = template.cooked.iter().map(|s| Value::string(s)).collect();
    let raw = template.raw.iter().map(|s| Value::string(s)).collect();
    let strings = agent.create_array(cooked);
    let raw = agent.create_array(raw);
    let raw_name = agent.interner.names.raw;
    agent.define_own_property(&strings, raw_name, Value::Object(raw));
    agent.templates.insert(shared.id, site, strings.clone());
    Value::Object(strings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::feedback::{CallFeedback, ShapeObservation};
    use crate::runtime::Runtime;

    fn interpreted() -> Runtime {
        Runtime::with_config(EngineConfig::interpreter_only())
    }

    fn function_shared(runtime: &Runtime, name: &str) -> Rc<SharedFunctionInfo> {
        let value = runtime.get_global(name).unwrap();
        let id = value.as_object().unwrap().borrow().function_id().unwrap();
        runtime.agent().functions.get(id).unwrap().shared.clone()
    }

    #[test]
    fn test_arithmetic_feedback_widens() {
        let mut runtime = interpreted();
        runtime
            .eval("function add(a, b) { return a + b; } add(1, 2); add(1.5, 2);")
            .unwrap();
        let shared = function_shared(&runtime, "add");
        let feedback = shared.feedback.borrow();
        let hint = (0..feedback.len() as u32)
            .filter_map(|slot| feedback.slot(slot))
            .map(|slot| slot.operands())
            .max()
            .unwrap();
        assert_eq!(hint, OperandHint::Number);
    }

    #[test]
    fn test_property_feedback_tracks_shapes() {
        let mut runtime = interpreted();
        runtime
            .eval("function getX(o) { return o.x; } getX({x: 1}); getX({x: 2}); getX({y: 0, x: 3});")
            .unwrap();
        let shared = function_shared(&runtime, "getX");
        let feedback = shared.feedback.borrow();
        let shapes = feedback.slot(0).and_then(|slot| slot.shapes()).cloned().unwrap();
        assert!(matches!(shapes, ShapeObservation::Polymorphic(ref s) if s.len() == 2));
    }

    #[test]
    fn test_call_feedback_records_script_targets() {
        let mut runtime = interpreted();
        runtime
            .eval("function id(x) { return x; } function f() { return id(1); } f(); f();")
            .unwrap();
        let shared = function_shared(&runtime, "f");
        let call = shared.feedback.borrow().slot(0).map(|slot| slot.call()).unwrap();
        assert!(matches!(call, CallFeedback::Monomorphic(_)));
    }

    #[test]
    fn test_handler_catches_thrown_value() {
        let mut runtime = interpreted();
        let result = runtime
            .eval("var r; try { throw 5; } catch (e) { r = e + 1; } r")
            .unwrap();
        assert_eq!(result, Value::Number(6.0));
    }

    #[test]
    fn test_constructor_result_rule() {
        let mut runtime = interpreted();
        let result = runtime
            .eval("function P(x) { this.x = x; return 3; } new P(4).x")
            .unwrap();
        assert_eq!(result, Value::Number(4.0));
    }

    #[test]
    fn test_osr_switches_hot_loop_to_baseline() {
        let mut runtime = Runtime::new();
        runtime
            .eval("function spin() { var s = 0; for (var i = 0; i < 2000; i++) { s = s + i; } return s; } spin();")
            .unwrap();
        assert_eq!(runtime.tier_of("spin"), Some("baseline"));
    }
}
