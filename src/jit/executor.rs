//! Graph executor for installed optimized code
//!
//! Runs a scheduled graph block by block over a register file indexed by
//! node id. Unboxed representations stay unboxed in their registers;
//! guards that fail hand the register file back as a [`ControlTransfer`]
//! naming the node's eager deopt point. After every effectful node the
//! executor polls a safepoint: if the code was invalidated or the
//! activation was asked to leave, it transfers at the node's lazy point.

use super::ir::{BlockId, ConstantValue, DeoptId, Graph, NodeId, Op, PropertyAccess, Repr, Terminator};
use super::passes::{compare_numbers, fold_unary};
use super::InstalledCode;
use crate::bytecode::BinaryOp;
use crate::deopt::{ControlTransfer, DeoptReason};
use crate::error::Error;
use crate::interpreter::{self, construct_result};
use crate::runtime::{
    arithmetic, as_int32, intrinsics, to_int32, Abrupt, Agent, Completion, Object, ObjectKind, UnaryOp, Value,
};
use std::cell::RefCell;
use std::rc::Rc;

/// Contents of one register
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RegValue {
    #[default]
    Empty,
    Int32(i32),
    Float64(f64),
    Bool(bool),
    Tagged(Value),
}

impl RegValue {
    /// Box the register for the interpreter
    pub fn to_value(&self) -> Value {
        match self {
            RegValue::Empty => Value::Undefined,
            RegValue::Int32(i) => Value::Number(*i as f64),
            RegValue::Float64(n) => Value::Number(*n),
            RegValue::Bool(b) => Value::Boolean(*b),
            RegValue::Tagged(value) => value.clone(),
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            RegValue::Int32(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RegValue::Float64(n) => Some(*n),
            RegValue::Int32(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RegValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    fn truthy(&self) -> bool {
        match self {
            RegValue::Empty => false,
            RegValue::Int32(i) => *i != 0,
            RegValue::Float64(n) => *n != 0.0 && !n.is_nan(),
            RegValue::Bool(b) => *b,
            RegValue::Tagged(value) => value.to_boolean(),
        }
    }
}

/// How a run of optimized code ended
#[derive(Debug)]
pub enum Outcome {
    Returned(Value),
    Transfer(ControlTransfer),
}

/// Result of one node: its output, or a failed guard
enum Step {
    Value(RegValue),
    Nothing,
    Deopt(DeoptReason),
}

fn corrupt(what: &str) -> Abrupt {
    Abrupt::Fatal(Error::internal(format!("optimized code: {}", what)))
}

struct Executor<'a> {
    code: &'a InstalledCode,
    graph: &'a Graph,
    registers: Vec<RegValue>,
    this: Value,
    args: &'a [Value],
}

/// Run `code` for one invocation. The caller owns the activation.
pub fn run(agent: &mut Agent, code: &Rc<InstalledCode>, this: Value, args: &[Value]) -> Completion<Outcome> {
    let graph = &code.graph.graph;
    let mut executor = Executor {
        code,
        graph,
        registers: vec![RegValue::Empty; graph.nodes.len()],
        this,
        args,
    };
    executor.execute(agent)
}

impl Executor<'_> {
    fn execute(&mut self, agent: &mut Agent) -> Completion<Outcome> {
        let graph = self.graph;
        let mut block = graph.entry;
        let mut pred: Option<BlockId> = None;
        loop {
            let current = graph.block(block);
            if let Some(pred) = pred {
                let edge = current
                    .preds
                    .iter()
                    .position(|&p| p == pred)
                    .ok_or_else(|| corrupt("edge without predecessor"))?;
                // parallel copy
                let values: Vec<RegValue> = current
                    .phis
                    .iter()
                    .map(|&phi| {
                        graph
                            .node(phi)
                            .inputs
                            .get(edge)
                            .map(|input| self.registers[input.index()].clone())
                            .unwrap_or_default()
                    })
                    .collect();
                for (&phi, value) in current.phis.iter().zip(values) {
                    self.registers[phi.index()] = value;
                }
            }

            for &node in &current.nodes {
                match self.step(agent, node)? {
                    Step::Value(value) => self.registers[node.index()] = value,
                    Step::Nothing => {}
                    Step::Deopt(reason) => {
                        let point = graph.node(node).eager.ok_or_else(|| corrupt("guard without deopt point"))?;
                        return Ok(self.transfer(point, reason, false));
                    }
                }
                if let Some(point) = graph.node(node).lazy {
                    if let Some(reason) = self.safepoint(agent) {
                        return Ok(self.transfer(point, reason, true));
                    }
                }
            }

            match &current.terminator {
                Terminator::Goto(target) => {
                    pred = Some(block);
                    block = *target;
                }
                Terminator::Branch { cond, if_true, if_false } => {
                    let taken = self.registers[cond.index()].truthy();
                    pred = Some(block);
                    block = if taken { *if_true } else { *if_false };
                }
                Terminator::Return(value) => return Ok(Outcome::Returned(self.registers[value.index()].to_value())),
                Terminator::Throw(value) => return Err(Abrupt::Throw(self.registers[value.index()].to_value())),
                Terminator::Deopt { point, reason } => return Ok(self.transfer(*point, *reason, false)),
                Terminator::Unreachable => return Err(corrupt("reached an unreachable block")),
            }
        }
    }

    /// Reason to leave at a safepoint, if any
    fn safepoint(&self, agent: &Agent) -> Option<DeoptReason> {
        if !self.code.is_valid() {
            return Some(self.code.validity.reason().unwrap_or(DeoptReason::DependencyInvalidated));
        }
        agent.activations.last().and_then(|activation| activation.deopt_requested)
    }

    fn transfer(&mut self, point: DeoptId, reason: DeoptReason, lazy: bool) -> Outcome {
        Outcome::Transfer(ControlTransfer::Deoptimize {
            point,
            reason,
            lazy,
            registers: std::mem::take(&mut self.registers),
        })
    }

    // ========== Register Access ==========

    fn input(&self, node: NodeId, index: usize) -> Completion<&RegValue> {
        let input = self
            .graph
            .node(node)
            .inputs
            .get(index)
            .ok_or_else(|| corrupt("missing input"))?;
        Ok(&self.registers[input.index()])
    }

    fn value(&self, node: NodeId, index: usize) -> Completion<Value> {
        Ok(self.input(node, index)?.to_value())
    }

    fn int32(&self, node: NodeId, index: usize) -> Completion<i32> {
        self.input(node, index)?.as_i32().ok_or_else(|| corrupt("expected an int32 register"))
    }

    fn float64(&self, node: NodeId, index: usize) -> Completion<f64> {
        self.input(node, index)?.as_f64().ok_or_else(|| corrupt("expected a float64 register"))
    }

    fn values_from(&self, node: NodeId, start: usize) -> Vec<Value> {
        self.graph.node(node).inputs[start..]
            .iter()
            .map(|input| self.registers[input.index()].to_value())
            .collect()
    }

    fn constant(&self, value: &ConstantValue, repr: Repr) -> RegValue {
        match (value, repr) {
            (ConstantValue::Number(n), Repr::Int32) => RegValue::Int32(*n as i32),
            (ConstantValue::Number(n), Repr::Float64) => RegValue::Float64(*n),
            (ConstantValue::Boolean(b), Repr::Bool) => RegValue::Bool(*b),
            (value, _) => RegValue::Tagged(self.tagged_constant(value)),
        }
    }

    fn tagged_constant(&self, value: &ConstantValue) -> Value {
        match value {
            ConstantValue::Undefined => Value::Undefined,
            ConstantValue::Null => Value::Null,
            ConstantValue::Boolean(b) => Value::Boolean(*b),
            ConstantValue::Number(n) => Value::Number(*n),
            ConstantValue::String(s) => Value::string(s),
            ConstantValue::Heap(index) => self.code.link.heap.get(*index as usize).cloned().unwrap_or_default(),
        }
    }

    // ========== Nodes ==========

    fn step(&mut self, agent: &mut Agent, node: NodeId) -> Completion<Step> {
        let graph = self.graph;
        let n = graph.node(node);
        let step = match &n.op {
            Op::Parameter(index) => Step::Value(RegValue::Tagged(
                self.args.get(*index as usize).cloned().unwrap_or_default(),
            )),
            Op::This => Step::Value(RegValue::Tagged(self.this.clone())),
            Op::Constant(value) => Step::Value(self.constant(value, n.repr)),
            Op::Phi => Step::Nothing,

            Op::Int32Binary(op) => int32_binary(*op, self.int32(node, 0)?, self.int32(node, 1)?),
            Op::Float64Binary(op) => Step::Value(RegValue::Float64(arithmetic(
                *op,
                self.float64(node, 0)?,
                self.float64(node, 1)?,
            ))),
            Op::TaggedBinary(op) => Step::Value(RegValue::Tagged(agent.binary(
                *op,
                &self.value(node, 0)?,
                &self.value(node, 1)?,
            ))),
            Op::Int32Compare(op) => {
                let (a, b) = (self.int32(node, 0)?, self.int32(node, 1)?);
                Step::Value(RegValue::Bool(compare_numbers(*op, a as f64, b as f64)))
            }
            Op::Float64Compare(op) => Step::Value(RegValue::Bool(compare_numbers(
                *op,
                self.float64(node, 0)?,
                self.float64(node, 1)?,
            ))),
            Op::TaggedCompare(op) => Step::Value(RegValue::Bool(agent.compare(
                *op,
                &self.value(node, 0)?,
                &self.value(node, 1)?,
            ))),
            Op::Int32Unary(op) => int32_unary(*op, self.int32(node, 0)?),
            Op::Float64Unary(op) => Step::Value(RegValue::Float64(fold_unary(*op, self.float64(node, 0)?))),
            Op::TaggedUnary(op) => Step::Value(RegValue::Tagged(agent.unary(*op, &self.value(node, 0)?))),
            Op::LogicalNot => Step::Value(RegValue::Bool(!self.input(node, 0)?.truthy())),
            Op::TypeOf => Step::Value(RegValue::Tagged(agent.type_of(&self.value(node, 0)?))),
            Op::ToBoolean => Step::Value(RegValue::Bool(self.input(node, 0)?.truthy())),

            Op::CheckShape(shapes) => match self.value(node, 0)? {
                Value::Object(object) if shapes.contains(&object.borrow().shape) => Step::Nothing,
                _ => Step::Deopt(DeoptReason::WrongShape),
            },
            Op::CheckFunction(id) => match self.value(node, 0)? {
                Value::Object(object) if object.borrow().function_id() == Some(*id) => Step::Nothing,
                _ => Step::Deopt(DeoptReason::WrongCallTarget),
            },
            Op::CheckArray => match self.value(node, 0)? {
                Value::Object(object) if object.borrow().is_array() => Step::Nothing,
                _ => Step::Deopt(DeoptReason::NotAnArray),
            },
            Op::CheckBounds => {
                let index = self.int32(node, 0)?;
                let length = match self.value(node, 1)? {
                    Value::Object(object) => object.borrow().elements().map_or(0, Vec::len),
                    _ => 0,
                };
                if index >= 0 && (index as usize) < length {
                    Step::Nothing
                } else {
                    Step::Deopt(DeoptReason::OutOfBounds)
                }
            }
            Op::CheckedTaggedToInt32 => match self.value(node, 0)? {
                Value::Number(n) => match as_int32(n) {
                    Some(i) => Step::Value(RegValue::Int32(i)),
                    None if n == 0.0 => Step::Deopt(DeoptReason::MinusZero),
                    None => Step::Deopt(DeoptReason::NotInt32),
                },
                _ => Step::Deopt(DeoptReason::NotANumber),
            },
            Op::CheckedTaggedToFloat64 => match self.value(node, 0)? {
                Value::Number(n) => Step::Value(RegValue::Float64(n)),
                _ => Step::Deopt(DeoptReason::NotANumber),
            },
            Op::CheckedFloat64ToInt32 => {
                let n = self.float64(node, 0)?;
                match as_int32(n) {
                    Some(i) => Step::Value(RegValue::Int32(i)),
                    None if n == 0.0 => Step::Deopt(DeoptReason::MinusZero),
                    None => Step::Deopt(DeoptReason::LostPrecision),
                }
            }
            Op::TruncateToInt32 => Step::Value(RegValue::Int32(to_int32(self.float64(node, 0)?))),
            Op::ChangeInt32ToFloat64 => Step::Value(RegValue::Float64(self.int32(node, 0)? as f64)),
            Op::ChangeInt32ToTagged | Op::ChangeFloat64ToTagged | Op::ChangeBoolToTagged => {
                Step::Value(RegValue::Tagged(self.value(node, 0)?))
            }

            Op::LoadField(slot) => {
                let Value::Object(object) = self.value(node, 0)? else {
                    return Err(corrupt("field load from a primitive"));
                };
                let value = object.borrow().slots.get(*slot as usize).cloned();
                Step::Value(RegValue::Tagged(value.ok_or_else(|| corrupt("field slot out of range"))?))
            }
            Op::PolymorphicLoad(cases) => {
                let Value::Object(object) = self.value(node, 0)? else {
                    return Ok(Step::Deopt(DeoptReason::WrongShape));
                };
                let shape = object.borrow().shape;
                match cases.iter().find(|(case, _)| *case == shape) {
                    Some((_, access)) => {
                        let value = match access {
                            PropertyAccess::Field(slot) => {
                                object.borrow().slots.get(*slot as usize).cloned().unwrap_or_default()
                            }
                            PropertyAccess::Constant(value) => self.tagged_constant(value),
                            PropertyAccess::ArrayLength => {
                                Value::Number(object.borrow().elements().map_or(0, Vec::len) as f64)
                            }
                            PropertyAccess::Undefined => Value::Undefined,
                        };
                        Step::Value(RegValue::Tagged(value))
                    }
                    None => Step::Deopt(DeoptReason::WrongShape),
                }
            }
            Op::ArrayLength => {
                let length = match self.value(node, 0)? {
                    Value::Object(object) => object.borrow().elements().map_or(0, Vec::len),
                    _ => 0,
                };
                match i32::try_from(length) {
                    Ok(length) => Step::Value(RegValue::Int32(length)),
                    Err(_) => Step::Deopt(DeoptReason::Overflow),
                }
            }
            Op::LoadElement => {
                let index = self.int32(node, 1)? as usize;
                let value = match self.value(node, 0)? {
                    Value::Object(object) => object
                        .borrow()
                        .elements()
                        .and_then(|elements| elements.get(index).cloned())
                        .unwrap_or_default(),
                    _ => Value::Undefined,
                };
                Step::Value(RegValue::Tagged(value))
            }
            Op::StoreElement => {
                let target = self.value(node, 0)?;
                let index = self.int32(node, 1)?;
                let value = self.value(node, 2)?;
                let stored = match &target {
                    Value::Object(object) => match object.borrow_mut().elements_mut() {
                        Some(elements) if (index as usize) < elements.len() => {
                            elements[index as usize] = value.clone();
                            true
                        }
                        _ => false,
                    },
                    _ => false,
                };
                if !stored {
                    agent.set_keyed(&target, &Value::Number(index as f64), value)?;
                }
                Step::Nothing
            }
            Op::StoreField { slot, transition } => {
                let Value::Object(object) = self.value(node, 0)? else {
                    return Err(corrupt("field store to a primitive"));
                };
                let value = self.value(node, 1)?;
                let mut object = object.borrow_mut();
                match transition {
                    Some(shape) if *slot as usize == object.slots.len() => object.add_slot(*shape, value),
                    None if (*slot as usize) < object.slots.len() => object.store_slot(*slot, value),
                    _ => return Err(corrupt("field store does not match the object layout")),
                }
                Step::Nothing
            }
            Op::LoadGlobal(name) => Step::Value(RegValue::Tagged(interpreter::get_global(agent, *name)?)),
            Op::StoreGlobal(name) => {
                let value = self.value(node, 0)?;
                agent.globals.store(*name, value);
                Step::Nothing
            }

            Op::GetNamed(name) => Step::Value(RegValue::Tagged(agent.get_property(&self.value(node, 0)?, *name)?)),
            Op::SetNamed(name) => {
                agent.set_property(&self.value(node, 0)?, *name, self.value(node, 1)?)?;
                Step::Nothing
            }
            Op::GetKeyed => Step::Value(RegValue::Tagged(
                agent.get_keyed(&self.value(node, 0)?, &self.value(node, 1)?)?,
            )),
            Op::SetKeyed => {
                agent.set_keyed(&self.value(node, 0)?, &self.value(node, 1)?, self.value(node, 2)?)?;
                Step::Nothing
            }

            Op::Call { .. } => {
                let this = self.value(node, 0)?;
                let callee = self.value(node, 1)?;
                let args = self.values_from(node, 2);
                Step::Value(RegValue::Tagged(agent.call(&callee, this, &args)?))
            }
            Op::Construct { .. } => {
                let callee = self.value(node, 0)?;
                let args = self.values_from(node, 1);
                Step::Value(RegValue::Tagged(agent.construct(&callee, &args)?))
            }
            Op::CallIntrinsic(intrinsic) => {
                let args = self.values_from(node, 0);
                Step::Value(RegValue::Tagged(intrinsics::call(agent, *intrinsic, &args)?))
            }

            Op::Allocate(shape) => Step::Value(RegValue::Tagged(Value::Object(Rc::new(RefCell::new(
                Object::new(*shape, ObjectKind::Ordinary),
            ))))),
            Op::AllocateArray => {
                let elements = self.values_from(node, 0);
                Step::Value(RegValue::Tagged(Value::Object(agent.create_array(elements))))
            }
            Op::DefineField(name) | Op::DefineGetter(name) => {
                let Value::Object(object) = self.value(node, 0)? else {
                    return Err(corrupt("literal definition on a primitive"));
                };
                let value = self.value(node, 1)?;
                if matches!(n.op, Op::DefineGetter(_)) {
                    agent.define_getter(&object, *name, value);
                } else {
                    agent.define_own_property(&object, *name, value);
                }
                Step::Nothing
            }
            Op::MakeClosure { frame, index } => {
                let shared = self
                    .code
                    .link
                    .frames
                    .get(*frame as usize)
                    .ok_or_else(|| corrupt("closure from an unknown frame"))?;
                Step::Value(RegValue::Tagged(interpreter::make_closure(agent, shared, *index)?))
            }
            Op::TemplateObject { frame, site } => {
                let shared = self
                    .code
                    .link
                    .frames
                    .get(*frame as usize)
                    .ok_or_else(|| corrupt("template from an unknown frame"))?;
                Step::Value(RegValue::Tagged(interpreter::template_object(agent, shared, *site)))
            }
            Op::ConstructResult => {
                let value = self.value(node, 0)?;
                let this = self.value(node, 1)?;
                Step::Value(RegValue::Tagged(construct_result(true, &this, value)))
            }
        };
        Ok(step)
    }
}

fn int32_binary(op: BinaryOp, a: i32, b: i32) -> Step {
    let result = match op {
        BinaryOp::Add => a.checked_add(b),
        BinaryOp::Sub => a.checked_sub(b),
        BinaryOp::Mul => match a.checked_mul(b) {
            Some(0) if a < 0 || b < 0 => return Step::Deopt(DeoptReason::MinusZero),
            other => other,
        },
        BinaryOp::Div => {
            if b == 0 {
                return Step::Deopt(DeoptReason::DivisionByZero);
            }
            if a == 0 && b < 0 {
                return Step::Deopt(DeoptReason::MinusZero);
            }
            match a.checked_rem(b) {
                Some(0) => a.checked_div(b),
                Some(_) => return Step::Deopt(DeoptReason::LostPrecision),
                None => None,
            }
        }
        BinaryOp::Mod => {
            if b == 0 {
                return Step::Deopt(DeoptReason::DivisionByZero);
            }
            match a.checked_rem(b) {
                Some(0) if a < 0 => return Step::Deopt(DeoptReason::MinusZero),
                Some(r) => Some(r),
                // i32::MIN % -1 is -0
                None => return Step::Deopt(DeoptReason::MinusZero),
            }
        }
        BinaryOp::BitAnd => Some(a & b),
        BinaryOp::BitOr => Some(a | b),
        BinaryOp::BitXor => Some(a ^ b),
        BinaryOp::Shl => Some(a.wrapping_shl(b as u32 & 31)),
        BinaryOp::Shr => Some(a >> (b as u32 & 31)),
        BinaryOp::UShr => return Step::Value(RegValue::Float64(((a as u32) >> (b as u32 & 31)) as f64)),
    };
    match result {
        Some(value) => Step::Value(RegValue::Int32(value)),
        None => Step::Deopt(DeoptReason::Overflow),
    }
}

fn int32_unary(op: UnaryOp, a: i32) -> Step {
    let result = match op {
        UnaryOp::Negate if a == 0 => return Step::Deopt(DeoptReason::MinusZero),
        UnaryOp::Negate => a.checked_neg(),
        UnaryOp::BitNot => Some(!a),
        UnaryOp::ToNumeric => Some(a),
        UnaryOp::Increment => a.checked_add(1),
        UnaryOp::Decrement => a.checked_sub(1),
    };
    match result {
        Some(value) => Step::Value(RegValue::Int32(value)),
        None => Step::Deopt(DeoptReason::Overflow),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deopt_reason(step: Step) -> Option<DeoptReason> {
        match step {
            Step::Deopt(reason) => Some(reason),
            _ => None,
        }
    }

    fn int(step: Step) -> Option<i32> {
        match step {
            Step::Value(RegValue::Int32(i)) => Some(i),
            _ => None,
        }
    }

    #[test]
    fn test_int32_guards() {
        assert_eq!(int(int32_binary(BinaryOp::Add, 2, 3)), Some(5));
        assert_eq!(deopt_reason(int32_binary(BinaryOp::Add, i32::MAX, 1)), Some(DeoptReason::Overflow));
        assert_eq!(deopt_reason(int32_binary(BinaryOp::Mul, -3, 0)), Some(DeoptReason::MinusZero));
        assert_eq!(deopt_reason(int32_binary(BinaryOp::Div, 7, 2)), Some(DeoptReason::LostPrecision));
        assert_eq!(deopt_reason(int32_binary(BinaryOp::Div, 1, 0)), Some(DeoptReason::DivisionByZero));
        assert_eq!(int(int32_binary(BinaryOp::Div, -8, 2)), Some(-4));
        assert_eq!(deopt_reason(int32_binary(BinaryOp::Mod, -4, 2)), Some(DeoptReason::MinusZero));
        assert_eq!(int(int32_binary(BinaryOp::Mod, 7, 3)), Some(1));
        assert_eq!(deopt_reason(int32_unary(UnaryOp::Negate, 0)), Some(DeoptReason::MinusZero));
        assert_eq!(deopt_reason(int32_unary(UnaryOp::Increment, i32::MAX)), Some(DeoptReason::Overflow));
    }

    #[test]
    fn test_unsigned_shift_leaves_int32_range() {
        match int32_binary(BinaryOp::UShr, -1, 0) {
            Step::Value(RegValue::Float64(n)) => assert_eq!(n, 4294967295.0),
            _ => panic!("expected a float64 result"),
        }
    }

    #[test]
    fn test_registers_box_for_the_interpreter() {
        assert_eq!(RegValue::Int32(4).to_value(), Value::Number(4.0));
        assert_eq!(RegValue::Bool(true).to_value(), Value::Boolean(true));
        assert_eq!(RegValue::Empty.to_value(), Value::Undefined);
        assert!(!RegValue::Float64(f64::NAN).truthy());
    }
}
