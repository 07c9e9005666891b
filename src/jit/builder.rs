//! Bytecode to graph translation
//!
//! Abstract interpretation of the operand stack: every bytecode value
//! becomes a graph node, and the environment (locals, operand stack,
//! receiver) is tracked per instruction so that each guard and each
//! effectful operation can describe the interpreter state to resume in.
//! Feedback decides the speculative lowering of every site; sites that
//! never executed end their block with an unconditional deopt.
//!
//! At the top tier, calls with a known target are inlined by building the
//! callee's bytecode into the same graph, with the caller's frame state
//! chained behind the callee's.

use super::broker::{CompilationInput, FunctionInput};
use super::ir::{
    BlockId, ConstantValue, DeoptId, DeoptPoint, FrameState, Graph, NodeId, Op, PropertyAccess, Repr,
    StateValue, Terminator,
};
use super::CompileError;
use crate::bytecode::{BinaryOp, CompareOp, Constant, Instruction, Intrinsic};
use crate::deopt::DeoptReason;
use crate::feedback::{CallFeedback, OperandHint};
use crate::runtime::{FunctionId, ShapeId, UnaryOp};
use crate::tiering::OptimizationLevel;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use std::sync::Arc;

/// Build the unoptimized graph for `input.functions[0]`
pub fn build_graph(input: &CompilationInput) -> Result<Graph, CompileError> {
    let root = input.functions.first().ok_or(CompileError::MissingFunction)?;
    let mut builder = GraphBuilder {
        input,
        graph: Graph::new(),
        constants: HashMap::default(),
        literal_shapes: HashMap::default(),
        inlined_bytecode: 0,
    };
    builder.graph.function_names = input.functions.iter().map(|f| f.name.clone()).collect();

    let entry = builder.graph.entry;
    let args: Vec<NodeId> = (0..root.chunk.param_count)
        .map(|index| builder.graph.append(entry, Op::Parameter(index), vec![], Repr::Tagged))
        .collect();
    let this = builder.graph.append(entry, Op::This, vec![], Repr::Tagged);
    let frame = InlineFrame {
        function: 0,
        outer: Vec::new(),
        construct: false,
        depth: 0,
        chain: vec![root.id],
    };
    let returns = FunctionBuilder::new(&mut builder, frame).run(entry, &args, this)?;
    for (block, value) in returns {
        builder.graph.block_mut(block).terminator = Terminator::Return(value);
    }
    builder.graph.remove_unreachable();
    tracing::trace!(
        function = %root.name,
        nodes = builder.graph.node_count(),
        blocks = builder.graph.blocks.len(),
        inlined = builder.inlined_bytecode,
        "built graph"
    );
    Ok(builder.graph)
}

/// Hashable identity of a constant; numbers compare by bits
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstKey {
    Undefined,
    Null,
    Boolean(bool),
    Number(u64),
    String(Arc<str>),
    Heap(u32),
}

impl ConstKey {
    fn of(value: &ConstantValue) -> Self {
        match value {
            ConstantValue::Undefined => ConstKey::Undefined,
            ConstantValue::Null => ConstKey::Null,
            ConstantValue::Boolean(b) => ConstKey::Boolean(*b),
            ConstantValue::Number(n) => ConstKey::Number(n.to_bits()),
            ConstantValue::String(s) => ConstKey::String(s.clone()),
            ConstantValue::Heap(index) => ConstKey::Heap(*index),
        }
    }
}

struct GraphBuilder<'i> {
    input: &'i CompilationInput,
    graph: Graph,
    constants: HashMap<ConstKey, NodeId>,
    /// Shapes of object literals under construction
    literal_shapes: HashMap<NodeId, ShapeId>,
    inlined_bytecode: usize,
}

impl GraphBuilder<'_> {
    /// Constants live in the entry block, which dominates everything
    fn constant(&mut self, value: ConstantValue) -> NodeId {
        let key = ConstKey::of(&value);
        if let Some(&node) = self.constants.get(&key) {
            return node;
        }
        let repr = value.natural_repr();
        let entry = self.graph.entry;
        let node = self.graph.append(entry, Op::Constant(value), vec![], repr);
        self.constants.insert(key, node);
        node
    }
}

/// A logical frame being built
struct InlineFrame {
    /// Index into the compilation's function list
    function: usize,
    /// Frame states of the callers, innermost first
    outer: Vec<FrameState>,
    construct: bool,
    depth: usize,
    /// Functions on the inlining path, for recursion checks
    chain: Vec<FunctionId>,
}

#[derive(Debug, Clone)]
struct Env {
    locals: Vec<NodeId>,
    stack: Vec<NodeId>,
    this: NodeId,
}

impl Env {
    fn slot_count(&self) -> usize {
        self.locals.len() + self.stack.len()
    }

    fn slot(&self, index: usize) -> NodeId {
        if index < self.locals.len() {
            self.locals[index]
        } else {
            self.stack[index - self.locals.len()]
        }
    }
}

fn unsupported(what: impl Into<String>) -> CompileError {
    CompileError::Unsupported(what.into())
}

struct FunctionBuilder<'b, 'i> {
    g: &'b mut GraphBuilder<'i>,
    input: &'i FunctionInput,
    frame: InlineFrame,
    leaders: Vec<bool>,
    headers: HashSet<usize>,
    blocks: HashMap<usize, BlockId>,
    opened: HashSet<usize>,
    header_phis: HashMap<usize, Vec<NodeId>>,
    pending: HashMap<usize, Vec<(BlockId, Env)>>,
    current: BlockId,
    reachable: bool,
    env: Env,
    returns: Vec<(BlockId, NodeId)>,
    pc: usize,
    before: Env,
    eager: Option<DeoptId>,
}

impl<'b, 'i> FunctionBuilder<'b, 'i> {
    fn new(g: &'b mut GraphBuilder<'i>, frame: InlineFrame) -> Self {
        let all = g.input;
        let input = &all.functions[frame.function];
        let code = &input.chunk.code;
        let mut leaders = vec![false; code.len() + 1];
        leaders[0] = true;
        leaders[code.len()] = true;
        for (pc, instruction) in code.iter().enumerate() {
            if let Some(target) = instruction.jump_target() {
                if let Some(leader) = leaders.get_mut(target as usize) {
                    *leader = true;
                }
                leaders[pc + 1] = true;
            }
            if matches!(instruction, Instruction::Return | Instruction::Throw) {
                leaders[pc + 1] = true;
            }
        }
        let headers = input.chunk.loop_headers().into_iter().collect();
        let entry = g.graph.entry;
        let placeholder = Env {
            locals: Vec::new(),
            stack: Vec::new(),
            this: NodeId(0),
        };
        Self {
            g,
            input,
            frame,
            leaders,
            headers,
            blocks: HashMap::default(),
            opened: HashSet::default(),
            header_phis: HashMap::default(),
            pending: HashMap::default(),
            current: entry,
            reachable: false,
            env: placeholder.clone(),
            returns: Vec::new(),
            pc: 0,
            before: placeholder,
            eager: None,
        }
    }

    /// Build the function body starting in `start`; returns every
    /// (block, value) pair that leaves the function normally
    fn run(mut self, start: BlockId, args: &[NodeId], this: NodeId) -> Result<Vec<(BlockId, NodeId)>, CompileError> {
        let chunk = self.input.chunk.clone();
        let local_count = chunk.local_count.max(chunk.param_count) as usize;
        let undefined = self.g.constant(ConstantValue::Undefined);
        let mut locals = vec![undefined; local_count];
        for (local, &arg) in locals.iter_mut().zip(args.iter().take(chunk.param_count as usize)) {
            *local = arg;
        }
        self.env = Env {
            locals,
            stack: Vec::new(),
            this,
        };
        self.current = start;
        self.reachable = true;

        for pc in 0..=chunk.code.len() {
            if self.leaders[pc] && !self.open(pc)? {
                continue;
            }
            if !self.reachable {
                continue;
            }
            let Some(&instruction) = chunk.code.get(pc) else {
                // falling off the end returns undefined
                self.returns.push((self.current, undefined));
                self.reachable = false;
                break;
            };
            self.pc = pc;
            self.before = self.env.clone();
            self.eager = None;
            self.instruction(instruction)?;
            if self.g.graph.nodes.len() > self.g.input.limits.max_nodes {
                return Err(CompileError::BudgetExceeded);
            }
        }
        Ok(self.returns)
    }

    // ========== Blocks and Edges ==========

    fn block_for(&mut self, offset: usize) -> BlockId {
        if let Some(&block) = self.blocks.get(&offset) {
            return block;
        }
        let block = self.g.graph.add_block();
        self.blocks.insert(offset, block);
        block
    }

    fn add_edge(&mut self, from: BlockId, target: usize, env: Env) -> Result<BlockId, CompileError> {
        let block = self.block_for(target);
        if !self.opened.contains(&target) {
            if target <= self.pc {
                return Err(unsupported("backward jump into unvisited code"));
            }
            self.pending.entry(target).or_default().push((from, env));
            return Ok(block);
        }
        let phis = self
            .header_phis
            .get(&target)
            .ok_or_else(|| unsupported("backward jump to a non-loop offset"))?;
        if phis.len() != env.slot_count() {
            return Err(unsupported("operand stack height differs at loop header"));
        }
        for (index, &phi) in phis.iter().enumerate() {
            self.g.graph.node_mut(phi).inputs.push(env.slot(index));
        }
        self.g.graph.block_mut(block).preds.push(from);
        Ok(block)
    }

    /// Start the block at leader `pc`; false if nothing reaches it
    fn open(&mut self, pc: usize) -> Result<bool, CompileError> {
        let mut edges = self.pending.remove(&pc).unwrap_or_default();
        if self.reachable {
            let block = self.block_for(pc);
            self.g.graph.block_mut(self.current).terminator = Terminator::Goto(block);
            edges.push((self.current, self.env.clone()));
        }
        if edges.is_empty() {
            self.reachable = false;
            return Ok(false);
        }
        let block = self.block_for(pc);
        self.opened.insert(pc);
        let height = edges[0].1.stack.len();
        if edges.iter().any(|(_, env)| env.stack.len() != height) {
            return Err(unsupported("operand stack height differs at merge"));
        }
        self.g.graph.block_mut(block).preds = edges.iter().map(|(pred, _)| *pred).collect();
        let this = edges[0].1.this;
        let locals = edges[0].1.locals.len();
        let slots = edges[0].1.slot_count();

        let merged: Vec<NodeId> = if self.headers.contains(&pc) {
            let phis: Vec<NodeId> = (0..slots)
                .map(|slot| {
                    let inputs = edges.iter().map(|(_, env)| env.slot(slot)).collect();
                    self.g.graph.add_phi(block, inputs)
                })
                .collect();
            self.header_phis.insert(pc, phis.clone());
            phis
        } else {
            (0..slots)
                .map(|slot| {
                    let first = edges[0].1.slot(slot);
                    if edges.iter().all(|(_, env)| env.slot(slot) == first) {
                        first
                    } else {
                        let inputs = edges.iter().map(|(_, env)| env.slot(slot)).collect();
                        self.g.graph.add_phi(block, inputs)
                    }
                })
                .collect()
        };
        self.env = Env {
            locals: merged[..locals].to_vec(),
            stack: merged[locals..].to_vec(),
            this,
        };
        self.current = block;
        self.reachable = true;
        Ok(true)
    }

    fn terminate(&mut self, terminator: Terminator) {
        self.g.graph.block_mut(self.current).terminator = terminator;
        self.reachable = false;
    }

    // ========== Frame States ==========

    fn frame_state(&self, env: &Env, pc: usize) -> FrameState {
        let node = |n: &NodeId| StateValue::Node(*n);
        FrameState {
            function: self.frame.function,
            pc,
            locals: env.locals.iter().map(node).collect(),
            stack: env.stack.iter().map(node).collect(),
            this: StateValue::Node(env.this),
            construct: self.frame.construct,
        }
    }

    fn point(&mut self, env: &Env, pc: usize) -> DeoptId {
        let mut frames = vec![self.frame_state(env, pc)];
        frames.extend(self.frame.outer.iter().cloned());
        self.g.graph.add_deopt_point(DeoptPoint {
            frames,
            virtual_objects: Vec::new(),
        })
    }

    /// State before the current instruction; re-executes it
    fn eager_point(&mut self) -> DeoptId {
        if let Some(point) = self.eager {
            return point;
        }
        let before = self.before.clone();
        let point = self.point(&before, self.pc);
        self.eager = Some(point);
        point
    }

    /// State after the current instruction, as the environment is now
    fn lazy_point(&mut self) -> DeoptId {
        let env = self.env.clone();
        self.point(&env, self.pc + 1)
    }

    // ========== Emission ==========

    fn emit(&mut self, op: Op, inputs: Vec<NodeId>, repr: Repr) -> NodeId {
        self.g.graph.append(self.current, op, inputs, repr)
    }

    fn emit_eager(&mut self, op: Op, inputs: Vec<NodeId>, repr: Repr) -> NodeId {
        let point = self.eager_point();
        let node = self.emit(op, inputs, repr);
        self.g.graph.node_mut(node).eager = Some(point);
        node
    }

    /// Emit an effectful operation, push its result and attach the
    /// after-state
    fn emit_lazy_push(&mut self, op: Op, inputs: Vec<NodeId>) -> NodeId {
        let node = self.emit(op, inputs, Repr::Tagged);
        self.env.stack.push(node);
        let point = self.lazy_point();
        self.g.graph.node_mut(node).lazy = Some(point);
        node
    }

    fn push(&mut self, node: NodeId) {
        self.env.stack.push(node);
    }

    fn pop(&mut self) -> Result<NodeId, CompileError> {
        self.env.stack.pop().ok_or_else(|| unsupported("operand stack underflow"))
    }

    fn peek(&self) -> Result<NodeId, CompileError> {
        self.env.stack.last().copied().ok_or_else(|| unsupported("operand stack underflow"))
    }

    fn pop_n(&mut self, count: usize) -> Result<Vec<NodeId>, CompileError> {
        if self.env.stack.len() < count {
            return Err(unsupported("operand stack underflow"));
        }
        let at = self.env.stack.len() - count;
        Ok(self.env.stack.split_off(at))
    }

    fn constant(&mut self, value: ConstantValue) -> NodeId {
        self.g.constant(value)
    }

    fn has_feedback(&self, slot: u32) -> bool {
        self.input.feedback.slot(slot).is_some_and(|s| s.is_initialized())
    }

    fn insufficient_feedback(&mut self) {
        let point = self.eager_point();
        self.terminate(Terminator::Deopt {
            point,
            reason: DeoptReason::InsufficientFeedback,
        });
    }

    fn operand_hint(&self, slot: u32) -> OperandHint {
        self.input.feedback.slot(slot).map(|s| s.operands()).unwrap_or_default()
    }

    // ========== Instructions ==========

    fn instruction(&mut self, instruction: Instruction) -> Result<(), CompileError> {
        match instruction {
            Instruction::Pop => {
                self.pop()?;
            }
            Instruction::Dup => {
                let top = self.peek()?;
                self.push(top);
            }
            Instruction::Dup2 => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.env.stack.extend([a, b, a, b]);
            }

            Instruction::LoadUndefined => self.push_constant(ConstantValue::Undefined),
            Instruction::LoadNull => self.push_constant(ConstantValue::Null),
            Instruction::LoadTrue => self.push_constant(ConstantValue::Boolean(true)),
            Instruction::LoadFalse => self.push_constant(ConstantValue::Boolean(false)),
            Instruction::LoadInt(n) => self.push_constant(ConstantValue::Number(n as f64)),
            Instruction::LoadConst(index) => {
                let value = match self.input.chunk.constants.get(index as usize) {
                    Some(Constant::Number(n)) => ConstantValue::Number(*n),
                    Some(Constant::String(s)) => ConstantValue::String(s.clone()),
                    None => return Err(unsupported("constant pool index out of range")),
                };
                self.push_constant(value);
            }
            Instruction::LoadThis => {
                let this = self.env.this;
                self.push(this);
            }

            Instruction::GetLocal(slot) => {
                let value = *self
                    .env
                    .locals
                    .get(slot as usize)
                    .ok_or_else(|| unsupported("local slot out of range"))?;
                self.push(value);
            }
            Instruction::SetLocal(slot) => {
                let value = self.pop()?;
                let local = self
                    .env
                    .locals
                    .get_mut(slot as usize)
                    .ok_or_else(|| unsupported("local slot out of range"))?;
                *local = value;
            }
            Instruction::GetGlobal(name) => match self.g.input.globals.get(&name) {
                Some(global) => self.push_constant(global.value.clone()),
                None => {
                    let node = self.emit(Op::LoadGlobal(name), vec![], Repr::Tagged);
                    self.push(node);
                }
            },
            Instruction::SetGlobal(name) => {
                let value = self.pop()?;
                let node = self.emit(Op::StoreGlobal(name), vec![value], Repr::None);
                let point = self.lazy_point();
                self.g.graph.node_mut(node).lazy = Some(point);
            }

            Instruction::GetNamed { name, slot } => {
                if !self.has_feedback(slot) {
                    self.insufficient_feedback();
                    return Ok(());
                }
                let object = self.pop()?;
                self.get_named(object, name, slot);
            }
            Instruction::SetNamed { name, slot } => {
                if !self.has_feedback(slot) {
                    self.insufficient_feedback();
                    return Ok(());
                }
                let value = self.pop()?;
                let object = self.pop()?;
                match self.input.stores.get(&slot).copied() {
                    Some(access) => {
                        self.emit_eager(Op::CheckShape(vec![access.shape]), vec![object], Repr::None);
                        let store = self.emit(
                            Op::StoreField {
                                slot: access.slot,
                                transition: access.transition,
                            },
                            vec![object, value],
                            Repr::None,
                        );
                        self.push(value);
                        let point = self.lazy_point();
                        self.g.graph.node_mut(store).lazy = Some(point);
                    }
                    None => {
                        let node = self.emit(Op::SetNamed(name), vec![object, value], Repr::None);
                        self.push(value);
                        let point = self.lazy_point();
                        self.g.graph.node_mut(node).lazy = Some(point);
                    }
                }
            }
            Instruction::GetKeyed { slot } => {
                if !self.has_feedback(slot) {
                    self.insufficient_feedback();
                    return Ok(());
                }
                let key = self.pop()?;
                let object = self.pop()?;
                if self.input.keyed_arrays.contains(&slot) {
                    self.emit_eager(Op::CheckArray, vec![object], Repr::None);
                    self.emit_eager(Op::CheckBounds, vec![key, object], Repr::None);
                    let element = self.emit_eager(Op::LoadElement, vec![object, key], Repr::Tagged);
                    self.push(element);
                } else {
                    self.emit_lazy_push(Op::GetKeyed, vec![object, key]);
                }
            }
            Instruction::SetKeyed { slot } => {
                if !self.has_feedback(slot) {
                    self.insufficient_feedback();
                    return Ok(());
                }
                let value = self.pop()?;
                let key = self.pop()?;
                let object = self.pop()?;
                if self.input.keyed_arrays.contains(&slot) {
                    self.emit_eager(Op::CheckArray, vec![object], Repr::None);
                    self.emit_eager(Op::CheckBounds, vec![key, object], Repr::None);
                    self.emit_eager(Op::StoreElement, vec![object, key, value], Repr::None);
                    self.push(value);
                } else {
                    let node = self.emit(Op::SetKeyed, vec![object, key, value], Repr::None);
                    self.push(value);
                    let point = self.lazy_point();
                    self.g.graph.node_mut(node).lazy = Some(point);
                }
            }

            Instruction::CreateObject => {
                let root = self.g.input.literal_root;
                let object = self.emit(Op::Allocate(root), vec![], Repr::Tagged);
                self.g.literal_shapes.insert(object, root);
                self.push(object);
            }
            Instruction::DefineField(name) => {
                let value = self.pop()?;
                let object = self.peek()?;
                let known = self.g.literal_shapes.get(&object).and_then(|shape| {
                    let literal = self.g.input.literal_shapes.get(shape)?;
                    literal.transitions.get(&name).map(|&target| (literal.slots, target))
                });
                match known {
                    Some((slot, target)) => {
                        self.emit(
                            Op::StoreField {
                                slot,
                                transition: Some(target),
                            },
                            vec![object, value],
                            Repr::None,
                        );
                        self.g.literal_shapes.insert(object, target);
                    }
                    None => {
                        self.g.literal_shapes.remove(&object);
                        let node = self.emit(Op::DefineField(name), vec![object, value], Repr::None);
                        let point = self.lazy_point();
                        self.g.graph.node_mut(node).lazy = Some(point);
                    }
                }
            }
            Instruction::DefineGetter(name) => {
                let getter = self.pop()?;
                let object = self.peek()?;
                self.g.literal_shapes.remove(&object);
                let node = self.emit(Op::DefineGetter(name), vec![object, getter], Repr::None);
                let point = self.lazy_point();
                self.g.graph.node_mut(node).lazy = Some(point);
            }
            Instruction::CreateArray(count) => {
                let elements = self.pop_n(count as usize)?;
                let array = self.emit(Op::AllocateArray, elements, Repr::Tagged);
                self.push(array);
            }
            Instruction::MakeClosure(index) => {
                let frame = self.frame.function as u32;
                let closure = self.emit(Op::MakeClosure { frame, index }, vec![], Repr::Tagged);
                self.push(closure);
            }
            Instruction::GetTemplateObject(site) => {
                let frame = self.frame.function as u32;
                let strings = self.emit(Op::TemplateObject { frame, site }, vec![], Repr::Tagged);
                self.push(strings);
            }

            Instruction::Binary { op, slot } => {
                if !self.has_feedback(slot) {
                    self.insufficient_feedback();
                    return Ok(());
                }
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                let result = self.binary(op, slot, lhs, rhs);
                self.push(result);
            }
            Instruction::Compare { op, slot } => {
                if !self.has_feedback(slot) {
                    self.insufficient_feedback();
                    return Ok(());
                }
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                let result = self.compare(op, slot, lhs, rhs);
                self.push(result);
            }
            Instruction::Negate { slot } => self.unary(UnaryOp::Negate, slot)?,
            Instruction::BitNot { slot } => self.unary(UnaryOp::BitNot, slot)?,
            Instruction::ToNumeric { slot } => self.unary(UnaryOp::ToNumeric, slot)?,
            Instruction::Increment { slot } => self.unary(UnaryOp::Increment, slot)?,
            Instruction::Decrement { slot } => self.unary(UnaryOp::Decrement, slot)?,
            Instruction::Not => {
                let value = self.pop()?;
                let truthy = self.emit(Op::ToBoolean, vec![value], Repr::Bool);
                let result = self.emit(Op::LogicalNot, vec![truthy], Repr::Bool);
                self.push(result);
            }
            Instruction::TypeOf => {
                let value = self.pop()?;
                let result = self.emit(Op::TypeOf, vec![value], Repr::Tagged);
                self.push(result);
            }

            Instruction::Jump(target) => {
                let env = self.env.clone();
                let block = self.add_edge(self.current, target as usize, env)?;
                self.terminate(Terminator::Goto(block));
            }
            Instruction::Loop(target) => {
                let env = self.env.clone();
                let block = self.add_edge(self.current, target as usize, env)?;
                self.terminate(Terminator::Goto(block));
            }
            Instruction::JumpIfFalse(target) | Instruction::JumpIfTrue(target) => {
                let value = self.pop()?;
                if target as usize == self.pc + 1 {
                    return Ok(());
                }
                let cond = self.emit(Op::ToBoolean, vec![value], Repr::Bool);
                let env = self.env.clone();
                let from = self.current;
                let next = self.add_edge(from, self.pc + 1, env.clone())?;
                let jump = self.add_edge(from, target as usize, env)?;
                let (if_true, if_false) = if matches!(instruction, Instruction::JumpIfTrue(_)) {
                    (jump, next)
                } else {
                    (next, jump)
                };
                self.terminate(Terminator::Branch { cond, if_true, if_false });
            }
            Instruction::JumpIfFalseOrPop(target) | Instruction::JumpIfTrueOrPop(target) => {
                if target as usize == self.pc + 1 {
                    return Err(unsupported("conditional jump to the next instruction"));
                }
                let value = self.peek()?;
                let cond = self.emit(Op::ToBoolean, vec![value], Repr::Bool);
                let kept = self.env.clone();
                let mut popped = self.env.clone();
                popped.stack.pop();
                let from = self.current;
                let (if_true, if_false) = if matches!(instruction, Instruction::JumpIfTrueOrPop(_)) {
                    let next = self.add_edge(from, self.pc + 1, popped)?;
                    let jump = self.add_edge(from, target as usize, kept)?;
                    (jump, next)
                } else {
                    let next = self.add_edge(from, self.pc + 1, popped)?;
                    let jump = self.add_edge(from, target as usize, kept)?;
                    (next, jump)
                };
                self.terminate(Terminator::Branch { cond, if_true, if_false });
            }

            Instruction::Call { argc, slot } => {
                if !self.has_feedback(slot) {
                    self.insufficient_feedback();
                    return Ok(());
                }
                let args = self.pop_n(argc as usize)?;
                let callee = self.pop()?;
                let this = self.pop()?;
                if !self.try_inline(callee, slot, Some(this), &args)? {
                    let mut inputs = vec![this, callee];
                    inputs.extend(args);
                    self.emit_lazy_push(Op::Call { argc }, inputs);
                }
            }
            Instruction::New { argc, slot } => {
                if !self.has_feedback(slot) {
                    self.insufficient_feedback();
                    return Ok(());
                }
                let args = self.pop_n(argc as usize)?;
                let callee = self.pop()?;
                if !self.try_inline(callee, slot, None, &args)? {
                    let mut inputs = vec![callee];
                    inputs.extend(args);
                    self.emit_lazy_push(Op::Construct { argc }, inputs);
                }
            }
            Instruction::CallIntrinsic { intrinsic, argc } => {
                let args = self.pop_n(argc as usize)?;
                if intrinsic == Intrinsic::DeoptimizeNow {
                    self.push_constant(ConstantValue::Undefined);
                    let point = self.lazy_point();
                    self.terminate(Terminator::Deopt {
                        point,
                        reason: DeoptReason::ForcedByDirective,
                    });
                } else {
                    self.emit_lazy_push(Op::CallIntrinsic(intrinsic), args);
                }
            }
            Instruction::Return => {
                let value = self.pop()?;
                self.returns.push((self.current, value));
                self.reachable = false;
            }

            Instruction::Throw => {
                let value = self.pop()?;
                self.terminate(Terminator::Throw(value));
            }
            Instruction::PushHandler(_) | Instruction::PopHandler => {
                return Err(unsupported("exception handlers"));
            }
            Instruction::Yield => return Err(unsupported("yield")),
            Instruction::Debugger => {}
        }
        Ok(())
    }

    fn push_constant(&mut self, value: ConstantValue) {
        let node = self.constant(value);
        self.push(node);
    }

    fn get_named(&mut self, object: NodeId, name: crate::runtime::Name, slot: u32) {
        let accesses = self.input.loads.get(&slot).cloned();
        let value = match accesses.as_deref() {
            Some([(shape, access)]) => {
                self.emit_eager(Op::CheckShape(vec![*shape]), vec![object], Repr::None);
                match access {
                    PropertyAccess::Field(field) => self.emit(Op::LoadField(*field), vec![object], Repr::Tagged),
                    PropertyAccess::Constant(value) => self.constant(value.clone()),
                    PropertyAccess::ArrayLength => self.emit_eager(Op::ArrayLength, vec![object], Repr::Int32),
                    PropertyAccess::Undefined => self.constant(ConstantValue::Undefined),
                }
            }
            Some(cases) if !cases.is_empty() => {
                self.emit_eager(Op::PolymorphicLoad(cases.to_vec()), vec![object], Repr::Tagged)
            }
            _ => {
                self.emit_lazy_push(Op::GetNamed(name), vec![object]);
                return;
            }
        };
        self.push(value);
    }

    fn binary(&mut self, op: BinaryOp, slot: u32, lhs: NodeId, rhs: NodeId) -> NodeId {
        match self.operand_hint(slot) {
            OperandHint::SignedSmall => {
                let repr = if op == BinaryOp::UShr { Repr::Float64 } else { Repr::Int32 };
                self.emit_eager(Op::Int32Binary(op), vec![lhs, rhs], repr)
            }
            OperandHint::Number if op.is_bitwise() => {
                let lhs = self.emit_eager(Op::TruncateToInt32, vec![lhs], Repr::Int32);
                let rhs = self.emit_eager(Op::TruncateToInt32, vec![rhs], Repr::Int32);
                let repr = if op == BinaryOp::UShr { Repr::Float64 } else { Repr::Int32 };
                self.emit_eager(Op::Int32Binary(op), vec![lhs, rhs], repr)
            }
            OperandHint::Number => self.emit_eager(Op::Float64Binary(op), vec![lhs, rhs], Repr::Float64),
            _ => self.emit(Op::TaggedBinary(op), vec![lhs, rhs], Repr::Tagged),
        }
    }

    fn compare(&mut self, op: CompareOp, slot: u32, lhs: NodeId, rhs: NodeId) -> NodeId {
        match self.operand_hint(slot) {
            OperandHint::SignedSmall => self.emit_eager(Op::Int32Compare(op), vec![lhs, rhs], Repr::Bool),
            OperandHint::Number => self.emit_eager(Op::Float64Compare(op), vec![lhs, rhs], Repr::Bool),
            _ => self.emit(Op::TaggedCompare(op), vec![lhs, rhs], Repr::Bool),
        }
    }

    fn unary(&mut self, op: UnaryOp, slot: u32) -> Result<(), CompileError> {
        if !self.has_feedback(slot) {
            self.insufficient_feedback();
            return Ok(());
        }
        let operand = self.pop()?;
        let result = match self.operand_hint(slot) {
            OperandHint::SignedSmall => self.emit_eager(Op::Int32Unary(op), vec![operand], Repr::Int32),
            OperandHint::Number if op == UnaryOp::BitNot => {
                let truncated = self.emit_eager(Op::TruncateToInt32, vec![operand], Repr::Int32);
                self.emit_eager(Op::Int32Unary(op), vec![truncated], Repr::Int32)
            }
            OperandHint::Number => self.emit_eager(Op::Float64Unary(op), vec![operand], Repr::Float64),
            _ => self.emit(Op::TaggedUnary(op), vec![operand], Repr::Tagged),
        };
        self.push(result);
        Ok(())
    }

    // ========== Inlining ==========

    /// Inline a call whose target is known; `this` is `None` for `new`
    fn try_inline(
        &mut self,
        callee: NodeId,
        slot: u32,
        this: Option<NodeId>,
        args: &[NodeId],
    ) -> Result<bool, CompileError> {
        let input = self.g.input;
        if input.level != OptimizationLevel::Top {
            return Ok(false);
        }
        let known = match &self.g.graph.node(callee).op {
            Op::Constant(ConstantValue::Heap(index)) => input.heap_functions.get(index).copied(),
            _ => None,
        };
        let (target, checked) = match known {
            Some(target) => (target, false),
            None => match self.input.feedback.slot(slot).map(|s| s.call()) {
                Some(CallFeedback::Monomorphic(target)) => (target, true),
                _ => return Ok(false),
            },
        };
        let Some(index) = input.function_index(target) else {
            return Ok(false);
        };
        let callee_input = &input.functions[index];
        let size = callee_input.size();
        let limits = &input.limits;
        if size > limits.max_inlined_bytecode_size
            || self.g.inlined_bytecode + size > limits.max_inlined_bytecode_cumulative
            || self.frame.depth >= limits.max_inlining_depth
            || self.frame.chain.contains(&target)
        {
            return Ok(false);
        }
        let construct = this.is_none();
        let construct_shape = callee_input.construct_shape;
        if construct && construct_shape.is_none() {
            return Ok(false);
        }

        if checked {
            self.emit_eager(Op::CheckFunction(target), vec![callee], Repr::None);
        }
        let mut outer = vec![self.frame_state(&self.env, self.pc + 1)];
        outer.extend(self.frame.outer.iter().cloned());
        let receiver = match (this, construct_shape) {
            (Some(this), _) => this,
            (None, Some(shape)) => self.emit(Op::Allocate(shape), vec![], Repr::Tagged),
            (None, None) => return Ok(false),
        };

        let start = self.g.graph.add_block();
        self.g.graph.block_mut(start).preds.push(self.current);
        self.g.graph.block_mut(self.current).terminator = Terminator::Goto(start);
        self.g.inlined_bytecode += size;
        let mut chain = self.frame.chain.clone();
        chain.push(target);
        let frame = InlineFrame {
            function: index,
            outer,
            construct,
            depth: self.frame.depth + 1,
            chain,
        };
        tracing::trace!(
            caller = %self.input.name,
            callee = %callee_input.name,
            offset = self.pc,
            construct,
            "inlining call"
        );
        let returns = FunctionBuilder::new(&mut *self.g, frame).run(start, args, receiver)?;

        if returns.is_empty() {
            // the callee never returns normally
            self.reachable = false;
            return Ok(true);
        }
        let continuation = self.g.graph.add_block();
        for &(block, _) in &returns {
            self.g.graph.block_mut(block).terminator = Terminator::Goto(continuation);
            self.g.graph.block_mut(continuation).preds.push(block);
        }
        self.current = continuation;
        let value = match returns.as_slice() {
            [(_, value)] => *value,
            _ => {
                let inputs = returns.iter().map(|&(_, value)| value).collect();
                self.g.graph.add_phi(continuation, inputs)
            }
        };
        let result = if construct {
            let primitive = returns.iter().all(|&(_, value)| {
                matches!(&self.g.graph.node(value).op, Op::Constant(c) if c.is_primitive())
            });
            if primitive {
                receiver
            } else {
                self.emit(Op::ConstructResult, vec![value, receiver], Repr::Tagged)
            }
        } else {
            value
        };
        self.push(result);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::jit::broker::prepare;
    use crate::runtime::Runtime;

    fn graph_for(source: &str, name: &str, level: OptimizationLevel) -> Graph {
        let mut runtime = Runtime::with_config(EngineConfig::interpreter_only());
        runtime.eval(source).unwrap();
        let value = runtime.get_global(name).unwrap();
        let id = value.as_object().unwrap().borrow().function_id().unwrap();
        let prepared = prepare(runtime.agent_mut(), id, level).unwrap();
        build_graph(prepared.input()).unwrap()
    }

    fn count(graph: &Graph, predicate: impl Fn(&Op) -> bool) -> usize {
        graph.live_nodes().filter(|&n| predicate(&graph.node(n).op)).count()
    }

    #[test]
    fn test_small_integer_feedback_selects_int32_arithmetic() {
        let graph = graph_for("function add(a, b) { return a + b; } add(1, 2); add(3, 4);", "add", OptimizationLevel::Mid);
        assert_eq!(count(&graph, |op| matches!(op, Op::Int32Binary(BinaryOp::Add))), 1);
        let add = graph
            .live_nodes()
            .find(|&n| matches!(graph.node(n).op, Op::Int32Binary(_)))
            .unwrap();
        assert!(graph.node(add).eager.is_some());
    }

    #[test]
    fn test_unexecuted_branch_ends_in_deopt() {
        let graph = graph_for(
            "function pick(x) { if (x) { return x.y; } return 0; } pick(0); pick(0);",
            "pick",
            OptimizationLevel::Mid,
        );
        let deopts = graph
            .blocks
            .iter()
            .filter(|b| {
                matches!(
                    b.terminator,
                    Terminator::Deopt {
                        reason: DeoptReason::InsufficientFeedback,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(deopts, 1);
    }

    #[test]
    fn test_loops_get_header_phis() {
        let graph = graph_for(
            "function sum(n) { var s = 0; for (var i = 0; i < n; i++) { s = s + i; } return s; } sum(5); sum(6);",
            "sum",
            OptimizationLevel::Mid,
        );
        let phis: usize = graph.blocks.iter().map(|b| b.phis.len()).sum();
        assert!(phis >= 2);
        let header = graph.blocks.iter().find(|b| !b.phis.is_empty()).unwrap();
        assert_eq!(header.preds.len(), 2);
        for &phi in &header.phis {
            assert_eq!(graph.node(phi).inputs.len(), 2);
        }
    }

    #[test]
    fn test_top_level_inlines_monomorphic_callee() {
        let source = "function sq(x) { return x * x; } function f(a) { return sq(a) + 1; } f(2); f(3);";
        let top = graph_for(source, "f", OptimizationLevel::Top);
        assert_eq!(count(&top, |op| matches!(op, Op::Call { .. })), 0);
        assert_eq!(count(&top, |op| matches!(op, Op::Int32Binary(BinaryOp::Mul))), 1);
        let mid = graph_for(source, "f", OptimizationLevel::Mid);
        assert_eq!(count(&mid, |op| matches!(op, Op::Call { .. })), 1);
    }

    #[test]
    fn test_inlined_frames_chain_caller_state() {
        let source = "function g(x) { return x.v; } function f(o) { return g(o) + 1; } f({v: 1}); f({v: 2});";
        let graph = graph_for(source, "f", OptimizationLevel::Top);
        let check = graph
            .live_nodes()
            .find(|&n| matches!(graph.node(n).op, Op::CheckShape(_)))
            .unwrap();
        let point = graph.deopt_point(graph.node(check).eager.unwrap());
        assert_eq!(point.frames.len(), 2);
        assert_eq!(point.frames[0].function, 1);
        assert_eq!(point.frames[1].function, 0);
    }

    #[test]
    fn test_recursion_is_not_inlined() {
        let source = "function fact(n) { return n <= 1 ? 1 : n * fact(n - 1); } fact(4); fact(5);";
        let graph = graph_for(source, "fact", OptimizationLevel::Top);
        assert_eq!(count(&graph, |op| matches!(op, Op::Call { .. })), 1);
    }
}
