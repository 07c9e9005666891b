//! Sea-of-blocks SSA graph for the optimizing tiers
//!
//! Nodes live in one arena and are scheduled into basic blocks in
//! execution order. Every node has an output [`Repr`]; representation
//! selection decides it and inserts conversions between mismatched
//! producers and consumers. Nodes that may leave optimized code point at a
//! [`DeoptPoint`]: `eager` for guards (state before the bytecode
//! instruction), `lazy` for effectful operations (state after it).

use crate::bytecode::{BinaryOp, CompareOp, Intrinsic};
use crate::deopt::DeoptReason;
use crate::runtime::{FunctionId, Name, ShapeId, UnaryOp};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeoptId(pub u32);

/// Machine representation of a node's output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Repr {
    Tagged,
    Int32,
    Float64,
    Bool,
    /// No output (checks, stores)
    None,
}

impl Repr {
    pub fn as_str(self) -> &'static str {
        match self {
            Repr::Tagged => "t",
            Repr::Int32 => "i32",
            Repr::Float64 => "f64",
            Repr::Bool => "b",
            Repr::None => "-",
        }
    }
}

/// A compile-time constant. Heap values are indices into the code's link
/// context, since the graph must not hold heap references.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstantValue {
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    String(Arc<str>),
    Heap(u32),
}

impl ConstantValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ConstantValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Natural representation for a constant used as-is
    pub fn natural_repr(&self) -> Repr {
        match self {
            ConstantValue::Number(n) if crate::runtime::as_int32(*n).is_some() => Repr::Int32,
            ConstantValue::Number(_) => Repr::Float64,
            ConstantValue::Boolean(_) => Repr::Bool,
            _ => Repr::Tagged,
        }
    }

    /// Primitive constants; a constructor returning one yields its receiver
    pub fn is_primitive(&self) -> bool {
        !matches!(self, ConstantValue::Heap(_))
    }
}

impl fmt::Display for ConstantValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstantValue::Undefined => f.write_str("undefined"),
            ConstantValue::Null => f.write_str("null"),
            ConstantValue::Boolean(b) => write!(f, "{}", b),
            ConstantValue::Number(n) => write!(f, "{}", crate::runtime::number_to_string(*n)),
            ConstantValue::String(s) => write!(f, "{:?}", s),
            ConstantValue::Heap(index) => write!(f, "heap#{}", index),
        }
    }
}

/// How a resolved named load produces its value for one receiver shape
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyAccess {
    /// Own data slot
    Field(u32),
    /// Data property of a prototype, guarded by validity cells
    Constant(ConstantValue),
    ArrayLength,
    /// Missing along the whole chain
    Undefined,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Parameter(u32),
    This,
    Constant(ConstantValue),
    Phi,

    Int32Binary(BinaryOp),
    Float64Binary(BinaryOp),
    TaggedBinary(BinaryOp),
    Int32Compare(CompareOp),
    Float64Compare(CompareOp),
    TaggedCompare(CompareOp),
    Int32Unary(UnaryOp),
    Float64Unary(UnaryOp),
    TaggedUnary(UnaryOp),
    LogicalNot,
    TypeOf,
    /// Any representation to Bool
    ToBoolean,

    CheckShape(Vec<ShapeId>),
    CheckFunction(FunctionId),
    CheckArray,
    /// Inputs `[index, array]`
    CheckBounds,
    CheckedTaggedToInt32,
    CheckedTaggedToFloat64,
    CheckedFloat64ToInt32,
    TruncateToInt32,
    ChangeInt32ToFloat64,
    ChangeInt32ToTagged,
    ChangeFloat64ToTagged,
    ChangeBoolToTagged,

    LoadField(u32),
    PolymorphicLoad(Vec<(ShapeId, PropertyAccess)>),
    ArrayLength,
    /// Inputs `[array, index]`
    LoadElement,
    /// Inputs `[array, index, value]`
    StoreElement,
    /// Inputs `[object, value]`
    StoreField {
        slot: u32,
        transition: Option<ShapeId>,
    },
    LoadGlobal(Name),
    StoreGlobal(Name),

    GetNamed(Name),
    SetNamed(Name),
    GetKeyed,
    SetKeyed,

    /// Inputs `[this, callee, args...]`
    Call {
        argc: u32,
    },
    /// Inputs `[callee, args...]`
    Construct {
        argc: u32,
    },
    CallIntrinsic(Intrinsic),

    Allocate(ShapeId),
    AllocateArray,
    DefineField(Name),
    DefineGetter(Name),
    /// `frame` indexes the compilation's function list
    MakeClosure {
        frame: u32,
        index: u32,
    },
    TemplateObject {
        frame: u32,
        site: u32,
    },
    /// Inputs `[value, this]`
    ConstructResult,
}

impl Op {
    /// Operations that may run script code or mutate the heap
    pub fn is_effectful(&self) -> bool {
        matches!(
            self,
            Op::StoreElement
                | Op::StoreField { .. }
                | Op::LoadGlobal(_)
                | Op::StoreGlobal(_)
                | Op::GetNamed(_)
                | Op::SetNamed(_)
                | Op::GetKeyed
                | Op::SetKeyed
                | Op::Call { .. }
                | Op::Construct { .. }
                | Op::CallIntrinsic(_)
                | Op::DefineField(_)
                | Op::DefineGetter(_)
        )
    }

    /// Operations that can run arbitrary script code
    pub fn may_call(&self) -> bool {
        matches!(
            self,
            Op::GetNamed(_)
                | Op::SetNamed(_)
                | Op::GetKeyed
                | Op::SetKeyed
                | Op::Call { .. }
                | Op::Construct { .. }
                | Op::CallIntrinsic(_)
                | Op::DefineField(_)
                | Op::DefineGetter(_)
        )
    }

    /// Guards with no output
    pub fn is_check(&self) -> bool {
        matches!(self, Op::CheckShape(_) | Op::CheckFunction(_) | Op::CheckArray | Op::CheckBounds)
    }

    pub fn is_conversion(&self) -> bool {
        matches!(
            self,
            Op::CheckedTaggedToInt32
                | Op::CheckedTaggedToFloat64
                | Op::CheckedFloat64ToInt32
                | Op::TruncateToInt32
                | Op::ChangeInt32ToFloat64
                | Op::ChangeInt32ToTagged
                | Op::ChangeFloat64ToTagged
                | Op::ChangeBoolToTagged
        )
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Parameter(i) => write!(f, "Parameter({})", i),
            Op::Constant(c) => write!(f, "Constant({})", c),
            Op::Int32Binary(op) => write!(f, "Int32Binary({})", op.symbol()),
            Op::Float64Binary(op) => write!(f, "Float64Binary({})", op.symbol()),
            Op::TaggedBinary(op) => write!(f, "TaggedBinary({})", op.symbol()),
            Op::Int32Compare(op) => write!(f, "Int32Compare({})", op.symbol()),
            Op::Float64Compare(op) => write!(f, "Float64Compare({})", op.symbol()),
            Op::TaggedCompare(op) => write!(f, "TaggedCompare({})", op.symbol()),
            Op::CheckShape(shapes) => {
                let ids: Vec<String> = shapes.iter().map(|s| s.0.to_string()).collect();
                write!(f, "CheckShape([{}])", ids.join(", "))
            }
            Op::CheckFunction(id) => write!(f, "CheckFunction(#{})", id.0),
            Op::PolymorphicLoad(cases) => write!(f, "PolymorphicLoad({} cases)", cases.len()),
            Op::StoreField { slot, transition } => match transition {
                Some(shape) => write!(f, "StoreField({}, -> {})", slot, shape.0),
                None => write!(f, "StoreField({})", slot),
            },
            Op::Allocate(shape) => write!(f, "Allocate({})", shape.0),
            other => write!(f, "{:?}", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub op: Op,
    pub inputs: Vec<NodeId>,
    pub repr: Repr,
    pub eager: Option<DeoptId>,
    pub lazy: Option<DeoptId>,
    pub block: BlockId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    Goto(BlockId),
    Branch {
        cond: NodeId,
        if_true: BlockId,
        if_false: BlockId,
    },
    Return(NodeId),
    Throw(NodeId),
    /// Unconditional exit to the interpreter
    Deopt {
        point: DeoptId,
        reason: DeoptReason,
    },
    /// Block not reachable (or not yet finished while building)
    Unreachable,
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match *self {
            Terminator::Goto(target) => vec![target],
            Terminator::Branch { if_true, if_false, .. } => vec![if_true, if_false],
            _ => Vec::new(),
        }
    }

    fn operand_mut(&mut self) -> Option<&mut NodeId> {
        match self {
            Terminator::Branch { cond, .. } => Some(cond),
            Terminator::Return(value) | Terminator::Throw(value) => Some(value),
            _ => None,
        }
    }

    pub fn operand(&self) -> Option<NodeId> {
        match *self {
            Terminator::Branch { cond, .. } => Some(cond),
            Terminator::Return(value) | Terminator::Throw(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Block {
    pub preds: Vec<BlockId>,
    /// Phi inputs are ordered like `preds`
    pub phis: Vec<NodeId>,
    pub nodes: Vec<NodeId>,
    pub terminator: Terminator,
}

/// A value in a frame state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateValue {
    Node(NodeId),
    /// Index into the point's `virtual_objects`
    Virtual(u32),
}

/// Interpreter-visible state of one logical frame
#[derive(Debug, Clone, PartialEq)]
pub struct FrameState {
    /// Index into the compilation's function list
    pub function: usize,
    /// Bytecode offset to resume at
    pub pc: usize,
    pub locals: Vec<StateValue>,
    pub stack: Vec<StateValue>,
    pub this: StateValue,
    pub construct: bool,
}

impl FrameState {
    pub fn values(&self) -> impl Iterator<Item = &StateValue> {
        self.locals.iter().chain(self.stack.iter()).chain(std::iter::once(&self.this))
    }

    fn values_mut(&mut self) -> impl Iterator<Item = &mut StateValue> {
        self.locals
            .iter_mut()
            .chain(self.stack.iter_mut())
            .chain(std::iter::once(&mut self.this))
    }
}

/// An allocation removed by escape analysis, as of one deopt point
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualObject {
    pub shape: ShapeId,
    pub fields: Vec<StateValue>,
}

/// Everything needed to rebuild interpreter frames at one exit
#[derive(Debug, Clone, PartialEq)]
pub struct DeoptPoint {
    /// Innermost first
    pub frames: Vec<FrameState>,
    pub virtual_objects: Vec<VirtualObject>,
}

impl DeoptPoint {
    fn values_mut(&mut self) -> impl Iterator<Item = &mut StateValue> {
        self.frames
            .iter_mut()
            .flat_map(FrameState::values_mut)
            .chain(self.virtual_objects.iter_mut().flat_map(|object| object.fields.iter_mut()))
    }

    /// Nodes the point reads
    pub fn nodes(&self) -> Vec<NodeId> {
        let frames = self.frames.iter().flat_map(FrameState::values);
        let fields = self.virtual_objects.iter().flat_map(|object| object.fields.iter());
        frames
            .chain(fields)
            .filter_map(|value| match value {
                StateValue::Node(node) => Some(*node),
                StateValue::Virtual(_) => None,
            })
            .collect()
    }
}

/// An optimized compilation unit
#[derive(Debug, Clone)]
pub struct Graph {
    pub nodes: Vec<Node>,
    pub blocks: Vec<Block>,
    pub deopt_points: Vec<DeoptPoint>,
    pub entry: BlockId,
    /// Function names per frame index, for dumps
    pub function_names: Vec<String>,
}

impl Graph {
    pub fn new() -> Self {
        let mut graph = Self {
            nodes: Vec::new(),
            blocks: Vec::new(),
            deopt_points: Vec::new(),
            entry: BlockId(0),
            function_names: Vec::new(),
        };
        graph.entry = graph.add_block();
        graph
    }

    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block {
            preds: Vec::new(),
            phis: Vec::new(),
            nodes: Vec::new(),
            terminator: Terminator::Unreachable,
        });
        id
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    /// Create a node without scheduling it
    pub fn create(&mut self, block: BlockId, op: Op, inputs: Vec<NodeId>, repr: Repr) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            op,
            inputs,
            repr,
            eager: None,
            lazy: None,
            block,
        });
        id
    }

    /// Create a node at the end of `block`
    pub fn append(&mut self, block: BlockId, op: Op, inputs: Vec<NodeId>, repr: Repr) -> NodeId {
        let id = self.create(block, op, inputs, repr);
        self.blocks[block.index()].nodes.push(id);
        id
    }

    /// Create a node in `block` right before the node at `position`
    pub fn insert(&mut self, block: BlockId, position: usize, op: Op, inputs: Vec<NodeId>, repr: Repr) -> NodeId {
        let id = self.create(block, op, inputs, repr);
        self.blocks[block.index()].nodes.insert(position, id);
        id
    }

    pub fn add_phi(&mut self, block: BlockId, inputs: Vec<NodeId>) -> NodeId {
        let id = self.create(block, Op::Phi, inputs, Repr::None);
        self.blocks[block.index()].phis.push(id);
        id
    }

    pub fn add_deopt_point(&mut self, point: DeoptPoint) -> DeoptId {
        let id = DeoptId(self.deopt_points.len() as u32);
        self.deopt_points.push(point);
        id
    }

    pub fn deopt_point(&self, id: DeoptId) -> &DeoptPoint {
        &self.deopt_points[id.0 as usize]
    }

    pub fn deopt_point_mut(&mut self, id: DeoptId) -> &mut DeoptPoint {
        &mut self.deopt_points[id.0 as usize]
    }

    /// Blocks reachable from the entry, in reverse postorder
    pub fn reverse_postorder(&self) -> Vec<BlockId> {
        let mut visited = vec![false; self.blocks.len()];
        let mut order = Vec::with_capacity(self.blocks.len());
        // explicit stack of (block, next successor index)
        let mut stack = vec![(self.entry, 0usize)];
        visited[self.entry.index()] = true;
        while let Some((block, next)) = stack.pop() {
            let successors = self.block(block).terminator.successors();
            if let Some(&successor) = successors.get(next) {
                stack.push((block, next + 1));
                if !visited[successor.index()] {
                    visited[successor.index()] = true;
                    stack.push((successor, 0));
                }
            } else {
                order.push(block);
            }
        }
        order.reverse();
        order
    }

    /// Drop edges from unreachable blocks and empty those blocks.
    /// Returns the number of blocks removed.
    pub fn remove_unreachable(&mut self) -> usize {
        let reachable: HashSet<BlockId> = self.reverse_postorder().into_iter().collect();
        let mut removed = 0;
        for index in 0..self.blocks.len() {
            let id = BlockId(index as u32);
            if !reachable.contains(&id) {
                let block = &mut self.blocks[index];
                if !block.nodes.is_empty() || !block.phis.is_empty() || block.terminator != Terminator::Unreachable {
                    removed += 1;
                }
                block.nodes.clear();
                block.phis.clear();
                block.preds.clear();
                block.terminator = Terminator::Unreachable;
                continue;
            }
            let preds = self.blocks[index].preds.clone();
            let keep: Vec<bool> = preds.iter().map(|pred| reachable.contains(pred)).collect();
            if keep.iter().all(|&k| k) {
                continue;
            }
            let phis = self.blocks[index].phis.clone();
            for phi in phis {
                let inputs = std::mem::take(&mut self.nodes[phi.index()].inputs);
                self.nodes[phi.index()].inputs = inputs
                    .into_iter()
                    .zip(keep.iter())
                    .filter(|(_, &k)| k)
                    .map(|(input, _)| input)
                    .collect();
            }
            self.blocks[index].preds = preds
                .into_iter()
                .zip(keep.iter())
                .filter(|(_, &k)| k)
                .map(|(pred, _)| pred)
                .collect();
        }
        removed
    }

    /// Remove the edge `pred -> block`, dropping the matching phi inputs
    pub fn remove_edge(&mut self, pred: BlockId, block: BlockId) {
        let Some(position) = self.block(block).preds.iter().position(|&p| p == pred) else {
            return;
        };
        self.blocks[block.index()].preds.remove(position);
        let phis = self.blocks[block.index()].phis.clone();
        for phi in phis {
            let inputs = &mut self.nodes[phi.index()].inputs;
            if position < inputs.len() {
                inputs.remove(position);
            }
        }
    }

    /// Rewrite every use of a replaced node and unschedule the replaced
    /// nodes. Chains of replacements are followed to their end.
    pub fn apply_replacements(&mut self, replacements: &HashMap<NodeId, NodeId>) {
        if replacements.is_empty() {
            return;
        }
        let resolve = |mut node: NodeId| {
            let mut steps = 0;
            while let Some(&next) = replacements.get(&node) {
                if next == node || steps > replacements.len() {
                    break;
                }
                node = next;
                steps += 1;
            }
            node
        };
        for node in &mut self.nodes {
            for input in &mut node.inputs {
                *input = resolve(*input);
            }
        }
        for block in &mut self.blocks {
            if let Some(operand) = block.terminator.operand_mut() {
                *operand = resolve(*operand);
            }
            block.nodes.retain(|node| !replacements.contains_key(node));
            block.phis.retain(|node| !replacements.contains_key(node));
        }
        for point in &mut self.deopt_points {
            for value in point.values_mut() {
                if let StateValue::Node(node) = value {
                    *node = resolve(*node);
                }
            }
        }
    }

    /// Scheduled nodes, phis first, in block order
    pub fn live_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.blocks
            .iter()
            .flat_map(|block| block.phis.iter().chain(block.nodes.iter()).copied())
    }

    /// Number of scheduled nodes
    pub fn node_count(&self) -> usize {
        self.blocks.iter().map(|block| block.phis.len() + block.nodes.len()).sum()
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |inputs: &[NodeId]| {
            inputs
                .iter()
                .map(|input| format!("n{}", input.0))
                .collect::<Vec<_>>()
                .join(", ")
        };
        for id in self.reverse_postorder() {
            let block = self.block(id);
            let preds: Vec<String> = block.preds.iter().map(|p| format!("b{}", p.0)).collect();
            writeln!(f, "b{} <- [{}]:", id.0, preds.join(", "))?;
            for &phi in &block.phis {
                let node = self.node(phi);
                writeln!(f, "  n{}:{} = Phi({})", phi.0, node.repr.as_str(), names(&node.inputs))?;
            }
            for &node_id in &block.nodes {
                let node = self.node(node_id);
                write!(f, "  n{}:{} = {}", node_id.0, node.repr.as_str(), node.op)?;
                if !node.inputs.is_empty() {
                    write!(f, " ({})", names(&node.inputs))?;
                }
                if let Some(point) = node.eager {
                    write!(f, " eager@{}", self.describe_point(point))?;
                }
                if let Some(point) = node.lazy {
                    write!(f, " lazy@{}", self.describe_point(point))?;
                }
                writeln!(f)?;
            }
            match &block.terminator {
                Terminator::Goto(target) => writeln!(f, "  goto b{}", target.0)?,
                Terminator::Branch { cond, if_true, if_false } => {
                    writeln!(f, "  branch n{} ? b{} : b{}", cond.0, if_true.0, if_false.0)?
                }
                Terminator::Return(value) => writeln!(f, "  return n{}", value.0)?,
                Terminator::Throw(value) => writeln!(f, "  throw n{}", value.0)?,
                Terminator::Deopt { point, reason } => {
                    writeln!(f, "  deopt ({}) @{}", reason, self.describe_point(*point))?
                }
                Terminator::Unreachable => writeln!(f, "  unreachable")?,
            }
        }
        Ok(())
    }
}

impl Graph {
    fn describe_point(&self, id: DeoptId) -> String {
        let point = self.deopt_point(id);
        point
            .frames
            .iter()
            .map(|frame| {
                let name = self
                    .function_names
                    .get(frame.function)
                    .map(String::as_str)
                    .unwrap_or("?");
                format!("{}:{}", if name.is_empty() { "<anonymous>" } else { name }, frame.pc)
            })
            .collect::<Vec<_>>()
            .join("<")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> (Graph, BlockId, BlockId, BlockId, NodeId) {
        let mut graph = Graph::new();
        let entry = graph.entry;
        let left = graph.add_block();
        let right = graph.add_block();
        let join = graph.add_block();
        let cond = graph.append(entry, Op::Constant(ConstantValue::Boolean(true)), vec![], Repr::Bool);
        graph.block_mut(entry).terminator = Terminator::Branch {
            cond,
            if_true: left,
            if_false: right,
        };
        let one = graph.append(left, Op::Constant(ConstantValue::Number(1.0)), vec![], Repr::Int32);
        let two = graph.append(right, Op::Constant(ConstantValue::Number(2.0)), vec![], Repr::Int32);
        for block in [left, right] {
            graph.block_mut(block).terminator = Terminator::Goto(join);
            graph.block_mut(join).preds.push(block);
        }
        graph.block_mut(left).preds.push(entry);
        graph.block_mut(right).preds.push(entry);
        let phi = graph.add_phi(join, vec![one, two]);
        graph.block_mut(join).terminator = Terminator::Return(phi);
        (graph, left, right, join, phi)
    }

    #[test]
    fn test_reverse_postorder_visits_join_last() {
        let (graph, _, _, join, _) = diamond();
        let order = graph.reverse_postorder();
        assert_eq!(order.len(), 4);
        assert_eq!(order[0], graph.entry);
        assert_eq!(order.last(), Some(&join));
    }

    #[test]
    fn test_unreachable_blocks_drop_phi_inputs() {
        let (mut graph, left, right, join, phi) = diamond();
        let entry = graph.entry;
        graph.block_mut(entry).terminator = Terminator::Goto(left);
        graph.remove_edge(entry, right);
        assert_eq!(graph.remove_unreachable(), 1);
        assert_eq!(graph.block(join).preds, vec![left]);
        assert_eq!(graph.node(phi).inputs.len(), 1);
    }

    #[test]
    fn test_replacements_reach_terminators_and_states() {
        let (mut graph, _, _, join, phi) = diamond();
        let entry = graph.entry;
        let replacement = graph.append(join, Op::Constant(ConstantValue::Number(3.0)), vec![], Repr::Int32);
        let point = graph.add_deopt_point(DeoptPoint {
            frames: vec![FrameState {
                function: 0,
                pc: 0,
                locals: vec![StateValue::Node(phi)],
                stack: vec![],
                this: StateValue::Node(phi),
                construct: false,
            }],
            virtual_objects: vec![],
        });
        let mut replacements = HashMap::default();
        replacements.insert(phi, replacement);
        graph.apply_replacements(&replacements);
        assert_eq!(graph.block(join).terminator, Terminator::Return(replacement));
        assert!(graph.block(join).phis.is_empty());
        assert_eq!(graph.deopt_point(point).nodes(), vec![replacement, replacement]);
        assert!(graph.block(entry).nodes.len() == 1);
    }
}
