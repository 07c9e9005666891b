//! Graph optimization passes
//!
//! Each pass implements [`OptimizationPass`] and reports what it changed;
//! [`run_optimization_pipeline`] runs a sequence of them and collects the
//! results for tracing and dumps.

use super::ir::{BlockId, ConstantValue, Graph, NodeId, Op, Repr, Terminator};
use crate::bytecode::CompareOp;
use crate::runtime::{arithmetic, as_int32, FunctionId, ShapeId, UnaryOp};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};

/// Result of running an optimization pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OptimizationResult {
    pub instructions_modified: usize,
    pub instructions_removed: usize,
    pub instructions_added: usize,
}

impl OptimizationResult {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn total_changes(&self) -> usize {
        self.instructions_modified + self.instructions_removed + self.instructions_added
    }
}

/// Trait for passes that transform an optimized graph
pub trait OptimizationPass {
    fn name(&self) -> &str;
    fn run(&self, graph: &mut Graph) -> OptimizationResult;
}

/// Run a sequence of optimization passes on a graph
pub fn run_optimization_pipeline(
    graph: &mut Graph,
    passes: &[&dyn OptimizationPass],
) -> Vec<(String, OptimizationResult)> {
    let mut results = Vec::new();
    for pass in passes {
        let result = pass.run(graph);
        tracing::trace!(
            pass = pass.name(),
            modified = result.instructions_modified,
            removed = result.instructions_removed,
            added = result.instructions_added,
            "optimization pass"
        );
        results.push((pass.name().to_string(), result));
    }
    results
}

// ---- Constant Folding ----

/// Folds constant operations, redundant conversions, trivial phis and
/// branches on constants
pub struct ConstantFolding;

pub(super) fn compare_numbers(op: CompareOp, a: f64, b: f64) -> bool {
    match op {
        CompareOp::Lt => a < b,
        CompareOp::Le => a <= b,
        CompareOp::Gt => a > b,
        CompareOp::Ge => a >= b,
        CompareOp::Eq | CompareOp::StrictEq => a == b,
        CompareOp::Ne | CompareOp::StrictNe => a != b,
    }
}

pub(super) fn fold_unary(op: UnaryOp, n: f64) -> f64 {
    match op {
        UnaryOp::Negate => -n,
        UnaryOp::BitNot => !crate::runtime::to_int32(n) as f64,
        UnaryOp::ToNumeric => n,
        UnaryOp::Increment => n + 1.0,
        UnaryOp::Decrement => n - 1.0,
    }
}

impl ConstantFolding {
    fn constant_of(graph: &Graph, node: NodeId) -> Option<&ConstantValue> {
        match &graph.node(node).op {
            Op::Constant(value) => Some(value),
            _ => None,
        }
    }

    fn number(graph: &Graph, node: NodeId) -> Option<f64> {
        Self::constant_of(graph, node).and_then(ConstantValue::as_number)
    }

    /// Value a node folds to, as (constant, repr)
    fn fold(graph: &Graph, node: NodeId) -> Option<(ConstantValue, Repr)> {
        let n = graph.node(node);
        let input = |index: usize| n.inputs.get(index).and_then(|&i| Self::number(graph, i));
        match &n.op {
            Op::Int32Binary(op) => {
                let result = arithmetic(*op, input(0)?, input(1)?);
                match n.repr {
                    Repr::Int32 => as_int32(result).map(|_| (ConstantValue::Number(result), Repr::Int32)),
                    Repr::Float64 => Some((ConstantValue::Number(result), Repr::Float64)),
                    _ => None,
                }
            }
            Op::Float64Binary(op) => Some((ConstantValue::Number(arithmetic(*op, input(0)?, input(1)?)), Repr::Float64)),
            Op::Int32Unary(op) => {
                let result = fold_unary(*op, input(0)?);
                as_int32(result).map(|_| (ConstantValue::Number(result), Repr::Int32))
            }
            Op::Float64Unary(op) => Some((ConstantValue::Number(fold_unary(*op, input(0)?)), Repr::Float64)),
            Op::Int32Compare(op) | Op::Float64Compare(op) => Some((
                ConstantValue::Boolean(compare_numbers(*op, input(0)?, input(1)?)),
                Repr::Bool,
            )),
            Op::LogicalNot => match Self::constant_of(graph, n.inputs[0])? {
                ConstantValue::Boolean(b) => Some((ConstantValue::Boolean(!b), Repr::Bool)),
                _ => None,
            },
            Op::ChangeInt32ToFloat64 => Some((ConstantValue::Number(input(0)?), Repr::Float64)),
            Op::ChangeInt32ToTagged | Op::ChangeFloat64ToTagged | Op::ChangeBoolToTagged => {
                Some((Self::constant_of(graph, n.inputs[0])?.clone(), Repr::Tagged))
            }
            Op::CheckedTaggedToInt32 | Op::CheckedFloat64ToInt32 => {
                let value = input(0)?;
                as_int32(value).map(|_| (ConstantValue::Number(value), Repr::Int32))
            }
            Op::CheckedTaggedToFloat64 => Some((ConstantValue::Number(input(0)?), Repr::Float64)),
            Op::TruncateToInt32 => Some((
                ConstantValue::Number(crate::runtime::to_int32(input(0)?) as f64),
                Repr::Int32,
            )),
            _ => None,
        }
    }

    /// A node made redundant by its input
    fn forward(graph: &Graph, node: NodeId) -> Option<NodeId> {
        let n = graph.node(node);
        let inner = |index: usize| n.inputs.get(index).map(|&i| (i, graph.node(i)));
        match &n.op {
            Op::ToBoolean => {
                let (input, producer) = inner(0)?;
                (producer.repr == Repr::Bool).then_some(input)
            }
            Op::CheckedTaggedToInt32 | Op::TruncateToInt32 | Op::CheckedFloat64ToInt32 => {
                let (_, producer) = inner(0)?;
                match producer.op {
                    Op::ChangeInt32ToTagged | Op::ChangeInt32ToFloat64 => producer.inputs.first().copied(),
                    _ => None,
                }
            }
            Op::CheckedTaggedToFloat64 => {
                let (_, producer) = inner(0)?;
                match producer.op {
                    Op::ChangeFloat64ToTagged => producer.inputs.first().copied(),
                    _ => None,
                }
            }
            Op::Phi => {
                let mut unique = None;
                for &input in &n.inputs {
                    if input == node || Some(input) == unique {
                        continue;
                    }
                    if unique.is_some() {
                        return None;
                    }
                    unique = Some(input);
                }
                unique
            }
            _ => None,
        }
    }
}

impl OptimizationPass for ConstantFolding {
    fn name(&self) -> &str {
        "ConstantFolding"
    }

    fn run(&self, graph: &mut Graph) -> OptimizationResult {
        let mut modified = 0;
        let mut removed = 0;
        let mut added = 0;
        loop {
            let mut replacements: HashMap<NodeId, NodeId> = HashMap::default();
            let live: Vec<NodeId> = graph.live_nodes().collect();
            for node in live {
                if let Some(target) = Self::forward(graph, node) {
                    replacements.insert(node, target);
                    continue;
                }
                if let Some((value, repr)) = Self::fold(graph, node) {
                    let entry = graph.entry;
                    let constant = graph.insert(entry, 0, Op::Constant(value), vec![], repr);
                    added += 1;
                    replacements.insert(node, constant);
                }
            }
            let mut folded_branches = false;
            for index in 0..graph.blocks.len() {
                let block = BlockId(index as u32);
                let Terminator::Branch { cond, if_true, if_false } = graph.block(block).terminator else {
                    continue;
                };
                let cond = replacements.get(&cond).copied().unwrap_or(cond);
                let Some(ConstantValue::Boolean(taken)) = Self::constant_of(graph, cond).cloned() else {
                    continue;
                };
                let (live, dead) = if taken { (if_true, if_false) } else { (if_false, if_true) };
                graph.block_mut(block).terminator = Terminator::Goto(live);
                if live != dead {
                    graph.remove_edge(block, dead);
                }
                folded_branches = true;
                modified += 1;
            }
            if replacements.is_empty() && !folded_branches {
                break;
            }
            removed += replacements.len();
            graph.apply_replacements(&replacements);
            if folded_branches {
                removed += graph.remove_unreachable();
            }
        }
        OptimizationResult {
            instructions_modified: modified,
            instructions_removed: removed,
            instructions_added: added,
        }
    }
}

// ---- Check Elimination ----

/// Removes guards already established on every path to them
pub struct CheckElimination;

#[derive(Debug, Clone, Default)]
struct Facts {
    shapes: HashMap<NodeId, Vec<ShapeId>>,
    arrays: HashSet<NodeId>,
    functions: HashMap<NodeId, FunctionId>,
    bounds: HashSet<(NodeId, NodeId)>,
}

impl Facts {
    /// Forget what arbitrary code may change
    fn clobber(&mut self) {
        self.shapes.clear();
        self.bounds.clear();
    }

    /// Whether the check at `node` is implied; records what it establishes
    fn visit(&mut self, graph: &Graph, node: NodeId) -> bool {
        let n = graph.node(node);
        match &n.op {
            Op::CheckShape(shapes) => {
                let object = n.inputs[0];
                if let Some(known) = self.shapes.get(&object) {
                    if known.iter().all(|shape| shapes.contains(shape)) {
                        return true;
                    }
                }
                self.shapes.insert(object, shapes.clone());
            }
            Op::CheckArray => {
                if !self.arrays.insert(n.inputs[0]) {
                    return true;
                }
            }
            Op::CheckFunction(id) => {
                let callee = n.inputs[0];
                if self.functions.get(&callee) == Some(id) {
                    return true;
                }
                self.functions.insert(callee, *id);
            }
            Op::CheckBounds => {
                if !self.bounds.insert((n.inputs[0], n.inputs[1])) {
                    return true;
                }
            }
            Op::Allocate(shape) => {
                self.shapes.insert(node, vec![*shape]);
            }
            Op::AllocateArray => {
                self.arrays.insert(node);
            }
            Op::StoreField {
                transition: Some(shape), ..
            } => {
                self.shapes.insert(n.inputs[0], vec![*shape]);
            }
            Op::SetKeyed => self.clobber(),
            op if op.may_call() => self.clobber(),
            _ => {}
        }
        false
    }
}

impl OptimizationPass for CheckElimination {
    fn name(&self) -> &str {
        "CheckElimination"
    }

    fn run(&self, graph: &mut Graph) -> OptimizationResult {
        let mut removed: HashSet<NodeId> = HashSet::default();
        let mut exit_facts: HashMap<BlockId, Facts> = HashMap::default();
        for block in graph.reverse_postorder() {
            let preds = &graph.block(block).preds;
            // a single predecessor dominates the block
            let mut facts = match preds.as_slice() {
                [pred] => exit_facts.get(pred).cloned().unwrap_or_default(),
                _ => Facts::default(),
            };
            for &node in &graph.block(block).nodes {
                if facts.visit(graph, node) {
                    removed.insert(node);
                }
            }
            exit_facts.insert(block, facts);
        }
        for block in &mut graph.blocks {
            block.nodes.retain(|node| !removed.contains(node));
        }
        OptimizationResult {
            instructions_modified: 0,
            instructions_removed: removed.len(),
            instructions_added: 0,
        }
    }
}

// ---- Dead Code Elimination ----

/// Removes pure nodes whose values nothing observes
pub struct DeadCodeElimination;

impl OptimizationPass for DeadCodeElimination {
    fn name(&self) -> &str {
        "DeadCodeElimination"
    }

    fn run(&self, graph: &mut Graph) -> OptimizationResult {
        let mut live: HashSet<NodeId> = HashSet::default();
        let mut worklist: Vec<NodeId> = Vec::new();
        for block in &graph.blocks {
            for &node in &block.nodes {
                let op = &graph.node(node).op;
                if op.is_effectful() || op.is_check() {
                    worklist.push(node);
                }
            }
            if let Some(operand) = block.terminator.operand() {
                worklist.push(operand);
            }
            if let Terminator::Deopt { point, .. } = block.terminator {
                worklist.extend(graph.deopt_point(point).nodes());
            }
        }
        while let Some(node) = worklist.pop() {
            if !live.insert(node) {
                continue;
            }
            let n = graph.node(node);
            worklist.extend(n.inputs.iter().copied());
            for point in [n.eager, n.lazy].into_iter().flatten() {
                worklist.extend(graph.deopt_point(point).nodes());
            }
        }
        let mut removed = 0;
        for block in &mut graph.blocks {
            let before = block.nodes.len() + block.phis.len();
            block.nodes.retain(|node| live.contains(node));
            block.phis.retain(|node| live.contains(node));
            removed += before - block.nodes.len() - block.phis.len();
        }
        OptimizationResult {
            instructions_modified: 0,
            instructions_removed: removed,
            instructions_added: 0,
        }
    }
}
