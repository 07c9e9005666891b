//! Representation selection
//!
//! Builder nodes already carry the output representation their operation
//! implies. This pass settles phis by a fixpoint over their inputs, then
//! walks every use and inserts the conversion the consumer needs. Checked
//! conversions (tagged to int32, float64 to int32) deopt with the
//! consumer's eager state.

use super::ir::{BlockId, ConstantValue, Graph, NodeId, Op, Repr, Terminator};
use super::CompileError;
use rustc_hash::FxHashMap as HashMap;

/// Required representation of one input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Use {
    Exactly(Repr),
    /// Any representation with an output
    Any,
}

fn input_uses(op: &Op, count: usize) -> Vec<Use> {
    let all = |repr: Repr| vec![Use::Exactly(repr); count];
    match op {
        Op::Int32Binary(_) | Op::Int32Compare(_) | Op::Int32Unary(_) => all(Repr::Int32),
        Op::Float64Binary(_) | Op::Float64Compare(_) | Op::Float64Unary(_) => all(Repr::Float64),
        Op::TruncateToInt32 => all(Repr::Float64),
        Op::LogicalNot => all(Repr::Bool),
        Op::ToBoolean => vec![Use::Any; count],
        Op::CheckBounds => vec![Use::Exactly(Repr::Int32), Use::Exactly(Repr::Tagged)],
        Op::LoadElement => vec![Use::Exactly(Repr::Tagged), Use::Exactly(Repr::Int32)],
        Op::StoreElement => vec![
            Use::Exactly(Repr::Tagged),
            Use::Exactly(Repr::Int32),
            Use::Exactly(Repr::Tagged),
        ],
        // already exact
        op if op.is_conversion() => vec![Use::Any; count],
        _ => all(Repr::Tagged),
    }
}

/// Least upper bound of two representations; `None` is bottom
fn join(a: Repr, b: Repr) -> Repr {
    match (a, b) {
        (Repr::None, other) | (other, Repr::None) => other,
        (a, b) if a == b => a,
        (Repr::Int32, Repr::Float64) | (Repr::Float64, Repr::Int32) => Repr::Float64,
        _ => Repr::Tagged,
    }
}

fn truthiness(value: &ConstantValue) -> bool {
    match value {
        ConstantValue::Undefined | ConstantValue::Null => false,
        ConstantValue::Boolean(b) => *b,
        ConstantValue::Number(n) => *n != 0.0 && !n.is_nan(),
        ConstantValue::String(s) => !s.is_empty(),
        ConstantValue::Heap(_) => true,
    }
}

pub fn select_representations(graph: &mut Graph) -> Result<usize, CompileError> {
    settle_phis(graph);
    let mut selector = Selector {
        cache: HashMap::default(),
        constants: HashMap::default(),
        inserted: 0,
    };
    for block in graph.reverse_postorder() {
        selector.convert_block(graph, block)?;
    }
    tracing::trace!(conversions = selector.inserted, "selected representations");
    Ok(selector.inserted)
}

fn settle_phis(graph: &mut Graph) {
    let phis: Vec<NodeId> = graph.blocks.iter().flat_map(|b| b.phis.iter().copied()).collect();
    for &phi in &phis {
        graph.node_mut(phi).repr = Repr::None;
    }
    let mut changed = true;
    while changed {
        changed = false;
        for &phi in &phis {
            let joined = graph
                .node(phi)
                .inputs
                .iter()
                .fold(Repr::None, |acc, &input| join(acc, graph.node(input).repr));
            if joined != graph.node(phi).repr {
                graph.node_mut(phi).repr = joined;
                changed = true;
            }
        }
    }
    for &phi in &phis {
        // only fed by other unresolved phis
        if graph.node(phi).repr == Repr::None {
            graph.node_mut(phi).repr = Repr::Tagged;
        }
    }
}

struct Selector {
    cache: HashMap<(NodeId, Repr, BlockId), NodeId>,
    constants: HashMap<(NodeId, Repr), NodeId>,
    inserted: usize,
}

/// Where a conversion is placed
#[derive(Clone, Copy)]
enum Placement {
    /// Before the node at this index of the block
    Before(usize),
    End,
}

impl Selector {
    fn convert_block(&mut self, graph: &mut Graph, block: BlockId) -> Result<(), CompileError> {
        let mut index = 0;
        while index < graph.block(block).nodes.len() {
            let node = graph.block(block).nodes[index];
            let uses = input_uses(&graph.node(node).op, graph.node(node).inputs.len());
            for (slot, required) in uses.into_iter().enumerate() {
                let Use::Exactly(target) = required else {
                    continue;
                };
                let input = graph.node(node).inputs[slot];
                if graph.node(input).repr == target {
                    continue;
                }
                let before = graph.block(block).nodes.len();
                let converted = self.convert(graph, input, target, block, Placement::Before(index), Some(node))?;
                index += graph.block(block).nodes.len() - before;
                graph.node_mut(node).inputs[slot] = converted;
            }
            index += 1;
        }

        let phis = graph.block(block).phis.clone();
        let preds = graph.block(block).preds.clone();
        for phi in phis {
            let target = graph.node(phi).repr;
            for (slot, &pred) in preds.iter().enumerate() {
                let Some(&input) = graph.node(phi).inputs.get(slot) else {
                    continue;
                };
                if graph.node(input).repr == target {
                    continue;
                }
                let converted = self.convert(graph, input, target, pred, Placement::End, None)?;
                graph.node_mut(phi).inputs[slot] = converted;
            }
        }

        let terminator = graph.block(block).terminator.clone();
        let required = match terminator {
            Terminator::Branch { cond, .. } => Some((cond, Repr::Bool)),
            Terminator::Return(value) | Terminator::Throw(value) => Some((value, Repr::Tagged)),
            _ => None,
        };
        if let Some((operand, target)) = required {
            if graph.node(operand).repr != target {
                let converted = self.convert(graph, operand, target, block, Placement::End, None)?;
                match &mut graph.block_mut(block).terminator {
                    Terminator::Branch { cond, .. } => *cond = converted,
                    Terminator::Return(value) | Terminator::Throw(value) => *value = converted,
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Convert `input` to `target` for a use in `block`; `consumer`
    /// supplies the deopt state of checked conversions
    fn convert(
        &mut self,
        graph: &mut Graph,
        input: NodeId,
        target: Repr,
        block: BlockId,
        placement: Placement,
        consumer: Option<NodeId>,
    ) -> Result<NodeId, CompileError> {
        if let Op::Constant(value) = graph.node(input).op.clone() {
            if let Some(constant) = self.constant(graph, input, value, target) {
                return Ok(constant);
            }
        }
        if let Some(&cached) = self.cache.get(&(input, target, block)) {
            return Ok(cached);
        }
        let from = graph.node(input).repr;
        let (op, checked) = match (from, target) {
            (Repr::None, _) | (_, Repr::None) => {
                return Err(CompileError::Unsupported("conversion of a value-less node".into()));
            }
            (_, Repr::Bool) => (Op::ToBoolean, false),
            (Repr::Int32, Repr::Float64) => (Op::ChangeInt32ToFloat64, false),
            (Repr::Int32, Repr::Tagged) => (Op::ChangeInt32ToTagged, false),
            (Repr::Float64, Repr::Tagged) => (Op::ChangeFloat64ToTagged, false),
            (Repr::Bool, Repr::Tagged) => (Op::ChangeBoolToTagged, false),
            (Repr::Tagged, Repr::Int32) => (Op::CheckedTaggedToInt32, true),
            (Repr::Tagged, Repr::Float64) => (Op::CheckedTaggedToFloat64, true),
            (Repr::Float64, Repr::Int32) => (Op::CheckedFloat64ToInt32, true),
            (Repr::Bool, _) => {
                let tagged = self.convert(graph, input, Repr::Tagged, block, placement, consumer)?;
                let placement = match placement {
                    Placement::Before(index) => Placement::Before(index + 1),
                    Placement::End => Placement::End,
                };
                return self.convert(graph, tagged, target, block, placement, consumer);
            }
            (from, to) => {
                return Err(CompileError::Unsupported(format!(
                    "no conversion from {} to {}",
                    from.as_str(),
                    to.as_str()
                )));
            }
        };
        let eager = if checked {
            let point = consumer.and_then(|node| graph.node(node).eager);
            Some(point.ok_or_else(|| CompileError::Unsupported("checked conversion without a deopt point".into()))?)
        } else {
            None
        };
        let node = match placement {
            Placement::Before(index) => graph.insert(block, index, op, vec![input], target),
            Placement::End => graph.append(block, op, vec![input], target),
        };
        graph.node_mut(node).eager = eager;
        // a block-end conversion may precede uses not yet visited
        if let Placement::Before(_) = placement {
            self.cache.insert((input, target, block), node);
        }
        self.inserted += 1;
        Ok(node)
    }

    /// Constants convert at compile time when the value fits
    fn constant(&mut self, graph: &mut Graph, input: NodeId, value: ConstantValue, target: Repr) -> Option<NodeId> {
        if let Some(&node) = self.constants.get(&(input, target)) {
            return Some(node);
        }
        let fits = match target {
            Repr::Tagged => true,
            Repr::Float64 => value.as_number().is_some(),
            Repr::Int32 => value.as_number().and_then(crate::runtime::as_int32).is_some(),
            Repr::Bool => true,
            Repr::None => false,
        };
        if !fits {
            return None;
        }
        let value = if target == Repr::Bool {
            ConstantValue::Boolean(truthiness(&value))
        } else {
            value
        };
        let entry = graph.entry;
        let node = graph.append(entry, Op::Constant(value), vec![], target);
        self.constants.insert((input, target), node);
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::BinaryOp;
    use crate::jit::ir::{DeoptPoint, FrameState, StateValue};

    fn point(graph: &mut Graph) -> crate::jit::ir::DeoptId {
        graph.add_deopt_point(DeoptPoint {
            frames: vec![FrameState {
                function: 0,
                pc: 0,
                locals: vec![],
                stack: vec![],
                this: StateValue::Node(NodeId(0)),
                construct: false,
            }],
            virtual_objects: vec![],
        })
    }

    #[test]
    fn test_tagged_parameter_feeding_int32_add_is_checked() {
        let mut graph = Graph::new();
        let entry = graph.entry;
        let param = graph.append(entry, Op::Parameter(0), vec![], Repr::Tagged);
        let one = graph.append(entry, Op::Constant(ConstantValue::Number(1.0)), vec![], Repr::Int32);
        let add = graph.append(entry, Op::Int32Binary(BinaryOp::Add), vec![param, one], Repr::Int32);
        let eager = point(&mut graph);
        graph.node_mut(add).eager = Some(eager);
        graph.block_mut(entry).terminator = Terminator::Return(add);

        select_representations(&mut graph).unwrap();

        let checked = graph.node(add).inputs[0];
        assert_eq!(graph.node(checked).op, Op::CheckedTaggedToInt32);
        assert_eq!(graph.node(checked).eager, Some(eager));
        assert_eq!(graph.node(add).inputs[1], one);
        let Terminator::Return(value) = graph.block(entry).terminator else {
            panic!("expected a return");
        };
        assert_eq!(graph.node(value).op, Op::ChangeInt32ToTagged);
    }

    #[test]
    fn test_phi_of_int32_and_float64_widens() {
        let mut graph = Graph::new();
        let entry = graph.entry;
        let left = graph.add_block();
        let right = graph.add_block();
        let join_block = graph.add_block();
        let cond = graph.append(entry, Op::Parameter(0), vec![], Repr::Tagged);
        graph.block_mut(entry).terminator = Terminator::Branch {
            cond,
            if_true: left,
            if_false: right,
        };
        let int = graph.append(left, Op::Constant(ConstantValue::Number(1.0)), vec![], Repr::Int32);
        let float = graph.append(right, Op::Constant(ConstantValue::Number(1.5)), vec![], Repr::Float64);
        for block in [left, right] {
            graph.block_mut(block).preds.push(entry);
            graph.block_mut(block).terminator = Terminator::Goto(join_block);
            graph.block_mut(join_block).preds.push(block);
        }
        let phi = graph.add_phi(join_block, vec![int, float]);
        graph.block_mut(join_block).terminator = Terminator::Return(phi);

        select_representations(&mut graph).unwrap();

        assert_eq!(graph.node(phi).repr, Repr::Float64);
        let widened = graph.node(phi).inputs[0];
        assert_eq!(graph.node(widened).op, Op::Constant(ConstantValue::Number(1.0)));
        assert_eq!(graph.node(widened).repr, Repr::Float64);
        let Terminator::Branch { cond: converted, .. } = graph.block(entry).terminator else {
            panic!("expected a branch");
        };
        assert_eq!(graph.node(converted).op, Op::ToBoolean);
    }

    #[test]
    fn test_checked_conversion_needs_a_deopt_point() {
        let mut graph = Graph::new();
        let entry = graph.entry;
        let param = graph.append(entry, Op::Parameter(0), vec![], Repr::Tagged);
        let negate = graph.append(entry, Op::Int32Unary(crate::runtime::UnaryOp::Negate), vec![param], Repr::Int32);
        graph.block_mut(entry).terminator = Terminator::Return(negate);
        assert!(matches!(
            select_representations(&mut graph),
            Err(CompileError::Unsupported(_))
        ));
    }

    #[test]
    fn test_conversions_are_shared_within_a_block() {
        let mut graph = Graph::new();
        let entry = graph.entry;
        let param = graph.append(entry, Op::Parameter(0), vec![], Repr::Tagged);
        let eager = point(&mut graph);
        let a = graph.append(entry, Op::Float64Binary(BinaryOp::Mul), vec![param, param], Repr::Float64);
        graph.node_mut(a).eager = Some(eager);
        let b = graph.append(entry, Op::Float64Binary(BinaryOp::Add), vec![a, param], Repr::Float64);
        graph.node_mut(b).eager = Some(eager);
        graph.block_mut(entry).terminator = Terminator::Return(b);

        let inserted = select_representations(&mut graph).unwrap();
        // one CheckedTaggedToFloat64 for the parameter, one ChangeFloat64ToTagged for the return
        assert_eq!(inserted, 2);
        assert_eq!(graph.node(a).inputs[0], graph.node(b).inputs[1]);
    }
}
