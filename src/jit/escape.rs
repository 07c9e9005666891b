//! Escape analysis and scalar replacement
//!
//! An `Allocate` whose only uses are field stores into it, field loads
//! from it, shape checks on it and deopt states never needs to exist:
//! loads are forwarded to the stored values and every deopt state that
//! mentions the object describes it as a [`VirtualObject`] instead, to be
//! materialized by the deoptimizer.
//!
//! Field values are tracked in program order along single-predecessor
//! edges; a merge only keeps objects whose fields agree on every incoming
//! path. Anything the analysis cannot follow makes the object real again.

use super::ir::{BlockId, DeoptId, Graph, NodeId, Op, StateValue, Terminator, VirtualObject};
use super::passes::{OptimizationPass, OptimizationResult};
use crate::runtime::ShapeId;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};

pub struct EscapeAnalysis;

#[derive(Debug, Clone, PartialEq)]
struct ObjectState {
    shape: ShapeId,
    fields: Vec<NodeId>,
}

type State = HashMap<NodeId, ObjectState>;

/// Field states of the objects a deopt point mentions
type Snapshot = HashMap<NodeId, ObjectState>;

struct Simulation {
    failed: HashSet<NodeId>,
    snapshots: HashMap<DeoptId, Snapshot>,
    loads: HashMap<NodeId, NodeId>,
    removable: HashSet<NodeId>,
}

impl EscapeAnalysis {
    /// Allocations whose uses all stay within the analysis
    fn non_escaping(graph: &Graph, mut candidates: HashSet<NodeId>) -> HashSet<NodeId> {
        loop {
            let mut escaping = HashSet::default();
            for node in graph.live_nodes() {
                let n = graph.node(node);
                for (index, input) in n.inputs.iter().enumerate() {
                    if !candidates.contains(input) {
                        continue;
                    }
                    let contained = match n.op {
                        Op::LoadField(_) | Op::CheckShape(_) => index == 0,
                        Op::StoreField { .. } => index == 0 || candidates.contains(&n.inputs[0]),
                        _ => false,
                    };
                    if !contained {
                        escaping.insert(*input);
                    }
                }
            }
            for block in &graph.blocks {
                if let Some(operand) = block.terminator.operand() {
                    if candidates.contains(&operand) {
                        escaping.insert(operand);
                    }
                }
            }
            if escaping.is_empty() {
                return candidates;
            }
            candidates.retain(|node| !escaping.contains(node));
        }
    }

    fn simulate(graph: &Graph, candidates: &HashSet<NodeId>) -> Simulation {
        let mut sim = Simulation {
            failed: HashSet::default(),
            snapshots: HashMap::default(),
            loads: HashMap::default(),
            removable: HashSet::default(),
        };
        let mut exits: HashMap<BlockId, State> = HashMap::default();
        for block in graph.reverse_postorder() {
            let mut state = Self::entry_state(graph, block, &exits, &mut sim);
            for &node in &graph.block(block).nodes {
                let n = graph.node(node);
                for point in [n.eager, n.lazy].into_iter().flatten() {
                    Self::snapshot(graph, point, &state, candidates, &mut sim);
                }
                match &n.op {
                    Op::Allocate(shape) if candidates.contains(&node) => {
                        state.insert(
                            node,
                            ObjectState {
                                shape: *shape,
                                fields: Vec::new(),
                            },
                        );
                        sim.removable.insert(node);
                    }
                    Op::StoreField { slot, transition } if candidates.contains(&n.inputs[0]) => {
                        let object = n.inputs[0];
                        let Some(object_state) = state.get_mut(&object) else {
                            sim.failed.insert(object);
                            continue;
                        };
                        let slot = *slot as usize;
                        if slot < object_state.fields.len() {
                            object_state.fields[slot] = n.inputs[1];
                        } else if slot == object_state.fields.len() {
                            object_state.fields.push(n.inputs[1]);
                        } else {
                            sim.failed.insert(object);
                            continue;
                        }
                        if let Some(shape) = transition {
                            object_state.shape = *shape;
                        }
                        sim.removable.insert(node);
                    }
                    Op::LoadField(slot) if candidates.contains(&n.inputs[0]) => {
                        let object = n.inputs[0];
                        match state.get(&object).and_then(|o| o.fields.get(*slot as usize)) {
                            Some(&value) => {
                                sim.loads.insert(node, value);
                            }
                            None => {
                                sim.failed.insert(object);
                            }
                        }
                    }
                    Op::CheckShape(shapes) if candidates.contains(&n.inputs[0]) => {
                        let object = n.inputs[0];
                        match state.get(&object) {
                            Some(o) if shapes.contains(&o.shape) => {
                                sim.removable.insert(node);
                            }
                            // a check that always fails keeps the object real
                            _ => {
                                sim.failed.insert(object);
                            }
                        }
                    }
                    _ => {}
                }
            }
            if let Terminator::Deopt { point, .. } = graph.block(block).terminator {
                Self::snapshot(graph, point, &state, candidates, &mut sim);
            }
            exits.insert(block, state);
        }
        sim
    }

    fn entry_state(graph: &Graph, block: BlockId, exits: &HashMap<BlockId, State>, sim: &mut Simulation) -> State {
        let preds = &graph.block(block).preds;
        match preds.as_slice() {
            [] => State::default(),
            [pred] => match exits.get(pred) {
                Some(state) => state.clone(),
                None => State::default(),
            },
            _ => {
                let states: Vec<Option<&State>> = preds.iter().map(|pred| exits.get(pred)).collect();
                let mut merged = State::default();
                let mut seen: HashSet<NodeId> = HashSet::default();
                for state in states.iter().flatten() {
                    seen.extend(state.keys().copied());
                }
                for object in seen {
                    let mut agreed: Option<&ObjectState> = None;
                    let mut consistent = true;
                    for state in &states {
                        // unvisited back-edges carry unknown state
                        match state.and_then(|s| s.get(&object)) {
                            Some(o) if agreed.map_or(true, |a| a == o) => agreed = Some(o),
                            _ => {
                                consistent = false;
                                break;
                            }
                        }
                    }
                    match (consistent, agreed) {
                        (true, Some(o)) => {
                            merged.insert(object, o.clone());
                        }
                        _ => {
                            sim.failed.insert(object);
                        }
                    }
                }
                merged
            }
        }
    }

    /// Record the states of every object `point` mentions, directly or
    /// through another object's fields
    fn snapshot(graph: &Graph, point: DeoptId, state: &State, candidates: &HashSet<NodeId>, sim: &mut Simulation) {
        let mut snapshot = Snapshot::default();
        let mut pending: Vec<NodeId> = graph
            .deopt_point(point)
            .nodes()
            .into_iter()
            .filter(|node| candidates.contains(node))
            .collect();
        while let Some(object) = pending.pop() {
            if snapshot.contains_key(&object) {
                continue;
            }
            match state.get(&object) {
                Some(o) => {
                    pending.extend(o.fields.iter().filter(|field| candidates.contains(field)).copied());
                    snapshot.insert(object, o.clone());
                }
                None => {
                    sim.failed.insert(object);
                }
            }
        }
        match sim.snapshots.get(&point) {
            Some(previous) => {
                for (object, o) in &snapshot {
                    if previous.get(object).is_some_and(|p| p != o) {
                        sim.failed.insert(*object);
                    }
                }
            }
            None => {
                sim.snapshots.insert(point, snapshot);
            }
        }
    }

    /// Rewrite a point's node references to virtual objects
    fn virtualize(graph: &mut Graph, point: DeoptId, snapshot: &Snapshot) -> bool {
        if snapshot.is_empty() {
            return false;
        }
        let mut indices: HashMap<NodeId, u32> = HashMap::default();
        let mut objects: Vec<VirtualObject> = Vec::new();
        // assign indices first so fields can refer to any object
        let mut order: Vec<NodeId> = snapshot.keys().copied().collect();
        order.sort();
        for object in &order {
            indices.insert(*object, objects.len() as u32);
            objects.push(VirtualObject {
                shape: snapshot[object].shape,
                fields: Vec::new(),
            });
        }
        let to_state = |node: NodeId| match indices.get(&node) {
            Some(&index) => StateValue::Virtual(index),
            None => StateValue::Node(node),
        };
        for object in &order {
            let index = indices[object] as usize;
            objects[index].fields = snapshot[object].fields.iter().map(|&field| to_state(field)).collect();
        }
        let deopt = graph.deopt_point_mut(point);
        for frame in &mut deopt.frames {
            for value in frame.locals.iter_mut().chain(frame.stack.iter_mut()).chain(std::iter::once(&mut frame.this)) {
                if let StateValue::Node(node) = *value {
                    *value = to_state(node);
                }
            }
        }
        deopt.virtual_objects = objects;
        true
    }
}

impl OptimizationPass for EscapeAnalysis {
    fn name(&self) -> &str {
        "EscapeAnalysis"
    }

    fn run(&self, graph: &mut Graph) -> OptimizationResult {
        let allocations: HashSet<NodeId> = graph
            .live_nodes()
            .filter(|&node| matches!(graph.node(node).op, Op::Allocate(_)))
            .collect();
        let mut candidates = Self::non_escaping(graph, allocations);
        let sim = loop {
            if candidates.is_empty() {
                return OptimizationResult::none();
            }
            let sim = Self::simulate(graph, &candidates);
            if sim.failed.is_empty() {
                break sim;
            }
            candidates.retain(|node| !sim.failed.contains(node));
            candidates = Self::non_escaping(graph, candidates);
        };

        let mut modified = 0;
        for (&point, snapshot) in &sim.snapshots {
            if Self::virtualize(graph, point, snapshot) {
                modified += 1;
            }
        }
        graph.apply_replacements(&sim.loads);
        for block in &mut graph.blocks {
            block.nodes.retain(|node| !sim.removable.contains(node));
        }
        tracing::debug!(
            virtualized = candidates.len(),
            forwarded_loads = sim.loads.len(),
            "escape analysis"
        );
        OptimizationResult {
            instructions_modified: modified,
            instructions_removed: sim.removable.len() + sim.loads.len(),
            instructions_added: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::{ConstantValue, DeoptPoint, FrameState, Repr};

    fn state_point(graph: &mut Graph, locals: Vec<NodeId>) -> DeoptId {
        let this = locals[0];
        graph.add_deopt_point(DeoptPoint {
            frames: vec![FrameState {
                function: 0,
                pc: 3,
                locals: locals.into_iter().map(StateValue::Node).collect(),
                stack: vec![],
                this: StateValue::Node(this),
                construct: false,
            }],
            virtual_objects: vec![],
        })
    }

    #[test]
    fn test_local_object_is_scalar_replaced() {
        let mut graph = Graph::new();
        let entry = graph.entry;
        let param = graph.append(entry, Op::Parameter(0), vec![], Repr::Tagged);
        let object = graph.append(entry, Op::Allocate(ShapeId(1)), vec![], Repr::Tagged);
        graph.append(
            entry,
            Op::StoreField {
                slot: 0,
                transition: Some(ShapeId(2)),
            },
            vec![object, param],
            Repr::None,
        );
        let point = state_point(&mut graph, vec![param, object]);
        let check = graph.append(entry, Op::CheckArray, vec![param], Repr::None);
        graph.node_mut(check).eager = Some(point);
        let load = graph.append(entry, Op::LoadField(0), vec![object], Repr::Tagged);
        graph.block_mut(entry).terminator = Terminator::Return(load);

        let result = EscapeAnalysis.run(&mut graph);

        assert_eq!(result.instructions_modified, 1);
        assert_eq!(graph.block(entry).terminator, Terminator::Return(param));
        assert_eq!(graph.block(entry).nodes, vec![param, check]);
        let deopt = graph.deopt_point(point);
        assert_eq!(deopt.frames[0].locals[1], StateValue::Virtual(0));
        assert_eq!(
            deopt.virtual_objects,
            vec![VirtualObject {
                shape: ShapeId(2),
                fields: vec![StateValue::Node(param)],
            }]
        );
    }

    #[test]
    fn test_returned_object_escapes() {
        let mut graph = Graph::new();
        let entry = graph.entry;
        let object = graph.append(entry, Op::Allocate(ShapeId(1)), vec![], Repr::Tagged);
        graph.block_mut(entry).terminator = Terminator::Return(object);
        assert_eq!(EscapeAnalysis.run(&mut graph), OptimizationResult::none());
        assert_eq!(graph.block(entry).nodes, vec![object]);
    }

    #[test]
    fn test_object_stored_into_escaping_object_escapes() {
        let mut graph = Graph::new();
        let entry = graph.entry;
        let outer = graph.append(entry, Op::Allocate(ShapeId(1)), vec![], Repr::Tagged);
        let inner = graph.append(entry, Op::Allocate(ShapeId(1)), vec![], Repr::Tagged);
        graph.append(
            entry,
            Op::StoreField {
                slot: 0,
                transition: Some(ShapeId(2)),
            },
            vec![outer, inner],
            Repr::None,
        );
        graph.block_mut(entry).terminator = Terminator::Return(outer);
        EscapeAnalysis.run(&mut graph);
        assert!(graph.block(entry).nodes.contains(&inner));
    }

    #[test]
    fn test_nested_virtual_objects_share_a_point() {
        let mut graph = Graph::new();
        let entry = graph.entry;
        let one = graph.append(entry, Op::Constant(ConstantValue::Number(1.0)), vec![], Repr::Tagged);
        let outer = graph.append(entry, Op::Allocate(ShapeId(1)), vec![], Repr::Tagged);
        let inner = graph.append(entry, Op::Allocate(ShapeId(1)), vec![], Repr::Tagged);
        graph.append(
            entry,
            Op::StoreField {
                slot: 0,
                transition: Some(ShapeId(2)),
            },
            vec![inner, one],
            Repr::None,
        );
        graph.append(
            entry,
            Op::StoreField {
                slot: 0,
                transition: Some(ShapeId(3)),
            },
            vec![outer, inner],
            Repr::None,
        );
        let point = state_point(&mut graph, vec![one, outer]);
        graph.block_mut(entry).terminator = Terminator::Deopt {
            point,
            reason: crate::deopt::DeoptReason::ForcedByDirective,
        };

        EscapeAnalysis.run(&mut graph);

        assert_eq!(graph.block(entry).nodes, vec![one]);
        let deopt = graph.deopt_point(point);
        assert_eq!(deopt.virtual_objects.len(), 2);
        let StateValue::Virtual(index) = deopt.frames[0].locals[1] else {
            panic!("outer object should be virtual");
        };
        let outer_object = &deopt.virtual_objects[index as usize];
        assert_eq!(outer_object.shape, ShapeId(3));
        assert!(matches!(outer_object.fields[0], StateValue::Virtual(_)));
    }
}
