//! Type feedback collected during interpretation
//!
//! Every property access, call and arithmetic site owns one
//! [`FeedbackSlot`] in its function's [`FeedbackVector`]. The interpreter
//! and the baseline tier record observations; the optimizing compiler
//! reads an immutable [`FeedbackSnapshot`] taken on the main thread.
//!
//! All observation states only move up their lattice. In particular a
//! megamorphic property site stays megamorphic until the vector is
//! explicitly cleared.

use crate::runtime::{as_int32, FunctionId, ShapeId, Value};
use std::sync::Arc;

/// What a feedback slot observes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    /// Named property load
    Load,
    /// Named property store
    Store,
    /// Computed property load
    KeyedLoad,
    /// Computed property store
    KeyedStore,
    /// Call or construct target
    Call,
    /// Arithmetic, bitwise and unary numeric operators
    Arithmetic,
    /// Relational and equality operators
    Compare,
}

// ==================== Observations ====================

/// Receiver shapes seen at a property site
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ShapeObservation {
    #[default]
    Uninitialized,
    Monomorphic(ShapeId),
    Polymorphic(Vec<ShapeId>),
    Megamorphic,
}

impl ShapeObservation {
    /// Record a receiver; `None` (a primitive receiver) goes megamorphic.
    /// Returns whether the state changed.
    pub fn record(&mut self, shape: Option<ShapeId>, capacity: usize) -> bool {
        let Some(shape) = shape else {
            let changed = !matches!(self, Self::Megamorphic);
            *self = Self::Megamorphic;
            return changed;
        };
        match self {
            Self::Uninitialized => {
                *self = Self::Monomorphic(shape);
                true
            }
            Self::Monomorphic(existing) => {
                if *existing == shape {
                    return false;
                }
                *self = Self::Polymorphic(vec![*existing, shape]);
                true
            }
            Self::Polymorphic(shapes) => {
                if shapes.contains(&shape) {
                    return false;
                }
                if shapes.len() >= capacity {
                    *self = Self::Megamorphic;
                } else {
                    shapes.push(shape);
                }
                true
            }
            Self::Megamorphic => false,
        }
    }

    /// Shapes seen so far (empty when uninitialized or megamorphic)
    pub fn shapes(&self) -> &[ShapeId] {
        match self {
            Self::Monomorphic(shape) => std::slice::from_ref(shape),
            Self::Polymorphic(shapes) => shapes,
            _ => &[],
        }
    }

    pub fn is_megamorphic(&self) -> bool {
        matches!(self, Self::Megamorphic)
    }
}

/// Operand types seen at an arithmetic or compare site, as a lattice:
/// `None < SignedSmall < Number < String < Any`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum OperandHint {
    #[default]
    None,
    /// Int32 values other than -0
    SignedSmall,
    Number,
    String,
    Any,
}

impl OperandHint {
    /// Classify one value
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Number(n) if as_int32(*n).is_some() => OperandHint::SignedSmall,
            Value::Number(_) => OperandHint::Number,
            Value::String(_) => OperandHint::String,
            _ => OperandHint::Any,
        }
    }

    /// Least upper bound
    pub fn join(self, other: Self) -> Self {
        match (self, other) {
            (OperandHint::String, OperandHint::SignedSmall | OperandHint::Number)
            | (OperandHint::SignedSmall | OperandHint::Number, OperandHint::String) => OperandHint::Any,
            _ => self.max(other),
        }
    }

    /// Classify every value of an operation (operands and result)
    pub fn of_all(values: &[&Value]) -> Self {
        values.iter().fold(OperandHint::None, |hint, v| hint.join(Self::of(v)))
    }
}

/// Element access pattern at a keyed site
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ElementHint {
    #[default]
    None,
    /// Array receiver with an in-bounds int32 index
    ArrayInt32Index,
    Any,
}

impl ElementHint {
    pub fn join(self, other: Self) -> Self {
        self.max(other)
    }
}

/// Call targets seen at a call site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallFeedback {
    #[default]
    Uninitialized,
    Monomorphic(FunctionId),
    Megamorphic,
}

impl CallFeedback {
    /// `None` is a host function or a non-callable
    pub fn record(&mut self, target: Option<FunctionId>) -> bool {
        let next = match (*self, target) {
            (CallFeedback::Uninitialized, Some(id)) => CallFeedback::Monomorphic(id),
            (CallFeedback::Monomorphic(existing), Some(id)) if existing == id => return false,
            (CallFeedback::Megamorphic, _) => return false,
            _ => CallFeedback::Megamorphic,
        };
        *self = next;
        true
    }
}

/// One observation handed to [`FeedbackVector::record`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    /// Receiver shape, or `None` for a primitive receiver
    Shape(Option<ShapeId>),
    /// Keyed access pattern
    Element(ElementHint),
    /// Callee, or `None` for a host function
    CallTarget(Option<FunctionId>),
    /// Operand classification
    Operands(OperandHint),
}

/// Observation state of one slot
#[derive(Debug, Clone, PartialEq)]
pub enum SlotState {
    Property {
        shapes: ShapeObservation,
        element: ElementHint,
    },
    Call(CallFeedback),
    Operation(OperandHint),
}

/// One observation site
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackSlot {
    pub kind: SlotKind,
    pub state: SlotState,
    /// Number of recorded executions
    pub hits: u32,
}

impl FeedbackSlot {
    fn new(kind: SlotKind) -> Self {
        let state = match kind {
            SlotKind::Load | SlotKind::Store | SlotKind::KeyedLoad | SlotKind::KeyedStore => SlotState::Property {
                shapes: ShapeObservation::Uninitialized,
                element: ElementHint::None,
            },
            SlotKind::Call => SlotState::Call(CallFeedback::Uninitialized),
            SlotKind::Arithmetic | SlotKind::Compare => SlotState::Operation(OperandHint::None),
        };
        Self { kind, state, hits: 0 }
    }

    pub fn shapes(&self) -> Option<&ShapeObservation> {
        match &self.state {
            SlotState::Property { shapes, .. } => Some(shapes),
            _ => None,
        }
    }

    pub fn element(&self) -> ElementHint {
        match &self.state {
            SlotState::Property { element, .. } => *element,
            _ => ElementHint::None,
        }
    }

    pub fn call(&self) -> CallFeedback {
        match &self.state {
            SlotState::Call(call) => *call,
            _ => CallFeedback::Uninitialized,
        }
    }

    pub fn operands(&self) -> OperandHint {
        match &self.state {
            SlotState::Operation(hint) => *hint,
            _ => OperandHint::None,
        }
    }

    /// Whether the slot has seen at least one execution
    pub fn is_initialized(&self) -> bool {
        self.hits > 0
    }
}

// ==================== Feedback Vector ====================

/// Per-function feedback storage
#[derive(Debug, Clone)]
pub struct FeedbackVector {
    slots: Vec<FeedbackSlot>,
    /// Shapes tracked per site before going megamorphic
    capacity: usize,
}

impl FeedbackVector {
    pub fn new(kinds: &[SlotKind], capacity: usize) -> Self {
        Self {
            slots: kinds.iter().map(|&k| FeedbackSlot::new(k)).collect(),
            capacity,
        }
    }

    /// Record an observation; mismatched observations are ignored
    pub fn record(&mut self, slot: u32, observation: Observation) {
        let capacity = self.capacity;
        let Some(slot) = self.slots.get_mut(slot as usize) else {
            return;
        };
        slot.hits = slot.hits.saturating_add(1);
        match (&mut slot.state, observation) {
            (SlotState::Property { shapes, .. }, Observation::Shape(shape)) => {
                shapes.record(shape, capacity);
            }
            (SlotState::Property { element, .. }, Observation::Element(hint)) => {
                *element = element.join(hint);
            }
            (SlotState::Call(call), Observation::CallTarget(target)) => {
                call.record(target);
            }
            (SlotState::Operation(hint), Observation::Operands(observed)) => {
                *hint = hint.join(observed);
            }
            _ => {}
        }
    }

    pub fn slot(&self, slot: u32) -> Option<&FeedbackSlot> {
        self.slots.get(slot as usize)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Consistent immutable copy for the compiler
    pub fn snapshot(&self) -> FeedbackSnapshot {
        FeedbackSnapshot(Arc::from(self.slots.as_slice()))
    }

    /// Forget every observation
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = FeedbackSlot::new(slot.kind);
        }
    }
}

/// Immutable feedback view; cheap to clone and safe to send to the background compiler
#[derive(Debug, Clone)]
pub struct FeedbackSnapshot(Arc<[FeedbackSlot]>);

impl FeedbackSnapshot {
    pub fn slot(&self, slot: u32) -> Option<&FeedbackSlot> {
        self.0.get(slot as usize)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_observation_degrades_to_megamorphic() {
        let mut vector = FeedbackVector::new(&[SlotKind::Load], 2);
        vector.record(0, Observation::Shape(Some(ShapeId(1))));
        assert_eq!(vector.slot(0).unwrap().shapes(), Some(&ShapeObservation::Monomorphic(ShapeId(1))));
        vector.record(0, Observation::Shape(Some(ShapeId(2))));
        assert_eq!(vector.slot(0).unwrap().shapes().unwrap().shapes(), &[ShapeId(1), ShapeId(2)]);
        vector.record(0, Observation::Shape(Some(ShapeId(3))));
        assert!(vector.slot(0).unwrap().shapes().unwrap().is_megamorphic());
    }

    #[test]
    fn test_megamorphic_is_sticky_until_clear() {
        let mut vector = FeedbackVector::new(&[SlotKind::Load], 4);
        vector.record(0, Observation::Shape(None));
        vector.record(0, Observation::Shape(Some(ShapeId(1))));
        assert!(vector.slot(0).unwrap().shapes().unwrap().is_megamorphic());
        vector.clear();
        vector.record(0, Observation::Shape(Some(ShapeId(1))));
        assert_eq!(vector.slot(0).unwrap().shapes(), Some(&ShapeObservation::Monomorphic(ShapeId(1))));
    }

    #[test]
    fn test_operand_hint_lattice() {
        let int = Value::Number(1.0);
        let float = Value::Number(1.5);
        let minus_zero = Value::Number(-0.0);
        let string = Value::string("a");
        assert_eq!(OperandHint::of_all(&[&int, &int]), OperandHint::SignedSmall);
        assert_eq!(OperandHint::of_all(&[&int, &float]), OperandHint::Number);
        assert_eq!(OperandHint::of(&minus_zero), OperandHint::Number);
        assert_eq!(OperandHint::of_all(&[&string, &string]), OperandHint::String);
        assert_eq!(OperandHint::of_all(&[&string, &int]), OperandHint::Any);
    }

    #[test]
    fn test_call_feedback() {
        let mut call = CallFeedback::default();
        assert!(call.record(Some(FunctionId(3))));
        assert!(!call.record(Some(FunctionId(3))));
        assert!(call.record(Some(FunctionId(4))));
        assert_eq!(call, CallFeedback::Megamorphic);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_records() {
        let mut vector = FeedbackVector::new(&[SlotKind::Arithmetic], 4);
        vector.record(0, Observation::Operands(OperandHint::SignedSmall));
        let snapshot = vector.snapshot();
        vector.record(0, Observation::Operands(OperandHint::Number));
        assert_eq!(snapshot.slot(0).unwrap().operands(), OperandHint::SignedSmall);
        assert_eq!(vector.slot(0).unwrap().operands(), OperandHint::Number);
        assert_eq!(snapshot.slot(0).unwrap().hits, 1);
    }
}
