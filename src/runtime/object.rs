//! Heap objects
//!
//! Objects are shape + slot vector + kind. The prototype is part of the
//! shape, so it can never change after allocation. An object that some
//! compiled code depends on carries a [`ValidityCell`]; every mutation
//! goes through [`Object::store_slot`] or [`Object::add_slot`], which
//! invalidate that cell.

use super::function::{FunctionId, NativeId};
use super::generator::GeneratorState;
use super::shape::ShapeId;
use super::validity::ValidityCell;
use super::value::Value;

/// What an object is beyond its named properties
pub enum ObjectKind {
    /// Plain object
    Ordinary,
    /// Dense array elements
    Array(Vec<Value>),
    /// Script function closure
    Function(FunctionId),
    /// Host function
    Native(NativeId),
    /// Suspended or finished generator
    Generator(Box<GeneratorState>),
}

/// A heap object
pub struct Object {
    /// Hidden class (also fixes the prototype)
    pub shape: ShapeId,
    /// Property storage in shape slot order
    pub slots: Vec<Value>,
    pub kind: ObjectKind,
    /// Created lazily when compiled code depends on this object's layout
    pub validity: Option<ValidityCell>,
}

impl Object {
    pub fn new(shape: ShapeId, kind: ObjectKind) -> Self {
        Self {
            shape,
            slots: Vec::new(),
            kind,
            validity: None,
        }
    }

    /// The validity cell guarding this object's current layout and contents
    pub fn validity_cell(&mut self) -> ValidityCell {
        self.validity.get_or_insert_with(ValidityCell::new).clone()
    }

    /// Invalidate code depending on this object
    pub fn invalidate(&mut self) {
        if let Some(cell) = self.validity.take() {
            cell.invalidate();
        }
    }

    /// Overwrite an existing slot
    pub fn store_slot(&mut self, slot: u32, value: Value) {
        self.invalidate();
        self.slots[slot as usize] = value;
    }

    /// Append a slot after a shape transition
    pub fn add_slot(&mut self, shape: ShapeId, value: Value) {
        self.invalidate();
        self.shape = shape;
        self.slots.push(value);
    }

    pub fn function_id(&self) -> Option<FunctionId> {
        match self.kind {
            ObjectKind::Function(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, ObjectKind::Array(_))
    }

    pub fn is_callable(&self) -> bool {
        matches!(self.kind, ObjectKind::Function(_) | ObjectKind::Native(_))
    }

    pub fn elements(&self) -> Option<&Vec<Value>> {
        match &self.kind {
            ObjectKind::Array(elements) => Some(elements),
            _ => None,
        }
    }

    pub fn elements_mut(&mut self) -> Option<&mut Vec<Value>> {
        match &mut self.kind {
            ObjectKind::Array(elements) => Some(elements),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::validity::CodeValidity;

    #[test]
    fn test_store_invalidates_dependents() {
        let mut object = Object::new(ShapeId(0), ObjectKind::Ordinary);
        object.slots.push(Value::Number(1.0));
        let code = CodeValidity::new();
        object.validity_cell().register(&code);
        object.store_slot(0, Value::Number(2.0));
        assert!(!code.is_valid());
        // a fresh cell is handed out for the next dependent
        assert!(object.validity.is_none());
        assert!(object.validity_cell().is_valid());
    }
}
