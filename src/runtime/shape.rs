//! Hidden classes
//!
//! Every object points at a [`ShapeId`] describing its property layout.
//! Shapes form a transition tree whose root is chosen per (prototype,
//! object kind), so two objects with the same shape also share a prototype
//! and a kind. Property slots are assigned in insertion order.

use super::intern::Name;
use super::value::ObjectRef;
use rustc_hash::FxHashMap as HashMap;
use std::rc::Rc;

/// Index of a shape in the agent's [`ShapeTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShapeId(pub u32);

/// How a property slot is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyKind {
    /// Slot holds the value
    Data,
    /// Slot holds a getter function
    Getter,
}

/// Structural kind shared by all objects of a shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShapeKind {
    Ordinary,
    Array,
    Function,
    Generator,
}

/// One property of a shape
#[derive(Debug, Clone, Copy)]
pub struct PropertyInfo {
    pub name: Name,
    pub kind: PropertyKind,
}

/// A hidden class
pub struct Shape {
    /// Prototype shared by every object of this shape
    pub proto: Option<ObjectRef>,
    pub kind: ShapeKind,
    /// Properties in slot order
    pub properties: Vec<PropertyInfo>,
    pub parent: Option<ShapeId>,
    lookup: HashMap<Name, u32>,
    transitions: HashMap<(Name, PropertyKind), ShapeId>,
}

impl Shape {
    /// Slot index and kind of an own property
    pub fn lookup(&self, name: Name) -> Option<(u32, PropertyKind)> {
        self.lookup
            .get(&name)
            .map(|&slot| (slot, self.properties[slot as usize].kind))
    }

    /// Number of slots objects of this shape carry
    pub fn slot_count(&self) -> usize {
        self.properties.len()
    }
}

/// Agent-owned table of all shapes
pub struct ShapeTable {
    shapes: Vec<Shape>,
    roots: HashMap<(usize, ShapeKind), ShapeId>,
}

impl ShapeTable {
    pub fn new() -> Self {
        Self {
            shapes: Vec::new(),
            roots: HashMap::default(),
        }
    }

    /// The root shape for objects with the given prototype and kind
    pub fn root(&mut self, proto: Option<&ObjectRef>, kind: ShapeKind) -> ShapeId {
        let key = (proto.map_or(0, |p| Rc::as_ptr(p) as *const () as usize), kind);
        if let Some(&id) = self.roots.get(&key) {
            return id;
        }
        let id = self.push(Shape {
            proto: proto.cloned(),
            kind,
            properties: Vec::new(),
            parent: None,
            lookup: HashMap::default(),
            transitions: HashMap::default(),
        });
        self.roots.insert(key, id);
        id
    }

    fn push(&mut self, shape: Shape) -> ShapeId {
        let id = ShapeId(self.shapes.len() as u32);
        self.shapes.push(shape);
        id
    }

    pub fn get(&self, id: ShapeId) -> &Shape {
        &self.shapes[id.0 as usize]
    }

    /// Own property lookup
    pub fn lookup(&self, id: ShapeId, name: Name) -> Option<(u32, PropertyKind)> {
        self.get(id).lookup(name)
    }

    pub fn proto(&self, id: ShapeId) -> Option<ObjectRef> {
        self.get(id).proto.clone()
    }

    pub fn kind(&self, id: ShapeId) -> ShapeKind {
        self.get(id).kind
    }

    /// Existing transition for adding `name`, without creating one
    pub fn find_transition(&self, id: ShapeId, name: Name, kind: PropertyKind) -> Option<ShapeId> {
        self.get(id).transitions.get(&(name, kind)).copied()
    }

    /// Every transition already taken out of `id`
    pub fn transitions(&self, id: ShapeId) -> impl Iterator<Item = (Name, PropertyKind, ShapeId)> + '_ {
        self.get(id)
            .transitions
            .iter()
            .map(|(&(name, kind), &target)| (name, kind, target))
    }

    /// Shape reached by adding property `name` to `id`
    pub fn transition(&mut self, id: ShapeId, name: Name, kind: PropertyKind) -> ShapeId {
        if let Some(target) = self.find_transition(id, name, kind) {
            return target;
        }
        let parent = self.get(id);
        let mut properties = parent.properties.clone();
        let mut lookup = parent.lookup.clone();
        lookup.insert(name, properties.len() as u32);
        properties.push(PropertyInfo { name, kind });
        let shape = Shape {
            proto: parent.proto.clone(),
            kind: parent.kind,
            properties,
            parent: Some(id),
            lookup,
            transitions: HashMap::default(),
        };
        let target = self.push(shape);
        self.shapes[id.0 as usize].transitions.insert((name, kind), target);
        target
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }
}

impl Default for ShapeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::intern::Interner;

    #[test]
    fn test_transitions_are_shared() {
        let mut interner = Interner::new();
        let x = interner.intern("x");
        let y = interner.intern("y");
        let mut table = ShapeTable::new();
        let root = table.root(None, ShapeKind::Ordinary);
        let a = table.transition(root, x, PropertyKind::Data);
        let b = table.transition(root, x, PropertyKind::Data);
        assert_eq!(a, b);
        let ab = table.transition(a, y, PropertyKind::Data);
        assert_eq!(table.lookup(ab, y), Some((1, PropertyKind::Data)));
        assert_eq!(table.lookup(a, y), None);
        assert_eq!(table.get(ab).parent, Some(a));
    }

    #[test]
    fn test_insertion_order_distinguishes_shapes() {
        let mut interner = Interner::new();
        let x = interner.intern("x");
        let y = interner.intern("y");
        let mut table = ShapeTable::new();
        let root = table.root(None, ShapeKind::Ordinary);
        let rx = table.transition(root, x, PropertyKind::Data);
        let xy = table.transition(rx, y, PropertyKind::Data);
        let ry = table.transition(root, y, PropertyKind::Data);
        let yx = table.transition(ry, x, PropertyKind::Data);
        assert_ne!(xy, yx);
    }

    #[test]
    fn test_roots_per_kind() {
        let mut table = ShapeTable::new();
        let ordinary = table.root(None, ShapeKind::Ordinary);
        let array = table.root(None, ShapeKind::Array);
        assert_ne!(ordinary, array);
        assert_eq!(table.root(None, ShapeKind::Array), array);
    }
}
