//! Value conversions, operators and property access
//!
//! These are the generic semantics every tier falls back to. None of the
//! conversions here call into script code: objects convert to strings
//! structurally, so only property getters and calls can run user code.

use super::agent::Agent;
use super::object::ObjectKind;
use super::shape::PropertyKind;
use super::value::{number_to_string, string_to_number, to_int32, to_uint32, ObjectRef, Value};
use super::{Completion, Name};
use crate::bytecode::{BinaryOp, CompareOp};
use std::cmp::Ordering;
use std::rc::Rc;

/// Unary numeric operations with a feedback slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Negate,
    BitNot,
    ToNumeric,
    Increment,
    Decrement,
}

/// Result of looking a name up along a prototype chain
#[derive(Debug, Clone)]
pub enum PropertyLookup {
    Data(Value),
    Getter(Value),
    ArrayLength(usize),
    Missing,
}

/// Array index denoted by a property key, if any
pub fn array_index(key: &Value) -> Option<usize> {
    match key {
        Value::Number(n) if *n >= 0.0 && n.fract() == 0.0 && *n < u32::MAX as f64 => Some(*n as usize),
        Value::String(s) => {
            let index: u32 = s.parse().ok()?;
            (index.to_string() == **s && index != u32::MAX).then_some(index as usize)
        }
        _ => None,
    }
}

/// Largest index a keyed store may grow an array to
const MAX_DENSE_GROWTH: usize = 1 << 20;

impl Agent {
    // ========== Conversions ==========

    pub fn to_number(&self, value: &Value) -> f64 {
        match value {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Boolean(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Number(n) => *n,
            Value::String(s) => string_to_number(s),
            Value::Object(_) => string_to_number(&self.to_string(value)),
        }
    }

    pub fn to_string(&self, value: &Value) -> Rc<str> {
        match value {
            Value::String(s) => s.clone(),
            Value::Undefined => Rc::from("undefined"),
            Value::Null => Rc::from("null"),
            Value::Boolean(b) => Rc::from(if *b { "true" } else { "false" }),
            Value::Number(n) => Rc::from(number_to_string(*n)),
            Value::Object(object) => Rc::from(self.object_to_string(object, 0)),
        }
    }

    fn object_to_string(&self, object: &ObjectRef, depth: usize) -> String {
        let Ok(borrowed) = object.try_borrow() else {
            return String::new();
        };
        match &borrowed.kind {
            ObjectKind::Array(elements) => {
                if depth > 8 {
                    return String::new();
                }
                elements
                    .iter()
                    .map(|element| match element {
                        Value::Undefined | Value::Null => String::new(),
                        Value::Object(inner) => self.object_to_string(inner, depth + 1),
                        other => self.to_string(other).to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(",")
            }
            ObjectKind::Function(id) => {
                let name = self.functions.get(*id).map(|r| r.name().to_string()).unwrap_or_default();
                format!("function {}() {{ [bytecode] }}", name)
            }
            ObjectKind::Native(id) => {
                let name = self.native(*id).map(|n| n.name.as_str()).unwrap_or("");
                format!("function {}() {{ [native code] }}", name)
            }
            ObjectKind::Generator(_) => "[object Generator]".to_string(),
            ObjectKind::Ordinary => {
                let names = self.interner.names;
                match self.get_data_property(object, names.message) {
                    Some(message) => {
                        let name = self
                            .get_data_property(object, names.name)
                            .map(|n| self.to_string(&n).to_string())
                            .unwrap_or_else(|| "Error".to_string());
                        let message = self.to_string(&message);
                        if message.is_empty() {
                            name
                        } else {
                            format!("{}: {}", name, message)
                        }
                    }
                    None => "[object Object]".to_string(),
                }
            }
        }
    }

    /// String form used by `print` and for uncaught exceptions
    pub fn to_display_string(&self, value: &Value) -> String {
        match value {
            Value::Object(object) if object.borrow().is_array() => format!("[{}]", self.to_string(value)),
            other => self.to_string(other).to_string(),
        }
    }

    pub fn to_property_key(&mut self, key: &Value) -> Name {
        let text = self.to_string(key);
        self.interner.intern(&text)
    }

    // ========== Operators ==========

    pub fn binary(&self, op: BinaryOp, lhs: &Value, rhs: &Value) -> Value {
        if op == BinaryOp::Add {
            let stringy = |v: &Value| matches!(v, Value::String(_) | Value::Object(_));
            if stringy(lhs) || stringy(rhs) {
                let mut text = self.to_string(lhs).to_string();
                text.push_str(&self.to_string(rhs));
                return Value::String(Rc::from(text));
            }
        }
        let a = self.to_number(lhs);
        let b = self.to_number(rhs);
        Value::Number(arithmetic(op, a, b))
    }

    pub fn unary(&self, op: UnaryOp, operand: &Value) -> Value {
        let n = self.to_number(operand);
        Value::Number(match op {
            UnaryOp::Negate => -n,
            UnaryOp::BitNot => !to_int32(n) as f64,
            UnaryOp::ToNumeric => n,
            UnaryOp::Increment => n + 1.0,
            UnaryOp::Decrement => n - 1.0,
        })
    }

    pub fn compare(&self, op: CompareOp, lhs: &Value, rhs: &Value) -> bool {
        match op {
            CompareOp::StrictEq => lhs.strict_equals(rhs),
            CompareOp::StrictNe => !lhs.strict_equals(rhs),
            CompareOp::Eq => self.loose_equals(lhs, rhs),
            CompareOp::Ne => !self.loose_equals(lhs, rhs),
            CompareOp::Lt => self.relational(lhs, rhs) == Some(Ordering::Less),
            CompareOp::Gt => self.relational(lhs, rhs) == Some(Ordering::Greater),
            CompareOp::Le => matches!(self.relational(lhs, rhs), Some(Ordering::Less | Ordering::Equal)),
            CompareOp::Ge => matches!(self.relational(lhs, rhs), Some(Ordering::Greater | Ordering::Equal)),
        }
    }

    fn relational(&self, lhs: &Value, rhs: &Value) -> Option<Ordering> {
        let lhs = self.to_primitive(lhs);
        let rhs = self.to_primitive(rhs);
        if let (Value::String(a), Value::String(b)) = (&lhs, &rhs) {
            return Some(a.cmp(b));
        }
        self.to_number(&lhs).partial_cmp(&self.to_number(&rhs))
    }

    fn to_primitive(&self, value: &Value) -> Value {
        match value {
            Value::Object(_) => Value::String(self.to_string(value)),
            other => other.clone(),
        }
    }

    pub fn loose_equals(&self, lhs: &Value, rhs: &Value) -> bool {
        match (lhs, rhs) {
            (Value::Undefined | Value::Null, Value::Undefined | Value::Null) => true,
            (Value::Undefined | Value::Null, _) | (_, Value::Undefined | Value::Null) => false,
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Object(_), _) => self.loose_equals(&self.to_primitive(lhs), rhs),
            (_, Value::Object(_)) => self.loose_equals(lhs, &self.to_primitive(rhs)),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            _ => self.to_number(lhs) == self.to_number(rhs),
        }
    }

    pub fn type_of(&self, value: &Value) -> Value {
        Value::string(value.type_of())
    }

    // ========== Property Lookup ==========

    /// Walk the prototype chain of `object` for `name`
    pub fn lookup_property(&self, object: &ObjectRef, name: Name) -> PropertyLookup {
        let mut current = object.clone();
        loop {
            let next = {
                let borrowed = current.borrow();
                if name == self.interner.names.length {
                    if let ObjectKind::Array(elements) = &borrowed.kind {
                        return PropertyLookup::ArrayLength(elements.len());
                    }
                }
                match self.shapes.lookup(borrowed.shape, name) {
                    Some((slot, PropertyKind::Data)) => {
                        return PropertyLookup::Data(borrowed.slots[slot as usize].clone())
                    }
                    Some((slot, PropertyKind::Getter)) => {
                        return PropertyLookup::Getter(borrowed.slots[slot as usize].clone())
                    }
                    None => self.shapes.proto(borrowed.shape),
                }
            };
            match next {
                Some(proto) => current = proto,
                None => return PropertyLookup::Missing,
            }
        }
    }

    /// Data property value along the chain, ignoring accessors
    pub fn get_data_property(&self, object: &ObjectRef, name: Name) -> Option<Value> {
        match self.lookup_property(object, name) {
            PropertyLookup::Data(value) => Some(value),
            PropertyLookup::ArrayLength(len) => Some(Value::Number(len as f64)),
            _ => None,
        }
    }

    // ========== Property Access ==========

    /// `receiver.name`, invoking getters
    pub fn get_property(&mut self, receiver: &Value, name: Name) -> Completion<Value> {
        match receiver {
            Value::Object(object) => match self.lookup_property(object, name) {
                PropertyLookup::Data(value) => Ok(value),
                PropertyLookup::ArrayLength(len) => Ok(Value::Number(len as f64)),
                PropertyLookup::Getter(getter) => self.call(&getter, receiver.clone(), &[]),
                PropertyLookup::Missing => Ok(Value::Undefined),
            },
            Value::String(s) if name == self.interner.names.length => {
                Ok(Value::Number(s.encode_utf16().count() as f64))
            }
            Value::Undefined | Value::Null => {
                let message = format!(
                    "Cannot read properties of {} (reading '{}')",
                    self.to_string(receiver),
                    self.interner.resolve(name)
                );
                Err(self.type_error(message))
            }
            _ => Ok(Value::Undefined),
        }
    }

    /// `receiver[key]`
    pub fn get_keyed(&mut self, receiver: &Value, key: &Value) -> Completion<Value> {
        if let Some(index) = array_index(key) {
            match receiver {
                Value::Object(object) => {
                    if let Some(elements) = object.borrow().elements() {
                        return Ok(elements.get(index).cloned().unwrap_or_default());
                    }
                }
                Value::String(s) => {
                    let unit = s.encode_utf16().nth(index);
                    return Ok(unit
                        .map(|u| Value::String(Rc::from(String::from_utf16_lossy(&[u]))))
                        .unwrap_or_default());
                }
                _ => {}
            }
        }
        let name = self.to_property_key(key);
        self.get_property(receiver, name)
    }

    /// `target.name = value`
    pub fn set_property(&mut self, target: &Value, name: Name, value: Value) -> Completion<()> {
        let object = match target {
            Value::Object(object) => object,
            Value::Undefined | Value::Null => {
                let message = format!(
                    "Cannot set properties of {} (setting '{}')",
                    self.to_string(target),
                    self.interner.resolve(name)
                );
                return Err(self.type_error(message));
            }
            _ => return Ok(()),
        };
        if name == self.interner.names.length && object.borrow().is_array() {
            let length = self.to_number(&value);
            if length < 0.0 || length.fract() != 0.0 || length > u32::MAX as f64 {
                return Err(self.range_error("Invalid array length"));
            }
            if let Some(elements) = object.borrow_mut().elements_mut() {
                elements.resize(length as usize, Value::Undefined);
            }
            return Ok(());
        }
        let shape = object.borrow().shape;
        match self.shapes.lookup(shape, name) {
            Some((slot, PropertyKind::Data)) => object.borrow_mut().store_slot(slot, value),
            // accessors without setters ignore the store
            Some((_, PropertyKind::Getter)) => {}
            None => {
                if matches!(self.lookup_property(object, name), PropertyLookup::Getter(_)) {
                    return Ok(());
                }
                let next = self.shapes.transition(shape, name, PropertyKind::Data);
                object.borrow_mut().add_slot(next, value);
            }
        }
        Ok(())
    }

    /// `target[key] = value`
    pub fn set_keyed(&mut self, target: &Value, key: &Value, value: Value) -> Completion<()> {
        if let (Value::Object(object), Some(index)) = (target, array_index(key)) {
            let mut borrowed = object.borrow_mut();
            if let Some(elements) = borrowed.elements_mut() {
                if index < elements.len() {
                    elements[index] = value;
                    return Ok(());
                }
                if index <= elements.len() + MAX_DENSE_GROWTH {
                    elements.resize(index, Value::Undefined);
                    elements.push(value);
                    return Ok(());
                }
            }
        }
        let name = self.to_property_key(key);
        self.set_property(target, name, value)
    }

    /// Define or overwrite an own data property
    pub fn define_own_property(&mut self, object: &ObjectRef, name: Name, value: Value) {
        let shape = object.borrow().shape;
        match self.shapes.lookup(shape, name) {
            Some((slot, _)) => object.borrow_mut().store_slot(slot, value),
            None => {
                let next = self.shapes.transition(shape, name, PropertyKind::Data);
                object.borrow_mut().add_slot(next, value);
            }
        }
    }

    /// Define an own accessor with only a getter
    pub fn define_getter(&mut self, object: &ObjectRef, name: Name, getter: Value) {
        let shape = object.borrow().shape;
        match self.shapes.lookup(shape, name) {
            Some((slot, _)) => object.borrow_mut().store_slot(slot, getter),
            None => {
                let next = self.shapes.transition(shape, name, PropertyKind::Getter);
                object.borrow_mut().add_slot(next, getter);
            }
        }
    }
}

/// Numeric semantics of the binary operators
pub fn arithmetic(op: BinaryOp, a: f64, b: f64) -> f64 {
    match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::Mod => a % b,
        BinaryOp::BitAnd => (to_int32(a) & to_int32(b)) as f64,
        BinaryOp::BitOr => (to_int32(a) | to_int32(b)) as f64,
        BinaryOp::BitXor => (to_int32(a) ^ to_int32(b)) as f64,
        BinaryOp::Shl => to_int32(a).wrapping_shl(to_uint32(b) & 31) as f64,
        BinaryOp::Shr => (to_int32(a) >> (to_uint32(b) & 31)) as f64,
        BinaryOp::UShr => (to_uint32(a) >> (to_uint32(b) & 31)) as f64,
    }
}
