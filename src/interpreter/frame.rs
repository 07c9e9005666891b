//! Interpreter activation records
//!
//! The baseline tier uses the same layout, so a frame can move between
//! the two tiers at any instruction boundary.

use crate::runtime::{FunctionId, SharedFunctionInfo, Value};
use std::rc::Rc;

/// An installed exception handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handler {
    /// Bytecode offset of the catch code
    pub target: u32,
    /// Operand stack height when the handler was installed
    pub stack_depth: usize,
}

/// One interpreted or baseline activation
#[derive(Debug, Clone)]
pub struct Frame {
    pub function: FunctionId,
    pub shared: Rc<SharedFunctionInfo>,
    /// Offset of the next instruction
    pub pc: usize,
    /// Parameters first, then declared locals and temporaries
    pub locals: Vec<Value>,
    pub stack: Vec<Value>,
    pub this: Value,
    pub handlers: Vec<Handler>,
    /// Called with `new`: a non-object return value yields `this`
    pub construct: bool,
}

impl Frame {
    pub fn new(
        function: FunctionId,
        shared: Rc<SharedFunctionInfo>,
        this: Value,
        args: &[Value],
        construct: bool,
    ) -> Self {
        let chunk = &shared.chunk;
        let mut locals = vec![Value::Undefined; chunk.local_count.max(chunk.param_count) as usize];
        for (local, arg) in locals.iter_mut().zip(args.iter().take(chunk.param_count as usize)) {
            *local = arg.clone();
        }
        Self {
            function,
            shared,
            pc: 0,
            locals,
            stack: Vec::with_capacity(8),
            this,
            handlers: Vec::new(),
            construct,
        }
    }

    #[inline]
    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    pub fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or_default()
    }

    #[inline]
    pub fn peek(&self, depth: usize) -> Value {
        self.stack
            .len()
            .checked_sub(depth + 1)
            .and_then(|index| self.stack.get(index))
            .cloned()
            .unwrap_or_default()
    }

    /// Pop the top `count` values in push order
    pub fn pop_n(&mut self, count: usize) -> Vec<Value> {
        let at = self.stack.len().saturating_sub(count);
        self.stack.split_off(at)
    }

    pub fn local(&self, slot: u32) -> Value {
        self.locals.get(slot as usize).cloned().unwrap_or_default()
    }

    pub fn set_local(&mut self, slot: u32, value: Value) {
        if let Some(local) = self.locals.get_mut(slot as usize) {
            *local = value;
        }
    }

    /// Transfer control to the innermost handler; false if there is none
    pub fn unwind(&mut self, exception: Value) -> bool {
        match self.handlers.pop() {
            Some(handler) => {
                self.stack.truncate(handler.stack_depth);
                self.stack.push(exception);
                self.pc = handler.target as usize;
                true
            }
            None => false,
        }
    }

    /// Source line of the instruction at `pc`
    pub fn line(&self) -> u32 {
        self.shared.chunk.get_line(self.pc)
    }

    /// Named locals, without compiler temporaries
    pub fn named_locals(&self) -> Vec<(String, Value)> {
        self.shared
            .chunk
            .local_names
            .iter()
            .zip(self.locals.iter())
            .filter(|(name, _)| !name.starts_with('.'))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}
