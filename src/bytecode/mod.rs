//! Bytecode representation and instruction set
//!
//! A [`Chunk`] is the compiled form of one function literal (or of a
//! whole script). Chunks are immutable once built and are `Send`, so
//! the background compiler can read them without touching the heap.

mod compiler;
mod opcode;

pub use compiler::compile_program;
pub use opcode::{BinaryOp, CompareOp, Instruction, Intrinsic, SlotIndex};

use crate::feedback::SlotKind;
use crate::runtime::{Interner, Name};
use std::fmt::Write as _;
use std::sync::Arc;

/// Constant pool entry
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Number(f64),
    String(Arc<str>),
}

/// Strings of one tagged template call site
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateSite {
    pub cooked: Vec<Arc<str>>,
    pub raw: Vec<Arc<str>>,
}

/// A compiled bytecode chunk
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    /// Function name for diagnostics
    pub name: String,
    /// Instructions; the offset of an instruction is its index
    pub code: Vec<Instruction>,
    /// Source line per instruction
    pub lines: Vec<u32>,
    /// Whether the instruction at each offset begins a statement
    pub statement_starts: Vec<bool>,
    /// Constant pool
    pub constants: Vec<Constant>,
    /// Nested function literals
    pub functions: Vec<Arc<Chunk>>,
    /// Local variable names for debugging (parameters first)
    pub local_names: Vec<String>,
    pub param_count: u32,
    pub local_count: u32,
    /// Kind of each feedback slot
    pub slot_kinds: Vec<SlotKind>,
    pub template_sites: Vec<TemplateSite>,
    /// Contains try/catch or try/finally
    pub has_handlers: bool,
    pub is_generator: bool,
    /// Top-level script code
    pub is_script: bool,
    /// Globals declared by the script, defined as undefined before it runs
    pub declared_globals: Vec<Name>,
}

impl Chunk {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Append an instruction and return its offset
    pub fn emit(&mut self, instruction: Instruction, line: u32) -> usize {
        self.code.push(instruction);
        self.lines.push(line);
        self.statement_starts.push(false);
        self.code.len() - 1
    }

    /// Get the line number for a bytecode offset
    pub fn get_line(&self, offset: usize) -> u32 {
        self.lines.get(offset).copied().unwrap_or(0)
    }

    pub fn is_statement_start(&self, offset: usize) -> bool {
        self.statement_starts.get(offset).copied().unwrap_or(false)
    }

    /// Add a constant to the pool and return its index
    pub fn add_constant(&mut self, constant: Constant) -> u32 {
        if let Some(index) = self.constants.iter().position(|c| match (c, &constant) {
            (Constant::Number(a), Constant::Number(b)) => a.to_bits() == b.to_bits(),
            (a, b) => a == b,
        }) {
            return index as u32;
        }
        self.constants.push(constant);
        (self.constants.len() - 1) as u32
    }

    /// Offsets targeted by a backward `Loop` jump
    pub fn loop_headers(&self) -> Vec<usize> {
        let mut headers: Vec<usize> = self
            .code
            .iter()
            .filter_map(|i| match i {
                Instruction::Loop(target) => Some(*target as usize),
                _ => None,
            })
            .collect();
        headers.sort_unstable();
        headers.dedup();
        headers
    }

    /// Disassemble the chunk (and its nested functions) for debugging
    pub fn disassemble(&self, interner: &Interner) -> String {
        let mut output = String::new();
        self.disassemble_into(interner, &mut output);
        output
    }

    fn disassemble_into(&self, interner: &Interner, output: &mut String) {
        let _ = writeln!(
            output,
            "== {} (params: {}, locals: {}, slots: {}) ==",
            if self.name.is_empty() { "<anonymous>" } else { &self.name },
            self.param_count,
            self.local_count,
            self.slot_kinds.len()
        );
        let mut last_line = 0;
        for (offset, instruction) in self.code.iter().enumerate() {
            let line = self.get_line(offset);
            let line_column = if line == last_line {
                "   |".to_string()
            } else {
                format!("{:4}", line)
            };
            last_line = line;
            let marker = if self.is_statement_start(offset) { '>' } else { ' ' };
            let _ = writeln!(
                output,
                "{:04} {} {} {}",
                offset,
                line_column,
                marker,
                self.describe(instruction, interner)
            );
        }
        for function in &self.functions {
            output.push('\n');
            function.disassemble_into(interner, output);
        }
    }

    fn describe(&self, instruction: &Instruction, interner: &Interner) -> String {
        match *instruction {
            Instruction::LoadConst(index) => match self.constants.get(index as usize) {
                Some(Constant::Number(n)) => format!("LoadConst {} ({})", index, n),
                Some(Constant::String(s)) => format!("LoadConst {} ({:?})", index, s),
                None => format!("LoadConst {} (?)", index),
            },
            Instruction::GetLocal(slot) | Instruction::SetLocal(slot) => {
                let name = self.local_names.get(slot as usize).map(String::as_str).unwrap_or("?");
                let op = if matches!(instruction, Instruction::GetLocal(_)) { "GetLocal" } else { "SetLocal" };
                format!("{} {} ({})", op, slot, name)
            }
            Instruction::GetGlobal(name) => format!("GetGlobal {}", interner.resolve(name)),
            Instruction::SetGlobal(name) => format!("SetGlobal {}", interner.resolve(name)),
            Instruction::GetNamed { name, slot } => format!("GetNamed .{} [{}]", interner.resolve(name), slot),
            Instruction::SetNamed { name, slot } => format!("SetNamed .{} [{}]", interner.resolve(name), slot),
            Instruction::DefineField(name) => format!("DefineField {}", interner.resolve(name)),
            Instruction::DefineGetter(name) => format!("DefineGetter {}", interner.resolve(name)),
            Instruction::Binary { op, slot } => format!("Binary {} [{}]", op.symbol(), slot),
            Instruction::Compare { op, slot } => format!("Compare {} [{}]", op.symbol(), slot),
            Instruction::CallIntrinsic { intrinsic, argc } => format!("CallIntrinsic %{} {}", intrinsic.name(), argc),
            other => format!("{:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_are_deduplicated() {
        let mut chunk = Chunk::new("test");
        let a = chunk.add_constant(Constant::Number(1.5));
        let b = chunk.add_constant(Constant::String(Arc::from("x")));
        assert_eq!(chunk.add_constant(Constant::Number(1.5)), a);
        assert_eq!(chunk.add_constant(Constant::String(Arc::from("x"))), b);
        // -0 and 0 stay distinct
        assert_ne!(chunk.add_constant(Constant::Number(-0.0)), chunk.add_constant(Constant::Number(0.0)));
    }

    #[test]
    fn test_loop_headers() {
        let mut chunk = Chunk::new("loop");
        chunk.emit(Instruction::LoadInt(0), 1);
        chunk.emit(Instruction::Pop, 1);
        chunk.emit(Instruction::Loop(1), 1);
        chunk.emit(Instruction::Loop(1), 1);
        assert_eq!(chunk.loop_headers(), vec![1]);
    }
}
