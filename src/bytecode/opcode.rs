//! Bytecode instruction set
//!
//! A stack machine. The bytecode offset of an instruction is its index in
//! [`super::Chunk::code`]; jump operands are absolute offsets. Only
//! [`Instruction::Loop`] jumps backward, which makes loop headers and
//! back-edges visible without a separate analysis.

use crate::runtime::Name;

/// Index into a function's feedback vector
pub type SlotIndex = u32;

/// Bytecode instructions
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Instruction {
    // ========== Stack Operations ==========
    /// Discard the top value
    Pop,
    /// Duplicate the top value
    Dup,
    /// Duplicate the top two values: [a, b] -> [a, b, a, b]
    Dup2,

    // ========== Constants ==========
    LoadUndefined,
    LoadNull,
    LoadTrue,
    LoadFalse,
    /// Push a small integer
    LoadInt(i32),
    /// Push a constant pool entry
    LoadConst(u32),
    LoadThis,

    // ========== Variables ==========
    GetLocal(u32),
    /// Pop into a local
    SetLocal(u32),
    /// Push a global; ReferenceError if undeclared
    GetGlobal(Name),
    /// Pop into a global, creating it if needed
    SetGlobal(Name),

    // ========== Properties ==========
    /// [obj] -> [obj.name]
    GetNamed { name: Name, slot: SlotIndex },
    /// [obj, value] -> [value]
    SetNamed { name: Name, slot: SlotIndex },
    /// [obj, key] -> [obj[key]]
    GetKeyed { slot: SlotIndex },
    /// [obj, key, value] -> [value]
    SetKeyed { slot: SlotIndex },

    // ========== Literals ==========
    /// Push an empty object
    CreateObject,
    /// [obj, value] -> [obj], defining an own data property
    DefineField(Name),
    /// [obj, getter] -> [obj], defining an own accessor
    DefineGetter(Name),
    /// Pop n elements into a new array
    CreateArray(u32),
    /// Create a closure for a nested function literal
    MakeClosure(u32),
    /// Push the memoized strings array of a tagged template site
    GetTemplateObject(u32),

    // ========== Operators ==========
    /// [lhs, rhs] -> [lhs op rhs]
    Binary { op: BinaryOp, slot: SlotIndex },
    /// [lhs, rhs] -> [bool]
    Compare { op: CompareOp, slot: SlotIndex },
    Negate { slot: SlotIndex },
    BitNot { slot: SlotIndex },
    /// Unary plus; also the old value of a postfix update
    ToNumeric { slot: SlotIndex },
    Increment { slot: SlotIndex },
    Decrement { slot: SlotIndex },
    Not,
    TypeOf,

    // ========== Control Flow ==========
    Jump(u32),
    /// Pop and jump if falsy
    JumpIfFalse(u32),
    /// Pop and jump if truthy
    JumpIfTrue(u32),
    /// Jump keeping the value if falsy, else pop (&&)
    JumpIfFalseOrPop(u32),
    /// Jump keeping the value if truthy, else pop (||)
    JumpIfTrueOrPop(u32),
    /// Backward jump to a loop header
    Loop(u32),

    // ========== Calls ==========
    /// [this, callee, args...] -> [result]
    Call { argc: u32, slot: SlotIndex },
    /// [callee, args...] -> [result]
    New { argc: u32, slot: SlotIndex },
    /// [args...] -> [result]
    CallIntrinsic { intrinsic: Intrinsic, argc: u32 },
    Return,

    // ========== Exceptions ==========
    Throw,
    /// Install a handler that jumps to the target with the exception pushed
    PushHandler(u32),
    PopHandler,

    // ========== Generators & Debugging ==========
    /// Suspend with the popped value; resume pushes the sent value
    Yield,
    Debugger,
}

impl Instruction {
    /// Forward or backward jump target, if any
    pub fn jump_target(&self) -> Option<u32> {
        match *self {
            Instruction::Jump(t)
            | Instruction::JumpIfFalse(t)
            | Instruction::JumpIfTrue(t)
            | Instruction::JumpIfFalseOrPop(t)
            | Instruction::JumpIfTrueOrPop(t)
            | Instruction::Loop(t)
            | Instruction::PushHandler(t) => Some(t),
            _ => None,
        }
    }

    /// Whether control never falls through to the next instruction
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Instruction::Jump(_) | Instruction::Loop(_) | Instruction::Return | Instruction::Throw
        )
    }

    /// Patch the jump target of a forward jump
    pub fn set_jump_target(&mut self, target: u32) {
        match self {
            Instruction::Jump(t)
            | Instruction::JumpIfFalse(t)
            | Instruction::JumpIfTrue(t)
            | Instruction::JumpIfFalseOrPop(t)
            | Instruction::JumpIfTrueOrPop(t)
            | Instruction::Loop(t)
            | Instruction::PushHandler(t) => *t = target,
            _ => {}
        }
    }
}

/// Arithmetic and bitwise operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    UShr,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::UShr => ">>>",
        }
    }

    /// Operators whose result is always an int32 (or uint32 for `>>>`)
    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor | BinaryOp::Shl | BinaryOp::Shr | BinaryOp::UShr
        )
    }
}

/// Relational and equality operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    StrictEq,
    StrictNe,
}

impl CompareOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::StrictEq => "===",
            CompareOp::StrictNe => "!==",
        }
    }

    pub fn is_relational(self) -> bool {
        matches!(self, CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge)
    }
}

/// Test and diagnostic directives (`%Name(args)`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    PrepareFunctionForOptimization,
    OptimizeFunctionOnNextCall,
    OptimizeMaglevOnNextCall,
    CompileBaseline,
    DeoptimizeFunction,
    DeoptimizeNow,
    NeverOptimizeFunction,
    GetOptimizationStatus,
    GetTier,
    ActiveTier,
    FinalizeOptimization,
    DeoptCount,
}

impl Intrinsic {
    pub const ALL: [Intrinsic; 12] = [
        Intrinsic::PrepareFunctionForOptimization,
        Intrinsic::OptimizeFunctionOnNextCall,
        Intrinsic::OptimizeMaglevOnNextCall,
        Intrinsic::CompileBaseline,
        Intrinsic::DeoptimizeFunction,
        Intrinsic::DeoptimizeNow,
        Intrinsic::NeverOptimizeFunction,
        Intrinsic::GetOptimizationStatus,
        Intrinsic::GetTier,
        Intrinsic::ActiveTier,
        Intrinsic::FinalizeOptimization,
        Intrinsic::DeoptCount,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Intrinsic::PrepareFunctionForOptimization => "PrepareFunctionForOptimization",
            Intrinsic::OptimizeFunctionOnNextCall => "OptimizeFunctionOnNextCall",
            Intrinsic::OptimizeMaglevOnNextCall => "OptimizeMaglevOnNextCall",
            Intrinsic::CompileBaseline => "CompileBaseline",
            Intrinsic::DeoptimizeFunction => "DeoptimizeFunction",
            Intrinsic::DeoptimizeNow => "DeoptimizeNow",
            Intrinsic::NeverOptimizeFunction => "NeverOptimizeFunction",
            Intrinsic::GetOptimizationStatus => "GetOptimizationStatus",
            Intrinsic::GetTier => "GetTier",
            Intrinsic::ActiveTier => "ActiveTier",
            Intrinsic::FinalizeOptimization => "FinalizeOptimization",
            Intrinsic::DeoptCount => "DeoptCount",
        }
    }

    pub fn from_name(name: &str) -> Option<Intrinsic> {
        Self::ALL.into_iter().find(|i| i.name() == name)
    }

    /// Number of arguments the directive expects
    pub fn arity(self) -> u32 {
        match self {
            Intrinsic::DeoptimizeNow | Intrinsic::ActiveTier | Intrinsic::FinalizeOptimization => 0,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intrinsic_names_resolve() {
        for intrinsic in Intrinsic::ALL {
            assert_eq!(Intrinsic::from_name(intrinsic.name()), Some(intrinsic));
        }
        assert_eq!(Intrinsic::from_name("NoSuchThing"), None);
    }

    #[test]
    fn test_jump_patching() {
        let mut jump = Instruction::JumpIfFalse(0);
        jump.set_jump_target(12);
        assert_eq!(jump.jump_target(), Some(12));
        assert!(!jump.is_terminator());
        assert!(Instruction::Loop(3).is_terminator());
    }
}
