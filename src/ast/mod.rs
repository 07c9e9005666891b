//! Abstract Syntax Tree (AST) types for the script language
//!
//! The tree mirrors ESTree naming for the subset the engine accepts.

mod expr;
mod stmt;

pub use expr::*;
pub use stmt::*;

use crate::error::SourceLocation;

/// A span in the source code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    /// Start location
    pub start: SourceLocation,
    /// End location
    pub end: SourceLocation,
}

impl Span {
    /// Create a new span
    pub fn new(start: SourceLocation, end: SourceLocation) -> Self {
        Self { start, end }
    }

    /// Line of the first character
    pub fn line(&self) -> u32 {
        self.start.line
    }
}

/// A complete script
#[derive(Debug, Clone)]
pub struct Program {
    /// The statements in the program
    pub body: Vec<Statement>,
    /// Span in source
    pub span: Span,
}

/// An identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifier {
    /// The name of the identifier
    pub name: String,
    /// Span in source
    pub span: Span,
}

impl Identifier {
    /// Create a new identifier
    pub fn new(name: impl Into<String>, span: Span) -> Self {
        Self {
            name: name.into(),
            span,
        }
    }
}

/// Variable declaration kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    /// var declaration
    Var,
    /// let declaration
    Let,
    /// const declaration
    Const,
}

/// A single variable declarator (id = init)
#[derive(Debug, Clone)]
pub struct VariableDeclarator {
    /// The bound name
    pub id: Identifier,
    /// Optional initializer expression
    pub init: Option<Expression>,
}

/// A variable declaration (var x = 1, y = 2)
#[derive(Debug, Clone)]
pub struct VariableDeclaration {
    /// The kind of variable declaration
    pub kind: VariableKind,
    /// The declarators
    pub declarations: Vec<VariableDeclarator>,
    /// Span in source
    pub span: Span,
}

/// A function (declaration, expression, method or getter)
#[derive(Debug, Clone)]
pub struct Function {
    /// Optional function name
    pub id: Option<Identifier>,
    /// Parameter names
    pub params: Vec<Identifier>,
    /// Function body
    pub body: Vec<Statement>,
    /// Is this a generator function?
    pub is_generator: bool,
    /// Span in source
    pub span: Span,
}
