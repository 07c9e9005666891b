//! Statement AST node types

use super::*;

/// A statement
#[derive(Debug, Clone)]
pub enum Statement {
    /// Block statement { ... }
    Block(Vec<Statement>, Span),

    /// Empty statement ;
    Empty(Span),

    /// Expression statement
    Expression(Expression, Span),

    /// var / let / const
    Variable(VariableDeclaration),

    /// Function declaration
    Function(Box<Function>),

    /// If statement
    If(Box<IfStatement>),

    /// While statement
    While(Box<WhileStatement>),

    /// Do-while statement
    DoWhile(Box<WhileStatement>),

    /// For statement
    For(Box<ForStatement>),

    /// Break statement
    Break(Span),

    /// Continue statement
    Continue(Span),

    /// Return statement
    Return(Option<Expression>, Span),

    /// Throw statement
    Throw(Expression, Span),

    /// Try statement
    Try(Box<TryStatement>),

    /// Debugger statement
    Debugger(Span),
}

impl Statement {
    /// Source span of the statement
    pub fn span(&self) -> Span {
        match self {
            Statement::Block(_, span)
            | Statement::Empty(span)
            | Statement::Expression(_, span)
            | Statement::Break(span)
            | Statement::Continue(span)
            | Statement::Return(_, span)
            | Statement::Throw(_, span)
            | Statement::Debugger(span) => *span,
            Statement::Variable(decl) => decl.span,
            Statement::Function(f) => f.span,
            Statement::If(s) => s.span,
            Statement::While(s) | Statement::DoWhile(s) => s.span,
            Statement::For(s) => s.span,
            Statement::Try(s) => s.span,
        }
    }
}

/// if (test) consequent else alternate
#[derive(Debug, Clone)]
pub struct IfStatement {
    /// Condition
    pub test: Expression,
    /// Then branch
    pub consequent: Statement,
    /// Else branch
    pub alternate: Option<Statement>,
    /// Span in source
    pub span: Span,
}

/// while (test) body / do body while (test)
#[derive(Debug, Clone)]
pub struct WhileStatement {
    /// Condition
    pub test: Expression,
    /// Loop body
    pub body: Statement,
    /// Span in source
    pub span: Span,
}

/// Initializer clause of a for statement
#[derive(Debug, Clone)]
pub enum ForInit {
    /// for (var i = 0; ...)
    Variable(VariableDeclaration),
    /// for (i = 0; ...)
    Expression(Expression),
}

/// for (init; test; update) body
#[derive(Debug, Clone)]
pub struct ForStatement {
    /// Initializer
    pub init: Option<ForInit>,
    /// Condition
    pub test: Option<Expression>,
    /// Update expression
    pub update: Option<Expression>,
    /// Loop body
    pub body: Statement,
    /// Span in source
    pub span: Span,
}

/// catch (param) { body }
#[derive(Debug, Clone)]
pub struct CatchClause {
    /// Bound exception name
    pub param: Option<Identifier>,
    /// Handler body
    pub body: Vec<Statement>,
}

/// try { block } catch (e) { ... } finally { ... }
#[derive(Debug, Clone)]
pub struct TryStatement {
    /// Protected block
    pub block: Vec<Statement>,
    /// Catch clause
    pub handler: Option<CatchClause>,
    /// Finally block
    pub finalizer: Option<Vec<Statement>>,
    /// Span in source
    pub span: Span,
}
