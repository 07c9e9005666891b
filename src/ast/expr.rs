//! Expression AST node types

use super::*;

/// An expression
#[derive(Debug, Clone)]
pub enum Expression {
    /// Identifier reference
    Identifier(Identifier),

    /// Numeric literal
    Number(f64, Span),

    /// String literal
    String(String, Span),

    /// `true` / `false`
    Boolean(bool, Span),

    /// `null`
    Null(Span),

    /// `undefined`
    Undefined(Span),

    /// Template literal `hello ${name}`
    Template(Box<TemplateLiteral>),

    /// Tagged template literal tag`hello`
    TaggedTemplate(Box<TaggedTemplate>),

    /// Array literal [1, 2, 3]
    Array(Vec<Expression>, Span),

    /// Object literal {a: 1, b: 2}
    Object(Vec<ObjectProperty>, Span),

    /// Function expression
    Function(Box<Function>),

    /// this expression
    This(Span),

    /// Member expression obj.prop or obj[prop]
    Member(Box<MemberExpression>),

    /// Call expression func(args)
    Call(Box<CallExpression>),

    /// new expression new Foo(args)
    New(Box<CallExpression>),

    /// Unary expression !x, -x, typeof x
    Unary(Box<UnaryExpression>),

    /// Update expression ++x, x++
    Update(Box<UpdateExpression>),

    /// Binary expression x + y, x === y
    Binary(Box<BinaryExpression>),

    /// Logical expression x && y, x || y
    Logical(Box<LogicalExpression>),

    /// Assignment expression x = y, x += y
    Assignment(Box<AssignmentExpression>),

    /// Conditional expression x ? y : z
    Conditional(Box<ConditionalExpression>),

    /// Sequence expression x, y, z
    Sequence(Vec<Expression>, Span),

    /// Yield expression yield x
    Yield(Option<Box<Expression>>, Span),

    /// Runtime directive %Name(args)
    Directive(Box<DirectiveCall>),
}

impl Expression {
    /// Source span of the expression
    pub fn span(&self) -> Span {
        match self {
            Expression::Identifier(id) => id.span,
            Expression::Number(_, span)
            | Expression::String(_, span)
            | Expression::Boolean(_, span)
            | Expression::Null(span)
            | Expression::Undefined(span)
            | Expression::Array(_, span)
            | Expression::Object(_, span)
            | Expression::This(span)
            | Expression::Sequence(_, span)
            | Expression::Yield(_, span) => *span,
            Expression::Template(t) => t.span,
            Expression::TaggedTemplate(t) => t.span,
            Expression::Function(f) => f.span,
            Expression::Member(m) => m.span,
            Expression::Call(c) | Expression::New(c) => c.span,
            Expression::Unary(u) => u.span,
            Expression::Update(u) => u.span,
            Expression::Binary(b) => b.span,
            Expression::Logical(l) => l.span,
            Expression::Assignment(a) => a.span,
            Expression::Conditional(c) => c.span,
            Expression::Directive(d) => d.span,
        }
    }
}

/// Template literal: `quasis[0] ${expressions[0]} quasis[1] ...`
#[derive(Debug, Clone)]
pub struct TemplateLiteral {
    /// Cooked string parts (one more than expressions)
    pub quasis: Vec<String>,
    /// Raw string parts as written in source
    pub raw: Vec<String>,
    /// Substituted expressions
    pub expressions: Vec<Expression>,
    /// Span in source
    pub span: Span,
}

/// Tagged template tag`...`
#[derive(Debug, Clone)]
pub struct TaggedTemplate {
    /// Tag function expression
    pub tag: Expression,
    /// The template
    pub quasi: TemplateLiteral,
    /// Span in source
    pub span: Span,
}

/// Object literal property
#[derive(Debug, Clone)]
pub enum ObjectProperty {
    /// key: value (also shorthand and methods)
    Value {
        /// Property name
        key: String,
        /// Property value
        value: Expression,
    },
    /// get key() { ... }
    Getter {
        /// Property name
        key: String,
        /// Getter function
        function: Box<Function>,
    },
}

/// Property part of a member expression
#[derive(Debug, Clone)]
pub enum MemberProperty {
    /// obj.name
    Named(String),
    /// obj[expr]
    Computed(Expression),
}

/// obj.prop or obj[prop]
#[derive(Debug, Clone)]
pub struct MemberExpression {
    /// Receiver
    pub object: Expression,
    /// Property
    pub property: MemberProperty,
    /// Span in source
    pub span: Span,
}

/// Call or construct expression
#[derive(Debug, Clone)]
pub struct CallExpression {
    /// Callee expression
    pub callee: Expression,
    /// Arguments
    pub arguments: Vec<Expression>,
    /// Span in source
    pub span: Span,
}

/// Unary expression
#[derive(Debug, Clone)]
pub struct UnaryExpression {
    /// Operator
    pub operator: UnaryOperator,
    /// Operand
    pub argument: Expression,
    /// Span in source
    pub span: Span,
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    /// -x
    Minus,
    /// +x
    Plus,
    /// !x
    Not,
    /// ~x
    BitwiseNot,
    /// typeof x
    Typeof,
}

/// ++x, x++, --x, x--
#[derive(Debug, Clone)]
pub struct UpdateExpression {
    /// Increment or decrement
    pub operator: UpdateOperator,
    /// Prefix or postfix
    pub prefix: bool,
    /// Target
    pub argument: Expression,
    /// Span in source
    pub span: Span,
}

/// Update operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOperator {
    /// ++
    Increment,
    /// --
    Decrement,
}

/// Binary expression
#[derive(Debug, Clone)]
pub struct BinaryExpression {
    /// Operator
    pub operator: BinaryOperator,
    /// Left operand
    pub left: Expression,
    /// Right operand
    pub right: Expression,
    /// Span in source
    pub span: Span,
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    /// ==
    Equal,
    /// !=
    NotEqual,
    /// ===
    StrictEqual,
    /// !==
    StrictNotEqual,
    /// <
    LessThan,
    /// <=
    LessThanEqual,
    /// >
    GreaterThan,
    /// >=
    GreaterThanEqual,
    /// <<
    LeftShift,
    /// >>
    RightShift,
    /// >>>
    UnsignedRightShift,
    /// +
    Add,
    /// -
    Subtract,
    /// *
    Multiply,
    /// /
    Divide,
    /// %
    Modulo,
    /// |
    BitwiseOr,
    /// ^
    BitwiseXor,
    /// &
    BitwiseAnd,
}

/// Logical expression
#[derive(Debug, Clone)]
pub struct LogicalExpression {
    /// Operator
    pub operator: LogicalOperator,
    /// Left operand
    pub left: Expression,
    /// Right operand
    pub right: Expression,
    /// Span in source
    pub span: Span,
}

/// Logical operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOperator {
    /// &&
    And,
    /// ||
    Or,
}

/// Assignment expression
#[derive(Debug, Clone)]
pub struct AssignmentExpression {
    /// `None` for plain `=`, otherwise the compound operator
    pub operator: Option<BinaryOperator>,
    /// Target (identifier or member expression)
    pub target: Expression,
    /// Assigned value
    pub value: Expression,
    /// Span in source
    pub span: Span,
}

/// test ? consequent : alternate
#[derive(Debug, Clone)]
pub struct ConditionalExpression {
    /// Test
    pub test: Expression,
    /// Value when truthy
    pub consequent: Expression,
    /// Value when falsy
    pub alternate: Expression,
    /// Span in source
    pub span: Span,
}

/// %Name(args)
#[derive(Debug, Clone)]
pub struct DirectiveCall {
    /// Directive name without the `%`
    pub name: String,
    /// Arguments
    pub arguments: Vec<Expression>,
    /// Span in source
    pub span: Span,
}
