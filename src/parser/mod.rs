//! Script parser
//!
//! A recursive descent parser producing the AST in [`crate::ast`]. Binary
//! operators use precedence climbing.

use crate::ast::*;
use crate::error::{Error, Result, SourceLocation};
use crate::lexer::{parse_number_literal, unescape, Keyword, Lexer, Token, TokenKind};

/// Parser state flags
#[derive(Debug, Clone, Copy, Default)]
struct ParserFlags {
    /// Inside a function body
    in_function: bool,
    /// Inside a generator function
    in_generator: bool,
    /// Loop nesting depth of the current function
    loop_depth: u32,
}

/// A recursive descent parser
pub struct Parser<'src> {
    /// Source code (kept for error messages)
    source: &'src str,
    /// Tokens to parse
    tokens: Vec<Token<'src>>,
    /// Current position in tokens
    pos: usize,
    /// Parser state flags
    flags: ParserFlags,
    /// `%Name(...)` directives are accepted
    allow_directives: bool,
}

impl<'src> Parser<'src> {
    /// Create a new parser from source code
    pub fn new(source: &'src str, allow_directives: bool) -> Result<Self> {
        let tokens = Lexer::new(source).with_directives(allow_directives).tokenize()?;
        Ok(Self {
            source,
            tokens,
            pos: 0,
            flags: ParserFlags::default(),
            allow_directives,
        })
    }

    /// Parse the source as a complete program
    pub fn parse_program(&mut self) -> Result<Program> {
        let start = self.location();
        let mut body = Vec::new();
        while !self.is_eof() {
            body.push(self.parse_statement()?);
        }
        Ok(Program {
            body,
            span: Span::new(start, self.location()),
        })
    }

    /// Parse a single expression covering the whole input
    pub fn parse_standalone_expression(&mut self) -> Result<Expression> {
        let expr = self.parse_expression()?;
        if !self.is_eof() {
            let loc = self.location();
            return Err(self.error(format!("Unexpected {:?} after expression", self.peek()), loc));
        }
        Ok(expr)
    }

    // ========== Token Access ==========

    fn current(&self) -> &Token<'src> {
        &self.tokens[self.pos]
    }

    fn peek(&self) -> TokenKind {
        self.tokens[self.pos].kind
    }

    fn peek_at(&self, offset: usize) -> TokenKind {
        self.tokens
            .get(self.pos + offset)
            .map(|t| t.kind)
            .unwrap_or(TokenKind::Eof)
    }

    fn is_eof(&self) -> bool {
        self.peek() == TokenKind::Eof
    }

    fn location(&self) -> SourceLocation {
        self.current().location
    }

    fn previous_end(&self) -> SourceLocation {
        self.tokens[self.pos.saturating_sub(1)].location
    }

    fn error(&self, message: impl Into<String>, location: SourceLocation) -> Error {
        Error::parse_error(message, location).with_source_context(self.source)
    }

    fn advance(&mut self) -> Token<'src> {
        let token = self.tokens[self.pos].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token<'src>> {
        if self.peek() == kind {
            Ok(self.advance())
        } else {
            let loc = self.location();
            Err(self.error(format!("Expected {:?}, found {:?}", kind, self.peek()), loc))
        }
    }

    fn consume(&mut self, kind: TokenKind) -> bool {
        if self.peek() == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Semicolon, with insertion before `}`, end of input or a line break
    fn consume_semicolon(&mut self) -> Result<()> {
        if self.consume(TokenKind::Semicolon) {
            return Ok(());
        }
        if matches!(self.peek(), TokenKind::RightBrace | TokenKind::Eof) || self.current().newline_before {
            return Ok(());
        }
        let loc = self.location();
        Err(self.error(format!("Expected ';', found {:?}", self.peek()), loc))
    }

    // ========== Statements ==========

    fn parse_statement(&mut self) -> Result<Statement> {
        let start = self.location();
        match self.peek() {
            TokenKind::LeftBrace => {
                let body = self.parse_block()?;
                Ok(Statement::Block(body, Span::new(start, self.previous_end())))
            }
            TokenKind::Semicolon => {
                self.advance();
                Ok(Statement::Empty(Span::new(start, start)))
            }
            TokenKind::Keyword(Keyword::Var) => self.parse_variable_statement(VariableKind::Var),
            TokenKind::Keyword(Keyword::Let) => self.parse_variable_statement(VariableKind::Let),
            TokenKind::Keyword(Keyword::Const) => self.parse_variable_statement(VariableKind::Const),
            TokenKind::Keyword(Keyword::Function) => {
                let function = self.parse_function(true)?;
                Ok(Statement::Function(Box::new(function)))
            }
            TokenKind::Keyword(Keyword::If) => self.parse_if_statement(),
            TokenKind::Keyword(Keyword::While) => self.parse_while_statement(),
            TokenKind::Keyword(Keyword::Do) => self.parse_do_while_statement(),
            TokenKind::Keyword(Keyword::For) => self.parse_for_statement(),
            TokenKind::Keyword(Keyword::Break) | TokenKind::Keyword(Keyword::Continue) => {
                let is_break = self.peek() == TokenKind::Keyword(Keyword::Break);
                self.advance();
                if self.flags.loop_depth == 0 {
                    return Err(self.error("Illegal break or continue outside of a loop", start));
                }
                self.consume_semicolon()?;
                let span = Span::new(start, self.previous_end());
                Ok(if is_break {
                    Statement::Break(span)
                } else {
                    Statement::Continue(span)
                })
            }
            TokenKind::Keyword(Keyword::Return) => {
                self.advance();
                if !self.flags.in_function {
                    return Err(self.error("Illegal return statement", start));
                }
                let argument = if matches!(self.peek(), TokenKind::Semicolon | TokenKind::RightBrace | TokenKind::Eof)
                    || self.current().newline_before
                {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                self.consume_semicolon()?;
                Ok(Statement::Return(argument, Span::new(start, self.previous_end())))
            }
            TokenKind::Keyword(Keyword::Throw) => {
                self.advance();
                if self.current().newline_before {
                    let loc = self.location();
                    return Err(self.error("Illegal newline after throw", loc));
                }
                let argument = self.parse_expression()?;
                self.consume_semicolon()?;
                Ok(Statement::Throw(argument, Span::new(start, self.previous_end())))
            }
            TokenKind::Keyword(Keyword::Try) => self.parse_try_statement(),
            TokenKind::Keyword(Keyword::Debugger) => {
                self.advance();
                self.consume_semicolon()?;
                Ok(Statement::Debugger(Span::new(start, start)))
            }
            _ => {
                let expr = self.parse_expression()?;
                self.consume_semicolon()?;
                Ok(Statement::Expression(expr, Span::new(start, self.previous_end())))
            }
        }
    }

    fn parse_block(&mut self) -> Result<Vec<Statement>> {
        self.expect(TokenKind::LeftBrace)?;
        let mut body = Vec::new();
        while self.peek() != TokenKind::RightBrace {
            if self.is_eof() {
                let loc = self.location();
                return Err(self.error("Unexpected end of input in block", loc));
            }
            body.push(self.parse_statement()?);
        }
        self.advance();
        Ok(body)
    }

    fn parse_variable_statement(&mut self, kind: VariableKind) -> Result<Statement> {
        let decl = self.parse_variable_declaration(kind)?;
        self.consume_semicolon()?;
        Ok(Statement::Variable(decl))
    }

    fn parse_variable_declaration(&mut self, kind: VariableKind) -> Result<VariableDeclaration> {
        let start = self.location();
        self.advance();
        let mut declarations = Vec::new();
        loop {
            let id = self.parse_identifier()?;
            let init = if self.consume(TokenKind::Equal) {
                Some(self.parse_assignment_expression()?)
            } else {
                if kind == VariableKind::Const {
                    let loc = self.location();
                    return Err(self.error("Missing initializer in const declaration", loc));
                }
                None
            };
            declarations.push(VariableDeclarator { id, init });
            if !self.consume(TokenKind::Comma) {
                break;
            }
        }
        Ok(VariableDeclaration {
            kind,
            declarations,
            span: Span::new(start, self.previous_end()),
        })
    }

    fn parse_function(&mut self, require_name: bool) -> Result<Function> {
        let start = self.location();
        self.expect(TokenKind::Keyword(Keyword::Function))?;
        let is_generator = self.consume(TokenKind::Star);
        let id = if self.peek() == TokenKind::Identifier {
            Some(self.parse_identifier()?)
        } else if require_name {
            let loc = self.location();
            return Err(self.error("Function declaration requires a name", loc));
        } else {
            None
        };
        self.parse_function_rest(id, is_generator, start)
    }

    /// Parameters and body, shared by declarations, expressions and methods
    fn parse_function_rest(&mut self, id: Option<Identifier>, is_generator: bool, start: SourceLocation) -> Result<Function> {
        self.expect(TokenKind::LeftParen)?;
        let mut params: Vec<Identifier> = Vec::new();
        while self.peek() != TokenKind::RightParen {
            let param = self.parse_identifier()?;
            if params.iter().any(|p| p.name == param.name) {
                return Err(self.error(format!("Duplicate parameter name '{}'", param.name), param.span.start));
            }
            params.push(param);
            if !self.consume(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RightParen)?;

        let saved = self.flags;
        self.flags = ParserFlags {
            in_function: true,
            in_generator: is_generator,
            loop_depth: 0,
        };
        let body = self.parse_block();
        self.flags = saved;

        Ok(Function {
            id,
            params,
            body: body?,
            is_generator,
            span: Span::new(start, self.previous_end()),
        })
    }

    fn parse_if_statement(&mut self) -> Result<Statement> {
        let start = self.location();
        self.advance();
        self.expect(TokenKind::LeftParen)?;
        let test = self.parse_expression()?;
        self.expect(TokenKind::RightParen)?;
        let consequent = self.parse_statement()?;
        let alternate = if self.consume(TokenKind::Keyword(Keyword::Else)) {
            Some(self.parse_statement()?)
        } else {
            None
        };
        Ok(Statement::If(Box::new(IfStatement {
            test,
            consequent,
            alternate,
            span: Span::new(start, self.previous_end()),
        })))
    }

    fn parse_loop_body(&mut self) -> Result<Statement> {
        self.flags.loop_depth += 1;
        let body = self.parse_statement();
        self.flags.loop_depth -= 1;
        body
    }

    fn parse_while_statement(&mut self) -> Result<Statement> {
        let start = self.location();
        self.advance();
        self.expect(TokenKind::LeftParen)?;
        let test = self.parse_expression()?;
        self.expect(TokenKind::RightParen)?;
        let body = self.parse_loop_body()?;
        Ok(Statement::While(Box::new(WhileStatement {
            test,
            body,
            span: Span::new(start, self.previous_end()),
        })))
    }

    fn parse_do_while_statement(&mut self) -> Result<Statement> {
        let start = self.location();
        self.advance();
        let body = self.parse_loop_body()?;
        self.expect(TokenKind::Keyword(Keyword::While))?;
        self.expect(TokenKind::LeftParen)?;
        let test = self.parse_expression()?;
        self.expect(TokenKind::RightParen)?;
        self.consume(TokenKind::Semicolon);
        Ok(Statement::DoWhile(Box::new(WhileStatement {
            test,
            body,
            span: Span::new(start, self.previous_end()),
        })))
    }

    fn parse_for_statement(&mut self) -> Result<Statement> {
        let start = self.location();
        self.advance();
        self.expect(TokenKind::LeftParen)?;
        let init = match self.peek() {
            TokenKind::Semicolon => None,
            TokenKind::Keyword(Keyword::Var) => Some(ForInit::Variable(self.parse_variable_declaration(VariableKind::Var)?)),
            TokenKind::Keyword(Keyword::Let) => Some(ForInit::Variable(self.parse_variable_declaration(VariableKind::Let)?)),
            TokenKind::Keyword(Keyword::Const) => {
                Some(ForInit::Variable(self.parse_variable_declaration(VariableKind::Const)?))
            }
            _ => Some(ForInit::Expression(self.parse_expression()?)),
        };
        self.expect(TokenKind::Semicolon)?;
        let test = if self.peek() == TokenKind::Semicolon {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect(TokenKind::Semicolon)?;
        let update = if self.peek() == TokenKind::RightParen {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect(TokenKind::RightParen)?;
        let body = self.parse_loop_body()?;
        Ok(Statement::For(Box::new(ForStatement {
            init,
            test,
            update,
            body,
            span: Span::new(start, self.previous_end()),
        })))
    }

    fn parse_try_statement(&mut self) -> Result<Statement> {
        let start = self.location();
        self.advance();
        let block = self.parse_block()?;
        let handler = if self.consume(TokenKind::Keyword(Keyword::Catch)) {
            let param = if self.consume(TokenKind::LeftParen) {
                let id = self.parse_identifier()?;
                self.expect(TokenKind::RightParen)?;
                Some(id)
            } else {
                None
            };
            let body = self.parse_block()?;
            Some(CatchClause { param, body })
        } else {
            None
        };
        let finalizer = if self.consume(TokenKind::Keyword(Keyword::Finally)) {
            Some(self.parse_block()?)
        } else {
            None
        };
        if handler.is_none() && finalizer.is_none() {
            let loc = self.location();
            return Err(self.error("Missing catch or finally after try", loc));
        }
        Ok(Statement::Try(Box::new(TryStatement {
            block,
            handler,
            finalizer,
            span: Span::new(start, self.previous_end()),
        })))
    }

    // ========== Expressions ==========

    fn parse_expression(&mut self) -> Result<Expression> {
        let start = self.location();
        let first = self.parse_assignment_expression()?;
        if self.peek() != TokenKind::Comma {
            return Ok(first);
        }
        let mut expressions = vec![first];
        while self.consume(TokenKind::Comma) {
            expressions.push(self.parse_assignment_expression()?);
        }
        Ok(Expression::Sequence(expressions, Span::new(start, self.previous_end())))
    }

    fn parse_assignment_expression(&mut self) -> Result<Expression> {
        if self.peek() == TokenKind::Keyword(Keyword::Yield) {
            return self.parse_yield_expression();
        }
        let start = self.location();
        let target = self.parse_conditional_expression()?;
        let kind = self.peek();
        if !kind.is_assignment() {
            return Ok(target);
        }
        if !matches!(target, Expression::Identifier(_) | Expression::Member(_)) {
            return Err(self.error("Invalid assignment target", start));
        }
        self.advance();
        let operator = match kind {
            TokenKind::Equal => None,
            TokenKind::PlusEquals => Some(BinaryOperator::Add),
            TokenKind::MinusEquals => Some(BinaryOperator::Subtract),
            TokenKind::StarEquals => Some(BinaryOperator::Multiply),
            TokenKind::SlashEquals => Some(BinaryOperator::Divide),
            TokenKind::PercentEquals => Some(BinaryOperator::Modulo),
            TokenKind::LeftShiftEquals => Some(BinaryOperator::LeftShift),
            TokenKind::RightShiftEquals => Some(BinaryOperator::RightShift),
            TokenKind::UnsignedRightShiftEquals => Some(BinaryOperator::UnsignedRightShift),
            TokenKind::AmpersandEquals => Some(BinaryOperator::BitwiseAnd),
            TokenKind::PipeEquals => Some(BinaryOperator::BitwiseOr),
            _ => Some(BinaryOperator::BitwiseXor),
        };
        let value = self.parse_assignment_expression()?;
        Ok(Expression::Assignment(Box::new(AssignmentExpression {
            operator,
            target,
            value,
            span: Span::new(start, self.previous_end()),
        })))
    }

    fn parse_yield_expression(&mut self) -> Result<Expression> {
        let start = self.location();
        if !self.flags.in_generator {
            return Err(self.error("yield is only valid inside generator functions", start));
        }
        self.advance();
        let argument = if matches!(
            self.peek(),
            TokenKind::Semicolon | TokenKind::RightBrace | TokenKind::RightParen | TokenKind::RightBracket | TokenKind::Comma | TokenKind::Colon | TokenKind::Eof
        ) || self.current().newline_before
        {
            None
        } else {
            Some(Box::new(self.parse_assignment_expression()?))
        };
        Ok(Expression::Yield(argument, Span::new(start, self.previous_end())))
    }

    fn parse_conditional_expression(&mut self) -> Result<Expression> {
        let start = self.location();
        let test = self.parse_binary_expression(1)?;
        if !self.consume(TokenKind::Question) {
            return Ok(test);
        }
        let consequent = self.parse_assignment_expression()?;
        self.expect(TokenKind::Colon)?;
        let alternate = self.parse_assignment_expression()?;
        Ok(Expression::Conditional(Box::new(ConditionalExpression {
            test,
            consequent,
            alternate,
            span: Span::new(start, self.previous_end()),
        })))
    }

    fn binary_precedence(&self) -> u8 {
        match self.peek() {
            TokenKind::PipePipe => 1,
            TokenKind::AmpersandAmpersand => 2,
            TokenKind::Pipe => 3,
            TokenKind::Caret => 4,
            TokenKind::Ampersand => 5,
            TokenKind::EqualEqual | TokenKind::NotEqual | TokenKind::EqualEqualEqual | TokenKind::NotEqualEqual => 6,
            TokenKind::Less | TokenKind::Greater | TokenKind::LessEqual | TokenKind::GreaterEqual => 7,
            TokenKind::LeftShift | TokenKind::RightShift | TokenKind::UnsignedRightShift => 8,
            TokenKind::Plus | TokenKind::Minus => 9,
            TokenKind::Star | TokenKind::Slash | TokenKind::Percent => 10,
            _ => 0,
        }
    }

    fn parse_binary_expression(&mut self, min_prec: u8) -> Result<Expression> {
        let start = self.location();
        let mut left = self.parse_unary_expression()?;
        loop {
            let prec = self.binary_precedence();
            if prec == 0 || prec < min_prec {
                break;
            }
            let kind = self.advance().kind;
            let right = self.parse_binary_expression(prec + 1)?;
            let span = Span::new(start, self.previous_end());
            left = match kind {
                TokenKind::PipePipe | TokenKind::AmpersandAmpersand => Expression::Logical(Box::new(LogicalExpression {
                    operator: if kind == TokenKind::PipePipe {
                        LogicalOperator::Or
                    } else {
                        LogicalOperator::And
                    },
                    left,
                    right,
                    span,
                })),
                _ => Expression::Binary(Box::new(BinaryExpression {
                    operator: binary_operator(kind),
                    left,
                    right,
                    span,
                })),
            };
        }
        Ok(left)
    }

    fn parse_unary_expression(&mut self) -> Result<Expression> {
        let start = self.location();
        let operator = match self.peek() {
            TokenKind::Minus => UnaryOperator::Minus,
            TokenKind::Plus => UnaryOperator::Plus,
            TokenKind::Bang => UnaryOperator::Not,
            TokenKind::Tilde => UnaryOperator::BitwiseNot,
            TokenKind::Keyword(Keyword::Typeof) => UnaryOperator::Typeof,
            TokenKind::PlusPlus | TokenKind::MinusMinus => {
                let operator = if self.advance().kind == TokenKind::PlusPlus {
                    UpdateOperator::Increment
                } else {
                    UpdateOperator::Decrement
                };
                let argument = self.parse_unary_expression()?;
                if !matches!(argument, Expression::Identifier(_) | Expression::Member(_)) {
                    return Err(self.error("Invalid update target", start));
                }
                return Ok(Expression::Update(Box::new(UpdateExpression {
                    operator,
                    prefix: true,
                    argument,
                    span: Span::new(start, self.previous_end()),
                })));
            }
            _ => return self.parse_postfix_expression(),
        };
        self.advance();
        let argument = self.parse_unary_expression()?;
        Ok(Expression::Unary(Box::new(UnaryExpression {
            operator,
            argument,
            span: Span::new(start, self.previous_end()),
        })))
    }

    fn parse_postfix_expression(&mut self) -> Result<Expression> {
        let start = self.location();
        let expr = self.parse_left_hand_side_expression()?;
        if matches!(self.peek(), TokenKind::PlusPlus | TokenKind::MinusMinus) && !self.current().newline_before {
            if !matches!(expr, Expression::Identifier(_) | Expression::Member(_)) {
                return Err(self.error("Invalid update target", start));
            }
            let operator = if self.advance().kind == TokenKind::PlusPlus {
                UpdateOperator::Increment
            } else {
                UpdateOperator::Decrement
            };
            return Ok(Expression::Update(Box::new(UpdateExpression {
                operator,
                prefix: false,
                argument: expr,
                span: Span::new(start, self.previous_end()),
            })));
        }
        Ok(expr)
    }

    fn parse_left_hand_side_expression(&mut self) -> Result<Expression> {
        let start = self.location();
        let mut expr = if self.peek() == TokenKind::Keyword(Keyword::New) {
            self.parse_new_expression()?
        } else {
            self.parse_primary_expression()?
        };
        loop {
            match self.peek() {
                TokenKind::Dot => {
                    self.advance();
                    let name = self.parse_property_name()?;
                    expr = Expression::Member(Box::new(MemberExpression {
                        object: expr,
                        property: MemberProperty::Named(name),
                        span: Span::new(start, self.previous_end()),
                    }));
                }
                TokenKind::LeftBracket => {
                    self.advance();
                    let property = self.parse_expression()?;
                    self.expect(TokenKind::RightBracket)?;
                    expr = Expression::Member(Box::new(MemberExpression {
                        object: expr,
                        property: MemberProperty::Computed(property),
                        span: Span::new(start, self.previous_end()),
                    }));
                }
                TokenKind::LeftParen => {
                    let arguments = self.parse_arguments()?;
                    expr = Expression::Call(Box::new(CallExpression {
                        callee: expr,
                        arguments,
                        span: Span::new(start, self.previous_end()),
                    }));
                }
                TokenKind::Template => {
                    let quasi = self.parse_template()?;
                    expr = Expression::TaggedTemplate(Box::new(TaggedTemplate {
                        tag: expr,
                        quasi,
                        span: Span::new(start, self.previous_end()),
                    }));
                }
                _ => return Ok(expr),
            }
        }
    }

    /// `new Callee(args)`; the callee is a member expression without calls
    fn parse_new_expression(&mut self) -> Result<Expression> {
        let start = self.location();
        self.advance();
        let mut callee = if self.peek() == TokenKind::Keyword(Keyword::New) {
            self.parse_new_expression()?
        } else {
            self.parse_primary_expression()?
        };
        loop {
            match self.peek() {
                TokenKind::Dot => {
                    self.advance();
                    let name = self.parse_property_name()?;
                    callee = Expression::Member(Box::new(MemberExpression {
                        object: callee,
                        property: MemberProperty::Named(name),
                        span: Span::new(start, self.previous_end()),
                    }));
                }
                TokenKind::LeftBracket => {
                    self.advance();
                    let property = self.parse_expression()?;
                    self.expect(TokenKind::RightBracket)?;
                    callee = Expression::Member(Box::new(MemberExpression {
                        object: callee,
                        property: MemberProperty::Computed(property),
                        span: Span::new(start, self.previous_end()),
                    }));
                }
                _ => break,
            }
        }
        let arguments = if self.peek() == TokenKind::LeftParen {
            self.parse_arguments()?
        } else {
            Vec::new()
        };
        Ok(Expression::New(Box::new(CallExpression {
            callee,
            arguments,
            span: Span::new(start, self.previous_end()),
        })))
    }

    fn parse_arguments(&mut self) -> Result<Vec<Expression>> {
        self.expect(TokenKind::LeftParen)?;
        let mut arguments = Vec::new();
        while self.peek() != TokenKind::RightParen {
            arguments.push(self.parse_assignment_expression()?);
            if !self.consume(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RightParen)?;
        Ok(arguments)
    }

    fn parse_primary_expression(&mut self) -> Result<Expression> {
        let start = self.location();
        let span = |parser: &Self| Span::new(start, parser.previous_end());
        match self.peek() {
            TokenKind::Identifier => Ok(Expression::Identifier(self.parse_identifier()?)),
            TokenKind::NumberLiteral => {
                let token = self.advance();
                let value = parse_number_literal(token.text)
                    .ok_or_else(|| self.error(format!("Invalid number '{}'", token.text), start))?;
                Ok(Expression::Number(value, span(self)))
            }
            TokenKind::StringLiteral => {
                let token = self.advance();
                let value = self.string_value(token.text, start)?;
                Ok(Expression::String(value, span(self)))
            }
            TokenKind::Template => Ok(Expression::Template(Box::new(self.parse_template()?))),
            TokenKind::Keyword(Keyword::True) => {
                self.advance();
                Ok(Expression::Boolean(true, span(self)))
            }
            TokenKind::Keyword(Keyword::False) => {
                self.advance();
                Ok(Expression::Boolean(false, span(self)))
            }
            TokenKind::Keyword(Keyword::Null) => {
                self.advance();
                Ok(Expression::Null(span(self)))
            }
            TokenKind::Keyword(Keyword::Undefined) => {
                self.advance();
                Ok(Expression::Undefined(span(self)))
            }
            TokenKind::Keyword(Keyword::This) => {
                self.advance();
                Ok(Expression::This(span(self)))
            }
            TokenKind::Keyword(Keyword::Function) => Ok(Expression::Function(Box::new(self.parse_function(false)?))),
            TokenKind::LeftParen => {
                self.advance();
                let expr = self.parse_expression()?;
                self.expect(TokenKind::RightParen)?;
                Ok(expr)
            }
            TokenKind::LeftBracket => self.parse_array_literal(),
            TokenKind::LeftBrace => self.parse_object_literal(),
            TokenKind::Directive => self.parse_directive(),
            other => Err(self.error(format!("Unexpected token {:?}", other), start)),
        }
    }

    fn parse_directive(&mut self) -> Result<Expression> {
        let start = self.location();
        if !self.allow_directives {
            return Err(self.error("Runtime directives are disabled", start));
        }
        let token = self.advance();
        let name = token.text.trim_start_matches('%').to_string();
        let arguments = self.parse_arguments()?;
        Ok(Expression::Directive(Box::new(DirectiveCall {
            name,
            arguments,
            span: Span::new(start, self.previous_end()),
        })))
    }

    fn parse_array_literal(&mut self) -> Result<Expression> {
        let start = self.location();
        self.advance();
        let mut elements = Vec::new();
        while self.peek() != TokenKind::RightBracket {
            if self.peek() == TokenKind::Comma {
                return Err(self.error("Array holes are not supported", self.location()));
            }
            elements.push(self.parse_assignment_expression()?);
            if !self.consume(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RightBracket)?;
        Ok(Expression::Array(elements, Span::new(start, self.previous_end())))
    }

    fn parse_object_literal(&mut self) -> Result<Expression> {
        let start = self.location();
        self.advance();
        let mut properties = Vec::new();
        while self.peek() != TokenKind::RightBrace {
            properties.push(self.parse_object_property()?);
            if !self.consume(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RightBrace)?;
        Ok(Expression::Object(properties, Span::new(start, self.previous_end())))
    }

    fn parse_object_property(&mut self) -> Result<ObjectProperty> {
        let start = self.location();
        let is_getter_prefix = self.peek() == TokenKind::Identifier
            && self.current().text == "get"
            && !matches!(self.peek_at(1), TokenKind::Colon | TokenKind::LeftParen | TokenKind::Comma | TokenKind::RightBrace);
        if is_getter_prefix {
            self.advance();
            let key_start = self.location();
            let key = self.parse_property_key()?;
            let function = self.parse_function_rest(Some(Identifier::new(key.clone(), Span::new(key_start, key_start))), false, start)?;
            if !function.params.is_empty() {
                return Err(self.error("Getter must not have parameters", start));
            }
            return Ok(ObjectProperty::Getter {
                key,
                function: Box::new(function),
            });
        }

        let is_generator = self.consume(TokenKind::Star);
        let key_is_identifier = self.peek() == TokenKind::Identifier;
        let key_start = self.location();
        let key = self.parse_property_key()?;
        match self.peek() {
            TokenKind::Colon if !is_generator => {
                self.advance();
                let value = self.parse_assignment_expression()?;
                Ok(ObjectProperty::Value { key, value })
            }
            TokenKind::LeftParen => {
                let id = Identifier::new(key.clone(), Span::new(key_start, key_start));
                let function = self.parse_function_rest(Some(id), is_generator, start)?;
                Ok(ObjectProperty::Value {
                    key,
                    value: Expression::Function(Box::new(function)),
                })
            }
            TokenKind::Comma | TokenKind::RightBrace if key_is_identifier && !is_generator => {
                let span = Span::new(key_start, self.previous_end());
                Ok(ObjectProperty::Value {
                    value: Expression::Identifier(Identifier::new(key.clone(), span)),
                    key,
                })
            }
            other => Err(self.error(format!("Unexpected {:?} in object literal", other), self.location())),
        }
    }

    fn parse_property_key(&mut self) -> Result<String> {
        let start = self.location();
        match self.peek() {
            TokenKind::StringLiteral => {
                let token = self.advance();
                self.string_value(token.text, start)
            }
            TokenKind::NumberLiteral => {
                let token = self.advance();
                let value = parse_number_literal(token.text)
                    .ok_or_else(|| self.error(format!("Invalid number '{}'", token.text), start))?;
                Ok(crate::runtime::number_to_string(value))
            }
            _ => self.parse_property_name(),
        }
    }

    /// Identifier name after `.`; keywords are allowed
    fn parse_property_name(&mut self) -> Result<String> {
        match self.peek() {
            TokenKind::Identifier => Ok(self.advance().text.to_string()),
            TokenKind::Keyword(keyword) => {
                self.advance();
                Ok(keyword.as_str().to_string())
            }
            other => {
                let loc = self.location();
                Err(self.error(format!("Expected property name, found {:?}", other), loc))
            }
        }
    }

    fn parse_identifier(&mut self) -> Result<Identifier> {
        let start = self.location();
        if self.peek() != TokenKind::Identifier {
            return Err(self.error(format!("Expected identifier, found {:?}", self.peek()), start));
        }
        let token = self.advance();
        Ok(Identifier::new(token.text, Span::new(start, start)))
    }

    fn string_value(&self, text: &str, location: SourceLocation) -> Result<String> {
        let body = &text[1..text.len() - 1];
        unescape(body).map_err(|message| self.error(message, location))
    }

    /// Split a template token into quasis and parsed substitutions
    fn parse_template(&mut self) -> Result<TemplateLiteral> {
        let start = self.location();
        let token = self.advance();
        let inner = &token.text[1..token.text.len() - 1];
        let (raw, sources) = split_template(inner);

        let mut quasis = Vec::with_capacity(raw.len());
        for part in &raw {
            quasis.push(unescape(part).map_err(|message| self.error(message, start))?);
        }
        let mut expressions = Vec::with_capacity(sources.len());
        for source in sources {
            let mut parser = Parser {
                source,
                tokens: Lexer::new(source)
                    .with_directives(self.allow_directives)
                    .at_location(start)
                    .tokenize()?,
                pos: 0,
                flags: self.flags,
                allow_directives: self.allow_directives,
            };
            expressions.push(parser.parse_standalone_expression()?);
        }
        Ok(TemplateLiteral {
            quasis,
            raw,
            expressions,
            span: Span::new(start, self.previous_end()),
        })
    }
}

fn binary_operator(kind: TokenKind) -> BinaryOperator {
    match kind {
        TokenKind::Plus => BinaryOperator::Add,
        TokenKind::Minus => BinaryOperator::Subtract,
        TokenKind::Star => BinaryOperator::Multiply,
        TokenKind::Slash => BinaryOperator::Divide,
        TokenKind::Percent => BinaryOperator::Modulo,
        TokenKind::EqualEqual => BinaryOperator::Equal,
        TokenKind::NotEqual => BinaryOperator::NotEqual,
        TokenKind::EqualEqualEqual => BinaryOperator::StrictEqual,
        TokenKind::NotEqualEqual => BinaryOperator::StrictNotEqual,
        TokenKind::Less => BinaryOperator::LessThan,
        TokenKind::LessEqual => BinaryOperator::LessThanEqual,
        TokenKind::Greater => BinaryOperator::GreaterThan,
        TokenKind::GreaterEqual => BinaryOperator::GreaterThanEqual,
        TokenKind::LeftShift => BinaryOperator::LeftShift,
        TokenKind::RightShift => BinaryOperator::RightShift,
        TokenKind::UnsignedRightShift => BinaryOperator::UnsignedRightShift,
        TokenKind::Ampersand => BinaryOperator::BitwiseAnd,
        TokenKind::Pipe => BinaryOperator::BitwiseOr,
        _ => BinaryOperator::BitwiseXor,
    }
}

/// Split template contents into raw string parts and substitution sources
fn split_template(inner: &str) -> (Vec<String>, Vec<&str>) {
    let bytes = inner.as_bytes();
    let mut raw = Vec::new();
    let mut sources = Vec::new();
    let mut current = String::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if i + 1 < bytes.len() => {
                let len = inner[i + 1..].chars().next().map_or(1, char::len_utf8);
                current.push_str(&inner[i..i + 1 + len]);
                i += 1 + len;
            }
            b'$' if bytes.get(i + 1) == Some(&b'{') => {
                raw.push(std::mem::take(&mut current));
                let expr_start = i + 2;
                let mut depth = 1;
                let mut j = expr_start;
                let mut quote: Option<u8> = None;
                while j < bytes.len() {
                    let b = bytes[j];
                    match quote {
                        Some(q) => {
                            if b == b'\\' {
                                j += 1;
                            } else if b == q {
                                quote = None;
                            }
                        }
                        None => match b {
                            b'"' | b'\'' | b'`' => quote = Some(b),
                            b'{' => depth += 1,
                            b'}' => {
                                depth -= 1;
                                if depth == 0 {
                                    break;
                                }
                            }
                            _ => {}
                        },
                    }
                    j += 1;
                }
                sources.push(&inner[expr_start..j.min(bytes.len())]);
                i = j + 1;
            }
            _ => {
                let c = inner[i..].chars().next().unwrap_or('\0');
                current.push(c);
                i += c.len_utf8().max(1);
            }
        }
    }
    raw.push(current);
    (raw, sources)
}

/// Parse a complete program
pub fn parse(source: &str, allow_directives: bool) -> Result<Program> {
    Parser::new(source, allow_directives)?.parse_program()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Program {
        parse(source, true).unwrap()
    }

    #[test]
    fn test_precedence() {
        let program = parse_ok("x = 1 + 2 * 3;");
        let Statement::Expression(Expression::Assignment(assign), _) = &program.body[0] else {
            panic!("expected assignment");
        };
        let Expression::Binary(add) = &assign.value else {
            panic!("expected binary");
        };
        assert_eq!(add.operator, BinaryOperator::Add);
        assert!(matches!(&add.right, Expression::Binary(mul) if mul.operator == BinaryOperator::Multiply));
    }

    #[test]
    fn test_template_split() {
        let (raw, sources) = split_template("a${x + {y: 1}.y}b${'}'}c");
        assert_eq!(raw, vec!["a", "b", "c"]);
        assert_eq!(sources, vec!["x + {y: 1}.y", "'}'"]);
    }

    #[test]
    fn test_tagged_template() {
        let program = parse_ok("tag`a${1}b`;");
        assert!(matches!(
            &program.body[0],
            Statement::Expression(Expression::TaggedTemplate(t), _) if t.quasi.quasis == vec!["a", "b"]
        ));
    }

    #[test]
    fn test_asi_and_return_newline() {
        let program = parse_ok("function f() { return\n1 }\nvar a = 1\nvar b = 2");
        assert_eq!(program.body.len(), 3);
        let Statement::Function(f) = &program.body[0] else { panic!() };
        assert!(matches!(&f.body[0], Statement::Return(None, _)));
    }

    #[test]
    fn test_object_literal_forms() {
        let program = parse_ok("var o = { a: 1, b, m() { return 1 }, get g() { return 2 } };");
        let Statement::Variable(decl) = &program.body[0] else { panic!() };
        let Some(Expression::Object(props, _)) = &decl.declarations[0].init else { panic!() };
        assert_eq!(props.len(), 4);
        assert!(matches!(&props[3], ObjectProperty::Getter { key, .. } if key == "g"));
    }

    #[test]
    fn test_directive_requires_permission() {
        assert!(parse("%GetTier(f);", false).is_err());
        assert!(parse("%GetTier(f);", true).is_ok());
    }

    #[test]
    fn test_yield_outside_generator_rejected() {
        assert!(parse("function f() { yield 1; }", true).is_err());
        assert!(parse("function* f() { var x = yield 1; }", true).is_ok());
    }

    #[test]
    fn test_break_outside_loop_rejected() {
        assert!(parse("break;", true).is_err());
    }
}
