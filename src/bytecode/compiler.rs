//! Bytecode compiler
//!
//! Compiles the AST to stack bytecode. Scoping is function-level: every
//! `var`, `let`, `const`, parameter, catch parameter and nested function
//! declaration of a function becomes one of its local slots. Names that
//! are not locals resolve to globals; at the top level every declaration
//! is a global. A nested function may not refer to a local of an
//! enclosing function.
//!
//! `finally` blocks are duplicated at every exit (`break`, `continue`,
//! `return`, normal completion and the exceptional path).

use super::opcode::{BinaryOp, CompareOp, Instruction, Intrinsic, SlotIndex};
use super::{Chunk, Constant, TemplateSite};
use crate::ast::*;
use crate::error::{Error, Result};
use crate::feedback::SlotKind;
use crate::runtime::{as_int32, Interner};
use rustc_hash::FxHashMap as HashMap;
use std::sync::Arc;

/// Compile a parsed script
pub fn compile_program(program: &Program, interner: &mut Interner) -> Result<Chunk> {
    let mut compiler = Compiler {
        interner,
        scopes: Vec::new(),
    };
    compiler.compile_script(program)
}

/// Enclosing constructs a jump may leave
enum Control {
    Loop {
        break_jumps: Vec<usize>,
        continue_jumps: Vec<usize>,
    },
    /// A live exception handler, with the finalizer to run on exit
    Try { finalizer: Option<Vec<Statement>> },
}

/// Where an identifier lives
enum Binding {
    Local(u32),
    Global(crate::runtime::Name),
}

/// Per-function compilation state
struct FunctionScope {
    chunk: Chunk,
    locals: HashMap<String, u32>,
    control: Vec<Control>,
    line: u32,
    /// The next emitted instruction starts a statement
    statement_pending: bool,
    temp_count: u32,
    /// Script local holding the value of the last expression statement
    completion: Option<u32>,
}

impl FunctionScope {
    fn new(name: &str, is_script: bool) -> Self {
        let mut chunk = Chunk::new(name);
        chunk.is_script = is_script;
        Self {
            chunk,
            locals: HashMap::default(),
            control: Vec::new(),
            line: 1,
            statement_pending: false,
            temp_count: 0,
            completion: None,
        }
    }

    fn declare_local(&mut self, name: &str) -> u32 {
        if let Some(&slot) = self.locals.get(name) {
            return slot;
        }
        let slot = self.chunk.local_names.len() as u32;
        self.chunk.local_names.push(name.to_string());
        self.locals.insert(name.to_string(), slot);
        slot
    }
}

struct Compiler<'a> {
    interner: &'a mut Interner,
    scopes: Vec<FunctionScope>,
}

impl<'a> Compiler<'a> {
    // ========== Scopes ==========

    fn scope(&mut self) -> &mut FunctionScope {
        let last = self.scopes.len() - 1;
        &mut self.scopes[last]
    }

    fn emit(&mut self, instruction: Instruction) -> usize {
        let scope = self.scope();
        let offset = scope.chunk.emit(instruction, scope.line);
        if scope.statement_pending {
            scope.chunk.statement_starts[offset] = true;
            scope.statement_pending = false;
        }
        offset
    }

    fn offset(&mut self) -> u32 {
        self.scope().chunk.code.len() as u32
    }

    fn patch(&mut self, at: usize) {
        let target = self.offset();
        self.scope().chunk.code[at].set_jump_target(target);
    }

    fn slot(&mut self, kind: SlotKind) -> SlotIndex {
        let kinds = &mut self.scope().chunk.slot_kinds;
        kinds.push(kind);
        (kinds.len() - 1) as SlotIndex
    }

    fn temp(&mut self) -> u32 {
        let scope = self.scope();
        let name = format!(".t{}", scope.temp_count);
        scope.temp_count += 1;
        scope.declare_local(&name)
    }

    fn constant(&mut self, constant: Constant) -> u32 {
        self.scope().chunk.add_constant(constant)
    }

    fn load_string(&mut self, s: &str) {
        let index = self.constant(Constant::String(Arc::from(s)));
        self.emit(Instruction::LoadConst(index));
    }

    fn load_number(&mut self, n: f64) {
        match as_int32(n) {
            Some(i) => {
                self.emit(Instruction::LoadInt(i));
            }
            None => {
                let index = self.constant(Constant::Number(n));
                self.emit(Instruction::LoadConst(index));
            }
        }
    }

    fn resolve(&mut self, name: &str, span: Span) -> Result<Binding> {
        let (current, enclosing) = match self.scopes.split_last() {
            Some(split) => split,
            None => return Err(Error::internal("no active scope")),
        };
        if let Some(&slot) = current.locals.get(name) {
            return Ok(Binding::Local(slot));
        }
        if enclosing.iter().any(|scope| scope.locals.contains_key(name)) {
            return Err(Error::parse_error(
                format!("'{}' refers to a local of an enclosing function, which is not supported", name),
                span.start,
            ));
        }
        Ok(Binding::Global(self.interner.intern(name)))
    }

    // ========== Functions ==========

    fn compile_script(&mut self, program: &Program) -> Result<Chunk> {
        self.scopes.push(FunctionScope::new("<script>", true));
        let completion = self.temp();
        self.scope().completion = Some(completion);

        let mut declarations = Declarations::default();
        collect_declarations(&program.body, &mut declarations);
        for name in &declarations.catch_params {
            self.scope().declare_local(name);
        }
        let mut globals = Vec::new();
        for name in declarations.vars.iter().chain(declarations.functions.iter().map(|f| &f.0)) {
            let symbol = self.interner.intern(name);
            if !globals.contains(&symbol) {
                globals.push(symbol);
            }
        }
        self.scope().chunk.declared_globals = globals;

        for (name, function) in &declarations.functions {
            let index = self.compile_function(function, name)?;
            self.emit(Instruction::MakeClosure(index));
            let symbol = self.interner.intern(name);
            self.emit(Instruction::SetGlobal(symbol));
        }

        let mut last_line = 1;
        for statement in &program.body {
            last_line = statement.span().end.line.max(last_line);
            self.compile_statement(statement)?;
        }
        self.scope().line = last_line;
        self.emit(Instruction::GetLocal(completion));
        self.emit(Instruction::Return);
        self.finish_scope()
    }

    /// Compile a nested function literal and return its index in the current chunk
    fn compile_function(&mut self, function: &Function, name_hint: &str) -> Result<u32> {
        let name = function.id.as_ref().map(|id| id.name.as_str()).unwrap_or(name_hint);
        let mut scope = FunctionScope::new(name, false);
        scope.chunk.is_generator = function.is_generator;
        scope.line = function.span.line();
        for param in &function.params {
            scope.declare_local(&param.name);
        }
        scope.chunk.param_count = function.params.len() as u32;

        let mut declarations = Declarations::default();
        collect_declarations(&function.body, &mut declarations);
        for name in declarations
            .vars
            .iter()
            .chain(declarations.catch_params.iter())
            .chain(declarations.functions.iter().map(|f| &f.0))
        {
            scope.declare_local(name);
        }
        self.scopes.push(scope);

        for (name, nested) in &declarations.functions {
            let index = self.compile_function(nested, name)?;
            self.emit(Instruction::MakeClosure(index));
            let slot = self.scope().declare_local(name);
            self.emit(Instruction::SetLocal(slot));
        }
        for statement in &function.body {
            self.compile_statement(statement)?;
        }
        self.scope().line = function.span.end.line;
        self.emit(Instruction::LoadUndefined);
        self.emit(Instruction::Return);

        let chunk = self.finish_scope()?;
        let functions = &mut self.scope().chunk.functions;
        functions.push(Arc::new(chunk));
        Ok((functions.len() - 1) as u32)
    }

    fn finish_scope(&mut self) -> Result<Chunk> {
        let scope = self
            .scopes
            .pop()
            .ok_or_else(|| Error::internal("scope stack underflow"))?;
        let mut chunk = scope.chunk;
        chunk.local_count = chunk.local_names.len() as u32;
        Ok(chunk)
    }

    // ========== Statements ==========

    fn compile_statement(&mut self, statement: &Statement) -> Result<()> {
        if !matches!(statement, Statement::Block(..) | Statement::Function(_) | Statement::Empty(_)) {
            let scope = self.scope();
            scope.line = statement.span().line();
            scope.statement_pending = true;
        }
        match statement {
            Statement::Block(body, _) => {
                for statement in body {
                    self.compile_statement(statement)?;
                }
            }
            Statement::Empty(_) | Statement::Function(_) => {}
            Statement::Expression(expr, _) => {
                self.compile_expression(expr)?;
                match self.scope().completion {
                    Some(slot) => self.emit(Instruction::SetLocal(slot)),
                    None => self.emit(Instruction::Pop),
                };
            }
            Statement::Variable(decl) => self.compile_variable_declaration(decl)?,
            Statement::If(stmt) => {
                self.compile_expression(&stmt.test)?;
                let else_jump = self.emit(Instruction::JumpIfFalse(0));
                self.compile_statement(&stmt.consequent)?;
                match &stmt.alternate {
                    Some(alternate) => {
                        let end_jump = self.emit(Instruction::Jump(0));
                        self.patch(else_jump);
                        self.compile_statement(alternate)?;
                        self.patch(end_jump);
                    }
                    None => self.patch(else_jump),
                }
            }
            Statement::While(stmt) => {
                let start = self.offset();
                self.compile_expression(&stmt.test)?;
                let exit = self.emit(Instruction::JumpIfFalse(0));
                self.compile_loop_body(&stmt.body, |c| {
                    c.emit(Instruction::Loop(start));
                    Ok(())
                })?;
                self.patch(exit);
            }
            Statement::DoWhile(stmt) => {
                let start = self.offset();
                let mut exit = None;
                self.compile_loop_body(&stmt.body, |c| {
                    c.compile_expression(&stmt.test)?;
                    exit = Some(c.emit(Instruction::JumpIfFalse(0)));
                    c.emit(Instruction::Loop(start));
                    Ok(())
                })?;
                if let Some(exit) = exit {
                    self.patch(exit);
                }
            }
            Statement::For(stmt) => {
                match &stmt.init {
                    Some(ForInit::Variable(decl)) => self.compile_variable_declaration(decl)?,
                    Some(ForInit::Expression(expr)) => {
                        self.compile_expression(expr)?;
                        self.emit(Instruction::Pop);
                    }
                    None => {}
                }
                let start = self.offset();
                let exit = match &stmt.test {
                    Some(test) => {
                        self.compile_expression(test)?;
                        Some(self.emit(Instruction::JumpIfFalse(0)))
                    }
                    None => None,
                };
                self.compile_loop_body(&stmt.body, |c| {
                    if let Some(update) = &stmt.update {
                        c.compile_expression(update)?;
                        c.emit(Instruction::Pop);
                    }
                    c.emit(Instruction::Loop(start));
                    Ok(())
                })?;
                if let Some(exit) = exit {
                    self.patch(exit);
                }
            }
            Statement::Break(span) => self.compile_jump_out(true, *span)?,
            Statement::Continue(span) => self.compile_jump_out(false, *span)?,
            Statement::Return(argument, _) => {
                match argument {
                    Some(expr) => self.compile_expression(expr)?,
                    None => {
                        self.emit(Instruction::LoadUndefined);
                    }
                }
                let has_handlers = self.scope().control.iter().any(|c| matches!(c, Control::Try { .. }));
                if has_handlers {
                    let temp = self.temp();
                    self.emit(Instruction::SetLocal(temp));
                    self.emit_unwind(0)?;
                    self.emit(Instruction::GetLocal(temp));
                }
                self.emit(Instruction::Return);
            }
            Statement::Throw(expr, _) => {
                self.compile_expression(expr)?;
                self.emit(Instruction::Throw);
            }
            Statement::Try(stmt) => {
                self.scope().chunk.has_handlers = true;
                match (&stmt.handler, &stmt.finalizer) {
                    (Some(handler), None) => self.compile_try_catch(&stmt.block, handler)?,
                    (None, Some(finalizer)) => self.compile_try_finally(finalizer, |c| c.compile_block(&stmt.block))?,
                    (Some(handler), Some(finalizer)) => {
                        self.compile_try_finally(finalizer, |c| c.compile_try_catch(&stmt.block, handler))?
                    }
                    (None, None) => self.compile_block(&stmt.block)?,
                }
            }
            Statement::Debugger(_) => {
                self.emit(Instruction::Debugger);
            }
        }
        Ok(())
    }

    fn compile_block(&mut self, body: &[Statement]) -> Result<()> {
        for statement in body {
            self.compile_statement(statement)?;
        }
        Ok(())
    }

    fn compile_variable_declaration(&mut self, decl: &VariableDeclaration) -> Result<()> {
        for declarator in &decl.declarations {
            match &declarator.init {
                Some(init) => self.compile_expression_named(init, &declarator.id.name)?,
                // `let x;` re-initializes on every execution, `var x;` does not
                None if decl.kind != VariableKind::Var => {
                    self.emit(Instruction::LoadUndefined);
                }
                None => continue,
            }
            self.store_identifier(&declarator.id.name, declarator.id.span)?;
        }
        Ok(())
    }

    /// Compile a loop body; `tail` emits the continue point and the back-edge
    fn compile_loop_body(
        &mut self,
        body: &Statement,
        tail: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        self.scope().control.push(Control::Loop {
            break_jumps: Vec::new(),
            continue_jumps: Vec::new(),
        });
        self.compile_statement(body)?;
        let (break_jumps, continue_jumps) = match self.scope().control.pop() {
            Some(Control::Loop {
                break_jumps,
                continue_jumps,
            }) => (break_jumps, continue_jumps),
            _ => return Err(Error::internal("unbalanced loop control stack")),
        };
        for jump in continue_jumps {
            self.patch(jump);
        }
        tail(self)?;
        for jump in break_jumps {
            self.patch(jump);
        }
        Ok(())
    }

    fn compile_jump_out(&mut self, is_break: bool, span: Span) -> Result<()> {
        let target = self
            .scope()
            .control
            .iter()
            .rposition(|c| matches!(c, Control::Loop { .. }))
            .ok_or_else(|| Error::parse_error("Illegal break or continue outside of a loop", span.start))?;
        self.emit_unwind(target + 1)?;
        let jump = self.emit(Instruction::Jump(0));
        if let Control::Loop {
            break_jumps,
            continue_jumps,
        } = &mut self.scope().control[target]
        {
            if is_break {
                break_jumps.push(jump);
            } else {
                continue_jumps.push(jump);
            }
        }
        Ok(())
    }

    /// Leave every handler above control depth `until`, innermost first,
    /// running finalizers on the way out
    fn emit_unwind(&mut self, until: usize) -> Result<()> {
        let mut index = self.scope().control.len();
        while index > until {
            index -= 1;
            let finalizer = match &self.scope().control[index] {
                Control::Try { finalizer } => finalizer.clone(),
                Control::Loop { .. } => continue,
            };
            self.emit(Instruction::PopHandler);
            if let Some(body) = finalizer {
                // the finalizer runs outside the handler it belongs to
                let saved = self.scope().control.split_off(index);
                let result = self.compile_block(&body);
                self.scope().control.extend(saved);
                result?;
            }
        }
        Ok(())
    }

    fn compile_try_catch(&mut self, block: &[Statement], handler: &CatchClause) -> Result<()> {
        let push = self.emit(Instruction::PushHandler(0));
        self.scope().control.push(Control::Try { finalizer: None });
        self.compile_block(block)?;
        self.scope().control.pop();
        self.emit(Instruction::PopHandler);
        let skip = self.emit(Instruction::Jump(0));

        self.patch(push);
        match &handler.param {
            Some(param) => {
                let slot = match self.resolve(&param.name, param.span)? {
                    Binding::Local(slot) => slot,
                    Binding::Global(_) => self.scope().declare_local(&param.name),
                };
                self.emit(Instruction::SetLocal(slot));
            }
            None => {
                self.emit(Instruction::Pop);
            }
        }
        self.compile_block(&handler.body)?;
        self.patch(skip);
        Ok(())
    }

    fn compile_try_finally(
        &mut self,
        finalizer: &[Statement],
        protected: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        let push = self.emit(Instruction::PushHandler(0));
        self.scope().control.push(Control::Try {
            finalizer: Some(finalizer.to_vec()),
        });
        protected(self)?;
        self.scope().control.pop();
        self.emit(Instruction::PopHandler);
        self.compile_block(finalizer)?;
        let skip = self.emit(Instruction::Jump(0));

        self.patch(push);
        let exception = self.temp();
        self.emit(Instruction::SetLocal(exception));
        self.compile_block(finalizer)?;
        self.emit(Instruction::GetLocal(exception));
        self.emit(Instruction::Throw);
        self.patch(skip);
        Ok(())
    }

    // ========== Expressions ==========

    /// Compile an expression, naming anonymous function literals after the binding
    fn compile_expression_named(&mut self, expr: &Expression, name: &str) -> Result<()> {
        match expr {
            Expression::Function(function) if function.id.is_none() => {
                let index = self.compile_function(function, name)?;
                self.emit(Instruction::MakeClosure(index));
                Ok(())
            }
            _ => self.compile_expression(expr),
        }
    }

    fn compile_expression(&mut self, expr: &Expression) -> Result<()> {
        match expr {
            Expression::Identifier(id) => self.load_identifier(&id.name, id.span)?,
            Expression::Number(n, _) => self.load_number(*n),
            Expression::String(s, _) => self.load_string(s),
            Expression::Boolean(true, _) => {
                self.emit(Instruction::LoadTrue);
            }
            Expression::Boolean(false, _) => {
                self.emit(Instruction::LoadFalse);
            }
            Expression::Null(_) => {
                self.emit(Instruction::LoadNull);
            }
            Expression::Undefined(_) => {
                self.emit(Instruction::LoadUndefined);
            }
            Expression::Template(template) => self.compile_template(template)?,
            Expression::TaggedTemplate(tagged) => self.compile_tagged_template(tagged)?,
            Expression::Array(elements, _) => {
                for element in elements {
                    self.compile_expression(element)?;
                }
                self.emit(Instruction::CreateArray(elements.len() as u32));
            }
            Expression::Object(properties, _) => {
                self.emit(Instruction::CreateObject);
                for property in properties {
                    match property {
                        ObjectProperty::Value { key, value } => {
                            self.compile_expression_named(value, key)?;
                            let name = self.interner.intern(key);
                            self.emit(Instruction::DefineField(name));
                        }
                        ObjectProperty::Getter { key, function } => {
                            let index = self.compile_function(function, key)?;
                            self.emit(Instruction::MakeClosure(index));
                            let name = self.interner.intern(key);
                            self.emit(Instruction::DefineGetter(name));
                        }
                    }
                }
            }
            Expression::Function(function) => {
                let index = self.compile_function(function, "")?;
                self.emit(Instruction::MakeClosure(index));
            }
            Expression::This(_) => {
                self.emit(Instruction::LoadThis);
            }
            Expression::Member(member) => {
                self.compile_expression(&member.object)?;
                self.compile_member_load(&member.property)?;
            }
            Expression::Call(call) => {
                self.scope().line = call.span.line();
                self.compile_callee(&call.callee)?;
                for argument in &call.arguments {
                    self.compile_expression(argument)?;
                }
                let slot = self.slot(SlotKind::Call);
                self.emit(Instruction::Call {
                    argc: call.arguments.len() as u32,
                    slot,
                });
            }
            Expression::New(call) => {
                self.scope().line = call.span.line();
                self.compile_expression(&call.callee)?;
                for argument in &call.arguments {
                    self.compile_expression(argument)?;
                }
                let slot = self.slot(SlotKind::Call);
                self.emit(Instruction::New {
                    argc: call.arguments.len() as u32,
                    slot,
                });
            }
            Expression::Unary(unary) => {
                self.compile_expression(&unary.argument)?;
                match unary.operator {
                    UnaryOperator::Minus => {
                        let slot = self.slot(SlotKind::Arithmetic);
                        self.emit(Instruction::Negate { slot });
                    }
                    UnaryOperator::Plus => {
                        let slot = self.slot(SlotKind::Arithmetic);
                        self.emit(Instruction::ToNumeric { slot });
                    }
                    UnaryOperator::BitwiseNot => {
                        let slot = self.slot(SlotKind::Arithmetic);
                        self.emit(Instruction::BitNot { slot });
                    }
                    UnaryOperator::Not => {
                        self.emit(Instruction::Not);
                    }
                    UnaryOperator::Typeof => {
                        self.emit(Instruction::TypeOf);
                    }
                }
            }
            Expression::Update(update) => self.compile_update(update)?,
            Expression::Binary(binary) => {
                self.compile_expression(&binary.left)?;
                self.compile_expression(&binary.right)?;
                self.emit_binary(binary.operator);
            }
            Expression::Logical(logical) => {
                self.compile_expression(&logical.left)?;
                let jump = match logical.operator {
                    LogicalOperator::And => self.emit(Instruction::JumpIfFalseOrPop(0)),
                    LogicalOperator::Or => self.emit(Instruction::JumpIfTrueOrPop(0)),
                };
                self.compile_expression(&logical.right)?;
                self.patch(jump);
            }
            Expression::Assignment(assignment) => self.compile_assignment(assignment)?,
            Expression::Conditional(conditional) => {
                self.compile_expression(&conditional.test)?;
                let else_jump = self.emit(Instruction::JumpIfFalse(0));
                self.compile_expression(&conditional.consequent)?;
                let end_jump = self.emit(Instruction::Jump(0));
                self.patch(else_jump);
                self.compile_expression(&conditional.alternate)?;
                self.patch(end_jump);
            }
            Expression::Sequence(expressions, _) => {
                for (i, expr) in expressions.iter().enumerate() {
                    if i > 0 {
                        self.emit(Instruction::Pop);
                    }
                    self.compile_expression(expr)?;
                }
            }
            Expression::Yield(argument, _) => {
                match argument {
                    Some(expr) => self.compile_expression(expr)?,
                    None => {
                        self.emit(Instruction::LoadUndefined);
                    }
                }
                self.emit(Instruction::Yield);
            }
            Expression::Directive(directive) => {
                let intrinsic = Intrinsic::from_name(&directive.name).ok_or_else(|| {
                    Error::parse_error(format!("Unknown runtime directive %{}", directive.name), directive.span.start)
                })?;
                if directive.arguments.len() as u32 != intrinsic.arity() {
                    return Err(Error::parse_error(
                        format!("%{} expects {} argument(s)", intrinsic.name(), intrinsic.arity()),
                        directive.span.start,
                    ));
                }
                for argument in &directive.arguments {
                    self.compile_expression(argument)?;
                }
                self.emit(Instruction::CallIntrinsic {
                    intrinsic,
                    argc: directive.arguments.len() as u32,
                });
            }
        }
        Ok(())
    }

    fn emit_binary(&mut self, operator: BinaryOperator) {
        let compare = match operator {
            BinaryOperator::Equal => Some(CompareOp::Eq),
            BinaryOperator::NotEqual => Some(CompareOp::Ne),
            BinaryOperator::StrictEqual => Some(CompareOp::StrictEq),
            BinaryOperator::StrictNotEqual => Some(CompareOp::StrictNe),
            BinaryOperator::LessThan => Some(CompareOp::Lt),
            BinaryOperator::LessThanEqual => Some(CompareOp::Le),
            BinaryOperator::GreaterThan => Some(CompareOp::Gt),
            BinaryOperator::GreaterThanEqual => Some(CompareOp::Ge),
            _ => None,
        };
        if let Some(op) = compare {
            let slot = self.slot(SlotKind::Compare);
            self.emit(Instruction::Compare { op, slot });
            return;
        }
        let op = match operator {
            BinaryOperator::Add => BinaryOp::Add,
            BinaryOperator::Subtract => BinaryOp::Sub,
            BinaryOperator::Multiply => BinaryOp::Mul,
            BinaryOperator::Divide => BinaryOp::Div,
            BinaryOperator::Modulo => BinaryOp::Mod,
            BinaryOperator::BitwiseAnd => BinaryOp::BitAnd,
            BinaryOperator::BitwiseOr => BinaryOp::BitOr,
            BinaryOperator::BitwiseXor => BinaryOp::BitXor,
            BinaryOperator::LeftShift => BinaryOp::Shl,
            BinaryOperator::RightShift => BinaryOp::Shr,
            _ => BinaryOp::UShr,
        };
        let slot = self.slot(SlotKind::Arithmetic);
        self.emit(Instruction::Binary { op, slot });
    }

    fn load_identifier(&mut self, name: &str, span: Span) -> Result<()> {
        match self.resolve(name, span)? {
            Binding::Local(slot) => self.emit(Instruction::GetLocal(slot)),
            Binding::Global(symbol) => self.emit(Instruction::GetGlobal(symbol)),
        };
        Ok(())
    }

    /// Pop the top of stack into a variable
    fn store_identifier(&mut self, name: &str, span: Span) -> Result<()> {
        match self.resolve(name, span)? {
            Binding::Local(slot) => self.emit(Instruction::SetLocal(slot)),
            Binding::Global(symbol) => self.emit(Instruction::SetGlobal(symbol)),
        };
        Ok(())
    }

    /// [obj] -> [obj.prop] for a named property, [obj] key -> [obj[key]] for a computed one
    fn compile_member_load(&mut self, property: &MemberProperty) -> Result<()> {
        match property {
            MemberProperty::Named(name) => {
                let name = self.interner.intern(name);
                let slot = self.slot(SlotKind::Load);
                self.emit(Instruction::GetNamed { name, slot });
            }
            MemberProperty::Computed(key) => {
                self.compile_expression(key)?;
                let slot = self.slot(SlotKind::KeyedLoad);
                self.emit(Instruction::GetKeyed { slot });
            }
        }
        Ok(())
    }

    /// Push `[this, callee]` for a call
    fn compile_callee(&mut self, callee: &Expression) -> Result<()> {
        match callee {
            Expression::Member(member) => {
                self.compile_expression(&member.object)?;
                self.emit(Instruction::Dup);
                self.compile_member_load(&member.property)
            }
            _ => {
                self.emit(Instruction::LoadUndefined);
                self.compile_expression(callee)
            }
        }
    }

    fn compile_template(&mut self, template: &TemplateLiteral) -> Result<()> {
        self.load_string(&template.quasis[0]);
        for (i, expr) in template.expressions.iter().enumerate() {
            self.compile_expression(expr)?;
            self.emit_binary(BinaryOperator::Add);
            if let Some(quasi) = template.quasis.get(i + 1).filter(|q| !q.is_empty()) {
                self.load_string(quasi);
                self.emit_binary(BinaryOperator::Add);
            }
        }
        Ok(())
    }

    fn compile_tagged_template(&mut self, tagged: &TaggedTemplate) -> Result<()> {
        let site = TemplateSite {
            cooked: tagged.quasi.quasis.iter().map(|s| Arc::from(s.as_str())).collect(),
            raw: tagged.quasi.raw.iter().map(|s| Arc::from(s.as_str())).collect(),
        };
        let sites = &mut self.scope().chunk.template_sites;
        sites.push(site);
        let index = (sites.len() - 1) as u32;

        self.compile_callee(&tagged.tag)?;
        self.emit(Instruction::GetTemplateObject(index));
        for expr in &tagged.quasi.expressions {
            self.compile_expression(expr)?;
        }
        let slot = self.slot(SlotKind::Call);
        self.emit(Instruction::Call {
            argc: tagged.quasi.expressions.len() as u32 + 1,
            slot,
        });
        Ok(())
    }

    fn compile_assignment(&mut self, assignment: &AssignmentExpression) -> Result<()> {
        match &assignment.target {
            Expression::Identifier(id) => {
                match assignment.operator {
                    Some(operator) => {
                        self.load_identifier(&id.name, id.span)?;
                        self.compile_expression(&assignment.value)?;
                        self.emit_binary(operator);
                    }
                    None => self.compile_expression_named(&assignment.value, &id.name)?,
                }
                self.emit(Instruction::Dup);
                self.store_identifier(&id.name, id.span)
            }
            Expression::Member(member) => {
                self.compile_expression(&member.object)?;
                match &member.property {
                    MemberProperty::Named(name) => {
                        let name = self.interner.intern(name);
                        if let Some(operator) = assignment.operator {
                            self.emit(Instruction::Dup);
                            let slot = self.slot(SlotKind::Load);
                            self.emit(Instruction::GetNamed { name, slot });
                            self.compile_expression(&assignment.value)?;
                            self.emit_binary(operator);
                        } else {
                            self.compile_expression(&assignment.value)?;
                        }
                        let slot = self.slot(SlotKind::Store);
                        self.emit(Instruction::SetNamed { name, slot });
                    }
                    MemberProperty::Computed(key) => {
                        self.compile_expression(key)?;
                        if let Some(operator) = assignment.operator {
                            self.emit(Instruction::Dup2);
                            let slot = self.slot(SlotKind::KeyedLoad);
                            self.emit(Instruction::GetKeyed { slot });
                            self.compile_expression(&assignment.value)?;
                            self.emit_binary(operator);
                        } else {
                            self.compile_expression(&assignment.value)?;
                        }
                        let slot = self.slot(SlotKind::KeyedStore);
                        self.emit(Instruction::SetKeyed { slot });
                    }
                }
                Ok(())
            }
            other => Err(Error::parse_error("Invalid assignment target", other.span().start)),
        }
    }

    fn emit_step(&mut self, operator: UpdateOperator) {
        let slot = self.slot(SlotKind::Arithmetic);
        match operator {
            UpdateOperator::Increment => self.emit(Instruction::Increment { slot }),
            UpdateOperator::Decrement => self.emit(Instruction::Decrement { slot }),
        };
    }

    fn emit_to_numeric(&mut self) {
        let slot = self.slot(SlotKind::Arithmetic);
        self.emit(Instruction::ToNumeric { slot });
    }

    fn compile_update(&mut self, update: &UpdateExpression) -> Result<()> {
        match &update.argument {
            Expression::Identifier(id) => {
                self.load_identifier(&id.name, id.span)?;
                if update.prefix {
                    self.emit_step(update.operator);
                    self.emit(Instruction::Dup);
                } else {
                    self.emit_to_numeric();
                    self.emit(Instruction::Dup);
                    self.emit_step(update.operator);
                }
                self.store_identifier(&id.name, id.span)
            }
            Expression::Member(member) => {
                self.compile_expression(&member.object)?;
                let store = match &member.property {
                    MemberProperty::Named(name) => {
                        let name = self.interner.intern(name);
                        self.emit(Instruction::Dup);
                        let slot = self.slot(SlotKind::Load);
                        self.emit(Instruction::GetNamed { name, slot });
                        let slot = self.slot(SlotKind::Store);
                        Instruction::SetNamed { name, slot }
                    }
                    MemberProperty::Computed(key) => {
                        self.compile_expression(key)?;
                        self.emit(Instruction::Dup2);
                        let slot = self.slot(SlotKind::KeyedLoad);
                        self.emit(Instruction::GetKeyed { slot });
                        let slot = self.slot(SlotKind::KeyedStore);
                        Instruction::SetKeyed { slot }
                    }
                };
                if update.prefix {
                    self.emit_step(update.operator);
                    self.emit(store);
                } else {
                    let old = self.temp();
                    self.emit_to_numeric();
                    self.emit(Instruction::Dup);
                    self.emit(Instruction::SetLocal(old));
                    self.emit_step(update.operator);
                    self.emit(store);
                    self.emit(Instruction::Pop);
                    self.emit(Instruction::GetLocal(old));
                }
                Ok(())
            }
            other => Err(Error::parse_error(
                "Invalid left-hand side expression in update operation",
                other.span().start,
            )),
        }
    }
}

// ========== Declaration Hoisting ==========

#[derive(Default)]
struct Declarations<'ast> {
    vars: Vec<String>,
    catch_params: Vec<String>,
    functions: Vec<(String, &'ast Function)>,
}

/// Collect the declarations of one function body, not descending into nested functions
fn collect_declarations<'ast>(body: &'ast [Statement], out: &mut Declarations<'ast>) {
    for statement in body {
        collect_statement(statement, out);
    }
}

fn collect_statement<'ast>(statement: &'ast Statement, out: &mut Declarations<'ast>) {
    match statement {
        Statement::Variable(decl) => collect_variables(decl, out),
        Statement::Function(function) => {
            if let Some(id) = &function.id {
                out.functions.retain(|(name, _)| name != &id.name);
                out.functions.push((id.name.clone(), function));
            }
        }
        Statement::Block(body, _) => collect_declarations(body, out),
        Statement::If(stmt) => {
            collect_statement(&stmt.consequent, out);
            if let Some(alternate) = &stmt.alternate {
                collect_statement(alternate, out);
            }
        }
        Statement::While(stmt) | Statement::DoWhile(stmt) => collect_statement(&stmt.body, out),
        Statement::For(stmt) => {
            if let Some(ForInit::Variable(decl)) = &stmt.init {
                collect_variables(decl, out);
            }
            collect_statement(&stmt.body, out);
        }
        Statement::Try(stmt) => {
            collect_declarations(&stmt.block, out);
            if let Some(handler) = &stmt.handler {
                if let Some(param) = &handler.param {
                    if !out.catch_params.contains(&param.name) {
                        out.catch_params.push(param.name.clone());
                    }
                }
                collect_declarations(&handler.body, out);
            }
            if let Some(finalizer) = &stmt.finalizer {
                collect_declarations(finalizer, out);
            }
        }
        _ => {}
    }
}

fn collect_variables(decl: &VariableDeclaration, out: &mut Declarations<'_>) {
    for declarator in &decl.declarations {
        if !out.vars.contains(&declarator.id.name) {
            out.vars.push(declarator.id.name.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn compile(source: &str) -> (Chunk, Interner) {
        let mut interner = Interner::new();
        let program = parse(source, true).unwrap();
        let chunk = compile_program(&program, &mut interner).unwrap();
        (chunk, interner)
    }

    #[test]
    fn test_top_level_declarations_are_globals() {
        let (chunk, interner) = compile("var a = 1; function f() { return a; }");
        let names: Vec<&str> = chunk.declared_globals.iter().map(|n| interner.resolve(*n)).collect();
        assert_eq!(names, vec!["a", "f"]);
        assert_eq!(chunk.functions.len(), 1);
        assert!(chunk.is_script);
    }

    #[test]
    fn test_function_locals() {
        let (chunk, _) = compile("function f(x, y) { var z = x + y; return z; }");
        let f = &chunk.functions[0];
        assert_eq!(f.param_count, 2);
        assert_eq!(f.local_names, vec!["x", "y", "z"]);
        assert!(f.code.contains(&Instruction::Return));
    }

    #[test]
    fn test_loops_only_jump_backward_with_loop() {
        let (chunk, _) = compile("function f(n) { var s = 0; for (var i = 0; i < n; i++) { if (i == 3) continue; s += i; } do { s--; } while (s > 100); return s; }");
        let f = &chunk.functions[0];
        for (offset, instruction) in f.code.iter().enumerate() {
            if let Some(target) = instruction.jump_target() {
                let backward = (target as usize) <= offset;
                assert_eq!(backward, matches!(instruction, Instruction::Loop(_)), "{:?} at {}", instruction, offset);
            }
        }
        assert_eq!(f.loop_headers().len(), 2);
    }

    #[test]
    fn test_enclosing_local_is_rejected() {
        let mut interner = Interner::new();
        let program = parse("function outer() { var x = 1; return function() { return x; }; }", true).unwrap();
        let err = compile_program(&program, &mut interner).unwrap_err();
        assert!(err.to_string().contains("enclosing function"));
    }

    #[test]
    fn test_finally_is_duplicated_on_return() {
        let (chunk, _) = compile("function f() { try { return 1; } finally { g(); } }");
        let f = &chunk.functions[0];
        assert!(f.has_handlers);
        let calls = f.code.iter().filter(|i| matches!(i, Instruction::Call { .. })).count();
        // return path, normal path and exceptional path
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_unknown_directive_is_rejected() {
        let mut interner = Interner::new();
        let program = parse("%Bogus(1)", true).unwrap();
        assert!(compile_program(&program, &mut interner).is_err());
    }

    #[test]
    fn test_statement_starts_are_marked() {
        let (chunk, _) = compile("function f(a) {\n  var b = a;\n  return b;\n}");
        let f = &chunk.functions[0];
        let starts = f.statement_starts.iter().filter(|s| **s).count();
        assert_eq!(starts, 2);
    }
}
