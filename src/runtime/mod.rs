//! Runtime environment for quickjit
//!
//! This module provides the object model, the agent that owns all heap
//! state, the generic operation semantics every tier falls back to, and
//! the [`Runtime`] facade embedders use.

mod agent;
mod builtins;
mod call;
pub mod function;
pub mod generator;
pub mod intern;
pub mod intrinsics;
pub mod object;
mod ops;
pub mod shape;
pub mod validity;
mod value;

pub use agent::{
    native_fn, Activation, Agent, FrameKind, GlobalCell, Globals, NativeFn, NativeFunction, Realm,
    TemplateSiteCache,
};
pub use function::{FunctionId, FunctionRecord, FunctionTable, NativeId, SharedFunctionInfo, SharedId};
pub use intern::{Interner, Name, WellKnownNames};
pub use object::{Object, ObjectKind};
pub use ops::{arithmetic, array_index, PropertyLookup, UnaryOp};
pub use shape::{PropertyKind, ShapeId, ShapeKind, ShapeTable};
pub use validity::{CodeValidity, ValidityCell};
pub use value::{as_int32, number_to_string, string_to_number, to_int32, to_uint32, ObjectRef, Value};

use crate::bytecode::{self, Chunk};
use crate::config::EngineConfig;
use crate::debugger::DebugHook;
use crate::deopt::DeoptEvent;
use crate::error::{Error, ErrorKind, Result};
use crate::gc::{self, GcStats};
use crate::jit;
use crate::parser;
use crate::tiering::{self, OptimizationLevel, TieringStats};
use crate::workers::SharedRegion;
use std::sync::Arc;

/// A non-normal completion travelling up the native call stack
#[derive(Debug)]
pub enum Abrupt {
    /// A language-level exception
    Throw(Value),
    /// An engine failure no script code can catch
    Fatal(Error),
}

impl From<Error> for Abrupt {
    fn from(error: Error) -> Self {
        Abrupt::Fatal(error)
    }
}

/// Result of evaluating script code
pub type Completion<T> = std::result::Result<T, Abrupt>;

/// The quickjit runtime
pub struct Runtime {
    agent: Agent,
}

impl Runtime {
    /// Create a runtime with the default configuration
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            agent: Agent::new(config),
        }
    }

    /// Create a runtime that can see `region` through the `shared*` natives
    pub fn with_shared_region(config: EngineConfig, region: SharedRegion) -> Self {
        let mut agent = Agent::new(config);
        builtins::install_shared_region(&mut agent, region);
        Self { agent }
    }

    /// Evaluate a script and return its completion value
    pub fn eval(&mut self, source: &str) -> Result<Value> {
        let chunk = self.compile(source)?;
        let result = self.run_chunk(chunk);
        gc::sweep(&mut self.agent);
        result
    }

    /// Parse and compile a script without running it
    pub fn compile(&mut self, source: &str) -> Result<Arc<Chunk>> {
        let program = parser::parse(source, self.agent.config.allow_natives_syntax)
            .map_err(|e| e.with_source_context(source))?;
        let chunk = bytecode::compile_program(&program, &mut self.agent.interner)
            .map_err(|e| e.with_source_context(source))?;
        Ok(Arc::new(chunk))
    }

    /// Bytecode listing of a script and all nested functions
    pub fn disassemble(&mut self, source: &str) -> Result<String> {
        let chunk = self.compile(source)?;
        Ok(chunk.disassemble(&self.agent.interner))
    }

    fn run_chunk(&mut self, chunk: Arc<Chunk>) -> Result<Value> {
        for &name in &chunk.declared_globals {
            self.agent.globals.declare(name);
        }
        let shared = self.agent.create_shared(chunk);
        let closure = self.agent.create_closure(shared);
        let id = closure
            .borrow()
            .function_id()
            .ok_or_else(|| Error::internal("script closure has no function record"))?;
        let result = self.agent.invoke_function(id, Value::Undefined, &[], false);
        result.map_err(|abrupt| self.agent.abrupt_to_error(abrupt))
    }

    /// Call a global function by name
    pub fn call_global(&mut self, name: &str, args: &[Value]) -> Result<Value> {
        let callee = self
            .get_global(name)
            .ok_or_else(|| Error::RuntimeError {
                kind: ErrorKind::ReferenceError,
                message: format!("{} is not defined", name),
            })?;
        let result = self.agent.call(&callee, Value::Undefined, args);
        result.map_err(|abrupt| self.agent.abrupt_to_error(abrupt))
    }

    /// Get a global value
    pub fn get_global(&self, name: &str) -> Option<Value> {
        let symbol = self.agent.interner.get(name)?;
        self.agent.globals.get(symbol).cloned()
    }

    /// Set a global value
    pub fn set_global(&mut self, name: &str, value: Value) {
        let symbol = self.agent.intern(name);
        self.agent.globals.store(symbol, value);
    }

    /// Register a host function as a global
    pub fn register_function<F>(&mut self, name: &str, func: F)
    where
        F: Fn(&[Value]) -> Result<Value> + 'static,
    {
        self.agent.register_native(
            name,
            native_fn(move |agent, _this, args| {
                func(args).map_err(|error| {
                    let kind = error.kind().unwrap_or(ErrorKind::GenericError);
                    agent.throw_error(kind, error.to_string())
                })
            }),
        );
    }

    /// Register a host function with access to the agent and the receiver
    pub fn register_native(&mut self, name: &str, function: NativeFn) {
        self.agent.register_native(name, function);
    }

    // ========== Debugging ==========

    /// Install a debug hook; all code drops to the interpreter until [`Self::leave_debugging_mode`]
    pub fn enter_debugging_mode(&mut self, hook: impl DebugHook + 'static) {
        self.agent.enter_debugging_mode(Box::new(hook));
    }

    pub fn leave_debugging_mode(&mut self) -> Option<Box<dyn DebugHook>> {
        self.agent.leave_debugging_mode()
    }

    pub fn is_debugging(&self) -> bool {
        self.agent.debugging()
    }

    // ========== Tiering ==========

    /// Wait for background compile jobs and install the ones still valid
    pub fn finalize_background_jobs(&mut self) {
        tiering::finalize_background_jobs(&mut self.agent);
    }

    /// Retained deoptimization events, oldest first
    pub fn deopt_events(&self) -> Vec<DeoptEvent> {
        self.agent.deopt_log.iter().cloned().collect()
    }

    /// Tier of the global function `name`
    pub fn tier_of(&self, name: &str) -> Option<&'static str> {
        let id = self.function_id(name)?;
        self.agent.functions.get(id).map(tiering::tier_name)
    }

    /// Number of deoptimizations of the global function `name`
    pub fn deopt_count(&self, name: &str) -> Option<u32> {
        let id = self.function_id(name)?;
        self.agent.functions.get(id).map(|record| record.deopt_count)
    }

    pub fn tiering_stats(&self) -> &TieringStats {
        &self.agent.tiering.stats
    }

    /// Optimized graph the compiler would build for the global function `name`
    pub fn dump_ir(&mut self, name: &str, level: OptimizationLevel) -> Result<String> {
        let id = self.function_id(name).ok_or_else(|| Error::RuntimeError {
            kind: ErrorKind::TypeError,
            message: format!("{} is not a script function", name),
        })?;
        jit::dump_graph(&mut self.agent, id, level).map_err(|e| Error::internal(e.to_string()))
    }

    fn function_id(&self, name: &str) -> Option<FunctionId> {
        match self.get_global(name)? {
            Value::Object(object) => object.borrow().function_id(),
            _ => None,
        }
    }

    // ========== Host Services ==========

    /// Lines printed by the program so far
    pub fn output(&self) -> &[String] {
        &self.agent.output
    }

    pub fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.agent.output)
    }

    /// Echo printed lines to stdout as well as capturing them
    pub fn set_echo_output(&mut self, echo: bool) {
        self.agent.echo_output = echo;
    }

    /// Drop function records whose closures are unreachable
    pub fn collect_garbage(&mut self) -> GcStats {
        gc::sweep(&mut self.agent)
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn agent_mut(&mut self) -> &mut Agent {
        &mut self.agent
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_eval() {
        let mut runtime = Runtime::new();
        let result = runtime.eval("1 + 2").unwrap();
        assert_eq!(result, Value::Number(3.0));
    }

    #[test]
    fn test_runtime_variables() {
        let mut runtime = Runtime::new();
        let result = runtime.eval("let x = 10; x * 2").unwrap();
        assert_eq!(result, Value::Number(20.0));
    }

    #[test]
    fn test_runtime_functions() {
        let mut runtime = Runtime::new();
        let result = runtime
            .eval("function add(a, b) { return a + b; } add(3, 4)")
            .unwrap();
        assert_eq!(result, Value::Number(7.0));
    }

    #[test]
    fn test_globals_persist_between_scripts() {
        let mut runtime = Runtime::new();
        runtime.eval("var counter = 1;").unwrap();
        runtime.eval("counter = counter + 41;").unwrap();
        assert_eq!(runtime.get_global("counter"), Some(Value::Number(42.0)));
    }

    #[test]
    fn test_uncaught_error_becomes_host_error() {
        let mut runtime = Runtime::new();
        let err = runtime.eval("null.x").unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::TypeError));
        let err = runtime.eval("throw 7;").unwrap_err();
        assert_eq!(err.to_string(), "Uncaught 7");
    }

    #[test]
    fn test_registered_function() {
        let mut runtime = Runtime::new();
        runtime.register_function("double", |args| {
            Ok(Value::Number(args.first().and_then(Value::as_number).unwrap_or(0.0) * 2.0))
        });
        assert_eq!(runtime.eval("double(21)").unwrap(), Value::Number(42.0));
        assert_eq!(runtime.call_global("double", &[Value::Number(4.0)]).unwrap(), Value::Number(8.0));
    }

    #[test]
    fn test_script_records_are_collected() {
        let mut runtime = Runtime::new();
        runtime.eval("1;").unwrap();
        runtime.eval("2;").unwrap();
        assert_eq!(runtime.agent().functions.len(), 0);
    }
}
