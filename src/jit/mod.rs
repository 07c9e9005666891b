//! Optimizing compiler
//!
//! Compilation runs in four stages:
//!
//! 1. [`prepare`] snapshots bytecode, feedback and heap facts on the main
//!    thread into a [`CompilationInput`] that holds no heap references.
//! 2. [`build`] lowers the input to a speculative SSA graph, selects value
//!    representations and runs the optimization passes. It touches nothing
//!    but its input, so it may run on the compiler thread.
//! 3. [`install`] re-checks the assumptions recorded during preparation and
//!    links the graph into an [`InstalledCode`] object.
//! 4. [`run_optimized`] executes installed code and hands failed
//!    speculations back to the interpreter through [`crate::deopt`].

mod broker;
mod builder;
mod escape;
mod executor;
mod ir;
mod passes;
mod representation;

pub use broker::{prepare, CompilationInput, FunctionInput, LinkContext, Prepared};
pub use escape::EscapeAnalysis;
pub use executor::{Outcome, RegValue};
pub use ir::{
    BlockId, ConstantValue, DeoptId, DeoptPoint, FrameState, Graph, Node, NodeId, Op, Repr, StateValue, Terminator,
    VirtualObject,
};
pub use passes::{
    run_optimization_pipeline, CheckElimination, ConstantFolding, DeadCodeElimination, OptimizationPass,
    OptimizationResult,
};

use crate::deopt;
use crate::interpreter::{self, construct_result};
use crate::runtime::{Activation, Agent, CodeValidity, Completion, FrameKind, FunctionId, Value};
use crate::tiering::OptimizationLevel;
use std::fmt::Write as _;
use std::rc::Rc;

/// Why a function could not be optimized
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("graph exceeds the node budget")]
    BudgetExceeded,

    #[error("function is not registered")]
    MissingFunction,

    #[error("a dependency was invalidated before installation")]
    DependencyInvalidated,
}

/// Output of the compiler: an optimized graph and per-pass statistics
#[derive(Debug)]
pub struct CompiledGraph {
    pub graph: Graph,
    pub passes: Vec<(String, OptimizationResult)>,
}

/// Optimized code linked into a function record
pub struct InstalledCode {
    pub function: FunctionId,
    pub level: OptimizationLevel,
    pub graph: CompiledGraph,
    pub link: LinkContext,
    pub validity: CodeValidity,
}

impl InstalledCode {
    pub fn is_valid(&self) -> bool {
        self.validity.is_valid()
    }
}

impl std::fmt::Debug for InstalledCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstalledCode")
            .field("function", &self.function)
            .field("level", &self.level)
            .field("nodes", &self.graph.graph.node_count())
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// Build and optimize a graph for a prepared input
pub fn build(input: &CompilationInput) -> Result<CompiledGraph, CompileError> {
    let mut graph = builder::build_graph(input)?;
    let conversions = representation::select_representations(&mut graph)?;

    let mut passes = vec![(
        "RepresentationSelection".to_string(),
        OptimizationResult {
            instructions_added: conversions,
            ..OptimizationResult::none()
        },
    )];
    let mid: [&dyn OptimizationPass; 3] = [&ConstantFolding, &CheckElimination, &DeadCodeElimination];
    let top: [&dyn OptimizationPass; 5] = [
        &ConstantFolding,
        &CheckElimination,
        &EscapeAnalysis,
        &ConstantFolding,
        &DeadCodeElimination,
    ];
    let pipeline: &[&dyn OptimizationPass] = match input.level {
        OptimizationLevel::Mid => &mid,
        OptimizationLevel::Top => &top,
    };
    passes.extend(run_optimization_pipeline(&mut graph, pipeline));

    if graph.node_count() > input.limits.max_nodes {
        return Err(CompileError::BudgetExceeded);
    }
    tracing::debug!(
        level = input.level.as_str(),
        nodes = graph.node_count(),
        blocks = graph.blocks.len(),
        deopt_points = graph.deopt_points.len(),
        "optimized graph built"
    );
    Ok(CompiledGraph { graph, passes })
}

/// Link a compiled graph into `id`, unless one of its assumptions broke
/// while it was being compiled
pub fn install(
    agent: &mut Agent,
    id: FunctionId,
    level: OptimizationLevel,
    graph: CompiledGraph,
    link: LinkContext,
) -> Result<Rc<InstalledCode>, CompileError> {
    if agent.functions.get(id).is_none() {
        return Err(CompileError::MissingFunction);
    }
    if link.dependencies.iter().any(|cell| !cell.is_valid()) {
        return Err(CompileError::DependencyInvalidated);
    }
    let validity = CodeValidity::new();
    for cell in &link.dependencies {
        cell.register(&validity);
    }
    Ok(Rc::new(InstalledCode {
        function: id,
        level,
        graph,
        link,
        validity,
    }))
}

/// Prepare, build and install on the calling thread
pub fn compile(agent: &mut Agent, id: FunctionId, level: OptimizationLevel) -> Result<Rc<InstalledCode>, CompileError> {
    let (input, link) = prepare(agent, id, level)?.into_parts();
    let graph = build(&input)?;
    install(agent, id, level, graph, link)
}

/// Render the optimized graph `id` would get at `level`, without
/// installing it
pub fn dump_graph(agent: &mut Agent, id: FunctionId, level: OptimizationLevel) -> Result<String, CompileError> {
    let prepared = prepare(agent, id, level)?;
    let compiled = build(prepared.input())?;
    let mut out = String::new();
    let _ = writeln!(out, "; {} tier", level.as_str());
    for (name, result) in &compiled.passes {
        let _ = writeln!(
            out,
            "; {:<26} +{} ~{} -{}",
            name, result.instructions_added, result.instructions_modified, result.instructions_removed
        );
    }
    let _ = write!(out, "{}", compiled.graph);
    Ok(out)
}

/// Run installed code for one call of `id`. A deoptimization continues
/// the call in the interpreter from the reconstructed frames.
pub fn run_optimized(
    agent: &mut Agent,
    id: FunctionId,
    code: Rc<InstalledCode>,
    this: Value,
    args: &[Value],
    construct: bool,
) -> Completion<Value> {
    agent.activations.push(Activation::new(id, FrameKind::Optimized(code.level)));
    let result = match executor::run(agent, &code, this.clone(), args) {
        Ok(Outcome::Returned(value)) => Ok(construct_result(construct, &this, value)),
        Ok(Outcome::Transfer(transfer)) => {
            let mut frames = deopt::deoptimize(agent, id, &code, transfer);
            if let Some(outermost) = frames.last_mut() {
                outermost.construct = construct;
            }
            interpreter::resume_frames(agent, frames)
        }
        Err(abrupt) => Err(abrupt),
    };
    agent.activations.pop();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::runtime::Runtime;

    fn function_id(runtime: &Runtime, name: &str) -> FunctionId {
        match runtime.get_global(name) {
            Some(Value::Object(object)) => object.borrow().function_id().unwrap(),
            other => panic!("{} is not a function: {:?}", name, other),
        }
    }

    fn warmed(source: &str) -> Runtime {
        let mut runtime = Runtime::with_config(EngineConfig::interpreter_only());
        runtime.eval(source).unwrap();
        runtime
    }

    #[test]
    fn test_compile_and_run_matches_interpreter() {
        let mut runtime = warmed("function sum(n) { let s = 0; for (let i = 0; i < n; i++) s += i; return s; } sum(10); sum(20);");
        let id = function_id(&runtime, "sum");
        let code = compile(runtime.agent_mut(), id, OptimizationLevel::Mid).unwrap();
        let result = run_optimized(runtime.agent_mut(), id, code, Value::Undefined, &[Value::Number(100.0)], false);
        assert_eq!(result.ok(), Some(Value::Number(4950.0)));
    }

    #[test]
    fn test_install_rejects_invalidated_dependencies() {
        let mut runtime = warmed("var k = 3; function f(x) { return x + k; } f(1); f(2);");
        let id = function_id(&runtime, "f");
        let (input, link) = prepare(runtime.agent_mut(), id, OptimizationLevel::Mid).unwrap().into_parts();
        let graph = build(&input).unwrap();
        runtime.eval("k = 4;").unwrap();
        if link.dependencies.is_empty() {
            // nothing was speculated about k
            return;
        }
        assert_eq!(
            install(runtime.agent_mut(), id, OptimizationLevel::Mid, graph, link).err(),
            Some(CompileError::DependencyInvalidated)
        );
    }

    #[test]
    fn test_guard_failure_resumes_in_interpreter() {
        let mut runtime = warmed("function add(a, b) { return a + b; } add(1, 2); add(3, 4);");
        let id = function_id(&runtime, "add");
        let code = compile(runtime.agent_mut(), id, OptimizationLevel::Mid).unwrap();
        let args = [Value::string("a"), Value::string("b")];
        let result = run_optimized(runtime.agent_mut(), id, code.clone(), Value::Undefined, &args, false);
        assert_eq!(result.ok(), Some(Value::string("ab")));
        assert!(!code.is_valid());
        assert!(runtime.agent().activations.is_empty());
    }

    #[test]
    fn test_dump_graph_lists_passes() {
        let mut runtime = warmed("function sq(x) { return x * x; } sq(3); sq(4);");
        let id = function_id(&runtime, "sq");
        let text = dump_graph(runtime.agent_mut(), id, OptimizationLevel::Top).unwrap();
        assert!(text.contains("; top tier"));
        assert!(text.contains("EscapeAnalysis"));
        assert!(text.contains("Int32Binary"));
    }
}
