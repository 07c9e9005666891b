//! Tiering controller
//!
//! Decides, per closure, when to move between tiers:
//!
//! ```text
//! Interpreted -> BaselineCompiling -> Baseline -> OptimizingCompiling(level) -> Optimized(level)
//!      ^                                  ^                                          |
//!      +----------------------------------+------------- deoptimization -------------+
//! ```
//!
//! Hotness grows by one per invocation and by one per `back_edge_weight`
//! loop back-edges, and resets on every tier change. After a deopt the
//! function must make `deopt_cooldown` calls at the lower tier before it
//! is eligible again; after `max_deopts` it is pinned below the optimizing
//! tiers for good.

mod concurrent;

pub use concurrent::{BackgroundCompiler, CompileRequest, CompileResult};

use crate::baseline;
use crate::config::CompileMode;
use crate::deopt::{self, DeoptReason};
use crate::jit::{self, CompileError, InstalledCode, LinkContext};
use crate::runtime::{Agent, FrameKind, FunctionId, FunctionRecord};
use bitflags::bitflags;
use rustc_hash::FxHashMap as HashMap;
use serde::Serialize;
use std::rc::Rc;
use std::sync::Arc;

/// Optimizing compiler level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationLevel {
    /// Speculative lowering without inlining
    Mid,
    /// Adds inlining and escape analysis
    Top,
}

impl OptimizationLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            OptimizationLevel::Mid => "mid",
            OptimizationLevel::Top => "top",
        }
    }
}

/// Tier state of one function record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierState {
    Interpreted,
    BaselineCompiling,
    Baseline,
    OptimizingCompiling(OptimizationLevel),
    Optimized(OptimizationLevel),
}

bitflags! {
    /// Bits returned by `%GetOptimizationStatus`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OptimizationStatus: u32 {
        const IS_FUNCTION = 1 << 0;
        const NEVER_OPTIMIZE = 1 << 1;
        const MAYBE_DEOPTED = 1 << 3;
        const OPTIMIZED = 1 << 4;
        const MID_TIER = 1 << 5;
        const TOP_TIER = 1 << 6;
        const INTERPRETED = 1 << 7;
        const MARKED_FOR_OPTIMIZATION = 1 << 8;
        const OPTIMIZING_CONCURRENTLY = 1 << 10;
        const IS_EXECUTING = 1 << 11;
        const BASELINE = 1 << 15;
    }
}

/// Name of a record's tier as reported by `%GetTier` and the embedding API
pub fn tier_name(record: &FunctionRecord) -> &'static str {
    match record.tier {
        TierState::Interpreted | TierState::BaselineCompiling => "interpreted",
        TierState::Baseline => "baseline",
        TierState::OptimizingCompiling(OptimizationLevel::Mid) => "compiling-mid",
        TierState::OptimizingCompiling(OptimizationLevel::Top) => "compiling-top",
        TierState::Optimized(OptimizationLevel::Mid) => "optimized-mid",
        TierState::Optimized(OptimizationLevel::Top) => "optimized-top",
    }
}

/// Counters over the lifetime of an agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TieringStats {
    pub baseline_compiles: u64,
    pub mid_compiles: u64,
    pub top_compiles: u64,
    pub compile_failures: u64,
    pub deopts: u64,
    /// Background jobs dropped at install time
    pub discarded_jobs: u64,
    pub installed_jobs: u64,
    /// Suspended generators moved to a lower tier when resumed
    pub deferred_downgrades: u64,
}

struct PendingJob {
    function: FunctionId,
    level: OptimizationLevel,
    link: LinkContext,
}

/// Per-agent tiering state
pub struct TieringController {
    pub stats: TieringStats,
    background: Option<BackgroundCompiler>,
    pending: HashMap<u64, PendingJob>,
    next_job: u64,
}

impl TieringController {
    pub fn new() -> Self {
        Self {
            stats: TieringStats::default(),
            background: None,
            pending: HashMap::default(),
            next_job: 0,
        }
    }

    /// Number of background jobs not yet installed or discarded
    pub fn pending_jobs(&self) -> usize {
        self.pending.len()
    }

    /// Drop pending jobs and join the background compiler thread
    pub fn shutdown(&mut self) {
        self.pending.clear();
        self.background = None;
    }
}

impl Default for TieringController {
    fn default() -> Self {
        Self::new()
    }
}

// ==================== Counters ====================

/// Called on every invocation of a script function, before its tier is chosen
pub fn on_invocation(agent: &mut Agent, id: FunctionId) {
    install_finished_jobs(agent);

    let stale = {
        let Some(record) = agent.functions.get_mut(id) else {
            return;
        };
        record.invocation_count += 1;
        record.hotness = record.hotness.saturating_add(1);
        record.cooldown = record.cooldown.saturating_sub(1);
        record.optimized.clone().filter(|code| !code.is_valid())
    };
    // code invalidated while no frame was running it
    if let Some(code) = stale {
        let reason = code.validity.reason().unwrap_or(DeoptReason::DependencyInvalidated);
        deopt::discard_optimized_code(agent, id, &code, reason);
    }

    if agent.debugging() || agent.config.interpreter_only {
        return;
    }
    let config = &agent.config;
    let (baseline_threshold, optimize_threshold, top_tier_threshold) =
        (config.baseline_threshold, config.optimize_threshold, config.top_tier_threshold);

    let Some(record) = agent.functions.get_mut(id) else {
        return;
    };
    if let Some(level) = record.marked.take() {
        if record.can_optimize() && !record.pending_job {
            optimize_now(agent, id, level);
        }
        return;
    }
    match record.tier {
        TierState::Interpreted if record.hotness >= baseline_threshold => {
            compile_baseline(agent, id);
        }
        TierState::Baseline
            if record.can_optimize() && record.cooldown == 0 && record.hotness >= optimize_threshold =>
        {
            request_optimization(agent, id, OptimizationLevel::Mid);
        }
        TierState::Optimized(OptimizationLevel::Mid)
            if record.can_optimize() && record.hotness >= top_tier_threshold =>
        {
            request_optimization(agent, id, OptimizationLevel::Top);
        }
        _ => {}
    }
}

/// Called on every loop back-edge executed by the interpreter or baseline
/// code. Returns whether the frame may continue in baseline code.
pub fn on_back_edge(agent: &mut Agent, id: FunctionId) -> bool {
    let weight = agent.config.back_edge_weight.max(1);
    let baseline_threshold = agent.config.baseline_threshold;
    let hot = {
        let Some(record) = agent.functions.get_mut(id) else {
            return false;
        };
        record.back_edges += 1;
        if record.back_edges >= weight {
            record.back_edges = 0;
            record.hotness = record.hotness.saturating_add(1);
        }
        record.tier == TierState::Interpreted && record.hotness >= baseline_threshold
    };
    if agent.debugging() || agent.config.interpreter_only {
        return false;
    }
    if hot {
        compile_baseline(agent, id);
    }
    agent.functions.get(id).is_some_and(|record| {
        record.shared.baseline.borrow().is_some()
            && matches!(
                record.tier,
                TierState::Baseline | TierState::OptimizingCompiling(_) | TierState::Optimized(_)
            )
    })
}

// ==================== Compilation ====================

/// Give the function baseline code and promote it if it is still interpreted
pub fn compile_baseline(agent: &mut Agent, id: FunctionId) -> bool {
    if agent.debugging() || agent.config.interpreter_only {
        return false;
    }
    let Some(record) = agent.functions.get_mut(id) else {
        return false;
    };
    let promote = matches!(record.tier, TierState::Interpreted | TierState::BaselineCompiling);
    if promote {
        record.tier = TierState::BaselineCompiling;
    }
    if record.shared.baseline.borrow().is_none() {
        let code = baseline::compile(&record.shared);
        tracing::debug!(function = %record.shared.name, ops = code.len(), "compiled baseline code");
        *record.shared.baseline.borrow_mut() = Some(Rc::new(code));
        agent.tiering.stats.baseline_compiles += 1;
    }
    if promote {
        record.tier = TierState::Baseline;
        record.hotness = 0;
        tracing::debug!(function = %record.shared.name, "tier-up to baseline");
    }
    true
}

/// Ask for optimized code at `level`, synchronously or in the background
/// depending on the configured compile mode
pub fn request_optimization(agent: &mut Agent, id: FunctionId, level: OptimizationLevel) {
    if agent.config.compile_mode == CompileMode::Synchronous {
        optimize_now(agent, id, level);
        return;
    }
    let prepared = match jit::prepare(agent, id, level) {
        Ok(prepared) => prepared,
        Err(error) => {
            compile_failed(agent, id, level, &error);
            return;
        }
    };
    let controller = &mut agent.tiering;
    if controller.background.is_none() {
        match BackgroundCompiler::spawn() {
            Ok(compiler) => controller.background = Some(compiler),
            Err(error) => {
                tracing::warn!(%error, "could not start background compiler; compiling synchronously");
                optimize_now(agent, id, level);
                return;
            }
        }
    }
    let job = controller.next_job;
    controller.next_job += 1;
    let (input, link) = prepared.into_parts();
    let submitted = controller.background.as_mut().is_some_and(|compiler| {
        compiler.submit(CompileRequest {
            id: job,
            input: Arc::new(input),
        })
    });
    if !submitted {
        controller.background = None;
        optimize_now(agent, id, level);
        return;
    }
    controller.pending.insert(
        job,
        PendingJob {
            function: id,
            level,
            link,
        },
    );
    if let Some(record) = agent.functions.get_mut(id) {
        record.tier = TierState::OptimizingCompiling(level);
        record.pending_job = true;
        tracing::debug!(function = %record.shared.name, level = level.as_str(), job, "queued background compile");
    }
}

/// Compile and install on the calling thread
pub fn optimize_now(agent: &mut Agent, id: FunctionId, level: OptimizationLevel) {
    match jit::compile(agent, id, level) {
        Ok(code) => activate(agent, id, level, code),
        Err(error) => compile_failed(agent, id, level, &error),
    }
}

/// Make installed code the function's entry point
fn activate(agent: &mut Agent, id: FunctionId, level: OptimizationLevel, code: Rc<InstalledCode>) {
    match level {
        OptimizationLevel::Mid => agent.tiering.stats.mid_compiles += 1,
        OptimizationLevel::Top => agent.tiering.stats.top_compiles += 1,
    }
    if let Some(record) = agent.functions.get_mut(id) {
        record.optimized = Some(code);
        record.tier = TierState::Optimized(level);
        record.hotness = 0;
        record.pending_job = false;
        tracing::debug!(function = %record.shared.name, level = level.as_str(), "tier-up to optimized code");
    }
}

/// A compilation attempt failed; the function stays where it is. Code
/// the compiler cannot handle is never offered to it again, other
/// failures wait out a cooldown like a deopt.
fn compile_failed(agent: &mut Agent, id: FunctionId, level: OptimizationLevel, error: &CompileError) {
    agent.tiering.stats.compile_failures += 1;
    let debugging = agent.debugging();
    let cooldown = agent.config.deopt_cooldown;
    if let Some(record) = agent.functions.get_mut(id) {
        tracing::warn!(function = %record.shared.name, level = level.as_str(), %error, "optimizing compilation failed");
        if matches!(error, CompileError::Unsupported(_)) {
            record.optimization_disabled = true;
        } else {
            record.cooldown = cooldown;
            record.hotness = 0;
        }
        record.pending_job = false;
        settle_tier(record, debugging);
    }
}

/// Best tier the record can run at right now
fn settle_tier(record: &mut FunctionRecord, debugging: bool) {
    record.tier = match record.valid_code() {
        Some(code) if !debugging => TierState::Optimized(code.level),
        _ if record.shared.baseline.borrow().is_some() && !debugging => TierState::Baseline,
        _ => TierState::Interpreted,
    };
}

// ==================== Background Jobs ====================

/// Install every finished background job without blocking
pub fn install_finished_jobs(agent: &mut Agent) {
    let results = match agent.tiering.background.as_mut() {
        Some(compiler) if compiler.outstanding() > 0 => compiler.poll(),
        _ => return,
    };
    for result in results {
        install_job(agent, result);
    }
}

/// Wait for every outstanding background job and install the valid ones
pub fn finalize_background_jobs(agent: &mut Agent) {
    let results = match agent.tiering.background.as_mut() {
        Some(compiler) => compiler.wait_all(),
        None => return,
    };
    for result in results {
        install_job(agent, result);
    }
}

fn install_job(agent: &mut Agent, result: CompileResult) {
    let Some(job) = agent.tiering.pending.remove(&result.id) else {
        return;
    };
    let id = job.function;
    let debugging = agent.debugging();
    let eligible = match agent.functions.get_mut(id) {
        Some(record) => {
            record.pending_job = false;
            record.can_optimize() && !debugging
        }
        None => false,
    };
    if !eligible {
        discard_job(agent, id, job.level, "function no longer eligible");
        return;
    }
    let graph = match result.result {
        Ok(graph) => graph,
        Err(error) => {
            compile_failed(agent, id, job.level, &error);
            return;
        }
    };
    match jit::install(agent, id, job.level, graph, job.link) {
        Ok(code) => {
            agent.tiering.stats.installed_jobs += 1;
            activate(agent, id, job.level, code);
        }
        Err(CompileError::DependencyInvalidated) => {
            discard_job(agent, id, job.level, "dependency invalidated before install");
        }
        Err(error) => compile_failed(agent, id, job.level, &error),
    }
}

fn discard_job(agent: &mut Agent, id: FunctionId, level: OptimizationLevel, why: &str) {
    agent.tiering.stats.discarded_jobs += 1;
    let debugging = agent.debugging();
    if let Some(record) = agent.functions.get_mut(id) {
        tracing::debug!(function = %record.shared.name, level = level.as_str(), why, "discarded background job");
        settle_tier(record, debugging);
    }
}

// ==================== Demotion ====================

/// Drop every function to the interpreter for debugging
pub fn suspend_for_debugging(agent: &mut Agent) {
    let ids: Vec<FunctionId> = agent.functions.iter().map(|record| record.id).collect();
    let mut discarded = 0usize;
    for id in ids {
        let code = agent.functions.get(id).and_then(|record| record.optimized.clone());
        if let Some(code) = code {
            deopt::discard_optimized_code(agent, id, &code, DeoptReason::DebuggerAttached);
            discarded += 1;
        }
        if let Some(record) = agent.functions.get_mut(id) {
            record.tier = TierState::Interpreted;
            record.hotness = 0;
            record.back_edges = 0;
            record.marked = None;
            *record.shared.baseline.borrow_mut() = None;
        }
    }
    let mut requested = 0usize;
    for activation in agent.activations.iter_mut() {
        if matches!(activation.kind, FrameKind::Optimized(_)) {
            activation.deopt_requested = Some(DeoptReason::DebuggerAttached);
            requested += 1;
        }
    }
    tracing::info!(discarded, live_frames = requested, "entered debugging mode");
}

/// `%DeoptimizeFunction`: unlink the function's optimized code. Live
/// activations running it deoptimize at their next safepoint.
pub fn deoptimize_function(agent: &mut Agent, id: FunctionId, reason: DeoptReason) {
    let code = agent.functions.get(id).and_then(|record| record.optimized.clone());
    if let Some(code) = code {
        deopt::discard_optimized_code(agent, id, &code, reason);
    }
}

/// `%GetOptimizationStatus`
pub fn status(agent: &Agent, id: FunctionId) -> OptimizationStatus {
    let Some(record) = agent.functions.get(id) else {
        return OptimizationStatus::empty();
    };
    let mut status = OptimizationStatus::IS_FUNCTION;
    if !record.can_optimize() {
        status |= OptimizationStatus::NEVER_OPTIMIZE;
    }
    if record.deopt_count > 0 {
        status |= OptimizationStatus::MAYBE_DEOPTED;
    }
    match record.tier {
        TierState::Interpreted | TierState::BaselineCompiling => status |= OptimizationStatus::INTERPRETED,
        TierState::Baseline => status |= OptimizationStatus::BASELINE,
        TierState::OptimizingCompiling(_) => {
            status |= if record.shared.baseline.borrow().is_some() {
                OptimizationStatus::BASELINE
            } else {
                OptimizationStatus::INTERPRETED
            }
        }
        TierState::Optimized(level) => {
            if record.valid_code().is_some() {
                status |= OptimizationStatus::OPTIMIZED;
                status |= match level {
                    OptimizationLevel::Mid => OptimizationStatus::MID_TIER,
                    OptimizationLevel::Top => OptimizationStatus::TOP_TIER,
                };
            }
        }
    }
    if record.marked.is_some() {
        status |= OptimizationStatus::MARKED_FOR_OPTIMIZATION;
    }
    if record.pending_job {
        status |= OptimizationStatus::OPTIMIZING_CONCURRENTLY;
    }
    if agent.activations.iter().any(|activation| activation.function == id) {
        status |= OptimizationStatus::IS_EXECUTING;
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::runtime::{Runtime, Value};

    fn eager() -> EngineConfig {
        EngineConfig {
            baseline_threshold: 2,
            optimize_threshold: 4,
            top_tier_threshold: 6,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_hot_function_walks_up_the_tiers() {
        let mut runtime = Runtime::with_config(eager());
        runtime.eval("function add(a, b) { return a + b; }").unwrap();
        assert_eq!(runtime.tier_of("add"), Some("interpreted"));
        runtime.eval("add(1, 2); add(1, 2);").unwrap();
        assert_eq!(runtime.tier_of("add"), Some("baseline"));
        runtime.eval("for (var i = 0; i < 4; i++) add(i, 1);").unwrap();
        assert_eq!(runtime.tier_of("add"), Some("optimized-mid"));
        runtime.eval("for (var i = 0; i < 6; i++) add(i, 1);").unwrap();
        assert_eq!(runtime.tier_of("add"), Some("optimized-top"));
        assert_eq!(runtime.eval("add(20, 22)").unwrap(), Value::Number(42.0));
        let stats = runtime.tiering_stats();
        assert_eq!((stats.baseline_compiles, stats.mid_compiles, stats.top_compiles), (1, 1, 1));
    }

    #[test]
    fn test_never_optimize_pins_below_optimizing_tiers() {
        let mut runtime = Runtime::with_config(eager());
        runtime
            .eval("function f(x) { return x * 2; } %NeverOptimizeFunction(f); for (var i = 0; i < 50; i++) f(i);")
            .unwrap();
        assert_eq!(runtime.tier_of("f"), Some("baseline"));
        runtime.eval("%OptimizeFunctionOnNextCall(f); f(1);").unwrap();
        assert_eq!(runtime.tier_of("f"), Some("baseline"));
    }

    #[test]
    fn test_unsupported_function_stays_at_its_tier() {
        let mut runtime = Runtime::with_config(eager());
        runtime
            .eval("function g(x) { try { return x + 1; } catch (e) { return 0; } } for (var i = 0; i < 20; i++) g(i);")
            .unwrap();
        assert_eq!(runtime.tier_of("g"), Some("baseline"));
        assert_eq!(runtime.tiering_stats().compile_failures, 1);
        assert_eq!(runtime.eval("g(41)").unwrap(), Value::Number(42.0));
    }

    #[test]
    fn test_transient_compile_failure_keeps_function_eligible() {
        let mut runtime = Runtime::with_config(EngineConfig {
            deopt_cooldown: 3,
            ..eager()
        });
        runtime.eval("function f(x) { return x + 1; } f(1); f(2);").unwrap();
        let id = match runtime.get_global("f") {
            Some(Value::Object(object)) => object.borrow().function_id().unwrap(),
            other => panic!("f is not a function: {:?}", other),
        };
        compile_failed(runtime.agent_mut(), id, OptimizationLevel::Mid, &CompileError::BudgetExceeded);
        let record = runtime.agent().functions.get(id).unwrap();
        assert!(!record.optimization_disabled);
        assert!(record.can_optimize());
        assert_eq!(record.cooldown, 3);
        assert_eq!(runtime.tier_of("f"), Some("baseline"));

        runtime.eval("for (var i = 0; i < 8; i++) f(i);").unwrap();
        assert_eq!(runtime.tier_of("f"), Some("optimized-mid"));
        assert_eq!(runtime.tiering_stats().compile_failures, 1);

        compile_failed(runtime.agent_mut(), id, OptimizationLevel::Top, &CompileError::Unsupported("test".into()));
        assert!(runtime.agent().functions.get(id).unwrap().optimization_disabled);
    }

    #[test]
    fn test_optimization_status_bits() {
        let mut runtime = Runtime::new();
        runtime.eval("function f(x) { return x + 1; } f(1); f(2);").unwrap();
        let status = runtime.eval("%GetOptimizationStatus(f)").unwrap();
        let bits = OptimizationStatus::from_bits_truncate(status.as_number().unwrap() as u32);
        assert!(bits.contains(OptimizationStatus::IS_FUNCTION | OptimizationStatus::INTERPRETED));
        runtime.eval("%OptimizeMaglevOnNextCall(f);").unwrap();
        let status = runtime.eval("%GetOptimizationStatus(f)").unwrap();
        let bits = OptimizationStatus::from_bits_truncate(status.as_number().unwrap() as u32);
        assert!(bits.contains(OptimizationStatus::MARKED_FOR_OPTIMIZATION));
        runtime.eval("f(3);").unwrap();
        let status = runtime.eval("%GetOptimizationStatus(f)").unwrap();
        let bits = OptimizationStatus::from_bits_truncate(status.as_number().unwrap() as u32);
        assert!(bits.contains(OptimizationStatus::OPTIMIZED | OptimizationStatus::MID_TIER));
        assert!(!bits.contains(OptimizationStatus::MARKED_FOR_OPTIMIZATION));
    }

    #[test]
    fn test_concurrent_jobs_install_at_call_boundary() {
        let config = EngineConfig {
            compile_mode: CompileMode::Concurrent,
            ..eager()
        };
        let mut runtime = Runtime::with_config(config);
        runtime
            .eval("function sq(x) { return x * x; } for (var i = 0; i < 6; i++) sq(i);")
            .unwrap();
        assert_eq!(runtime.tier_of("sq"), Some("compiling-mid"));
        runtime.finalize_background_jobs();
        assert_eq!(runtime.tier_of("sq"), Some("optimized-mid"));
        assert_eq!(runtime.tiering_stats().installed_jobs, 1);
        assert_eq!(runtime.eval("sq(9)").unwrap(), Value::Number(81.0));
    }

    #[test]
    fn test_job_with_invalidated_dependency_is_discarded() {
        let config = EngineConfig {
            compile_mode: CompileMode::Concurrent,
            ..eager()
        };
        let mut runtime = Runtime::with_config(config);
        runtime
            .eval("var k = 3; function scale(x) { return x * k; } for (var i = 0; i < 6; i++) scale(i);")
            .unwrap();
        assert_eq!(runtime.tier_of("scale"), Some("compiling-mid"));
        runtime.eval("k = 5;").unwrap();
        runtime.finalize_background_jobs();
        assert_eq!(runtime.tiering_stats().discarded_jobs, 1);
        assert_eq!(runtime.tier_of("scale"), Some("baseline"));
        assert_eq!(runtime.eval("scale(2)").unwrap(), Value::Number(10.0));
    }
}
