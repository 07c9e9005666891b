//! Debugger support
//!
//! A [`DebugHook`] installed with `Runtime::enter_debugging_mode` sees every
//! statement executed while debugging is active. Entering debugging mode
//! drops all code to the interpreter: optimized code is invalidated,
//! optimized activations deoptimize lazily at their next safepoint,
//! baseline activations switch to the interpreter at their next statement,
//! and tier-up is suspended until debugging ends.
//!
//! [`ExecutionRecorder`] is a ready-made hook that keeps a bounded history
//! of statement views and counts breakpoint hits.

use crate::interpreter::Frame;
use crate::runtime::{Agent, Value};
use rustc_hash::FxHashMap as HashMap;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Maximum number of execution records to keep in history
const MAX_HISTORY_SIZE: usize = 10000;

/// What the debugger can see of the frame about to execute a statement
#[derive(Debug, Clone)]
pub struct FrameView {
    pub function: String,
    /// Offset of the statement's first instruction
    pub offset: usize,
    pub line: u32,
    /// Number of activations on the stack, this one included
    pub depth: usize,
    /// Named locals with their current values
    pub locals: Vec<(String, Value)>,
    pub this: Value,
}

impl FrameView {
    pub fn local(&self, name: &str) -> Option<&Value> {
        self.locals.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

/// Callbacks invoked by the interpreter while debugging mode is active
pub trait DebugHook {
    /// Called before each statement
    fn on_statement(&mut self, view: &FrameView);

    /// Called when a `debugger` statement executes
    fn on_debugger_statement(&mut self, view: &FrameView) {
        let _ = view;
    }
}

fn view(agent: &Agent, frame: &Frame, offset: usize) -> FrameView {
    FrameView {
        function: frame.shared.name.clone(),
        offset,
        line: frame.shared.chunk.get_line(offset),
        depth: agent.activations.len(),
        locals: frame.named_locals(),
        this: frame.this.clone(),
    }
}

/// Report the statement starting at `frame.pc`
pub(crate) fn notify_statement(agent: &mut Agent, frame: &Frame) {
    let view = view(agent, frame, frame.pc);
    agent.with_debug_hook(|hook| hook.on_statement(&view));
}

/// Report a `debugger` statement; the frame has already stepped past it
pub(crate) fn notify_debugger_statement(agent: &mut Agent, frame: &Frame) {
    let view = view(agent, frame, frame.pc.saturating_sub(1));
    agent.with_debug_hook(|hook| hook.on_debugger_statement(&view));
}

// ==================== Execution Recorder ====================

/// Breakpoint configuration
#[derive(Debug, Clone)]
pub struct Breakpoint {
    /// Line number to break at
    pub line: u32,
    /// Is this breakpoint enabled?
    pub enabled: bool,
    /// Hit count
    pub hit_count: u64,
}

/// Debugger statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebuggerStats {
    pub statements: u64,
    pub debugger_statements: u64,
    pub breakpoint_hits: u64,
    pub history_len: usize,
}

#[derive(Default)]
struct RecorderState {
    history: VecDeque<FrameView>,
    breakpoints: HashMap<u32, Breakpoint>,
    stats: DebuggerStats,
}

/// A [`DebugHook`] recording statement views.
///
/// Clones share their state, so the embedder can keep one handle while
/// the runtime owns the other.
#[derive(Clone, Default)]
pub struct ExecutionRecorder {
    state: Rc<RefCell<RecorderState>>,
}

impl ExecutionRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_breakpoint(&self, line: u32) {
        self.state.borrow_mut().breakpoints.insert(
            line,
            Breakpoint {
                line,
                enabled: true,
                hit_count: 0,
            },
        );
    }

    pub fn remove_breakpoint(&self, line: u32) -> bool {
        self.state.borrow_mut().breakpoints.remove(&line).is_some()
    }

    pub fn breakpoint(&self, line: u32) -> Option<Breakpoint> {
        self.state.borrow().breakpoints.get(&line).cloned()
    }

    /// Recorded views, oldest first
    pub fn history(&self) -> Vec<FrameView> {
        self.state.borrow().history.iter().cloned().collect()
    }

    /// Every recorded value of a local, in execution order
    pub fn find_variable_changes(&self, name: &str) -> Vec<(u32, Value)> {
        let state = self.state.borrow();
        let mut changes: Vec<(u32, Value)> = Vec::new();
        for view in &state.history {
            if let Some(value) = view.local(name) {
                if changes.last().map_or(true, |(_, last)| !last.same_value(value)) {
                    changes.push((view.line, value.clone()));
                }
            }
        }
        changes
    }

    pub fn stats(&self) -> DebuggerStats {
        let state = self.state.borrow();
        DebuggerStats {
            history_len: state.history.len(),
            ..state.stats.clone()
        }
    }

    fn record(&self, view: &FrameView) {
        let mut state = self.state.borrow_mut();
        if state.history.len() >= MAX_HISTORY_SIZE {
            state.history.pop_front();
        }
        state.history.push_back(view.clone());
        let hit = match state.breakpoints.get_mut(&view.line) {
            Some(breakpoint) if breakpoint.enabled => {
                breakpoint.hit_count += 1;
                true
            }
            _ => false,
        };
        if hit {
            state.stats.breakpoint_hits += 1;
            tracing::debug!(line = view.line, function = %view.function, "breakpoint hit");
        }
    }
}

impl DebugHook for ExecutionRecorder {
    fn on_statement(&mut self, view: &FrameView) {
        self.state.borrow_mut().stats.statements += 1;
        self.record(view);
    }

    fn on_debugger_statement(&mut self, view: &FrameView) {
        self.state.borrow_mut().stats.debugger_statements += 1;
        tracing::debug!(line = view.line, function = %view.function, "debugger statement");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    #[test]
    fn test_recorder_sees_statements_and_locals() {
        let mut runtime = Runtime::new();
        let recorder = ExecutionRecorder::new();
        recorder.add_breakpoint(3);
        runtime.enter_debugging_mode(recorder.clone());
        runtime
            .eval("function f(a) {\n  var b = a * 2;\n  return b + 1;\n}\nf(5);")
            .unwrap();
        let history = recorder.history();
        let at_return = history.iter().find(|v| v.function == "f" && v.line == 3).unwrap();
        assert_eq!(at_return.local("b"), Some(&Value::Number(10.0)));
        assert_eq!(at_return.depth, 2);
        assert_eq!(recorder.breakpoint(3).map(|b| b.hit_count), Some(1));
        assert_eq!(recorder.find_variable_changes("a"), vec![(2, Value::Number(5.0))]);
    }

    #[test]
    fn test_debugger_statement_is_reported() {
        let mut runtime = Runtime::new();
        let recorder = ExecutionRecorder::new();
        runtime.enter_debugging_mode(recorder.clone());
        runtime.eval("var x = 1; debugger; x = 2;").unwrap();
        assert_eq!(recorder.stats().debugger_statements, 1);
        runtime.leave_debugging_mode();
        runtime.eval("debugger;").unwrap();
        assert_eq!(recorder.stats().debugger_statements, 1);
    }
}
