//! Quickjit: a tiered execution engine for a JavaScript subset
//!
//! Functions start in a bytecode interpreter that records type feedback.
//! Hot functions move to baseline code and then to an optimizing compiler
//! that speculates on that feedback. When a speculation fails, the
//! optimized frame is deoptimized: the engine rebuilds the interpreter
//! frames it stands for, including frames of inlined callees and objects
//! removed by escape analysis, and continues as if it had never left the
//! interpreter.
//!
//! # Quick Start
//!
//! ```no_run
//! use quickjit::{Runtime, Value};
//!
//! fn main() -> quickjit::Result<()> {
//!     let mut runtime = Runtime::new();
//!     let result = runtime.eval("function sq(x) { return x * x; } sq(7)")?;
//!     assert_eq!(result, Value::Number(49.0));
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! Source → [`lexer`] → [`parser`] → [`ast`] → [`bytecode`] → [`interpreter`]
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Front end** | [`lexer`], [`parser`], [`ast`], [`bytecode`] |
//! | **Tiers** | [`interpreter`], [`baseline`], [`jit`] |
//! | **Speculation** | [`feedback`], [`tiering`], [`deopt`] |
//! | **Runtime** | [`runtime`], [`gc`], [`workers`], [`debugger`] |
#![allow(clippy::too_many_arguments)]
#![allow(clippy::new_without_default)]
#![allow(clippy::enum_variant_names)]

pub mod ast;
pub mod baseline;
pub mod bytecode;
pub mod config;
pub mod debugger;
pub mod deopt;
pub mod feedback;
pub mod gc;
pub mod interpreter;
pub mod jit;
pub mod lexer;
pub mod parser;
pub mod runtime;
pub mod tiering;
pub mod workers;

mod error;

pub use config::{CompileMode, EngineConfig};
pub use debugger::{DebugHook, FrameView};
pub use deopt::{DeoptEvent, DeoptReason};
pub use error::{Error, ErrorKind, Result};
pub use gc::GcStats;
pub use runtime::{ObjectKind, Runtime, Value};
pub use tiering::{OptimizationLevel, OptimizationStatus, TieringStats};
pub use workers::{Message, SharedRegion, WorkerPool, WorkerReport};

/// Quickjit version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
