//! Engine configuration
//!
//! Thresholds here are policy, not semantics: any monotonic choice keeps
//! programs producing the same results, only tiering and timing change.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// When optimizing compilation runs relative to the triggering call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompileMode {
    /// Compile on the calling thread before the call proceeds
    Synchronous,
    /// Hand the job to a background thread and install it at a later call boundary
    Concurrent,
}

/// Tiering and compilation configuration for one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Hotness at which an interpreted function gets baseline code
    pub baseline_threshold: u32,
    /// Hotness at which a baseline function is queued for mid-level optimization
    pub optimize_threshold: u32,
    /// Additional hotness after mid-level optimization before top-level recompilation
    pub top_tier_threshold: u32,
    /// Loop back-edges counted as one unit of hotness
    pub back_edge_weight: u32,
    /// Distinct shapes a property site tracks before going megamorphic
    pub polymorphism_capacity: usize,
    /// Maximum bytecode length of an inlining candidate
    pub max_inlined_bytecode_size: usize,
    /// Maximum cumulative bytecode inlined into one optimized unit
    pub max_inlined_bytecode_cumulative: usize,
    /// Maximum depth of nested inlining
    pub max_inlining_depth: usize,
    /// Calls a function must make at the lower tier after a deopt before re-optimization
    pub deopt_cooldown: u32,
    /// Deoptimizations after which a function is pinned below the optimizing tiers
    pub max_deopts: u32,
    /// How optimizing compilation is scheduled
    pub compile_mode: CompileMode,
    /// Accept `%Name(...)` test directives in source
    pub allow_natives_syntax: bool,
    /// Maximum nesting of language-level calls before a RangeError is thrown
    pub max_call_depth: usize,
    /// Number of deoptimization events retained for inspection
    pub deopt_log_capacity: usize,
    /// Disable baseline and optimizing tiers entirely
    pub interpreter_only: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            baseline_threshold: 8,
            optimize_threshold: 64,
            top_tier_threshold: 256,
            back_edge_weight: 16,
            polymorphism_capacity: 4,
            max_inlined_bytecode_size: 120,
            max_inlined_bytecode_cumulative: 600,
            max_inlining_depth: 4,
            deopt_cooldown: 32,
            max_deopts: 8,
            compile_mode: CompileMode::Synchronous,
            allow_natives_syntax: true,
            max_call_depth: 800,
            deopt_log_capacity: 256,
            interpreter_only: false,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from JSON; missing fields take their defaults
    pub fn from_json(text: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Reject configurations that break tiering invariants
    pub fn validate(&self) -> Result<()> {
        if self.polymorphism_capacity < 2 {
            return Err(Error::ConfigError(
                "polymorphism_capacity must be at least 2".into(),
            ));
        }
        if self.back_edge_weight == 0 {
            return Err(Error::ConfigError("back_edge_weight must be non-zero".into()));
        }
        if self.optimize_threshold < self.baseline_threshold {
            return Err(Error::ConfigError(
                "optimize_threshold must not be below baseline_threshold".into(),
            ));
        }
        if self.max_call_depth == 0 {
            return Err(Error::ConfigError("max_call_depth must be non-zero".into()));
        }
        Ok(())
    }

    /// Configuration that never leaves the interpreter
    pub fn interpreter_only() -> Self {
        Self {
            interpreter_only: true,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json(r#"{"baseline_threshold": 2, "compile_mode": "concurrent"}"#).unwrap();
        assert_eq!(config.baseline_threshold, 2);
        assert_eq!(config.compile_mode, CompileMode::Concurrent);
        assert_eq!(config.polymorphism_capacity, 4);
    }

    #[test]
    fn test_invalid_capacity_rejected() {
        let err = EngineConfig::from_json(r#"{"polymorphism_capacity": 1}"#).unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_deopts": 3}}"#).unwrap();
        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_deopts, 3);
    }
}
