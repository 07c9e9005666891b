//! Function records
//!
//! A [`SharedFunctionInfo`] exists once per function literal and owns the
//! bytecode, the feedback vector and the baseline code; every closure
//! created from the literal shares them. A [`FunctionRecord`] exists once
//! per closure and carries the tiering state. Records live in the agent's
//! [`FunctionTable`] and point weakly at their closure object, so the
//! collector can drop a record once its closure is unreachable.

use super::value::{ObjectRef, Value};
use super::object::Object;
use crate::baseline::BaselineCode;
use crate::bytecode::Chunk;
use crate::feedback::FeedbackVector;
use crate::jit::InstalledCode;
use crate::tiering::{OptimizationLevel, TierState};
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::Arc;

/// Stable identity of a closure's [`FunctionRecord`]; never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub u32);

/// Index of a host function in the agent's native table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeId(pub u32);

/// Identity of a function literal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SharedId(pub u32);

/// Per-literal function data shared by all closures
pub struct SharedFunctionInfo {
    pub id: SharedId,
    pub name: String,
    pub chunk: Arc<Chunk>,
    /// Constant pool materialized as values
    pub constants: Vec<Value>,
    /// Nested function literals, indexed by `MakeClosure`
    pub children: Vec<Rc<SharedFunctionInfo>>,
    pub feedback: RefCell<FeedbackVector>,
    pub baseline: RefCell<Option<Rc<BaselineCode>>>,
}

impl SharedFunctionInfo {
    pub fn baseline_code(&self) -> Option<Rc<BaselineCode>> {
        self.baseline.borrow().clone()
    }
}

impl std::fmt::Debug for SharedFunctionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedFunctionInfo")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("bytecode_length", &self.chunk.code.len())
            .finish()
    }
}

/// Tiering state of one closure
pub struct FunctionRecord {
    pub id: FunctionId,
    pub shared: Rc<SharedFunctionInfo>,
    /// The closure object; weak so the record does not keep it alive
    pub object: Weak<RefCell<Object>>,
    pub tier: TierState,
    pub invocation_count: u64,
    /// Invocations plus weighted loop back-edges since the last tier change
    pub hotness: u32,
    /// Back-edges not yet folded into `hotness`
    pub back_edges: u32,
    /// Set by `%NeverOptimizeFunction`; pins the function below the optimizing tiers
    pub never_optimize: bool,
    /// Set after a failed compile or too many deopts
    pub optimization_disabled: bool,
    pub deopt_count: u32,
    /// Calls left before the function may be optimized again
    pub cooldown: u32,
    pub optimized: Option<Rc<InstalledCode>>,
    /// Pending `%Optimize...OnNextCall` request
    pub marked: Option<OptimizationLevel>,
    /// A background compile job is in flight
    pub pending_job: bool,
    /// `%PrepareFunctionForOptimization` was called
    pub prepared: bool,
}

impl FunctionRecord {
    fn new(id: FunctionId, shared: Rc<SharedFunctionInfo>, object: &ObjectRef) -> Self {
        Self {
            id,
            shared,
            object: Rc::downgrade(object),
            tier: TierState::Interpreted,
            invocation_count: 0,
            hotness: 0,
            back_edges: 0,
            never_optimize: false,
            optimization_disabled: false,
            deopt_count: 0,
            cooldown: 0,
            optimized: None,
            marked: None,
            pending_job: false,
            prepared: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether the optimizing tiers may compile this function
    pub fn can_optimize(&self) -> bool {
        !self.never_optimize && !self.optimization_disabled
    }

    /// Optimized code that is still valid
    pub fn valid_code(&self) -> Option<Rc<InstalledCode>> {
        self.optimized.as_ref().filter(|code| code.is_valid()).cloned()
    }

    pub fn is_alive(&self) -> bool {
        self.object.strong_count() > 0
    }
}

/// Agent-owned table of all function records
#[derive(Default)]
pub struct FunctionTable {
    records: Vec<Option<FunctionRecord>>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a record for a new closure
    pub fn insert(&mut self, shared: Rc<SharedFunctionInfo>, object: &ObjectRef) -> FunctionId {
        let id = FunctionId(self.records.len() as u32);
        self.records.push(Some(FunctionRecord::new(id, shared, object)));
        id
    }

    /// Reserve an id before the closure object exists
    pub fn next_id(&self) -> FunctionId {
        FunctionId(self.records.len() as u32)
    }

    pub fn get(&self, id: FunctionId) -> Option<&FunctionRecord> {
        self.records.get(id.0 as usize).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: FunctionId) -> Option<&mut FunctionRecord> {
        self.records.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    pub fn remove(&mut self, id: FunctionId) -> Option<FunctionRecord> {
        self.records.get_mut(id.0 as usize).and_then(Option::take)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FunctionRecord> {
        self.records.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut FunctionRecord> {
        self.records.iter_mut().flatten()
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
