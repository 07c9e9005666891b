//! The agent: one isolated execution context
//!
//! An [`Agent`] owns everything a running program can reach: shapes,
//! function records, globals, the realm's prototypes, the activation
//! stack, the tiering controller and the deoptimization log. Script code
//! of one agent runs on a single thread; separate agents share nothing
//! but an explicitly opted-in [`SharedRegion`].

use super::builtins;
use super::function::{FunctionId, FunctionTable, NativeId, SharedFunctionInfo, SharedId};
use super::intern::Interner;
use super::object::{Object, ObjectKind};
use super::shape::{PropertyKind, ShapeKind, ShapeTable};
use super::validity::ValidityCell;
use super::value::{ObjectRef, Value};
use super::{Abrupt, Completion, Name};
use crate::bytecode::{Chunk, Constant};
use crate::config::EngineConfig;
use crate::debugger::DebugHook;
use crate::deopt::{DeoptEvent, DeoptReason};
use crate::error::{Error, ErrorKind};
use crate::feedback::FeedbackVector;
use crate::tiering::{OptimizationLevel, TieringController};
use crate::workers::{Message, SharedRegion};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rustc_hash::FxHashMap as HashMap;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

/// Host function signature: `(agent, this, arguments)`
pub type NativeFn = Rc<dyn Fn(&mut Agent, &Value, &[Value]) -> Completion<Value>>;

/// Wrap a closure as a [`NativeFn`]
pub fn native_fn(f: impl Fn(&mut Agent, &Value, &[Value]) -> Completion<Value> + 'static) -> NativeFn {
    Rc::new(f)
}

/// A registered host function
pub struct NativeFunction {
    pub name: String,
    pub function: NativeFn,
}

/// Prototype objects every agent starts with
pub struct Realm {
    pub object_prototype: ObjectRef,
    pub function_prototype: ObjectRef,
    pub array_prototype: ObjectRef,
    pub generator_prototype: ObjectRef,
    pub error_prototype: ObjectRef,
}

// ==================== Globals ====================

/// Storage for one global binding
pub struct GlobalCell {
    pub value: Value,
    /// Number of assignments after declaration
    pub stores: u32,
    validity: Option<ValidityCell>,
}

impl GlobalCell {
    /// Cell invalidated by the next store to this global
    pub fn validity_cell(&mut self) -> ValidityCell {
        self.validity.get_or_insert_with(ValidityCell::new).clone()
    }

    fn store(&mut self, value: Value) {
        if let Some(cell) = self.validity.take() {
            cell.invalidate();
        }
        self.stores = self.stores.saturating_add(1);
        self.value = value;
    }
}

/// The global object's bindings
#[derive(Default)]
pub struct Globals {
    cells: HashMap<Name, GlobalCell>,
}

impl Globals {
    pub fn get(&self, name: Name) -> Option<&Value> {
        self.cells.get(&name).map(|cell| &cell.value)
    }

    pub fn cell(&self, name: Name) -> Option<&GlobalCell> {
        self.cells.get(&name)
    }

    pub fn cell_mut(&mut self, name: Name) -> Option<&mut GlobalCell> {
        self.cells.get_mut(&name)
    }

    /// Hoisted declaration: creates the binding as undefined if missing
    pub fn declare(&mut self, name: Name) {
        self.cells.entry(name).or_insert_with(|| GlobalCell {
            value: Value::Undefined,
            stores: 0,
            validity: None,
        });
    }

    /// Assign a global, creating it if needed
    pub fn store(&mut self, name: Name, value: Value) {
        match self.cells.get_mut(&name) {
            Some(cell) => cell.store(value),
            None => {
                self.cells.insert(
                    name,
                    GlobalCell {
                        value,
                        stores: 1,
                        validity: None,
                    },
                );
            }
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

// ==================== Activations ====================

/// Which tier an activation is executing in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Interpreted,
    Baseline,
    Optimized(OptimizationLevel),
}

impl FrameKind {
    pub fn tier_name(self) -> &'static str {
        match self {
            FrameKind::Interpreted => "interpreted",
            FrameKind::Baseline => "baseline",
            FrameKind::Optimized(OptimizationLevel::Mid) => "optimized-mid",
            FrameKind::Optimized(OptimizationLevel::Top) => "optimized-top",
        }
    }
}

/// One in-flight call on the agent's stack
#[derive(Debug, Clone)]
pub struct Activation {
    pub function: FunctionId,
    pub kind: FrameKind,
    /// Set when the activation must leave optimized code at its next safepoint
    pub deopt_requested: Option<DeoptReason>,
}

impl Activation {
    pub fn new(function: FunctionId, kind: FrameKind) -> Self {
        Self {
            function,
            kind,
            deopt_requested: None,
        }
    }
}

// ==================== Template Site Cache ====================

/// Memoized strings arrays of tagged template call sites
///
/// Keyed by function literal and site index, so every evaluation of one
/// site sees the same array. Owned by the agent and cleared when it is
/// torn down.
#[derive(Default)]
pub struct TemplateSiteCache {
    sites: HashMap<(SharedId, u32), ObjectRef>,
}

impl TemplateSiteCache {
    pub fn get(&self, function: SharedId, site: u32) -> Option<ObjectRef> {
        self.sites.get(&(function, site)).cloned()
    }

    pub fn insert(&mut self, function: SharedId, site: u32, object: ObjectRef) {
        self.sites.insert((function, site), object);
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn clear(&mut self) {
        self.sites.clear();
    }
}

// ==================== Agent ====================

/// An isolated execution context
pub struct Agent {
    pub config: EngineConfig,
    pub interner: Interner,
    pub shapes: ShapeTable,
    pub functions: FunctionTable,
    pub globals: Globals,
    pub realm: Realm,
    natives: Vec<NativeFunction>,
    pub activations: Vec<Activation>,
    pub tiering: TieringController,
    pub templates: TemplateSiteCache,
    debugger: Option<Box<dyn DebugHook>>,
    debugging: bool,
    pub deopt_log: VecDeque<DeoptEvent>,
    /// Lines written by `print` and `console.log`
    pub output: Vec<String>,
    /// Also write printed lines to stdout
    pub echo_output: bool,
    /// Memory shared with other agents, if this agent was given any
    pub shared_region: Option<SharedRegion>,
    /// Messages posted to the host with `postMessage`
    pub outbox: Vec<Message>,
    pub rng: StdRng,
    next_shared_id: u32,
}

impl Agent {
    pub fn new(config: EngineConfig) -> Self {
        let mut shapes = ShapeTable::new();
        let root = shapes.root(None, ShapeKind::Ordinary);
        let object_prototype = Rc::new(RefCell::new(Object::new(root, ObjectKind::Ordinary)));
        let derived = shapes.root(Some(&object_prototype), ShapeKind::Ordinary);
        let make = || Rc::new(RefCell::new(Object::new(derived, ObjectKind::Ordinary)));
        let realm = Realm {
            function_prototype: make(),
            array_prototype: make(),
            generator_prototype: make(),
            error_prototype: make(),
            object_prototype,
        };

        let mut agent = Self {
            tiering: TieringController::new(),
            config,
            interner: Interner::new(),
            shapes,
            functions: FunctionTable::new(),
            globals: Globals::default(),
            realm,
            natives: Vec::new(),
            activations: Vec::new(),
            templates: TemplateSiteCache::default(),
            debugger: None,
            debugging: false,
            deopt_log: VecDeque::new(),
            output: Vec::new(),
            echo_output: false,
            shared_region: None,
            outbox: Vec::new(),
            rng: StdRng::from_entropy(),
            next_shared_id: 0,
        };
        builtins::install(&mut agent);
        agent
    }

    pub fn intern(&mut self, s: &str) -> Name {
        self.interner.intern(s)
    }

    // ========== Allocation ==========

    /// Allocate an ordinary object with the given prototype
    pub fn create_object(&mut self, proto: Option<&ObjectRef>) -> ObjectRef {
        let shape = self.shapes.root(proto, ShapeKind::Ordinary);
        Rc::new(RefCell::new(Object::new(shape, ObjectKind::Ordinary)))
    }

    /// Allocate `{}`
    pub fn create_plain_object(&mut self) -> ObjectRef {
        let proto = self.realm.object_prototype.clone();
        self.create_object(Some(&proto))
    }

    pub fn create_array(&mut self, elements: Vec<Value>) -> ObjectRef {
        let proto = self.realm.array_prototype.clone();
        let shape = self.shapes.root(Some(&proto), ShapeKind::Array);
        Rc::new(RefCell::new(Object::new(shape, ObjectKind::Array(elements))))
    }

    /// Materialize the per-literal data for a compiled chunk and its nested functions
    pub fn create_shared(&mut self, chunk: Arc<Chunk>) -> Rc<SharedFunctionInfo> {
        let children = chunk
            .functions
            .iter()
            .map(|child| self.create_shared(child.clone()))
            .collect();
        let constants = chunk
            .constants
            .iter()
            .map(|constant| match constant {
                Constant::Number(n) => Value::Number(*n),
                Constant::String(s) => Value::string(s),
            })
            .collect();
        let id = SharedId(self.next_shared_id);
        self.next_shared_id += 1;
        Rc::new(SharedFunctionInfo {
            id,
            name: chunk.name.clone(),
            feedback: RefCell::new(FeedbackVector::new(&chunk.slot_kinds, self.config.polymorphism_capacity)),
            baseline: RefCell::new(None),
            constants,
            children,
            chunk,
        })
    }

    /// Create a closure with a fresh function record
    pub fn create_closure(&mut self, shared: Rc<SharedFunctionInfo>) -> ObjectRef {
        let prototype = self.create_plain_object();
        let function_prototype = self.realm.function_prototype.clone();
        let root = self.shapes.root(Some(&function_prototype), ShapeKind::Function);
        let prototype_name = self.interner.names.prototype;
        let shape = self.shapes.transition(root, prototype_name, PropertyKind::Data);
        let id = self.functions.next_id();
        let mut object = Object::new(shape, ObjectKind::Function(id));
        object.slots.push(Value::Object(prototype));
        let object = Rc::new(RefCell::new(object));
        self.functions.insert(shared, &object);
        object
    }

    /// Register a host function and return its function object
    pub fn create_native(&mut self, name: &str, function: NativeFn) -> ObjectRef {
        let id = NativeId(self.natives.len() as u32);
        self.natives.push(NativeFunction {
            name: name.to_string(),
            function,
        });
        let function_prototype = self.realm.function_prototype.clone();
        let shape = self.shapes.root(Some(&function_prototype), ShapeKind::Function);
        Rc::new(RefCell::new(Object::new(shape, ObjectKind::Native(id))))
    }

    pub fn native(&self, id: NativeId) -> Option<&NativeFunction> {
        self.natives.get(id.0 as usize)
    }

    /// Define a host function as a global binding
    pub fn register_native(&mut self, name: &str, function: NativeFn) {
        let object = self.create_native(name, function);
        let symbol = self.intern(name);
        self.globals.store(symbol, Value::Object(object));
    }

    /// Define a host function as a method of `target`
    pub fn define_native_method(&mut self, target: &ObjectRef, name: &str, function: NativeFn) {
        let object = self.create_native(name, function);
        let symbol = self.intern(name);
        self.define_own_property(target, symbol, Value::Object(object));
    }

    /// Allocate an error object with `name` and `message` own properties
    pub fn create_error(&mut self, kind: ErrorKind, message: &str) -> Value {
        let proto = self.realm.error_prototype.clone();
        let error = self.create_object(Some(&proto));
        let names = self.interner.names;
        self.define_own_property(&error, names.name, Value::string(kind.name()));
        self.define_own_property(&error, names.message, Value::string(message));
        Value::Object(error)
    }

    // ========== Exceptions ==========

    /// A language-level exception of the given kind
    pub fn throw_error(&mut self, kind: ErrorKind, message: impl AsRef<str>) -> Abrupt {
        Abrupt::Throw(self.create_error(kind, message.as_ref()))
    }

    pub fn type_error(&mut self, message: impl AsRef<str>) -> Abrupt {
        self.throw_error(ErrorKind::TypeError, message)
    }

    pub fn reference_error(&mut self, message: impl AsRef<str>) -> Abrupt {
        self.throw_error(ErrorKind::ReferenceError, message)
    }

    pub fn range_error(&mut self, message: impl AsRef<str>) -> Abrupt {
        self.throw_error(ErrorKind::RangeError, message)
    }

    /// Convert an abrupt completion that escaped to the host into an [`Error`]
    pub fn abrupt_to_error(&mut self, abrupt: Abrupt) -> Error {
        match abrupt {
            Abrupt::Fatal(error) => error,
            Abrupt::Throw(value) => {
                let names = self.interner.names;
                if let Value::Object(object) = &value {
                    let message = self.get_data_property(object, names.message);
                    let name = self.get_data_property(object, names.name);
                    if let (Some(message), Some(name)) = (message, name) {
                        return Error::RuntimeError {
                            kind: ErrorKind::from_name(&self.to_string(&name)),
                            message: self.to_string(&message).to_string(),
                        };
                    }
                }
                Error::Uncaught(self.to_display_string(&value))
            }
        }
    }

    // ========== Debugging ==========

    pub fn debugging(&self) -> bool {
        self.debugging
    }

    /// Install a hook and drop every function out of the optimized and baseline tiers
    pub fn enter_debugging_mode(&mut self, hook: Box<dyn DebugHook>) {
        self.debugger = Some(hook);
        if self.debugging {
            return;
        }
        self.debugging = true;
        crate::tiering::suspend_for_debugging(self);
    }

    /// Remove the hook; tier-up resumes
    pub fn leave_debugging_mode(&mut self) -> Option<Box<dyn DebugHook>> {
        self.debugging = false;
        tracing::debug!("leaving debugging mode");
        self.debugger.take()
    }

    /// Run `f` with the installed hook, if any
    pub fn with_debug_hook(&mut self, f: impl FnOnce(&mut dyn DebugHook)) {
        if let Some(mut hook) = self.debugger.take() {
            f(hook.as_mut());
            if self.debugging && self.debugger.is_none() {
                self.debugger = Some(hook);
            }
        }
    }

    // ========== Introspection ==========

    /// Kind of the innermost activation
    pub fn current_frame_kind(&self) -> FrameKind {
        self.activations
            .last()
            .map(|activation| activation.kind)
            .unwrap_or(FrameKind::Interpreted)
    }

    pub fn set_current_frame_kind(&mut self, kind: FrameKind) {
        if let Some(activation) = self.activations.last_mut() {
            activation.kind = kind;
        }
    }

    /// Append a deoptimization event, dropping the oldest past capacity
    pub fn log_deopt(&mut self, event: DeoptEvent) {
        if self.config.deopt_log_capacity == 0 {
            return;
        }
        while self.deopt_log.len() >= self.config.deopt_log_capacity {
            self.deopt_log.pop_front();
        }
        self.deopt_log.push_back(event);
    }

    /// Write a line of program output
    pub fn print(&mut self, line: String) {
        if self.echo_output {
            println!("{}", line);
        }
        self.output.push(line);
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.templates.clear();
        self.tiering.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_stores_invalidate_cells() {
        let mut agent = Agent::new(EngineConfig::default());
        let name = agent.intern("counter");
        agent.globals.declare(name);
        assert_eq!(agent.globals.cell(name).map(|c| c.stores), Some(0));
        agent.globals.store(name, Value::Number(1.0));
        let cell = agent.globals.cell_mut(name).map(|c| c.validity_cell()).unwrap();
        assert!(cell.is_valid());
        agent.globals.store(name, Value::Number(2.0));
        assert!(!cell.is_valid());
        assert_eq!(agent.globals.get(name), Some(&Value::Number(2.0)));
    }

    #[test]
    fn test_closures_get_records_and_prototypes() {
        let mut agent = Agent::new(EngineConfig::default());
        let shared = agent.create_shared(Arc::new(Chunk::new("f")));
        let a = agent.create_closure(shared.clone());
        let b = agent.create_closure(shared);
        let (ida, idb) = (a.borrow().function_id().unwrap(), b.borrow().function_id().unwrap());
        assert_ne!(ida, idb);
        assert_eq!(agent.functions.get(ida).map(|r| r.name().to_string()), Some("f".to_string()));
        let prototype = agent.interner.names.prototype;
        assert!(matches!(agent.get_data_property(&a, prototype), Some(Value::Object(_))));
    }

    #[test]
    fn test_deopt_log_is_bounded() {
        let mut config = EngineConfig::default();
        config.deopt_log_capacity = 2;
        let mut agent = Agent::new(config);
        for offset in 0..3 {
            agent.log_deopt(DeoptEvent::for_test(DeoptReason::WrongShape, offset));
        }
        assert_eq!(agent.deopt_log.len(), 2);
        assert_eq!(agent.deopt_log.front().map(|e| e.bytecode_offset), Some(1));
    }
}
