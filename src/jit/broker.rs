//! Heap broker
//!
//! Everything the optimizing compiler may know about the heap is gathered
//! here, on the main thread, before compilation starts. The result splits
//! into a [`CompilationInput`] that holds no heap references (and can
//! move to the compiler thread) and a [`LinkContext`] that keeps the heap
//! values and the validity cells the code will depend on.

use super::ir::{ConstantValue, PropertyAccess};
use super::CompileError;
use crate::bytecode::{Chunk, Instruction};
use crate::feedback::{CallFeedback, ElementHint, FeedbackSnapshot};
use crate::runtime::{
    Agent, FunctionId, Name, ObjectKind, ObjectRef, PropertyKind, ShapeId, ShapeKind, SharedFunctionInfo,
    ValidityCell, Value,
};
use crate::tiering::OptimizationLevel;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

/// Upper bound on the functions considered for one compilation
const MAX_CANDIDATES: usize = 16;
/// Upper bound on object literal shapes captured
const MAX_LITERAL_SHAPES: usize = 256;
const MAX_GRAPH_NODES: usize = 10_000;

/// A global binding speculated to be constant
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalInfo {
    pub value: ConstantValue,
    /// Script function the global holds, if any
    pub function: Option<FunctionId>,
}

/// A monomorphic named store resolved against its receiver shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreAccess {
    pub shape: ShapeId,
    pub slot: u32,
    /// Shape after the store when it adds the property
    pub transition: Option<ShapeId>,
}

/// Object literal layout reachable from the literal root
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiteralShape {
    pub slots: u32,
    pub transitions: HashMap<Name, ShapeId>,
}

/// One function the compilation may reference: the compiled function at
/// index 0, followed by inlining candidates
#[derive(Debug, Clone)]
pub struct FunctionInput {
    pub id: FunctionId,
    pub name: String,
    pub chunk: Arc<Chunk>,
    pub feedback: FeedbackSnapshot,
    /// Named load sites resolved per observed shape
    pub loads: HashMap<u32, Vec<(ShapeId, PropertyAccess)>>,
    /// Named store sites with a single resolved shape
    pub stores: HashMap<u32, StoreAccess>,
    /// Keyed sites that only ever saw in-bounds int32 array accesses
    pub keyed_arrays: HashSet<u32>,
    /// Shape of the receiver `new` allocates for this function
    pub construct_shape: Option<ShapeId>,
}

impl FunctionInput {
    pub fn size(&self) -> usize {
        self.chunk.code.len()
    }
}

/// Compilation budgets copied from the engine configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_inlined_bytecode_size: usize,
    pub max_inlined_bytecode_cumulative: usize,
    pub max_inlining_depth: usize,
    pub max_nodes: usize,
}

/// Heap-free input to graph building
#[derive(Debug, Clone)]
pub struct CompilationInput {
    pub level: OptimizationLevel,
    pub functions: Vec<FunctionInput>,
    pub globals: HashMap<Name, GlobalInfo>,
    /// Heap constants that are script functions
    pub heap_functions: HashMap<u32, FunctionId>,
    pub literal_root: ShapeId,
    pub literal_shapes: HashMap<ShapeId, LiteralShape>,
    pub limits: Limits,
}

impl CompilationInput {
    /// Index of a function's input, if it was captured
    pub fn function_index(&self, id: FunctionId) -> Option<usize> {
        self.functions.iter().position(|function| function.id == id)
    }
}

/// Main-thread state the installed code links against
#[derive(Debug, Clone, Default)]
pub struct LinkContext {
    /// Values of `ConstantValue::Heap` constants
    pub heap: Vec<Value>,
    /// Cells guarding every assumption baked into the code
    pub dependencies: Vec<ValidityCell>,
    /// Per function index
    pub frames: Vec<Rc<SharedFunctionInfo>>,
    pub function_ids: Vec<FunctionId>,
}

/// A prepared compilation job
pub struct Prepared {
    input: CompilationInput,
    link: LinkContext,
}

impl Prepared {
    pub fn input(&self) -> &CompilationInput {
        &self.input
    }

    pub fn into_parts(self) -> (CompilationInput, LinkContext) {
        (self.input, self.link)
    }
}

/// Snapshot what compiling `id` at `level` needs
pub fn prepare(agent: &mut Agent, id: FunctionId, level: OptimizationLevel) -> Result<Prepared, CompileError> {
    let record = agent.functions.get(id).ok_or(CompileError::MissingFunction)?;
    let chunk = &record.shared.chunk;
    if chunk.is_generator {
        return Err(CompileError::Unsupported("generator function".into()));
    }
    if chunk.has_handlers {
        return Err(CompileError::Unsupported("exception handlers".into()));
    }

    let config = &agent.config;
    let limits = Limits {
        max_inlined_bytecode_size: config.max_inlined_bytecode_size,
        max_inlined_bytecode_cumulative: config.max_inlined_bytecode_cumulative,
        max_inlining_depth: config.max_inlining_depth,
        max_nodes: MAX_GRAPH_NODES,
    };
    let object_prototype = agent.realm.object_prototype.clone();
    let literal_root = agent.shapes.root(Some(&object_prototype), ShapeKind::Ordinary);

    let mut broker = Broker {
        agent,
        link: LinkContext::default(),
        heap_index: HashMap::default(),
        heap_functions: HashMap::default(),
        globals: HashMap::default(),
    };

    let mut functions = Vec::new();
    let mut queue = VecDeque::from([(id, 0usize)]);
    let mut seen = HashSet::default();
    seen.insert(id);
    while let Some((function, depth)) = queue.pop_front() {
        let Some(input) = broker.function_input(function) else {
            continue;
        };
        if level == OptimizationLevel::Top && depth < limits.max_inlining_depth {
            for candidate in broker.call_candidates(&input) {
                if functions.len() + queue.len() + 1 >= MAX_CANDIDATES {
                    break;
                }
                if broker.inlinable(candidate, limits.max_inlined_bytecode_size) && seen.insert(candidate) {
                    queue.push_back((candidate, depth + 1));
                }
            }
        }
        functions.push(input);
    }
    if functions.is_empty() {
        return Err(CompileError::MissingFunction);
    }

    let literal_shapes = broker.literal_shapes(literal_root);
    let Broker {
        link,
        heap_functions,
        globals,
        ..
    } = broker;
    tracing::trace!(
        function = %functions[0].name,
        level = level.as_str(),
        candidates = functions.len() - 1,
        dependencies = link.dependencies.len(),
        "prepared compilation input"
    );
    Ok(Prepared {
        input: CompilationInput {
            level,
            functions,
            globals,
            heap_functions,
            literal_root,
            literal_shapes,
            limits,
        },
        link,
    })
}

struct Broker<'a> {
    agent: &'a mut Agent,
    link: LinkContext,
    /// Pointer identity of heap constants already captured
    heap_index: HashMap<usize, u32>,
    heap_functions: HashMap<u32, FunctionId>,
    globals: HashMap<Name, GlobalInfo>,
}

impl Broker<'_> {
    fn function_input(&mut self, id: FunctionId) -> Option<FunctionInput> {
        let record = self.agent.functions.get(id)?;
        let shared = record.shared.clone();
        let closure = record.object.upgrade();
        let feedback = shared.feedback.borrow().snapshot();
        let chunk = shared.chunk.clone();

        let mut loads = HashMap::default();
        let mut stores = HashMap::default();
        let mut keyed_arrays = HashSet::default();
        for instruction in &chunk.code {
            match *instruction {
                Instruction::GetGlobal(name) => self.capture_global(name),
                Instruction::GetNamed { name, slot } => {
                    let shapes = match feedback.slot(slot).and_then(|s| s.shapes()) {
                        Some(observation) if !observation.is_megamorphic() => observation.shapes().to_vec(),
                        _ => continue,
                    };
                    if shapes.is_empty() {
                        continue;
                    }
                    let accesses: Option<Vec<_>> = shapes
                        .iter()
                        .map(|&shape| self.resolve_load(shape, name).map(|access| (shape, access)))
                        .collect();
                    if let Some(accesses) = accesses {
                        loads.insert(slot, accesses);
                    }
                }
                Instruction::SetNamed { name, slot } => {
                    let shapes = feedback.slot(slot).and_then(|s| s.shapes()).map(|o| o.shapes().to_vec());
                    if let Some(&[shape]) = shapes.as_deref() {
                        if let Some(access) = self.resolve_store(shape, name) {
                            stores.insert(slot, access);
                        }
                    }
                }
                Instruction::GetKeyed { slot } | Instruction::SetKeyed { slot } => {
                    if feedback.slot(slot).map(|s| s.element()) == Some(ElementHint::ArrayInt32Index) {
                        keyed_arrays.insert(slot);
                    }
                }
                _ => {}
            }
        }

        let construct_shape = closure.and_then(|closure| self.construct_shape(&closure));
        let index = self.link.frames.len();
        self.link.frames.push(shared.clone());
        self.link.function_ids.push(id);
        tracing::trace!(function = %shared.name, index, "captured function input");
        Some(FunctionInput {
            id,
            name: shared.name.clone(),
            chunk,
            feedback,
            loads,
            stores,
            keyed_arrays,
            construct_shape,
        })
    }

    /// Functions `input` calls that could be inlined
    fn call_candidates(&self, input: &FunctionInput) -> Vec<FunctionId> {
        let mut candidates = Vec::new();
        for instruction in &input.chunk.code {
            let slot = match *instruction {
                Instruction::Call { slot, .. } | Instruction::New { slot, .. } => slot,
                Instruction::GetGlobal(name) => {
                    if let Some(function) = self.globals.get(&name).and_then(|g| g.function) {
                        candidates.push(function);
                    }
                    continue;
                }
                _ => continue,
            };
            if let Some(CallFeedback::Monomorphic(target)) = input.feedback.slot(slot).map(|s| s.call()) {
                candidates.push(target);
            }
        }
        for accesses in input.loads.values() {
            for (_, access) in accesses {
                if let PropertyAccess::Constant(ConstantValue::Heap(index)) = access {
                    if let Some(&function) = self.heap_functions.get(index) {
                        candidates.push(function);
                    }
                }
            }
        }
        candidates
    }

    fn inlinable(&self, id: FunctionId, max_size: usize) -> bool {
        self.agent.functions.get(id).is_some_and(|record| {
            let chunk = &record.shared.chunk;
            record.can_optimize()
                && record.is_alive()
                && !chunk.has_handlers
                && !chunk.is_generator
                && !chunk.is_script
                && chunk.code.len() <= max_size
        })
    }

    // ========== Heap Constants ==========

    /// Constant for a heap value, registering objects with the link context
    fn constant(&mut self, value: &Value) -> ConstantValue {
        match value {
            Value::Undefined => ConstantValue::Undefined,
            Value::Null => ConstantValue::Null,
            Value::Boolean(b) => ConstantValue::Boolean(*b),
            Value::Number(n) => ConstantValue::Number(*n),
            Value::String(s) => ConstantValue::String(Arc::from(&**s)),
            Value::Object(object) => {
                let key = Rc::as_ptr(object) as *const () as usize;
                if let Some(&index) = self.heap_index.get(&key) {
                    return ConstantValue::Heap(index);
                }
                let index = self.link.heap.len() as u32;
                self.link.heap.push(value.clone());
                self.heap_index.insert(key, index);
                if let Some(function) = object.borrow().function_id() {
                    self.heap_functions.insert(index, function);
                }
                ConstantValue::Heap(index)
            }
        }
    }

    fn depend_on_object(&mut self, object: &ObjectRef) {
        let cell = object.borrow_mut().validity_cell();
        if !self.link.dependencies.iter().any(|existing| existing.ptr_eq(&cell)) {
            self.link.dependencies.push(cell);
        }
    }

    /// Speculate that a rarely written global keeps its current value
    fn capture_global(&mut self, name: Name) {
        if self.globals.contains_key(&name) {
            return;
        }
        let value = match self.agent.globals.cell(name) {
            Some(cell) if cell.stores <= 1 => cell.value.clone(),
            _ => return,
        };
        let Some(cell) = self.agent.globals.cell_mut(name).map(|cell| cell.validity_cell()) else {
            return;
        };
        self.link.dependencies.push(cell);
        let function = value.as_object().and_then(|object| object.borrow().function_id());
        let value = self.constant(&value);
        self.globals.insert(name, GlobalInfo { value, function });
    }

    // ========== Property Resolution ==========

    /// How `name` loads from receivers of `shape`; `None` when a getter is involved
    fn resolve_load(&mut self, shape: ShapeId, name: Name) -> Option<PropertyAccess> {
        let shapes = &self.agent.shapes;
        if name == self.agent.interner.names.length && shapes.kind(shape) == ShapeKind::Array {
            return Some(PropertyAccess::ArrayLength);
        }
        match shapes.lookup(shape, name) {
            Some((slot, PropertyKind::Data)) => return Some(PropertyAccess::Field(slot)),
            Some((_, PropertyKind::Getter)) => return None,
            None => {}
        }
        let mut holder = shapes.proto(shape);
        let mut visited = Vec::new();
        while let Some(proto) = holder {
            visited.push(proto.clone());
            let (lookup, next) = {
                let borrowed = proto.borrow();
                if matches!(borrowed.kind, ObjectKind::Array(_)) && name == self.agent.interner.names.length {
                    return None;
                }
                let lookup = self
                    .agent
                    .shapes
                    .lookup(borrowed.shape, name)
                    .map(|(slot, kind)| (kind, borrowed.slots.get(slot as usize).cloned().unwrap_or_default()));
                (lookup, self.agent.shapes.proto(borrowed.shape))
            };
            match lookup {
                Some((PropertyKind::Getter, _)) => return None,
                Some((PropertyKind::Data, value)) => {
                    for object in &visited {
                        self.depend_on_object(object);
                    }
                    return Some(PropertyAccess::Constant(self.constant(&value)));
                }
                None => holder = next,
            }
        }
        for object in &visited {
            self.depend_on_object(object);
        }
        Some(PropertyAccess::Undefined)
    }

    /// How a store of `name` lands on receivers of `shape`
    fn resolve_store(&mut self, shape: ShapeId, name: Name) -> Option<StoreAccess> {
        let shapes = &self.agent.shapes;
        if name == self.agent.interner.names.length && shapes.kind(shape) == ShapeKind::Array {
            return None;
        }
        match shapes.lookup(shape, name) {
            Some((slot, PropertyKind::Data)) => {
                return Some(StoreAccess {
                    shape,
                    slot,
                    transition: None,
                })
            }
            Some((_, PropertyKind::Getter)) => return None,
            None => {}
        }
        let target = shapes.find_transition(shape, name, PropertyKind::Data)?;
        let slot = shapes.get(shape).slot_count() as u32;
        // a getter anywhere up the chain swallows the store
        let mut holder = shapes.proto(shape);
        let mut visited = Vec::new();
        while let Some(proto) = holder {
            let next = {
                let borrowed = proto.borrow();
                if let Some((_, PropertyKind::Getter)) = self.agent.shapes.lookup(borrowed.shape, name) {
                    return None;
                }
                self.agent.shapes.proto(borrowed.shape)
            };
            visited.push(proto);
            holder = next;
        }
        for object in &visited {
            self.depend_on_object(object);
        }
        Some(StoreAccess {
            shape,
            slot,
            transition: Some(target),
        })
    }

    /// Receiver shape `new closure` allocates, guarded by the closure's cell
    fn construct_shape(&mut self, closure: &ObjectRef) -> Option<ShapeId> {
        let prototype_name = self.agent.interner.names.prototype;
        let prototype = match self.agent.get_data_property(closure, prototype_name) {
            Some(Value::Object(prototype)) => prototype,
            _ => return None,
        };
        self.depend_on_object(closure);
        Some(self.agent.shapes.root(Some(&prototype), ShapeKind::Ordinary))
    }

    /// Data-property transitions already taken from the literal root
    fn literal_shapes(&self, root: ShapeId) -> HashMap<ShapeId, LiteralShape> {
        let mut shapes = HashMap::default();
        let mut queue = VecDeque::from([root]);
        while let Some(shape) = queue.pop_front() {
            if shapes.len() >= MAX_LITERAL_SHAPES {
                break;
            }
            let mut literal = LiteralShape {
                slots: self.agent.shapes.get(shape).slot_count() as u32,
                transitions: HashMap::default(),
            };
            for (name, kind, target) in self.agent.shapes.transitions(shape) {
                if kind == PropertyKind::Data {
                    literal.transitions.insert(name, target);
                    queue.push_back(target);
                }
            }
            shapes.insert(shape, literal);
        }
        shapes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::runtime::Runtime;

    fn function_id(runtime: &Runtime, name: &str) -> FunctionId {
        let value = runtime.get_global(name).unwrap();
        let id = value.as_object().unwrap().borrow().function_id().unwrap();
        id
    }

    #[test]
    fn test_monomorphic_load_resolves_to_field() {
        let mut runtime = Runtime::with_config(EngineConfig::interpreter_only());
        runtime
            .eval("function getY(o) { return o.y; } getY({x: 1, y: 2}); getY({x: 3, y: 4});")
            .unwrap();
        let id = function_id(&runtime, "getY");
        let prepared = prepare(runtime.agent_mut(), id, OptimizationLevel::Mid).unwrap();
        let loads = &prepared.input().functions[0].loads;
        assert_eq!(loads.len(), 1);
        let accesses = loads.values().next().unwrap();
        assert_eq!(accesses.len(), 1);
        assert_eq!(accesses[0].1, PropertyAccess::Field(1));
    }

    #[test]
    fn test_prototype_constant_adds_dependency() {
        let mut runtime = Runtime::with_config(EngineConfig::interpreter_only());
        runtime
            .eval(
                "function P() {} P.prototype.k = 7;
                 function getK(o) { return o.k; }
                 var p = new P(); getK(p); getK(p);",
            )
            .unwrap();
        let id = function_id(&runtime, "getK");
        let prepared = prepare(runtime.agent_mut(), id, OptimizationLevel::Mid).unwrap();
        let accesses = prepared.input().functions[0].loads.values().next().unwrap();
        assert_eq!(accesses[0].1, PropertyAccess::Constant(ConstantValue::Number(7.0)));
        let (_, link) = prepared.into_parts();
        assert!(!link.dependencies.is_empty());
    }

    #[test]
    fn test_getters_are_left_generic() {
        let mut runtime = Runtime::with_config(EngineConfig::interpreter_only());
        runtime
            .eval("function read(o) { return o.v; } var o = { get v() { return 1; } }; read(o); read(o);")
            .unwrap();
        let id = function_id(&runtime, "read");
        let prepared = prepare(runtime.agent_mut(), id, OptimizationLevel::Mid).unwrap();
        assert!(prepared.input().functions[0].loads.is_empty());
    }

    #[test]
    fn test_top_level_captures_monomorphic_callees() {
        let mut runtime = Runtime::with_config(EngineConfig::interpreter_only());
        runtime
            .eval(
                "function inc(x) { return x + 1; }
                 function twice(x) { var f = inc; return f(f(x)); }
                 twice(1); twice(2);",
            )
            .unwrap();
        let id = function_id(&runtime, "twice");
        let top = prepare(runtime.agent_mut(), id, OptimizationLevel::Top).unwrap();
        let names: Vec<&str> = top.input().functions.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["twice", "inc"]);
        let mid = prepare(runtime.agent_mut(), id, OptimizationLevel::Mid).unwrap();
        assert_eq!(mid.input().functions.len(), 1);
    }

    #[test]
    fn test_handlers_are_rejected() {
        let mut runtime = Runtime::with_config(EngineConfig::interpreter_only());
        runtime.eval("function g() { try { return 1; } catch (e) { return 2; } }").unwrap();
        let id = function_id(&runtime, "g");
        assert!(matches!(
            prepare(runtime.agent_mut(), id, OptimizationLevel::Mid),
            Err(CompileError::Unsupported(_))
        ));
    }

    #[test]
    fn test_rarely_written_globals_are_speculated() {
        let mut runtime = Runtime::with_config(EngineConfig::interpreter_only());
        runtime
            .eval("var k = 3; var n = 0; n = 1; n = 2; function f() { return k + n; } f();")
            .unwrap();
        let id = function_id(&runtime, "f");
        let prepared = prepare(runtime.agent_mut(), id, OptimizationLevel::Mid).unwrap();
        let k = runtime.agent_mut().intern("k");
        let n = runtime.agent_mut().intern("n");
        let globals = &prepared.input().globals;
        assert_eq!(globals.get(&k).map(|g| g.value.clone()), Some(ConstantValue::Number(3.0)));
        assert!(!globals.contains_key(&n));
    }
}
