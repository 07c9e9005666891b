//! Worker agents and shared memory
//!
//! A worker is an independent [`Runtime`] on its own OS thread. Workers
//! share no function records, shapes or compiled code with anybody; the
//! only things that cross a thread boundary are copied [`Message`]s and
//! an opt-in [`SharedRegion`] of numeric cells.

use crate::config::EngineConfig;
use crate::error::{Error, ResourceLimitKind, Result};
use crate::runtime::{Agent, ObjectKind, Runtime, Value};
use crate::tiering::TieringStats;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

// ==================== Shared Region ====================

/// Mutex-protected numeric cells visible to several agents
#[derive(Debug, Clone)]
pub struct SharedRegion {
    cells: Arc<Mutex<Vec<f64>>>,
}

impl SharedRegion {
    pub fn new(len: usize) -> Self {
        Self {
            cells: Arc::new(Mutex::new(vec![0.0; len])),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<f64>> {
        // a panicking worker cannot leave a cell half-written
        self.cells.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn load(&self, index: usize) -> Option<f64> {
        self.lock().get(index).copied()
    }

    /// Store `value`; returns it, or None if `index` is out of range
    pub fn store(&self, index: usize, value: f64) -> Option<f64> {
        let mut cells = self.lock();
        let cell = cells.get_mut(index)?;
        *cell = value;
        Some(value)
    }

    /// Add `delta` atomically; returns the previous value
    pub fn add(&self, index: usize, delta: f64) -> Option<f64> {
        let mut cells = self.lock();
        let cell = cells.get_mut(index)?;
        let old = *cell;
        *cell += delta;
        Some(old)
    }

    pub fn snapshot(&self) -> Vec<f64> {
        self.lock().clone()
    }
}

// ==================== Messages ====================

/// A value copied out of one agent and into another
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
    List(Vec<Message>),
    /// Own data properties in insertion order
    Record(Vec<(String, Message)>),
}

/// Messages nest no deeper than this
const MAX_MESSAGE_DEPTH: usize = 64;

impl Message {
    /// Copy `value` out of `agent`. Functions, generators and accessor
    /// properties cannot be copied.
    pub fn from_value(agent: &Agent, value: &Value) -> std::result::Result<Message, String> {
        Self::copy(agent, value, 0)
    }

    fn copy(agent: &Agent, value: &Value, depth: usize) -> std::result::Result<Message, String> {
        if depth > MAX_MESSAGE_DEPTH {
            return Err("message nests too deeply".into());
        }
        let object = match value {
            Value::Undefined => return Ok(Message::Undefined),
            Value::Null => return Ok(Message::Null),
            Value::Boolean(b) => return Ok(Message::Boolean(*b)),
            Value::Number(n) => return Ok(Message::Number(*n)),
            Value::String(s) => return Ok(Message::String(s.to_string())),
            Value::Object(object) => object.borrow(),
        };
        match &object.kind {
            ObjectKind::Array(elements) => elements
                .iter()
                .map(|element| Self::copy(agent, element, depth + 1))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Message::List),
            ObjectKind::Ordinary => {
                let shape = agent.shapes.get(object.shape);
                let mut fields = Vec::with_capacity(shape.properties.len());
                for (property, slot) in shape.properties.iter().zip(&object.slots) {
                    if property.kind != crate::runtime::PropertyKind::Data {
                        return Err("accessor properties could not be cloned".into());
                    }
                    let name = agent.interner.resolve(property.name).to_string();
                    fields.push((name, Self::copy(agent, slot, depth + 1)?));
                }
                Ok(Message::Record(fields))
            }
            _ => Err(format!("{} could not be cloned", value.type_of())),
        }
    }

    /// Materialize the message as a fresh value in `agent`
    pub fn to_value(&self, agent: &mut Agent) -> Value {
        match self {
            Message::Undefined => Value::Undefined,
            Message::Null => Value::Null,
            Message::Boolean(b) => Value::Boolean(*b),
            Message::Number(n) => Value::Number(*n),
            Message::String(s) => Value::string(s),
            Message::List(items) => {
                let elements = items.iter().map(|item| item.to_value(agent)).collect();
                Value::Object(agent.create_array(elements))
            }
            Message::Record(fields) => {
                let object = agent.create_plain_object();
                for (name, field) in fields {
                    let value = field.to_value(agent);
                    let name = agent.intern(name);
                    agent.define_own_property(&object, name, value);
                }
                Value::Object(object)
            }
        }
    }
}

// ==================== Worker Pool ====================

/// Everything a finished worker hands back
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub id: u64,
    /// Completion value of the worker's script, or its error
    pub result: std::result::Result<Message, String>,
    /// Messages posted with `postMessage`, in order
    pub messages: Vec<Message>,
    /// Lines printed by the worker
    pub output: Vec<String>,
    pub tiering: TieringStats,
}

struct Worker {
    id: u64,
    handle: JoinHandle<WorkerReport>,
}

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Spawns workers that all see the same shared region
pub struct WorkerPool {
    config: EngineConfig,
    region: Option<SharedRegion>,
    workers: Vec<Worker>,
    max_workers: usize,
}

impl WorkerPool {
    pub fn new(config: EngineConfig, max_workers: usize) -> Self {
        Self {
            config,
            region: None,
            workers: Vec::new(),
            max_workers,
        }
    }

    /// Give every worker spawned from now on access to `region`
    pub fn with_shared_region(mut self, region: SharedRegion) -> Self {
        self.region = Some(region);
        self
    }

    pub fn shared_region(&self) -> Option<&SharedRegion> {
        self.region.as_ref()
    }

    /// Start a worker running `source`. `data` becomes its `workerData`
    /// global.
    pub fn spawn(&mut self, source: impl Into<String>, data: Option<Message>) -> Result<u64> {
        if self.workers.len() >= self.max_workers {
            return Err(Error::ResourceLimitError {
                kind: ResourceLimitKind::WorkerLimit,
                message: format!("worker pool is full ({} workers)", self.max_workers),
            });
        }
        let id = NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed);
        let source = source.into();
        let config = self.config.clone();
        let region = self.region.clone();
        let handle = thread::Builder::new()
            .name(format!("quickjit-worker-{}", id))
            .spawn(move || run_worker(id, config, region, &source, data))
            .map_err(|error| Error::ResourceLimitError {
                kind: ResourceLimitKind::WorkerLimit,
                message: error.to_string(),
            })?;
        tracing::debug!(worker = id, "spawned worker");
        self.workers.push(Worker { id, handle });
        Ok(id)
    }

    /// Workers spawned and not yet joined
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Wait for every worker, in spawn order
    pub fn join_all(&mut self) -> Vec<WorkerReport> {
        self.workers
            .drain(..)
            .map(|worker| {
                let id = worker.id;
                worker.handle.join().unwrap_or_else(|_| {
                    tracing::warn!(worker = id, "worker panicked");
                    WorkerReport {
                        id,
                        result: Err("worker panicked".into()),
                        messages: Vec::new(),
                        output: Vec::new(),
                        tiering: TieringStats::default(),
                    }
                })
            })
            .collect()
    }
}

fn run_worker(
    id: u64,
    config: EngineConfig,
    region: Option<SharedRegion>,
    source: &str,
    data: Option<Message>,
) -> WorkerReport {
    let mut runtime = match region {
        Some(region) => Runtime::with_shared_region(config, region),
        None => Runtime::with_config(config),
    };
    if let Some(data) = data {
        let value = data.to_value(runtime.agent_mut());
        runtime.set_global("workerData", value);
    }
    let result = match runtime.eval(source) {
        Ok(value) => Message::from_value(runtime.agent(), &value),
        Err(error) => Err(error.to_string()),
    };
    runtime.finalize_background_jobs();
    let agent = runtime.agent_mut();
    let messages = std::mem::take(&mut agent.outbox);
    let output = std::mem::take(&mut agent.output);
    let tiering = agent.tiering.stats.clone();
    tracing::debug!(worker = id, messages = messages.len(), "worker finished");
    WorkerReport {
        id,
        result,
        messages,
        output,
        tiering,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_shared_region_add_returns_previous() {
        let region = SharedRegion::new(2);
        assert_eq!(region.add(0, 5.0), Some(0.0));
        assert_eq!(region.add(0, 2.5), Some(5.0));
        assert_eq!(region.load(0), Some(7.5));
        assert_eq!(region.store(2, 1.0), None);
        assert_eq!(region.clone().snapshot(), vec![7.5, 0.0]);
    }

    #[test]
    fn test_messages_copy_structure() {
        let mut runtime = Runtime::new();
        let value = runtime.eval("({ name: 'a', items: [1, true, null] })").unwrap();
        let message = Message::from_value(runtime.agent(), &value).unwrap();
        assert_eq!(
            message,
            Message::Record(vec![
                ("name".into(), Message::String("a".into())),
                (
                    "items".into(),
                    Message::List(vec![Message::Number(1.0), Message::Boolean(true), Message::Null])
                ),
            ])
        );
        let function = runtime.eval("(function () {})").unwrap();
        assert!(Message::from_value(runtime.agent(), &function).is_err());
    }

    #[test]
    fn test_workers_share_only_the_region() {
        let region = SharedRegion::new(1);
        let mut pool = WorkerPool::new(EngineConfig::default(), 4).with_shared_region(region.clone());
        for _ in 0..3 {
            pool.spawn(
                "function bump() { sharedAdd(0, 1); } for (var i = 0; i < 100; i++) bump(); postMessage(workerData * 2); 'done'",
                Some(Message::Number(21.0)),
            )
            .unwrap();
        }
        let reports = pool.join_all();
        assert_eq!(reports.len(), 3);
        for report in &reports {
            assert_eq!(report.result, Ok(Message::String("done".into())));
            assert_eq!(report.messages, vec![Message::Number(42.0)]);
        }
        assert_eq!(region.load(0), Some(300.0));
    }

    #[test]
    fn test_pool_limit() {
        let mut pool = WorkerPool::new(EngineConfig::default(), 1);
        pool.spawn("1", None).unwrap();
        assert!(pool.spawn("2", None).is_err());
        assert_eq!(pool.join_all()[0].result, Ok(Message::Number(1.0)));
    }
}
