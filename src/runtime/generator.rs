//! Generator objects
//!
//! A suspended generator holds a [`Continuation`]: its saved frame plus
//! the tier it resumes into. Tier changes that happen while the
//! continuation is off the stack (baseline code discarded, debugging mode
//! entered) are applied when it resumes, not when they happen.

use super::agent::{Activation, Agent, FrameKind};
use super::function::{FunctionId, SharedFunctionInfo};
use super::object::{Object, ObjectKind};
use super::shape::ShapeKind;
use super::value::Value;
use super::Completion;
use crate::interpreter::{self, Frame, FrameExit};
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorStatus {
    SuspendedStart,
    SuspendedYield,
    Running,
    Completed,
}

/// A suspended activation and the tier it resumes into
#[derive(Debug)]
pub struct Continuation {
    pub frame: Frame,
    pub resume_kind: FrameKind,
}

#[derive(Debug)]
pub struct GeneratorState {
    pub status: GeneratorStatus,
    pub continuation: Option<Continuation>,
}

/// Calling a generator function allocates the generator without running it
pub fn create(
    agent: &mut Agent,
    id: FunctionId,
    shared: Rc<SharedFunctionInfo>,
    this: Value,
    args: &[Value],
) -> Completion<Value> {
    let resume_kind = if shared.baseline_code().is_some() && !agent.debugging() {
        FrameKind::Baseline
    } else {
        FrameKind::Interpreted
    };
    let frame = Frame::new(id, shared, this, args, false);
    let proto = agent.realm.generator_prototype.clone();
    let shape = agent.shapes.root(Some(&proto), ShapeKind::Generator);
    let state = GeneratorState {
        status: GeneratorStatus::SuspendedStart,
        continuation: Some(Continuation { frame, resume_kind }),
    };
    let object = Object::new(shape, ObjectKind::Generator(Box::new(state)));
    Ok(Value::Object(Rc::new(RefCell::new(object))))
}

/// `generator.next(sent)`
pub fn resume(agent: &mut Agent, generator: &Value, sent: Value) -> Completion<Value> {
    let Value::Object(object) = generator else {
        return Err(agent.type_error("next method called on incompatible receiver"));
    };
    let taken = match &mut object.borrow_mut().kind {
        ObjectKind::Generator(state) => match state.status {
            GeneratorStatus::Running => Err("Generator is already running"),
            GeneratorStatus::Completed => Ok(None),
            status => {
                state.status = GeneratorStatus::Running;
                Ok(state
                    .continuation
                    .take()
                    .map(|continuation| (continuation, status == GeneratorStatus::SuspendedYield)))
            }
        },
        _ => Err("next method called on incompatible receiver"),
    };
    let (mut continuation, started) = match taken {
        Ok(Some(taken)) => taken,
        Ok(None) => return iter_result(agent, Value::Undefined, true),
        Err(message) => return Err(agent.type_error(message)),
    };
    if agent.activations.len() >= agent.config.max_call_depth {
        finish(object, GeneratorStatus::Completed, None);
        return Err(agent.range_error("Maximum call stack size exceeded"));
    }

    if started {
        continuation.frame.push(sent);
    }
    let mut kind = continuation.resume_kind;
    if kind == FrameKind::Baseline && (agent.debugging() || continuation.frame.shared.baseline_code().is_none()) {
        kind = FrameKind::Interpreted;
        agent.tiering.stats.deferred_downgrades += 1;
        tracing::debug!(
            function = %continuation.frame.shared.name,
            "applying deferred downgrade to resumed generator"
        );
    }

    agent.activations.push(Activation::new(continuation.frame.function, kind));
    let result = interpreter::execute(agent, &mut continuation.frame, &mut kind);
    agent.activations.pop();

    match result {
        Ok(FrameExit::Yield(value)) => {
            continuation.resume_kind = kind;
            finish(object, GeneratorStatus::SuspendedYield, Some(continuation));
            iter_result(agent, value, false)
        }
        Ok(FrameExit::Return(value)) => {
            finish(object, GeneratorStatus::Completed, None);
            iter_result(agent, value, true)
        }
        Err(abrupt) => {
            finish(object, GeneratorStatus::Completed, None);
            Err(abrupt)
        }
    }
}

fn finish(object: &super::ObjectRef, status: GeneratorStatus, continuation: Option<Continuation>) {
    if let ObjectKind::Generator(state) = &mut object.borrow_mut().kind {
        state.status = status;
        state.continuation = continuation;
    }
}

/// `{ value, done }`
fn iter_result(agent: &mut Agent, value: Value, done: bool) -> Completion<Value> {
    let result = agent.create_plain_object();
    let names = agent.interner.names;
    agent.define_own_property(&result, names.value, value);
    agent.define_own_property(&result, names.done, Value::Boolean(done));
    Ok(Value::Object(result))
}
