//! Function invocation
//!
//! Every script-level call goes through [`Agent::invoke_function`], which
//! notifies the tiering controller and then picks the best valid tier for
//! the callee: installed optimized code, baseline code, or the
//! interpreter.

use super::agent::{Activation, Agent, FrameKind};
use super::function::FunctionId;
use super::generator;
use super::object::ObjectKind;
use super::value::Value;
use super::{Abrupt, Completion};
use crate::error::Error;
use crate::interpreter::{self, Frame};
use crate::jit;
use crate::tiering::{self, TierState};

impl Agent {
    /// Call any callable value
    pub fn call(&mut self, callee: &Value, this: Value, args: &[Value]) -> Completion<Value> {
        let target = match callee {
            Value::Object(object) => match object.borrow().kind {
                ObjectKind::Function(id) => Ok(id),
                ObjectKind::Native(id) => Err(Some(id)),
                _ => Err(None),
            },
            _ => Err(None),
        };
        match target {
            Ok(id) => self.invoke_function(id, this, args, false),
            Err(Some(native)) => {
                let function = match self.native(native) {
                    Some(native) => native.function.clone(),
                    None => return Err(Abrupt::Fatal(Error::internal("unknown native function"))),
                };
                function(self, &this, args)
            }
            Err(None) => {
                let message = format!("{} is not a function", self.to_display_string(callee));
                Err(self.type_error(message))
            }
        }
    }

    /// `new callee(...args)`
    pub fn construct(&mut self, callee: &Value, args: &[Value]) -> Completion<Value> {
        let (id, native) = match callee {
            Value::Object(object) => match object.borrow().kind {
                ObjectKind::Function(id) => (Some(id), false),
                ObjectKind::Native(_) => (None, true),
                _ => (None, false),
            },
            _ => (None, false),
        };
        let is_generator = id
            .and_then(|id| self.functions.get(id))
            .map(|record| record.shared.chunk.is_generator)
            .unwrap_or(false);
        match id {
            // host constructors build their own result
            None if native => self.call(callee, Value::Undefined, args),
            Some(id) if !is_generator => {
                let this = Value::Object(self.allocate_receiver(callee));
                self.invoke_function(id, this, args, true)
            }
            _ => {
                let message = format!("{} is not a constructor", self.to_display_string(callee));
                Err(self.type_error(message))
            }
        }
    }

    /// The `this` object for `new callee`, inheriting from `callee.prototype`
    pub fn allocate_receiver(&mut self, callee: &Value) -> super::ObjectRef {
        let prototype = self.interner.names.prototype;
        let proto = match callee {
            Value::Object(object) => match self.get_data_property(object, prototype) {
                Some(Value::Object(proto)) => proto,
                _ => self.realm.object_prototype.clone(),
            },
            _ => self.realm.object_prototype.clone(),
        };
        self.create_object(Some(&proto))
    }

    /// Invoke a script function through the tiering machinery
    pub fn invoke_function(
        &mut self,
        id: FunctionId,
        this: Value,
        args: &[Value],
        construct: bool,
    ) -> Completion<Value> {
        if self.activations.len() >= self.config.max_call_depth {
            return Err(self.range_error("Maximum call stack size exceeded"));
        }
        tiering::on_invocation(self, id);

        let (shared, code, tier) = match self.functions.get(id) {
            Some(record) => (record.shared.clone(), record.valid_code(), record.tier),
            None => return Err(Abrupt::Fatal(Error::internal(format!("no record for function #{}", id.0)))),
        };
        if shared.chunk.is_generator {
            return generator::create(self, id, shared, this, args);
        }
        if let Some(code) = code.filter(|_| !self.debugging()) {
            return jit::run_optimized(self, id, code, this, args, construct);
        }

        let kind = match tier {
            TierState::Baseline | TierState::OptimizingCompiling(_) | TierState::Optimized(_)
                if shared.baseline_code().is_some() && !self.debugging() =>
            {
                FrameKind::Baseline
            }
            _ => FrameKind::Interpreted,
        };
        let frame = Frame::new(id, shared, this, args, construct);
        self.activations.push(Activation::new(id, kind));
        let result = interpreter::run_frame(self, frame, kind);
        self.activations.pop();
        result
    }
}

#[cfg(test)]
mod tests {
    use crate::config::EngineConfig;
    use crate::runtime::{native_fn, Agent, Value};

    #[test]
    fn test_calling_a_non_function_is_a_type_error() {
        let mut agent = Agent::new(EngineConfig::default());
        let result = agent.call(&Value::Number(1.0), Value::Undefined, &[]);
        assert!(result.is_err());
    }

    #[test]
    fn test_native_receives_this_and_arguments() {
        let mut agent = Agent::new(EngineConfig::default());
        let native = agent.create_native(
            "sum",
            native_fn(|agent, this, args| {
                let base = agent.to_number(this);
                Ok(Value::Number(base + args.iter().map(|a| agent.to_number(a)).sum::<f64>()))
            }),
        );
        let result = agent
            .call(&Value::Object(native), Value::Number(1.0), &[Value::Number(2.0), Value::Number(3.0)])
            .unwrap();
        assert_eq!(result, Value::Number(6.0));
    }
}
