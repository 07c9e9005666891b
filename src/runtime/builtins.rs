//! Built-in globals
//!
//! The host surface is deliberately small: output, `Math`, error
//! constructors, a few array and generator methods, conversions and the
//! worker messaging natives.

use super::agent::{native_fn, Agent};
use super::generator;
use super::value::{ObjectRef, Value};
use crate::error::ErrorKind;
use crate::workers::{Message, SharedRegion};
use rand::Rng;

/// Install every built-in into a fresh agent
pub fn install(agent: &mut Agent) {
    install_console(agent);
    install_math(agent);
    install_errors(agent);
    install_array_methods(agent);
    install_generator_methods(agent);
    install_conversions(agent);
    install_messaging(agent);
}

fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or_default()
}

fn number_arg(agent: &Agent, args: &[Value], index: usize) -> f64 {
    args.get(index).map_or(f64::NAN, |value| agent.to_number(value))
}

// ==================== Output ====================

fn print_line(agent: &mut Agent, args: &[Value]) {
    let line = args
        .iter()
        .map(|value| agent.to_display_string(value))
        .collect::<Vec<_>>()
        .join(" ");
    agent.print(line);
}

fn install_console(agent: &mut Agent) {
    agent.register_native(
        "print",
        native_fn(|agent, _, args| {
            print_line(agent, args);
            Ok(Value::Undefined)
        }),
    );
    let console = agent.create_plain_object();
    agent.define_native_method(
        &console,
        "log",
        native_fn(|agent, _, args| {
            print_line(agent, args);
            Ok(Value::Undefined)
        }),
    );
    let name = agent.intern("console");
    agent.globals.store(name, Value::Object(console));
}

// ==================== Math ====================

fn math_unary(agent: &mut Agent, math: &ObjectRef, name: &str, f: fn(f64) -> f64) {
    agent.define_native_method(
        math,
        name,
        native_fn(move |agent, _, args| Ok(Value::Number(f(number_arg(agent, args, 0))))),
    );
}

fn install_math(agent: &mut Agent) {
    let math = agent.create_plain_object();
    for (name, value) in [
        ("PI", std::f64::consts::PI),
        ("E", std::f64::consts::E),
        ("LN2", std::f64::consts::LN_2),
        ("SQRT2", std::f64::consts::SQRT_2),
    ] {
        let name = agent.intern(name);
        agent.define_own_property(&math, name, Value::Number(value));
    }

    math_unary(agent, &math, "abs", f64::abs);
    math_unary(agent, &math, "floor", f64::floor);
    math_unary(agent, &math, "ceil", f64::ceil);
    math_unary(agent, &math, "sqrt", f64::sqrt);
    math_unary(agent, &math, "trunc", f64::trunc);
    math_unary(agent, &math, "sin", f64::sin);
    math_unary(agent, &math, "cos", f64::cos);
    math_unary(agent, &math, "log", f64::ln);
    // rounds half up, unlike f64::round
    math_unary(agent, &math, "round", |n| (n + 0.5).floor());

    agent.define_native_method(
        &math,
        "max",
        native_fn(|agent, _, args| {
            let mut result = f64::NEG_INFINITY;
            for value in args {
                let n = agent.to_number(value);
                if n.is_nan() {
                    return Ok(Value::Number(f64::NAN));
                }
                result = result.max(n);
            }
            Ok(Value::Number(result))
        }),
    );
    agent.define_native_method(
        &math,
        "min",
        native_fn(|agent, _, args| {
            let mut result = f64::INFINITY;
            for value in args {
                let n = agent.to_number(value);
                if n.is_nan() {
                    return Ok(Value::Number(f64::NAN));
                }
                result = result.min(n);
            }
            Ok(Value::Number(result))
        }),
    );
    agent.define_native_method(
        &math,
        "pow",
        native_fn(|agent, _, args| {
            Ok(Value::Number(number_arg(agent, args, 0).powf(number_arg(agent, args, 1))))
        }),
    );
    agent.define_native_method(
        &math,
        "imul",
        native_fn(|agent, _, args| {
            let a = super::to_int32(number_arg(agent, args, 0));
            let b = super::to_int32(number_arg(agent, args, 1));
            Ok(Value::Number(a.wrapping_mul(b) as f64))
        }),
    );
    agent.define_native_method(
        &math,
        "random",
        native_fn(|agent, _, _| Ok(Value::Number(agent.rng.gen::<f64>()))),
    );

    let name = agent.intern("Math");
    agent.globals.store(name, Value::Object(math));
}

// ==================== Errors ====================

fn install_errors(agent: &mut Agent) {
    for kind in [
        ErrorKind::GenericError,
        ErrorKind::TypeError,
        ErrorKind::RangeError,
        ErrorKind::ReferenceError,
        ErrorKind::SyntaxError,
    ] {
        agent.register_native(
            kind.name(),
            native_fn(move |agent, _, args| {
                let message = match args.first() {
                    Some(Value::Undefined) | None => String::new(),
                    Some(value) => agent.to_string(value).to_string(),
                };
                Ok(agent.create_error(kind, &message))
            }),
        );
    }
}

// ==================== Arrays and Generators ====================

fn install_array_methods(agent: &mut Agent) {
    let prototype = agent.realm.array_prototype.clone();
    agent.define_native_method(
        &prototype,
        "push",
        native_fn(|agent, this, args| {
            let length = match this {
                Value::Object(object) => object.borrow_mut().elements_mut().map(|elements| {
                    elements.extend(args.iter().cloned());
                    elements.len()
                }),
                _ => None,
            };
            match length {
                Some(length) => Ok(Value::Number(length as f64)),
                None => Err(agent.type_error("Array.prototype.push called on a non-array")),
            }
        }),
    );
    agent.define_native_method(
        &prototype,
        "pop",
        native_fn(|agent, this, _| {
            let popped = match this {
                Value::Object(object) => object.borrow_mut().elements_mut().map(|elements| elements.pop()),
                _ => None,
            };
            match popped {
                Some(value) => Ok(value.unwrap_or_default()),
                None => Err(agent.type_error("Array.prototype.pop called on a non-array")),
            }
        }),
    );
}

fn install_generator_methods(agent: &mut Agent) {
    let prototype = agent.realm.generator_prototype.clone();
    agent.define_native_method(
        &prototype,
        "next",
        native_fn(|agent, this, args| generator::resume(agent, this, arg(args, 0))),
    );
}

// ==================== Conversions ====================

fn install_conversions(agent: &mut Agent) {
    for (name, value) in [("NaN", f64::NAN), ("Infinity", f64::INFINITY)] {
        let name = agent.intern(name);
        agent.globals.store(name, Value::Number(value));
    }
    agent.register_native(
        "String",
        native_fn(|agent, _, args| match args.first() {
            Some(value) => Ok(Value::String(agent.to_string(value))),
            None => Ok(Value::string("")),
        }),
    );
    agent.register_native(
        "Number",
        native_fn(|agent, _, args| match args.first() {
            Some(value) => Ok(Value::Number(agent.to_number(value))),
            None => Ok(Value::Number(0.0)),
        }),
    );
    agent.register_native(
        "isNaN",
        native_fn(|agent, _, args| Ok(Value::Boolean(number_arg(agent, args, 0).is_nan()))),
    );
}

// ==================== Worker Messaging ====================

fn install_messaging(agent: &mut Agent) {
    agent.register_native(
        "postMessage",
        native_fn(|agent, _, args| match Message::from_value(agent, &arg(args, 0)) {
            Ok(message) => {
                agent.outbox.push(message);
                Ok(Value::Undefined)
            }
            Err(reason) => Err(agent.type_error(format!("postMessage: {}", reason))),
        }),
    );
}

fn region_index(agent: &mut Agent, region: &SharedRegion, value: &Value) -> super::Completion<usize> {
    let n = agent.to_number(value);
    if n.fract() == 0.0 && n >= 0.0 && (n as usize) < region.len() {
        Ok(n as usize)
    } else {
        let message = format!("shared index {} is out of range", agent.to_display_string(value));
        Err(agent.range_error(message))
    }
}

/// Give `agent` the `shared*` natives over `region`
pub fn install_shared_region(agent: &mut Agent, region: SharedRegion) {
    agent.shared_region = Some(region.clone());

    let shared = region.clone();
    agent.register_native(
        "sharedLoad",
        native_fn(move |agent, _, args| {
            let index = region_index(agent, &shared, &arg(args, 0))?;
            Ok(Value::Number(shared.load(index).unwrap_or(f64::NAN)))
        }),
    );
    let shared = region.clone();
    agent.register_native(
        "sharedStore",
        native_fn(move |agent, _, args| {
            let index = region_index(agent, &shared, &arg(args, 0))?;
            let value = number_arg(agent, args, 1);
            Ok(Value::Number(shared.store(index, value).unwrap_or(f64::NAN)))
        }),
    );
    let shared = region.clone();
    agent.register_native(
        "sharedAdd",
        native_fn(move |agent, _, args| {
            let index = region_index(agent, &shared, &arg(args, 0))?;
            let delta = number_arg(agent, args, 1);
            Ok(Value::Number(shared.add(index, delta).unwrap_or(f64::NAN)))
        }),
    );
    agent.register_native(
        "sharedLength",
        native_fn(move |_, _, _| Ok(Value::Number(region.len() as f64))),
    );
}

#[cfg(test)]
mod tests {
    use crate::config::EngineConfig;
    use crate::runtime::{Runtime, Value};
    use crate::workers::SharedRegion;

    #[test]
    fn test_print_collects_output() {
        let mut runtime = Runtime::new();
        runtime.eval("print('a', 1, true); console.log([1, 2]);").unwrap();
        assert_eq!(runtime.take_output(), vec!["a 1 true".to_string(), "[1,2]".to_string()]);
    }

    #[test]
    fn test_math() {
        let mut runtime = Runtime::new();
        assert_eq!(runtime.eval("Math.max(1, 7, 3)").unwrap(), Value::Number(7.0));
        assert_eq!(runtime.eval("Math.imul(0x7fffffff, 2)").unwrap(), Value::Number(-2.0));
        assert_eq!(runtime.eval("Math.round(-2.5)").unwrap(), Value::Number(-2.0));
        let r = runtime.eval("Math.random()").unwrap().as_number().unwrap();
        assert!((0.0..1.0).contains(&r));
    }

    #[test]
    fn test_numeric_globals() {
        let mut runtime = Runtime::new();
        assert_eq!(runtime.eval("NaN !== NaN && isNaN(NaN)").unwrap(), Value::Boolean(true));
        assert_eq!(runtime.eval("1 / 0 === Infinity").unwrap(), Value::Boolean(true));
        assert_eq!(runtime.eval("-Infinity < -1e308").unwrap(), Value::Boolean(true));
        assert_eq!(runtime.eval("'' + Infinity + NaN").unwrap(), Value::string("InfinityNaN"));
    }

    #[test]
    fn test_error_constructors() {
        let mut runtime = Runtime::new();
        let err = runtime.eval("throw new RangeError('too big')").unwrap_err();
        assert_eq!(err.to_string(), "RangeError: too big");
        assert_eq!(
            runtime.eval("var e = TypeError('x'); e.name + ':' + e.message").unwrap(),
            Value::string("TypeError:x")
        );
    }

    #[test]
    fn test_array_push_and_pop() {
        let mut runtime = Runtime::new();
        assert_eq!(
            runtime.eval("var a = [1]; a.push(2, 3); a.pop() + a.length").unwrap(),
            Value::Number(5.0)
        );
    }

    #[test]
    fn test_shared_natives_range_check() {
        let region = SharedRegion::new(2);
        let mut runtime = Runtime::with_shared_region(EngineConfig::default(), region.clone());
        runtime.eval("sharedStore(1, 4); sharedAdd(1, 2);").unwrap();
        assert_eq!(region.load(1), Some(6.0));
        assert_eq!(runtime.eval("sharedLength()").unwrap(), Value::Number(2.0));
        let err = runtime.eval("sharedLoad(2)").unwrap_err();
        assert!(err.to_string().starts_with("RangeError"));
    }
}
