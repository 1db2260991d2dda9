use std::rc::Rc;

use tracing::warn;

use super::Activation;
use crate::closure::Closure;
use crate::env::Environment;
use crate::error::VmResult;
use crate::host::Session;
use crate::object::{NativeCall, ObjectRef, PlainObject};
use crate::value::Value;

/// Call any value. Non-callables are reported and yield `undefined`.
pub fn call_value(session: &Rc<Session>, callee: &Value, this: Option<ObjectRef>, args: &[Value]) -> VmResult<Value> {
    match callee {
        Value::NativeFunction(func) => {
            let _guard = session.enter_call()?;
            Ok(func.call(&NativeCall { session, this, args, constructing: false }))
        }
        Value::ScriptFunction(closure) => invoke_closure(session, closure, this, args),
        other => {
            warn!(callee = %other, kind = other.type_of(), "value is not callable");
            Ok(Value::Undefined)
        }
    }
}

/// Run a script function's body in a fresh environment.
pub fn invoke_closure(
    session: &Rc<Session>,
    closure: &Rc<Closure>,
    this: Option<ObjectRef>,
    args: &[Value],
) -> VmResult<Value> {
    let _guard = session.enter_call()?;
    let mut target = closure.captured_target().unwrap_or_else(|| session.root());
    if session.version() <= 5 {
        if let Some(node) = this.as_ref().filter(|obj| session.display().is_node(obj)) {
            target = node.clone();
        }
    }

    let mut env = Environment::for_call(session.clone(), target, closure.captured_scopes());
    closure.bind(&mut env, this, args, Value::ScriptFunction(closure.clone()));
    let mut activation = Activation::new(
        closure.code().clone(),
        closure.body(),
        env,
        closure.captured_with_stack(),
    );
    let completion = activation.run()?;
    activation.env.release_locals();
    Ok(completion.into_value())
}

/// `new ctor(args)`: allocate an instance on `ctor.prototype` and run the
/// constructor with it as `this`. An object returned by the constructor
/// replaces the instance.
pub fn construct(session: &Rc<Session>, ctor: &Value, args: &[Value]) -> VmResult<Value> {
    let Some(holder) = ctor.member_holder().filter(|_| ctor.is_callable()) else {
        warn!(ctor = %ctor, "new on a non-constructor");
        return Ok(Value::Undefined);
    };
    let proto = holder
        .get_member("prototype")
        .and_then(|p| p.as_object().cloned())
        .unwrap_or_else(|| session.object_prototype().clone());
    let instance = ObjectRef::new(PlainObject::new(Some(proto)));
    instance.set_hidden("__constructor__", ctor.clone());

    let result = match ctor {
        Value::NativeFunction(func) => {
            let _guard = session.enter_call()?;
            func.call(&NativeCall {
                session,
                this: Some(instance.clone()),
                args,
                constructing: true,
            })
        }
        Value::ScriptFunction(closure) => invoke_closure(session, closure, Some(instance.clone()), args)?,
        _ => Value::Undefined,
    };
    Ok(match result {
        Value::Object(obj) => Value::Object(obj),
        _ => Value::Object(instance),
    })
}
