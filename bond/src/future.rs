use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::{
    Arity, Attribute, Gc, NativeMethod, NativeResult, Object, RuntimeError,
    Value, Visitable, Visitor, Vm, object::expected_self,
};

/// One-shot result cell. Pending until the first `set_result`, resolved
/// forever after.
#[derive(Debug, Default)]
pub struct Future {
    slot: Mutex<Option<Value>>,
    resolved: Condvar,
}

impl Future {
    pub fn new() -> Self {
        Self::default()
    }

    /// First write wins. A second write is rejected with a state error and
    /// leaves the stored value untouched.
    pub fn set_result(&self, value: Value) -> Result<(), RuntimeError> {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            log::warn!("future already resolved, result dropped");
            return Err(RuntimeError::state("future already has a result"));
        }
        *slot = Some(value);
        self.resolved.notify_all();
        Ok(())
    }

    pub fn has_result(&self) -> bool {
        self.slot.lock().is_some()
    }

    pub fn get_result(&self) -> Option<Value> {
        *self.slot.lock()
    }

    /// Blocks until resolved. Callers that own a mutator must wrap this in
    /// a blocking region.
    pub fn wait(&self) -> Value {
        let mut slot = self.slot.lock();
        loop {
            if let Some(value) = *slot {
                return value;
            }
            self.resolved.wait(&mut slot);
        }
    }

    /// Waits at most `timeout` for the result.
    pub fn wait_for(&self, timeout: Duration) -> Option<Value> {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            self.resolved.wait_for(&mut slot, timeout);
        }
        *slot
    }
}

impl Visitable for Future {
    fn visit_edges(&self, visitor: &mut dyn Visitor) {
        self.slot.lock().visit_edges(visitor);
    }
}

fn future_of(this: &Gc) -> Result<&Future, RuntimeError> {
    this.as_future()
        .ok_or_else(|| expected_self("Future", *this))
}

fn has_result(_vm: &mut Vm, this: Gc, _args: &[Value]) -> NativeResult {
    Ok(Value::Bool(future_of(&this)?.has_result()))
}

fn get_result(_vm: &mut Vm, this: Gc, _args: &[Value]) -> NativeResult {
    future_of(&this)?
        .get_result()
        .ok_or_else(|| RuntimeError::state("future has no result yet"))
}

// the receiver sits on the Vm stack, so it stays rooted while parked
fn wait(vm: &mut Vm, this: Gc, _args: &[Value]) -> NativeResult {
    let future = future_of(&this)?;
    Ok(vm.mutator().blocking(|| future.wait()))
}

pub static FUTURE_METHODS: &[NativeMethod] = &[
    NativeMethod::new("has_result", Arity::Exact(0), has_result),
    NativeMethod::new("get_result", Arity::Exact(0), get_result),
    NativeMethod::new("wait", Arity::Exact(0), wait),
];

impl Object for Future {
    fn type_name(&self) -> &'static str {
        "Future"
    }

    fn get_attribute(&self, _this: Gc, name: &str) -> Option<Attribute> {
        crate::find_method(FUTURE_METHODS, name)
    }

    fn str(&self, _this: Gc) -> String {
        match self.get_result() {
            Some(value) => format!("<Future {value}>"),
            None => "<Future pending>".to_string(),
        }
    }
}
