use std::{
    hash::{Hash, Hasher},
    sync::Arc,
    thread::{self, ThreadId},
};

use parking_lot::{Mutex, lock_api::RawMutex as _};

use crate::{
    Arity, Attribute, Gc, NativeMethod, NativeResult, Object, RuntimeError,
    Value, Visitable, Vm, object::expected_self,
};

struct Shared {
    raw: parking_lot::RawMutex,
    owner: Mutex<Option<ThreadId>>,
}

/// Script level mutex. Not reentrant, only the locking thread may unlock.
/// Handles made with [`ScriptMutex::share`] refer to the same native lock
/// and compare equal.
#[derive(Clone)]
pub struct ScriptMutex {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ScriptMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptMutex")
            .field("locked", &self.is_locked())
            .finish()
    }
}

impl Default for ScriptMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptMutex {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                raw: parking_lot::RawMutex::INIT,
                owner: Mutex::new(None),
            }),
        }
    }

    pub fn share(&self) -> Self {
        self.clone()
    }

    pub fn same_lock(&self, other: &ScriptMutex) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Blocks until acquired. Callers that own a mutator must wrap this in
    /// a blocking region.
    pub fn lock(&self) -> Result<(), RuntimeError> {
        let me = thread::current().id();
        if *self.shared.owner.lock() == Some(me) {
            return Err(RuntimeError::state(
                "mutex is already locked by this thread",
            ));
        }
        self.shared.raw.lock();
        *self.shared.owner.lock() = Some(me);
        Ok(())
    }

    pub fn unlock(&self) -> Result<(), RuntimeError> {
        let mut owner = self.shared.owner.lock();
        if *owner != Some(thread::current().id()) {
            return Err(RuntimeError::state(
                "mutex is not locked by this thread",
            ));
        }
        *owner = None;
        // SAFETY: the owner check above proves this thread holds the lock
        unsafe { self.shared.raw.unlock() };
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.shared.raw.is_locked()
    }
}

impl Visitable for ScriptMutex {}

fn mutex_of(this: &Gc) -> Result<&ScriptMutex, RuntimeError> {
    this.as_mutex().ok_or_else(|| expected_self("Mutex", *this))
}

fn lock(vm: &mut Vm, this: Gc, _args: &[Value]) -> NativeResult {
    let mutex = mutex_of(&this)?;
    vm.mutator().blocking(|| mutex.lock())?;
    Ok(Value::Nil)
}

fn unlock(_vm: &mut Vm, this: Gc, _args: &[Value]) -> NativeResult {
    mutex_of(&this)?.unlock()?;
    Ok(Value::Nil)
}

pub static MUTEX_METHODS: &[NativeMethod] = &[
    NativeMethod::new("lock", Arity::Exact(0), lock),
    NativeMethod::new("unlock", Arity::Exact(0), unlock),
];

impl Object for ScriptMutex {
    fn type_name(&self) -> &'static str {
        "Mutex"
    }

    fn get_attribute(&self, _this: Gc, name: &str) -> Option<Attribute> {
        crate::find_method(MUTEX_METHODS, name)
    }

    fn equal(&self, _this: Gc, other: &Value) -> bool {
        other
            .as_gc()
            .and_then(|other| other.as_mutex().map(|m| m.same_lock(self)))
            .unwrap_or(false)
    }

    fn hash(&self, _this: Gc) -> u64 {
        let mut hasher = ahash::AHasher::default();
        (Arc::as_ptr(&self.shared) as usize).hash(&mut hasher);
        hasher.finish()
    }

    fn str(&self, _this: Gc) -> String {
        format!("<Mutex at {:p}>", Arc::as_ptr(&self.shared))
    }
}
