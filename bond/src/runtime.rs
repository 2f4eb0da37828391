use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use ahash::RandomState;
use parking_lot::Mutex;

use crate::{
    ErrorKind, GarbageCollector, GcSettings, HeapObject, IsolateSettings,
    ModuleBuilder, ModuleInit, Mutator, RootGuard, RootProvider,
    RuntimeError, Value, Visitor, Vm, builtins,
};

#[derive(Debug, Clone, Default)]
pub struct RuntimeCreateInfo {
    pub gc: GcSettings,
    pub isolates: IsolateSettings,
}

#[derive(Debug, Default)]
struct Globals(Mutex<HashMap<String, Value, RandomState>>);

impl RootProvider for Globals {
    fn visit_roots(&self, visitor: &mut dyn Visitor) {
        self.0.lock().values().for_each(|value| visitor.visit(*value));
    }
}

struct RuntimeShared {
    gc: Arc<GarbageCollector>,
    globals: Arc<Globals>,
    isolates: IsolateSettings,
    /// serializes isolate creation
    creation: Mutex<()>,
    spawned: AtomicUsize,
    live_isolates: AtomicUsize,
    _globals_root: RootGuard,
}

/// Shared runtime context. Cheap to clone, passed explicitly to every Vm,
/// isolate and module.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeShared>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("gc", &self.inner.gc)
            .field("isolates", &self.inner.isolates)
            .field("live_isolates", &self.live_isolates())
            .finish()
    }
}

impl Runtime {
    /// Validates the settings, creates the collector and installs the
    /// `sync` module.
    pub fn new(info: RuntimeCreateInfo) -> Result<Self, RuntimeError> {
        let config = |message: &str| {
            RuntimeError::new(ErrorKind::Config, message.to_string())
        };
        info.gc.validate().map_err(config)?;
        info.isolates.validate().map_err(config)?;

        let gc = GarbageCollector::new(info.gc);
        let globals = Arc::new(Globals::default());
        let globals_root = gc.add_root(globals.clone());
        let runtime = Self {
            inner: Arc::new(RuntimeShared {
                gc,
                globals,
                isolates: info.isolates,
                creation: Mutex::new(()),
                spawned: AtomicUsize::new(0),
                live_isolates: AtomicUsize::new(0),
                _globals_root: globals_root,
            }),
        };
        runtime.register_module("sync", builtins::init_sync)?;
        Ok(runtime)
    }

    #[inline]
    pub fn gc(&self) -> &Arc<GarbageCollector> {
        &self.inner.gc
    }

    pub fn isolate_settings(&self) -> &IsolateSettings {
        &self.inner.isolates
    }

    /// Thread storage for the calling thread. A thread holds at most one,
    /// see [`Vm::with_mutator`] to run a Vm on it.
    pub fn mutator(&self) -> Mutator {
        self.inner.gc.make_thread_storage()
    }

    /// A fresh Vm with its own storage for the calling thread.
    pub fn new_vm(&self) -> Vm {
        Vm::new(self.clone())
    }

    /// Runs a module's init and publishes its entries as immortal globals.
    /// Nothing is published if init fails.
    pub fn register_module(
        &self,
        name: &str,
        init: ModuleInit,
    ) -> Result<(), RuntimeError> {
        let mut builder = ModuleBuilder::new(name);
        init(self, &mut builder)?;

        let entries = builder.finish();
        let count = entries.len();
        for entry in entries {
            let function = self.inner.gc.make_immortal(HeapObject::Native(entry));
            self.set_global(entry.name, Value::Ref(function));
        }
        log::debug!("module {name} registered with {count} entries");
        Ok(())
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.inner.globals.0.lock().get(name).copied()
    }

    /// Globals are roots, so any value may be stored.
    pub fn set_global(&self, name: &str, value: Value) {
        self.inner.globals.0.lock().insert(name.to_owned(), value);
    }

    pub fn live_isolates(&self) -> usize {
        self.inner.live_isolates.load(Ordering::Acquire)
    }

    pub(crate) fn creation_lock(&self) -> &Mutex<()> {
        &self.inner.creation
    }

    /// Returns the id of the new isolate.
    pub(crate) fn isolate_started(&self) -> usize {
        self.inner.live_isolates.fetch_add(1, Ordering::AcqRel);
        self.inner.spawned.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn isolate_finished(&self) {
        self.inner.live_isolates.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{Arity, NativeFunction, NativeResult, Op};

    #[test]
    fn invalid_settings_are_config_errors() {
        let info = RuntimeCreateInfo {
            gc: GcSettings {
                alloc_limit: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = Runtime::new(info).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Config);

        let info = RuntimeCreateInfo {
            isolates: IsolateSettings {
                poll_interval: Duration::ZERO,
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(Runtime::new(info).unwrap_err().kind, ErrorKind::Config);
    }

    #[test]
    fn sync_module_is_installed() {
        let runtime = Runtime::new(RuntimeCreateInfo::default()).unwrap();
        for name in ["start_isolate", "wait_until_completed", "Mutex", "sleep"] {
            let value = runtime.global(name).unwrap();
            assert_eq!(value.type_name(), "NativeFunction");
        }
        assert!(runtime.global("missing").is_none());
        assert_eq!(runtime.gc().get_alloc_count(), 0, "natives are immortal");
        assert!(runtime.gc().get_immortal_count() > 0);
    }

    #[test]
    fn modules_register_their_entries() {
        fn answer(_vm: &mut Vm, _args: &[Value]) -> NativeResult {
            Ok(Value::Int(42))
        }
        fn init(
            _runtime: &Runtime,
            builder: &mut ModuleBuilder,
        ) -> Result<(), RuntimeError> {
            builder.add_function(NativeFunction::new(
                "answer",
                Arity::Exact(0),
                answer,
            ));
            Ok(())
        }
        fn broken(
            _runtime: &Runtime,
            builder: &mut ModuleBuilder,
        ) -> Result<(), RuntimeError> {
            builder.add_function(NativeFunction::new(
                "never",
                Arity::Exact(0),
                answer,
            ));
            Err(RuntimeError::new(ErrorKind::Config, "missing library"))
        }

        let runtime = Runtime::new(RuntimeCreateInfo::default()).unwrap();
        runtime.register_module("answers", init).unwrap();
        assert!(runtime.register_module("broken", broken).is_err());
        assert!(runtime.global("never").is_none());

        let mut vm = runtime.new_vm();
        let answer = runtime.global("answer").unwrap();
        vm.call_function(answer, &[]);
        assert_eq!(vm.pop(), Some(Value::Int(42)));
    }

    mod counter {
        use std::sync::atomic::{AtomicI64, Ordering};

        use crate::{
            Arity, Attribute, Gc, HeapObject, NativeMethod, NativeResult,
            Object, RuntimeError, Value, Visitable, Vm, find_method,
        };

        pub struct Counter(AtomicI64);

        impl Visitable for Counter {}

        fn increment(_vm: &mut Vm, this: Gc, _args: &[Value]) -> NativeResult {
            let HeapObject::Instance(instance) = &*this else {
                return Err(RuntimeError::type_error("not a Counter"));
            };
            let Some(Attribute::Value(Value::Int(n))) =
                instance.get_attribute(this, "value")
            else {
                return Err(RuntimeError::type_error("not a Counter"));
            };
            instance.set_attribute(this, "value", Value::Int(n + 1))?;
            Ok(Value::Nil)
        }

        static COUNTER_METHODS: &[NativeMethod] =
            &[NativeMethod::new("increment", Arity::Exact(0), increment)];

        impl Object for Counter {
            fn type_name(&self) -> &'static str {
                "Counter"
            }

            fn get_attribute(&self, _this: Gc, name: &str) -> Option<Attribute> {
                match name {
                    "value" => Some(Attribute::Value(Value::Int(
                        self.0.load(Ordering::Acquire),
                    ))),
                    _ => find_method(COUNTER_METHODS, name),
                }
            }

            fn set_attribute(
                &self,
                _this: Gc,
                name: &str,
                value: Value,
            ) -> Result<(), RuntimeError> {
                match (name, value) {
                    ("value", Value::Int(n)) => {
                        self.0.store(n, Ordering::Release);
                        Ok(())
                    }
                    _ => Err(RuntimeError::attribute("Counter", name)),
                }
            }
        }

        pub fn new(vm: &mut Vm, _args: &[Value]) -> NativeResult {
            Ok(vm.make(HeapObject::Instance(Box::new(Counter(
                AtomicI64::new(0),
            )))))
        }
    }

    #[test]
    fn native_struct_types() {
        fn init(
            _runtime: &Runtime,
            builder: &mut ModuleBuilder,
        ) -> Result<(), RuntimeError> {
            builder.add_struct("Counter", Arity::Exact(0), counter::new);
            Ok(())
        }
        let runtime = Runtime::new(RuntimeCreateInfo::default()).unwrap();
        runtime.register_module("counters", init).unwrap();
        let mut vm = runtime.new_vm();

        vm.call_function(runtime.global("Counter").unwrap(), &[]);
        let counter = vm.pop().unwrap();
        vm.push(counter);
        assert_eq!(counter.type_name(), "Counter");

        let names = vec![
            vm.make_str("increment"),
            vm.make_str("value"),
            Value::Int(10),
        ];
        // c.increment(); c.increment(); c.value
        let twice = vm.make(HeapObject::Function(crate::Code::new(
            "twice",
            1,
            names.clone(),
            vec![
                Op::Arg(0),
                Op::GetAttr(0),
                Op::Call(0),
                Op::Pop,
                Op::Arg(0),
                Op::GetAttr(0),
                Op::Call(0),
                Op::Pop,
                Op::Arg(0),
                Op::GetAttr(1),
                Op::Return,
            ],
        )));
        vm.call_function(twice, &[counter]);
        vm.exec();
        assert_eq!(vm.pop(), Some(Value::Int(2)));

        // c.value = 10; c.value
        let assign = vm.make(HeapObject::Function(crate::Code::new(
            "assign",
            1,
            names,
            vec![
                Op::Arg(0),
                Op::Const(2),
                Op::SetAttr(1),
                Op::Arg(0),
                Op::GetAttr(1),
                Op::Return,
            ],
        )));
        vm.call_function(assign, &[counter]);
        vm.exec();
        assert_eq!(vm.pop(), Some(Value::Int(10)));
    }

    #[test]
    fn globals_keep_values_alive() {
        let runtime = Runtime::new(RuntimeCreateInfo::default()).unwrap();
        let vm = runtime.new_vm();
        let name = vm.make_str("bond");
        runtime.set_global("name", name);
        vm.make_str("garbage");

        vm.mutator().collect();
        assert_eq!(runtime.gc().get_alloc_count(), 1);
        assert_eq!(runtime.global("name").unwrap().to_string(), "bond");
    }
}
