use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    thread,
    time::Duration,
};

use crate::{
    BondResult, ErrorKind, ErrorObject, Future, Gc, HeapObject, Mutator,
    Rooted, Runtime, RuntimeError, Value, Vm,
};

#[derive(Debug, Clone)]
pub struct IsolateSettings {
    /// stack size of isolate threads, platform default if unset
    pub stack_size: Option<usize>,
    pub name_prefix: String,
    /// upper bound for one wait of the join combinator
    pub poll_interval: Duration,
}

impl Default for IsolateSettings {
    fn default() -> Self {
        Self {
            stack_size: None,
            name_prefix: "bond-isolate".to_string(),
            poll_interval: Duration::from_millis(10),
        }
    }
}

impl IsolateSettings {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.stack_size == Some(0) {
            return Err("stack_size must be > 0");
        }
        if self.name_prefix.is_empty() {
            return Err("name_prefix must not be empty");
        }
        if self.poll_interval.is_zero() {
            return Err("poll_interval must be > 0");
        }
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IsolateState {
    Created,
    Running,
    Completed,
    Failed,
}

/// Everything a new isolate thread needs. Owned by the spawner until the
/// thread starts, the spawner never touches it afterwards.
struct ThreadData {
    id: usize,
    runtime: Runtime,
    function: Value,
    args: Vec<Value>,
    future: Gc,
    /// keeps future, function and args alive until the isolate is done
    transfer: Rooted,
}

/// Decrements the live isolate counter, on unwind too.
struct LiveIsolate(Runtime);

impl Drop for LiveIsolate {
    fn drop(&mut self) {
        self.0.isolate_finished();
    }
}

impl Runtime {
    /// Spawns a thread running `function(args...)` on its own Vm and returns
    /// the future that receives the tagged outcome.
    ///
    /// `function` and `args` must be rooted by the caller (a native's
    /// arguments are), creation may park the calling thread. The returned
    /// future is not rooted.
    pub fn start_isolate(
        &self,
        mutator: &Mutator,
        function: Value,
        args: Vec<Value>,
    ) -> Result<Gc, RuntimeError> {
        let _creation = mutator.blocking(|| self.creation_lock().lock());

        let future = mutator.make(HeapObject::Future(Future::new()));
        let mut anchored = Vec::with_capacity(args.len() + 2);
        anchored.push(Value::Ref(future));
        anchored.push(function);
        anchored.extend_from_slice(&args);
        let transfer = mutator.root(anchored);

        let id = self.isolate_started();
        let live = LiveIsolate(self.clone());
        let data = ThreadData {
            id,
            runtime: self.clone(),
            function,
            args,
            future,
            transfer,
        };

        let settings = self.isolate_settings();
        let mut builder =
            thread::Builder::new().name(format!("{}-{id}", settings.name_prefix));
        if let Some(size) = settings.stack_size {
            builder = builder.stack_size(size);
        }

        log::debug!("isolate {id}: {:?}", IsolateState::Created);
        builder
            .spawn(move || {
                let _live = live;
                run_isolate(data);
            })
            .map_err(|err| {
                RuntimeError::new(
                    ErrorKind::Thread,
                    format!("could not spawn isolate thread: {err}"),
                )
            })?;
        Ok(future)
    }
}

fn run_isolate(data: ThreadData) {
    let ThreadData {
        id,
        runtime,
        function,
        args,
        future,
        transfer,
    } = data;

    let mut vm = Vm::new(runtime);
    log::debug!("isolate {id}: {:?}", IsolateState::Running);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        vm.call_function(function, &args);
        vm.exec();
    }));

    // nothing may be swept between popping the outcome and publishing it
    let pause = vm.mutator().pause();
    let result = match outcome {
        Ok(()) => {
            let value = vm.pop().unwrap_or(Value::Nil);
            match vm.had_error() {
                true => BondResult::error(value),
                false => BondResult::ok(value),
            }
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            log::error!("isolate {id} panicked: {message}");
            let error = vm.make(HeapObject::Error(ErrorObject::from(
                RuntimeError::new(
                    ErrorKind::Thread,
                    format!("isolate panicked: {message}"),
                ),
            )));
            BondResult::error(error)
        }
    };
    let state = match result.is_error {
        true => IsolateState::Failed,
        false => IsolateState::Completed,
    };
    let result = vm.make(HeapObject::Result(result));
    if let Some(future) = future.as_future() {
        if let Err(err) = future.set_result(result) {
            log::error!("isolate {id} could not publish its result: {err}");
        }
    }
    drop(pause);
    drop(transfer);
    log::debug!("isolate {id}: {state:?}");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
