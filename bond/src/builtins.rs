use std::{thread, time::Duration};

use crate::{
    Arity, HeapObject, List, ModuleBuilder, NativeFunction, NativeResult,
    Runtime, RuntimeError, ScriptMutex, Value, Vm, expect_callable,
    expect_int, expect_list, expect_number, join,
};

// start_isolate(fn, args...) -> Future
fn start_isolate(vm: &mut Vm, args: &[Value]) -> NativeResult {
    let function = expect_callable(args, 0)?;
    let future = vm.runtime().start_isolate(
        vm.mutator(),
        Value::Ref(function),
        args[1..].to_vec(),
    )?;
    Ok(Value::Ref(future))
}

// wait_until_completed(list of futures) -> List of payloads, the
// success/error tag is dropped; `get_result` on each future keeps it
fn wait_until_completed(vm: &mut Vm, args: &[Value]) -> NativeResult {
    let futures = expect_list(args, 0)?;
    let poll = vm.runtime().isolate_settings().poll_interval;
    let results = join::wait_until_completed(vm.mutator(), &futures, poll)?;
    Ok(vm.make(HeapObject::List(List::new(results))))
}

fn mutex(vm: &mut Vm, _args: &[Value]) -> NativeResult {
    Ok(vm.make(HeapObject::Mutex(ScriptMutex::new())))
}

fn list(vm: &mut Vm, args: &[Value]) -> NativeResult {
    Ok(vm.make(HeapObject::List(List::new(args.to_vec()))))
}

fn sleep(vm: &mut Vm, args: &[Value]) -> NativeResult {
    let seconds = expect_number(args, 0)?;
    let duration = Duration::try_from_secs_f64(seconds).map_err(|_| {
        RuntimeError::argument(format!("sleep: invalid duration {seconds}"))
    })?;
    vm.mutator().blocking(|| thread::sleep(duration));
    Ok(Value::Nil)
}

fn sleep_ms(vm: &mut Vm, args: &[Value]) -> NativeResult {
    let ms = expect_int(args, 0)?;
    let ms = u64::try_from(ms).map_err(|_| {
        RuntimeError::argument(format!("sleep_ms: negative duration {ms}"))
    })?;
    vm.mutator()
        .blocking(|| thread::sleep(Duration::from_millis(ms)));
    Ok(Value::Nil)
}

fn gc_collect(vm: &mut Vm, _args: &[Value]) -> NativeResult {
    Ok(Value::Bool(vm.mutator().collect()))
}

fn get_alloc_limit(vm: &mut Vm, _args: &[Value]) -> NativeResult {
    Ok(Value::Int(vm.runtime().gc().get_alloc_limit() as i64))
}

fn set_alloc_limit(vm: &mut Vm, args: &[Value]) -> NativeResult {
    let limit = expect_int(args, 0)?;
    let limit = usize::try_from(limit)
        .ok()
        .filter(|limit| *limit > 0)
        .ok_or_else(|| {
            RuntimeError::argument(format!(
                "set_alloc_limit: limit must be > 0, got {limit}"
            ))
        })?;
    vm.runtime().gc().set_alloc_limit(limit);
    Ok(Value::Nil)
}

fn get_alloc_count(vm: &mut Vm, _args: &[Value]) -> NativeResult {
    Ok(Value::Int(vm.runtime().gc().get_alloc_count() as i64))
}

fn get_immortal_count(vm: &mut Vm, _args: &[Value]) -> NativeResult {
    Ok(Value::Int(vm.runtime().gc().get_immortal_count() as i64))
}

pub const SYNC_NATIVES: &[NativeFunction] = &[
    NativeFunction::new("start_isolate", Arity::AtLeast(1), start_isolate),
    NativeFunction::new(
        "wait_until_completed",
        Arity::Exact(1),
        wait_until_completed,
    ),
    NativeFunction::new("list", Arity::AtLeast(0), list),
    NativeFunction::new("sleep", Arity::Exact(1), sleep),
    NativeFunction::new("sleep_ms", Arity::Exact(1), sleep_ms),
    NativeFunction::new("gc_collect", Arity::Exact(0), gc_collect),
    NativeFunction::new("get_alloc_limit", Arity::Exact(0), get_alloc_limit),
    NativeFunction::new("set_alloc_limit", Arity::Exact(1), set_alloc_limit),
    NativeFunction::new("get_alloc_count", Arity::Exact(0), get_alloc_count),
    NativeFunction::new(
        "get_immortal_count",
        Arity::Exact(0),
        get_immortal_count,
    ),
];

pub fn init_sync(
    _runtime: &Runtime,
    builder: &mut ModuleBuilder,
) -> Result<(), RuntimeError> {
    builder
        .add_functions(SYNC_NATIVES)
        .add_struct("Mutex", Arity::Exact(0), mutex);
    Ok(())
}
