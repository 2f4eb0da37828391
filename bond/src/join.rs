use std::time::Duration;

use crate::{Gc, Mutator, RuntimeError, Value};

/// Waits until every future in `futures` is resolved and returns their
/// payloads: the value of a successful isolate or its `Error` object.
///
/// The success/error tag is dropped, so an isolate that returns an `Error`
/// value successfully looks like a failed one here. Callers that need the
/// tag use [`wait_until_completed_tagged`].
pub fn wait_until_completed(
    mutator: &Mutator,
    futures: &[Value],
    poll: Duration,
) -> Result<Vec<Value>, RuntimeError> {
    let results = wait_until_completed_tagged(mutator, futures, poll)?;
    Ok(results.into_iter().map(payload).collect())
}

/// Waits until every future in `futures` is resolved and returns what was
/// stored in each, the `BondResult` for isolate futures.
///
/// Each pass collects the futures resolved so far, in argument order, then
/// waits up to `poll` on the first one still pending. The order across
/// passes follows completion, no stronger ordering is promised.
///
/// Fails with a type error before waiting if any element is not a Future.
/// The returned values are no longer rooted.
pub fn wait_until_completed_tagged(
    mutator: &Mutator,
    futures: &[Value],
    poll: Duration,
) -> Result<Vec<Value>, RuntimeError> {
    let mut pending: Vec<Gc> = Vec::with_capacity(futures.len());
    for (index, value) in futures.iter().enumerate() {
        match value.as_gc() {
            Some(gc) if gc.as_future().is_some() => pending.push(gc),
            _ => {
                return Err(RuntimeError::type_error(format!(
                    "wait_until_completed: element {index} is {}, expected Future",
                    value.type_name()
                )));
            }
        }
    }
    if pending.is_empty() {
        return Ok(Vec::new());
    }

    let _anchor = mutator.root(futures.to_vec());
    let results = mutator.root(Vec::with_capacity(pending.len()));
    loop {
        pending.retain(|gc| match gc.as_future().and_then(|f| f.get_result()) {
            Some(result) => {
                results.push(result);
                false
            }
            None => true,
        });

        let Some(first) = pending.first().copied() else {
            break;
        };
        log::trace!("{} futures pending", pending.len());
        mutator.blocking(|| {
            if let Some(future) = first.as_future() {
                future.wait_for(poll);
            }
        });
    }
    Ok(results.values())
}

/// Unwraps a tagged isolate result, other values pass through.
fn payload(result: Value) -> Value {
    result
        .as_gc()
        .and_then(|gc| gc.as_result().map(|tagged| tagged.payload))
        .unwrap_or(result)
}
