#![no_main]

use frankenengine_deferred::{ExecutionState, FutureHandle, Resolvers, Runtime, Value};
use libfuzzer_sys::fuzz_target;

const MAX_STEPS: usize = 128;
const MAX_FUTURES: usize = 16;

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }

    run_settlement_program(data);
});

/// Interpret `data` as a program of create / settle / chain / combine /
/// drain steps, then check settle-once, all-of ordering and that releasing
/// every handle leaves only pending futures behind.
fn run_settlement_program(data: &[u8]) {
    let mut rt = Runtime::new();
    let mut futures: Vec<(FutureHandle, Resolvers)> = Vec::new();
    let mut first_outcome: Vec<Option<ExecutionState>> = Vec::new();
    let mut combined: Vec<(FutureHandle, Vec<FutureHandle>)> = Vec::new();

    for (step, chunk) in data.chunks(2).take(MAX_STEPS).enumerate() {
        let op = chunk[0];
        let arg = byte(chunk, 1);
        let pick = |len: usize| usize::from(arg) % len.max(1);

        match op % 7 {
            0 if futures.len() < MAX_FUTURES => {
                futures.push(rt.pending().expect("handle space"));
                first_outcome.push(None);
            }
            1 if !futures.is_empty() => {
                let (_, resolvers) = &futures[pick(futures.len())];
                resolvers.fulfill(&mut rt, Value::Int(step as i64));
            }
            2 if !futures.is_empty() => {
                let (_, resolvers) = &futures[pick(futures.len())];
                resolvers.reject(&mut rt, Value::Int(-(step as i64)));
            }
            3 if futures.len() >= 2 => {
                // Resolve one future with another (may self-chain).
                let (_, resolvers) = &futures[pick(futures.len())];
                let target = futures[usize::from(op) % futures.len()].0;
                resolvers.fulfill(&mut rt, Value::Future(target));
            }
            4 if !futures.is_empty() => {
                let (handle, _) = futures[pick(futures.len())];
                if let Ok(derived) = rt.then_else(handle, |_, v| Ok(v), |_, e| Err(e)) {
                    rt.release(derived).expect("derived handle is live");
                }
            }
            5 if futures.len() >= 2 => {
                let inputs: Vec<FutureHandle> =
                    futures.iter().take(3).map(|(handle, _)| *handle).collect();
                let all = rt
                    .all_of(inputs.iter().copied().map(Value::Future).collect())
                    .expect("handle space");
                combined.push((all, inputs));
            }
            _ => {
                rt.drain();
            }
        }

        // Settle-once: the first observed settled state never changes.
        for (index, (handle, _)) in futures.iter().enumerate() {
            let Ok(current) = rt.state(*handle) else {
                panic!("store lost {handle}");
            };
            match first_outcome[index].clone() {
                Some(seen) => assert_eq!(&seen, current, "{handle} changed after settling"),
                None if current.is_settled() => first_outcome[index] = Some(current.clone()),
                None => {}
            }
        }
    }

    rt.drain();

    // all-of ordering: a fulfilled result lists its inputs' values in input order.
    for (all, inputs) in &combined {
        if let Ok(ExecutionState::Fulfilled(Value::List(values))) = rt.state(*all) {
            assert_eq!(values.len(), inputs.len());
            for (value, input) in values.iter().zip(inputs) {
                if let Ok(ExecutionState::Fulfilled(expected)) = rt.state(*input) {
                    assert_eq!(value, expected);
                }
            }
        }
    }

    let held = futures
        .iter()
        .map(|(handle, _)| *handle)
        .chain(combined.iter().map(|(all, _)| *all));
    for handle in held.collect::<Vec<_>>() {
        rt.release(handle).expect("held handle is live");
    }
    rt.drain();
    assert_eq!(rt.store().len(), rt.store().pending_count());
}

fn byte(data: &[u8], index: usize) -> u8 {
    data.get(index).copied().unwrap_or(0)
}
