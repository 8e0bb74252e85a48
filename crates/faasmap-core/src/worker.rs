//! Worker-process side of the local pool.
//!
//! The local pool isolates user code in child processes by re-executing the
//! current binary with [`WORKER_ENV`] set. Host binaries (and `harness =
//! false` test binaries) must call [`maybe_become_worker`] before doing
//! anything else; in a spawned child it never returns.
//!
//! stdout is reserved for protocol frames. Diagnostics go to stderr, which
//! the parent leaves attached to its own.

use std::io::{BufRead, Write};

use anyhow::Context as _;

use crate::codec;
use crate::registry::FunctionRegistry;
use crate::task::TaskError;
use crate::wire::{InvokeReply, InvokeRequest};

/// Environment variable marking a process as a spawned local worker.
pub const WORKER_ENV: &str = "FAASMAP_LOCAL_WORKER";

/// Whether this process was spawned as a local worker.
pub fn spawned_as_worker() -> bool {
    std::env::var_os(WORKER_ENV).is_some()
}

/// Runs the worker loop and exits if this process is a spawned worker;
/// returns immediately otherwise.
///
/// `registry` must contain every function the master side will dispatch; a
/// symbol missing here is answered as a per-task error, not a crash.
pub fn maybe_become_worker(registry: &FunctionRegistry) {
    if !spawned_as_worker() {
        return;
    }
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let code = match run_worker(registry, stdin.lock(), stdout.lock()) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("faasmap worker: {err:#}");
            1
        }
    };
    std::process::exit(code);
}

/// The blocking request/reply loop: one JSON frame per line, until EOF.
///
/// Split out from [`maybe_become_worker`] so it can run over arbitrary
/// readers and writers.
pub fn run_worker<R, W>(registry: &FunctionRegistry, input: R, mut output: W) -> anyhow::Result<()>
where
    R: BufRead,
    W: Write,
{
    for line in input.lines() {
        let line = line.context("read request frame")?;
        if line.trim().is_empty() {
            continue;
        }
        let reply = handle_frame(registry, &line);
        let mut encoded =
            serde_json::to_vec(&reply).context("encode reply frame")?;
        encoded.push(b'\n');
        output.write_all(&encoded).context("write reply frame")?;
        output.flush().context("flush reply frame")?;
    }
    Ok(())
}

/// Every failure becomes an error reply; the loop itself only dies on I/O.
fn handle_frame(registry: &FunctionRegistry, line: &str) -> InvokeReply {
    let request: InvokeRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(err) => {
            return InvokeReply::Err(TaskError::internal(format!(
                "malformed request frame: {err}"
            )));
        }
    };

    let function = match request.function() {
        Ok(function) => function,
        Err(err) => {
            return InvokeReply::Err(TaskError::worker_execution(format!(
                "unusable function payload: {err}"
            )));
        }
    };

    let prepared = match codec::decode(registry, &function) {
        Ok(prepared) => prepared,
        Err(err) => {
            return InvokeReply::Err(TaskError::worker_execution(format!(
                "cannot resolve function: {err}"
            )));
        }
    };

    prepared.invoke(request.chunk).into()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::codec::encode;
    use crate::task::TaskErrorKind;

    fn registry() -> FunctionRegistry {
        let mut registry = FunctionRegistry::new();
        registry.register_typed("double", |items: Vec<i64>| {
            Ok::<Vec<i64>, String>(items.into_iter().map(|x| x * 2).collect())
        });
        registry
    }

    fn roundtrip(registry: &FunctionRegistry, requests: &[InvokeRequest]) -> Vec<InvokeReply> {
        let mut input = Vec::new();
        for request in requests {
            input.extend(serde_json::to_vec(request).unwrap());
            input.push(b'\n');
        }
        let mut output = Vec::new();
        run_worker(registry, input.as_slice(), &mut output).unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn serves_requests_until_eof() {
        let registry = registry();
        let blob = encode(&registry, "double").unwrap();
        let replies = roundtrip(
            &registry,
            &[
                InvokeRequest::new(&blob, vec![json!(1), json!(2)]),
                InvokeRequest::new(&blob, vec![json!(10)]),
            ],
        );
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].clone().into_outcome().unwrap(), json!([2, 4]));
        assert_eq!(replies[1].clone().into_outcome().unwrap(), json!([20]));
    }

    #[test]
    fn unknown_symbol_is_an_error_reply() {
        let registry = registry();
        let mut other = FunctionRegistry::new();
        other.register("elsewhere", |_| Ok(json!(null)));
        let blob = encode(&other, "elsewhere").unwrap();

        let replies = roundtrip(&registry, &[InvokeRequest::new(&blob, Vec::new())]);
        let err = replies[0].clone().into_outcome().unwrap_err();
        assert_eq!(err.kind, TaskErrorKind::WorkerExecution);
        assert!(err.message.contains("elsewhere"));
    }

    #[test]
    fn malformed_frame_is_an_error_reply() {
        let mut output = Vec::new();
        run_worker(&registry(), b"not json\n".as_slice(), &mut output).unwrap();
        let reply: InvokeReply = serde_json::from_slice(output.trim_ascii_end()).unwrap();
        let err = reply.into_outcome().unwrap_err();
        assert_eq!(err.kind, TaskErrorKind::Internal);
    }
}
