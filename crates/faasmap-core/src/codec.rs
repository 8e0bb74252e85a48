//! Function transport envelope.
//!
//! `encode` turns a registered symbol into an opaque byte blob that any pool
//! transport can carry; `decode` resolves it against the receiving side's
//! registry and wraps the function in the invocation adapter.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::registry::{ChunkFn, ChunkFnError, FunctionRegistry};
use crate::task::{Chunk, TaskError, TaskErrorKind, TaskOutcome};

const ENVELOPE_VERSION: u32 = 1;

/// An encoded user function.
///
/// Created once per run and reused for every chunk of that run. The payload
/// is an opaque byte sequence; callers must not interpret it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedFunction(Vec<u8>);

impl SerializedFunction {
    /// Wraps raw bytes received from a transport.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// The raw payload.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionEnvelope {
    version: u32,
    symbol: String,
}

/// Encode/decode failures.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The symbol is not present in the registry.
    #[error("function `{0}` is not registered")]
    UnknownSymbol(String),
    /// The envelope was produced by an incompatible runtime.
    #[error("unsupported function envelope version {0}")]
    UnsupportedVersion(u32),
    /// The payload is not a valid envelope.
    #[error("malformed function envelope: {0}")]
    Malformed(String),
}

/// Encodes the registered function named `symbol`.
///
/// Validating against the sender's registry up front means an unknown symbol
/// fails the whole run before anything is dispatched.
pub fn encode(registry: &FunctionRegistry, symbol: &str) -> Result<SerializedFunction, CodecError> {
    if !registry.contains(symbol) {
        return Err(CodecError::UnknownSymbol(symbol.to_string()));
    }
    let envelope = FunctionEnvelope {
        version: ENVELOPE_VERSION,
        symbol: symbol.to_string(),
    };
    let bytes =
        serde_json::to_vec(&envelope).map_err(|err| CodecError::Malformed(err.to_string()))?;
    Ok(SerializedFunction(bytes))
}

/// Decodes a function blob against the receiving side's registry.
pub fn decode(
    registry: &FunctionRegistry,
    blob: &SerializedFunction,
) -> Result<PreparedFunction, CodecError> {
    let envelope: FunctionEnvelope = serde_json::from_slice(blob.as_bytes())
        .map_err(|err| CodecError::Malformed(err.to_string()))?;
    if envelope.version != ENVELOPE_VERSION {
        return Err(CodecError::UnsupportedVersion(envelope.version));
    }
    let function = registry
        .get(&envelope.symbol)
        .ok_or_else(|| CodecError::UnknownSymbol(envelope.symbol.clone()))?;
    Ok(PreparedFunction {
        symbol: envelope.symbol,
        function,
    })
}

/// A decoded function ready to run, wrapped in the invocation adapter.
pub struct PreparedFunction {
    symbol: String,
    function: Arc<ChunkFn>,
}

impl std::fmt::Debug for PreparedFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedFunction")
            .field("symbol", &self.symbol)
            .finish_non_exhaustive()
    }
}

impl PreparedFunction {
    /// The symbol this function was registered under.
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Runs the function on one chunk and reifies every failure mode into
    /// the outcome.
    ///
    /// A [`ChunkFnError::TypeMismatch`] is rewritten into a
    /// `UserContractViolation` with a message explaining the chunk contract;
    /// any other failure, including a panic, becomes a `WorkerExecution`
    /// error.
    pub fn invoke(&self, chunk: Chunk) -> TaskOutcome {
        let result = catch_unwind(AssertUnwindSafe(|| (self.function)(chunk)));
        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(ChunkFnError::TypeMismatch(detail))) => Err(TaskError::new(
                TaskErrorKind::UserContractViolation,
                format!(
                    "function `{}` rejected its input: it must accept a chunk (a collection \
                     of items, possibly empty) and iterate over the items internally, not a \
                     single item ({detail})",
                    self.symbol
                ),
            )),
            Ok(Err(ChunkFnError::Failed(message))) => Err(TaskError::worker_execution(format!(
                "function `{}` failed: {message}",
                self.symbol
            ))),
            Err(panic) => Err(TaskError::worker_execution(format!(
                "function `{}` panicked: {}",
                self.symbol,
                panic_message(&*panic)
            ))),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
