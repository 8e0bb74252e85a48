//! Named user functions.
//!
//! Rust has no generic closure serialization, so user functions are not
//! shipped as code: both the master side and every worker register the same
//! functions by name at startup, and only `(symbol, chunk)` travels over the
//! wire. See [`crate::codec`] for the transport envelope.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::task::Chunk;

/// Failure modes of a registered chunk function.
#[derive(Debug, thiserror::Error)]
pub enum ChunkFnError {
    /// The chunk payload did not match the shape the function expects.
    ///
    /// Returning this from a registered function lets the runtime
    /// distinguish "the function was handed data it cannot accept" from an
    /// ordinary computation failure.
    #[error("chunk type mismatch: {0}")]
    TypeMismatch(String),
    /// The function ran and failed.
    #[error("{0}")]
    Failed(String),
}

/// A registered user function: a pure mapping from one chunk to one value.
pub type ChunkFn = dyn Fn(Chunk) -> Result<Value, ChunkFnError> + Send + Sync;

/// A name-to-function table.
///
/// Cloning is cheap; registered functions are shared behind [`Arc`].
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<ChunkFn>>,
}

impl FunctionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `function` under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(Chunk) -> Result<Value, ChunkFnError> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
    }

    /// Registers a function over decoded items.
    ///
    /// Every item of the incoming chunk is decoded into `T` before the
    /// function runs, and its result is encoded back into a JSON value. An
    /// item that does not decode into `T` yields
    /// [`ChunkFnError::TypeMismatch`].
    pub fn register_typed<T, R, F>(&mut self, name: impl Into<String>, function: F)
    where
        T: DeserializeOwned,
        R: Serialize,
        F: Fn(Vec<T>) -> Result<R, String> + Send + Sync + 'static,
    {
        self.register(name, move |chunk: Chunk| {
            let mut items = Vec::with_capacity(chunk.len());
            for item in chunk {
                let item = serde_json::from_value::<T>(item)
                    .map_err(|err| ChunkFnError::TypeMismatch(err.to_string()))?;
                items.push(item);
            }
            let out = function(items).map_err(ChunkFnError::Failed)?;
            serde_json::to_value(out)
                .map_err(|err| ChunkFnError::Failed(format!("encode result: {err}")))
        });
    }

    /// Looks up a function by name.
    pub fn get(&self, name: &str) -> Option<Arc<ChunkFn>> {
        self.functions.get(name).cloned()
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// The registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}
