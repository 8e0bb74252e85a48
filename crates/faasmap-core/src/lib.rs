#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Primitives shared by the `faasmap` master and worker sides: the
//! chunk/outcome model, the named-function registry, the function transport
//! envelope, the invocation wire frames, and the worker-process entrypoint.

pub mod codec;
pub mod registry;
pub mod task;
pub mod wire;
pub mod worker;

pub use codec::{CodecError, SerializedFunction};
pub use registry::{ChunkFnError, FunctionRegistry};
pub use task::{Chunk, TaskError, TaskErrorKind, TaskOutcome};
