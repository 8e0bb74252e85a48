#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Master-worker orchestration of embarrassingly-parallel computations over
//! FaaS-style worker pools: partition an input into chunks, keep every
//! worker busy dispatching chunks, collect per-chunk outcomes in input
//! order, optionally reduce them to a final value.

pub mod endpoints;
pub mod master;
pub mod partition;
pub mod pool;

pub use endpoints::{DEFAULT_CONFIG_PATH, EndpointEntry, EndpointsConfig};
pub use master::{Master, RunError, RunResult, TaskState, TaskStatus};
pub use partition::{EvenSplit, FixedSize, PartitionError, Partitioner, WholeInput};
pub use pool::local::{LocalPool, LocalPoolConfig, LocalPoolError};
pub use pool::remote::{EndpointHealth, RemoteFaasPool, list_endpoint_statuses};
pub use pool::{DeferredResult, SubmitError, WorkerId, WorkerPool};

pub use faasmap_core::{
    Chunk, ChunkFnError, CodecError, FunctionRegistry, SerializedFunction, TaskError,
    TaskErrorKind, TaskOutcome,
};

#[cfg(test)]
use tracing_subscriber as _;
