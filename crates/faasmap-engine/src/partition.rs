//! Data-partitioning strategies.
//!
//! A partitioner turns the input dataset into an ordered list of chunks.
//! Partitioning is pure slicing: no I/O, no blocking, and the concatenation
//! of the produced chunks always equals the input in order.

use serde_json::Value;

use faasmap_core::Chunk;

/// Partitioner precondition violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PartitionError {
    /// An argument violated the strategy's preconditions.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// A strategy turning an input into an ordered sequence of chunks.
///
/// `target_splits` is the parallelism hint the scheduler derives from the
/// pool; strategies are free to ignore it.
pub trait Partitioner: Send + Sync {
    /// Splits `input` into chunks.
    fn split(&self, input: &[Value], target_splits: usize) -> Result<Vec<Chunk>, PartitionError>;
}

/// Splits the input as evenly as possible into `target_splits` chunks.
///
/// This is the default strategy. With `n` items and `K` target splits the
/// first `n mod K` chunks carry one extra item; when `K > n` the surplus
/// chunks are empty and are still dispatched, so user functions must
/// tolerate empty chunks.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvenSplit;

impl Partitioner for EvenSplit {
    fn split(&self, input: &[Value], target_splits: usize) -> Result<Vec<Chunk>, PartitionError> {
        if target_splits == 0 {
            return Err(PartitionError::InvalidArgument(
                "target_splits must be at least 1".to_string(),
            ));
        }
        if input.is_empty() {
            return Ok(Vec::new());
        }

        let base = input.len() / target_splits;
        let remainder = input.len() % target_splits;

        let mut chunks = Vec::with_capacity(target_splits);
        let mut position = 0;
        for i in 0..target_splits {
            let size = base + usize::from(i < remainder);
            chunks.push(input[position..position + size].to_vec());
            position += size;
        }
        Ok(chunks)
    }
}

/// Slices the input into contiguous chunks of a fixed size.
///
/// The chunk count is driven by the data alone; the scheduler's parallelism
/// hint is ignored. The last chunk may be shorter.
#[derive(Debug, Clone, Copy)]
pub struct FixedSize {
    items_per_chunk: usize,
}

impl FixedSize {
    /// Creates the strategy; `items_per_chunk` must be at least 1.
    pub fn new(items_per_chunk: usize) -> Result<Self, PartitionError> {
        if items_per_chunk == 0 {
            return Err(PartitionError::InvalidArgument(
                "items_per_chunk must be at least 1".to_string(),
            ));
        }
        Ok(Self { items_per_chunk })
    }
}

impl Partitioner for FixedSize {
    fn split(&self, input: &[Value], _target_splits: usize) -> Result<Vec<Chunk>, PartitionError> {
        Ok(input
            .chunks(self.items_per_chunk)
            .map(<[Value]>::to_vec)
            .collect())
    }
}

/// Does not split: the whole input becomes a single chunk.
#[derive(Debug, Clone, Copy, Default)]
pub struct WholeInput;

impl Partitioner for WholeInput {
    fn split(&self, input: &[Value], target_splits: usize) -> Result<Vec<Chunk>, PartitionError> {
        if target_splits == 0 {
            return Err(PartitionError::InvalidArgument(
                "at least one worker is required".to_string(),
            ));
        }
        Ok(vec![input.to_vec()])
    }
}
