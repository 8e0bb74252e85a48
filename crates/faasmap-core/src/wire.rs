//! Invocation frames.
//!
//! One request/reply shape is shared by every execution boundary: the local
//! pool writes these frames as line-delimited JSON over a child's stdio, and
//! the remote pool posts them as HTTP bodies. The function blob is
//! base64-framed so the whole frame stays valid JSON.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::{CodecError, SerializedFunction};
use crate::task::{Chunk, TaskError, TaskOutcome};

/// One task: an encoded function plus the chunk to apply it to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeRequest {
    /// Base64 of the [`SerializedFunction`] payload.
    pub function_b64: String,
    /// The chunk to process.
    pub chunk: Chunk,
}

impl InvokeRequest {
    /// Frames a function blob and a chunk for transport.
    pub fn new(function: &SerializedFunction, chunk: Chunk) -> Self {
        Self {
            function_b64: B64.encode(function.as_bytes()),
            chunk,
        }
    }

    /// Recovers the function blob from the frame.
    pub fn function(&self) -> Result<SerializedFunction, CodecError> {
        let bytes = B64
            .decode(self.function_b64.as_bytes())
            .map_err(|err| CodecError::Malformed(format!("bad function_b64: {err}")))?;
        Ok(SerializedFunction::from_bytes(bytes))
    }
}

/// The terminal reply for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvokeReply {
    /// The value returned by the user function.
    Ok(Value),
    /// The reified failure.
    Err(TaskError),
}

impl InvokeReply {
    /// Unwraps the reply into an outcome.
    pub fn into_outcome(self) -> TaskOutcome {
        match self {
            InvokeReply::Ok(value) => Ok(value),
            InvokeReply::Err(err) => Err(err),
        }
    }
}

impl From<TaskOutcome> for InvokeReply {
    fn from(outcome: TaskOutcome) -> Self {
        match outcome {
            Ok(value) => InvokeReply::Ok(value),
            Err(err) => InvokeReply::Err(err),
        }
    }
}
