// SPDX-License-Identifier: MIT
//! Wire protocol shared by the engine-side worker pool and plugin binaries.
//!
//! Frames are length-prefixed (u32 big-endian) JSON. One request gets
//! exactly one response; a worker process handles one request at a time —
//! parallelism comes from the pool, not from the worker.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::codec::LengthDelimitedCodec;

/// Upper bound on a single frame. A row's field mapping or a task result
/// larger than this is a protocol error, not a bigger buffer.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Engine → plugin: run the named task against one row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkRequest {
    /// Task id — the handler name registered in the plugin.
    pub task: String,
    /// The row's field mapping: `id` plus each declared dependency's value.
    pub row: Map<String, Value>,
}

/// Plugin → engine: outcome of one request. Exactly one field is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkResponse {
    pub fn ok(result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(message.into()),
        }
    }
}

/// Codec used on both ends of the pipe.
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_shape_on_the_wire() {
        let ok = serde_json::to_string(&WorkResponse::ok(serde_json::json!({"x": 1}))).unwrap();
        assert_eq!(ok, r#"{"result":{"x":1}}"#);

        let err: WorkResponse = serde_json::from_str(r#"{"error":"boom"}"#).unwrap();
        assert_eq!(err.error.as_deref(), Some("boom"));
        assert!(err.result.is_none());
    }
}
