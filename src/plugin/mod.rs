// SPDX-License-Identifier: MIT
//! Plugin SDK — the serving loop a plugin binary embeds.
//!
//! A plugin registers one handler per task id and then hands control to
//! [`PluginHost::serve`], which reads [`WorkRequest`] frames from stdin and
//! writes one [`WorkResponse`] frame per request to stdout until the engine
//! closes the pipe. The engine owns isolation and timeouts; the plugin only
//! has to not write stray bytes to stdout.
//!
//! ```no_run
//! use rowforge::plugin::PluginHost;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     PluginHost::new()
//!         .handler("greet", |row| Ok(json!({ "greeting": row["id"] })))
//!         .serve()
//!         .await
//! }
//! ```

pub mod wire;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;

use anyhow::{Context as _, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio_util::codec::{FramedRead, FramedWrite};

use wire::{WorkRequest, WorkResponse};

/// A task handler: row fields in, JSON result or error message out.
///
/// Handlers are synchronous on purpose — each worker process serves one
/// request at a time, so there is nothing to overlap with inside the plugin.
pub type Handler = Box<dyn Fn(Map<String, Value>) -> Result<Value, String> + Send + Sync>;

/// Handler registry plus the stdin/stdout serving loop.
#[derive(Default)]
pub struct PluginHost {
    handlers: HashMap<String, Handler>,
}

impl PluginHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a task id. Last registration wins.
    pub fn handler<F>(mut self, task: impl Into<String>, f: F) -> Self
    where
        F: Fn(Map<String, Value>) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.handlers.insert(task.into(), Box::new(f));
        self
    }

    /// Serve requests until stdin reaches EOF (the engine dropped us).
    pub async fn serve(self) -> Result<()> {
        let mut requests = FramedRead::new(tokio::io::stdin(), wire::codec());
        let mut responses = FramedWrite::new(tokio::io::stdout(), wire::codec());

        while let Some(frame) = requests.next().await {
            let frame = frame.context("failed to read request frame")?;
            let response = match serde_json::from_slice::<WorkRequest>(&frame) {
                Ok(request) => self.dispatch(request),
                Err(e) => WorkResponse::err(format!("malformed request frame: {e}")),
            };
            let bytes = serde_json::to_vec(&response).context("failed to encode response")?;
            responses
                .send(bytes.into())
                .await
                .context("failed to write response frame")?;
        }
        Ok(())
    }

    fn dispatch(&self, request: WorkRequest) -> WorkResponse {
        let Some(handler) = self.handlers.get(&request.task) else {
            // The engine-side equivalent of a bad entry point: reported as a
            // per-row error, never a crash.
            return WorkResponse::err(format!(
                "plugin has no handler named {:?}",
                request.task
            ));
        };

        match std::panic::catch_unwind(AssertUnwindSafe(|| handler(request.row))) {
            Ok(Ok(value)) => WorkResponse::ok(value),
            Ok(Err(message)) => WorkResponse::err(message),
            Err(panic) => WorkResponse::err(format!(
                "handler {:?} panicked: {}",
                request.task,
                panic_message(panic.as_ref())
            )),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(task: &str) -> WorkRequest {
        let mut row = Map::new();
        row.insert("id".to_string(), json!("r1"));
        WorkRequest {
            task: task.to_string(),
            row,
        }
    }

    fn host() -> PluginHost {
        PluginHost::new()
            .handler("ok", |row| Ok(json!({ "seen": row["id"] })))
            .handler("fail", |_| Err("no thanks".to_string()))
            .handler("panic", |_| panic!("kaboom"))
    }

    #[test]
    fn test_dispatch_success() {
        let resp = host().dispatch(request("ok"));
        assert_eq!(resp.result, Some(json!({ "seen": "r1" })));
        assert!(resp.error.is_none());
    }

    #[test]
    fn test_dispatch_handler_error() {
        let resp = host().dispatch(request("fail"));
        assert!(resp.result.is_none());
        assert_eq!(resp.error.as_deref(), Some("no thanks"));
    }

    #[test]
    fn test_dispatch_unknown_handler() {
        let resp = host().dispatch(request("missing"));
        assert!(resp.error.unwrap().contains("no handler named"));
    }

    #[test]
    fn test_dispatch_catches_panics() {
        let resp = host().dispatch(request("panic"));
        let err = resp.error.unwrap();
        assert!(err.contains("panicked"), "got: {err}");
        assert!(err.contains("kaboom"), "got: {err}");
    }
}
