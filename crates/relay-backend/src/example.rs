//! Fixture backend service: a greeting call and a counted message stream.
//!
//! These two methods exist to exercise the bridge; their request shapes are
//! also what the gateway registers for payload validation.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use async_trait::async_trait;

use crate::service::{BackendClient, BackendError, PayloadStream};

/// Stream length used when the client asks for `count <= 0`.
pub const DEFAULT_STREAM_COUNT: i32 = 5;

/// `SayHello` request body.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HelloRequest {
    /// Name to greet; absent decodes as empty.
    #[serde(default)]
    pub name: String,
}

/// `StreamMessages` request body.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StreamRequest {
    /// Text echoed in every stream item.
    #[serde(default)]
    pub message: String,
    /// Number of items to produce; `<= 0` is normalized to
    /// [`DEFAULT_STREAM_COUNT`].
    #[serde(default)]
    pub count: i32,
}

/// In-process implementation of the example service.
pub struct ExampleBackend;

#[async_trait]
impl BackendClient for ExampleBackend {
    async fn unary(&self, method: &str, payload: Value) -> Result<Value, BackendError> {
        match method {
            "SayHello" => {
                let req: HelloRequest = serde_json::from_value(payload)
                    .map_err(|e| BackendError::Application(format!("invalid SayHello request: {e}")))?;
                tracing::debug!(name = %req.name, "SayHello");
                Ok(json!({ "message": format!("Hello {}", req.name) }))
            }
            other => Err(BackendError::Application(format!(
                "unimplemented unary method: {other}"
            ))),
        }
    }

    async fn stream(&self, method: &str, payload: Value) -> Result<PayloadStream, BackendError> {
        match method {
            "StreamMessages" => {
                let req: StreamRequest = serde_json::from_value(payload).map_err(|e| {
                    BackendError::Application(format!("invalid StreamMessages request: {e}"))
                })?;
                let count = if req.count <= 0 { DEFAULT_STREAM_COUNT } else { req.count };
                tracing::debug!(message = %req.message, count, "StreamMessages");
                let message = req.message;
                let items = async_stream::stream! {
                    for index in 1..=count {
                        yield Ok(json!({ "message": message, "index": index }));
                    }
                };
                Ok(Box::pin(items))
            }
            other => Err(BackendError::Application(format!(
                "unimplemented stream method: {other}"
            ))),
        }
    }
}
