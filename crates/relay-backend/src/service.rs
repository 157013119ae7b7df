//! Backend client seam and the deadline-enforcing adapter.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::time::{timeout, timeout_at, Instant};

/// A lazy, finite, non-restartable sequence of stream payloads.
///
/// Dropping the stream releases the underlying backend stream; cancellation
/// is therefore "stop polling and drop".
pub type PayloadStream = Pin<Box<dyn Stream<Item = Result<Value, BackendError>> + Send>>;

/// Backend transport or application failure.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The backend executed the call and reported an error.
    #[error("{0}")]
    Application(String),

    /// The backend could not be reached or the connection broke.
    #[error("backend transport error: {0}")]
    Transport(String),

    /// The call's deadline expired before the backend answered.
    #[error("backend deadline exceeded")]
    DeadlineExceeded,
}

/// The opaque backend service, reachable through two call shapes.
///
/// Implementations own their transport; the bridge never looks inside the
/// payloads it forwards.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Invoke a unary method: one request payload, one response payload.
    async fn unary(&self, method: &str, payload: Value) -> Result<Value, BackendError>;

    /// Invoke a server-streaming method: one request payload, an ordered
    /// sequence of response payloads terminated by exhaustion or an error.
    async fn stream(&self, method: &str, payload: Value) -> Result<PayloadStream, BackendError>;
}

/// Establishes backend handles for sessions.
///
/// One implementation may dial a fresh connection per session or hand out a
/// shared pooled client; the bridge only requires that `connect` fails
/// cleanly when the backend is unavailable.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    /// Obtain a client for one session's lifetime.
    async fn connect(&self) -> Result<Arc<dyn BackendClient>, BackendError>;
}

/// Connector that hands out one shared client (the pooled form).
pub struct StaticConnector {
    client: Arc<dyn BackendClient>,
}

impl StaticConnector {
    /// Wrap an already-constructed client.
    pub fn new(client: Arc<dyn BackendClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BackendConnector for StaticConnector {
    async fn connect(&self) -> Result<Arc<dyn BackendClient>, BackendError> {
        Ok(self.client.clone())
    }
}

/// Deadline-enforcing wrapper around a connected backend client.
///
/// Unary calls get one bounded deadline; streaming calls get one deadline
/// covering the whole stream (establishment included, not re-armed per item).
pub struct BackendAdapter {
    client: Arc<dyn BackendClient>,
    unary_deadline: Duration,
    stream_deadline: Duration,
}

impl BackendAdapter {
    /// Bind an adapter to a connected client with the configured deadlines.
    pub fn new(client: Arc<dyn BackendClient>, unary_deadline: Duration, stream_deadline: Duration) -> Self {
        Self {
            client,
            unary_deadline,
            stream_deadline,
        }
    }

    /// Invoke the backend's unary path under the unary deadline.
    pub async fn call_unary(&self, method: &str, payload: Value) -> Result<Value, BackendError> {
        timeout(self.unary_deadline, self.client.unary(method, payload))
            .await
            .map_err(|_| BackendError::DeadlineExceeded)?
    }

    /// Invoke the backend's streaming path under one whole-stream deadline.
    ///
    /// The returned stream yields `DeadlineExceeded` and stops if the
    /// deadline expires mid-sequence.
    pub async fn call_stream(&self, method: &str, payload: Value) -> Result<PayloadStream, BackendError> {
        let deadline = Instant::now() + self.stream_deadline;
        let mut inner = timeout_at(deadline, self.client.stream(method, payload))
            .await
            .map_err(|_| BackendError::DeadlineExceeded)??;

        let bounded = async_stream::stream! {
            loop {
                match timeout_at(deadline, inner.next()).await {
                    Err(_) => {
                        yield Err(BackendError::DeadlineExceeded);
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(item)) => yield item,
                }
            }
        };
        Ok(Box::pin(bounded))
    }
}
