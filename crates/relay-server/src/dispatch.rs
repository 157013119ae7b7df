//! Per-call dispatch state machines (unary and server-streaming).

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use metrics::{counter, histogram};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use relay_backend::{BackendAdapter, BackendError};
use relay_proto::{CallError, Envelope};

use crate::registry::MethodKind;
use crate::session::FrameSink;

/// Terminal state of a dispatched call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallState {
    /// The call produced its full response (or stream plus end marker).
    Completed,
    /// The call ended with a reported error envelope.
    Failed,
    /// The call was aborted by teardown; no further frames were written.
    Cancelled,
}

impl CallState {
    /// Log/label form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

fn map_backend_error(err: BackendError) -> CallError {
    match err {
        BackendError::DeadlineExceeded => CallError::Timeout,
        BackendError::Application(message) => CallError::Backend(message),
        err @ BackendError::Transport(_) => CallError::Backend(err.to_string()),
    }
}

/// Drive one admitted call to a terminal state, emitting its frames through
/// the session's sink.
///
/// Teardown cancellation stops the call without writing further frames for
/// its id; the connection is closing, so a terminal frame would not be
/// delivered anyway.
pub(crate) async fn run_call(
    sink: FrameSink,
    adapter: Arc<BackendAdapter>,
    kind: MethodKind,
    id: String,
    method: String,
    payload: Value,
    cancel: CancellationToken,
) -> CallState {
    counter!("rpc_requests_total", "method" => method.clone()).increment(1);
    let start = Instant::now();

    let state = match kind {
        MethodKind::Unary => run_unary(&sink, &adapter, &id, &method, payload, &cancel).await,
        MethodKind::Stream => run_stream(&sink, &adapter, &id, &method, payload, &cancel).await,
    };

    histogram!("rpc_request_duration_seconds", "method" => method.clone())
        .record(start.elapsed().as_secs_f64());
    state
}

async fn run_unary(
    sink: &FrameSink,
    adapter: &BackendAdapter,
    id: &str,
    method: &str,
    payload: Value,
    cancel: &CancellationToken,
) -> CallState {
    let result = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            debug!(id, "unary call cancelled");
            return CallState::Cancelled;
        }
        result = adapter.call_unary(method, payload) => result,
    };

    match result {
        Ok(value) => {
            if sink.send(&Envelope::response(method, id, value)).await {
                CallState::Completed
            } else {
                CallState::Cancelled
            }
        }
        Err(err) => fail(sink, id, method, err).await,
    }
}

async fn run_stream(
    sink: &FrameSink,
    adapter: &BackendAdapter,
    id: &str,
    method: &str,
    payload: Value,
    cancel: &CancellationToken,
) -> CallState {
    let result = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            debug!(id, "stream call cancelled before establishment");
            return CallState::Cancelled;
        }
        result = adapter.call_stream(method, payload) => result,
    };

    let mut items = match result {
        Ok(items) => items,
        Err(err) => return fail(sink, id, method, err).await,
    };

    loop {
        let item = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(id, "stream call cancelled mid-sequence");
                return CallState::Cancelled;
            }
            item = items.next() => item,
        };

        match item {
            Some(Ok(value)) => {
                counter!("rpc_stream_items_total", "method" => method.to_owned()).increment(1);
                if !sink.send(&Envelope::response(method, id, value)).await {
                    return CallState::Cancelled;
                }
            }
            // Mid-stream error is terminal; no end marker follows
            Some(Err(err)) => return fail(sink, id, method, err).await,
            None => {
                let _ = sink.send(&Envelope::stream_end(method, id)).await;
                return CallState::Completed;
            }
        }
    }
}

async fn fail(sink: &FrameSink, id: &str, method: &str, err: BackendError) -> CallState {
    let call_err = map_backend_error(err);
    counter!("rpc_errors_total", "method" => method.to_owned(), "error_type" => call_err.code())
        .increment(1);
    let _ = sink.send(&call_err.to_envelope(id)).await;
    CallState::Failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_backend::{BackendClient, PayloadStream};
    use relay_proto::decode;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn sink() -> (FrameSink, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(64);
        (FrameSink::new(tx), rx)
    }

    fn adapter(client: impl BackendClient + 'static) -> Arc<BackendAdapter> {
        Arc::new(BackendAdapter::new(
            Arc::new(client),
            Duration::from_secs(10),
            Duration::from_secs(30),
        ))
    }

    async fn next_envelope(rx: &mut mpsc::Receiver<Arc<String>>) -> Envelope {
        decode(&rx.recv().await.unwrap()).unwrap()
    }

    struct FixtureClient;

    #[async_trait]
    impl BackendClient for FixtureClient {
        async fn unary(&self, _method: &str, payload: Value) -> Result<Value, BackendError> {
            Ok(json!({"echo": payload}))
        }

        async fn stream(&self, _method: &str, _payload: Value) -> Result<PayloadStream, BackendError> {
            let s = async_stream::stream! {
                for index in 1..=3 {
                    yield Ok(json!({"index": index}));
                }
            };
            Ok(Box::pin(s))
        }
    }

    struct FailingClient;

    #[async_trait]
    impl BackendClient for FailingClient {
        async fn unary(&self, _method: &str, _payload: Value) -> Result<Value, BackendError> {
            Err(BackendError::Application("boom".into()))
        }

        async fn stream(&self, _method: &str, _payload: Value) -> Result<PayloadStream, BackendError> {
            let s = async_stream::stream! {
                yield Ok(json!({"index": 1}));
                yield Err(BackendError::Application("midway".into()));
            };
            Ok(Box::pin(s))
        }
    }

    #[tokio::test]
    async fn unary_success_emits_one_response() {
        let (sink, mut rx) = sink();
        let state = run_call(
            sink,
            adapter(FixtureClient),
            MethodKind::Unary,
            "a1".into(),
            "SayHello".into(),
            json!({"name": "x"}),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(state, CallState::Completed);
        let env = next_envelope(&mut rx).await;
        assert_eq!(env.id, "a1");
        assert_eq!(env.method, "SayHello");
        assert_eq!(env.payload.unwrap()["echo"]["name"], "x");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unary_backend_error_emits_failure() {
        let (sink, mut rx) = sink();
        let state = run_call(
            sink,
            adapter(FailingClient),
            MethodKind::Unary,
            "a2".into(),
            "SayHello".into(),
            json!({}),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(state, CallState::Failed);
        let env = next_envelope(&mut rx).await;
        assert_eq!(env.id, "a2");
        assert_eq!(env.error.as_deref(), Some("backend call failed: boom"));
        assert!(env.payload.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unary_deadline_reported_as_timeout() {
        struct StuckClient;

        #[async_trait]
        impl BackendClient for StuckClient {
            async fn unary(&self, _m: &str, _p: Value) -> Result<Value, BackendError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(json!({}))
            }

            async fn stream(&self, _m: &str, _p: Value) -> Result<PayloadStream, BackendError> {
                Err(BackendError::Application("unused".into()))
            }
        }

        let (sink, mut rx) = sink();
        let state = run_call(
            sink,
            adapter(StuckClient),
            MethodKind::Unary,
            "a3".into(),
            "SayHello".into(),
            json!({}),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(state, CallState::Failed);
        let env = next_envelope(&mut rx).await;
        assert_eq!(env.error.as_deref(), Some("call deadline exceeded"));
    }

    #[tokio::test]
    async fn stream_emits_items_in_order_then_end_marker() {
        let (sink, mut rx) = sink();
        let state = run_call(
            sink,
            adapter(FixtureClient),
            MethodKind::Stream,
            "s1".into(),
            "StreamMessages".into(),
            json!({}),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(state, CallState::Completed);
        for expected in 1..=3 {
            let env = next_envelope(&mut rx).await;
            assert_eq!(env.id, "s1");
            assert_eq!(env.payload.unwrap()["index"], expected);
        }
        let end = next_envelope(&mut rx).await;
        assert!(end.is_stream_end());
        assert_eq!(end.id, "s1");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stream_mid_error_is_last_frame_no_end_marker() {
        let (sink, mut rx) = sink();
        let state = run_call(
            sink,
            adapter(FailingClient),
            MethodKind::Stream,
            "s2".into(),
            "StreamMessages".into(),
            json!({}),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(state, CallState::Failed);
        let first = next_envelope(&mut rx).await;
        assert_eq!(first.payload.unwrap()["index"], 1);
        let last = next_envelope(&mut rx).await;
        assert_eq!(last.error.as_deref(), Some("backend call failed: midway"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn pre_cancelled_call_writes_no_frames() {
        let (sink, mut rx) = sink();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let state = run_call(
            sink,
            adapter(FixtureClient),
            MethodKind::Unary,
            "c1".into(),
            "SayHello".into(),
            json!({}),
            cancel,
        )
        .await;

        assert_eq!(state, CallState::Cancelled);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancellation_mid_stream_stops_and_releases_backend() {
        struct Guard(Arc<AtomicBool>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        struct EndlessClient {
            released: Arc<AtomicBool>,
        }

        #[async_trait]
        impl BackendClient for EndlessClient {
            async fn unary(&self, _m: &str, _p: Value) -> Result<Value, BackendError> {
                Err(BackendError::Application("unused".into()))
            }

            async fn stream(&self, _m: &str, _p: Value) -> Result<PayloadStream, BackendError> {
                let guard = Guard(self.released.clone());
                let s = async_stream::stream! {
                    let _guard = guard;
                    let mut index = 0;
                    loop {
                        index += 1;
                        yield Ok(json!({"index": index}));
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                };
                Ok(Box::pin(s))
            }
        }

        let released = Arc::new(AtomicBool::new(false));
        let (sink, mut rx) = sink();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_call(
            sink,
            adapter(EndlessClient {
                released: released.clone(),
            }),
            MethodKind::Stream,
            "s3".into(),
            "StreamMessages".into(),
            json!({}),
            cancel.clone(),
        ));

        // Let at least one item through, then tear down
        let first = next_envelope(&mut rx).await;
        assert_eq!(first.payload.unwrap()["index"], 1);
        cancel.cancel();

        let state = handle.await.unwrap();
        assert_eq!(state, CallState::Cancelled);
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn closed_sink_stops_stream_without_panic() {
        let (sink, rx) = sink();
        drop(rx);

        let state = run_call(
            sink,
            adapter(FixtureClient),
            MethodKind::Stream,
            "s4".into(),
            "StreamMessages".into(),
            json!({}),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(state, CallState::Cancelled);
    }
}
