//! Per-connection session: inbound read loop, single outbound writer, and
//! in-flight call tracking.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use relay_backend::BackendAdapter;
use relay_proto::{decode, encode, CallError, Envelope, EnvelopeKind};

use crate::dispatch::run_call;
use crate::server::AppState;

/// Capacity of the outbound frame queue feeding the writer task.
const SEND_QUEUE_CAPACITY: usize = 1024;

/// Handle through which every outbound frame reaches the writer task.
///
/// All frames for a connection funnel through one queue, so each envelope is
/// written as exactly one text frame and frames are never interleaved.
#[derive(Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<Arc<String>>,
}

impl FrameSink {
    pub(crate) fn new(tx: mpsc::Sender<Arc<String>>) -> Self {
        Self { tx }
    }

    /// Enqueue an envelope for the writer task.
    ///
    /// Returns `false` once the writer has gone away; callers must stop
    /// emitting for their call at that point.
    pub async fn send(&self, envelope: &Envelope) -> bool {
        self.tx.send(Arc::new(encode(envelope))).await.is_ok()
    }
}

/// State for one connected client.
pub struct Session {
    /// Unique session ID.
    pub id: String,
    /// Teardown signal; child of the registry's root token.
    cancel: CancellationToken,
    max_in_flight: usize,
    /// Active calls by correlation id. Keys are unique at any instant; a
    /// finished call's id may be reused by a later request.
    in_flight: Mutex<HashMap<String, CancellationToken>>,
    /// Whether the client has responded since the last ping.
    is_alive: AtomicBool,
    /// When the last Pong (or any activity) was received.
    last_pong: Mutex<Instant>,
    /// When this connection was established.
    pub connected_at: Instant,
}

impl Session {
    /// Create a session bound to a teardown token.
    pub fn new(id: String, cancel: CancellationToken, max_in_flight: usize) -> Self {
        let now = Instant::now();
        Self {
            id,
            cancel,
            max_in_flight,
            in_flight: Mutex::new(HashMap::new()),
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            connected_at: now,
        }
    }

    /// Admit a call, handing back its cancellation token.
    ///
    /// Rejects when the in-flight cap is reached or the id is already in
    /// flight.
    pub fn begin_call(&self, id: &str) -> Result<CancellationToken, CallError> {
        let mut in_flight = self.in_flight.lock();
        if in_flight.len() >= self.max_in_flight {
            return Err(CallError::TooManyInFlight);
        }
        if in_flight.contains_key(id) {
            return Err(CallError::DuplicateId(id.to_owned()));
        }
        let token = self.cancel.child_token();
        let _ = in_flight.insert(id.to_owned(), token.clone());
        Ok(token)
    }

    /// Retire a call. Returns `false` if the id was not in flight.
    pub fn end_call(&self, id: &str) -> bool {
        self.in_flight.lock().remove(id).is_some()
    }

    /// Number of calls currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Signal teardown. Cancels every active call's token.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether teardown has been signalled.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Clone of the session's teardown token.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Mark the connection as alive (pong received).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Duration since the last pong (or connection establishment).
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

/// Run a WebSocket session for a connected client.
///
/// 1. Spawns the single writer task (frames, pings, drain-on-close)
/// 2. Establishes the backend handle, failing the session cleanly if that
///    does not succeed
/// 3. Dispatches incoming request envelopes as concurrent calls
/// 4. Tears down on close, read error, malformed frame, or shutdown,
///    cancelling every in-flight call
#[instrument(skip_all, fields(session_id = %session.id))]
pub async fn run_session(ws: WebSocket, session: Arc<Session>, state: AppState) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(SEND_QUEUE_CAPACITY);
    let sink = FrameSink::new(send_tx);

    let connection_start = Instant::now();
    info!("client connected");
    counter!("ws_connections_total").increment(1);
    gauge!("ws_connections_active").increment(1.0);

    state.sessions.add(session.clone());

    // Writer task: sole owner of the WebSocket send half. Forwards queued
    // frames, sends periodic pings, and on teardown flushes what is already
    // queued before closing.
    let writer_session = session.clone();
    let ping_every = state.config.heartbeat_interval();
    let pong_timeout = state.config.heartbeat_timeout();
    let writer = tokio::spawn(async move {
        let cancel = writer_session.token();
        let mut ping_interval = tokio::time::interval(ping_every);
        // Skip the immediate first tick
        let _ = ping_interval.tick().await;

        loop {
            tokio::select! {
                frame = send_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            if ws_tx.send(Message::Text(frame.as_str().into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                () = cancel.cancelled() => {
                    while let Ok(frame) = send_rx.try_recv() {
                        if ws_tx.send(Message::Text(frame.as_str().into())).await.is_err() {
                            break;
                        }
                    }
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
                _ = ping_interval.tick() => {
                    if !writer_session.check_alive()
                        && writer_session.last_pong_elapsed() > pong_timeout
                    {
                        warn!("client unresponsive for {pong_timeout:?}, disconnecting");
                        writer_session.close();
                        break;
                    }
                    if ws_tx.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Establish the backend handle before serving any request. Failure is
    // reported once (synthetic envelope, empty id) and the session closes.
    let adapter = match state.connector.connect().await {
        Ok(client) => Some(Arc::new(BackendAdapter::new(
            client,
            state.config.unary_deadline(),
            state.config.stream_deadline(),
        ))),
        Err(err) => {
            warn!(error = %err, "backend connection failed");
            let _ = sink
                .send(&CallError::Backend(err.to_string()).to_envelope(""))
                .await;
            None
        }
    };

    if let Some(adapter) = adapter {
        let cancel = session.token();
        loop {
            let msg = tokio::select! {
                () = cancel.cancelled() => break,
                msg = ws_rx.next() => msg,
            };
            let Some(msg) = msg else { break };
            let Ok(msg) = msg else {
                debug!("read error, closing");
                break;
            };

            let text = match msg {
                Message::Text(ref t) => t.to_string(),
                Message::Binary(ref data) => match std::str::from_utf8(data) {
                    Ok(s) => s.to_owned(),
                    Err(_) => {
                        debug!(len = data.len(), "ignoring non-UTF8 binary frame");
                        continue;
                    }
                },
                Message::Close(_) => {
                    info!("client sent close frame");
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => {
                    session.mark_alive();
                    continue;
                }
            };

            match decode(&text) {
                Ok(envelope) => accept_frame(&session, &sink, &state, &adapter, envelope).await,
                Err(err) => {
                    // Malformed outer frame is connection-fatal
                    warn!(error = %err, "closing connection");
                    break;
                }
            }
        }
    }

    info!("client disconnected");
    session.close();

    // Let the writer flush queued frames, bounded by the grace period
    if tokio::time::timeout(state.config.shutdown_grace(), writer)
        .await
        .is_err()
    {
        warn!("writer did not drain within grace period");
    }

    let _ = state.sessions.remove(&session.id);
    counter!("ws_disconnections_total").increment(1);
    gauge!("ws_connections_active").decrement(1.0);
    histogram!("ws_connection_duration_seconds").record(connection_start.elapsed().as_secs_f64());
}

/// Handle one decoded inbound envelope.
///
/// Rejections (unknown method, invalid payload, cap, duplicate id) are
/// reported immediately without creating a call; accepted requests spawn a
/// dispatch task and return to the read loop.
async fn accept_frame(
    session: &Arc<Session>,
    sink: &FrameSink,
    state: &AppState,
    adapter: &Arc<BackendAdapter>,
    envelope: Envelope,
) {
    if envelope.kind == EnvelopeKind::Response {
        warn!(id = %envelope.id, "ignoring inbound response frame");
        return;
    }

    let Envelope {
        method, id, payload, ..
    } = envelope;
    // Absent payload is an empty request body
    let payload = payload.unwrap_or_else(|| json!({}));

    let Some(spec) = state.registry.resolve(&method) else {
        counter!("rpc_errors_total", "method" => method.clone(), "error_type" => relay_proto::errors::UNKNOWN_METHOD)
            .increment(1);
        let _ = sink
            .send(&CallError::UnknownMethod(method).to_envelope(id))
            .await;
        return;
    };

    if let Err(reason) = spec.validate(&payload) {
        counter!("rpc_errors_total", "method" => method.clone(), "error_type" => relay_proto::errors::INVALID_PAYLOAD)
            .increment(1);
        let _ = sink
            .send(&CallError::InvalidPayload(reason).to_envelope(id))
            .await;
        return;
    }

    let token = match session.begin_call(&id) {
        Ok(token) => token,
        Err(err) => {
            counter!("rpc_errors_total", "method" => method.clone(), "error_type" => err.code())
                .increment(1);
            let _ = sink.send(&err.to_envelope(id)).await;
            return;
        }
    };

    gauge!("rpc_in_flight").increment(1.0);
    let kind = spec.kind();
    let call_session = session.clone();
    let call_sink = sink.clone();
    let call_adapter = adapter.clone();
    drop(tokio::spawn(async move {
        let state = run_call(
            call_sink,
            call_adapter,
            kind,
            id.clone(),
            method,
            payload,
            token,
        )
        .await;
        let _ = call_session.end_call(&id);
        gauge!("rpc_in_flight").decrement(1.0);
        debug!(session_id = %call_session.id, id, state = state.as_str(), "call finished");
    }));
}
