//! # ws
//!
//! WebSocket push channel, independent of the HTTP API server.
//!
//! Every bus event becomes one JSON frame. A bounded replay buffer holds
//! the most recent frames; appending to the buffer and scheduling the
//! live send happen under the same mutex, so a client connecting in
//! between cannot miss a frame it is about to be replayed: the frame is
//! either in its replay snapshot or in its live queue, never neither.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::lifecycle::Shutdown;
use crate::util::bind_with_fallback;

const HISTORY_CAP: usize = 50;
const PORT_ATTEMPTS: u16 = 5;

struct WsInner {
    history: VecDeque<String>,
    tx: broadcast::Sender<String>,
}

pub struct WsBroadcaster {
    inner: Mutex<WsInner>,
    clients: AtomicUsize,
    bound_port: AtomicU16,
}

impl Default for WsBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl WsBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            inner: Mutex::new(WsInner {
                history: VecDeque::with_capacity(HISTORY_CAP),
                tx,
            }),
            clients: AtomicUsize::new(0),
            bound_port: AtomicU16::new(0),
        }
    }

    /// Queue one frame for every connected client and remember it for
    /// replay. Safe to call from any thread.
    pub fn broadcast(&self, frame: &Value) {
        let text = frame.to_string();
        let mut inner = self.inner.lock().unwrap();
        if inner.history.len() >= HISTORY_CAP {
            inner.history.pop_front();
        }
        inner.history.push_back(text.clone());
        // Receiver queues are filled here, under the history mutex
        let _ = inner.tx.send(text);
    }

    /// Replay snapshot plus a live receiver, taken atomically.
    fn subscribe_with_replay(&self) -> (Vec<String>, broadcast::Receiver<String>) {
        let inner = self.inner.lock().unwrap();
        (inner.history.iter().cloned().collect(), inner.tx.subscribe())
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::Relaxed)
    }

    pub fn port(&self) -> Option<u16> {
        match self.bound_port.load(Ordering::Relaxed) {
            0 => None,
            p => Some(p),
        }
    }

    pub fn status(&self) -> Value {
        json!({
            "port": self.port(),
            "clients": self.client_count(),
            "history": self.inner.lock().unwrap().history.len(),
        })
    }

    /// Bind the push listener (with adjacent-port fallback) and serve
    /// until shutdown. The listener closes as soon as the signal fires.
    pub async fn start(
        self: Arc<Self>,
        host: String,
        port: u16,
        shutdown: Shutdown,
    ) -> anyhow::Result<u16> {
        let (listener, bound) = bind_with_fallback(&host, port, PORT_ATTEMPTS).await?;
        self.bound_port.store(bound, Ordering::Relaxed);
        info!("websocket broadcaster listening on {host}:{bound}");

        let app = Router::new()
            .route("/", get(ws_upgrade))
            .with_state(self.clone());

        tokio::spawn(async move {
            let wait = shutdown.clone();
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { wait.wait().await })
                .await;
            if let Err(e) = result {
                // A close race during teardown is tolerated
                warn!("websocket listener exited: {e}");
            }
        });

        Ok(bound)
    }
}

async fn ws_upgrade(
    State(broadcaster): State<Arc<WsBroadcaster>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| client_session(broadcaster, socket))
}

async fn client_session(broadcaster: Arc<WsBroadcaster>, socket: WebSocket) {
    broadcaster.clients.fetch_add(1, Ordering::Relaxed);
    debug!("ws client connected ({} total)", broadcaster.client_count());

    let (replay, mut rx) = broadcaster.subscribe_with_replay();
    let (mut sink, mut stream) = socket.split();

    // History first, in order, then live traffic
    for frame in replay {
        if sink.send(Message::Text(frame)).await.is_err() {
            broadcaster.clients.fetch_sub(1, Ordering::Relaxed);
            return;
        }
    }

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(frame) => {
                    if sink.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("ws client lagged, dropped {skipped} frames");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // inbound frames are ignored
                Some(Err(_)) => break,
            },
        }
    }

    broadcaster.clients.fetch_sub(1, Ordering::Relaxed);
    debug!("ws client disconnected ({} left)", broadcaster.client_count());
}
