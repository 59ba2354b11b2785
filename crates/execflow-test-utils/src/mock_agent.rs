//! In-process stand-in for the remote execution agent.
//!
//! - `GET /exec_task_set` (websocket): decrypts the first text frame, records
//!   it, streams the configured replies as text frames, then closes.
//! - `POST /exec_command`: decrypts the body, records it, answers with an
//!   envelope whose plaintext is the replies joined by newlines.
//! - `POST /status/{code}`: answers with that status and a plain-text body.
//! - `POST /garbage`: answers 200 with a body that is not JSON.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use execflow_crypto::{decrypt_to_string, encrypt, Envelope, SharedKey};

/// Marker recorded when a payload fails to decrypt.
pub const UNDECRYPTABLE: &str = "<undecryptable>";

struct MockState {
    key: SharedKey,
    replies: Vec<String>,
    received: Mutex<Vec<String>>,
}

pub struct MockAgent {
    addr: SocketAddr,
    state: Arc<MockState>,
    shutdown: CancellationToken,
}

impl MockAgent {
    /// Bind to an ephemeral local port and start serving.
    pub async fn start(key: SharedKey, replies: Vec<String>) -> Self {
        let state = Arc::new(MockState {
            key,
            replies,
            received: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/exec_task_set", get(ws_handler))
            .route("/exec_command", post(exec_handler))
            .route("/status/{code}", post(status_handler))
            .route("/garbage", post(garbage_handler))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock agent");
        let addr = listener.local_addr().expect("mock agent address");

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
        });

        Self {
            addr,
            state,
            shutdown,
        }
    }

    pub fn stream_url(&self) -> String {
        format!("ws://{}/exec_task_set", self.addr)
    }

    pub fn exec_url(&self) -> String {
        self.http_url("/exec_command")
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Decrypted payloads received so far, in arrival order.
    pub async fn received(&self) -> Vec<String> {
        self.state.received.lock().await.clone()
    }
}

impl Drop for MockAgent {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn open(state: &MockState, raw: &str) -> String {
    Envelope::from_json(raw)
        .and_then(|env| decrypt_to_string(&env, &state.key))
        .unwrap_or_else(|_| UNDECRYPTABLE.to_string())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<MockState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<MockState>) {
    let first = loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => break text.as_str().to_string(),
            Some(Ok(_)) => continue,
            _ => return,
        }
    };

    let plaintext = open(&state, &first);
    debug!(len = plaintext.len(), "Mock agent received task set");
    let accepted = plaintext != UNDECRYPTABLE;
    state.received.lock().await.push(plaintext);

    if accepted {
        for reply in &state.replies {
            if socket.send(Message::Text(reply.clone().into())).await.is_err() {
                return;
            }
        }
    } else {
        let _ = socket
            .send(Message::Text("error: payload rejected".into()))
            .await;
    }

    let _ = socket.send(Message::Close(None)).await;
    // Drain until the client acknowledges the close.
    while let Some(Ok(_)) = socket.recv().await {}
}

async fn exec_handler(State(state): State<Arc<MockState>>, body: String) -> (StatusCode, String) {
    let plaintext = open(&state, &body);
    let accepted = plaintext != UNDECRYPTABLE;
    state.received.lock().await.push(plaintext);

    if !accepted {
        return (StatusCode::BAD_REQUEST, "payload rejected".to_string());
    }

    match encrypt(&state.key, state.replies.join("\n").as_bytes(), b"") {
        Ok(env) => (StatusCode::OK, env.to_json()),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn status_handler(Path(code): Path<u16>) -> (StatusCode, String) {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, "agent unavailable".to_string())
}

async fn garbage_handler() -> (StatusCode, String) {
    (StatusCode::OK, "<html>definitely not json</html>".to_string())
}

/// A TCP listener that accepts connections and never answers the handshake.
pub async fn silent_listener() -> (String, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind silent listener");
    let addr = listener.local_addr().expect("silent listener address");
    let token = CancellationToken::new();
    let stop = token.clone();

    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                accepted = listener.accept() => {
                    if let Ok((stream, _)) = accepted {
                        held.push(stream);
                    }
                }
            }
        }
    });

    (format!("ws://{}/exec_task_set", addr), token)
}
