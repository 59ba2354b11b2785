use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use execflow_core::error::TransportError;

use crate::transport::{InboundEvent, StreamConnection, StreamConnector, INBOUND_CAPACITY};

/// WebSocket connector. Each connection runs on its own tokio task.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

impl StreamConnector for WsConnector {
    fn connect(&self, endpoint: &str) -> StreamConnection {
        let (out_tx, out_rx) = mpsc::channel::<String>(16);
        let (in_tx, in_rx) = mpsc::channel::<InboundEvent>(INBOUND_CAPACITY);

        tokio::spawn(run_socket(endpoint.to_string(), out_rx, in_tx));

        StreamConnection {
            outbound: out_tx,
            inbound: in_rx,
        }
    }
}

async fn run_socket(
    endpoint: String,
    mut out_rx: mpsc::Receiver<String>,
    in_tx: mpsc::Sender<InboundEvent>,
) {
    let ws_stream = match tokio_tungstenite::connect_async(&endpoint).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            warn!(endpoint = %endpoint, error = %e, "Failed to connect agent WebSocket");
            let _ = in_tx
                .send(InboundEvent::Error(TransportError::ConnectFailed {
                    endpoint,
                    message: e.to_string(),
                }))
                .await;
            return;
        }
    };

    info!(endpoint = %endpoint, "Agent WebSocket connected");
    if in_tx.send(InboundEvent::Ready).await.is_err() {
        // Session gave up while the handshake was in flight.
        return;
    }

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let mut outbound_open = true;

    loop {
        tokio::select! {
            out = out_rx.recv(), if outbound_open => match out {
                Some(text) => {
                    if let Err(e) = ws_tx.send(WsMessage::Text(text.into())).await {
                        warn!(error = %e, "Failed to send on agent WebSocket");
                        let _ = in_tx
                            .send(InboundEvent::Error(TransportError::UnexpectedClose(e.to_string())))
                            .await;
                        return;
                    }
                }
                None => {
                    debug!("Session hung up, closing agent WebSocket");
                    outbound_open = false;
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                }
            },
            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        warn!(error = %e, "Agent WebSocket error");
                        let _ = in_tx
                            .send(InboundEvent::Error(TransportError::UnexpectedClose(e.to_string())))
                            .await;
                        return;
                    }
                    None => {
                        let event = if outbound_open {
                            InboundEvent::Error(TransportError::UnexpectedClose(
                                "stream ended without a close frame".to_string(),
                            ))
                        } else {
                            InboundEvent::Closed
                        };
                        let _ = in_tx.send(event).await;
                        return;
                    }
                };

                let text = match msg {
                    WsMessage::Text(t) => t.to_string(),
                    WsMessage::Binary(b) => {
                        debug!(len = b.len(), "Ignoring binary frame from agent");
                        continue;
                    }
                    WsMessage::Ping(data) => {
                        let _ = ws_tx.send(WsMessage::Pong(data)).await;
                        continue;
                    }
                    WsMessage::Close(_) => {
                        debug!("Agent WebSocket close frame");
                        let _ = ws_tx.close().await;
                        let _ = in_tx.send(InboundEvent::Closed).await;
                        return;
                    }
                    _ => continue,
                };

                if in_tx.send(InboundEvent::Text(text)).await.is_err() {
                    return;
                }
            }
        }
    }
}
