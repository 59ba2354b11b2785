//! The seam between a [`DispatchSession`](crate::DispatchSession) and the
//! socket underneath it.
//!
//! A connector hands back a pair of channels immediately; the connection
//! itself is driven by a background task that reports progress as
//! [`InboundEvent`]s. Dropping the outbound sender asks the task to close
//! the connection.

use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;

use execflow_core::error::TransportError;

/// Capacity of the inbound channel handed to a session.
pub const INBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// The connection is established and can carry the task set.
    Ready,
    /// One text event from the agent.
    Text(String),
    /// The agent closed the connection cleanly.
    Closed,
    /// The connection failed. No further events follow.
    Error(TransportError),
}

pub struct StreamConnection {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<InboundEvent>,
}

/// Opens streaming connections to an agent endpoint.
pub trait StreamConnector: Send + Sync {
    fn connect(&self, endpoint: &str) -> StreamConnection;
}

/// Connector backed by in-process channels.
///
/// The paired [`MemoryPeer`] plays the agent: it sees what the session sends
/// and decides what the session receives. A connector serves one connection;
/// later attempts fail with [`TransportError::ConnectFailed`].
pub struct MemoryConnector {
    pending: Mutex<Option<StreamConnection>>,
}

pub struct MemoryPeer {
    sent: mpsc::Receiver<String>,
    inbound: mpsc::Sender<InboundEvent>,
}

impl MemoryConnector {
    pub fn pair() -> (Self, MemoryPeer) {
        let (out_tx, out_rx) = mpsc::channel(16);
        let (in_tx, in_rx) = mpsc::channel(INBOUND_CAPACITY);
        let connector = Self {
            pending: Mutex::new(Some(StreamConnection {
                outbound: out_tx,
                inbound: in_rx,
            })),
        };
        let peer = MemoryPeer {
            sent: out_rx,
            inbound: in_tx,
        };
        (connector, peer)
    }
}

impl StreamConnector for MemoryConnector {
    fn connect(&self, endpoint: &str) -> StreamConnection {
        let taken = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match taken {
            Some(conn) => conn,
            None => {
                let (outbound, _) = mpsc::channel(1);
                let (in_tx, inbound) = mpsc::channel(1);
                let _ = in_tx.try_send(InboundEvent::Error(TransportError::ConnectFailed {
                    endpoint: endpoint.to_string(),
                    message: "connector already used".to_string(),
                }));
                StreamConnection { outbound, inbound }
            }
        }
    }
}

impl MemoryPeer {
    pub async fn ready(&self) {
        self.push(InboundEvent::Ready).await;
    }

    pub async fn text(&self, content: impl Into<String>) {
        self.push(InboundEvent::Text(content.into())).await;
    }

    pub async fn close(&self) {
        self.push(InboundEvent::Closed).await;
    }

    pub async fn fail(&self, error: TransportError) {
        self.push(InboundEvent::Error(error)).await;
    }

    /// Next payload the session sent, or `None` once the session hung up.
    pub async fn recv_sent(&mut self) -> Option<String> {
        self.sent.recv().await
    }

    async fn push(&self, event: InboundEvent) {
        // The session may already be gone; nothing to deliver to then.
        let _ = self.inbound.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pair_carries_both_directions() {
        let (connector, mut peer) = MemoryConnector::pair();
        let mut conn = connector.connect("mem://agent");

        peer.ready().await;
        peer.text("hello").await;
        assert_eq!(conn.inbound.recv().await, Some(InboundEvent::Ready));
        assert_eq!(
            conn.inbound.recv().await,
            Some(InboundEvent::Text("hello".into()))
        );

        conn.outbound.send("payload".into()).await.unwrap();
        assert_eq!(peer.recv_sent().await.as_deref(), Some("payload"));

        drop(conn);
        assert_eq!(peer.recv_sent().await, None);
    }

    #[tokio::test]
    async fn test_memory_connector_is_single_use() {
        let (connector, _peer) = MemoryConnector::pair();
        let _first = connector.connect("mem://agent");
        let mut second = connector.connect("mem://agent");
        assert!(matches!(
            second.inbound.recv().await,
            Some(InboundEvent::Error(TransportError::ConnectFailed { .. }))
        ));
    }
}
