//! Streaming dispatch session.
//!
//! Lifecycle: `Idle -> Connecting -> Open -> Closing -> Closed`. A failure
//! at any point moves straight to `Closed`. The task set is sent exactly
//! once, and only while `Open`. Inbound text events are appended to the
//! session's [`MessageLog`] only while `Open` or `Closing`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use execflow_core::config::AppConfig;
use execflow_core::error::TransportError;
use execflow_core::event::{EventBus, SessionEvent};
use execflow_core::types::{LogEntry, SessionId, SessionState};
use execflow_crypto::Envelope;

use crate::log::MessageLog;
use crate::transport::{InboundEvent, StreamConnector};

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Fail `open` if the connection is not ready within this window.
    pub connect_timeout: Option<Duration>,
}

impl SessionOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            connect_timeout: config.agent.connect_timeout_secs.map(Duration::from_secs),
        }
    }
}

pub struct DispatchSession {
    id: SessionId,
    endpoint: String,
    state: SessionState,
    log: MessageLog,
    events: Option<Arc<EventBus>>,
    outbound: Option<mpsc::Sender<String>>,
    inbound: Option<mpsc::Receiver<InboundEvent>>,
    sent: bool,
    options: SessionOptions,
    cancel: CancellationToken,
}

enum Next {
    Cancelled,
    Event(Option<InboundEvent>),
}

impl DispatchSession {
    pub fn new(endpoint: impl Into<String>, options: SessionOptions) -> Self {
        Self {
            id: SessionId::new(),
            endpoint: endpoint.into(),
            state: SessionState::Idle,
            log: MessageLog::new(),
            events: None,
            outbound: None,
            inbound: None,
            sent: false,
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Publish state changes and received messages on `bus`.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// A read handle on this session's log.
    pub fn log(&self) -> MessageLog {
        self.log.clone()
    }

    /// Cancelling this token aborts the session from any task.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Connect to the endpoint. Valid only from `Idle`.
    pub async fn open(&mut self, connector: &dyn StreamConnector) -> Result<(), TransportError> {
        if self.state != SessionState::Idle {
            return Err(TransportError::InvalidState(self.state));
        }

        self.transition(SessionState::Connecting);
        let conn = connector.connect(&self.endpoint);
        self.outbound = Some(conn.outbound);
        let mut inbound = conn.inbound;

        let cancel = self.cancel.clone();
        let endpoint = self.endpoint.clone();
        let wait = async {
            loop {
                match inbound.recv().await {
                    Some(InboundEvent::Ready) => return Ok(()),
                    Some(InboundEvent::Error(e)) => return Err(e),
                    Some(InboundEvent::Text(_)) => {
                        debug!("Dropping event received before the session opened");
                    }
                    Some(InboundEvent::Closed) | None => {
                        return Err(TransportError::ConnectFailed {
                            endpoint: endpoint.clone(),
                            message: "closed before ready".to_string(),
                        })
                    }
                }
            }
        };
        let guarded = async {
            tokio::select! {
                _ = cancel.cancelled() => Err(TransportError::ConnectFailed {
                    endpoint: endpoint.clone(),
                    message: "cancelled".to_string(),
                }),
                result = wait => result,
            }
        };

        let outcome = match self.options.connect_timeout {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::ConnectTimeout(limit.as_secs())),
            },
            None => guarded.await,
        };

        match outcome {
            Ok(()) => {
                self.inbound = Some(inbound);
                info!(session = %self.id, endpoint = %self.endpoint, "Session open");
                self.transition(SessionState::Open);
                Ok(())
            }
            Err(e) => {
                warn!(session = %self.id, error = %e, "Session failed to open");
                self.fail(&e);
                Err(e)
            }
        }
    }

    /// Send the task set. Valid once, and only while `Open`.
    pub async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        if self.state != SessionState::Open {
            return Err(TransportError::InvalidState(self.state));
        }
        if self.sent {
            return Err(TransportError::AlreadySent);
        }
        let Some(outbound) = self.outbound.as_ref() else {
            return Err(TransportError::InvalidState(self.state));
        };

        let payload = envelope.to_json();
        let len = payload.len();
        if outbound.send(payload).await.is_err() {
            let e = TransportError::UnexpectedClose("transport task ended".to_string());
            self.fail(&e);
            return Err(e);
        }
        self.sent = true;
        info!(session = %self.id, bytes = len, "Task set sent");
        Ok(())
    }

    /// Wait for the next inbound text event and record it.
    ///
    /// Returns `Ok(None)` once the session is `Closed`.
    pub async fn receive(&mut self) -> Result<Option<LogEntry>, TransportError> {
        let cancel = self.cancel.clone();
        loop {
            if self.state == SessionState::Closed {
                return Ok(None);
            }
            let next = {
                let Some(inbound) = self.inbound.as_mut() else {
                    return Ok(None);
                };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Next::Cancelled,
                    event = inbound.recv() => Next::Event(event),
                }
            };

            match next {
                Next::Cancelled => {
                    info!(session = %self.id, "Session cancelled");
                    self.teardown();
                    return Ok(None);
                }
                Next::Event(Some(InboundEvent::Text(raw))) => {
                    if !self.state.accepts_events() {
                        debug!(session = %self.id, state = %self.state, "Dropping event");
                        continue;
                    }
                    let entry = self.log.append(raw);
                    self.publish(SessionEvent::Message {
                        session_id: self.id.clone(),
                        entry: entry.clone(),
                    });
                    return Ok(Some(entry));
                }
                Next::Event(Some(InboundEvent::Ready)) => continue,
                Next::Event(Some(InboundEvent::Closed)) | Next::Event(None) => {
                    debug!(session = %self.id, entries = self.log.len(), "Agent closed the stream");
                    self.teardown();
                    return Ok(None);
                }
                Next::Event(Some(InboundEvent::Error(e))) => {
                    warn!(session = %self.id, error = %e, "Stream failed");
                    self.fail(&e);
                    return Err(e);
                }
            }
        }
    }

    /// Receive until the agent closes the stream. Returns the number of
    /// entries appended by this call.
    pub async fn run_until_closed(&mut self) -> Result<usize, TransportError> {
        let mut received = 0;
        while self.receive().await?.is_some() {
            received += 1;
        }
        Ok(received)
    }

    /// Begin closing. From `Open` the session waits in `Closing` for the
    /// agent to finish; before that it closes immediately.
    pub fn close(&mut self) {
        match self.state {
            SessionState::Open => {
                self.outbound = None;
                self.transition(SessionState::Closing);
            }
            SessionState::Idle | SessionState::Connecting => self.teardown(),
            SessionState::Closing | SessionState::Closed => {}
        }
    }

    fn teardown(&mut self) {
        self.outbound = None;
        self.inbound = None;
        if self.state != SessionState::Closed {
            self.transition(SessionState::Closed);
        }
    }

    fn fail(&mut self, error: &TransportError) {
        self.publish(SessionEvent::Error {
            session_id: self.id.clone(),
            error: error.to_string(),
        });
        self.teardown();
    }

    fn transition(&mut self, to: SessionState) {
        let from = self.state;
        self.state = to;
        debug!(session = %self.id, %from, %to, "Session state changed");
        self.publish(SessionEvent::StateChanged {
            session_id: self.id.clone(),
            from,
            to,
        });
    }

    fn publish(&self, event: SessionEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryConnector;
    use execflow_crypto::{encrypt, SharedKey};

    fn envelope() -> Envelope {
        let key = SharedKey::from_bytes(&[1u8; 32]).unwrap();
        encrypt(&key, b"{\"task_set_nodes\":[]}", b"").unwrap()
    }

    fn session() -> DispatchSession {
        DispatchSession::new("mem://agent", SessionOptions::default())
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let (connector, mut peer) = MemoryConnector::pair();
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let mut s = session().with_event_bus(bus);
        assert_eq!(s.state(), SessionState::Idle);

        peer.ready().await;
        s.open(&connector).await.unwrap();
        assert_eq!(s.state(), SessionState::Open);

        let env = envelope();
        s.send(&env).await.unwrap();
        assert_eq!(peer.recv_sent().await, Some(env.to_json()));

        peer.text("line1").await;
        peer.text("line2").await;
        peer.close().await;

        assert_eq!(s.receive().await.unwrap().unwrap().raw_content, "line1");
        assert_eq!(s.receive().await.unwrap().unwrap().raw_content, "line2");
        assert!(s.receive().await.unwrap().is_none());
        assert_eq!(s.state(), SessionState::Closed);

        let mut states = Vec::new();
        let mut messages = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                SessionEvent::StateChanged { to, .. } => states.push(to),
                SessionEvent::Message { .. } => messages += 1,
                SessionEvent::Error { .. } => panic!("unexpected error event"),
            }
        }
        assert_eq!(
            states,
            vec![SessionState::Connecting, SessionState::Open, SessionState::Closed]
        );
        assert_eq!(messages, 2);
    }

    #[tokio::test]
    async fn test_send_before_open_is_invalid() {
        let mut s = session();
        let err = s.send(&envelope()).await.unwrap_err();
        assert_eq!(err, TransportError::InvalidState(SessionState::Idle));
        assert_eq!(s.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_second_send_rejected() {
        let (connector, peer) = MemoryConnector::pair();
        let mut s = session();
        peer.ready().await;
        s.open(&connector).await.unwrap();

        s.send(&envelope()).await.unwrap();
        assert_eq!(s.send(&envelope()).await, Err(TransportError::AlreadySent));
        assert_eq!(s.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn test_open_twice_is_invalid() {
        let (connector, peer) = MemoryConnector::pair();
        let mut s = session();
        peer.ready().await;
        s.open(&connector).await.unwrap();
        assert_eq!(
            s.open(&connector).await,
            Err(TransportError::InvalidState(SessionState::Open))
        );
    }

    #[tokio::test]
    async fn test_connect_error_closes_session() {
        let (connector, peer) = MemoryConnector::pair();
        let mut s = session();
        peer.fail(TransportError::ConnectFailed {
            endpoint: "mem://agent".into(),
            message: "refused".into(),
        })
        .await;

        let err = s.open(&connector).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectFailed { .. }));
        assert_eq!(s.state(), SessionState::Closed);
        assert!(s.log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let (connector, _peer) = MemoryConnector::pair();
        let mut s = DispatchSession::new(
            "mem://agent",
            SessionOptions {
                connect_timeout: Some(Duration::from_secs(5)),
            },
        );
        assert_eq!(
            s.open(&connector).await,
            Err(TransportError::ConnectTimeout(5))
        );
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_events_before_ready_are_dropped() {
        let (connector, peer) = MemoryConnector::pair();
        let mut s = session();
        peer.text("too early").await;
        peer.ready().await;
        peer.text("on time").await;
        peer.close().await;

        s.open(&connector).await.unwrap();
        s.send(&envelope()).await.unwrap();
        assert_eq!(s.run_until_closed().await.unwrap(), 1);
        let entries = s.log().snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].raw_content, "on time");
    }

    #[tokio::test]
    async fn test_close_from_open_drains_in_closing() {
        let (connector, mut peer) = MemoryConnector::pair();
        let mut s = session();
        peer.ready().await;
        s.open(&connector).await.unwrap();
        s.send(&envelope()).await.unwrap();
        assert!(peer.recv_sent().await.is_some());

        s.close();
        assert_eq!(s.state(), SessionState::Closing);
        // The agent sees the hang-up.
        assert_eq!(peer.recv_sent().await, None);

        // Events still in flight are recorded while Closing.
        peer.text("late line").await;
        peer.close().await;
        assert_eq!(s.receive().await.unwrap().unwrap().raw_content, "late line");
        assert!(s.receive().await.unwrap().is_none());
        assert_eq!(s.state(), SessionState::Closed);
        assert_eq!(s.log().len(), 1);
    }

    #[tokio::test]
    async fn test_send_while_closing_is_invalid() {
        let (connector, peer) = MemoryConnector::pair();
        let mut s = session();
        peer.ready().await;
        s.open(&connector).await.unwrap();
        s.close();
        assert_eq!(
            s.send(&envelope()).await,
            Err(TransportError::InvalidState(SessionState::Closing))
        );
    }

    #[tokio::test]
    async fn test_cancel_stops_receiving() {
        let (connector, peer) = MemoryConnector::pair();
        let mut s = session();
        peer.ready().await;
        s.open(&connector).await.unwrap();
        s.send(&envelope()).await.unwrap();

        s.cancel_token().cancel();
        peer.text("after cancel").await;
        assert!(s.receive().await.unwrap().is_none());
        assert_eq!(s.state(), SessionState::Closed);
        assert!(s.log().is_empty());
    }

    #[tokio::test]
    async fn test_stream_error_after_open() {
        let (connector, peer) = MemoryConnector::pair();
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let mut s = session().with_event_bus(bus);
        peer.ready().await;
        s.open(&connector).await.unwrap();
        s.send(&envelope()).await.unwrap();

        peer.text("partial").await;
        peer.fail(TransportError::UnexpectedClose("reset".into())).await;

        assert!(s.receive().await.unwrap().is_some());
        assert_eq!(
            s.receive().await,
            Err(TransportError::UnexpectedClose("reset".into()))
        );
        assert_eq!(s.state(), SessionState::Closed);
        // Entries received before the failure are kept.
        assert_eq!(s.log().len(), 1);

        let mut saw_error = false;
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::Error { error, .. } = event {
                assert!(error.contains("reset"));
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_close_before_open() {
        let mut s = session();
        s.close();
        assert_eq!(s.state(), SessionState::Closed);
        assert!(s.receive().await.unwrap().is_none());
    }
}
