//! Compile, seal, dispatch.

use std::sync::Arc;

use tracing::info;

use execflow_compiler::{CompileOptions, CompiledTaskSet, Compiler};
use execflow_core::config::{AppConfig, KEY_ENV_VAR};
use execflow_core::error::{CryptoError, ExecflowError, Result};
use execflow_core::event::EventBus;
use execflow_core::graph::GraphSnapshot;
use execflow_core::types::{LogEntry, NodeId, SessionId};
use execflow_crypto::{encrypt, Envelope, SharedKey};

use crate::session::{DispatchSession, SessionOptions};
use crate::single_shot::{AgentResponse, SingleShotClient};
use crate::transport::StreamConnector;

/// A compiled task set sealed for one dispatch.
#[derive(Debug, Clone)]
pub struct PreparedTaskSet {
    pub compiled: CompiledTaskSet,
    pub envelope: Envelope,
}

/// What a finished streaming dispatch produced.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub session_id: SessionId,
    pub order: Vec<NodeId>,
    pub entries: Vec<LogEntry>,
}

pub struct Dispatcher {
    compiler: Compiler,
    key: SharedKey,
    associated_data: Vec<u8>,
    session_options: SessionOptions,
    events: Arc<EventBus>,
}

impl Dispatcher {
    pub fn new(compiler: Compiler, key: SharedKey) -> Self {
        Self {
            compiler,
            key,
            associated_data: Vec::new(),
            session_options: SessionOptions::default(),
            events: Arc::new(EventBus::default()),
        }
    }

    /// Build from config. The key comes from `[crypto] key` or the key
    /// environment variable.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let encoded = config.crypto.resolve_key().ok_or_else(|| {
            ExecflowError::Config(format!(
                "no key configured: set [crypto] key or {}",
                KEY_ENV_VAR
            ))
        })?;
        let key = SharedKey::from_base64(&encoded)?;

        Ok(Self {
            compiler: Compiler::new(CompileOptions::from(&config.compiler)),
            key,
            associated_data: config.crypto.associated_data.as_bytes().to_vec(),
            session_options: SessionOptions::from_config(config),
            events: Arc::new(EventBus::new(config.session.event_capacity.max(1))),
        })
    }

    pub fn with_associated_data(mut self, associated_data: impl Into<Vec<u8>>) -> Self {
        self.associated_data = associated_data.into();
        self
    }

    pub fn with_session_options(mut self, options: SessionOptions) -> Self {
        self.session_options = options;
        self
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    pub fn key(&self) -> &SharedKey {
        &self.key
    }

    pub fn seal(&self, plaintext: &str) -> std::result::Result<Envelope, CryptoError> {
        encrypt(&self.key, plaintext.as_bytes(), &self.associated_data)
    }

    pub fn prepare(&self, snapshot: &GraphSnapshot) -> Result<PreparedTaskSet> {
        let compiled = self.compiler.compile(snapshot)?;
        let envelope = self.seal(&compiled.document.to_json()?)?;
        Ok(PreparedTaskSet { compiled, envelope })
    }

    /// A fresh session wired to this dispatcher's options and event bus.
    pub fn session(&self, endpoint: impl Into<String>) -> DispatchSession {
        DispatchSession::new(endpoint, self.session_options.clone()).with_event_bus(self.events())
    }

    /// Open `session`, send the task set, and record events until the agent
    /// closes the stream.
    ///
    /// On failure the entries received so far stay in `session.log()`.
    pub async fn stream(
        &self,
        session: &mut DispatchSession,
        prepared: &PreparedTaskSet,
        connector: &dyn StreamConnector,
    ) -> Result<DispatchReport> {
        session.open(connector).await?;
        session.send(&prepared.envelope).await?;
        let received = session.run_until_closed().await?;

        info!(session = %session.id(), received, "Dispatch finished");
        Ok(DispatchReport {
            session_id: session.id().clone(),
            order: prepared.compiled.order.clone(),
            entries: session.log().snapshot(),
        })
    }

    /// Seal `plaintext` and send it as one single-shot request.
    pub async fn exec(&self, client: &SingleShotClient, plaintext: &str) -> Result<AgentResponse> {
        let envelope = self.seal(plaintext)?;
        Ok(client.dispatch(&envelope).await?)
    }
}
