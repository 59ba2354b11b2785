//! Dispatch of compiled, encrypted task sets to the remote execution agent.
//!
//! Two modes share the same envelope format:
//! - single-shot: one HTTP POST, one response ([`SingleShotClient`]);
//! - streaming: one websocket session that sends the task set once and
//!   records every inbound text event in a [`MessageLog`] ([`DispatchSession`]).

pub mod log;
pub mod pipeline;
pub mod session;
pub mod single_shot;
pub mod transport;
pub mod ws;

pub use log::MessageLog;
pub use pipeline::{DispatchReport, Dispatcher, PreparedTaskSet};
pub use session::{DispatchSession, SessionOptions};
pub use single_shot::{AgentResponse, SingleShotClient};
pub use transport::{InboundEvent, MemoryConnector, MemoryPeer, StreamConnection, StreamConnector};
pub use ws::WsConnector;
