pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod types;

pub use config::AppConfig;
pub use error::{CompileError, CryptoError, ExecflowError, GraphError, Result, TransportError};
pub use event::EventBus;
pub use graph::{GraphModel, GraphSnapshot};
pub use types::*;
