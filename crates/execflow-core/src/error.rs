use thiserror::Error;

use crate::types::{Edge, NodeId, SessionState};

/// Rejected edits to a [`GraphModel`](crate::graph::GraphModel).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("Node already exists: {0}")]
    DuplicateNode(NodeId),

    #[error("Node not found: {0}")]
    UnknownNode(NodeId),

    #[error("Self-loop on node {0} is not allowed")]
    SelfLoop(NodeId),
}

/// Reasons a graph snapshot cannot be compiled into a task-set document.
///
/// All of these are recoverable: the caller fixes the graph and compiles again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("Edge {0} references a node that does not exist")]
    DanglingEdge(Edge),

    #[error("Cycle detected: {}", format_path(.0))]
    CycleDetected(Vec<NodeId>),

    #[error("Graph has no nodes")]
    EmptyGraph,

    #[error("Duplicate edge {0}")]
    DuplicateEdge(Edge),

    #[error("Node id {0} is used by more than one node")]
    DuplicateNodeId(NodeId),

    #[error("Graph is {depth} levels deep, limit is {limit}")]
    TooDeep { depth: usize, limit: usize },
}

fn format_path(path: &[NodeId]) -> String {
    path.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Key import and envelope failures. Never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("Key import failed: {0}")]
    KeyImportFailure(String),

    #[error("Authentication tag mismatch")]
    TagMismatch,

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Encryption failed")]
    EncryptFailure,

    #[error("Decrypted payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Transport failures for both single-shot and streaming dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection to {endpoint} failed: {message}")]
    ConnectFailed { endpoint: String, message: String },

    #[error("Connection not ready after {0}s")]
    ConnectTimeout(u64),

    #[error("Connection closed unexpectedly: {0}")]
    UnexpectedClose(String),

    #[error("Agent returned HTTP {status}: {body}")]
    NonSuccessStatus { status: u16, body: String },

    #[error("Malformed response body: {0}")]
    MalformedResponse(String),

    #[error("Operation not valid while session is {0}")]
    InvalidState(SessionState),

    #[error("Task set already sent on this session")]
    AlreadySent,
}

#[derive(Debug, Error)]
pub enum ExecflowError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ExecflowError>;
