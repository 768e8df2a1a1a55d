//! Error types for the streaming subsystem

use thiserror::Error;

use crate::streaming::node::{NodeId, NodeStatus};

/// Main error type for the crate
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to load points for node {node}: {reason}")]
    Load { node: NodeId, reason: String },

    #[error("Failed to materialize node {node}: {reason}")]
    Materialize { node: NodeId, reason: String },

    #[error("Illegal transition on node {node}: {from:?} -> {to:?}")]
    IllegalTransition {
        node: NodeId,
        from: NodeStatus,
        to: NodeStatus,
    },

    #[error("Invariant violation on node {node} ({status:?}): {context}")]
    InvariantViolation {
        node: NodeId,
        status: NodeStatus,
        context: &'static str,
    },

    #[error("Ledger mismatch: hierarchy holds {expected} resident points, ledger holds {actual}")]
    LedgerMismatch { expected: u64, actual: u64 },

    #[error("Streamer has been shut down")]
    ShutDown,

    #[error("Invalid root name {0:?}")]
    InvalidRootName(String),

    #[error("A root with id {0} is already registered")]
    DuplicateRoot(NodeId),

    #[error("Loader already started")]
    LoaderAlreadyStarted,

    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Decode error: {0}")]
    Decode(String),
}
