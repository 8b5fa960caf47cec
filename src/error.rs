//! Error kinds raised by the bridge.
//!
//! Each variant maps to one failure class with its own propagation rule:
//! transport failures poison the session, protocol and timeout failures only
//! fail the request that hit them, validation failures never reach the child,
//! and tool execution failures are handed back to the model as text.

use thiserror::Error;

/// Result alias used across the bridge modules.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors produced by the transport, protocol client, translator and loop.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The child process could not be launched.
    #[error("failed to spawn tool server '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The pipe to the child is closed or the child exited.
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame could not be parsed or did not match the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No response arrived before the request deadline.
    #[error("request '{method}' timed out after {timeout_ms} ms")]
    Timeout { method: String, timeout_ms: u64 },

    /// Caller-supplied arguments violate the tool's descriptor.
    #[error("invalid arguments for '{tool}': {message}")]
    Validation { tool: String, message: String },

    /// The remote side reported a handler-level failure.
    #[error("tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    /// The model collaborator itself failed.
    #[error("model call failed: {0}")]
    Model(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The session was used outside its lifecycle (not started, already started).
    #[error("invalid session state: {0}")]
    State(String),
}

impl BridgeError {
    /// Whether this error ends the current turn instead of becoming tool-result text.
    pub fn is_fatal_to_turn(&self) -> bool {
        matches!(
            self,
            BridgeError::Transport(_)
                | BridgeError::Protocol(_)
                | BridgeError::State(_)
                | BridgeError::Model(_)
                | BridgeError::Spawn { .. }
        )
    }

    /// Whether the session can no longer be used after this error.
    pub fn poisons_session(&self) -> bool {
        matches!(self, BridgeError::Transport(_) | BridgeError::Spawn { .. })
    }

    /// Wrap an `anyhow` error coming back from the model collaborator.
    pub fn model(err: anyhow::Error) -> Self {
        BridgeError::Model(err.into())
    }
}
