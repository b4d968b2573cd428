use std::time::Duration;

/// Control-channel failure.
#[derive(Debug, thiserror::Error)]
pub enum QmpError {
    /// TCP connect failed.
    #[error("failed to connect to QMP at {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// An operation did not finish in time. The session is torn down.
    #[error("QMP {op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    /// Peer broke the protocol (bad greeting, malformed or uncorrelated
    /// reply, command before negotiation). The session is torn down.
    #[error("QMP protocol violation: {0}")]
    ProtocolViolation(String),

    /// The hypervisor rejected a command. The session stays usable.
    #[error("QMP command '{command}' failed ({class}): {desc}")]
    Command {
        command: String,
        class: String,
        desc: String,
    },

    /// Peer closed the connection.
    #[error("QMP connection closed by peer")]
    Closed,

    /// No open session.
    #[error("QMP session is not connected")]
    NotConnected,

    #[error("QMP I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("QMP serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QmpError {
    /// Whether the session survives this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, QmpError::Command { .. })
    }
}

pub type QmpResult<T> = Result<T, QmpError>;
