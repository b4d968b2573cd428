//! Error taxonomy shared across backends.
//!
//! Operations return `anyhow::Result`; these typed errors travel inside
//! `anyhow::Error` and callers recover them with `downcast_ref`.

use std::path::PathBuf;

use crate::port::Protocol;

/// Failures raised by runtime backends.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Required host tooling or firmware is absent.
    #[error("prerequisite missing: {item}")]
    PrerequisiteMissing { item: String },

    /// Spawning or signalling the backend process failed.
    #[error("{action} failed: {source}")]
    ProcessLifecycle {
        action: String,
        #[source]
        source: std::io::Error,
    },

    /// Descriptor file is absent or unreadable.
    #[error("descriptor {path}: {reason}")]
    Descriptor { path: PathBuf, reason: String },

    /// Backend tool did not answer in time.
    #[error("{tool} timed out after {secs}s")]
    ToolTimeout { tool: String, secs: u64 },
}

impl RuntimeError {
    pub fn missing(item: impl Into<String>) -> Self {
        RuntimeError::PrerequisiteMissing { item: item.into() }
    }
}

/// A requested host port is already taken.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("host port {port}/{protocol} on {address} is not available")]
pub struct PortConflict {
    pub address: String,
    pub port: u16,
    pub protocol: Protocol,
}

/// A port token or long-form entry could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid port mapping '{input}': {reason}")]
pub struct PortParseError {
    pub input: String,
    pub reason: String,
}

impl PortParseError {
    pub fn new(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            reason: reason.into(),
        }
    }
}
