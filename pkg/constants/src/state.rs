//! Configuration schema and supervisor timing constants.

/// Current persisted configuration schema version.
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

/// Supervisor poll interval, in milliseconds.
pub const SUPERVISOR_POLL_INTERVAL_MS: u64 = 1000;

/// QMP TCP connect timeout, in milliseconds.
pub const QMP_CONNECT_TIMEOUT_MS: u64 = 2000;

/// QMP greeting / capability handshake timeout, in milliseconds.
pub const QMP_HANDSHAKE_TIMEOUT_MS: u64 = 3000;

/// QMP per-command response timeout, in milliseconds.
pub const QMP_COMMAND_TIMEOUT_MS: u64 = 5000;

/// QMP liveness probe timeout, in milliseconds.
pub const QMP_LIVENESS_TIMEOUT_MS: u64 = 1000;

/// Maximum buffered asynchronous QMP events.
pub const QMP_EVENT_BUFFER: usize = 64;

/// Guest API request timeout, in milliseconds.
pub const GUEST_HTTP_TIMEOUT_MS: u64 = 3000;

/// Host port availability probe timeout, in milliseconds.
pub const PORT_PROBE_TIMEOUT_MS: u64 = 500;
