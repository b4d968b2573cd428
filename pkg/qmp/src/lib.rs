//! QMP (QEMU Machine Protocol) control-channel client.
//!
//! Line-delimited JSON over TCP. The server greets first, the client must
//! send `qmp_capabilities` before any other command, and every command is
//! answered by exactly one `return` or `error` object. Asynchronous `event`
//! objects can arrive at any time and are buffered.

pub mod client;
pub mod error;
pub mod protocol;

pub use client::{QmpClient, QmpTimeouts, SessionState};
pub use error::{QmpError, QmpResult};
pub use protocol::{Greeting, VmRunState};
