use std::collections::VecDeque;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use pkg_constants::state::{
    QMP_COMMAND_TIMEOUT_MS, QMP_CONNECT_TIMEOUT_MS, QMP_EVENT_BUFFER, QMP_HANDSHAKE_TIMEOUT_MS,
    QMP_LIVENESS_TIMEOUT_MS,
};

use crate::error::{QmpError, QmpResult};
use crate::protocol::{Command, Greeting, Reply, VmRunState};

const CAPABILITIES: &str = "qmp_capabilities";

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Negotiating,
    Ready,
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Negotiating => write!(f, "negotiating"),
            SessionState::Ready => write!(f, "ready"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

/// Timeouts applied to each stage of a session.
#[derive(Debug, Clone, Copy)]
pub struct QmpTimeouts {
    pub connect: Duration,
    pub handshake: Duration,
    pub command: Duration,
    pub liveness: Duration,
}

impl Default for QmpTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(QMP_CONNECT_TIMEOUT_MS),
            handshake: Duration::from_millis(QMP_HANDSHAKE_TIMEOUT_MS),
            command: Duration::from_millis(QMP_COMMAND_TIMEOUT_MS),
            liveness: Duration::from_millis(QMP_LIVENESS_TIMEOUT_MS),
        }
    }
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

struct Inner {
    conn: Option<Connection>,
    state: SessionState,
    next_id: u64,
    greeting: Option<Greeting>,
    events: VecDeque<Value>,
}

impl Inner {
    fn teardown(&mut self, state: SessionState) {
        self.conn = None;
        self.state = state;
    }
}

/// QMP client owning at most one TCP session.
///
/// All traffic goes through one async mutex held across write and read, so
/// concurrent callers are serialized and each gets its own reply.
pub struct QmpClient {
    inner: Mutex<Inner>,
    timeouts: QmpTimeouts,
}

impl Default for QmpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl QmpClient {
    pub fn new() -> Self {
        Self::with_timeouts(QmpTimeouts::default())
    }

    pub fn with_timeouts(timeouts: QmpTimeouts) -> Self {
        Self {
            inner: Mutex::new(Inner {
                conn: None,
                state: SessionState::Disconnected,
                next_id: 1,
                greeting: None,
                events: VecDeque::new(),
            }),
            timeouts,
        }
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub async fn greeting(&self) -> Option<Greeting> {
        self.inner.lock().await.greeting.clone()
    }

    /// Take every buffered asynchronous event.
    pub async fn drain_events(&self) -> Vec<Value> {
        self.inner.lock().await.events.drain(..).collect()
    }

    /// Open the socket and read the greeting. Leaves the session in
    /// `Negotiating`; call [`negotiate`](Self::negotiate) next.
    pub async fn connect(&self, host: &str, port: u16) -> QmpResult<Greeting> {
        let mut inner = self.inner.lock().await;
        inner.teardown(SessionState::Connecting);
        let addr = format!("{}:{}", host, port);
        debug!("[qmp] connecting to {}", addr);

        let stream = match timeout(self.timeouts.connect, TcpStream::connect((host, port))).await {
            Ok(Ok(s)) => s,
            Ok(Err(source)) => {
                inner.teardown(SessionState::Failed);
                return Err(QmpError::ConnectionFailed { addr, source });
            }
            Err(_) => {
                inner.teardown(SessionState::Failed);
                return Err(QmpError::Timeout {
                    op: "connect",
                    after: self.timeouts.connect,
                });
            }
        };
        let _ = stream.set_nodelay(true);
        let (read, writer) = stream.into_split();
        let mut reader = BufReader::new(read);

        let mut line = String::new();
        let greeting = match timeout(self.timeouts.handshake, reader.read_line(&mut line)).await {
            Ok(Ok(0)) => Err(QmpError::Closed),
            Ok(Ok(_)) => Greeting::from_line(&line).ok_or_else(|| {
                QmpError::ProtocolViolation(format!("expected greeting, got: {}", line.trim()))
            }),
            Ok(Err(e)) => Err(QmpError::Io(e)),
            Err(_) => Err(QmpError::Timeout {
                op: "greeting",
                after: self.timeouts.handshake,
            }),
        };

        match greeting {
            Ok(g) => {
                inner.conn = Some(Connection { reader, writer });
                inner.state = SessionState::Negotiating;
                inner.greeting = Some(g.clone());
                info!(
                    "[qmp] connected to {} (qemu {})",
                    addr,
                    g.qemu_version().unwrap_or_else(|| "unknown".to_string())
                );
                Ok(g)
            }
            Err(e) => {
                inner.teardown(SessionState::Failed);
                Err(e)
            }
        }
    }

    /// Send `qmp_capabilities`; on success the session is `Ready`.
    pub async fn negotiate(&self) -> QmpResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Negotiating {
            return Err(QmpError::ProtocolViolation(format!(
                "capability negotiation requested in state {}",
                inner.state
            )));
        }
        let timeout = self.timeouts.handshake;
        match self.exchange(&mut inner, CAPABILITIES, None, timeout).await {
            Ok(_) => {
                inner.state = SessionState::Ready;
                debug!("[qmp] capabilities negotiated");
                Ok(())
            }
            Err(e) if e.is_recoverable() => {
                inner.teardown(SessionState::Failed);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn connect_and_negotiate(&self, host: &str, port: u16) -> QmpResult<Greeting> {
        let g = self.connect(host, port).await?;
        self.negotiate().await?;
        Ok(g)
    }

    /// Run one command and return its `return` payload.
    pub async fn execute_command(&self, name: &str, arguments: Option<Value>) -> QmpResult<Value> {
        self.execute_with_timeout(name, arguments, self.timeouts.command)
            .await
    }

    async fn execute_with_timeout(
        &self,
        name: &str,
        arguments: Option<Value>,
        limit: Duration,
    ) -> QmpResult<Value> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            SessionState::Ready => {}
            SessionState::Negotiating if name == CAPABILITIES => {}
            SessionState::Negotiating => {
                warn!("[qmp] '{}' sent before capability negotiation", name);
                inner.teardown(SessionState::Failed);
                return Err(QmpError::ProtocolViolation(format!(
                    "'{}' issued before capability negotiation",
                    name
                )));
            }
            _ => return Err(QmpError::NotConnected),
        }
        let result = self
            .exchange(&mut inner, name, arguments.as_ref(), limit)
            .await;
        if name == CAPABILITIES && result.is_ok() {
            inner.state = SessionState::Ready;
        }
        result
    }

    /// Write one command and wait for its correlated reply. Any failure other
    /// than a command error tears the session down.
    async fn exchange(
        &self,
        inner: &mut Inner,
        name: &str,
        arguments: Option<&Value>,
        limit: Duration,
    ) -> QmpResult<Value> {
        let id = inner.next_id;
        inner.next_id += 1;

        let mut payload = serde_json::to_vec(&Command {
            execute: name,
            arguments,
            id,
        })?;
        payload.push(b'\n');

        let Inner { conn, events, .. } = &mut *inner;
        let Some(conn) = conn.as_mut() else {
            return Err(QmpError::NotConnected);
        };

        let outcome = match timeout(limit, roundtrip(conn, events, &payload, id, name)).await {
            Ok(r) => r,
            Err(_) => Err(QmpError::Timeout {
                op: "command",
                after: limit,
            }),
        };

        if let Err(e) = &outcome
            && !e.is_recoverable()
        {
            debug!("[qmp] tearing down session after '{}': {}", name, e);
            inner.teardown(SessionState::Failed);
        }
        outcome
    }

    /// Probe with `query-commands`. Any reply, including a command error,
    /// proves the peer is responsive.
    pub async fn is_alive(&self) -> bool {
        match self
            .execute_with_timeout("query-commands", None, self.timeouts.liveness)
            .await
        {
            Ok(_) => true,
            Err(e) if e.is_recoverable() => true,
            Err(e) => {
                debug!("[qmp] liveness probe failed: {}", e);
                false
            }
        }
    }

    /// Drop the session. Safe to call repeatedly and on dead sockets.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(mut conn) = inner.conn.take() {
            let _ = conn.writer.shutdown().await;
        }
        inner.state = SessionState::Disconnected;
        inner.greeting = None;
    }

    // ─── Convenience commands ─────────────────────────────────────────────

    pub async fn query_status(&self) -> QmpResult<VmRunState> {
        let v = self.execute_command("query-status", None).await?;
        Ok(serde_json::from_value(v)?)
    }

    /// Names of every command the hypervisor supports.
    pub async fn query_commands(&self) -> QmpResult<Vec<String>> {
        let v = self.execute_command("query-commands", None).await?;
        Ok(v.as_array()
            .map(|cmds| {
                cmds.iter()
                    .filter_map(|c| c.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// ACPI power button.
    pub async fn system_powerdown(&self) -> QmpResult<()> {
        self.execute_command("system_powerdown", None).await?;
        Ok(())
    }

    /// Attach a host USB device to the guest.
    pub async fn device_add_usb_host(&self, id: &str, vendor_id: u16, product_id: u16) -> QmpResult<()> {
        let args = json!({
            "driver": "usb-host",
            "id": id,
            "vendorid": vendor_id,
            "productid": product_id,
        });
        self.execute_command("device_add", Some(args)).await?;
        Ok(())
    }

    pub async fn device_del(&self, id: &str) -> QmpResult<()> {
        self.execute_command("device_del", Some(json!({ "id": id })))
            .await?;
        Ok(())
    }
}

async fn roundtrip(
    conn: &mut Connection,
    events: &mut VecDeque<Value>,
    payload: &[u8],
    id: u64,
    name: &str,
) -> QmpResult<Value> {
    conn.writer.write_all(payload).await?;
    conn.writer.flush().await?;

    let mut line = String::new();
    loop {
        line.clear();
        if conn.reader.read_line(&mut line).await? == 0 {
            return Err(QmpError::Closed);
        }
        if line.trim().is_empty() {
            continue;
        }
        let reply = Reply::parse(&line).map_err(QmpError::ProtocolViolation)?;
        match reply {
            Reply::Event(ev) => {
                if events.len() >= QMP_EVENT_BUFFER {
                    events.pop_front();
                }
                events.push_back(ev);
            }
            Reply::Return { id: got, value } => {
                check_id(id, got)?;
                return Ok(value);
            }
            Reply::Error {
                id: got,
                class,
                desc,
            } => {
                check_id(id, got)?;
                return Err(QmpError::Command {
                    command: name.to_string(),
                    class,
                    desc,
                });
            }
        }
    }
}

/// With one command in flight the next non-event reply is its answer, so a
/// missing id matches. Only a different id is a violation.
fn check_id(expected: u64, got: Option<u64>) -> QmpResult<()> {
    match got {
        None => Ok(()),
        Some(g) if g == expected => Ok(()),
        Some(g) => Err(QmpError::ProtocolViolation(format!(
            "reply id {} does not match request id {}",
            g, expected
        ))),
    }
}
