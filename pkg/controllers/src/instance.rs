use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pkg_constants::network::{GUEST_API_PORT, GUEST_QMP_PORT};
use pkg_constants::state::SUPERVISOR_POLL_INTERVAL_MS;
use pkg_container::RuntimeManager;
use pkg_network::PortMapper;
use pkg_qmp::{QmpClient, QmpTimeouts};
use pkg_types::capability::RuntimeCapabilities;
use pkg_types::port::ResolvedPortBinding;
use pkg_types::runtime::RuntimeStatus;

use crate::guest::{GuestClient, GuestVersion};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ControlChannelState {
    /// The runtime has no control channel.
    Unsupported,
    Down,
    Ready,
}

/// What the supervisor observed on its last tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorSnapshot {
    pub status: RuntimeStatus,
    pub ports: Vec<ResolvedPortBinding>,
    pub control_channel: ControlChannelState,
    pub guest_healthy: bool,
    pub guest_version: Option<GuestVersion>,
    pub ticks: u64,
}

impl SupervisorSnapshot {
    fn initial(control_channel: bool) -> Self {
        Self {
            status: RuntimeStatus::Unknown,
            ports: Vec::new(),
            control_channel: if control_channel {
                ControlChannelState::Down
            } else {
                ControlChannelState::Unsupported
            },
            guest_healthy: false,
            guest_version: None,
            ticks: 0,
        }
    }
}

/// Background controller that follows one instance.
///
/// Each tick: query status; while RUNNING resolve the declared ports against
/// the backend report, keep a QMP session on the resolved control port, and
/// poll the guest API. Leaving RUNNING tears the session down before the tick
/// returns.
pub struct InstanceSupervisor {
    manager: Arc<dyn RuntimeManager>,
    control_channel: bool,
    poll_interval: Duration,
    qmp_timeouts: QmpTimeouts,
    guest_timeout: Option<Duration>,

    last_status: RuntimeStatus,
    mapper: PortMapper,
    session: Option<QmpClient>,
    guest: Option<GuestClient>,
    guest_endpoint: Option<(String, u16)>,
    guest_version: Option<GuestVersion>,
    snapshot: SupervisorSnapshot,
    tx: watch::Sender<SupervisorSnapshot>,
}

impl InstanceSupervisor {
    pub fn new(manager: Arc<dyn RuntimeManager>, capabilities: &RuntimeCapabilities) -> Self {
        let control_channel = capabilities.supports_control_channel;
        let snapshot = SupervisorSnapshot::initial(control_channel);
        let (tx, _) = watch::channel(snapshot.clone());
        Self {
            manager,
            control_channel,
            poll_interval: Duration::from_millis(SUPERVISOR_POLL_INTERVAL_MS),
            qmp_timeouts: QmpTimeouts::default(),
            guest_timeout: None,
            last_status: RuntimeStatus::Unknown,
            mapper: PortMapper::default(),
            session: None,
            guest: None,
            guest_endpoint: None,
            guest_version: None,
            snapshot,
            tx,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_qmp_timeouts(mut self, timeouts: QmpTimeouts) -> Self {
        self.qmp_timeouts = timeouts;
        self
    }

    pub fn with_guest_timeout(mut self, timeout: Duration) -> Self {
        self.guest_timeout = Some(timeout);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorSnapshot> {
        self.tx.subscribe()
    }

    /// The live QMP session, if any.
    pub fn session(&self) -> Option<&QmpClient> {
        self.session.as_ref()
    }

    /// One supervision pass.
    pub async fn tick(&mut self) -> SupervisorSnapshot {
        let status = self.manager.status().await;
        let entered_running = status.is_running() && !self.last_status.is_running();
        if status != self.last_status {
            info!(
                "[supervisor] {} status: {} → {}",
                self.manager.name(),
                self.last_status,
                status
            );
        }
        self.last_status = status;

        let mut next = SupervisorSnapshot {
            status,
            ticks: self.snapshot.ticks + 1,
            ..SupervisorSnapshot::initial(self.control_channel)
        };

        if status.is_running() {
            // Ports first: the control channel needs the resolved port.
            if entered_running || self.mapper.specs().is_empty() {
                self.load_declarations().await;
            }
            let reported = if entered_running {
                self.manager.refresh_ports().await
            } else {
                let cached = self.manager.cached_ports();
                if cached.is_empty() {
                    self.manager.refresh_ports().await
                } else {
                    cached
                }
            };
            self.mapper.apply_resolved(&reported);

            if self.control_channel {
                self.ensure_control_channel().await;
                next.control_channel = if self.session.is_some() {
                    ControlChannelState::Ready
                } else {
                    ControlChannelState::Down
                };
            }

            next.guest_healthy = self.poll_guest().await;
            next.guest_version = self.guest_version.clone();
            next.ports = self.mapper.resolved().to_vec();
        } else {
            self.teardown_session("instance not running").await;
            self.mapper.clear_resolved();
            self.guest = None;
            self.guest_endpoint = None;
            self.guest_version = None;
        }

        self.snapshot = next.clone();
        self.tx.send_replace(next.clone());
        next
    }

    /// Port declarations from the instance descriptor. A missing or
    /// unreadable descriptor falls back to the backend default.
    async fn load_declarations(&mut self) {
        let descriptor = match self.manager.read_descriptor().await {
            Ok(d) => d,
            Err(e) => {
                warn!(
                    "[supervisor] descriptor unreadable, using the default port layout: {}",
                    e
                );
                self.manager.default_descriptor()
            }
        };
        self.mapper = PortMapper::from_descriptor(&descriptor);
    }

    async fn ensure_control_channel(&mut self) {
        let Some((host, port)) = self.mapper.get_resolved_endpoint(GUEST_QMP_PORT) else {
            debug!("[supervisor] no control port in the resolved port table");
            self.teardown_session("control port not published").await;
            return;
        };

        if let Some(session) = &self.session {
            if session.is_alive().await {
                return;
            }
            warn!("[supervisor] control channel liveness probe failed, reconnecting");
            self.teardown_session("liveness probe failed").await;
        }
        self.open_session(&host, port).await;
    }

    async fn open_session(&mut self, host: &str, port: u16) {
        let client = QmpClient::with_timeouts(self.qmp_timeouts);
        match client.connect_and_negotiate(host, port).await {
            Ok(greeting) => {
                info!(
                    "[supervisor] control channel ready on {}:{} (qemu {})",
                    host,
                    port,
                    greeting.qemu_version().unwrap_or_else(|| "?".to_string())
                );
                self.session = Some(client);
            }
            Err(e) => {
                debug!("[supervisor] control channel {}:{} unavailable: {}", host, port, e);
                client.close().await;
            }
        }
    }

    async fn teardown_session(&mut self, reason: &str) {
        if let Some(session) = self.session.take() {
            info!("[supervisor] closing control channel ({})", reason);
            session.close().await;
        }
    }

    /// Poll `/health`, and `/version` once per RUNNING period.
    async fn poll_guest(&mut self) -> bool {
        let Some(endpoint) = self.mapper.get_resolved_endpoint(GUEST_API_PORT) else {
            self.guest = None;
            self.guest_endpoint = None;
            return false;
        };
        if self.guest_endpoint.as_ref() != Some(&endpoint) {
            let built = match self.guest_timeout {
                Some(t) => GuestClient::with_timeout(&endpoint.0, endpoint.1, t),
                None => GuestClient::new(&endpoint.0, endpoint.1),
            };
            match built {
                Ok(client) => {
                    self.guest = Some(client);
                    self.guest_endpoint = Some(endpoint);
                }
                Err(e) => {
                    warn!("[supervisor] cannot build guest API client: {}", e);
                    return false;
                }
            }
        }
        let Some(guest) = &self.guest else {
            return false;
        };

        let healthy = guest.health().await;
        if healthy && self.guest_version.is_none() {
            match guest.version().await {
                Ok(v) => {
                    info!("[supervisor] guest agent {} ({})", v.version, v.guest_arch);
                    self.guest_version = Some(v);
                }
                Err(e) => debug!("[supervisor] guest version unavailable: {}", e),
            }
        }
        healthy
    }

    /// Run the loop on a background task until the handle is shut down or
    /// dropped.
    pub fn spawn(mut self) -> SupervisorHandle {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let snapshots = self.subscribe();

        let task = tokio::spawn(async move {
            info!(
                "InstanceSupervisor started (interval={}ms)",
                self.poll_interval.as_millis()
            );
            let mut interval = tokio::time::interval(self.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = interval.tick() => {
                        self.tick().await;
                    }
                }
            }
            self.teardown_session("supervisor stopped").await;
            info!("InstanceSupervisor stopped");
        });

        SupervisorHandle {
            token,
            task: Some(task),
            snapshots,
        }
    }
}

/// Owner of a running supervisor. Dropping it cancels the loop.
pub struct SupervisorHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
    snapshots: watch::Receiver<SupervisorSnapshot>,
}

impl SupervisorHandle {
    pub fn snapshots(&self) -> watch::Receiver<SupervisorSnapshot> {
        self.snapshots.clone()
    }

    pub fn latest(&self) -> SupervisorSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Cancel and wait for the loop to close its session.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!("InstanceSupervisor task ended abnormally: {}", e);
        }
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Result;
    use async_trait::async_trait;
    use pkg_container::backend::{ComposeDirection, LifecycleAction, PortCache};
    use pkg_types::capability::{FeatureFlags, HostPlatform, HostProfile, resolve};
    use pkg_types::compose::InstanceDescriptor;
    use pkg_types::port::{HostPort, PortBinding, PortSpec, Protocol};
    use pkg_types::runtime::RuntimeKind;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    struct FakeManager {
        status: Mutex<RuntimeStatus>,
        declared: Vec<PortSpec>,
        ports: Mutex<Vec<ResolvedPortBinding>>,
        refreshes: AtomicUsize,
        cache: PortCache,
    }

    impl FakeManager {
        /// Every reported port is also declared as a fixed binding.
        fn new(ports: Vec<ResolvedPortBinding>) -> Arc<Self> {
            let declared = ports
                .iter()
                .map(|r| {
                    PortSpec::short(PortBinding::new(
                        HostPort::Fixed(r.host_port),
                        r.container_port,
                        r.protocol,
                    ))
                })
                .collect();
            Self::with_declared(declared, ports)
        }

        fn with_declared(declared: Vec<PortSpec>, ports: Vec<ResolvedPortBinding>) -> Arc<Self> {
            Arc::new(Self {
                status: Mutex::new(RuntimeStatus::Exited),
                declared,
                ports: Mutex::new(ports),
                refreshes: AtomicUsize::new(0),
                cache: PortCache::default(),
            })
        }

        fn set_status(&self, s: RuntimeStatus) {
            *self.status.lock().unwrap() = s;
        }
    }

    #[async_trait]
    impl RuntimeManager for FakeManager {
        fn kind(&self) -> RuntimeKind {
            RuntimeKind::Docker
        }
        fn descriptor_path(&self) -> PathBuf {
            PathBuf::from("/nonexistent/docker-compose.yml")
        }
        async fn read_descriptor(&self) -> Result<InstanceDescriptor> {
            let mut descriptor = InstanceDescriptor::default_for(RuntimeKind::Docker);
            descriptor.service_mut().ports = self.declared.clone();
            Ok(descriptor)
        }
        async fn apply(&self, _: ComposeDirection, _: &[String]) -> Result<()> {
            Ok(())
        }
        async fn lifecycle(&self, _: LifecycleAction) -> Result<()> {
            Ok(())
        }
        async fn status(&self) -> RuntimeStatus {
            let s = *self.status.lock().unwrap();
            if !s.is_running() {
                self.cache.invalidate();
            }
            s
        }
        async fn refresh_ports(&self) -> Vec<ResolvedPortBinding> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            let ports = self.ports.lock().unwrap().clone();
            self.cache.set(ports.clone());
            ports
        }
        fn cached_ports(&self) -> Vec<ResolvedPortBinding> {
            self.cache.get()
        }
        async fn exists(&self) -> bool {
            true
        }
        async fn remove(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Fake QMP endpoint. Accepts any number of sessions; the first
    /// `drop_after_greeting` connections are closed right after the greeting
    /// is sent and the handshake answered, so the next command fails.
    async fn fake_qmp(drop_first: usize) -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let n = counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let (read, mut write) = stream.into_split();
                    let greeting = r#"{"QMP": {"version": {"qemu": {"micro": 0, "minor": 2, "major": 8}}, "capabilities": []}}"#;
                    if write.write_all(format!("{}\n", greeting).as_bytes()).await.is_err() {
                        return;
                    }
                    let mut reader = BufReader::new(read);
                    let mut line = String::new();
                    loop {
                        line.clear();
                        if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                            return;
                        }
                        let v: serde_json::Value = match serde_json::from_str(&line) {
                            Ok(v) => v,
                            Err(_) => return,
                        };
                        let exec = v["execute"].as_str().unwrap_or_default().to_string();
                        if exec != "qmp_capabilities" && n < drop_first {
                            return;
                        }
                        let reply = match &v["id"] {
                            serde_json::Value::Null => "{\"return\": {}}\n".to_string(),
                            id => format!("{{\"return\": {{}}, \"id\": {}}}\n", id),
                        };
                        if write.write_all(reply.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        (port, accepted)
    }

    fn binding(host_port: u16, container_port: u16) -> ResolvedPortBinding {
        ResolvedPortBinding {
            host_address: Some("127.0.0.1".into()),
            host_port,
            container_port,
            protocol: Protocol::Tcp,
        }
    }

    fn docker_caps() -> RuntimeCapabilities {
        resolve(
            RuntimeKind::Docker,
            &HostProfile::new(HostPlatform::Linux, "x86_64"),
            &FeatureFlags::default(),
        )
    }

    fn fast_qmp() -> QmpTimeouts {
        QmpTimeouts {
            connect: Duration::from_millis(500),
            handshake: Duration::from_millis(500),
            command: Duration::from_millis(300),
            liveness: Duration::from_millis(300),
        }
    }

    fn supervisor(manager: Arc<FakeManager>) -> InstanceSupervisor {
        InstanceSupervisor::new(manager, &docker_caps())
            .with_qmp_timeouts(fast_qmp())
            .with_guest_timeout(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_not_running_has_no_session() {
        let manager = FakeManager::new(vec![]);
        let mut sup = supervisor(manager.clone());
        let snap = sup.tick().await;
        assert_eq!(snap.status, RuntimeStatus::Exited);
        assert!(snap.ports.is_empty());
        assert_eq!(snap.control_channel, ControlChannelState::Down);
        assert_eq!(manager.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_running_opens_session_and_tears_down_on_exit() {
        let (qmp_port, accepted) = fake_qmp(0).await;
        let manager = FakeManager::new(vec![binding(qmp_port, GUEST_QMP_PORT)]);
        let mut sup = supervisor(manager.clone());
        let rx = sup.subscribe();

        manager.set_status(RuntimeStatus::Running);
        let snap = sup.tick().await;
        assert_eq!(snap.control_channel, ControlChannelState::Ready);
        assert_eq!(snap.ports.len(), 1);
        assert_eq!(manager.refreshes.load(Ordering::SeqCst), 1);
        assert!(sup.session().is_some());
        assert_eq!(rx.borrow().ticks, 1);

        // steady state: cached ports, same session
        let snap = sup.tick().await;
        assert_eq!(snap.control_channel, ControlChannelState::Ready);
        assert_eq!(manager.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);

        manager.set_status(RuntimeStatus::Paused);
        let snap = sup.tick().await;
        assert!(sup.session().is_none());
        assert_eq!(snap.control_channel, ControlChannelState::Down);
        assert!(snap.ports.is_empty());
        assert!(!snap.guest_healthy);
    }

    #[tokio::test]
    async fn test_failed_probe_reconnects_once_in_same_tick() {
        // first session dies after the handshake; the second one is healthy
        let (qmp_port, accepted) = fake_qmp(1).await;
        let manager = FakeManager::new(vec![binding(qmp_port, GUEST_QMP_PORT)]);
        let mut sup = supervisor(manager.clone());
        manager.set_status(RuntimeStatus::Running);

        let snap = sup.tick().await;
        assert_eq!(snap.control_channel, ControlChannelState::Ready);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);

        let snap = sup.tick().await;
        assert_eq!(snap.control_channel, ControlChannelState::Ready);
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unreachable_control_port_stays_down() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead = listener.local_addr().unwrap().port();
        drop(listener);

        let manager = FakeManager::new(vec![binding(dead, GUEST_QMP_PORT)]);
        let mut sup = supervisor(manager.clone());
        manager.set_status(RuntimeStatus::Running);
        let snap = sup.tick().await;
        assert_eq!(snap.status, RuntimeStatus::Running);
        assert_eq!(snap.control_channel, ControlChannelState::Down);
        assert!(!snap.guest_healthy);
    }

    #[tokio::test]
    async fn test_undeclared_report_is_not_used_as_control_port() {
        let (qmp_port, accepted) = fake_qmp(0).await;
        let declared_port = if qmp_port == 65535 { 65534 } else { qmp_port + 1 };
        let declared = vec![PortSpec::short(PortBinding::new(
            HostPort::Fixed(declared_port),
            GUEST_QMP_PORT,
            Protocol::Tcp,
        ))];
        let manager = FakeManager::with_declared(declared, vec![binding(qmp_port, GUEST_QMP_PORT)]);
        let mut sup = supervisor(manager.clone());
        manager.set_status(RuntimeStatus::Running);

        let snap = sup.tick().await;
        assert!(snap.ports.is_empty());
        assert_eq!(snap.control_channel, ControlChannelState::Down);
        assert_eq!(accepted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unsupported_control_channel_never_connects() {
        let (qmp_port, accepted) = fake_qmp(0).await;
        let manager = FakeManager::new(vec![binding(qmp_port, GUEST_QMP_PORT)]);
        let mut caps = docker_caps();
        caps.supports_control_channel = false;
        let mut sup = InstanceSupervisor::new(manager.clone(), &caps);
        manager.set_status(RuntimeStatus::Running);

        let snap = sup.tick().await;
        assert_eq!(snap.control_channel, ControlChannelState::Unsupported);
        assert_eq!(accepted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_spawned_loop_publishes_and_shuts_down() {
        let (qmp_port, _) = fake_qmp(0).await;
        let manager = FakeManager::new(vec![binding(qmp_port, GUEST_QMP_PORT)]);
        manager.set_status(RuntimeStatus::Running);
        let handle = supervisor(manager.clone())
            .with_poll_interval(Duration::from_millis(20))
            .spawn();

        let mut rx = handle.snapshots();
        let snap = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.control_channel == ControlChannelState::Ready),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert_eq!(snap.status, RuntimeStatus::Running);
        assert!(handle.latest().ticks >= 1);

        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .unwrap();
    }
}
