use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use pkg_types::compose::InstanceDescriptor;
use pkg_types::port::ResolvedPortBinding;
use pkg_types::runtime::{RuntimeKind, RuntimeStatus};

/// Direction of a compose-style apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeDirection {
    Up,
    Down,
}

/// Per-instance lifecycle verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Start,
    Stop,
    Restart,
    Pause,
    Unpause,
}

impl LifecycleAction {
    pub fn verb(&self) -> &'static str {
        match self {
            LifecycleAction::Start => "start",
            LifecycleAction::Stop => "stop",
            LifecycleAction::Restart => "restart",
            LifecycleAction::Pause => "pause",
            LifecycleAction::Unpause => "unpause",
        }
    }
}

impl std::fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.verb())
    }
}

/// Which host tooling a backend would need, and whether it is present.
/// `None` means the item does not apply to that backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostProbe {
    pub engine: Option<bool>,
    pub compose: Option<bool>,
    pub hypervisor: Option<bool>,
    pub disk_tool: Option<bool>,
    pub firmware_code: Option<bool>,
    pub firmware_vars: Option<bool>,
    pub acceleration: Option<bool>,
}

impl HostProbe {
    /// Every applicable item is present.
    pub fn ready(&self) -> bool {
        [
            self.engine,
            self.compose,
            self.hypervisor,
            self.disk_tool,
            self.firmware_code,
            self.firmware_vars,
        ]
        .into_iter()
        .flatten()
        .all(|ok| ok)
    }
}

/// Resolved port cache shared by every backend. Valid only while the
/// instance is RUNNING.
#[derive(Debug, Default)]
pub struct PortCache {
    ports: Mutex<Vec<ResolvedPortBinding>>,
}

impl PortCache {
    pub fn get(&self) -> Vec<ResolvedPortBinding> {
        self.ports.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn set(&self, ports: Vec<ResolvedPortBinding>) {
        if let Ok(mut p) = self.ports.lock() {
            *p = ports;
        }
    }

    pub fn invalidate(&self) {
        if let Ok(mut p) = self.ports.lock() {
            p.clear();
        }
    }
}

/// Uniform lifecycle contract over every execution backend.
/// Implementations: Docker and Podman (compose engines), QEMU (native process).
#[async_trait]
pub trait RuntimeManager: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    /// Human-readable backend name.
    fn name(&self) -> &str {
        self.kind().as_str()
    }

    /// Descriptor file owned by this backend.
    fn descriptor_path(&self) -> PathBuf;

    /// Seed descriptor for a new instance.
    fn default_descriptor(&self) -> InstanceDescriptor {
        InstanceDescriptor::default_for(self.kind())
    }

    async fn read_descriptor(&self) -> Result<InstanceDescriptor> {
        InstanceDescriptor::load(&self.descriptor_path())
    }

    /// Persist the descriptor (write-then-rename). A running instance is not
    /// affected until the next `apply`.
    async fn write_descriptor(&self, descriptor: &InstanceDescriptor) -> Result<()> {
        descriptor.save(&self.descriptor_path())?;
        tracing::info!(
            "[{}] descriptor written to {}",
            self.name(),
            self.descriptor_path().display()
        );
        Ok(())
    }

    /// Read the descriptor, seeding the default when none exists yet.
    async fn ensure_descriptor(&self) -> Result<InstanceDescriptor> {
        if tokio::fs::metadata(self.descriptor_path()).await.is_ok() {
            return self.read_descriptor().await;
        }
        let descriptor = self.default_descriptor();
        self.write_descriptor(&descriptor).await?;
        Ok(descriptor)
    }

    /// Bring the whole instance up or down.
    async fn apply(&self, direction: ComposeDirection, extra_args: &[String]) -> Result<()>;

    async fn lifecycle(&self, action: LifecycleAction) -> Result<()>;

    /// Current status. Never fails: errors are logged and reported as
    /// `Unknown`. Any non-RUNNING result invalidates the port cache.
    async fn status(&self) -> RuntimeStatus;

    /// Resolved bindings, served from the cache while RUNNING. Empty when not
    /// running or on error.
    async fn port(&self) -> Vec<ResolvedPortBinding> {
        if !self.status().await.is_running() {
            return Vec::new();
        }
        let cached = self.cached_ports();
        if !cached.is_empty() {
            return cached;
        }
        self.refresh_ports().await
    }

    /// Query the backend for resolved bindings, replacing the cache.
    async fn refresh_ports(&self) -> Vec<ResolvedPortBinding>;

    /// Last cached resolution, possibly empty.
    fn cached_ports(&self) -> Vec<ResolvedPortBinding>;

    /// Whether the instance has been provisioned.
    async fn exists(&self) -> bool;

    /// Remove the instance. Removing an absent instance only logs.
    async fn remove(&self) -> Result<()>;
}
