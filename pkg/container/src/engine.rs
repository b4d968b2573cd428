//! Container-engine backends (Docker, Podman).
//!
//! Both engines take the same compose descriptor; they differ in the compose
//! tool they invoke, in their status vocabulary and in whether host port
//! ranges are honoured. Every invocation is a real subprocess bounded by a
//! timeout, so a hung engine daemon cannot stall the poll loop.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use pkg_constants::runtime::{COMPOSE_UP_TIMEOUT_SECS, CONTAINER_NAME, TOOL_TIMEOUT_SECS};
use pkg_types::compose::InstanceDescriptor;
use pkg_types::port::{Protocol, ResolvedPortBinding};
use pkg_types::runtime::{RuntimeKind, RuntimeStatus};
use pkg_types::validate::validate_container_name;

use crate::backend::{
    ComposeDirection, HostProbe, LifecycleAction, PortCache, RuntimeManager,
};
use crate::host::{Accelerator, tuned_default};
use crate::process::{find_binary, run_tool, run_tool_checked};
use crate::state::{map_docker_status, map_podman_status, status_from_state_json};

/// Which container engine a backend drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineFlavor {
    Docker,
    Podman,
}

impl EngineFlavor {
    pub fn kind(&self) -> RuntimeKind {
        match self {
            EngineFlavor::Docker => RuntimeKind::Docker,
            EngineFlavor::Podman => RuntimeKind::Podman,
        }
    }

    fn engine_binary(&self) -> &'static str {
        match self {
            EngineFlavor::Docker => "docker",
            EngineFlavor::Podman => "podman",
        }
    }

    fn map_status(&self, raw: &str) -> RuntimeStatus {
        match self {
            EngineFlavor::Docker => map_docker_status(raw),
            EngineFlavor::Podman => map_podman_status(raw),
        }
    }
}

/// Programs an engine backend invokes.
#[derive(Debug, Clone)]
pub struct EngineTooling {
    /// The engine CLI (`docker` / `podman`).
    pub engine: PathBuf,
    /// Compose program and its leading arguments
    /// (`docker compose` / `podman-compose`).
    pub compose: Vec<String>,
}

impl EngineTooling {
    pub fn for_flavor(flavor: EngineFlavor) -> Self {
        match flavor {
            EngineFlavor::Docker => Self {
                engine: PathBuf::from("docker"),
                compose: vec!["docker".to_string(), "compose".to_string()],
            },
            EngineFlavor::Podman => Self {
                engine: PathBuf::from("podman"),
                compose: vec!["podman-compose".to_string()],
            },
        }
    }
}

/// Compose-driven engine backend.
pub struct EngineBackend {
    flavor: EngineFlavor,
    data_dir: PathBuf,
    tooling: EngineTooling,
    tool_timeout: Duration,
    up_timeout: Duration,
    cache: PortCache,
}

impl EngineBackend {
    pub fn new(flavor: EngineFlavor, data_dir: &Path) -> Self {
        Self {
            flavor,
            data_dir: data_dir.to_path_buf(),
            tooling: EngineTooling::for_flavor(flavor),
            tool_timeout: Duration::from_secs(TOOL_TIMEOUT_SECS),
            up_timeout: Duration::from_secs(COMPOSE_UP_TIMEOUT_SECS),
            cache: PortCache::default(),
        }
    }

    pub fn docker(data_dir: &Path) -> Self {
        Self::new(EngineFlavor::Docker, data_dir)
    }

    pub fn podman(data_dir: &Path) -> Self {
        Self::new(EngineFlavor::Podman, data_dir)
    }

    /// Replace the programs invoked (tests, non-standard installs).
    pub fn with_tooling(mut self, tooling: EngineTooling) -> Self {
        self.tooling = tooling;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn flavor(&self) -> EngineFlavor {
        self.flavor
    }

    /// Container name from the descriptor, falling back to the default.
    async fn container_name(&self) -> String {
        match self.read_descriptor().await {
            Ok(d) => {
                let name = d.container_name().to_string();
                match validate_container_name(&name) {
                    Ok(()) => name,
                    Err(e) => {
                        warn!("[{}] {}; using {}", self.name(), e, CONTAINER_NAME);
                        CONTAINER_NAME.to_string()
                    }
                }
            }
            Err(_) => CONTAINER_NAME.to_string(),
        }
    }

    async fn engine(&self, args: &[&str]) -> Result<std::process::Output> {
        run_tool(&self.tooling.engine, args, self.tool_timeout).await
    }

    async fn engine_checked(&self, args: &[&str]) -> Result<String> {
        run_tool_checked(&self.tooling.engine, args, self.tool_timeout).await
    }

    async fn compose(&self, args: &[String], limit: Duration) -> Result<String> {
        let Some((program, lead)) = self.tooling.compose.split_first() else {
            anyhow::bail!("no compose program configured");
        };
        let mut full: Vec<String> = lead.to_vec();
        full.push("-f".to_string());
        full.push(self.descriptor_path().to_string_lossy().to_string());
        full.extend(args.iter().cloned());
        run_tool_checked(Path::new(program), &full, limit).await
    }

    /// Probe the host for this engine's tooling. Diagnostics only.
    pub async fn host_probe(flavor: EngineFlavor) -> HostProbe {
        let tooling = EngineTooling::for_flavor(flavor);
        let engine = find_binary(flavor.engine_binary(), &[]).await.is_some();
        let compose = match flavor {
            EngineFlavor::Docker => {
                engine
                    && run_tool(
                        &tooling.engine,
                        &["compose", "version"],
                        Duration::from_secs(TOOL_TIMEOUT_SECS),
                    )
                    .await
                    .is_ok_and(|o| o.status.success())
            }
            EngineFlavor::Podman => find_binary("podman-compose", &[]).await.is_some(),
        };
        HostProbe {
            engine: Some(engine),
            compose: Some(compose),
            acceleration: Some(Accelerator::detect().await.is_hardware()),
            ..Default::default()
        }
    }
}

/// Parse `<engine> port <name>` output, e.g. `7149/tcp -> 127.0.0.1:47293`
/// or `3389/udp -> [::]:47300`. Unparsable lines are skipped.
pub fn parse_port_output(text: &str) -> Vec<ResolvedPortBinding> {
    let mut out = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match parse_port_line(line) {
            Some(b) => {
                if !out.contains(&b) {
                    out.push(b);
                }
            }
            None => debug!("skipping unrecognized port line: {}", line),
        }
    }
    out
}

fn parse_port_line(line: &str) -> Option<ResolvedPortBinding> {
    let (left, right) = line.split_once("->")?;
    let (container, proto) = match left.trim().split_once('/') {
        Some((c, p)) => (c, p.parse::<Protocol>().ok()?),
        None => (left.trim(), Protocol::Tcp),
    };
    let container_port = container.trim().parse::<u16>().ok()?;

    let (addr, port) = right.trim().rsplit_once(':')?;
    let host_port = port.trim().parse::<u16>().ok()?;
    let addr = addr.trim().trim_start_matches('[').trim_end_matches(']');
    Some(ResolvedPortBinding {
        host_address: (!addr.is_empty()).then(|| addr.to_string()),
        host_port,
        container_port,
        protocol: proto,
    })
}

#[async_trait]
impl RuntimeManager for EngineBackend {
    fn kind(&self) -> RuntimeKind {
        self.flavor.kind()
    }

    fn descriptor_path(&self) -> PathBuf {
        self.data_dir.join(self.kind().compose_filename())
    }

    fn default_descriptor(&self) -> InstanceDescriptor {
        tuned_default(self.kind())
    }

    async fn apply(&self, direction: ComposeDirection, extra_args: &[String]) -> Result<()> {
        let (mut args, limit) = match direction {
            ComposeDirection::Up => (
                vec!["up".to_string(), "-d".to_string()],
                self.up_timeout,
            ),
            ComposeDirection::Down => (vec!["down".to_string()], self.tool_timeout),
        };
        args.extend(extra_args.iter().cloned());
        info!("[{}] compose {:?} {:?}", self.name(), direction, extra_args);

        self.cache.invalidate();
        self.compose(&args, limit).await?;
        Ok(())
    }

    async fn lifecycle(&self, action: LifecycleAction) -> Result<()> {
        let name = self.container_name().await;
        info!("[{}] {} {}", self.name(), action, name);
        self.cache.invalidate();
        self.engine_checked(&[action.verb(), &name]).await?;
        Ok(())
    }

    async fn status(&self) -> RuntimeStatus {
        let name = self.container_name().await;
        let status = match self
            .engine(&["inspect", "--format", "{{json .State}}", &name])
            .await
        {
            Ok(out) if out.status.success() => {
                let text = String::from_utf8_lossy(&out.stdout);
                match status_from_state_json(&text) {
                    Some(raw) => self.flavor.map_status(&raw),
                    None => {
                        warn!("[{}] unexpected inspect output: {}", self.name(), text.trim());
                        RuntimeStatus::Unknown
                    }
                }
            }
            Ok(out) => {
                debug!(
                    "[{}] inspect {} failed: {}",
                    self.name(),
                    name,
                    String::from_utf8_lossy(&out.stderr).trim()
                );
                RuntimeStatus::Unknown
            }
            Err(e) => {
                warn!("[{}] status query failed: {}", self.name(), e);
                RuntimeStatus::Unknown
            }
        };
        if !status.is_running() {
            self.cache.invalidate();
        }
        status
    }

    async fn refresh_ports(&self) -> Vec<ResolvedPortBinding> {
        let name = self.container_name().await;
        match self.engine_checked(&["port", &name]).await {
            Ok(text) => {
                let ports = parse_port_output(&text);
                self.cache.set(ports.clone());
                ports
            }
            Err(e) => {
                warn!("[{}] port query failed: {}", self.name(), e);
                self.cache.invalidate();
                Vec::new()
            }
        }
    }

    fn cached_ports(&self) -> Vec<ResolvedPortBinding> {
        self.cache.get()
    }

    async fn exists(&self) -> bool {
        let name = self.container_name().await;
        self.engine(&["inspect", &name])
            .await
            .is_ok_and(|o| o.status.success())
    }

    async fn remove(&self) -> Result<()> {
        let name = self.container_name().await;
        if !self.exists().await {
            info!("[{}] container {} not present, nothing to remove", self.name(), name);
            return Ok(());
        }
        self.cache.invalidate();
        // -f: a running container is stopped as part of removal
        self.engine_checked(&["rm", "-f", &name]).await?;
        info!("[{}] container {} removed", self.name(), name);
        Ok(())
    }
}
