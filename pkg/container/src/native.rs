//! Native QEMU backend.
//!
//! Runs the guest as a detached `qemu-system-*` process without any
//! container engine. The runtime directory owns everything the instance
//! needs:
//!
//! ```text
//! ~/.winboat/qemu/
//! ├── qemu-compose.yml   # descriptor (compose shape)
//! ├── disk.qcow2         # guest disk, created on first start
//! ├── OVMF_VARS.fd       # per-instance UEFI vars, copied from the template
//! ├── qemu.pid           # PID of the running hypervisor
//! ├── forwards.json      # resolved host port table of the running hypervisor
//! └── qemu.{stdout,stderr}.log
//! ```
//!
//! Ports are forwarded with user-mode networking (`hostfwd`). The control
//! channel is not forwarded: QEMU itself listens for QMP on the resolved host
//! port of the guest QMP binding.

use std::collections::HashSet;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::sys::signal::Signal;
use tracing::{debug, info, warn};

use pkg_constants::network::{DEFAULT_HOST_ADDR, GUEST_QMP_PORT};
use pkg_constants::paths::{
    QEMU_DISK_FILENAME, QEMU_FORWARDS_FILENAME, QEMU_PID_FILENAME, QEMU_STDERR_LOG,
    QEMU_STDOUT_LOG, QEMU_VARS_FILENAME,
};
use pkg_constants::state::PORT_PROBE_TIMEOUT_MS;
use pkg_constants::vm::{
    DEFAULT_CPU_CORES, DEFAULT_DISK_SIZE, DEFAULT_RAM_SIZE, DEFAULT_STOP_GRACE_SECS,
    KILL_WAIT_MS, STOP_POLL_INTERVAL_MS,
};
use pkg_network::probe::{ephemeral_port, first_available_in_range};
use pkg_types::compose::{ENV_BOOT_ISO, ENV_CPU_CORES, ENV_DISK_SIZE, ENV_RAM_SIZE, InstanceDescriptor};
use pkg_types::error::RuntimeError;
use pkg_types::fsutil::write_atomic;
use pkg_types::port::{HostPort, PortBinding, Protocol, ResolvedPortBinding};
use pkg_types::runtime::{RuntimeKind, RuntimeStatus};

use crate::backend::{ComposeDirection, HostProbe, LifecycleAction, PortCache, RuntimeManager};
use crate::firmware::{FirmwareLocator, FirmwarePair, ensure_vars};
use crate::host::{Accelerator, tuned_default};
use crate::process::{
    find_binary, is_process_alive, read_pid, remove_pid, run_tool_checked, send_signal, write_pid,
};

/// How long a freshly spawned hypervisor must survive before start succeeds.
const SPAWN_SETTLE: Duration = Duration::from_millis(300);

/// Resolved host programs and firmware for one start.
#[derive(Debug, Clone)]
pub struct QemuTooling {
    pub qemu: PathBuf,
    pub qemu_img: PathBuf,
    pub firmware: FirmwarePair,
    pub accelerator: Accelerator,
}

/// Native hypervisor backend.
pub struct NativeBackend {
    runtime_dir: PathBuf,
    app_dir: PathBuf,
    tooling: Option<QemuTooling>,
    stop_grace: Duration,
    /// Handle of a process this launcher spawned; lets liveness checks reap it.
    child: Mutex<Option<Child>>,
    cache: PortCache,
    signaller: fn(u32, Signal) -> Result<()>,
}

impl NativeBackend {
    /// `runtime_dir` holds the instance files; `app_dir` is searched for a
    /// firmware override.
    pub fn new(runtime_dir: &Path, app_dir: &Path) -> Self {
        Self {
            runtime_dir: runtime_dir.to_path_buf(),
            app_dir: app_dir.to_path_buf(),
            tooling: None,
            stop_grace: Duration::from_secs(DEFAULT_STOP_GRACE_SECS),
            child: Mutex::new(None),
            cache: PortCache::default(),
            signaller: send_signal,
        }
    }

    /// Use fixed programs instead of discovering them.
    pub fn with_tooling(mut self, tooling: QemuTooling) -> Self {
        self.tooling = Some(tooling);
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    fn pid_path(&self) -> PathBuf {
        self.runtime_dir.join(QEMU_PID_FILENAME)
    }

    fn forwards_path(&self) -> PathBuf {
        self.runtime_dir.join(QEMU_FORWARDS_FILENAME)
    }

    fn disk_path(&self) -> PathBuf {
        self.runtime_dir.join(QEMU_DISK_FILENAME)
    }

    fn vars_path(&self) -> PathBuf {
        self.runtime_dir.join(QEMU_VARS_FILENAME)
    }

    /// Whether `pid` is alive. Our own child is checked with `try_wait` so an
    /// exited-but-unreaped process is not mistaken for a live one.
    fn pid_alive(&self, pid: u32) -> bool {
        if let Ok(mut guard) = self.child.lock()
            && let Some(child) = guard.as_mut()
            && child.id() == pid
        {
            return match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    debug!("[qemu] pid {} exited with {}", pid, status);
                    *guard = None;
                    false
                }
                Err(e) => {
                    warn!("[qemu] try_wait on pid {} failed: {}", pid, e);
                    is_process_alive(pid)
                }
            };
        }
        is_process_alive(pid)
    }

    /// PID of a live hypervisor. A PID file pointing at a dead process is
    /// removed on the way.
    fn live_pid(&self) -> Option<u32> {
        let pid = read_pid(&self.pid_path())?;
        if self.pid_alive(pid) {
            Some(pid)
        } else {
            info!("[qemu] discarding stale PID file (pid {})", pid);
            self.clear_runtime_state();
            None
        }
    }

    fn clear_runtime_state(&self) {
        remove_pid(&self.pid_path());
        remove_pid(&self.forwards_path());
        self.cache.invalidate();
    }

    /// Find the hypervisor, disk tool and firmware, failing fast on the first
    /// missing one.
    pub async fn resolve_tooling(&self) -> Result<QemuTooling> {
        if let Some(t) = &self.tooling {
            return Ok(t.clone());
        }
        let qemu_name = qemu_binary_name();
        let qemu = find_binary(qemu_name, &homebrew_fallbacks(qemu_name))
            .await
            .ok_or_else(|| RuntimeError::missing(qemu_name))?;
        let qemu_img = find_binary("qemu-img", &homebrew_fallbacks("qemu-img"))
            .await
            .ok_or_else(|| RuntimeError::missing("qemu-img"))?;
        let firmware = FirmwareLocator::new(&self.app_dir).locate()?;
        Ok(QemuTooling {
            qemu,
            qemu_img,
            firmware,
            accelerator: Accelerator::detect().await,
        })
    }

    /// Probe the host for QEMU tooling. Diagnostics only.
    pub async fn host_probe(app_dir: &Path) -> HostProbe {
        let qemu_name = qemu_binary_name();
        let (code, vars) = FirmwareLocator::new(app_dir).probe();
        HostProbe {
            hypervisor: Some(
                find_binary(qemu_name, &homebrew_fallbacks(qemu_name))
                    .await
                    .is_some(),
            ),
            disk_tool: Some(
                find_binary("qemu-img", &homebrew_fallbacks("qemu-img"))
                    .await
                    .is_some(),
            ),
            firmware_code: Some(code),
            firmware_vars: Some(vars),
            acceleration: Some(Accelerator::detect().await.is_hardware()),
            ..Default::default()
        }
    }

    async fn ensure_disk(&self, tooling: &QemuTooling, descriptor: &InstanceDescriptor) -> Result<()> {
        let disk = self.disk_path();
        if disk.exists() {
            return Ok(());
        }
        let size = descriptor.env(ENV_DISK_SIZE).unwrap_or(DEFAULT_DISK_SIZE);
        info!("[qemu] creating {} disk at {}", size, disk.display());
        let disk_arg = disk.to_string_lossy().to_string();
        run_tool_checked(
            &tooling.qemu_img,
            &["create", "-f", "qcow2", disk_arg.as_str(), size],
            Duration::from_secs(60),
        )
        .await
        .context("failed to create guest disk")?;
        Ok(())
    }

    fn spawn(&self, tooling: &QemuTooling, args: &[String]) -> Result<Child> {
        let stdout = std::fs::File::create(self.runtime_dir.join(QEMU_STDOUT_LOG))?;
        let stderr = std::fs::File::create(self.runtime_dir.join(QEMU_STDERR_LOG))?;

        let mut cmd = std::process::Command::new(&tooling.qemu);
        cmd.args(args)
            .current_dir(&self.runtime_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            // Own process group: a Ctrl-C aimed at the launcher must not reach the guest.
            .process_group(0);

        cmd.spawn().map_err(|source| -> anyhow::Error {
            if source.kind() == std::io::ErrorKind::NotFound {
                RuntimeError::missing(tooling.qemu.display().to_string()).into()
            } else {
                RuntimeError::ProcessLifecycle {
                    action: format!("spawning {}", tooling.qemu.display()),
                    source,
                }
                .into()
            }
        })
    }

    fn stderr_tail(&self) -> String {
        let text = std::fs::read_to_string(self.runtime_dir.join(QEMU_STDERR_LOG)).unwrap_or_default();
        let lines: Vec<&str> = text.lines().collect();
        lines[lines.len().saturating_sub(5)..].join("\n")
    }

    async fn start(&self, extra_args: &[String]) -> Result<()> {
        if self.live_pid().is_some() {
            info!("[qemu] already running");
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.runtime_dir).await?;
        let descriptor = self.ensure_descriptor().await?;
        let tooling = self.resolve_tooling().await?;

        ensure_vars(&tooling.firmware, &self.vars_path())?;
        self.ensure_disk(&tooling, &descriptor).await?;

        let forwards = resolve_forwards(&descriptor.port_bindings()).await?;
        let mut args = build_args(
            &descriptor,
            &tooling,
            &forwards,
            &self.disk_path(),
            &self.vars_path(),
        );
        args.extend(extra_args.iter().cloned());
        debug!("[qemu] argv: {:?}", args);

        let mut child = self.spawn(&tooling, &args)?;
        let pid = child.id();
        if let Err(e) = write_pid(&self.pid_path(), pid) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }

        tokio::time::sleep(SPAWN_SETTLE).await;
        if let Ok(Some(status)) = child.try_wait() {
            self.clear_runtime_state();
            anyhow::bail!(
                "qemu exited immediately ({}): {}",
                status,
                self.stderr_tail()
            );
        }

        write_atomic(
            &self.forwards_path(),
            serde_json::to_string_pretty(&forwards)?.as_bytes(),
        )?;
        self.cache.set(forwards.clone());
        if let Ok(mut guard) = self.child.lock() {
            *guard = Some(child);
        }

        info!(
            "[qemu] started (pid={}, accel={}, forwards={})",
            pid,
            tooling.accelerator.as_str(),
            forwards.len()
        );
        Ok(())
    }

    /// SIGTERM, wait up to the grace period, then SIGKILL. The PID file is
    /// removed whichever way the process ended.
    async fn stop(&self) -> Result<()> {
        let Some(pid) = read_pid(&self.pid_path()) else {
            debug!("[qemu] no PID file, nothing to stop");
            self.cache.invalidate();
            return Ok(());
        };
        if !self.pid_alive(pid) {
            info!("[qemu] pid {} already gone", pid);
            self.clear_runtime_state();
            return Ok(());
        }

        info!("[qemu] stopping pid {} (grace {:?})", pid, self.stop_grace);
        let poll = Duration::from_millis(STOP_POLL_INTERVAL_MS);
        match (self.signaller)(pid, Signal::SIGTERM) {
            Ok(()) => {
                let deadline = tokio::time::Instant::now() + self.stop_grace;
                while tokio::time::Instant::now() < deadline {
                    if !self.pid_alive(pid) {
                        info!("[qemu] pid {} exited after SIGTERM", pid);
                        self.clear_runtime_state();
                        return Ok(());
                    }
                    tokio::time::sleep(poll).await;
                }
                warn!("[qemu] pid {} ignored SIGTERM, sending SIGKILL", pid);
            }
            Err(e) => warn!("[qemu] SIGTERM to pid {} failed ({}), sending SIGKILL", pid, e),
        }

        let kill_result = (self.signaller)(pid, Signal::SIGKILL);
        let kill_deadline = tokio::time::Instant::now() + Duration::from_millis(KILL_WAIT_MS);
        while self.pid_alive(pid) && tokio::time::Instant::now() < kill_deadline {
            tokio::time::sleep(poll).await;
        }
        self.clear_runtime_state();
        if let Ok(mut guard) = self.child.lock() {
            *guard = None;
        }
        kill_result
    }

    fn signal_running(&self, signal: Signal) -> Result<()> {
        let pid = self
            .live_pid()
            .ok_or_else(|| anyhow::anyhow!("qemu is not running"))?;
        (self.signaller)(pid, signal)
    }

    fn read_forwards(&self) -> Result<Vec<ResolvedPortBinding>> {
        let text = std::fs::read_to_string(self.forwards_path())
            .with_context(|| format!("failed to read {}", self.forwards_path().display()))?;
        Ok(serde_json::from_str(&text)?)
    }
}

fn qemu_binary_name() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => "qemu-system-aarch64",
        _ => "qemu-system-x86_64",
    }
}

fn homebrew_fallbacks(name: &str) -> Vec<PathBuf> {
    vec![
        PathBuf::from(format!("/opt/homebrew/bin/{}", name)),
        PathBuf::from(format!("/usr/local/bin/{}", name)),
    ]
}

/// Turn declared bindings into concrete host ports: fixed as declared, ranges
/// to their first bindable port, dynamic to an OS-assigned port. The same
/// host port is never handed out twice for one protocol.
pub async fn resolve_forwards(bindings: &[PortBinding]) -> Result<Vec<ResolvedPortBinding>> {
    let timeout = Duration::from_millis(PORT_PROBE_TIMEOUT_MS);
    let mut used: HashSet<(Protocol, u16)> = HashSet::new();
    let mut out = Vec::new();

    for b in bindings {
        let addr = b
            .host_address
            .clone()
            .unwrap_or_else(|| DEFAULT_HOST_ADDR.to_string());
        let host_port = match b.host_port {
            HostPort::Fixed(p) => p,
            HostPort::Range(lo, hi) => {
                let mut found = None;
                let mut start = lo;
                while start <= hi {
                    match first_available_in_range(&addr, start, hi, b.protocol, timeout).await {
                        Some(p) if used.contains(&(b.protocol, p)) => {
                            if p == u16::MAX {
                                break;
                            }
                            start = p + 1;
                        }
                        other => {
                            found = other;
                            break;
                        }
                    }
                }
                found.ok_or_else(|| {
                    anyhow::anyhow!(
                        "no free host port in {}-{} for {}/{}",
                        lo,
                        hi,
                        b.container_port,
                        b.protocol
                    )
                })?
            }
            HostPort::Dynamic => ephemeral_port(&addr, b.protocol).await?,
        };
        used.insert((b.protocol, host_port));
        out.push(ResolvedPortBinding {
            host_address: Some(addr),
            host_port,
            container_port: b.container_port,
            protocol: b.protocol,
        });
    }
    Ok(out)
}

/// Hypervisor argv for `descriptor`.
pub fn build_args(
    descriptor: &InstanceDescriptor,
    tooling: &QemuTooling,
    forwards: &[ResolvedPortBinding],
    disk: &Path,
    vars: &Path,
) -> Vec<String> {
    let accel = tooling.accelerator;
    let machine = match std::env::consts::ARCH {
        "aarch64" => "virt",
        _ => "q35",
    };
    let cpu = if accel.is_hardware() { "host" } else { "max" };
    let cores = descriptor
        .env(ENV_CPU_CORES)
        .map(str::to_string)
        .unwrap_or_else(|| DEFAULT_CPU_CORES.to_string());
    let ram = descriptor.env(ENV_RAM_SIZE).unwrap_or(DEFAULT_RAM_SIZE);

    let mut args: Vec<String> = vec![
        "-name".into(),
        descriptor.name.clone(),
        "-machine".into(),
        format!("{},accel={}", machine, accel.as_str()),
        "-cpu".into(),
        cpu.into(),
        "-smp".into(),
        cores,
        "-m".into(),
        ram.to_string(),
        "-drive".into(),
        format!(
            "if=pflash,format=raw,readonly=on,file={}",
            tooling.firmware.code.display()
        ),
        "-drive".into(),
        format!("if=pflash,format=raw,file={}", vars.display()),
        "-drive".into(),
        format!("file={},if=virtio,format=qcow2", disk.display()),
    ];

    let hostfwd: Vec<String> = forwards
        .iter()
        .filter(|f| f.container_port != GUEST_QMP_PORT)
        .map(|f| {
            format!(
                "hostfwd={}:{}:{}-:{}",
                f.protocol,
                f.host_address.as_deref().unwrap_or(DEFAULT_HOST_ADDR),
                f.host_port,
                f.container_port
            )
        })
        .collect();
    let mut netdev = "user,id=net0".to_string();
    for h in &hostfwd {
        netdev.push(',');
        netdev.push_str(h);
    }
    args.extend([
        "-netdev".into(),
        netdev,
        "-device".into(),
        "virtio-net-pci,netdev=net0".into(),
    ]);

    if let Some(qmp) = forwards
        .iter()
        .find(|f| f.container_port == GUEST_QMP_PORT && f.protocol == Protocol::Tcp)
    {
        args.extend([
            "-qmp".into(),
            format!(
                "tcp:{}:{},server=on,wait=off",
                qmp.host_address.as_deref().unwrap_or(DEFAULT_HOST_ADDR),
                qmp.host_port
            ),
        ]);
    }

    args.extend(["-device".into(), "qemu-xhci,id=xhci".into()]);

    if let Some(iso) = descriptor.env(ENV_BOOT_ISO) {
        args.extend(["-cdrom".into(), iso.to_string()]);
    }
    args.extend(["-display".into(), "none".into()]);
    args
}

#[async_trait]
impl RuntimeManager for NativeBackend {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Qemu
    }

    fn descriptor_path(&self) -> PathBuf {
        self.runtime_dir.join(RuntimeKind::Qemu.compose_filename())
    }

    fn default_descriptor(&self) -> InstanceDescriptor {
        tuned_default(RuntimeKind::Qemu)
    }

    async fn apply(&self, direction: ComposeDirection, extra_args: &[String]) -> Result<()> {
        match direction {
            ComposeDirection::Up => self.start(extra_args).await,
            ComposeDirection::Down => self.stop().await,
        }
    }

    async fn lifecycle(&self, action: LifecycleAction) -> Result<()> {
        info!("[qemu] {}", action);
        match action {
            LifecycleAction::Start => self.start(&[]).await,
            LifecycleAction::Stop => self.stop().await,
            LifecycleAction::Restart => {
                self.stop().await?;
                self.start(&[]).await
            }
            LifecycleAction::Pause => self.signal_running(Signal::SIGSTOP),
            LifecycleAction::Unpause => self.signal_running(Signal::SIGCONT),
        }
    }

    async fn status(&self) -> RuntimeStatus {
        if self.live_pid().is_some() {
            RuntimeStatus::Running
        } else {
            self.cache.invalidate();
            RuntimeStatus::Exited
        }
    }

    async fn refresh_ports(&self) -> Vec<ResolvedPortBinding> {
        match self.read_forwards() {
            Ok(ports) => {
                self.cache.set(ports.clone());
                ports
            }
            Err(e) => {
                warn!("[qemu] forwarding table unavailable: {}", e);
                self.cache.invalidate();
                Vec::new()
            }
        }
    }

    fn cached_ports(&self) -> Vec<ResolvedPortBinding> {
        self.cache.get()
    }

    async fn exists(&self) -> bool {
        tokio::fs::metadata(self.descriptor_path()).await.is_ok()
            || tokio::fs::metadata(self.disk_path()).await.is_ok()
    }

    async fn remove(&self) -> Result<()> {
        if tokio::fs::metadata(&self.runtime_dir).await.is_err() {
            info!("[qemu] nothing to remove at {}", self.runtime_dir.display());
            return Ok(());
        }
        self.stop().await?;
        tokio::fs::remove_dir_all(&self.runtime_dir)
            .await
            .with_context(|| format!("failed to remove {}", self.runtime_dir.display()))?;
        info!("[qemu] removed {}", self.runtime_dir.display());
        Ok(())
    }
}
