//! Host facts used to pick accelerators and size the guest.

use std::path::Path;

use sysinfo::System;
use tracing::debug;

use pkg_constants::vm::{DEFAULT_CPU_CORES, DEFAULT_RAM_SIZE};
use pkg_types::compose::{ENV_CPU_CORES, ENV_RAM_SIZE, InstanceDescriptor};
use pkg_types::runtime::RuntimeKind;

const GIB: u64 = 1024 * 1024 * 1024;

/// Hardware virtualization available to the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accelerator {
    Kvm,
    Hvf,
    /// Pure emulation.
    Tcg,
}

impl Accelerator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Accelerator::Kvm => "kvm",
            Accelerator::Hvf => "hvf",
            Accelerator::Tcg => "tcg",
        }
    }

    pub fn is_hardware(&self) -> bool {
        !matches!(self, Accelerator::Tcg)
    }

    pub async fn detect() -> Self {
        if cfg!(target_os = "linux") {
            if Path::new("/dev/kvm").exists() {
                return Accelerator::Kvm;
            }
        } else if cfg!(target_os = "macos")
            && let Ok(out) = tokio::process::Command::new("sysctl")
                .args(["-n", "kern.hv_support"])
                .output()
                .await
            && String::from_utf8_lossy(&out.stdout).trim() == "1"
        {
            return Accelerator::Hvf;
        }
        Accelerator::Tcg
    }
}

/// Memory and CPU available on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostResources {
    pub total_memory_bytes: u64,
    pub cpu_count: u32,
}

impl HostResources {
    pub fn detect() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        let res = Self {
            total_memory_bytes: sys.total_memory(),
            cpu_count,
        };
        debug!(
            "host resources: {} GiB RAM, {} CPUs",
            res.total_memory_bytes / GIB,
            res.cpu_count
        );
        res
    }
}

/// Shrink default guest sizing on small hosts. Values a user changed are
/// left alone.
pub fn tune_for_host(descriptor: &mut InstanceDescriptor, res: &HostResources) {
    if descriptor.env(ENV_RAM_SIZE) == Some(DEFAULT_RAM_SIZE) && res.total_memory_bytes > 0 {
        let host_gib = res.total_memory_bytes / GIB;
        if host_gib < 8 {
            let guest = (host_gib / 2).max(2);
            descriptor.set_env(ENV_RAM_SIZE, format!("{}G", guest));
        }
    }
    let default_cores = DEFAULT_CPU_CORES.to_string();
    if descriptor.env(ENV_CPU_CORES) == Some(default_cores.as_str())
        && res.cpu_count < DEFAULT_CPU_CORES
    {
        descriptor.set_env(ENV_CPU_CORES, res.cpu_count.max(1).to_string());
    }
}

/// Default descriptor for `kind`, sized for this host.
pub fn tuned_default(kind: RuntimeKind) -> InstanceDescriptor {
    let mut d = InstanceDescriptor::default_for(kind);
    tune_for_host(&mut d, &HostResources::detect());
    d
}
