//! Native hypervisor (QEMU) defaults.

/// Default guest memory.
pub const DEFAULT_RAM_SIZE: &str = "4G";

/// Default guest vCPU count.
pub const DEFAULT_CPU_CORES: u32 = 4;

/// Default guest disk size passed to `qemu-img create`.
pub const DEFAULT_DISK_SIZE: &str = "64G";

/// Grace period between SIGTERM and SIGKILL, in seconds.
pub const DEFAULT_STOP_GRACE_SECS: u64 = 30;

/// Interval between liveness checks while waiting for exit, in milliseconds.
pub const STOP_POLL_INTERVAL_MS: u64 = 200;

/// How long to wait for the process to disappear after SIGKILL, in milliseconds.
pub const KILL_WAIT_MS: u64 = 2000;
