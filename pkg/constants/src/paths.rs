//! Filesystem path constants.

// ─── App data ─────────────────────────────────────────────────────────────

/// Directory under the user's home that holds all persisted state.
pub const APP_DIR: &str = ".winboat";

/// Persisted configuration file name inside `APP_DIR`.
pub const CONFIG_FILENAME: &str = "winboat.config.json";

// ─── Descriptors ──────────────────────────────────────────────────────────

/// Compose descriptor used by the Docker backend.
pub const DOCKER_COMPOSE_FILENAME: &str = "docker-compose.yml";

/// Compose descriptor used by the Podman backend.
pub const PODMAN_COMPOSE_FILENAME: &str = "podman-compose.yml";

/// Compose-shaped descriptor used by the native QEMU backend.
pub const QEMU_COMPOSE_FILENAME: &str = "qemu-compose.yml";

// ─── Native runtime ───────────────────────────────────────────────────────

/// Runtime directory (relative to the app dir) owned by the QEMU backend.
pub const QEMU_RUNTIME_DIR: &str = "qemu";

/// PID file of the spawned hypervisor process.
pub const QEMU_PID_FILENAME: &str = "qemu.pid";

/// Persisted forwarding table of the running hypervisor.
pub const QEMU_FORWARDS_FILENAME: &str = "forwards.json";

/// Guest disk image.
pub const QEMU_DISK_FILENAME: &str = "disk.qcow2";

/// Per-instance UEFI variable store (copied from the firmware template).
pub const QEMU_VARS_FILENAME: &str = "OVMF_VARS.fd";

/// Hypervisor stdout log.
pub const QEMU_STDOUT_LOG: &str = "qemu.stdout.log";

/// Hypervisor stderr log.
pub const QEMU_STDERR_LOG: &str = "qemu.stderr.log";

/// Directory searched first for UEFI firmware, relative to the app dir.
pub const FIRMWARE_DIR: &str = "firmware";

/// Well-known system locations of UEFI firmware (code, vars template) pairs.
pub const FIRMWARE_CANDIDATES: &[(&str, &str)] = &[
    (
        "/usr/share/OVMF/OVMF_CODE_4M.fd",
        "/usr/share/OVMF/OVMF_VARS_4M.fd",
    ),
    ("/usr/share/OVMF/OVMF_CODE.fd", "/usr/share/OVMF/OVMF_VARS.fd"),
    (
        "/usr/share/edk2/ovmf/OVMF_CODE.fd",
        "/usr/share/edk2/ovmf/OVMF_VARS.fd",
    ),
    (
        "/usr/share/edk2/x64/OVMF_CODE.4m.fd",
        "/usr/share/edk2/x64/OVMF_VARS.4m.fd",
    ),
    (
        "/opt/homebrew/share/qemu/edk2-x86_64-code.fd",
        "/opt/homebrew/share/qemu/edk2-i386-vars.fd",
    ),
    (
        "/usr/local/share/qemu/edk2-x86_64-code.fd",
        "/usr/local/share/qemu/edk2-i386-vars.fd",
    ),
];
