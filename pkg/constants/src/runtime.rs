//! Runtime backend constants.

/// Container name used by both container engines.
pub const CONTAINER_NAME: &str = "WinBoat";

/// Compose project / instance name.
pub const INSTANCE_NAME: &str = "winboat";

/// Guest image run by the container engines.
pub const WINDOWS_IMAGE: &str = "ghcr.io/dockur/windows:latest";

/// Environment flag opting into the native QEMU backend.
pub const QEMU_OPT_IN_ENV: &str = "WINBOAT_EXPERIMENTAL_QEMU";

/// Tokens accepted as "on" for feature-flag environment variables.
pub const TRUTHY_TOKENS: &[&str] = &["1", "true", "yes"];

/// Upper bound on any single engine tool invocation, in seconds.
pub const TOOL_TIMEOUT_SECS: u64 = 30;

/// Upper bound on `compose up`, which may pull images, in seconds.
pub const COMPOSE_UP_TIMEOUT_SECS: u64 = 600;
