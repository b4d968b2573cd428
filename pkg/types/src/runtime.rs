use serde::{Deserialize, Serialize};

use pkg_constants::paths::{
    DOCKER_COMPOSE_FILENAME, PODMAN_COMPOSE_FILENAME, QEMU_COMPOSE_FILENAME,
};

/// Execution backend that hosts the guest instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Docker engine with `docker compose`.
    #[default]
    Docker,
    /// Podman engine with `podman-compose`.
    Podman,
    /// Native QEMU process, no container engine.
    Qemu,
}

impl RuntimeKind {
    pub const ALL: [RuntimeKind; 3] = [RuntimeKind::Docker, RuntimeKind::Podman, RuntimeKind::Qemu];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::Docker => "docker",
            RuntimeKind::Podman => "podman",
            RuntimeKind::Qemu => "qemu",
        }
    }

    /// Descriptor file owned by this backend.
    pub fn compose_filename(&self) -> &'static str {
        match self {
            RuntimeKind::Docker => DOCKER_COMPOSE_FILENAME,
            RuntimeKind::Podman => PODMAN_COMPOSE_FILENAME,
            RuntimeKind::Qemu => QEMU_COMPOSE_FILENAME,
        }
    }

    pub fn is_container_engine(&self) -> bool {
        !matches!(self, RuntimeKind::Qemu)
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RuntimeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(RuntimeKind::Docker),
            "podman" => Ok(RuntimeKind::Podman),
            "qemu" => Ok(RuntimeKind::Qemu),
            other => anyhow::bail!("unknown runtime '{}' (expected docker, podman or qemu)", other),
        }
    }
}

/// Normalized instance status shared by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeStatus {
    Created,
    Running,
    Paused,
    Exited,
    Unknown,
}

impl RuntimeStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, RuntimeStatus::Running)
    }
}

impl std::fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeStatus::Created => write!(f, "created"),
            RuntimeStatus::Running => write!(f, "running"),
            RuntimeStatus::Paused => write!(f, "paused"),
            RuntimeStatus::Exited => write!(f, "exited"),
            RuntimeStatus::Unknown => write!(f, "unknown"),
        }
    }
}
