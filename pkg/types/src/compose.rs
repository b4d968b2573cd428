//! Compose-shaped instance descriptor.
//!
//! Every backend persists its instance definition as a compose file. The
//! container engines hand it to their compose tool; the native backend reads
//! the same shape and turns it into hypervisor arguments.
//!
//! Example (`docker-compose.yml`):
//! ```yaml
//! name: winboat
//! services:
//!   windows:
//!     image: ghcr.io/dockur/windows:latest
//!     container_name: WinBoat
//!     environment:
//!       RAM_SIZE: 4G
//!     ports:
//!       - 127.0.0.1:47290-47299:7149
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};

use pkg_constants::network::{
    DEFAULT_HOST_ADDR, GUEST_API_PORT, GUEST_API_PORT_RANGE, GUEST_NOVNC_PORT, GUEST_QMP_PORT,
    GUEST_RDP_PORT, NOVNC_PORT_RANGE, QMP_PORT_RANGE, RDP_PORT_RANGE,
};
use pkg_constants::runtime::{CONTAINER_NAME, INSTANCE_NAME, WINDOWS_IMAGE};
use pkg_constants::vm::{DEFAULT_CPU_CORES, DEFAULT_DISK_SIZE, DEFAULT_RAM_SIZE};

use crate::error::RuntimeError;
use crate::fsutil::write_atomic;
use crate::port::{HostPort, PortBinding, PortSpec, Protocol};
use crate::runtime::RuntimeKind;

// ─── Environment keys ───────────────────────────────────────────────────────

pub const ENV_RAM_SIZE: &str = "RAM_SIZE";
pub const ENV_CPU_CORES: &str = "CPU_CORES";
pub const ENV_DISK_SIZE: &str = "DISK_SIZE";
pub const ENV_BOOT_ISO: &str = "BOOT_ISO";
pub const ENV_ARGUMENTS: &str = "ARGUMENTS";
pub const ENV_HOST_PORTS: &str = "HOST_PORTS";

/// Container restart policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    No,
    Always,
    OnFailure,
    UnlessStopped,
}

/// The single guest service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub image: String,
    #[serde(default = "default_container_name")]
    pub container_name: String,
    #[serde(default, deserialize_with = "deserialize_environment")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cap_add: Vec<String>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    #[serde(default)]
    pub restart: RestartPolicy,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_grace_period: Option<String>,
}

fn default_container_name() -> String {
    CONTAINER_NAME.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Services {
    pub windows: ServiceSpec,
}

/// Declarative instance definition (compose shape).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    #[serde(default = "default_instance_name")]
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, Option<serde_yaml::Value>>,
    pub services: Services,
}

fn default_instance_name() -> String {
    INSTANCE_NAME.to_string()
}

/// Compose accepts both `KEY: value` maps (with scalar values) and `KEY=value` lists.
fn deserialize_environment<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Env {
        Map(BTreeMap<String, Option<serde_yaml::Value>>),
        List(Vec<String>),
    }

    let scalar = |v: serde_yaml::Value| -> Result<String, D::Error> {
        match v {
            serde_yaml::Value::String(s) => Ok(s),
            serde_yaml::Value::Number(n) => Ok(n.to_string()),
            serde_yaml::Value::Bool(b) => Ok(b.to_string()),
            serde_yaml::Value::Null => Ok(String::new()),
            other => Err(serde::de::Error::custom(format!(
                "environment values must be scalars, got {:?}",
                other
            ))),
        }
    };

    match Env::deserialize(deserializer)? {
        Env::Map(m) => m
            .into_iter()
            .map(|(k, v)| Ok((k, scalar(v.unwrap_or(serde_yaml::Value::Null))?)))
            .collect(),
        Env::List(items) => Ok(items
            .into_iter()
            .map(|item| match item.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (item, String::new()),
            })
            .collect()),
    }
}

fn ranged(range: (u16, u16), container_port: u16, protocol: Protocol) -> PortSpec {
    PortSpec::short(
        PortBinding::new(HostPort::Range(range.0, range.1), container_port, protocol)
            .with_address(DEFAULT_HOST_ADDR),
    )
}

fn dynamic(container_port: u16, protocol: Protocol) -> PortSpec {
    PortSpec::short(
        PortBinding::new(HostPort::Dynamic, container_port, protocol)
            .with_address(DEFAULT_HOST_ADDR),
    )
}

fn base_environment() -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("VERSION".to_string(), "11".to_string());
    env.insert(ENV_RAM_SIZE.to_string(), DEFAULT_RAM_SIZE.to_string());
    env.insert(ENV_CPU_CORES.to_string(), DEFAULT_CPU_CORES.to_string());
    env.insert(ENV_DISK_SIZE.to_string(), DEFAULT_DISK_SIZE.to_string());
    env
}

impl InstanceDescriptor {
    /// Seed descriptor for a fresh instance on `kind`.
    pub fn default_for(kind: RuntimeKind) -> Self {
        let mut environment = base_environment();
        let mut volumes = BTreeMap::new();
        let mut service_volumes = Vec::new();
        let mut devices = Vec::new();
        let mut cap_add = Vec::new();
        let mut privileged = false;
        let mut restart = RestartPolicy::No;

        let ports = match kind {
            RuntimeKind::Docker | RuntimeKind::Podman => {
                environment.insert(ENV_HOST_PORTS.to_string(), GUEST_QMP_PORT.to_string());
                environment.insert(
                    ENV_ARGUMENTS.to_string(),
                    format!("-qmp tcp:0.0.0.0:{},server,wait=off", GUEST_QMP_PORT),
                );
                volumes.insert("data".to_string(), None);
                service_volumes.push("data:/storage".to_string());
                service_volumes.push("./oem:/oem".to_string());
                devices.push("/dev/kvm".to_string());
                cap_add.push("NET_ADMIN".to_string());
                privileged = true;
                restart = RestartPolicy::OnFailure;

                if kind == RuntimeKind::Docker {
                    service_volumes.push("/dev/bus/usb:/dev/bus/usb".to_string());
                    vec![
                        ranged(NOVNC_PORT_RANGE, GUEST_NOVNC_PORT, Protocol::Tcp),
                        ranged(GUEST_API_PORT_RANGE, GUEST_API_PORT, Protocol::Tcp),
                        ranged(QMP_PORT_RANGE, GUEST_QMP_PORT, Protocol::Tcp),
                        ranged(RDP_PORT_RANGE, GUEST_RDP_PORT, Protocol::Tcp),
                        ranged(RDP_PORT_RANGE, GUEST_RDP_PORT, Protocol::Udp),
                    ]
                } else {
                    // podman-compose does not accept host port ranges.
                    vec![
                        dynamic(GUEST_NOVNC_PORT, Protocol::Tcp),
                        dynamic(GUEST_API_PORT, Protocol::Tcp),
                        dynamic(GUEST_QMP_PORT, Protocol::Tcp),
                        dynamic(GUEST_RDP_PORT, Protocol::Tcp),
                        dynamic(GUEST_RDP_PORT, Protocol::Udp),
                    ]
                }
            }
            RuntimeKind::Qemu => vec![
                ranged(GUEST_API_PORT_RANGE, GUEST_API_PORT, Protocol::Tcp),
                ranged(QMP_PORT_RANGE, GUEST_QMP_PORT, Protocol::Tcp),
                ranged(RDP_PORT_RANGE, GUEST_RDP_PORT, Protocol::Tcp),
            ],
        };

        Self {
            name: INSTANCE_NAME.to_string(),
            volumes,
            services: Services {
                windows: ServiceSpec {
                    image: WINDOWS_IMAGE.to_string(),
                    container_name: CONTAINER_NAME.to_string(),
                    environment,
                    cap_add,
                    privileged,
                    ports,
                    restart,
                    volumes: service_volumes,
                    devices,
                    stop_grace_period: Some("120s".to_string()),
                },
            },
        }
    }

    pub fn service(&self) -> &ServiceSpec {
        &self.services.windows
    }

    pub fn service_mut(&mut self) -> &mut ServiceSpec {
        &mut self.services.windows
    }

    pub fn container_name(&self) -> &str {
        &self.services.windows.container_name
    }

    pub fn env(&self, key: &str) -> Option<&str> {
        self.services
            .windows
            .environment
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn set_env(&mut self, key: &str, value: impl Into<String>) {
        self.services
            .windows
            .environment
            .insert(key.to_string(), value.into());
    }

    /// Declared bindings, in descriptor order.
    pub fn port_bindings(&self) -> Vec<PortBinding> {
        self.services
            .windows
            .ports
            .iter()
            .map(|s| s.binding.clone())
            .collect()
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Read a descriptor file. A missing file is an error: backends seed one
    /// explicitly with [`InstanceDescriptor::default_for`].
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RuntimeError::Descriptor {
                    path: path.to_path_buf(),
                    reason: "not found".to_string(),
                }
                .into());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        Self::from_yaml(&text).map_err(|e| {
            RuntimeError::Descriptor {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Persist atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, self.to_yaml()?.as_bytes())
    }
}
