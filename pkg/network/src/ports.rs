use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info};

use pkg_constants::network::DEFAULT_HOST_ADDR;
use pkg_constants::state::PORT_PROBE_TIMEOUT_MS;
use pkg_types::compose::InstanceDescriptor;
use pkg_types::port::{HostPort, PortBinding, PortSpec, Protocol, ResolvedPortBinding};

use crate::probe::check_port_available;

/// Options for [`PortMapper::set_binding`].
#[derive(Debug, Clone, Default)]
pub struct SetBindingOptions {
    pub protocol: Protocol,
    /// `None` keeps the address of an existing entry.
    pub host_address: Option<String>,
}

impl SetBindingOptions {
    pub fn udp() -> Self {
        Self {
            protocol: Protocol::Udp,
            host_address: None,
        }
    }
}

/// Declared port bindings of one instance plus their last resolution.
///
/// Declarations may be fixed, ranged or dynamic; resolution replaces them with
/// the concrete host ports a running backend reports.
#[derive(Debug, Clone, Default)]
pub struct PortMapper {
    specs: Vec<PortSpec>,
    resolved: Vec<ResolvedPortBinding>,
}

impl PortMapper {
    pub fn new(specs: Vec<PortSpec>) -> Self {
        Self {
            specs,
            resolved: Vec::new(),
        }
    }

    pub fn from_descriptor(descriptor: &InstanceDescriptor) -> Self {
        Self::new(descriptor.service().ports.clone())
    }

    /// Build from short tokens; the first malformed token aborts.
    pub fn parse_tokens<S: AsRef<str>>(tokens: &[S]) -> Result<Self> {
        let specs = tokens
            .iter()
            .map(|t| PortSpec::parse(t.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(specs))
    }

    pub fn specs(&self) -> &[PortSpec] {
        &self.specs
    }

    pub fn bindings(&self) -> impl Iterator<Item = &PortBinding> {
        self.specs.iter().map(|s| &s.binding)
    }

    pub fn to_tokens(&self) -> Vec<String> {
        self.bindings().map(PortBinding::to_token).collect()
    }

    /// Replace the descriptor's ports with this mapper's declarations.
    pub fn write_into(&self, descriptor: &mut InstanceDescriptor) {
        descriptor.service_mut().ports = self.specs.clone();
    }

    /// First declaration for `container_port`/`protocol`.
    pub fn get_binding(&self, container_port: u16, protocol: Protocol) -> Option<&PortBinding> {
        self.bindings()
            .find(|b| b.container_port == container_port && b.protocol == protocol)
    }

    /// Replace the declaration for `container_port`/`opts.protocol` in place, or
    /// append one. Setting the same value twice leaves a single entry.
    pub fn set_binding(&mut self, container_port: u16, host_port: HostPort, opts: SetBindingOptions) {
        let existing = self.specs.iter_mut().find(|s| {
            s.binding.container_port == container_port && s.binding.protocol == opts.protocol
        });
        match existing {
            Some(spec) => {
                spec.binding.host_port = host_port;
                if opts.host_address.is_some() {
                    spec.binding.host_address = opts.host_address;
                }
            }
            None => {
                let mut binding = PortBinding::new(host_port, container_port, opts.protocol);
                binding.host_address = opts.host_address;
                self.specs.push(PortSpec::short(binding));
            }
        }
        // A changed declaration may no longer admit the old resolution.
        self.resolved
            .retain(|r| !(r.container_port == container_port && r.protocol == opts.protocol));
    }

    /// Accept a user-chosen fixed host port only if it is bindable right now.
    /// On conflict the mapper is left unchanged and a `PortConflict` is returned.
    pub async fn set_fixed_binding_checked(
        &mut self,
        container_port: u16,
        host_port: u16,
        opts: SetBindingOptions,
    ) -> Result<()> {
        let addr = opts
            .host_address
            .clone()
            .or_else(|| {
                self.get_binding(container_port, opts.protocol)
                    .and_then(|b| b.host_address.clone())
            })
            .unwrap_or_else(|| DEFAULT_HOST_ADDR.to_string());

        let already = self
            .get_binding(container_port, opts.protocol)
            .is_some_and(|b| b.host_port == HostPort::Fixed(host_port));
        if !already {
            check_port_available(
                &addr,
                host_port,
                opts.protocol,
                Duration::from_millis(PORT_PROBE_TIMEOUT_MS),
            )
            .await?;
        }

        let protocol = opts.protocol;
        self.set_binding(container_port, HostPort::Fixed(host_port), opts);
        info!(
            "[ports] {}/{} pinned to {}:{}",
            container_port, protocol, addr, host_port
        );
        Ok(())
    }

    /// Resolve declarations against a backend report. Reports that no
    /// declaration admits are ignored. Returns the number accepted.
    pub fn apply_resolved(&mut self, reports: &[ResolvedPortBinding]) -> usize {
        let mut accepted = Vec::new();
        for report in reports {
            if self.bindings().any(|b| b.admits(report)) {
                if !accepted.contains(report) {
                    accepted.push(report.clone());
                }
            } else {
                debug!("[ports] ignoring undeclared report {}", report);
            }
        }
        let n = accepted.len();
        self.resolved = accepted;
        n
    }

    pub fn clear_resolved(&mut self) {
        self.resolved.clear();
    }

    pub fn resolved(&self) -> &[ResolvedPortBinding] {
        &self.resolved
    }

    pub fn get_resolved_binding(
        &self,
        container_port: u16,
        protocol: Protocol,
    ) -> Option<&ResolvedPortBinding> {
        self.resolved
            .iter()
            .find(|r| r.container_port == container_port && r.protocol == protocol)
    }

    /// Concrete TCP host port currently serving `container_port`.
    pub fn get_resolved_port(&self, container_port: u16) -> Option<u16> {
        self.get_resolved_binding(container_port, Protocol::Tcp)
            .map(|r| r.host_port)
    }

    /// Address and TCP port a host-side client connects to for
    /// `container_port`. Wildcard bind addresses are reached through loopback.
    pub fn get_resolved_endpoint(&self, container_port: u16) -> Option<(String, u16)> {
        let binding = self.get_resolved_binding(container_port, Protocol::Tcp)?;
        let host = match binding.host_address.as_deref() {
            None | Some("") | Some("0.0.0.0") | Some("::") | Some("[::]") => DEFAULT_HOST_ADDR,
            Some(addr) => addr,
        };
        Some((host.to_string(), binding.host_port))
    }
}
