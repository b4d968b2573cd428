//! Runtime capability resolution.
//!
//! `resolve` is a pure function of the runtime kind, the host profile and the
//! feature flags. Nothing here is persisted.

use serde::{Deserialize, Serialize};

use pkg_constants::runtime::{QEMU_OPT_IN_ENV, TRUTHY_TOKENS};

use crate::runtime::RuntimeKind;

/// Host operating system family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostPlatform {
    Linux,
    MacOs,
    Windows,
    Other,
}

impl HostPlatform {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "linux" => HostPlatform::Linux,
            "macos" => HostPlatform::MacOs,
            "windows" => HostPlatform::Windows,
            _ => HostPlatform::Other,
        }
    }
}

impl std::fmt::Display for HostPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostPlatform::Linux => write!(f, "Linux"),
            HostPlatform::MacOs => write!(f, "macOS"),
            HostPlatform::Windows => write!(f, "Windows"),
            HostPlatform::Other => write!(f, "this platform"),
        }
    }
}

/// Facts about the host relevant to backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostProfile {
    pub platform: HostPlatform,
    pub arch: String,
}

impl HostProfile {
    pub fn new(platform: HostPlatform, arch: impl Into<String>) -> Self {
        Self {
            platform,
            arch: arch.into(),
        }
    }

    pub fn current() -> Self {
        Self::new(HostPlatform::current(), std::env::consts::ARCH)
    }
}

/// Feature flags read from the environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub experimental_qemu: bool,
}

/// Whether an environment value is one of the truthy tokens.
pub fn is_truthy(value: &str) -> bool {
    let v = value.trim();
    TRUTHY_TOKENS.iter().any(|t| t.eq_ignore_ascii_case(v))
}

impl FeatureFlags {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build flags from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            experimental_qemu: lookup(QEMU_OPT_IN_ENV).is_some_and(|v| is_truthy(&v)),
        }
    }
}

/// Why a runtime is unavailable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum UnsupportedReason {
    PlatformMismatch {
        runtime: RuntimeKind,
        platform: HostPlatform,
    },
    MissingOptIn {
        runtime: RuntimeKind,
        flag: String,
    },
}

impl std::fmt::Display for UnsupportedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnsupportedReason::PlatformMismatch { runtime, platform } => {
                write!(f, "the {} runtime is not available on {}", runtime, platform)
            }
            UnsupportedReason::MissingOptIn { runtime, flag } => write!(
                f,
                "the {} runtime is experimental; set {}=1 to enable it",
                runtime, flag
            ),
        }
    }
}

/// What a runtime can do on this host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeCapabilities {
    pub runtime: RuntimeKind,
    pub supported_on_host: bool,
    pub supports_control_channel: bool,
    pub supports_auto_start: bool,
    pub supports_usb_passthrough: bool,
    pub supports_guided_install: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsupported_reason: Option<UnsupportedReason>,
}

struct Row {
    platforms: &'static [HostPlatform],
    control_channel: bool,
    auto_start: bool,
    usb: bool,
    guided_install: bool,
    opt_in: Option<&'static str>,
}

fn matrix(kind: RuntimeKind) -> Row {
    match kind {
        RuntimeKind::Docker => Row {
            platforms: &[HostPlatform::Linux],
            control_channel: true,
            auto_start: true,
            usb: true,
            guided_install: true,
            opt_in: None,
        },
        RuntimeKind::Podman => Row {
            platforms: &[HostPlatform::Linux],
            control_channel: true,
            auto_start: false,
            usb: false,
            guided_install: true,
            opt_in: None,
        },
        RuntimeKind::Qemu => Row {
            platforms: &[HostPlatform::Linux, HostPlatform::MacOs],
            control_channel: true,
            auto_start: false,
            usb: true,
            guided_install: false,
            opt_in: Some(QEMU_OPT_IN_ENV),
        },
    }
}

fn opted_in(flag: &str, flags: &FeatureFlags) -> bool {
    match flag {
        QEMU_OPT_IN_ENV => flags.experimental_qemu,
        _ => false,
    }
}

/// Resolve the capabilities of `kind` on `host` under `flags`.
pub fn resolve(kind: RuntimeKind, host: &HostProfile, flags: &FeatureFlags) -> RuntimeCapabilities {
    let row = matrix(kind);

    let reason = if !row.platforms.contains(&host.platform) {
        Some(UnsupportedReason::PlatformMismatch {
            runtime: kind,
            platform: host.platform,
        })
    } else {
        row.opt_in
            .filter(|flag| !opted_in(flag, flags))
            .map(|flag| UnsupportedReason::MissingOptIn {
                runtime: kind,
                flag: flag.to_string(),
            })
    };

    let supported = reason.is_none();
    RuntimeCapabilities {
        runtime: kind,
        supported_on_host: supported,
        supports_control_channel: supported && row.control_channel,
        supports_auto_start: supported && row.auto_start,
        supports_usb_passthrough: supported && row.usb,
        supports_guided_install: supported && row.guided_install,
        unsupported_reason: reason,
    }
}

/// Runtimes usable on `host`, in preference order.
pub fn supported_runtimes(host: &HostProfile, flags: &FeatureFlags) -> Vec<RuntimeKind> {
    RuntimeKind::ALL
        .into_iter()
        .filter(|k| resolve(*k, host, flags).supported_on_host)
        .collect()
}
