use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use pkg_constants::state::CURRENT_SCHEMA_VERSION;

use crate::runtime::RuntimeKind;

/// Guest CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GuestArchitecture {
    #[default]
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "aarch64")]
    Aarch64,
}

impl GuestArchitecture {
    /// Accepts both the Go-style and the Rust-style spellings.
    pub fn from_legacy(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "amd64" | "x86_64" | "x64" => Some(GuestArchitecture::X86_64),
            "arm64" | "aarch64" => Some(GuestArchitecture::Aarch64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GuestArchitecture::X86_64 => "x86_64",
            GuestArchitecture::Aarch64 => "aarch64",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureToggles {
    #[serde(default)]
    pub experimental: bool,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub rdp_monitoring: bool,
    #[serde(default)]
    pub usb_passthrough: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A user-defined application launched inside the guest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomApp {
    pub name: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

/// A USB device the user chose to pass through to the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsbDeviceRef {
    pub vendor_id: String,
    pub product_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl UsbDeviceRef {
    /// Stable QMP device id for this device.
    pub fn device_id(&self) -> String {
        format!(
            "usb-{}-{}",
            self.vendor_id.trim_start_matches("0x").to_ascii_lowercase(),
            self.product_id.trim_start_matches("0x").to_ascii_lowercase()
        )
    }
}

fn default_scale() -> u32 {
    100
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customizations {
    #[serde(default = "default_scale")]
    pub scale: u32,
    #[serde(default)]
    pub rdp_args: Vec<String>,
    #[serde(default)]
    pub apps: Vec<CustomApp>,
    #[serde(default)]
    pub passed_through_devices: Vec<UsbDeviceRef>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Customizations {
    fn default() -> Self {
        Self {
            scale: default_scale(),
            rdp_args: Vec::new(),
            apps: Vec::new(),
            passed_through_devices: Vec::new(),
            extra: Map::new(),
        }
    }
}

fn default_schema_version() -> u32 {
    CURRENT_SCHEMA_VERSION
}

/// Persisted application configuration (`winboat.config.json`).
///
/// Unknown keys survive a load/save cycle through `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub runtime_kind: RuntimeKind,
    #[serde(default)]
    pub guest_architecture: GuestArchitecture,
    #[serde(default)]
    pub feature_toggles: FeatureToggles,
    #[serde(default)]
    pub customizations: Customizations,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for PersistedConfig {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            runtime_kind: RuntimeKind::default(),
            guest_architecture: GuestArchitecture::default(),
            feature_toggles: FeatureToggles::default(),
            customizations: Customizations::default(),
            extra: Map::new(),
        }
    }
}

impl PersistedConfig {
    pub fn to_json_pretty(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
