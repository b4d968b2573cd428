//! Process-wide state, built once at startup and passed to every command.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use pkg_config::{ConfigStore, LoadReport};
use pkg_constants::network::{GUEST_API_PORT, GUEST_QMP_PORT};
use pkg_constants::paths::{APP_DIR, CONFIG_FILENAME};
use pkg_container::{RuntimeManager, create_manager};
use pkg_controllers::GuestClient;
use pkg_network::PortMapper;
use pkg_qmp::QmpClient;
use pkg_types::capability::{FeatureFlags, HostProfile, RuntimeCapabilities, resolve};
use pkg_types::runtime::RuntimeKind;

pub struct AppContext {
    pub app_dir: PathBuf,
    pub host: HostProfile,
    pub flags: FeatureFlags,
    pub config: ConfigStore,
    pub manager: Arc<dyn RuntimeManager>,
    pub capabilities: RuntimeCapabilities,
}

/// `~/.winboat` unless overridden.
pub fn default_app_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("cannot determine the home directory")?;
    Ok(home.join(APP_DIR))
}

fn log_report(path: &Path, report: &LoadReport) {
    if report.created {
        info!("[config] new config at {}", path.display());
    }
    if report.migrated {
        info!("[config] migrated from schema v{}", report.from_version);
    }
    if let Some(at) = report.failed_at {
        warn!("[config] migration stopped at v{}; salvaged what was readable", at);
    }
    if let Some(backup) = &report.recovered_backup {
        info!("[config] backup kept at {}", backup.display());
    }
    if let Some(prev) = report.runtime_fallback {
        warn!("[config] configured runtime {} is unavailable here", prev);
    }
}

impl AppContext {
    /// Load and migrate the config, then build the manager for the
    /// configured runtime. Migration always finishes first.
    pub fn init(data_dir: Option<PathBuf>) -> Result<Self> {
        let app_dir = match data_dir {
            Some(d) => d,
            None => default_app_dir()?,
        };
        std::fs::create_dir_all(&app_dir)
            .with_context(|| format!("failed to create {}", app_dir.display()))?;

        let host = HostProfile::current();
        let flags = FeatureFlags::from_env();
        let config_path = app_dir.join(CONFIG_FILENAME);
        let (config, report) = ConfigStore::open(&config_path, &host, &flags)?;
        log_report(&config_path, &report);

        let kind = config.get().runtime_kind;
        let capabilities = resolve(kind, &host, &flags);
        let manager = create_manager(kind, &app_dir);

        Ok(Self {
            app_dir,
            host,
            flags,
            config,
            manager,
            capabilities,
        })
    }

    pub fn kind(&self) -> RuntimeKind {
        self.manager.kind()
    }

    /// Refuse backend operations the host cannot run.
    pub fn require_supported(&self) -> Result<()> {
        if self.capabilities.supported_on_host {
            return Ok(());
        }
        match &self.capabilities.unsupported_reason {
            Some(reason) => anyhow::bail!("{}", reason),
            None => anyhow::bail!("{} is not supported on this host", self.kind()),
        }
    }

    /// Declared ports of the instance resolved against what the backend
    /// reports. Nothing resolves while the instance is not running.
    pub async fn resolved_ports(&self) -> Result<PortMapper> {
        let descriptor = self
            .manager
            .read_descriptor()
            .await
            .context("instance descriptor is missing or unreadable")?;
        let mut mapper = PortMapper::from_descriptor(&descriptor);
        mapper.apply_resolved(&self.manager.port().await);
        Ok(mapper)
    }

    /// Open a negotiated QMP session on the running instance.
    pub async fn qmp_session(&self) -> Result<QmpClient> {
        if !self.capabilities.supports_control_channel {
            anyhow::bail!("{} has no control channel", self.kind());
        }
        let (host, port) = self
            .resolved_ports()
            .await?
            .get_resolved_endpoint(GUEST_QMP_PORT)
            .context("instance is not running or does not publish the control port")?;
        let client = QmpClient::new();
        client.connect_and_negotiate(&host, port).await?;
        Ok(client)
    }

    pub async fn guest_client(&self) -> Result<GuestClient> {
        let (host, port) = self
            .resolved_ports()
            .await?
            .get_resolved_endpoint(GUEST_API_PORT)
            .context("instance is not running or does not publish the guest API port")?;
        GuestClient::new(&host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_creates_config_before_manager() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = AppContext::init(Some(dir.path().to_path_buf())).unwrap();
        assert!(dir.path().join(CONFIG_FILENAME).exists());
        assert_eq!(ctx.kind(), ctx.config.get().runtime_kind);
        assert_eq!(ctx.capabilities.runtime, ctx.kind());
    }

    #[test]
    fn test_init_migrates_legacy_runtime() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILENAME),
            r#"{"containerRuntime":"podman"}"#,
        )
        .unwrap();
        let ctx = AppContext::init(Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(ctx.config.get().schema_version, 3);
        if ctx.host.platform == pkg_types::capability::HostPlatform::Linux {
            assert_eq!(ctx.kind(), RuntimeKind::Podman);
        }
    }
}
