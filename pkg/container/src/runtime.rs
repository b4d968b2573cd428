//! Backend selection.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use pkg_constants::paths::QEMU_RUNTIME_DIR;
use pkg_types::runtime::RuntimeKind;

use crate::backend::{HostProbe, RuntimeManager};
use crate::engine::{EngineBackend, EngineFlavor};
use crate::native::NativeBackend;

/// Build the manager for `kind`. Descriptors live directly in `app_dir`
/// except for the native backend, which owns `<app_dir>/qemu`.
pub fn create_manager(kind: RuntimeKind, app_dir: &Path) -> Arc<dyn RuntimeManager> {
    info!("[runtime] using {} backend (data dir {})", kind, app_dir.display());
    match kind {
        RuntimeKind::Docker => Arc::new(EngineBackend::docker(app_dir)),
        RuntimeKind::Podman => Arc::new(EngineBackend::podman(app_dir)),
        RuntimeKind::Qemu => Arc::new(NativeBackend::new(&app_dir.join(QEMU_RUNTIME_DIR), app_dir)),
    }
}

/// Check the host prerequisites of `kind` without touching any instance.
pub async fn probe_host(kind: RuntimeKind, app_dir: &Path) -> HostProbe {
    match kind {
        RuntimeKind::Docker => EngineBackend::host_probe(EngineFlavor::Docker).await,
        RuntimeKind::Podman => EngineBackend::host_probe(EngineFlavor::Podman).await,
        RuntimeKind::Qemu => NativeBackend::host_probe(app_dir).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_matches_kind() {
        let dir = tempfile::tempdir().unwrap();
        for kind in RuntimeKind::ALL {
            let m = create_manager(kind, dir.path());
            assert_eq!(m.kind(), kind);
            assert_eq!(m.name(), kind.as_str());
        }
    }

    #[test]
    fn test_descriptor_locations() {
        let dir = tempfile::tempdir().unwrap();
        let docker = create_manager(RuntimeKind::Docker, dir.path());
        assert_eq!(docker.descriptor_path(), dir.path().join("docker-compose.yml"));
        let qemu = create_manager(RuntimeKind::Qemu, dir.path());
        assert!(qemu.descriptor_path().starts_with(dir.path().join(QEMU_RUNTIME_DIR)));
    }
}
