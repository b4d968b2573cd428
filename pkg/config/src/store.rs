//! Loading, recovering and persisting `winboat.config.json`.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use pkg_constants::state::CURRENT_SCHEMA_VERSION;
use pkg_types::capability::{FeatureFlags, HostProfile, supported_runtimes};
use pkg_types::config::PersistedConfig;
use pkg_types::fsutil::write_atomic;
use pkg_types::runtime::RuntimeKind;

use crate::migration::{JsonMap, MigrationEngine};
use crate::normalize::{Unreadable, normalize};

/// What happened while loading the config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// At least one migration step ran.
    pub migrated: bool,
    pub from_version: u32,
    /// The file came from a newer release and was left untouched on disk.
    pub newer_than_supported: bool,
    /// Backup written during recovery or migration.
    pub recovered_backup: Option<PathBuf>,
    /// Schema version at which the migration chain failed.
    pub failed_at: Option<u32>,
    /// Fields dropped so the migration chain could continue.
    pub dropped_fields: Vec<String>,
    /// Runtime replaced because the configured one is unusable on this host.
    pub runtime_fallback: Option<RuntimeKind>,
    /// No config existed; defaults were written.
    pub created: bool,
}

/// Single owner of the normalized config. Every change goes through
/// [`ConfigStore::update`], which persists before publishing.
pub struct ConfigStore {
    path: PathBuf,
    current: Mutex<Loaded>,
}

/// The typed config plus the raw values it could not read.
#[derive(Debug, Clone)]
struct Loaded {
    config: PersistedConfig,
    unreadable: Unreadable,
}

fn backup_path(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "config.json".to_string());
    let base = path.with_file_name(format!("{}.{}", name, suffix));
    if !base.exists() {
        return base;
    }
    (1..)
        .map(|n| path.with_file_name(format!("{}.{}-{}", name, suffix, n)))
        .find(|p| !p.exists())
        .unwrap_or(base)
}

fn timestamp() -> String {
    Utc::now().format("%Y%m%dT%H%M%SZ").to_string()
}

/// An earlier backup of `path` whose suffix starts with `prefix` and whose
/// content is `bytes`.
fn find_backup(path: &Path, prefix: &str, bytes: &[u8]) -> Option<PathBuf> {
    let name = path.file_name()?.to_string_lossy().to_string();
    let marker = format!("{}.{}", name, prefix);
    let dir = path.parent()?;
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with(&marker))
        })
        .find(|p| std::fs::read(p).is_ok_and(|b| b == bytes))
}

fn write_backup(path: &Path, suffix: &str, bytes: &[u8]) -> Result<PathBuf> {
    let dest = backup_path(path, suffix);
    write_atomic(&dest, bytes)
        .with_context(|| format!("failed to write backup {}", dest.display()))?;
    Ok(dest)
}

fn to_map(cfg: &PersistedConfig) -> Result<JsonMap> {
    match serde_json::to_value(cfg)? {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("config serialized to {} instead of an object", other),
    }
}

/// What goes on disk: the typed config with unreadable raw values restored.
fn on_disk(cfg: &PersistedConfig, unreadable: &Unreadable) -> Result<JsonMap> {
    let mut map = to_map(cfg)?;
    unreadable.restore_into(&mut map);
    Ok(map)
}

fn persist(path: &Path, cfg: &PersistedConfig, unreadable: &Unreadable) -> Result<()> {
    let text = serde_json::to_string_pretty(&Value::Object(on_disk(cfg, unreadable)?))?;
    write_atomic(path, text.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))
}

/// Keep `runtimeKind` within what this host can run.
fn enforce_supported_runtime(
    cfg: &mut PersistedConfig,
    host: &HostProfile,
    flags: &FeatureFlags,
) -> Option<RuntimeKind> {
    let supported = supported_runtimes(host, flags);
    if supported.contains(&cfg.runtime_kind) {
        return None;
    }
    let Some(first) = supported.first().copied() else {
        warn!(
            "[config] no runtime is supported on {}; keeping {}",
            host.platform, cfg.runtime_kind
        );
        return None;
    };
    let previous = cfg.runtime_kind;
    warn!(
        "[config] runtime {} is not supported on {}, falling back to {}",
        previous, host.platform, first
    );
    cfg.runtime_kind = first;
    Some(previous)
}

impl ConfigStore {
    /// Load (or create) the config at `path`, migrating and recovering as
    /// needed. Never fails on bad content, only on I/O errors.
    pub fn open(
        path: &Path,
        host: &HostProfile,
        flags: &FeatureFlags,
    ) -> Result<(Self, LoadReport)> {
        Self::open_with(path, host, flags, &MigrationEngine::new())
    }

    pub fn open_with(
        path: &Path,
        host: &HostProfile,
        flags: &FeatureFlags,
        engine: &MigrationEngine,
    ) -> Result<(Self, LoadReport)> {
        let (loaded, report) = load(path, host, flags, engine)?;
        Ok((
            Self {
                path: path.to_path_buf(),
                current: Mutex::new(loaded),
            },
            report,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the current config.
    pub fn get(&self) -> PersistedConfig {
        match self.current.lock() {
            Ok(guard) => guard.config.clone(),
            Err(poisoned) => poisoned.into_inner().config.clone(),
        }
    }

    /// Apply `mutator` to a copy, persist it and only then make it current.
    ///
    /// Raw values of fields this build could not read are written back
    /// unless the mutator changed the field.
    pub fn update<F>(&self, mutator: F) -> Result<PersistedConfig>
    where
        F: FnOnce(&mut PersistedConfig),
    {
        let mut guard = self
            .current
            .lock()
            .map_err(|_| anyhow::anyhow!("config lock poisoned"))?;
        let mut next = guard.clone();
        mutator(&mut next.config);
        next.unreadable
            .forget_changed(&to_map(&guard.config)?, &to_map(&next.config)?);
        persist(&self.path, &next.config, &next.unreadable)?;
        let saved = next.config.clone();
        *guard = next;
        info!("[config] saved {}", self.path.display());
        Ok(saved)
    }
}

/// Replace an unusable runtime, dropping the raw runtime value it replaces.
fn apply_runtime_policy(
    loaded: &mut Loaded,
    host: &HostProfile,
    flags: &FeatureFlags,
) -> Result<Option<RuntimeKind>> {
    let before = to_map(&loaded.config)?;
    let fallback = enforce_supported_runtime(&mut loaded.config, host, flags);
    if fallback.is_some() {
        loaded
            .unreadable
            .forget_changed(&before, &to_map(&loaded.config)?);
    }
    Ok(fallback)
}

fn fresh(
    host: &HostProfile,
    flags: &FeatureFlags,
    report: &mut LoadReport,
) -> Result<Loaded> {
    let mut loaded = Loaded {
        config: PersistedConfig::default(),
        unreadable: Unreadable::default(),
    };
    report.runtime_fallback = apply_runtime_policy(&mut loaded, host, flags)?;
    report.from_version = CURRENT_SCHEMA_VERSION;
    Ok(loaded)
}

fn load(
    path: &Path,
    host: &HostProfile,
    flags: &FeatureFlags,
    engine: &MigrationEngine,
) -> Result<(Loaded, LoadReport)> {
    let mut report = LoadReport::default();

    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let loaded = fresh(host, flags, &mut report)?;
            report.created = true;
            persist(path, &loaded.config, &loaded.unreadable)?;
            info!("[config] created default config at {}", path.display());
            return Ok((loaded, report));
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", path.display()));
        }
    };

    let raw = match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => map,
        other => {
            let why = match other {
                Ok(_) => "not a JSON object".to_string(),
                Err(e) => e.to_string(),
            };
            let backup = write_backup(path, &format!("corrupt-{}", timestamp()), &bytes)?;
            warn!(
                "[config] {} is corrupt ({}); backed up to {} and reset to defaults",
                path.display(),
                why,
                backup.display()
            );
            let loaded = fresh(host, flags, &mut report)?;
            report.recovered_backup = Some(backup);
            persist(path, &loaded.config, &loaded.unreadable)?;
            return Ok((loaded, report));
        }
    };

    let original = raw.clone();
    let outcome = engine.migrate(raw);
    report.from_version = outcome.from_version;
    report.migrated = outcome.migrated();
    report.newer_than_supported = outcome.newer_than_supported;
    report.dropped_fields = outcome.dropped.keys().cloned().collect();

    let (config, unreadable) = normalize(outcome.config);
    let mut loaded = Loaded { config, unreadable };

    if outcome.newer_than_supported {
        warn!(
            "[config] {} has schema version {} (newer than {}); loading without migration",
            path.display(),
            outcome.from_version,
            engine.current_version()
        );
        report.runtime_fallback = apply_runtime_policy(&mut loaded, host, flags)?;
        return Ok((loaded, report));
    }

    let stopped_early = outcome.reached < engine.current_version();
    if let Some(err) = &outcome.error {
        let at = err.failed_at();
        let prefix = "migration-failed-";
        let backup = match find_backup(path, prefix, &bytes) {
            Some(existing) => existing,
            None => write_backup(path, &format!("{}{}", prefix, timestamp()), &bytes)?,
        };
        warn!(
            "[config] migration failed at schema version {}: {}; reached v{}, dropped [{}], original saved to {}",
            at,
            err,
            outcome.reached,
            report.dropped_fields.join(", "),
            backup.display()
        );
        // Legacy keys stay in `extra` under the version they belong to, so a
        // later chain can still map them.
        loaded.config.schema_version = outcome.reached;
        report.failed_at = Some(at);
        report.recovered_backup = Some(backup);
    } else if report.migrated {
        let backup = write_backup(path, &format!("v{}.bak", outcome.from_version), &bytes)?;
        info!(
            "[config] migrated schema v{} -> v{} (backup {})",
            outcome.from_version,
            outcome.reached,
            backup.display()
        );
        report.recovered_backup = Some(backup);
    }

    report.runtime_fallback = apply_runtime_policy(&mut loaded, host, flags)?;

    if stopped_early {
        return Ok((loaded, report));
    }
    let unchanged = on_disk(&loaded.config, &loaded.unreadable)? == original;
    if !unchanged {
        persist(path, &loaded.config, &loaded.unreadable)?;
    }
    Ok((loaded, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::capability::HostPlatform;
    use pkg_types::config::GuestArchitecture;

    fn linux() -> HostProfile {
        HostProfile::new(HostPlatform::Linux, "x86_64")
    }

    fn backups(dir: &Path, marker: &str) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.to_string_lossy().contains(marker))
            .collect()
    }

    #[test]
    fn test_missing_file_creates_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("winboat.config.json");
        let (store, report) = ConfigStore::open(&path, &linux(), &FeatureFlags::default()).unwrap();
        assert!(report.created);
        assert!(!report.migrated);
        assert_eq!(store.get(), PersistedConfig::default());

        let on_disk: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk["schemaVersion"], CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_corrupt_file_backed_up_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("winboat.config.json");
        std::fs::write(&path, b"{ this is not json").unwrap();

        let (store, report) = ConfigStore::open(&path, &linux(), &FeatureFlags::default()).unwrap();
        assert_eq!(store.get(), PersistedConfig::default());

        let backup = report.recovered_backup.unwrap();
        assert!(backup.to_string_lossy().contains(".corrupt-"));
        assert_eq!(std::fs::read(&backup).unwrap(), b"{ this is not json");
        let reread: PersistedConfig =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(reread, PersistedConfig::default());
    }

    #[test]
    fn test_non_object_json_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("winboat.config.json");
        std::fs::write(&path, b"[1, 2, 3]").unwrap();
        let (_, report) = ConfigStore::open(&path, &linux(), &FeatureFlags::default()).unwrap();
        assert_eq!(backups(dir.path(), ".corrupt-").len(), 1);
        assert!(report.recovered_backup.is_some());
    }

    #[test]
    fn test_legacy_file_migrated_with_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("winboat.config.json");
        let legacy = r#"{"containerRuntime":"podman","arch":"arm64","scale":140,"keepMe":true}"#;
        std::fs::write(&path, legacy).unwrap();

        let (store, report) = ConfigStore::open(&path, &linux(), &FeatureFlags::default()).unwrap();
        assert!(report.migrated);
        assert_eq!(report.from_version, 0);
        let backup = report.recovered_backup.unwrap();
        assert!(backup.to_string_lossy().ends_with(".v0.bak"));
        assert_eq!(std::fs::read_to_string(&backup).unwrap(), legacy);

        let cfg = store.get();
        assert_eq!(cfg.schema_version, 3);
        assert_eq!(cfg.runtime_kind, RuntimeKind::Podman);
        assert_eq!(cfg.guest_architecture, GuestArchitecture::Aarch64);
        assert_eq!(cfg.customizations.scale, 140);
        assert_eq!(cfg.extra["keepMe"], true);

        // second load is a no-op
        let (_, again) = ConfigStore::open(&path, &linux(), &FeatureFlags::default()).unwrap();
        assert!(!again.migrated);
        assert_eq!(backups(dir.path(), ".bak").len(), 1);
    }

    #[test]
    fn test_failed_migration_keeps_customizations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("winboat.config.json");
        std::fs::write(
            &path,
            r#"{"containerRuntime":"lxc","scale":150,"rdpArgs":["/sound"],"arch":"arm64","guestTheme":"dark"}"#,
        )
        .unwrap();

        let (store, report) = ConfigStore::open(&path, &linux(), &FeatureFlags::default()).unwrap();
        assert_eq!(report.failed_at, Some(0));
        assert_eq!(report.dropped_fields, vec!["containerRuntime".to_string()]);
        assert!(
            report
                .recovered_backup
                .unwrap()
                .to_string_lossy()
                .contains(".migration-failed-")
        );
        let cfg = store.get();
        assert_eq!(cfg.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(cfg.runtime_kind, RuntimeKind::Docker);
        assert_eq!(cfg.customizations.scale, 150);
        assert_eq!(cfg.customizations.rdp_args, vec!["/sound".to_string()]);
        assert_eq!(cfg.guest_architecture, GuestArchitecture::Aarch64);
        assert_eq!(cfg.extra["guestTheme"], "dark");
        assert!(!cfg.extra.contains_key("scale"));

        let (again, report) = ConfigStore::open(&path, &linux(), &FeatureFlags::default()).unwrap();
        assert!(!report.migrated);
        assert_eq!(again.get().customizations.scale, 150);
    }

    #[test]
    fn test_stopped_migration_leaves_file_for_later() {
        fn broken(_: JsonMap) -> std::result::Result<JsonMap, crate::migration::StepFailure> {
            Err(crate::migration::StepFailure::fatal("cannot read this layout"))
        }
        let mut steps: std::collections::BTreeMap<u32, crate::migration::MigrationStep> =
            std::collections::BTreeMap::new();
        steps.insert(0, broken);
        let engine = MigrationEngine::with_steps(1, steps);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("winboat.config.json");
        let text = r#"{"containerRuntime":"docker","scale":150}"#;
        std::fs::write(&path, text).unwrap();

        let (store, report) =
            ConfigStore::open_with(&path, &linux(), &FeatureFlags::default(), &engine).unwrap();
        assert_eq!(report.failed_at, Some(0));
        assert_eq!(store.get().schema_version, 0);
        assert_eq!(store.get().extra["scale"], 150);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), text);

        // a second load reuses the identical backup
        ConfigStore::open_with(&path, &linux(), &FeatureFlags::default(), &engine).unwrap();
        assert_eq!(backups(dir.path(), ".migration-failed-").len(), 1);
    }

    #[test]
    fn test_newer_file_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("winboat.config.json");
        let text = r#"{"schemaVersion":99,"runtimeKind":"docker","teleport":{"on":true}}"#;
        std::fs::write(&path, text).unwrap();

        let (store, report) = ConfigStore::open(&path, &linux(), &FeatureFlags::default()).unwrap();
        assert!(report.newer_than_supported);
        assert!(!report.migrated);
        let cfg = store.get();
        assert_eq!(cfg.schema_version, 99);
        assert_eq!(cfg.extra["teleport"]["on"], true);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), text);
    }

    #[test]
    fn test_newer_file_unreadable_values_survive_update() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("winboat.config.json");
        std::fs::write(
            &path,
            r#"{"schemaVersion":4,"runtimeKind":"hyperv","guestArchitecture":"riscv64","customizations":{"scale":110,"apps":{"v4":true}}}"#,
        )
        .unwrap();

        let (store, report) = ConfigStore::open(&path, &linux(), &FeatureFlags::default()).unwrap();
        assert!(report.newer_than_supported);
        store.update(|c| c.customizations.scale = 120).unwrap();

        let on_disk: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk["schemaVersion"], 4);
        assert_eq!(on_disk["runtimeKind"], "hyperv");
        assert_eq!(on_disk["guestArchitecture"], "riscv64");
        assert_eq!(on_disk["customizations"]["apps"]["v4"], true);
        assert_eq!(on_disk["customizations"]["scale"], 120);

        // an explicit change replaces the raw value
        store.update(|c| c.runtime_kind = RuntimeKind::Podman).unwrap();
        let on_disk: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk["runtimeKind"], "podman");
        assert_eq!(on_disk["guestArchitecture"], "riscv64");
    }

    #[test]
    fn test_unsupported_runtime_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("winboat.config.json");
        std::fs::write(&path, r#"{"schemaVersion":3,"runtimeKind":"qemu"}"#).unwrap();

        let (store, report) = ConfigStore::open(&path, &linux(), &FeatureFlags::default()).unwrap();
        assert_eq!(report.runtime_fallback, Some(RuntimeKind::Qemu));
        assert_eq!(store.get().runtime_kind, RuntimeKind::Docker);

        let flags = FeatureFlags {
            experimental_qemu: true,
        };
        std::fs::write(&path, r#"{"schemaVersion":3,"runtimeKind":"qemu"}"#).unwrap();
        let (store, report) = ConfigStore::open(&path, &linux(), &flags).unwrap();
        assert_eq!(report.runtime_fallback, None);
        assert_eq!(store.get().runtime_kind, RuntimeKind::Qemu);
    }

    #[test]
    fn test_update_persists_before_swap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("winboat.config.json");
        let (store, _) = ConfigStore::open(&path, &linux(), &FeatureFlags::default()).unwrap();

        let next = store
            .update(|c| {
                c.runtime_kind = RuntimeKind::Podman;
                c.customizations.scale = 200;
            })
            .unwrap();
        assert_eq!(next.runtime_kind, RuntimeKind::Podman);
        assert_eq!(store.get(), next);

        let reread: PersistedConfig =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(reread.customizations.scale, 200);
    }
}
