//! Schema migration chain for `winboat.config.json`.
//!
//! ```text
//! v0  pre-versioning: containerRuntime, experimentalFeatures, rdpMonitoringEnabled,
//!     arch, scale, rdpArgs, customApps, passedThroughDevices, autoStartContainer
//! v1  runtimeKind + featureToggles
//! v2  guestArchitecture
//! v3  customizations
//! ```
//!
//! Every step is a pure function over the raw JSON map. The version is
//! re-inferred after each step. A step that fails on one field names it; the
//! engine drops that field and reruns the step so the rest of the chain still
//! maps the legacy keys it knows.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::warn;

use pkg_constants::state::CURRENT_SCHEMA_VERSION;
use pkg_types::config::GuestArchitecture;

pub type JsonMap = Map<String, Value>;

/// Why a step could not run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    /// Field the step could not handle. `None` stops the chain.
    pub field: Option<String>,
    pub reason: String,
}

impl StepFailure {
    pub fn field(key: &str, reason: impl Into<String>) -> Self {
        Self {
            field: Some(key.to_string()),
            reason: reason.into(),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self {
            field: None,
            reason: reason.into(),
        }
    }
}

/// Transforms a config at version N into version N+1.
pub type MigrationStep = fn(JsonMap) -> Result<JsonMap, StepFailure>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MigrationError {
    #[error("no migration step registered for schema version {0}")]
    MissingStep(u32),

    #[error("migration step from schema version {from} failed: {reason}")]
    Step { from: u32, reason: String },

    #[error("migration step from schema version {from} did not advance the schema (now {inferred})")]
    NoProgress { from: u32, inferred: u32 },
}

impl MigrationError {
    /// Schema version at which the chain stopped.
    pub fn failed_at(&self) -> u32 {
        match self {
            MigrationError::MissingStep(v) => *v,
            MigrationError::Step { from, .. } => *from,
            MigrationError::NoProgress { from, .. } => *from,
        }
    }
}

/// Result of running the chain over one config.
#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    /// Config at `reached`, the last version that was successfully produced.
    pub config: JsonMap,
    pub from_version: u32,
    pub reached: u32,
    /// The input came from a newer release; nothing was migrated.
    pub newer_than_supported: bool,
    /// The failure that stopped the chain, or the first field-level failure
    /// the chain recovered from.
    pub error: Option<MigrationError>,
    /// Fields removed so a failing step could run, with their raw values.
    pub dropped: JsonMap,
}

impl MigrationOutcome {
    pub fn migrated(&self) -> bool {
        self.reached > self.from_version
    }
}

/// Infer the schema version of a raw config.
///
/// An explicit non-negative integer `schemaVersion` wins. Otherwise the
/// newest version-specific key decides, and a config with none of them is
/// version 0.
pub fn infer_version(config: &JsonMap) -> u32 {
    if let Some(v) = config
        .get("schemaVersion")
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
    {
        return v;
    }
    if config.contains_key("customizations") {
        3
    } else if config.contains_key("guestArchitecture") {
        2
    } else if config.contains_key("runtimeKind") || config.contains_key("featureToggles") {
        1
    } else {
        0
    }
}

pub struct MigrationEngine {
    current: u32,
    steps: BTreeMap<u32, MigrationStep>,
}

impl Default for MigrationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationEngine {
    /// The built-in chain up to `CURRENT_SCHEMA_VERSION`.
    pub fn new() -> Self {
        let mut steps: BTreeMap<u32, MigrationStep> = BTreeMap::new();
        steps.insert(0, v0_to_v1);
        steps.insert(1, v1_to_v2);
        steps.insert(2, v2_to_v3);
        Self {
            current: CURRENT_SCHEMA_VERSION,
            steps,
        }
    }

    /// A custom chain. Used to exercise failure paths.
    pub fn with_steps(current: u32, steps: BTreeMap<u32, MigrationStep>) -> Self {
        Self { current, steps }
    }

    pub fn current_version(&self) -> u32 {
        self.current
    }

    pub fn migrate(&self, config: JsonMap) -> MigrationOutcome {
        let from_version = infer_version(&config);
        let mut outcome = MigrationOutcome {
            config,
            from_version,
            reached: from_version,
            newer_than_supported: from_version > self.current,
            error: None,
            dropped: Map::new(),
        };
        if outcome.newer_than_supported {
            return outcome;
        }

        while outcome.reached < self.current {
            let version = outcome.reached;
            let Some(step) = self.steps.get(&version) else {
                outcome.error = Some(MigrationError::MissingStep(version));
                break;
            };
            let mut result = step(outcome.config.clone());
            let retry = match &result {
                Err(StepFailure {
                    field: Some(key),
                    reason,
                }) => outcome
                    .config
                    .remove(key)
                    .map(|value| (key.clone(), reason.clone(), value)),
                _ => None,
            };
            if let Some((key, reason, value)) = retry {
                warn!(
                    "[config] migration from v{} cannot handle {}: {}; dropping it",
                    version, key, reason
                );
                if outcome.error.is_none() {
                    outcome.error = Some(MigrationError::Step {
                        from: version,
                        reason,
                    });
                }
                outcome.dropped.insert(key, value);
                result = step(outcome.config.clone());
            }
            match result {
                Ok(next) => {
                    let inferred = infer_version(&next);
                    if inferred <= version {
                        outcome.error = Some(MigrationError::NoProgress {
                            from: version,
                            inferred,
                        });
                        break;
                    }
                    outcome.config = next;
                    outcome.reached = inferred;
                }
                Err(failure) => {
                    outcome.error = Some(MigrationError::Step {
                        from: version,
                        reason: failure.reason,
                    });
                    break;
                }
            }
        }
        outcome
    }
}

// ─── Steps ──────────────────────────────────────────────────────────────────

fn take_object(config: &mut JsonMap, key: &str) -> JsonMap {
    match config.remove(key) {
        Some(Value::Object(m)) => m,
        _ => Map::new(),
    }
}

fn move_key(from: &mut JsonMap, old: &str, to: &mut JsonMap, new: &str) {
    if let Some(v) = from.remove(old) {
        to.insert(new.to_string(), v);
    }
}

/// `containerRuntime` becomes `runtimeKind`; loose feature booleans move into
/// `featureToggles`.
fn v0_to_v1(mut config: JsonMap) -> Result<JsonMap, StepFailure> {
    let kind = match config.remove("containerRuntime") {
        None | Some(Value::Null) => "docker",
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "docker" => "docker",
            "podman" => "podman",
            other => {
                return Err(StepFailure::field(
                    "containerRuntime",
                    format!("unrecognized containerRuntime {:?}", other),
                ));
            }
        },
        Some(other) => {
            return Err(StepFailure::field(
                "containerRuntime",
                format!("containerRuntime is not a string: {}", other),
            ));
        }
    };
    config.insert("runtimeKind".into(), Value::from(kind));

    let mut toggles = take_object(&mut config, "featureToggles");
    move_key(&mut config, "experimentalFeatures", &mut toggles, "experimental");
    move_key(&mut config, "rdpMonitoringEnabled", &mut toggles, "rdpMonitoring");
    config.insert("featureToggles".into(), Value::Object(toggles));
    config.insert("schemaVersion".into(), Value::from(1));
    Ok(config)
}

/// Legacy `arch` becomes `guestArchitecture`. An existing
/// `guestArchitecture` is kept when there is no `arch` to map.
fn v1_to_v2(mut config: JsonMap) -> Result<JsonMap, StepFailure> {
    let legacy = config.remove("arch");
    if legacy.is_some() || !config.contains_key("guestArchitecture") {
        let arch = legacy
            .as_ref()
            .and_then(Value::as_str)
            .and_then(GuestArchitecture::from_legacy)
            .unwrap_or_default();
        config.insert("guestArchitecture".into(), Value::from(arch.as_str()));
    }
    config.insert("schemaVersion".into(), Value::from(2));
    Ok(config)
}

/// Top-level user customizations move under `customizations`;
/// `autoStartContainer` becomes a feature toggle.
fn v2_to_v3(mut config: JsonMap) -> Result<JsonMap, StepFailure> {
    let mut custom = take_object(&mut config, "customizations");
    move_key(&mut config, "scale", &mut custom, "scale");
    move_key(&mut config, "rdpArgs", &mut custom, "rdpArgs");
    move_key(&mut config, "customApps", &mut custom, "apps");
    move_key(&mut config, "passedThroughDevices", &mut custom, "passedThroughDevices");
    config.insert("customizations".into(), Value::Object(custom));

    let mut toggles = take_object(&mut config, "featureToggles");
    move_key(&mut config, "autoStartContainer", &mut toggles, "autoStart");
    config.insert("featureToggles".into(), Value::Object(toggles));
    config.insert("schemaVersion".into(), Value::from(3));
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> JsonMap {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_infer_explicit_version() {
        assert_eq!(infer_version(&obj(json!({"schemaVersion": 2}))), 2);
        assert_eq!(infer_version(&obj(json!({"schemaVersion": 7, "arch": "x"}))), 7);
    }

    #[test]
    fn test_infer_heuristics() {
        assert_eq!(infer_version(&obj(json!({}))), 0);
        assert_eq!(infer_version(&obj(json!({"containerRuntime": "docker"}))), 0);
        assert_eq!(infer_version(&obj(json!({"runtimeKind": "docker"}))), 1);
        assert_eq!(infer_version(&obj(json!({"featureToggles": {}}))), 1);
        assert_eq!(infer_version(&obj(json!({"guestArchitecture": "x86_64"}))), 2);
        assert_eq!(infer_version(&obj(json!({"customizations": {}}))), 3);
    }

    #[test]
    fn test_invalid_explicit_version_falls_back() {
        assert_eq!(infer_version(&obj(json!({"schemaVersion": -1}))), 0);
        assert_eq!(
            infer_version(&obj(json!({"schemaVersion": "2", "runtimeKind": "docker"}))),
            1
        );
    }

    #[test]
    fn test_full_chain_from_v0() {
        let legacy = obj(json!({
            "containerRuntime": "podman",
            "experimentalFeatures": true,
            "rdpMonitoringEnabled": false,
            "arch": "arm64",
            "scale": 150,
            "rdpArgs": ["/sound"],
            "customApps": [{"name": "Paint", "path": "C:\\mspaint.exe"}],
            "autoStartContainer": true,
            "somethingElse": 42
        }));
        let out = MigrationEngine::new().migrate(legacy);
        assert!(out.error.is_none());
        assert!(out.migrated());
        assert_eq!(out.from_version, 0);
        assert_eq!(out.reached, 3);

        let c = &out.config;
        assert_eq!(c["schemaVersion"], 3);
        assert_eq!(c["runtimeKind"], "podman");
        assert_eq!(c["guestArchitecture"], "aarch64");
        assert_eq!(c["featureToggles"]["experimental"], true);
        assert_eq!(c["featureToggles"]["autoStart"], true);
        assert_eq!(c["customizations"]["scale"], 150);
        assert_eq!(c["customizations"]["apps"][0]["name"], "Paint");
        assert_eq!(c["somethingElse"], 42);
        assert!(!c.contains_key("containerRuntime"));
        assert!(!c.contains_key("arch"));
    }

    #[test]
    fn test_chain_is_consistent_with_current_shape() {
        let legacy = obj(json!({
            "containerRuntime": "docker",
            "rdpMonitoringEnabled": true,
            "arch": "amd64",
            "scale": 125
        }));
        let native = obj(json!({
            "schemaVersion": 3,
            "runtimeKind": "docker",
            "guestArchitecture": "x86_64",
            "featureToggles": {"rdpMonitoring": true},
            "customizations": {"scale": 125}
        }));
        let migrated = MigrationEngine::new().migrate(legacy).config;
        let untouched = MigrationEngine::new().migrate(native.clone());
        assert!(!untouched.migrated());
        assert_eq!(migrated, native);
    }

    #[test]
    fn test_unknown_container_runtime_dropped_and_chain_continues() {
        let out = MigrationEngine::new().migrate(obj(json!({
            "containerRuntime": "lxc",
            "scale": 110,
            "rdpArgs": ["/sound"],
            "arch": "arm64"
        })));
        assert_eq!(out.error.as_ref().map(MigrationError::failed_at), Some(0));
        assert_eq!(out.reached, 3);
        assert_eq!(out.dropped["containerRuntime"], "lxc");

        let c = &out.config;
        assert_eq!(c["runtimeKind"], "docker");
        assert_eq!(c["guestArchitecture"], "aarch64");
        assert_eq!(c["customizations"]["scale"], 110);
        assert_eq!(c["customizations"]["rdpArgs"][0], "/sound");
        assert!(!c.contains_key("containerRuntime"));
    }

    #[test]
    fn test_fatal_step_stops_chain() {
        fn broken(_: JsonMap) -> Result<JsonMap, StepFailure> {
            Err(StepFailure::fatal("disk on fire"))
        }
        let mut steps: BTreeMap<u32, MigrationStep> = BTreeMap::new();
        steps.insert(0, broken);
        let out = MigrationEngine::with_steps(1, steps).migrate(obj(json!({"scale": 110})));
        assert_eq!(out.reached, 0);
        assert!(out.dropped.is_empty());
        assert_eq!(
            out.error,
            Some(MigrationError::Step {
                from: 0,
                reason: "disk on fire".to_string()
            })
        );
        assert_eq!(out.config["scale"], 110);
    }

    #[test]
    fn test_newer_version_untouched() {
        let input = obj(json!({"schemaVersion": 9, "runtimeKind": "docker", "hologram": true}));
        let out = MigrationEngine::new().migrate(input.clone());
        assert!(out.newer_than_supported);
        assert!(!out.migrated());
        assert_eq!(out.config, input);
    }

    #[test]
    fn test_missing_step_reported() {
        let mut steps: BTreeMap<u32, MigrationStep> = BTreeMap::new();
        steps.insert(0, v0_to_v1);
        let engine = MigrationEngine::with_steps(3, steps);
        let out = engine.migrate(obj(json!({})));
        assert_eq!(out.reached, 1);
        assert_eq!(out.error, Some(MigrationError::MissingStep(1)));
    }

    #[test]
    fn test_step_without_progress_detected() {
        fn stuck(c: JsonMap) -> Result<JsonMap, StepFailure> {
            Ok(c)
        }
        let mut steps: BTreeMap<u32, MigrationStep> = BTreeMap::new();
        steps.insert(0, stuck);
        let out = MigrationEngine::with_steps(1, steps).migrate(obj(json!({})));
        assert_eq!(
            out.error,
            Some(MigrationError::NoProgress {
                from: 0,
                inferred: 0
            })
        );
    }
}
