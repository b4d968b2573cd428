//! Raw engine status → [`RuntimeStatus`].
//!
//! Each engine reports its own vocabulary. The tables below are exhaustive
//! over the values each engine documents; anything else maps to `Unknown`.

use pkg_types::runtime::RuntimeStatus;

/// Docker `.State.Status` values.
pub fn map_docker_status(raw: &str) -> RuntimeStatus {
    match raw.trim().to_ascii_lowercase().as_str() {
        "created" => RuntimeStatus::Created,
        "running" => RuntimeStatus::Running,
        "paused" => RuntimeStatus::Paused,
        "exited" | "dead" => RuntimeStatus::Exited,
        // restarting, removing, and anything a newer engine invents
        _ => RuntimeStatus::Unknown,
    }
}

/// Podman `.State.Status` values.
pub fn map_podman_status(raw: &str) -> RuntimeStatus {
    match raw.trim().to_ascii_lowercase().as_str() {
        "created" | "configured" | "initialized" => RuntimeStatus::Created,
        "running" => RuntimeStatus::Running,
        "paused" => RuntimeStatus::Paused,
        "exited" | "stopped" => RuntimeStatus::Exited,
        _ => RuntimeStatus::Unknown,
    }
}

/// Pull `Status` out of `inspect --format '{{json .State}}'` output.
pub fn status_from_state_json(text: &str) -> Option<String> {
    let v: serde_json::Value = serde_json::from_str(text.trim()).ok()?;
    v.get("Status")
        .or_else(|| v.get("status"))
        .and_then(|s| s.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docker_table() {
        assert_eq!(map_docker_status("running"), RuntimeStatus::Running);
        assert_eq!(map_docker_status("created"), RuntimeStatus::Created);
        assert_eq!(map_docker_status("paused"), RuntimeStatus::Paused);
        assert_eq!(map_docker_status("exited"), RuntimeStatus::Exited);
        assert_eq!(map_docker_status("dead"), RuntimeStatus::Exited);
        assert_eq!(map_docker_status("restarting"), RuntimeStatus::Unknown);
        assert_eq!(map_docker_status("removing"), RuntimeStatus::Unknown);
        assert_eq!(map_docker_status(""), RuntimeStatus::Unknown);
    }

    #[test]
    fn test_podman_table() {
        assert_eq!(map_podman_status("configured"), RuntimeStatus::Created);
        assert_eq!(map_podman_status("initialized"), RuntimeStatus::Created);
        assert_eq!(map_podman_status("Running"), RuntimeStatus::Running);
        assert_eq!(map_podman_status("stopped"), RuntimeStatus::Exited);
        assert_eq!(map_podman_status("exited"), RuntimeStatus::Exited);
        assert_eq!(map_podman_status("stopping"), RuntimeStatus::Unknown);
        assert_eq!(map_podman_status("dead"), RuntimeStatus::Unknown);
    }

    #[test]
    fn test_state_json() {
        let text = r#"{"Status":"running","Running":true,"Paused":false,"Pid":4242}"#;
        assert_eq!(status_from_state_json(text).as_deref(), Some("running"));
        assert_eq!(status_from_state_json("not json"), None);
        assert_eq!(status_from_state_json("{}"), None);
    }
}
