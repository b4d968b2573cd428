use anyhow::{Result, bail};

/// Validate a container / instance name as the container engines accept it.
/// Rules: `[a-zA-Z0-9][a-zA-Z0-9_.-]*`, max 128 chars.
pub fn validate_container_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("container name must not be empty");
    }
    if name.len() > 128 {
        bail!(
            "container name '{}' exceeds 128 characters (got {})",
            name,
            name.len()
        );
    }
    if !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        bail!("container name '{}' must start with a letter or digit", name);
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
    {
        bail!(
            "container name '{}' must contain only letters, digits, '_', '.' and '-'",
            name
        );
    }
    Ok(())
}
