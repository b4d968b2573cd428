//! UEFI firmware discovery for the native backend.
//!
//! The guest boots from OVMF. Two files are needed: the read-only firmware
//! code and a variable-store template that is copied once per instance.
//!
//! Search order:
//!
//! ```text
//! ~/.winboat/firmware/OVMF_CODE.fd + OVMF_VARS.fd   # user override
//! /usr/share/OVMF/...                               # distro packages
//! /opt/homebrew/share/qemu/...                      # Homebrew
//! ```
//!
//! On Debian/Ubuntu install `ovmf`, on Fedora `edk2-ovmf`, on macOS
//! `brew install qemu`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use pkg_constants::paths::{FIRMWARE_CANDIDATES, FIRMWARE_DIR};
use pkg_types::error::RuntimeError;

/// A firmware code image and its matching vars template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwarePair {
    pub code: PathBuf,
    pub vars_template: PathBuf,
}

/// Locates firmware for the QEMU backend.
pub struct FirmwareLocator {
    /// Checked before the system locations.
    override_dir: Option<PathBuf>,
    candidates: Vec<(PathBuf, PathBuf)>,
}

impl FirmwareLocator {
    /// Search `<app_dir>/firmware` and then the well-known system paths.
    pub fn new(app_dir: &Path) -> Self {
        Self {
            override_dir: Some(app_dir.join(FIRMWARE_DIR)),
            candidates: FIRMWARE_CANDIDATES
                .iter()
                .map(|(c, v)| (PathBuf::from(c), PathBuf::from(v)))
                .collect(),
        }
    }

    /// Only consider one explicit pair.
    pub fn with_pair(code: &Path, vars_template: &Path) -> Self {
        Self {
            override_dir: None,
            candidates: vec![(code.to_path_buf(), vars_template.to_path_buf())],
        }
    }

    fn all_candidates(&self) -> Vec<(PathBuf, PathBuf)> {
        let mut out = Vec::new();
        if let Some(dir) = &self.override_dir {
            out.push((dir.join("OVMF_CODE.fd"), dir.join("OVMF_VARS.fd")));
        }
        out.extend(self.candidates.iter().cloned());
        out
    }

    /// First candidate whose code image exists, with whether its vars template
    /// exists too. Used by host probing.
    pub fn probe(&self) -> (bool, bool) {
        self.all_candidates()
            .into_iter()
            .find(|(code, _)| code.exists())
            .map(|(_, vars)| (true, vars.exists()))
            .unwrap_or((false, false))
    }

    /// Resolve a complete pair or fail with `PrerequisiteMissing`.
    pub fn locate(&self) -> Result<FirmwarePair> {
        let candidates = self.all_candidates();
        for (code, vars) in &candidates {
            if code.exists() && vars.exists() {
                info!("[qemu] using firmware {}", code.display());
                return Ok(FirmwarePair {
                    code: code.clone(),
                    vars_template: vars.clone(),
                });
            }
        }
        if let Some((code, vars)) = candidates.iter().find(|(code, _)| code.exists()) {
            warn!(
                "[qemu] firmware {} found without vars template {}",
                code.display(),
                vars.display()
            );
            return Err(RuntimeError::missing(format!(
                "UEFI vars template ({})",
                vars.display()
            ))
            .into());
        }
        warn!("[qemu] no UEFI firmware found; install OVMF (ovmf / edk2-ovmf / qemu)");
        Err(RuntimeError::missing("UEFI firmware (OVMF_CODE.fd)").into())
    }
}

/// Copy the vars template to `dest` unless the instance already has one.
pub fn ensure_vars(pair: &FirmwarePair, dest: &Path) -> Result<()> {
    if dest.exists() {
        return Ok(());
    }
    std::fs::copy(&pair.vars_template, dest).with_context(|| {
        format!(
            "failed to copy {} to {}",
            pair.vars_template.display(),
            dest.display()
        )
    })?;
    info!("[qemu] created UEFI vars at {}", dest.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locate_explicit_pair() {
        let dir = tempfile::tempdir().unwrap();
        let code = dir.path().join("CODE.fd");
        let vars = dir.path().join("VARS.fd");
        std::fs::write(&code, b"code").unwrap();
        std::fs::write(&vars, b"vars").unwrap();

        let pair = FirmwareLocator::with_pair(&code, &vars).locate().unwrap();
        assert_eq!(pair.code, code);
        assert_eq!(pair.vars_template, vars);
    }

    #[test]
    fn test_missing_vars_is_prerequisite_error() {
        let dir = tempfile::tempdir().unwrap();
        let code = dir.path().join("CODE.fd");
        std::fs::write(&code, b"code").unwrap();
        let locator = FirmwareLocator::with_pair(&code, &dir.path().join("VARS.fd"));

        assert_eq!(locator.probe(), (true, false));
        let err = locator.locate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RuntimeError>(),
            Some(RuntimeError::PrerequisiteMissing { .. })
        ));
    }

    #[test]
    fn test_override_dir_checked_first() {
        let app = tempfile::tempdir().unwrap();
        let fw = app.path().join(FIRMWARE_DIR);
        std::fs::create_dir_all(&fw).unwrap();
        std::fs::write(fw.join("OVMF_CODE.fd"), b"c").unwrap();
        std::fs::write(fw.join("OVMF_VARS.fd"), b"v").unwrap();

        let pair = FirmwareLocator::new(app.path()).locate().unwrap();
        assert_eq!(pair.code, fw.join("OVMF_CODE.fd"));
    }

    #[test]
    fn test_ensure_vars_copies_once() {
        let dir = tempfile::tempdir().unwrap();
        let pair = FirmwarePair {
            code: dir.path().join("CODE.fd"),
            vars_template: dir.path().join("VARS.fd"),
        };
        std::fs::write(&pair.vars_template, b"template").unwrap();
        let dest = dir.path().join("OVMF_VARS.fd");

        ensure_vars(&pair, &dest).unwrap();
        std::fs::write(&dest, b"modified by guest").unwrap();
        ensure_vars(&pair, &dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"modified by guest");
    }
}
