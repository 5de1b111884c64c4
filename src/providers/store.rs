//! Auth profile persistence
//!
//! A single JSON file rewritten atomically, with permissions restricted to
//! the owner since it carries credentials.

use std::path::PathBuf;

use crate::Result;

use super::AuthProfile;

/// File-backed store for auth profile state
pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    /// Create a store at the given path
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load the persisted profiles; missing file yields an empty list.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be parsed.
    pub fn load(&self) -> Result<Vec<AuthProfile>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Persist all profiles atomically with owner-only permissions.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn save(&self, profiles: &[AuthProfile]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(profiles)?)?;
        restrict_permissions(&tmp)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &std::path::Path) -> Result<()> {
    Ok(())
}
