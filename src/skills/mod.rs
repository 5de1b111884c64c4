//! Skills
//!
//! A skill is a directory carrying a `skill.toml` manifest whose
//! instructions join the layered system prompt when enabled. Authoring
//! tooling lives outside the gateway; this module only discovers manifests
//! and reports status.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Manifest file name inside each skill directory
const MANIFEST_NAME: &str = "skill.toml";

/// Parsed skill manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillManifest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Prompt overlay injected when the skill is enabled
    #[serde(default)]
    pub instructions: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

const fn default_enabled() -> bool {
    true
}

/// One discovered skill
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillStatus {
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub path: PathBuf,
}

/// Discovered skills, rescannable at runtime
#[derive(Default)]
pub struct SkillRegistry {
    skills: Mutex<Vec<(SkillManifest, PathBuf)>>,
}

impl SkillRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan the configured directories for skill manifests. Replaces the
    /// current set; unreadable manifests are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error when the registry lock is poisoned.
    pub fn scan(&self, dirs: &[PathBuf]) -> Result<usize> {
        let mut found = Vec::new();
        for dir in dirs {
            if !dir.is_dir() {
                continue;
            }
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let manifest_path = entry.path().join(MANIFEST_NAME);
                if !manifest_path.is_file() {
                    continue;
                }
                match load_manifest(&manifest_path) {
                    Ok(manifest) => {
                        tracing::debug!(skill = %manifest.name, "skill discovered");
                        found.push((manifest, entry.path()));
                    }
                    Err(e) => {
                        tracing::warn!(path = %manifest_path.display(), error = %e, "bad skill manifest");
                    }
                }
            }
        }
        found.sort_by(|a, b| a.0.name.cmp(&b.0.name));

        let count = found.len();
        let mut guard = self
            .skills
            .lock()
            .map_err(|_| crate::Error::Internal("skill registry lock poisoned".to_string()))?;
        *guard = found;
        Ok(count)
    }

    /// Instructions of every enabled skill, in name order
    #[must_use]
    pub fn enabled_instructions(&self) -> Vec<String> {
        self.skills
            .lock()
            .map(|skills| {
                skills
                    .iter()
                    .filter(|(m, _)| m.enabled && !m.instructions.trim().is_empty())
                    .map(|(m, _)| m.instructions.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Status rows for `skills.status`
    #[must_use]
    pub fn status(&self) -> Vec<SkillStatus> {
        self.skills
            .lock()
            .map(|skills| {
                skills
                    .iter()
                    .map(|(m, path)| SkillStatus {
                        name: m.name.clone(),
                        description: m.description.clone(),
                        enabled: m.enabled,
                        path: path.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn load_manifest(path: &Path) -> Result<SkillManifest> {
    let raw = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_skill(root: &Path, dir: &str, body: &str) {
        let skill_dir = root.join(dir);
        std::fs::create_dir_all(&skill_dir).unwrap();
        std::fs::write(skill_dir.join(MANIFEST_NAME), body).unwrap();
    }

    #[test]
    fn scan_discovers_manifests() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(
            dir.path(),
            "weather",
            r#"
                name = "weather"
                description = "Weather lookups"
                instructions = "You can check the weather."
            "#,
        );
        write_skill(
            dir.path(),
            "disabled",
            r#"
                name = "disabled"
                instructions = "Hidden."
                enabled = false
            "#,
        );

        let registry = SkillRegistry::new();
        let count = registry.scan(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(count, 2);

        let instructions = registry.enabled_instructions();
        assert_eq!(instructions, vec!["You can check the weather.".to_string()]);

        let status = registry.status();
        assert_eq!(status.len(), 2);
        assert!(status.iter().any(|s| s.name == "disabled" && !s.enabled));
    }

    #[test]
    fn rescan_replaces_previous_set() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "one", "name = \"one\"\ninstructions = \"a\"");
        let registry = SkillRegistry::new();
        registry.scan(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(registry.status().len(), 1);

        let empty = tempfile::tempdir().unwrap();
        registry.scan(&[empty.path().to_path_buf()]).unwrap();
        assert!(registry.status().is_empty());
    }

    #[test]
    fn missing_dirs_are_tolerated() {
        let registry = SkillRegistry::new();
        let count = registry.scan(&[PathBuf::from("/nope/absent")]).unwrap();
        assert_eq!(count, 0);
    }
}
