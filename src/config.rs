use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::KilnError;

/// How the snapshotter treats symbolic links.
///
/// The policy is fixed for a whole build session, so a given link is always
/// classified the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SymlinkPolicy {
    /// Record the link itself (its target path) as a distinct snapshot kind.
    #[default]
    Record,
    /// Snapshot whatever the link points to.
    Follow,
}

/// Settings for a build session.
///
/// ```rust
/// use kiln::Settings;
///
/// let settings = Settings::new().cache_dir(".cache/kiln").threads(4).fail_fast(false);
/// assert_eq!(settings.threads, 4);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Settings {
    /// Directory holding the history and output ownership stores.
    pub cache_dir: Utf8PathBuf,
    /// Worker threads used to execute work items, `0` picks the rayon default.
    pub threads: usize,
    /// Stop starting new work items after the first failure.
    pub fail_fast: bool,
    /// Symbolic link handling during snapshotting.
    pub symlinks: SymlinkPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_dir: Utf8PathBuf::from(".kiln"),
            threads: 0,
            fail_fast: true,
            symlinks: SymlinkPolicy::default(),
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads settings from JSON, missing keys fall back to their defaults.
    pub fn from_json(json: &str) -> Result<Self, KilnError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn cache_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn symlinks(mut self, policy: SymlinkPolicy) -> Self {
        self.symlinks = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.cache_dir, Utf8PathBuf::from(".kiln"));
        assert!(settings.fail_fast);
        assert_eq!(settings.symlinks, SymlinkPolicy::Record);
    }

    #[test]
    fn test_from_json_partial() {
        let settings = Settings::from_json(r#"{"threads": 2, "symlinks": "follow"}"#).unwrap();
        assert_eq!(settings.threads, 2);
        assert_eq!(settings.symlinks, SymlinkPolicy::Follow);
        assert_eq!(settings.cache_dir, Utf8PathBuf::from(".kiln"));
    }

    #[test]
    fn test_from_json_invalid() {
        assert!(matches!(
            Settings::from_json(r#"{"threads": "many"}"#),
            Err(KilnError::Settings(_))
        ));
    }
}
