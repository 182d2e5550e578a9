//! Repository configuration (`.estuary/config.toml`).
//!
//! Typed sections with per-field defaults; a missing file means all
//! defaults and is not an error. Unknown fields are rejected so typos
//! fail loudly instead of silently doing nothing.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::merge::check::CollisionPolicy;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level repository configuration.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EstuaryConfig {
    /// Update/checkout behaviour.
    #[serde(default)]
    pub update: UpdateConfig,

    /// Merge behaviour.
    #[serde(default)]
    pub merge: MergeConfig,

    /// Worker pool sizing.
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Lock timing.
    #[serde(default)]
    pub lock: LockConfig,
}

impl EstuaryConfig {
    /// Load from `<meta_dir>/config.toml`. Missing file → defaults.
    pub fn load(meta_dir: &Path) -> Result<Self, ConfigError> {
        let path = meta_dir.join("config.toml");
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(ConfigError { path: Some(path), message: e.to_string() });
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError { path: Some(path), message: e.to_string() })
    }
}

// ---------------------------------------------------------------------------
// UpdateConfig
// ---------------------------------------------------------------------------

/// How `update` treats dirty working copies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateCheck {
    /// Permit any update; dirty files are merged along.
    None,
    /// Permit updates to linear descendants/ancestors only when dirty.
    #[default]
    Linear,
    /// Permit updates only when they cannot produce conflicts.
    NoConflict,
}

impl fmt::Display for UpdateCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Linear => write!(f, "linear"),
            Self::NoConflict => write!(f, "noconflict"),
        }
    }
}

/// Update/checkout behaviour.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateConfig {
    /// Opt into the native bulk-checkout fast path for clean updates.
    #[serde(default)]
    pub native_checkout: bool,

    /// Default dirty-working-copy rule when the caller passes none.
    #[serde(default)]
    pub default_check: UpdateCheck,
}

// ---------------------------------------------------------------------------
// MergeConfig
// ---------------------------------------------------------------------------

/// Merge behaviour.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeConfig {
    /// Policy for differing untracked files in the way of a checkout.
    #[serde(default)]
    pub unknown_policy: CollisionPolicy,

    /// Policy for differing *ignored* untracked files.
    #[serde(default = "default_ignored_policy")]
    pub ignored_policy: CollisionPolicy,

    /// Glob patterns classifying untracked files as ignored.
    #[serde(default)]
    pub ignore: Vec<String>,

    /// External merge driver command, run through `sh -c`.
    #[serde(default)]
    pub driver: Option<String>,

    /// Cap on stale-input retries per file merge.
    #[serde(default = "default_premerge_retries")]
    pub premerge_retries: u32,

    /// Refuse plans whose result collides under case folding.
    #[serde(default)]
    pub check_case_collisions: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            unknown_policy: CollisionPolicy::default(),
            ignored_policy: default_ignored_policy(),
            ignore: Vec::new(),
            driver: None,
            premerge_retries: default_premerge_retries(),
            check_case_collisions: false,
        }
    }
}

const fn default_ignored_policy() -> CollisionPolicy {
    CollisionPolicy::Warn
}

const fn default_premerge_retries() -> u32 {
    3
}

// ---------------------------------------------------------------------------
// WorkerConfig
// ---------------------------------------------------------------------------

/// Worker pool sizing; 0 disables a pool (serial execution).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    #[serde(default = "default_workers")]
    pub remove_workers: usize,
    #[serde(default = "default_workers")]
    pub write_workers: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { remove_workers: default_workers(), write_workers: default_workers() }
    }
}

const fn default_workers() -> usize {
    4
}

// ---------------------------------------------------------------------------
// LockConfig
// ---------------------------------------------------------------------------

/// Lock acquisition timing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockConfig {
    #[serde(default = "default_lock_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_lock_warn")]
    pub warn_after_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { timeout_secs: default_lock_timeout(), warn_after_secs: default_lock_warn() }
    }
}

const fn default_lock_timeout() -> u64 {
    60
}

const fn default_lock_warn() -> u64 {
    5
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// A configuration file could not be read or parsed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigError {
    pub path: Option<PathBuf>,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "configuration error in '{}': {}", path.display(), self.message),
            None => write!(f, "configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EstuaryConfig::load(dir.path()).unwrap();
        assert_eq!(config, EstuaryConfig::default());
        assert_eq!(config.merge.premerge_retries, 3);
        assert_eq!(config.update.default_check, UpdateCheck::Linear);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            r#"
[merge]
unknown_policy = "warn"
ignore = ["*.log", "target/**"]
"#,
        )
        .unwrap();
        let config = EstuaryConfig::load(dir.path()).unwrap();
        assert_eq!(config.merge.unknown_policy, CollisionPolicy::Warn);
        assert_eq!(config.merge.ignore.len(), 2);
        assert_eq!(config.workers.write_workers, 4, "untouched section defaults");
    }

    #[test]
    fn full_file_round_trips_every_section() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            r#"
[update]
native_checkout = true
default_check = "noconflict"

[merge]
unknown_policy = "ignore"
ignored_policy = "ignore"
driver = "scripts/lockfile-driver.sh"
premerge_retries = 1
check_case_collisions = true

[workers]
remove_workers = 8
write_workers = 2

[lock]
timeout_secs = 10
warn_after_secs = 1
"#,
        )
        .unwrap();
        let config = EstuaryConfig::load(dir.path()).unwrap();
        assert!(config.update.native_checkout);
        assert_eq!(config.update.default_check, UpdateCheck::NoConflict);
        assert_eq!(config.merge.driver.as_deref(), Some("scripts/lockfile-driver.sh"));
        assert_eq!(config.merge.premerge_retries, 1);
        assert!(config.merge.check_case_collisions);
        assert_eq!(config.workers.remove_workers, 8);
        assert_eq!(config.lock.timeout_secs, 10);
    }

    #[test]
    fn unknown_field_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "[merge]\nno_such_knob = true\n").unwrap();
        let err = EstuaryConfig::load(dir.path()).unwrap_err();
        assert!(err.message.contains("no_such_knob") || err.message.contains("unknown field"));
    }

    #[test]
    fn malformed_toml_is_an_error_with_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "not toml [").unwrap();
        let err = EstuaryConfig::load(dir.path()).unwrap_err();
        assert!(err.path.is_some());
    }
}
