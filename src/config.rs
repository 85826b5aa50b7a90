//! Ambient runtime configuration: storage paths and timing knobs, layered
//! from an optional TOML file and `CCSWARM_COORD_*` environment overrides.
//!
//! This is deliberately not a CLI argument parser — the tool surface this
//! crate exposes is driven by a coordinator agent, not a shell.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorRuntimeConfig {
    /// Directory persisted session documents live under.
    pub sessions_dir: PathBuf,
    /// Default `poll_messages` wait when the tool call doesn't specify one.
    pub default_poll_wait_secs: u64,
    /// Age (in hours) after which a pending permission is swept by
    /// `clear_expired_permissions`.
    pub default_permission_max_age_hours: i64,
    /// `check_agent_health` staleness threshold, in minutes.
    pub default_stale_minutes: i64,
}

impl Default for CoordinatorRuntimeConfig {
    fn default() -> Self {
        Self {
            sessions_dir: default_sessions_dir(),
            default_poll_wait_secs: 30,
            default_permission_max_age_hours: 24,
            default_stale_minutes: 10,
        }
    }
}

fn default_sessions_dir() -> PathBuf {
    dirs_sessions_dir().unwrap_or_else(|| PathBuf::from(".ccswarm/coordination"))
}

fn dirs_sessions_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".ccswarm/coordination"))
}

impl CoordinatorRuntimeConfig {
    pub fn default_poll_wait(&self) -> Duration {
        Duration::from_secs(self.default_poll_wait_secs)
    }

    /// Load layered configuration: built-in defaults, then an optional TOML
    /// file at `path` if it exists, then `CCSWARM_COORD_*` environment
    /// overrides.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let defaults = Self::default();
        let mut builder = config::Config::builder()
            .set_default("sessions_dir", defaults.sessions_dir.to_string_lossy().to_string())?
            .set_default("default_poll_wait_secs", defaults.default_poll_wait_secs)?
            .set_default(
                "default_permission_max_age_hours",
                defaults.default_permission_max_age_hours,
            )?
            .set_default("default_stale_minutes", defaults.default_stale_minutes)?;

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("CCSWARM_COORD").separator("__"),
        );

        builder.build()?.try_deserialize()
    }
}
