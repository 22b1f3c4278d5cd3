//! Environment-driven configuration for the coordinator and worker binaries.
//!
//! Values come from `SWITCHBOARD_*` environment variables. The constructors
//! take a lookup closure so tests can feed a plain map instead of mutating
//! process environment.

use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

// ---------------------------------------------------------------------------
// CoordinatorConfig
// ---------------------------------------------------------------------------

/// Configuration for the coordinator process.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Shared secret workers must present at registration.
    pub shared_secret: String,
    /// Port the transport server listens on.
    pub port: u16,
    pub chat_token: Option<String>,
    pub guild_id: Option<String>,
    /// User ids allowed to issue commands; empty means everyone.
    pub allowed_users: Vec<String>,
    pub status_channel: Option<String>,
    pub worker_channel: Option<String>,
    pub token_channel: Option<String>,
    pub team_channel: Option<String>,
    pub schedule_channel: Option<String>,
}

impl CoordinatorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let shared_secret = require(&lookup, "SWITCHBOARD_SHARED_SECRET")?;
        let port = match lookup("SWITCHBOARD_PORT") {
            Some(raw) => raw.parse::<u16>().map_err(|e| ConfigError::Invalid {
                var: "SWITCHBOARD_PORT",
                reason: e.to_string(),
            })?,
            None => default_port(),
        };

        Ok(Self {
            shared_secret,
            port,
            chat_token: lookup("SWITCHBOARD_CHAT_TOKEN"),
            guild_id: lookup("SWITCHBOARD_GUILD_ID"),
            allowed_users: csv(lookup("SWITCHBOARD_ALLOWED_USERS")),
            status_channel: lookup("SWITCHBOARD_STATUS_CHANNEL"),
            worker_channel: lookup("SWITCHBOARD_WORKER_CHANNEL"),
            token_channel: lookup("SWITCHBOARD_TOKEN_CHANNEL"),
            team_channel: lookup("SWITCHBOARD_TEAM_CHANNEL"),
            schedule_channel: lookup("SWITCHBOARD_SCHEDULE_CHANNEL"),
        })
    }
}

// ---------------------------------------------------------------------------
// WorkerConfig
// ---------------------------------------------------------------------------

/// Configuration for a worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Coordinator WebSocket URL, e.g. `ws://host:9740/ws`.
    pub coordinator_url: String,
    pub shared_secret: String,
    /// Self-declared worker name; must be unique per coordinator.
    pub name: String,
    pub default_cwd: PathBuf,
    /// Directories tasks may run in; empty means only the default cwd.
    pub allowed_dirs: Vec<PathBuf>,
    pub log_level: String,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let coordinator_url = require(&lookup, "SWITCHBOARD_URL")?;
        let shared_secret = require(&lookup, "SWITCHBOARD_SHARED_SECRET")?;
        let name = require(&lookup, "SWITCHBOARD_WORKER_NAME")?;
        let default_cwd = PathBuf::from(require(&lookup, "SWITCHBOARD_DEFAULT_CWD")?);
        let allowed_dirs: Vec<PathBuf> = csv(lookup("SWITCHBOARD_ALLOWED_DIRS"))
            .into_iter()
            .map(PathBuf::from)
            .collect();

        Ok(Self {
            coordinator_url,
            shared_secret,
            name,
            default_cwd,
            allowed_dirs,
            log_level: lookup("SWITCHBOARD_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Directories this worker accepts as a task cwd.
    ///
    /// The default cwd and its subtree are always allowed, whether or not
    /// they appear in the configured list.
    pub fn is_dir_allowed(&self, dir: &std::path::Path) -> bool {
        if dir.starts_with(&self.default_cwd) {
            return true;
        }
        self.allowed_dirs.iter().any(|allowed| dir.starts_with(allowed))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn default_port() -> u16 {
    9740
}

fn require(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<String, ConfigError> {
    match lookup(var) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(var)),
    }
}

fn csv(raw: Option<String>) -> Vec<String> {
    raw.map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn coordinator_config_requires_secret() {
        let vars = env(&[]);
        let err = CoordinatorConfig::from_lookup(|k| vars.get(k).cloned()).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("SWITCHBOARD_SHARED_SECRET")));
    }

    #[test]
    fn coordinator_config_defaults_port() {
        let vars = env(&[("SWITCHBOARD_SHARED_SECRET", "s3cret")]);
        let cfg = CoordinatorConfig::from_lookup(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(cfg.port, 9740);
        assert!(cfg.allowed_users.is_empty());
    }

    #[test]
    fn coordinator_config_rejects_bad_port() {
        let vars = env(&[
            ("SWITCHBOARD_SHARED_SECRET", "s3cret"),
            ("SWITCHBOARD_PORT", "not-a-port"),
        ]);
        let err = CoordinatorConfig::from_lookup(|k| vars.get(k).cloned()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "SWITCHBOARD_PORT", .. }));
    }

    #[test]
    fn coordinator_config_parses_allowed_users() {
        let vars = env(&[
            ("SWITCHBOARD_SHARED_SECRET", "s3cret"),
            ("SWITCHBOARD_ALLOWED_USERS", "101, 202,,303"),
        ]);
        let cfg = CoordinatorConfig::from_lookup(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(cfg.allowed_users, vec!["101", "202", "303"]);
    }

    #[test]
    fn worker_config_reads_all_fields() {
        let vars = env(&[
            ("SWITCHBOARD_URL", "ws://localhost:9740/ws"),
            ("SWITCHBOARD_SHARED_SECRET", "s3cret"),
            ("SWITCHBOARD_WORKER_NAME", "w1"),
            ("SWITCHBOARD_DEFAULT_CWD", "/home/dev/project"),
            ("SWITCHBOARD_ALLOWED_DIRS", "/home/dev,/srv/work"),
        ]);
        let cfg = WorkerConfig::from_lookup(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(cfg.name, "w1");
        assert_eq!(cfg.allowed_dirs.len(), 2);
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn worker_allowlist_includes_default_cwd() {
        let vars = env(&[
            ("SWITCHBOARD_URL", "ws://localhost:9740/ws"),
            ("SWITCHBOARD_SHARED_SECRET", "s3cret"),
            ("SWITCHBOARD_WORKER_NAME", "w1"),
            ("SWITCHBOARD_DEFAULT_CWD", "/home/dev/project"),
        ]);
        let cfg = WorkerConfig::from_lookup(|k| vars.get(k).cloned()).unwrap();
        assert!(cfg.is_dir_allowed(std::path::Path::new("/home/dev/project")));
        assert!(!cfg.is_dir_allowed(std::path::Path::new("/etc")));
    }

    #[test]
    fn worker_allowlist_matches_subdirectories() {
        let vars = env(&[
            ("SWITCHBOARD_URL", "ws://localhost:9740/ws"),
            ("SWITCHBOARD_SHARED_SECRET", "s3cret"),
            ("SWITCHBOARD_WORKER_NAME", "w1"),
            ("SWITCHBOARD_DEFAULT_CWD", "/home/dev/project"),
            ("SWITCHBOARD_ALLOWED_DIRS", "/srv/work"),
        ]);
        let cfg = WorkerConfig::from_lookup(|k| vars.get(k).cloned()).unwrap();
        assert!(cfg.is_dir_allowed(std::path::Path::new("/srv/work/repo")));
        assert!(!cfg.is_dir_allowed(std::path::Path::new("/srv/other")));
    }
}
