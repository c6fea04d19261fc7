use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level receiver config, loaded from TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceiverConfig {
    #[serde(default)]
    pub registrar: RegistrarConfig,
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// Registrar section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrarConfig {
    /// HTTP endpoint registration requests are POSTed to.
    pub endpoint: Option<String>,
}

/// Push socket section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketConfig {
    /// WebSocket URL of the push relay.
    pub endpoint: Option<String>,
    /// Keepalive ping interval.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

fn default_ping_interval_secs() -> u64 {
    30
}

/// Session supervisor section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Minimum time between accepted reconnect triggers.
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,
    #[serde(default)]
    pub credential_policy: CredentialPolicy,
    #[serde(default)]
    pub suppressed_closure: SuppressedClosurePolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            debounce_secs: default_debounce_secs(),
            credential_policy: CredentialPolicy::default(),
            suppressed_closure: SuppressedClosurePolicy::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }
}

fn default_debounce_secs() -> u64 {
    10
}

/// Whether a stored credential may stand in for a fresh registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialPolicy {
    /// Reuse the stored credential when it was issued for the same appID.
    #[default]
    ReuseMatchingApp,
    /// Register on every start.
    AlwaysRegister,
}

/// What happens to a closure signal that lands inside the debounce window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressedClosurePolicy {
    /// Report it and do nothing else. A closed socket then stays down until a
    /// later closure signal arrives outside the window.
    #[default]
    Drop,
    /// Report it and, unless a reconnect is already running, retry once when
    /// the window ends.
    Deferred,
}

/// Credential store section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path of the JSON credential file.
    pub path: Option<PathBuf>,
}

impl ReceiverConfig {
    /// `$CONFIG_DIR/push-receiver/config.toml`, or a relative fallback.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("push-receiver")
            .join("config.toml")
    }

    /// Load config from a TOML file path. Returns None if file doesn't exist.
    ///
    /// Checks file permissions and warns if world-readable.
    pub fn load(path: &std::path::Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        // Warn if the config file is world-readable (carries an API endpoint
        // and is next to the credential store).
        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    /// Save config to a TOML file path.
    pub fn save(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, contents)
            .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Errors that can occur when loading or saving config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    WriteFailed(PathBuf, std::io::Error),
    SerializeFailed(toml::ser::Error),
    /// A required setting is absent from both the file and the command line.
    Missing(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::WriteFailed(path, e) => {
                write!(f, "Failed to write config {}: {}", path.display(), e)
            }
            Self::SerializeFailed(e) => write!(f, "Failed to serialize config: {}", e),
            Self::Missing(key) => write!(f, "Missing required setting: {}", key),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Check file permissions on a config file and warn if world-readable.
#[cfg(unix)]
pub fn check_config_permissions(path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "Config file {} is world-readable (mode {:o}). \
             Consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

/// No-op on non-Unix platforms.
#[cfg(not(unix))]
pub fn check_config_permissions(_path: &std::path::Path) {}

/// Returns true if the given file mode has the world-readable bit set.
#[cfg(unix)]
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: ReceiverConfig = toml::from_str("").unwrap();
        assert_eq!(config, ReceiverConfig::default());
        assert_eq!(config.supervisor.debounce(), Duration::from_secs(10));
        assert_eq!(config.supervisor.credential_policy, CredentialPolicy::ReuseMatchingApp);
        assert_eq!(config.supervisor.suppressed_closure, SuppressedClosurePolicy::Drop);
        assert_eq!(config.socket.ping_interval_secs, 30);
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            [registrar]
            endpoint = "https://push.example.com/register"

            [socket]
            endpoint = "wss://push.example.com/socket"
            ping_interval_secs = 15

            [supervisor]
            debounce_secs = 3
            credential_policy = "always_register"
            suppressed_closure = "deferred"

            [store]
            path = "/var/lib/app/credentials.json"
        "#;
        let config: ReceiverConfig = toml::from_str(toml).unwrap();
        assert_eq!(
            config.registrar.endpoint.as_deref(),
            Some("https://push.example.com/register")
        );
        assert_eq!(config.socket.ping_interval_secs, 15);
        assert_eq!(config.supervisor.debounce(), Duration::from_secs(3));
        assert_eq!(config.supervisor.credential_policy, CredentialPolicy::AlwaysRegister);
        assert_eq!(config.supervisor.suppressed_closure, SuppressedClosurePolicy::Deferred);
        assert_eq!(
            config.store.path.as_deref(),
            Some(std::path::Path::new("/var/lib/app/credentials.json"))
        );
    }

    #[test]
    fn unknown_policy_is_rejected() {
        let toml = r#"
            [supervisor]
            credential_policy = "sometimes"
        "#;
        assert!(toml::from_str::<ReceiverConfig>(toml).is_err());
    }

    #[test]
    fn load_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = ReceiverConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn load_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[supervisor\n").unwrap();
        assert!(matches!(
            ReceiverConfig::load(&path),
            Err(ConfigError::ParseFailed(..))
        ));
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.toml");
        let mut config = ReceiverConfig::default();
        config.socket.endpoint = Some("wss://relay".into());
        config.supervisor.suppressed_closure = SuppressedClosurePolicy::Deferred;

        config.save(&path).unwrap();
        let loaded = ReceiverConfig::load(&path).unwrap().unwrap();
        assert_eq!(loaded, config);
    }

    #[cfg(unix)]
    #[test]
    fn is_world_readable_detects_644() {
        assert!(is_world_readable(0o644));
    }

    #[cfg(unix)]
    #[test]
    fn is_world_readable_rejects_600() {
        assert!(!is_world_readable(0o600));
    }
}
