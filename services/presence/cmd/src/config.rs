//! Configuration handling for the presence service.
//!
//! Values come from the YAML config file, then environment variables, then
//! command line flags, each layer overriding the one before.

use anyhow::{Context, Result};
use presence_session::{ActivityLabels, Endpoint, SessionConfig, DEFAULT_ENDPOINT_NAME};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Presence service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Application client id sent in the handshake
    pub client_id: Option<String>,
    /// Well-known endpoint name inside the runtime directory
    pub endpoint_name: String,
    /// Explicit endpoint path, bypassing discovery
    pub endpoint_path: Option<String>,
    /// Host application name shown on the large image
    pub application_name: String,
    /// State text used when no category label is known
    pub fallback_state: String,
    /// Secret placed in every activity's `secrets.match`
    pub match_secret: String,
    /// Time between connect attempts
    pub reconnect_interval: Duration,
    /// Time between presence refreshes
    pub update_interval: Duration,
    /// Upper bound on one connect attempt
    pub connect_timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            client_id: None,
            endpoint_name: DEFAULT_ENDPOINT_NAME.to_string(),
            endpoint_path: None,
            application_name: session.labels.application_name,
            fallback_state: session.labels.fallback_state,
            match_secret: session.labels.match_secret,
            reconnect_interval: session.reconnect_interval,
            update_interval: session.update_interval,
            connect_timeout: session.connect_timeout,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    presence: Option<FileConfig>,
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    client_id: Option<String>,
    endpoint_name: Option<String>,
    endpoint_path: Option<String>,
    application_name: Option<String>,
    fallback_state: Option<String>,
    match_secret: Option<String>,
    reconnect_interval: Option<String>,
    update_interval: Option<String>,
    connect_timeout: Option<String>,
}

impl PresenceConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root_config) => {
                    config.apply_root_config(root_config)?;
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => {
                    warn!(
                        "Failed to parse config file {:?}: {}; using defaults",
                        config_path.as_ref(),
                        e
                    );
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", config_path.as_ref());
            }
        }

        config.apply_environment_overrides(|var| std::env::var(var).ok())?;

        info!(
            "Presence configuration: endpoint={:?}, reconnect={:?}, update={:?}, client_id={}",
            config.endpoint().path(),
            config.reconnect_interval,
            config.update_interval,
            if config.client_id.is_some() { "set" } else { "missing" }
        );

        Ok(config)
    }

    /// Re-read only the client id, for resolving it at handshake time
    pub fn read_client_id<P: AsRef<Path>>(config_path: P) -> Option<String> {
        let content = std::fs::read_to_string(config_path).ok()?;
        let root: RootConfig = serde_yaml::from_str(&content).ok()?;
        root.presence?.client_id.filter(|id| !id.is_empty())
    }

    /// Apply configuration from the root config structure
    fn apply_root_config(&mut self, root_config: RootConfig) -> Result<()> {
        let Some(file) = root_config.presence else {
            return Ok(());
        };

        if let Some(client_id) = file.client_id {
            self.client_id = Some(client_id);
        }
        if let Some(name) = file.endpoint_name {
            self.endpoint_name = name;
        }
        if let Some(path) = file.endpoint_path {
            self.endpoint_path = Some(path);
        }
        if let Some(name) = file.application_name {
            self.application_name = name;
        }
        if let Some(state) = file.fallback_state {
            self.fallback_state = state;
        }
        if let Some(secret) = file.match_secret {
            self.match_secret = secret;
        }
        if let Some(value) = file.reconnect_interval {
            self.reconnect_interval = parse_interval("reconnect_interval", &value)?;
        }
        if let Some(value) = file.update_interval {
            self.update_interval = parse_interval("update_interval", &value)?;
        }
        if let Some(value) = file.connect_timeout {
            self.connect_timeout = parse_interval("connect_timeout", &value)?;
        }

        Ok(())
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(client_id) = lookup("PRESENCE_CLIENT_ID") {
            self.client_id = Some(client_id);
            info!("Client id overridden by environment");
        }

        if let Some(path) = lookup("PRESENCE_ENDPOINT") {
            info!("Endpoint overridden by environment: {}", path);
            self.endpoint_path = Some(path);
        }

        if let Some(name) = lookup("PRESENCE_APP_NAME") {
            info!("Application name overridden by environment: {}", name);
            self.application_name = name;
        }

        if let Some(secret) = lookup("PRESENCE_MATCH_SECRET") {
            info!("Match secret overridden by environment");
            self.match_secret = secret;
        }

        if let Some(value) = lookup("PRESENCE_RECONNECT_SECS") {
            self.reconnect_interval = parse_secs("PRESENCE_RECONNECT_SECS", &value)?;
            info!("Reconnect interval overridden by environment: {}s", value);
        }

        if let Some(value) = lookup("PRESENCE_UPDATE_SECS") {
            self.update_interval = parse_secs("PRESENCE_UPDATE_SECS", &value)?;
            info!("Update interval overridden by environment: {}s", value);
        }

        Ok(())
    }

    /// Check values that every layer may have set. Run after the last override.
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("reconnect_interval", self.reconnect_interval),
            ("update_interval", self.update_interval),
            ("connect_timeout", self.connect_timeout),
        ];
        for (key, value) in intervals {
            anyhow::ensure!(!value.is_zero(), "presence.{} must be greater than zero", key);
        }
        Ok(())
    }

    /// Where to find the peer
    pub fn endpoint(&self) -> Endpoint {
        match &self.endpoint_path {
            Some(path) => Endpoint::at(path),
            None => Endpoint::discover(&self.endpoint_name),
        }
    }

    /// Session configuration derived from this config
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            reconnect_interval: self.reconnect_interval,
            update_interval: self.update_interval,
            connect_timeout: self.connect_timeout,
            labels: ActivityLabels {
                application_name: self.application_name.clone(),
                fallback_state: self.fallback_state.clone(),
                match_secret: self.match_secret.clone(),
            },
        }
    }
}

fn parse_interval(key: &str, value: &str) -> Result<Duration> {
    let duration = humantime::parse_duration(value)
        .with_context(|| format!("invalid duration for presence.{}: {}", key, value))?;
    anyhow::ensure!(!duration.is_zero(), "presence.{} must be greater than zero", key);
    Ok(duration)
}

fn parse_secs(var: &str, value: &str) -> Result<Duration> {
    let secs: u64 = value
        .parse()
        .with_context(|| format!("{} is not a number: {}", var, value))?;
    anyhow::ensure!(secs > 0, "{} must be greater than zero", var);
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = PresenceConfig::default();
        assert_eq!(config.client_id, None);
        assert_eq!(config.endpoint_name, "discord-ipc-0");
        assert_eq!(config.reconnect_interval, Duration::from_secs(15));
        assert_eq!(config.update_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_file_config() {
        let yaml_content = r#"
presence:
  client_id: "383226320970055681"
  endpoint_path: /run/user/1000/discord-ipc-0
  application_name: Scribe
  match_secret: scribe-session
  reconnect_interval: 30s
  update_interval: 1m
"#;

        let mut config = PresenceConfig::default();
        config
            .apply_root_config(serde_yaml::from_str(yaml_content).unwrap())
            .unwrap();

        assert_eq!(config.client_id.as_deref(), Some("383226320970055681"));
        assert_eq!(config.application_name, "Scribe");
        assert_eq!(config.reconnect_interval, Duration::from_secs(30));
        assert_eq!(config.update_interval, Duration::from_secs(60));
        assert_eq!(
            config.endpoint().path(),
            Path::new("/run/user/1000/discord-ipc-0")
        );

        let session = config.session_config();
        assert_eq!(session.labels.application_name, "Scribe");
        assert_eq!(session.labels.match_secret, "scribe-session");
        assert_eq!(session.reconnect_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_interval_rejected() {
        let yaml_content = "presence:\n  update_interval: 0s\n";
        let mut config = PresenceConfig::default();
        assert!(config
            .apply_root_config(serde_yaml::from_str(yaml_content).unwrap())
            .is_err());

        let yaml_content = "presence:\n  update_interval: soon\n";
        assert!(config
            .apply_root_config(serde_yaml::from_str(yaml_content).unwrap())
            .is_err());
    }

    #[test]
    fn test_environment_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PRESENCE_CLIENT_ID", "42"),
            ("PRESENCE_RECONNECT_SECS", "5"),
            ("PRESENCE_APP_NAME", "Notes"),
        ]
        .into_iter()
        .collect();

        let mut config = PresenceConfig::default();
        config
            .apply_environment_overrides(|var| vars.get(var).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.client_id.as_deref(), Some("42"));
        assert_eq!(config.reconnect_interval, Duration::from_secs(5));
        assert_eq!(config.application_name, "Notes");
        assert_eq!(config.update_interval, Duration::from_secs(15));

        let bad: HashMap<&str, &str> = [("PRESENCE_UPDATE_SECS", "often")].into_iter().collect();
        assert!(config
            .apply_environment_overrides(|var| bad.get(var).map(|v| v.to_string()))
            .is_err());
    }

    #[test]
    fn test_zero_environment_interval_rejected() {
        for var in ["PRESENCE_RECONNECT_SECS", "PRESENCE_UPDATE_SECS"] {
            let mut config = PresenceConfig::default();
            let err = config
                .apply_environment_overrides(|name| (name == var).then(|| "0".to_string()))
                .unwrap_err();
            assert!(err.to_string().contains("greater than zero"), "{}", err);
        }
    }

    #[test]
    fn test_environment_match_secret() {
        let mut config = PresenceConfig::default();
        config
            .apply_environment_overrides(|var| {
                (var == "PRESENCE_MATCH_SECRET").then(|| "lobby-7".to_string())
            })
            .unwrap();
        assert_eq!(config.session_config().labels.match_secret, "lobby-7");
        assert_eq!(
            PresenceConfig::default().session_config().labels.match_secret,
            ActivityLabels::default().match_secret
        );
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        assert!(PresenceConfig::default().validate().is_ok());

        let config = PresenceConfig {
            update_interval: Duration::ZERO,
            ..PresenceConfig::default()
        };
        assert!(config.validate().is_err());

        let config = PresenceConfig {
            connect_timeout: Duration::ZERO,
            ..PresenceConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_and_reread_client_id() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(b"presence:\n  client_id: \"1001\"\n  application_name: Scribe\n")
            .unwrap();

        let config = PresenceConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.application_name, "Scribe");
        assert_eq!(
            PresenceConfig::read_client_id(temp_file.path()).as_deref(),
            Some("1001")
        );
    }

    #[test]
    fn test_reread_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(PresenceConfig::read_client_id(dir.path().join("absent.yaml")), None);
    }
}
