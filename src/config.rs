use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::{PeerAddress, PeerId};
use crate::error::ChatError;

pub const DEFAULT_CONFIG_PATH: &str = "config/chat.json";
pub const DEFAULT_DATABASE_PATH: &str = "data/chat.db";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// TCP address for peer connections.
    pub listen_addr: String,
    pub database_path: String,
    pub discovery_enabled: bool,
    /// UDP port used for presence announcements.
    pub discovery_port: u16,
    pub announce_interval_secs: u64,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub max_frame_size: usize,
    pub event_queue_capacity: usize,
    pub history_limit: usize,
    /// Peers reachable without discovery, as `peer_id@host:port`.
    pub known_peers: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:5001".to_string(),
            database_path: DEFAULT_DATABASE_PATH.to_string(),
            discovery_enabled: true,
            discovery_port: 5000,
            announce_interval_secs: 60,
            connect_timeout_ms: 5000,
            handshake_timeout_ms: 5000,
            max_frame_size: 1024 * 1024,
            event_queue_capacity: 256,
            history_limit: 50,
            known_peers: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ChatError> {
        let err = |msg: &str| Err(ChatError::Config(msg.into()));

        if self.connect_timeout_ms == 0 {
            return err("connect_timeout_ms must be > 0");
        }
        if self.handshake_timeout_ms == 0 {
            return err("handshake_timeout_ms must be > 0");
        }
        if self.max_frame_size == 0 {
            return err("max_frame_size must be > 0");
        }
        if self.event_queue_capacity == 0 {
            return err("event_queue_capacity must be > 0");
        }
        if self.discovery_enabled && self.announce_interval_secs == 0 {
            return err("announce_interval_secs must be > 0 when discovery is enabled");
        }

        Ok(())
    }

    pub fn network(&self) -> NetworkConfig {
        NetworkConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            max_frame_size: self.max_frame_size,
            event_queue_capacity: self.event_queue_capacity,
        }
    }
}

/// Settings the connection manager needs.
#[derive(Debug, Clone, Copy)]
pub struct NetworkConfig {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub max_frame_size: usize,
    pub event_queue_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        AppConfig::default().network()
    }
}

/// Reads the JSON config at `path`. Any problem with the file yields the
/// defaults; a missing file is the normal first-run case.
pub fn load_config(path: impl AsRef<Path>) -> AppConfig {
    let path = path.as_ref();
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            log::info!("No config at {}, starting with defaults", path.display());
            return AppConfig::default();
        }
        Err(err) => {
            log::warn!("Cannot read config {}: {err}; using defaults", path.display());
            return AppConfig::default();
        }
    };

    serde_json::from_str(&content).unwrap_or_else(|err| {
        log::warn!("Config {} is not valid JSON ({err}); using defaults", path.display());
        AppConfig::default()
    })
}

/// Writes `config` as pretty JSON, creating parent directories. Refuses to
/// write values that [`AppConfig::validate`] rejects.
pub fn save_config(path: impl AsRef<Path>, config: &AppConfig) -> Result<(), ChatError> {
    let path = path.as_ref();
    config.validate()?;

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)
        .map_err(|err| ChatError::Config(format!("cannot serialize config: {err}")))?;
    fs::write(path, json)?;

    log::info!("Saved config to {}", path.display());
    Ok(())
}

/// Parses `peer_id@host:port` entries, skipping (and logging) malformed ones.
pub fn parse_known_peers(entries: &[String]) -> Vec<(PeerId, PeerAddress)> {
    entries
        .iter()
        .filter_map(|entry| {
            let Some((peer_id, address)) = entry.split_once('@') else {
                log::warn!("Known peer `{entry}` missing peer_id@ prefix");
                return None;
            };
            if peer_id.trim().is_empty() {
                log::warn!("Known peer `{entry}` has an empty peer id");
                return None;
            }

            match address.parse::<PeerAddress>() {
                Ok(address) => Some((PeerId::from(peer_id.trim()), address)),
                Err(err) => {
                    log::warn!("Invalid known peer `{entry}`: {err}");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn validation_rejects_zero_values() {
        let mut config = AppConfig::default();

        config.connect_timeout_ms = 0;
        assert!(config.validate().is_err());
        config.connect_timeout_ms = 5000;

        config.max_frame_size = 0;
        assert!(config.validate().is_err());
        config.max_frame_size = 1024;

        config.announce_interval_secs = 0;
        assert!(config.validate().is_err());
        config.discovery_enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{ "listen_addr": "127.0.0.1:7000" }"#).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:7000");
        assert_eq!(config.discovery_port, 5000);
        assert_eq!(config.history_limit, 50);
    }

    #[test]
    fn save_then_load_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/chat.json");

        let mut config = AppConfig::default();
        config.known_peers = vec!["bob@10.0.0.2:5001".into()];
        save_config(&path, &config).unwrap();

        let loaded = load_config(&path);
        assert_eq!(loaded.known_peers, config.known_peers);
    }

    #[test]
    fn missing_config_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(dir.path().join("absent.json"));
        assert_eq!(config.listen_addr, AppConfig::default().listen_addr);
        assert!(config.known_peers.is_empty());
    }

    #[test]
    fn invalid_config_is_not_saved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.json");
        let config = AppConfig {
            max_frame_size: 0,
            ..AppConfig::default()
        };

        assert!(matches!(save_config(&path, &config), Err(ChatError::Config(_))));
        assert!(!path.exists());
    }

    #[test]
    fn unreadable_config_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();

        let config = load_config(&path);
        assert_eq!(config.listen_addr, AppConfig::default().listen_addr);
    }

    #[test]
    fn known_peers_skip_malformed_entries() {
        let entries = vec![
            "bob@10.0.0.2:5001".to_string(),
            "10.0.0.3:5001".to_string(),
            "carol@nowhere".to_string(),
            "@10.0.0.4:5001".to_string(),
        ];
        let peers = parse_known_peers(&entries);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].0.as_str(), "bob");
        assert_eq!(peers[0].1, PeerAddress::new("10.0.0.2", 5001));
    }
}
