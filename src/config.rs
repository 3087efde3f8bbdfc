//! Configuration loading (spec §6, SPEC_FULL §10).
//!
//! The client reads a JSON blob appended to its own executable between two
//! literal markers; the relay reads a JSON file from disk. Both are plain
//! `serde`-derived structs — the interesting part is finding the bytes.

use std::env;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

const CONFIG_START: &[u8] = b"[CONFIG_START]";
const CONFIG_END: &[u8] = b"[CONFIG_END]";
const SCAN_WINDOW: usize = 8 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub game_server_ip: String,
    pub tunnel_server_ip: String,
    pub tunnel_port: u16,
    #[serde(default)]
    pub version_name: Option<String>,
    #[serde(default)]
    pub config_api_url: Option<String>,
    #[serde(default)]
    pub config_api_port: Option<u16>,
}

/// Scans the last [`SCAN_WINDOW`] bytes of the running executable for a JSON
/// object between `[CONFIG_START]` and `[CONFIG_END]` and parses it.
pub fn load_embedded_client_config() -> Result<ClientConfig, ConfigError> {
    let exe_path = env::current_exe().map_err(|e| ConfigError::Io {
        path: "<current exe>".to_string(),
        source: e,
    })?;
    let bytes = fs::read(&exe_path).map_err(|e| ConfigError::Io {
        path: exe_path.display().to_string(),
        source: e,
    })?;
    let tail_start = bytes.len().saturating_sub(SCAN_WINDOW);
    let tail = &bytes[tail_start..];
    parse_embedded_config(tail)
}

fn parse_embedded_config(tail: &[u8]) -> Result<ClientConfig, ConfigError> {
    let start = find_subslice(tail, CONFIG_START).ok_or(ConfigError::MarkersNotFound(tail.len()))?;
    let json_start = start + CONFIG_START.len();
    let end = find_subslice(&tail[json_start..], CONFIG_END)
        .ok_or(ConfigError::MarkersNotFound(tail.len()))?;
    let json_bytes = &tail[json_start..json_start + end];
    let json_str = std::str::from_utf8(json_bytes).map_err(ConfigError::NotUtf8)?;
    let config: ClientConfig = serde_json::from_str(json_str)?;
    Ok(config)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayServerEntry {
    pub name: String,
    pub listen_port: u16,
    pub game_server_ip: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_max_connections() -> usize {
    1024
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ApiConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub tunnel_server_ip: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub servers: Vec<RelayServerEntry>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub api_config: ApiConfig,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

pub fn load_relay_config(path: &Path) -> Result<RelayConfig, ConfigError> {
    let text = fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let config: RelayConfig = serde_json::from_str(&text)?;
    if config.servers.is_empty() {
        return Err(ConfigError::MissingField("servers"));
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_embedded_config_between_markers() {
        let mut tail = b"garbage-before".to_vec();
        tail.extend_from_slice(CONFIG_START);
        tail.extend_from_slice(
            br#"{"game_server_ip":"1.2.3.4","tunnel_server_ip":"relay.example.com","tunnel_port":7777}"#,
        );
        tail.extend_from_slice(CONFIG_END);
        tail.extend_from_slice(b"trailer");

        let config = parse_embedded_config(&tail).unwrap();
        assert_eq!(config.game_server_ip, "1.2.3.4");
        assert_eq!(config.tunnel_server_ip, "relay.example.com");
        assert_eq!(config.tunnel_port, 7777);
        assert!(config.version_name.is_none());
    }

    #[test]
    fn missing_markers_is_an_error() {
        let tail = b"no markers here".to_vec();
        assert!(matches!(
            parse_embedded_config(&tail),
            Err(ConfigError::MarkersNotFound(_))
        ));
    }

    #[test]
    fn relay_config_parses_server_list_and_defaults() {
        let json = r#"{
            "servers": [
                {"name": "main", "listen_port": 9000, "game_server_ip": "5.6.7.8"}
            ]
        }"#;
        let config: RelayConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].max_connections, 1024);
        assert_eq!(config.log_level, "INFO");
        assert!(!config.api_config.enabled);
    }

    #[test]
    fn relay_config_rejects_empty_server_list() {
        let dir = std::env::temp_dir().join(format!(
            "dnf-relay-tunnel-test-{}",
            std::process::id()
        ));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("empty.json");
        fs::write(&path, r#"{"servers": []}"#).unwrap();
        assert!(matches!(
            load_relay_config(&path),
            Err(ConfigError::MissingField("servers"))
        ));
        let _ = fs::remove_file(&path);
    }
}
