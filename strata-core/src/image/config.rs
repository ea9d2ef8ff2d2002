//! OCI/Docker image configuration model.
//!
//! Field names and presence rules follow the image-spec config JSON so that
//! configs pulled from a registry survive a parse/serialize round trip.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The serialized form of `{}` in `ExposedPorts` / `Volumes` maps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Empty {}

/// Top-level image configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub architecture: String,

    #[serde(default)]
    pub os: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,

    #[serde(default)]
    pub config: RunConfig,

    #[serde(default)]
    pub rootfs: RootFs,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,
}

/// The `config` object: how a container built from the image runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(rename = "Env", default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    #[serde(rename = "Cmd", default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,

    #[serde(rename = "Entrypoint", default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,

    #[serde(rename = "WorkingDir", default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,

    #[serde(rename = "User", default, skip_serializing_if = "String::is_empty")]
    pub user: String,

    #[serde(rename = "Labels", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(rename = "ExposedPorts", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exposed_ports: BTreeMap<String, Empty>,

    #[serde(rename = "Volumes", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, Empty>,

    #[serde(rename = "OnBuild", default, skip_serializing_if = "Vec::is_empty")]
    pub on_build: Vec<String>,

    #[serde(rename = "StopSignal", default, skip_serializing_if = "String::is_empty")]
    pub stop_signal: String,

    #[serde(rename = "Shell", default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<Vec<String>>,

    #[serde(rename = "Healthcheck", default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthConfig>,
}

impl RunConfig {
    /// Sets `key` in `Env`, replacing an existing entry.
    pub fn set_env(&mut self, key: &str, value: &str) {
        let entry = format!("{key}={value}");
        for existing in &mut self.env {
            if existing.split('=').next() == Some(key) {
                *existing = entry;
                return;
            }
        }
        self.env.push(entry);
    }

    pub fn get_env(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            entry
                .split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }
}

/// HEALTHCHECK settings; durations are nanoseconds, per the Docker config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(rename = "Test", default, skip_serializing_if = "Vec::is_empty")]
    pub test: Vec<String>,

    #[serde(rename = "Interval", default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<i64>,

    #[serde(rename = "Timeout", default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,

    #[serde(rename = "StartPeriod", default, skip_serializing_if = "Option::is_none")]
    pub start_period: Option<i64>,

    #[serde(rename = "Retries", default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

/// The layer DiffID chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,

    #[serde(default)]
    pub diff_ids: Vec<String>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self { fs_type: "layers".to_string(), diff_ids: Vec::new() }
    }
}

/// One history entry per instruction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_by: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

/// The zero timestamp used by reproducible builds.
pub fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(0, 0).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_docker_field_names() {
        let json = r#"{
            "architecture": "amd64",
            "os": "linux",
            "config": {
                "Env": ["PATH=/bin"],
                "Cmd": ["sh"],
                "WorkingDir": "/app",
                "Labels": {"a": "b"},
                "ExposedPorts": {"80/tcp": {}}
            },
            "rootfs": {"type": "layers", "diff_ids": ["sha256:abc"]}
        }"#;
        let config: ConfigFile = serde_json::from_str(json).unwrap();
        assert_eq!(config.config.env, vec!["PATH=/bin"]);
        assert_eq!(config.config.working_dir, "/app");
        assert!(config.config.exposed_ports.contains_key("80/tcp"));

        let out = serde_json::to_string(&config).unwrap();
        assert!(out.contains("\"Env\""));
        assert!(out.contains("\"ExposedPorts\""));
        assert!(out.contains("\"type\":\"layers\""));
        // Absent fields stay absent.
        assert!(!out.contains("OnBuild"));
        assert!(!out.contains("StopSignal"));
    }

    #[test]
    fn test_set_env_replaces() {
        let mut config = RunConfig::default();
        config.set_env("A", "1");
        config.set_env("B", "2");
        config.set_env("A", "3");
        assert_eq!(config.env, vec!["A=3", "B=2"]);
        assert_eq!(config.get_env("A"), Some("3"));
        assert_eq!(config.get_env("C"), None);
    }

    #[test]
    fn test_empty_layer_history_serialization() {
        let history = History {
            created_by: "ENV A=1".to_string(),
            empty_layer: true,
            ..Default::default()
        };
        let json = serde_json::to_string(&history).unwrap();
        assert!(json.contains("\"empty_layer\":true"));

        let history = History { created_by: "RUN x".to_string(), ..Default::default() };
        let json = serde_json::to_string(&history).unwrap();
        assert!(!json.contains("empty_layer"));
    }
}
