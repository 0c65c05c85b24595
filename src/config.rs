//! Configuration loading for the A2A relay.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::Error;
pub type Result<T> = std::result::Result<T, Error>;

pub const ENV_RELAY_URL: &str = "A2A_RELAY_URL";
pub const ENV_AGENT_ID: &str = "A2A_AGENT_ID";
pub const ENV_AGENT_NAME: &str = "A2A_AGENT_NAME";
pub const ENV_TASK_DB: &str = "A2A_TASK_DB";
pub const ENV_PORT: &str = "A2A_PORT";

/// Get the relay home directory (~/.a2a-relay).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".a2a-relay"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Load settings from ~/.a2a-relay/settings.json, then apply environment overrides.
pub fn load_settings() -> Result<Settings> {
    let path = get_settings_path()?;
    let mut settings = load_settings_from(&path)?;
    settings.apply_env(|key| std::env::var(key).ok());
    validate_settings(&settings)?;
    Ok(settings)
}

/// Load settings from an explicit path. A missing file yields defaults.
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    if !path.exists() {
        tracing::debug!("No settings file at {}, using defaults", path.display());
        return Ok(Settings::default());
    }

    let content = std::fs::read_to_string(path)?;
    let settings: Settings = serde_json::from_str(&content)?;
    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.relay.reconnect_delay_ms == 0 {
        return Err(Error::Config(
            "relay.reconnect_delay_ms must be greater than zero".to_string(),
        ));
    }
    if settings.tasks.default_timeout_hours <= 0.0 {
        return Err(Error::Config(
            "tasks.default_timeout_hours must be positive".to_string(),
        ));
    }
    Ok(())
}

/// Relay connection and server configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RelayConfig {
    #[serde(default = "default_relay_url")]
    pub url: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

fn default_relay_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: default_relay_url(),
            host: default_host(),
            port: default_port(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

/// Identity of the local agent.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct AgentIdentity {
    pub id: Option<String>,
    pub name: Option<String>,
}

/// Task store configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct StoreConfig {
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    /// Resolve the SQLite file path, defaulting to ~/.a2a-relay/tasks.db.
    pub fn resolve_path(&self) -> Result<PathBuf> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None => Ok(get_home_dir()?.join("tasks.db")),
        }
    }
}

/// Task protocol defaults.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TaskDefaults {
    #[serde(default = "default_timeout_hours")]
    pub default_timeout_hours: f64,
    #[serde(default = "default_completed_window_hours")]
    pub completed_window_hours: f64,
    #[serde(default = "default_list_limit")]
    pub list_limit: usize,
}

fn default_timeout_hours() -> f64 {
    2.0
}

fn default_completed_window_hours() -> f64 {
    24.0
}

fn default_list_limit() -> usize {
    50
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            default_timeout_hours: default_timeout_hours(),
            completed_window_hours: default_completed_window_hours(),
            list_limit: default_list_limit(),
        }
    }
}

/// Known agent entry.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct AgentConfig {
    pub name: Option<String>,
}

/// Relay settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub agent: AgentIdentity,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub tasks: TaskDefaults,

    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,
}

impl Settings {
    /// Apply environment overrides through a lookup function.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_RELAY_URL) {
            self.relay.url = url;
        }
        if let Some(id) = lookup(ENV_AGENT_ID) {
            self.agent.id = Some(id);
        }
        if let Some(name) = lookup(ENV_AGENT_NAME) {
            self.agent.name = Some(name);
        }
        if let Some(path) = lookup(ENV_TASK_DB) {
            self.store.path = Some(PathBuf::from(path));
        }
        if let Some(port) = lookup(ENV_PORT) {
            match port.parse() {
                Ok(port) => self.relay.port = port,
                Err(_) => tracing::warn!("Ignoring invalid {}: {}", ENV_PORT, port),
            }
        }
    }

    /// Known agents as (id, display name) pairs.
    pub fn known_agents(&self) -> Vec<(String, String)> {
        self.agents
            .iter()
            .map(|(id, agent)| {
                let name = agent.name.clone().unwrap_or_else(|| id.clone());
                (id.clone(), name)
            })
            .collect()
    }
}
