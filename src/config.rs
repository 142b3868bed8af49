//! Agent configuration
//!
//! Defaults merged with an optional TOML file and `TOPOGRAPH_`-prefixed
//! environment variables.

use anyhow::Result;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// TCP port the websocket endpoint listens on.
    pub listen: u16,
    /// Ordered set of topology probes to start.
    pub probes: Vec<String>,
    /// Pong deadline in seconds; pings are sent at half this interval.
    pub ws_pong_timeout: u64,
    /// Port of the local OVSDB management socket.
    pub ovsdb_port: u16,
    /// Graph backend selector: memory, gremlin-ws or gremlin-rest.
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_url: Option<String>,
    /// Directories scanned for network-namespace bind mounts.
    pub netns_paths: Vec<String>,
    /// Hostname override for the root node; defaults to the system hostname.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: 8081,
            probes: vec![
                "netlink".to_string(),
                "netns".to_string(),
                "ovsdb".to_string(),
                "docker".to_string(),
            ],
            ws_pong_timeout: 5,
            ovsdb_port: 6640,
            backend: "memory".to_string(),
            backend_url: None,
            netns_paths: vec![
                "/run/netns".to_string(),
                "/run/docker/netns".to_string(),
            ],
            host: None,
        }
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        figment = match path {
            Some(p) => figment.merge(Toml::file(p)),
            None => figment.merge(Toml::file("topograph.toml")),
        };
        let config: Config = figment
            .merge(Env::prefixed("TOPOGRAPH_"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
        Ok(config)
    }

    /// Hostname stamped on published nodes and edges.
    pub fn hostname(&self) -> String {
        match &self.host {
            Some(h) => h.clone(),
            None => hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
        }
    }
}
