//! Server list configuration

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, bail, ensure};
use serde::Deserialize;

use crate::util::endpoint_url;

// ------------------------------------------------------------
// Root configuration
// ------------------------------------------------------------
//
// Top-level structure loaded from `config.json`.
//
// It defines:
// - The application name used in startup logs
// - The game servers to monitor
// - Export and debug settings
//
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub application: ApplicationConfig,

    /// Monitored game servers, in start order
    pub game_servers: Vec<GameServerConfig>,

    #[serde(default)]
    pub export: ExportConfig,

    /// Optional debug configuration
    pub debug: Option<DebugConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApplicationConfig {
    pub name: String,
}

// ------------------------------------------------------------
// Game server configuration
// ------------------------------------------------------------
//
// One entry per game server process.
//
// IMPORTANT:
// - `short_name` is the join key of every measurement and must be
//   unique across servers.
//
#[derive(Debug, Deserialize, Clone)]
pub struct GameServerConfig {
    pub name: String,

    pub short_name: String,

    pub rpc: RpcConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RpcConfig {
    pub host: String,

    pub port: u16,

    /// Connect with `wss://` instead of `ws://`
    #[serde(default)]
    pub tls: bool,
}

impl RpcConfig {
    pub fn url(&self) -> String {
        endpoint_url(&self.host, self.port, self.tls)
    }
}

// ------------------------------------------------------------
// Export configuration
// ------------------------------------------------------------
//
// Controls the console exporter.
//
#[derive(Debug, Deserialize, Clone)]
pub struct ExportConfig {
    /// Seconds between two export ticks
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Log every series on each tick
    #[serde(default = "default_console")]
    pub console: bool,
}

fn default_interval_secs() -> u64 {
    10
}

fn default_console() -> bool {
    true
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            console: default_console(),
        }
    }
}

// ------------------------------------------------------------
// Debug configuration
// ------------------------------------------------------------
//
// Optional debug flags used during development and testing.
//
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DebugConfig {
    /// Logs every raw RPC frame at debug level
    pub log_frames: Option<bool>,
}

impl Config {
    /// Reads and validates the configuration at `path`.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Config> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_json(&data).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_json(data: &str) -> anyhow::Result<Config> {
        let config: Config = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks everything serde cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(!self.application.name.trim().is_empty(), "application.name must not be empty");
        ensure!(!self.game_servers.is_empty(), "at least one game server is required");
        ensure!(self.export.interval_secs > 0, "export.interval_secs must be greater than 0");

        let mut short_names = HashSet::new();
        for (i, server) in self.game_servers.iter().enumerate() {
            ensure!(!server.name.trim().is_empty(), "game_servers[{i}].name must not be empty");
            ensure!(
                !server.short_name.trim().is_empty(),
                "game_servers[{i}].short_name must not be empty"
            );
            ensure!(!server.rpc.host.trim().is_empty(), "game_servers[{i}].rpc.host must not be empty");
            ensure!(server.rpc.port != 0, "game_servers[{i}].rpc.port must not be 0");

            if !short_names.insert(server.short_name.as_str()) {
                bail!("duplicate game server short_name '{}'", server.short_name);
            }
        }

        Ok(())
    }

    pub fn log_frames(&self) -> bool {
        self.debug.as_ref().and_then(|d| d.log_frames).unwrap_or(false)
    }
}
