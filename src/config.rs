use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::node_api::DEFAULT_API_HOST;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub ipfs_binary: PathBuf,
    pub repo_path: PathBuf,
    pub api_host: String,
    /// Explicit API port. When unset the port is read from the repository.
    pub api_port: Option<u16>,
    pub swarm_key_registry: PathBuf,
    pub readiness_timeout_secs: u64,
    /// Topics the runner subscribes to at startup.
    pub topics: Vec<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let ipfs_binary = env::var("IPFS_BINARY")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("ipfs"));

        let repo_path = match env::var("IPFS_PATH") {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => env::var("HOME")
                .map(|home| PathBuf::from(home).join(".ipfs"))
                .unwrap_or_else(|_| PathBuf::from(".ipfs")),
        };

        let api_host = env::var("IPFS_API_HOST").unwrap_or_else(|_| DEFAULT_API_HOST.to_string());

        let api_port = match env::var("IPFS_API_PORT") {
            Ok(port) => Some(
                port.parse::<u16>()
                    .map_err(|e| anyhow::anyhow!("Invalid IPFS_API_PORT '{}': {}", port, e))?,
            ),
            Err(_) => None,
        };

        let swarm_key_registry = env::var("SWARM_KEY_REGISTRY")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/swarm-keys.json"));

        let readiness_timeout_secs = env::var("DAEMON_READY_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .unwrap_or(30);

        // Comma separated, e.g. "notebook/cells,notebook/presence"
        let topics = env::var("PUBSUB_TOPICS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        Ok(Self {
            ipfs_binary,
            repo_path,
            api_host,
            api_port,
            swarm_key_registry,
            readiness_timeout_secs,
            topics,
        })
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }
}
