//! Key-value access to the node repository's configuration.
//!
//! The node's `config` command reads and writes dotted keys
//! (`Routing.Type`, `Swarm.Transports.Network.Websocket`, ...). Writes only
//! take effect on the next daemon start and need the repository unlocked.

use crate::error::{BridgeError, Result};
use crate::node_api::DEFAULT_API_PORT;
use futures::future::BoxFuture;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

pub trait ConfigStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Value>>;
    fn set<'a>(&'a self, key: &'a str, value: Value) -> BoxFuture<'a, Result<()>>;
}

/// Drives `<binary> config` against a repository.
#[derive(Debug, Clone)]
pub struct CliConfigStore {
    binary: PathBuf,
    repo_path: PathBuf,
}

impl CliConfigStore {
    pub fn new(binary: impl Into<PathBuf>, repo_path: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            repo_path: repo_path.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.binary)
            .env("IPFS_PATH", &self.repo_path)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                BridgeError::ConfigError(format!("failed to run {}: {}", self.binary.display(), e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BridgeError::ConfigError(format!(
                "`config {}` exited with {}: {}",
                args.get(1).copied().unwrap_or_default(),
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl ConfigStore for CliConfigStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let stdout = self.run(&["config", key]).await?;
            let trimmed = stdout.trim();
            // Scalars come back bare, objects and arrays as JSON
            Ok(serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string())))
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: Value) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let encoded = value.to_string();
            debug!(key, value = %encoded, "Setting node config");
            self.run(&["config", "--json", key, &encoded]).await?;
            Ok(())
        })
    }
}

/// Extract the TCP port from a multiaddr such as `/ip4/127.0.0.1/tcp/5001`.
pub fn port_from_multiaddr(addr: &str) -> Option<u16> {
    let mut parts = addr.split('/').skip_while(|p| *p != "tcp");
    parts.next()?;
    parts.next()?.parse().ok()
}

/// Find the API port the node will listen on, from `Addresses.API`.
/// Falls back to 5001 when the key is missing or unreadable.
pub async fn discover_api_port(store: &dyn ConfigStore) -> u16 {
    match store.get("Addresses.API").await {
        Ok(Value::String(addr)) => port_from_multiaddr(&addr).unwrap_or(DEFAULT_API_PORT),
        Ok(Value::Array(addrs)) => addrs
            .iter()
            .filter_map(Value::as_str)
            .find_map(port_from_multiaddr)
            .unwrap_or(DEFAULT_API_PORT),
        Ok(_) => DEFAULT_API_PORT,
        Err(e) => {
            debug!("Could not read Addresses.API, using default port: {}", e);
            DEFAULT_API_PORT
        }
    }
}

/// Whether the repository has been initialised (`<repo>/config` exists).
pub fn repo_initialized(repo_path: &Path) -> bool {
    repo_path.join("config").is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FixedStore(Mutex<HashMap<String, Value>>);

    impl ConfigStore for FixedStore {
        fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Value>> {
            Box::pin(async move {
                self.0
                    .lock()
                    .unwrap()
                    .get(key)
                    .cloned()
                    .ok_or_else(|| BridgeError::ConfigError(format!("no key {}", key)))
            })
        }

        fn set<'a>(&'a self, key: &'a str, value: Value) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                self.0.lock().unwrap().insert(key.to_string(), value);
                Ok(())
            })
        }
    }

    #[test]
    fn test_port_from_multiaddr() {
        assert_eq!(port_from_multiaddr("/ip4/127.0.0.1/tcp/5001"), Some(5001));
        assert_eq!(port_from_multiaddr("/ip6/::1/tcp/45005/http"), Some(45005));
        assert_eq!(port_from_multiaddr("/ip4/127.0.0.1/udp/4001/quic-v1"), None);
        assert_eq!(port_from_multiaddr("garbage"), None);
    }

    #[tokio::test]
    async fn test_discover_api_port() {
        let store = FixedStore(Mutex::new(HashMap::new()));
        assert_eq!(discover_api_port(&store).await, DEFAULT_API_PORT);

        store
            .set("Addresses.API", Value::String("/ip4/127.0.0.1/tcp/5101".into()))
            .await
            .unwrap();
        assert_eq!(discover_api_port(&store).await, 5101);

        store
            .set("Addresses.API", serde_json::json!(["/ip4/127.0.0.1/tcp/5202"]))
            .await
            .unwrap();
        assert_eq!(discover_api_port(&store).await, 5202);
    }

    #[tokio::test]
    async fn test_cli_store_reports_missing_binary() {
        let store = CliConfigStore::new("/nonexistent/ipfs-binary", "/tmp/none");
        let err = store.set("Pubsub.Enabled", Value::Bool(true)).await.unwrap_err();
        assert!(matches!(err, BridgeError::ConfigError(_)));
    }
}
